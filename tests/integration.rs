use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use mq_rpc::{
    //
    Channel,
    ClientOptions,
    Connection,
    Delivery,
    Error,
    MemoryTransport,
    QueueOptions,
    RpcFault,
    SendOptions,
    ServerOptions,
};

#[derive(Debug, Serialize, Deserialize)]
struct JobRequest {
    a: Option<i64>,
    b: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct JobReply {
    a: i64,
}

/// Memory-backed broker plus a connection over it.
fn memory_connection() -> (Arc<MemoryTransport>, Connection) {
    // ---
    let transport = MemoryTransport::new();
    let connection = Connection::with_transport(transport.clone());
    (transport, connection)
}

/// The demo job: increment `a`, fail when `b` is missing.
async fn increment_server(connection: &Connection, queue: &str) -> mq_rpc::RpcServer {
    // ---
    let server = connection
        .create_rpc_server(
            queue,
            |req: JobRequest, _raw| async move {
                match req.b {
                    Some(_) => Ok(JobReply {
                        a: req.a.unwrap_or(0) + 1,
                    }),
                    None => Err(Error::Remote(RpcFault::new("B is not set"))),
                }
            },
            ServerOptions::default(),
        )
        .await
        .unwrap();
    server.ready().await;
    server
}

#[tokio::test]
async fn test_basic_request() {
    // ---
    let (_transport, connection) = memory_connection();
    let _server = increment_server(&connection, "jobs").await;

    let client = connection
        .create_rpc_client("jobs", ClientOptions::default())
        .await
        .unwrap();
    client.ready().await;

    // The reply is exactly the callback's return value, nothing more.
    let reply: Value = client.send_rpc(json!({"a": 1, "b": 2})).await.unwrap();
    assert_eq!(reply, json!({"a": 2}));
}

#[tokio::test]
async fn test_concurrent_requests() {
    // ---
    let (_transport, connection) = memory_connection();
    let _server = increment_server(&connection, "jobs").await;

    let client = connection
        .create_rpc_client("jobs", ClientOptions::default())
        .await
        .unwrap();
    client.ready().await;

    let mut handles = Vec::new();

    for i in 0..10i64 {
        // ---
        let c = client.clone();

        handles.push(tokio::spawn(async move {
            let reply: JobReply = c
                .send_rpc(JobRequest {
                    a: Some(i),
                    b: Some(0),
                })
                .await
                .unwrap();
            reply.a
        }));
    }

    for (i, task) in handles.into_iter().enumerate() {
        let a = task.await.unwrap();
        assert_eq!(a, i as i64 + 1);
    }

    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn test_application_error_reaches_caller() {
    // ---
    let (_transport, connection) = memory_connection();
    let _server = increment_server(&connection, "jobs").await;

    let client = connection
        .create_rpc_client("jobs", ClientOptions::default())
        .await
        .unwrap();
    client.ready().await;

    let result: mq_rpc::Result<Value> = client.send_rpc(json!({"a": 1})).await;

    match result {
        Err(Error::Remote(fault)) => {
            assert_eq!(fault.message, "B is not set");
            assert!(fault.stack.is_none(), "stack must be stripped by default");
        }
        other => panic!("expected remote error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_error_details_round_trip_and_stack_is_opt_in() {
    // ---
    let (_transport, connection) = memory_connection();

    let failing = |_req: Value, _raw: Delivery| async move {
        Err::<Value, _>(Error::Remote(
            RpcFault::new("boom")
                .with_detail("code", json!("EINVAL"))
                .with_stack("handler.rs:42"),
        ))
    };

    let plain = connection
        .create_rpc_server("plain", failing, ServerOptions::default())
        .await
        .unwrap();
    plain.ready().await;

    let verbose = connection
        .create_rpc_server(
            "verbose",
            failing,
            ServerOptions::default().with_send_error_stack(true),
        )
        .await
        .unwrap();
    verbose.ready().await;

    let client = connection
        .create_rpc_client("plain", ClientOptions::default())
        .await
        .unwrap();
    client.ready().await;

    match client.send_rpc::<_, Value>(json!({})).await {
        Err(Error::Remote(fault)) => {
            assert_eq!(fault.message, "boom");
            assert_eq!(fault.details.get("code"), Some(&json!("EINVAL")));
            assert!(fault.stack.is_none());
        }
        other => panic!("expected remote error, got {other:?}"),
    }

    let opts = SendOptions::default().with_routing_key("verbose");
    match client.send_rpc_with::<_, Value>(json!({}), opts).await {
        Err(Error::Remote(fault)) => {
            assert_eq!(fault.stack.as_deref(), Some("handler.rs:42"));
        }
        other => panic!("expected remote error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_send_before_ready_fails_without_publishing() {
    // ---
    let (transport, connection) = memory_connection();

    // Setup runs on a background task; on this single-threaded runtime it
    // has not run yet, so the client is still in its pre-setup state.
    let client = connection
        .create_rpc_client("jobs", ClientOptions::default())
        .await
        .unwrap();

    let result: mq_rpc::Result<Value> = client.send_rpc(json!({"a": 1})).await;
    assert!(matches!(result, Err(Error::ChannelNotReady)));
    assert_eq!(transport.publish_count(), 0, "nothing may be published");
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_ttl_expiry_and_late_reply_discard() {
    // ---
    let (transport, connection) = memory_connection();

    // No server consumes "void"; the call can only expire.
    let client = connection
        .create_rpc_client("void", ClientOptions::default().with_ttl_secs(1))
        .await
        .unwrap();
    client.ready().await;

    let result: mq_rpc::Result<Value> = client.send_rpc(json!({"a": 1})).await;
    assert!(matches!(result, Err(Error::TimeExpired)));
    assert_eq!(client.pending_calls(), 0);

    // Replay the reply that never came, now that the call has settled.
    let records = transport.publish_records();
    let request = &records[0];
    assert_eq!(request.routing_key, "void");
    let correlation_id = request.properties.correlation_id.clone().unwrap();
    let reply_to = request.properties.reply_to.clone().unwrap();

    let raw = transport.raw_channel();
    raw.publish(
        "",
        &reply_to,
        serde_json::to_vec(&json!({"msg": {"late": true}}))
            .unwrap()
            .into(),
        mq_rpc::MessageProperties {
            correlation_id: Some(correlation_id),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    // The late reply is silently discarded and settles nothing.
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_infinite_ttl_never_expires() {
    // ---
    let (_transport, connection) = memory_connection();

    // Client default TTL 0 and no per-call TTL: the call waits forever.
    let client = connection
        .create_rpc_client("void", ClientOptions::default())
        .await
        .unwrap();
    client.ready().await;

    let c = client.clone();
    let call = tokio::spawn(async move { c.send_rpc::<_, Value>(json!({"a": 1})).await });

    let outcome = tokio::time::timeout(Duration::from_secs(3600), call).await;
    assert!(outcome.is_err(), "no spurious timeout may fire");
    assert_eq!(client.pending_calls(), 1);
}

#[tokio::test]
async fn test_unmatched_reply_does_not_affect_pending_calls() {
    // ---
    let (transport, connection) = memory_connection();
    let _server = increment_server(&connection, "jobs").await;

    let client = connection
        .create_rpc_client("jobs", ClientOptions::default())
        .await
        .unwrap();
    client.ready().await;

    // A reply for a correlation id nobody is waiting on.
    let raw = transport.raw_channel();
    raw.publish(
        "",
        &client.reply_queue().unwrap(),
        serde_json::to_vec(&json!({"msg": "stray"})).unwrap().into(),
        mq_rpc::MessageProperties {
            correlation_id: Some("no-such-call".to_string()),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    // A real call afterwards is unaffected.
    let reply: Value = client.send_rpc(json!({"a": 4, "b": 1})).await.unwrap();
    assert_eq!(reply, json!({"a": 5}));
}

#[tokio::test]
async fn test_reconnect_restores_service() {
    // ---
    let (transport, connection) = memory_connection();
    let _server = increment_server(&connection, "jobs").await;

    let client = connection
        .create_rpc_client("jobs", ClientOptions::default())
        .await
        .unwrap();
    client.ready().await;

    let reply: Value = client.send_rpc(json!({"a": 1, "b": 2})).await.unwrap();
    assert_eq!(reply, json!({"a": 2}));

    transport.simulate_disconnect(Some("socket reset"));
    assert!(!client.is_ready());

    let result: mq_rpc::Result<Value> = client.send_rpc(json!({"a": 1, "b": 2})).await;
    assert!(matches!(result, Err(Error::ChannelNotReady)));

    transport.simulate_reconnect().await;
    client.ready().await;

    let reply: Value = client.send_rpc(json!({"a": 8, "b": 2})).await.unwrap();
    assert_eq!(reply, json!({"a": 9}));
}

#[tokio::test(start_paused = true)]
async fn test_pending_call_survives_disconnect() {
    // ---
    let (transport, connection) = memory_connection();

    // No server: the call stays pending across the disconnect.
    let client = connection
        .create_rpc_client("void", ClientOptions::default())
        .await
        .unwrap();
    client.ready().await;

    let c = client.clone();
    let call = tokio::spawn(async move { c.send_rpc::<_, Value>(json!({"x": 1})).await });
    tokio::time::sleep(Duration::from_millis(10)).await;

    let correlation_id = transport.publish_records()[0]
        .properties
        .correlation_id
        .clone()
        .unwrap();

    transport.simulate_disconnect(Some("broker restart"));
    assert_eq!(client.pending_calls(), 1, "disconnect must not fail the call");

    transport.simulate_reconnect().await;
    client.ready().await;

    // Deliver the reply to the freshly declared reply queue.
    let raw = transport.raw_channel();
    raw.publish(
        "",
        &client.reply_queue().unwrap(),
        serde_json::to_vec(&json!({"msg": {"ok": true}}))
            .unwrap()
            .into(),
        mq_rpc::MessageProperties {
            correlation_id: Some(correlation_id),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let reply = call.await.unwrap().unwrap();
    assert_eq!(reply, json!({"ok": true}));
}

#[tokio::test]
async fn test_custom_client_setup_supplies_reply_queue() {
    // ---
    let (_transport, connection) = memory_connection();
    let _server = increment_server(&connection, "jobs").await;

    let setup: mq_rpc::SetupFn = Arc::new(|channel| {
        Box::pin(async move {
            channel
                .assert_queue("stable-replies", QueueOptions::reply_queue())
                .await
        })
    });

    let client = connection
        .create_rpc_client("jobs", ClientOptions::default().with_setup(setup))
        .await
        .unwrap();
    client.ready().await;

    assert_eq!(client.reply_queue().as_deref(), Some("stable-replies"));

    let reply: Value = client.send_rpc(json!({"a": 1, "b": 2})).await.unwrap();
    assert_eq!(reply, json!({"a": 2}));
}

#[tokio::test]
async fn test_dropped_client_leaves_transport_usable() {
    // ---
    let (transport, connection) = memory_connection();

    let client = connection
        .create_rpc_client("jobs", ClientOptions::default())
        .await
        .unwrap();
    client.ready().await;
    drop(client);

    // The setup hook retained by the transport is inert once every handle is
    // gone; reconnect cycles and fresh peers are unaffected.
    transport.simulate_disconnect(Some("restart"));
    transport.simulate_reconnect().await;

    let _server = increment_server(&connection, "jobs").await;
    let fresh = connection
        .create_rpc_client("jobs", ClientOptions::default())
        .await
        .unwrap();
    fresh.ready().await;

    let reply: Value = fresh.send_rpc(json!({"a": 1, "b": 2})).await.unwrap();
    assert_eq!(reply, json!({"a": 2}));
}

#[tokio::test]
async fn test_requests_are_acked_even_when_the_handler_fails() {
    // ---
    let (transport, connection) = memory_connection();
    let _server = increment_server(&connection, "jobs").await;

    let client = connection
        .create_rpc_client("jobs", ClientOptions::default())
        .await
        .unwrap();
    client.ready().await;

    let _ok: Value = client.send_rpc(json!({"a": 1, "b": 2})).await.unwrap();
    let _err = client.send_rpc::<_, Value>(json!({"a": 1})).await;

    // Both requests were acknowledged, success and failure alike.
    assert_eq!(transport.ack_count(), 2);
}

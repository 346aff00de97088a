//! RPC client example.
//!
//! Sends a single request to the `RPC-test` queue and prints the reply.
//!
//! Run with: cargo run --example rpc_client
//!
//! Requires: RabbitMQ running on localhost:5672 and a running `rpc_server`
//! example.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::json;

use mq_rpc::{connect, ClientOptions, ConnectOptions, ConnectionEvent};

const QUEUE_NAME: &str = "RPC-test";

#[derive(Debug, Serialize, Deserialize)]
struct JobReply {
    a: Option<i64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let broker_uri =
        std::env::var("BROKER_URI").unwrap_or_else(|_| "amqp://localhost:5672".to_string());

    let connection = connect(
        &[broker_uri],
        ConnectOptions::default().with_connection_name("rpc-client-example"),
    )
    .await?;

    // Log the link as it comes and goes.
    let mut events = connection.events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ConnectionEvent::Connected => println!("Connected!"),
                ConnectionEvent::Disconnected { error } => {
                    println!("Disconnected. {}", error.as_deref().unwrap_or(""));
                }
            }
        }
    });

    // ---
    // Requests expire after 60 seconds without a reply.
    let client = connection
        .create_rpc_client(QUEUE_NAME, ClientOptions::default().with_ttl_secs(60))
        .await?;

    client.ready().await;
    println!("Connected to RPC channel");

    match client.send_rpc::<_, JobReply>(json!({"a": 1, "b": 2})).await {
        Ok(reply) => println!("RPC reply: {reply:?}"),
        Err(err) => println!("RPC error: {err}"),
    }

    connection.close().await?;

    Ok(())
}

//! RPC server example.
//!
//! Consumes the `RPC-test` queue, increments `a` in each request, and fails
//! the call when `b` is missing. Failures are shipped back to the caller as
//! error replies.
//!
//! Run with: cargo run --example rpc_server
//!
//! Requires: RabbitMQ running on localhost:5672

use anyhow::Result;
use serde::{Deserialize, Serialize};

use mq_rpc::{connect, ConnectOptions, ConnectionEvent, Error, RpcFault, ServerOptions};

const QUEUE_NAME: &str = "RPC-test";

#[derive(Debug, Serialize, Deserialize)]
struct JobRequest {
    a: Option<i64>,
    b: Option<i64>,
}

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
        ConnectOptions::default().with_connection_name("rpc-server-example"),
    )
    .await?;

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
    // Errors raised here are sent to the RPC client.
    let server = connection
        .create_rpc_server(
            QUEUE_NAME,
            |req: JobRequest, _raw| async move {
                if req.b.is_none() {
                    return Err(Error::Remote(RpcFault::new("B is not set")));
                }
                Ok(JobReply {
                    a: req.a.map(|a| a + 1),
                })
            },
            ServerOptions::default(),
        )
        .await?;

    server.ready().await;
    println!("Connected to RPC channel");

    tokio::signal::ctrl_c().await?;
    println!("Received Ctrl+C, shutting down...");

    connection.close().await?;

    Ok(())
}

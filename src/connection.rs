// src/connection.rs

//! Broker connection facade.
//!
//! A [`Connection`] wraps a [`Transport`] and hands out RPC clients and
//! servers whose channel state is rebuilt automatically on every reconnect.

use std::future::Future;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::rpc_config::{ClientOptions, ServerOptions};
use crate::{ConnectionEvent, Delivery, Result, RpcClient, RpcServer, TransportPtr};

/// Handle to a broker connection.
///
/// Cheap to clone; clones share the underlying transport.
#[derive(Clone)]
pub struct Connection {
    transport: TransportPtr,
}

impl Connection {
    // ---
    /// Wrap an explicitly provided transport.
    ///
    /// This is the constructor you want for tests (with
    /// [`MemoryTransport`](crate::MemoryTransport)) and for advanced users
    /// bringing their own broker integration.
    pub fn with_transport(transport: TransportPtr) -> Self {
        Self { transport }
    }

    /// Subscribe to connection lifecycle events
    /// ([`Connected`](ConnectionEvent::Connected) /
    /// [`Disconnected`](ConnectionEvent::Disconnected)).
    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.transport.events()
    }

    /// Create a new RPC client targeting `queue_name`.
    ///
    /// The client's channel setup (private reply queue + reply consumer)
    /// runs in the background once the transport is connected and re-runs on
    /// every reconnect. Until it completes, `send_rpc` fails with
    /// [`Error::ChannelNotReady`](crate::Error::ChannelNotReady); use
    /// [`RpcClient::ready`] to wait for it.
    pub async fn create_rpc_client(
        &self,
        queue_name: impl Into<String>,
        options: ClientOptions,
    ) -> Result<RpcClient> {
        // ---
        let client = RpcClient::new(queue_name, options);
        self.transport.open_channel(client.setup_hook()).await?;
        Ok(client)
    }

    /// Create a new RPC server consuming `queue_name`.
    ///
    /// `callback` is invoked with the parsed request value and the raw
    /// delivery for every inbound message; its success value or failure is
    /// shipped back to the caller as a correlated `{msg}`/`{err}` reply.
    pub async fn create_rpc_server<F, Fut, Req, Resp>(
        &self,
        queue_name: impl Into<String>,
        callback: F,
        options: ServerOptions,
    ) -> Result<RpcServer>
    where
        F: Fn(Req, Delivery) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp>> + Send + 'static,
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
    {
        // ---
        let server = RpcServer::new(queue_name, callback, options);
        self.transport.open_channel(server.setup_hook()).await?;
        Ok(server)
    }

    /// Close the underlying transport.
    pub async fn close(&self) -> Result<()> {
        self.transport.close().await
    }
}

/// Connect to a broker, trying `urls` in order and cycling through them on
/// every reconnect.
///
/// Returns as soon as the connection supervisor is running; the broker link
/// itself is established in the background and reported through
/// [`Connection::events`]. Clients and servers created before the link is up
/// are set up automatically once it is.
#[cfg(feature = "transport_amqp")]
pub async fn connect(
    urls: &[impl AsRef<str>],
    options: crate::ConnectOptions,
) -> Result<Connection> {
    // ---
    use std::sync::Arc;

    let urls: Vec<String> = urls.iter().map(|u| u.as_ref().to_string()).collect();
    let transport: TransportPtr = Arc::new(crate::transport::AmqpTransport::spawn(urls, options)?);
    Ok(Connection::with_transport(transport))
}

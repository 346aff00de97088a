//! Public, transport-agnostic configuration.
//!
//! These types intentionally contain no broker-specific concepts; transport
//! layers are responsible for interpreting them into concrete connection
//! settings.

use std::fmt;
use std::time::Duration;

use crate::domain::SetupFn;

/// Connection options passed to [`connect`](crate::connect).
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    // ---
    /// Delay between reconnection attempts. Candidate URLs are cycled, one
    /// attempt per delay.
    pub reconnect_delay: Duration,

    /// Optional broker-visible connection name, useful in broker dashboards.
    pub connection_name: Option<String>,
}

impl Default for ConnectOptions {
    /// Reasonable default connection options.
    ///
    /// - `reconnect_delay`: 1s
    /// - `connection_name`: none
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(1),
            connection_name: None,
        }
    }
}

impl ConnectOptions {
    /// Set the delay between reconnection attempts.
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Set a broker-visible connection name.
    pub fn with_connection_name(mut self, name: impl Into<String>) -> Self {
        self.connection_name = Some(name.into());
        self
    }
}

/// Options for [`Connection::create_rpc_client`](crate::Connection::create_rpc_client).
#[derive(Clone, Default)]
pub struct ClientOptions {
    // ---
    /// Default time-to-live for calls, in seconds. `0` means calls never
    /// expire locally. A per-call TTL passed to
    /// [`send_rpc_with`](crate::RpcClient::send_rpc_with) overrides this.
    pub ttl_secs: u64,

    /// Custom channel setup. Runs on every (re)connect and returns the
    /// reply-queue identity to consume. When absent, the client declares a
    /// private broker-named reply queue.
    pub setup: Option<SetupFn>,
}

impl ClientOptions {
    /// Set the default call TTL in seconds (`0` = never expires locally).
    pub fn with_ttl_secs(mut self, ttl_secs: u64) -> Self {
        self.ttl_secs = ttl_secs;
        self
    }

    /// Supply a custom setup closure returning the reply queue to consume.
    pub fn with_setup(mut self, setup: SetupFn) -> Self {
        self.setup = Some(setup);
        self
    }
}

impl fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientOptions")
            .field("ttl_secs", &self.ttl_secs)
            .field("setup", &self.setup.as_ref().map(|_| "<custom>"))
            .finish()
    }
}

/// Options for [`Connection::create_rpc_server`](crate::Connection::create_rpc_server).
#[derive(Clone, Default)]
pub struct ServerOptions {
    // ---
    /// Include the fault's stack text in error replies. Off by default; the
    /// stack is always stripped otherwise.
    pub send_error_stack: bool,

    /// Custom channel setup. Runs on every (re)connect and returns the
    /// request-queue identity to consume. When absent, the server sets
    /// prefetch to 1 and declares the target queue non-durable.
    pub setup: Option<SetupFn>,
}

impl ServerOptions {
    /// Opt in to transmitting stack text on error replies.
    pub fn with_send_error_stack(mut self, send: bool) -> Self {
        self.send_error_stack = send;
        self
    }

    /// Supply a custom setup closure returning the queue to consume.
    pub fn with_setup(mut self, setup: SetupFn) -> Self {
        self.setup = Some(setup);
        self
    }
}

impl fmt::Debug for ServerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerOptions")
            .field("send_error_stack", &self.send_error_stack)
            .field("setup", &self.setup.as_ref().map(|_| "<custom>"))
            .finish()
    }
}

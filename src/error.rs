use thiserror::Error;

use crate::protocol::RpcFault;

/// Errors that can occur during RPC operations
#[derive(Error, Debug)]
pub enum Error {
    /// Client invoked before channel setup completed; nothing was published
    #[error("channel not ready")]
    ChannelNotReady,

    /// Local registry TTL elapsed with no reply
    #[error("time expired")]
    TimeExpired,

    /// JSON serialization or deserialization failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Transport failure (connection, publish, or consume), propagated unwrapped
    #[error("transport error: {0}")]
    Transport(String),

    /// Application failure raised by the remote server callback
    #[error("remote error: {0}")]
    Remote(RpcFault),
}

/// Result type alias for RPC operations
pub type Result<T> = std::result::Result<T, Error>;

//! RPC semantics over connectionless message-broker transports.
//!
//! This library lets a caller publish a request and await a correlated reply
//! as if it were a normal call, while the underlying transport only offers
//! fire-and-forget publish/consume primitives with automatic reconnection.
//! It handles correlation ID generation, request/response matching, per-call
//! TTL expiry, and translation of application failures into a transmissible
//! form and back.
//!
//! # Overview
//!
//! - [`connect`] opens a [`Connection`] to a broker (AMQP via `lapin` when
//!   the `transport_amqp` feature is enabled).
//! - [`Connection::create_rpc_client`] yields an [`RpcClient`] whose
//!   [`send_rpc`](RpcClient::send_rpc) settles with the server's reply or
//!   with a failure ([`Error::TimeExpired`], [`Error::Remote`], ...).
//! - [`Connection::create_rpc_server`] consumes a request queue, invokes an
//!   application callback per message, and publishes correlated replies.
//!
//! The broker itself is an external collaborator behind the [`Transport`]
//! and [`Channel`] traits; an in-process [`MemoryTransport`] provides the
//! reference semantics and doubles as the test harness.

// Import all sub modules once...
mod client;
mod connection;
mod domain;
mod server;
mod transport;

mod rpc_config;

mod correlation;
mod error;
mod protocol;

mod macros;
pub(crate) use macros::{log_debug, log_error, log_info, log_warn};

// Re-export main types
pub use client::{RpcClient, SendOptions};
pub use server::RpcServer;

pub use connection::Connection;

pub use rpc_config::{ClientOptions, ConnectOptions, ServerOptions};

pub use correlation::CorrelationId;
pub use error::{Error, Result};

pub use protocol::{ReplyEnvelope, RpcFault};

pub use transport::{MemoryTransport, PublishRecord};

#[cfg(feature = "transport_amqp")]
pub use connection::connect;

// --- public re-exports
pub use domain::{
    //
    AckMode,
    Channel,
    ChannelSetup,
    ConnectionEvent,
    ConsumerHandle,
    Delivery,
    MessageProperties,
    QueueOptions,
    SetupFn,
    SetupFuture,
    Transport,
    TransportPtr,
};

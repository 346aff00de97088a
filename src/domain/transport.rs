// src/domain/transport.rs

//! Transport domain abstractions.
//!
//! This module defines the domain-level interface to the broker collaborator
//! used by the client and server layers. It intentionally avoids any
//! reference to concrete protocols, brokers, or client libraries.
//!
//! The transport layer is responsible only for broker connectivity and
//! message delivery: declaring queues, publishing with message properties,
//! consuming with an acknowledgement mode, and re-running channel setup
//! hooks on every (re)connect. Higher-level semantics such as RPC
//! correlation, per-call TTL expiry, or error translation are handled
//! elsewhere.
//!
//! Concrete implementations of this interface live under `src/transport/`.

use crate::Result;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};

/// Connection lifecycle event emitted by a transport.
///
/// Observed via [`Transport::events`]. Reconnecting transports emit
/// `Disconnected` followed by `Connected` once the broker link is back,
/// after which every registered channel setup hook runs again.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    // ---
    /// Broker link established (or re-established).
    Connected,

    /// Broker link lost. Carries the underlying error text when known.
    Disconnected { error: Option<String> },
}

/// Queue declaration options.
///
/// A small, transport-neutral subset of broker queue flags; fields map
/// one-to-one onto the underlying client's declare options.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueOptions {
    // ---
    /// Persist the queue across broker restarts.
    pub durable: bool,

    /// Restrict the queue to this connection (used for private reply queues).
    pub exclusive: bool,

    /// Delete the queue when the last consumer disconnects.
    pub auto_delete: bool,
}

impl QueueOptions {
    /// Options for a private, transient reply queue.
    pub fn reply_queue() -> Self {
        Self {
            durable: false,
            exclusive: true,
            auto_delete: true,
        }
    }

    /// Options for a non-durable request queue.
    pub fn request_queue() -> Self {
        Self {
            durable: false,
            exclusive: false,
            auto_delete: false,
        }
    }
}

/// Acknowledgement mode for a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    // ---
    /// Broker considers the message acknowledged on delivery. Used for
    /// transient replies, where loss on crash is acceptable.
    Auto,

    /// Consumer must call [`Channel::ack`] explicitly. The broker withholds
    /// further messages past the prefetch window until then.
    Manual,
}

/// Message properties carried alongside a payload.
///
/// These are the broker-level properties the RPC layer cares about; all are
/// optional at the transport level and interpreted by the RPC protocol.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    // ---
    /// Token linking a request to its eventual reply.
    pub correlation_id: Option<String>,

    /// Queue identity replies should be published to.
    pub reply_to: Option<String>,

    /// Broker-level message expiration in milliseconds, stringified.
    /// Independent of any local registry TTL; either may fire first.
    pub expiration: Option<String>,

    /// Payload format hint, typically `application/json`.
    pub content_type: Option<String>,
}

/// One message delivered to a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    // ---
    /// Opaque payload bytes. Interpretation is defined by the RPC protocol
    /// layer (JSON request bodies, `{msg}`/`{err}` reply envelopes).
    pub payload: Bytes,

    /// Properties copied from the published message.
    pub properties: MessageProperties,

    /// Transport-scoped tag used to acknowledge this delivery.
    pub delivery_tag: u64,
}

/// Handle returned from a successful consume registration.
///
/// The consumer remains active until the handle is dropped, the channel is
/// torn down by a disconnect, or the transport is closed.
pub struct ConsumerHandle {
    // ---
    /// Receiver channel for deliveries on the consumed queue.
    pub inbox: mpsc::Receiver<Delivery>,
}

/// Broker channel abstraction.
///
/// The minimal per-channel contract the RPC layer needs: queue declaration,
/// prefetch, publish with properties, consume, and acknowledgement. A fresh
/// `Channel` is handed to each [`ChannelSetup::setup`] invocation; channels
/// from before a disconnect are dead and their operations fail.
#[async_trait::async_trait]
pub trait Channel: Send + Sync {
    // ---
    /// Declare a queue, returning its identity.
    ///
    /// An empty `name` asks the broker for a generated, private queue name.
    /// Declaration is idempotent for matching options; setup hooks rely on
    /// this when they re-run after a reconnect.
    async fn assert_queue(&self, name: &str, opts: QueueOptions) -> Result<String>;

    /// Bound the number of unacknowledged deliveries held by this channel.
    async fn prefetch(&self, count: u16) -> Result<()>;

    /// Publish a payload to `routing_key` on `exchange` (empty string for
    /// the default exchange, where the routing key is a queue name).
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Bytes,
        properties: MessageProperties,
    ) -> Result<()>;

    /// Begin consuming `queue` and return a handle for receiving deliveries.
    async fn consume(&self, queue: &str, mode: AckMode) -> Result<ConsumerHandle>;

    /// Acknowledge a delivery by tag. Only meaningful for
    /// [`AckMode::Manual`] consumers.
    async fn ack(&self, delivery_tag: u64) -> Result<()>;
}

/// Future type returned by custom setup closures.
pub type SetupFuture = Pin<Box<dyn Future<Output = Result<String>> + Send>>;

/// Caller-supplied channel setup closure.
///
/// Runs on every (re)connect with a fresh channel and returns the queue
/// identity the owning client or server should use. Must be idempotent:
/// re-declaring the same queue and re-registering the same consumer are
/// expected on reconnect.
pub type SetupFn = Arc<dyn Fn(Arc<dyn Channel>) -> SetupFuture + Send + Sync>;

/// Re-entrant channel lifecycle hook.
///
/// Implemented by the RPC client and server. The transport invokes
/// [`setup`](ChannelSetup::setup) with a fresh channel on every (re)connect
/// and [`on_disconnect`](ChannelSetup::on_disconnect) when the broker link
/// drops, driving the owner's `Disconnected → SettingUp → Ready` state
/// machine.
#[async_trait::async_trait]
pub trait ChannelSetup: Send + Sync {
    // ---
    /// Re-establish queues, consumers, and per-instance channel state.
    async fn setup(&self, channel: Arc<dyn Channel>) -> Result<()>;

    /// Broker link dropped; the last channel handed to `setup` is dead.
    fn on_disconnect(&self, _error: Option<&str>) {}
}

/// Transport abstraction — the external broker collaborator.
///
/// A `Transport` owns connection establishment and reconnection policy and
/// exposes channels only through [`ChannelSetup`] hooks, so that all channel
/// state can be rebuilt after a reconnect. It makes no promises about
/// delivery, ordering, or durability beyond what the broker provides.
///
/// The in-memory transport serves as the reference implementation of these
/// semantics.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    // ---
    /// Register a channel setup hook.
    ///
    /// The hook is retained for the life of the transport and re-invoked on
    /// every (re)connect. When the transport is already connected, the
    /// initial setup runs in the background; registration itself does not
    /// wait for it. Owners expose readiness separately (see
    /// `RpcClient::ready`).
    async fn open_channel(&self, setup: Arc<dyn ChannelSetup>) -> Result<()>;

    /// Subscribe to connection lifecycle events.
    fn events(&self) -> broadcast::Receiver<ConnectionEvent>;

    /// Close the transport and release any associated resources.
    async fn close(&self) -> Result<()>;
}

/// Shared transport pointer.
///
/// This is an `Arc<dyn Transport>`, which means:
/// - `.clone()` is cheap (only increments a reference count)
/// - Multiple clones share the same underlying connection
/// - Used to erase concrete transport types behind a stable domain interface.
pub type TransportPtr = Arc<dyn Transport>;

// src/client/rpc_client.rs
//! RPC client implementation.
//!
//! This module contains the core [`RpcClient`] type which publishes request
//! messages and awaits correlated replies over a broker transport.
//!
//! # Architecture
//!
//! The client registers a [`ChannelSetup`] hook with the transport. On every
//! (re)connect the hook declares a private reply queue, consumes it in
//! auto-acknowledge mode, and spawns a dispatch loop that matches incoming
//! replies against the pending-call registry by correlation id.
//!
//! Each `send_rpc` generates a unique correlation id and registers a oneshot
//! channel in the registry. The call settles when the matching reply arrives
//! or when the registry's sweep timer expires the entry, whichever fires
//! first. The sweep timer runs independently of message dispatch; because
//! `take()` is the sole, idempotent removal path, the two may race safely.
//!
//! # Connection state
//!
//! `Disconnected → SettingUp → Ready`, re-entering `SettingUp` on every
//! transport reconnect. While not `Ready`, `send_rpc` fails fast with
//! [`Error::ChannelNotReady`] and publishes nothing — there is no request
//! buffering while disconnected. Calls already pending when the link drops
//! are left registered: they settle on a late reply after reconnect, on TTL
//! expiry, or never (TTL 0), by design.

use std::cmp;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::time::Instant;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::domain::lock_ignore_poison;
use crate::protocol::ReplyEnvelope;
use crate::rpc_config::ClientOptions;
use crate::{
    // ---
    log_debug,
    log_info,
    log_warn,
    AckMode,
    Channel,
    ChannelSetup,
    CorrelationId,
    Delivery,
    Error,
    MessageProperties,
    QueueOptions,
    Result,
    SetupFn,
};

use super::pending::PendingCalls;

/// Per-call send options.
///
/// Every field falls back to a client-level default when unset: TTL to the
/// client's configured default, exchange to the default exchange, routing
/// key to the queue name the client was created with.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    // ---
    /// Per-call TTL override in seconds (`0` = never expires locally).
    pub ttl_secs: Option<u64>,

    /// Exchange to publish to. Defaults to the default exchange.
    pub exchange: Option<String>,

    /// Routing key. Defaults to the client's target queue name.
    pub routing_key: Option<String>,
}

impl SendOptions {
    /// Override the TTL for this call only.
    pub fn with_ttl_secs(mut self, ttl_secs: u64) -> Self {
        self.ttl_secs = Some(ttl_secs);
        self
    }

    /// Publish through a named exchange instead of the default one.
    pub fn with_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = Some(exchange.into());
        self
    }

    /// Use a routing key other than the client's target queue.
    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = Some(routing_key.into());
        self
    }
}

/// Channel readiness state.
///
/// `Ready` owns the live channel and the reply-queue identity; both are
/// replaced wholesale when setup re-runs after a reconnect.
enum ClientState {
    // ---
    Disconnected,
    SettingUp,
    Ready {
        channel: Arc<dyn Channel>,
        reply_queue: Arc<str>,
    },
}

/// Running RPC client instance.
///
/// Cheap to clone (internally `Arc`-backed). The pending-call registry, the
/// sweep timer, and the reply consumer are owned exclusively by this
/// instance; nothing is shared across clients.
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<ClientInner>,
}

pub(crate) struct ClientInner {
    // ---
    /// Target request queue (default routing key for `send_rpc`).
    queue_name: String,
    /// Default call TTL in seconds; `0` = never expires locally.
    default_ttl: u64,
    /// Caller-supplied setup returning the reply queue, if any.
    custom_setup: Option<SetupFn>,

    pending: PendingCalls,
    state: Mutex<ClientState>,
    ready_notify: Notify,

    /// Reply dispatch loop for the current channel; replaced on re-setup.
    reply_task: Mutex<Option<JoinHandle<()>>>,

    /// Registry sweep timer; aborted in `Drop` when the last client handle
    /// goes away.
    sweep_task: JoinHandle<()>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        // ---
        self.sweep_task.abort();
        if let Some(task) = lock_ignore_poison(&self.reply_task).take() {
            task.abort();
        }
    }
}

impl RpcClient {
    // ---
    /// Build the client state and start its sweep timer.
    ///
    /// The client is `Disconnected` until the transport runs its setup hook
    /// (see [`Connection::create_rpc_client`](crate::Connection::create_rpc_client)).
    pub(crate) fn new(queue_name: impl Into<String>, options: ClientOptions) -> Self {
        // ---
        let default_ttl = options.ttl_secs;
        let sweep_period = Duration::from_secs(cmp::max(1, default_ttl / 5));

        let inner = Arc::new_cyclic(|weak: &Weak<ClientInner>| {
            // ---
            let weak = weak.clone();

            // Sweep timer: runs for the life of the client, independently of
            // message dispatch.
            let sweep_task = tokio::spawn(async move {
                // ---
                let mut ticker = tokio::time::interval(sweep_period);
                ticker.tick().await; // first tick completes immediately

                loop {
                    ticker.tick().await;
                    match weak.upgrade() {
                        Some(inner) => {
                            let expired = inner.pending.sweep(Instant::now());
                            if expired > 0 {
                                log_debug!("sweep expired {expired} pending call(s)");
                            }
                        }
                        None => break,
                    }
                }
            });

            ClientInner {
                // ---
                queue_name: queue_name.into(),
                default_ttl,
                custom_setup: options.setup,
                pending: PendingCalls::new(),
                state: Mutex::new(ClientState::Disconnected),
                ready_notify: Notify::new(),
                reply_task: Mutex::new(None),
                sweep_task,
            }
        });

        Self { inner }
    }

    /// The setup hook to register with a transport.
    pub(crate) fn setup_hook(&self) -> Arc<dyn ChannelSetup> {
        Arc::new(ClientHook(Arc::downgrade(&self.inner)))
    }

    /// Send an RPC request and await the correlated reply.
    ///
    /// Uses the client's default TTL, the default exchange, and the target
    /// queue the client was created with. See [`send_rpc_with`](Self::send_rpc_with).
    pub async fn send_rpc<Req, Resp>(&self, req: Req) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        self.send_rpc_with(req, SendOptions::default()).await
    }

    /// Send an RPC request with per-call options.
    ///
    /// The request body is JSON; the published message carries a fresh
    /// correlation id, `reply_to` = this client's private reply queue, and a
    /// broker-level expiration of `ttl × 1000` ms (omitted when the
    /// effective TTL is `0`).
    ///
    /// # Errors
    ///
    /// - [`Error::ChannelNotReady`] — setup has not completed (or the link
    ///   is down); nothing was published.
    /// - [`Error::TimeExpired`] — the effective TTL elapsed with no reply.
    /// - [`Error::Remote`] — the server callback failed; carries the
    ///   deserialized fault.
    /// - [`Error::Serialization`] — the request body could not be encoded,
    ///   the reply body could not be parsed, or the result did not match
    ///   `Resp`.
    /// - [`Error::Transport`] — the publish failed or the reply channel
    ///   closed underneath the call.
    pub async fn send_rpc_with<Req, Resp>(&self, req: Req, options: SendOptions) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        // ---
        // Readiness gate: fail fast, no publish, no registry entry.
        let (channel, reply_queue) = {
            let state = lock_ignore_poison(&self.inner.state);
            match &*state {
                ClientState::Ready {
                    channel,
                    reply_queue,
                } => (Arc::clone(channel), Arc::clone(reply_queue)),
                _ => return Err(Error::ChannelNotReady),
            }
        };

        let payload = serde_json::to_vec(&req)?;

        let ttl_secs = options.ttl_secs.unwrap_or(self.inner.default_ttl);

        let correlation_id = CorrelationId::generate();
        let rx = self.inner.pending.register(correlation_id.clone(), ttl_secs);

        let properties = MessageProperties {
            correlation_id: Some(correlation_id.to_string()),
            reply_to: Some(reply_queue.to_string()),
            // Broker-level expiry is independent of the local registry TTL;
            // either may fire first.
            expiration: (ttl_secs > 0).then(|| (ttl_secs * 1000).to_string()),
            content_type: Some("application/json".to_string()),
        };

        let exchange = options.exchange.as_deref().unwrap_or("");
        let routing_key = options
            .routing_key
            .as_deref()
            .unwrap_or(&self.inner.queue_name);

        if let Err(err) = channel
            .publish(exchange, routing_key, payload.into(), properties)
            .await
        {
            // The request never left; drop the entry so the registry cannot
            // leak calls that were never sent.
            let _ = self.inner.pending.take(correlation_id.as_str());
            return Err(err);
        }

        log_debug!("published request (correlation_id: {correlation_id}, ttl: {ttl_secs}s)");

        let value = rx
            .await
            .map_err(|_| Error::Transport("reply channel closed before settlement".into()))??;

        Ok(serde_json::from_value(value)?)
    }

    /// Wait until the client has completed setup and is ready to send.
    ///
    /// Returns immediately when already `Ready`. Combine with
    /// `tokio::time::timeout` to bound the wait.
    pub async fn ready(&self) {
        // ---
        loop {
            let notified = self.inner.ready_notify.notified();
            if self.inner.is_ready() {
                return;
            }
            notified.await;
        }
    }

    /// Whether the client is currently `Ready`.
    pub fn is_ready(&self) -> bool {
        self.inner.is_ready()
    }

    /// Identity of the private reply queue, once setup has run.
    pub fn reply_queue(&self) -> Option<String> {
        // ---
        let state = lock_ignore_poison(&self.inner.state);
        match &*state {
            ClientState::Ready { reply_queue, .. } => Some(reply_queue.to_string()),
            _ => None,
        }
    }

    /// Number of calls currently awaiting a reply.
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.len()
    }
}

impl ClientInner {
    // ---
    fn is_ready(&self) -> bool {
        matches!(
            &*lock_ignore_poison(&self.state),
            ClientState::Ready { .. }
        )
    }

    fn set_state(&self, next: ClientState) {
        let is_ready = matches!(next, ClientState::Ready { .. });
        *lock_ignore_poison(&self.state) = next;
        if is_ready {
            self.ready_notify.notify_waiters();
        }
    }

    /// Dispatch one inbound reply.
    ///
    /// Unknown correlation ids — already settled, expired, or foreign — are
    /// silently discarded and cannot affect any other pending call.
    fn handle_reply(&self, delivery: Delivery) {
        // ---
        let Some(id) = delivery.properties.correlation_id.as_deref() else {
            log_debug!("reply without correlation id, dropping");
            return;
        };

        let Some(reply_tx) = self.pending.take(id) else {
            log_debug!("reply for unknown correlation id, dropping (correlation_id: {id})");
            return;
        };

        let result = match serde_json::from_slice::<ReplyEnvelope>(&delivery.payload) {
            Ok(ReplyEnvelope::Msg { msg }) => Ok(msg),
            Ok(ReplyEnvelope::Err { err }) => Err(Error::Remote(err)),
            Err(parse_err) => Err(Error::Serialization(parse_err)),
        };

        if reply_tx.send(result).is_err() {
            log_debug!("reply arrived after the caller was dropped (correlation_id: {id})");
        }
    }
}

/// Transport-facing lifecycle hook for a client instance.
///
/// Holds only a weak reference: once every `RpcClient` handle is dropped the
/// hook becomes inert even though the transport retains it.
pub(crate) struct ClientHook(pub(crate) Weak<ClientInner>);

#[async_trait::async_trait]
impl ChannelSetup for ClientHook {
    // ---
    async fn setup(&self, channel: Arc<dyn Channel>) -> Result<()> {
        // ---
        let Some(inner) = self.0.upgrade() else {
            return Ok(());
        };

        inner.set_state(ClientState::SettingUp);

        // Declare (or accept an externally supplied) private reply queue.
        let reply_queue = match &inner.custom_setup {
            Some(setup) => setup(Arc::clone(&channel)).await?,
            None => {
                channel
                    .assert_queue("", QueueOptions::reply_queue())
                    .await?
            }
        };

        // Replies are transient; loss on crash is acceptable, so consume in
        // auto-acknowledge mode.
        let mut consumer = channel.consume(&reply_queue, AckMode::Auto).await?;

        let weak = self.0.clone();
        let dispatch_task = tokio::spawn(async move {
            // ---
            while let Some(delivery) = consumer.inbox.recv().await {
                match weak.upgrade() {
                    Some(inner) => inner.handle_reply(delivery),
                    None => break,
                }
            }
            log_debug!("reply consumer stopped");
        });

        if let Some(previous) = lock_ignore_poison(&inner.reply_task).replace(dispatch_task) {
            // Idempotent re-setup: only one dispatch loop per client.
            previous.abort();
        }

        log_info!("rpc client ready (reply queue: {reply_queue})");

        inner.set_state(ClientState::Ready {
            channel,
            reply_queue: Arc::from(reply_queue),
        });

        Ok(())
    }

    fn on_disconnect(&self, error: Option<&str>) {
        // ---
        if let Some(inner) = self.0.upgrade() {
            log_warn!(
                "transport disconnected, {} call(s) left pending: {}",
                inner.pending.len(),
                error.unwrap_or("unknown error")
            );
            // Pending calls are intentionally not failed here; they settle on
            // a late reply after reconnect or on local TTL expiry.
            inner.set_state(ClientState::Disconnected);
        }
    }
}

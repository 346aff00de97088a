//! RPC server: consumes requests, invokes application logic, publishes
//! correlated replies.
//!
//! The server registers a [`ChannelSetup`] hook with the transport. On every
//! (re)connect the hook runs the default setup — prefetch 1, non-durable
//! queue declare — or a caller-supplied one, then consumes the queue in
//! manual-acknowledge mode.
//!
//! Requests are handled strictly one at a time: the consume loop awaits the
//! application callback, publishes the reply, and only then acknowledges the
//! message. With prefetch 1 the broker withholds the next message until that
//! ack, bounding in-flight requests per server instance to one. Callers
//! needing parallelism run multiple server instances.
//!
//! Every application failure is caught and shipped to the client as an
//! `{err}` reply; no synchronous caller waits on the server, so nothing ever
//! escapes the consume loop. The request is acknowledged unconditionally —
//! even when the reply publish fails — trading potential reply loss for
//! avoidance of redelivery storms.

mod handler;

use std::future::Future;
use std::sync::{Arc, Mutex, Weak};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::domain::lock_ignore_poison;
use crate::protocol::ReplyEnvelope;
use crate::rpc_config::ServerOptions;
use crate::{
    // ---
    log_debug,
    log_error,
    log_info,
    log_warn,
    AckMode,
    Channel,
    ChannelSetup,
    Delivery,
    MessageProperties,
    QueueOptions,
    Result,
    SetupFn,
};

use handler::{wrap_handler, BoxedHandler};

/// Running RPC server instance.
///
/// Cheap to clone (internally `Arc`-backed). Dropping every handle stops the
/// consume loop; the transport's retained hook becomes inert.
#[derive(Clone)]
pub struct RpcServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    // ---
    queue_name: String,
    handler: BoxedHandler,
    send_error_stack: bool,
    custom_setup: Option<SetupFn>,

    /// Consume loop for the current channel; replaced on re-setup.
    consume_task: Mutex<Option<JoinHandle<()>>>,

    ready: Mutex<bool>,
    ready_notify: Notify,
}

impl RpcServer {
    // ---
    /// Build the server state around a typed application callback.
    ///
    /// The callback receives the parsed request value and the raw delivery,
    /// and its eventual settlement — success value or failure — is fully
    /// resolved before a reply is composed.
    pub(crate) fn new<F, Fut, Req, Resp>(
        queue_name: impl Into<String>,
        callback: F,
        options: ServerOptions,
    ) -> Self
    where
        F: Fn(Req, Delivery) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp>> + Send + 'static,
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
    {
        // ---
        Self {
            inner: Arc::new(ServerInner {
                queue_name: queue_name.into(),
                handler: wrap_handler(callback),
                send_error_stack: options.send_error_stack,
                custom_setup: options.setup,
                consume_task: Mutex::new(None),
                ready: Mutex::new(false),
                ready_notify: Notify::new(),
            }),
        }
    }

    /// The setup hook to register with a transport.
    pub(crate) fn setup_hook(&self) -> Arc<dyn ChannelSetup> {
        Arc::new(ServerHook(Arc::downgrade(&self.inner)))
    }

    /// Wait until the server is consuming its request queue.
    pub async fn ready(&self) {
        // ---
        loop {
            let notified = self.inner.ready_notify.notified();
            if *lock_ignore_poison(&self.inner.ready) {
                return;
            }
            notified.await;
        }
    }

    /// Whether the server is currently consuming.
    pub fn is_ready(&self) -> bool {
        *lock_ignore_poison(&self.inner.ready)
    }

    /// The request queue this server was created for.
    pub fn queue_name(&self) -> &str {
        &self.inner.queue_name
    }
}

impl ServerInner {
    // ---
    fn set_ready(&self, ready: bool) {
        *lock_ignore_poison(&self.ready) = ready;
        if ready {
            self.ready_notify.notify_waiters();
        }
    }

    /// Handle one inbound request end to end.
    ///
    /// Runs inline in the consume loop, so the next delivery is not pulled
    /// until this one is acknowledged.
    async fn handle_request(&self, channel: &Arc<dyn Channel>, delivery: Delivery) {
        // ---
        let delivery_tag = delivery.delivery_tag;
        let correlation_id = delivery.properties.correlation_id.clone();
        let reply_to = delivery.properties.reply_to.clone();

        let reply = match (self.handler)(delivery).await {
            Ok(msg) => ReplyEnvelope::msg(msg),
            Err(fault) => {
                log_debug!("request handler failed: {fault}");
                ReplyEnvelope::err(fault.into_wire(self.send_error_stack))
            }
        };

        match reply_to {
            Some(reply_to) => {
                // ---
                match serde_json::to_vec(&reply) {
                    Ok(body) => {
                        let properties = MessageProperties {
                            correlation_id,
                            content_type: Some("application/json".to_string()),
                            ..MessageProperties::default()
                        };

                        // A failed reply publish is logged and the request is
                        // still acknowledged below; the caller's TTL covers the
                        // lost reply.
                        if let Err(err) = channel
                            .publish("", &reply_to, body.into(), properties)
                            .await
                        {
                            log_error!("reply publish failed: {err}");
                        }
                    }
                    Err(err) => log_error!("reply encoding failed: {err}"),
                }
            }
            None => {
                log_warn!("request without reply_to, discarding reply");
            }
        }

        // Acknowledge unconditionally; this layer never requeues.
        if let Err(err) = channel.ack(delivery_tag).await {
            log_error!("request ack failed: {err}");
        }
    }
}

/// Transport-facing lifecycle hook for a server instance.
struct ServerHook(Weak<ServerInner>);

#[async_trait::async_trait]
impl ChannelSetup for ServerHook {
    // ---
    async fn setup(&self, channel: Arc<dyn Channel>) -> Result<()> {
        // ---
        let Some(inner) = self.0.upgrade() else {
            return Ok(());
        };

        inner.set_ready(false);

        let queue = match &inner.custom_setup {
            Some(setup) => setup(Arc::clone(&channel)).await?,
            None => {
                // Prefetch 1: the broker withholds the next request until the
                // current one is acknowledged.
                channel.prefetch(1).await?;
                channel
                    .assert_queue(&inner.queue_name, QueueOptions::request_queue())
                    .await?
            }
        };

        let mut consumer = channel.consume(&queue, AckMode::Manual).await?;

        let weak = self.0.clone();
        let consume_task = tokio::spawn(async move {
            // ---
            while let Some(delivery) = consumer.inbox.recv().await {
                match weak.upgrade() {
                    Some(inner) => inner.handle_request(&channel, delivery).await,
                    None => break,
                }
            }
            log_debug!("request consumer stopped");
        });

        if let Some(previous) = lock_ignore_poison(&inner.consume_task).replace(consume_task) {
            // Idempotent re-setup: only one consume loop per server.
            previous.abort();
        }

        log_info!("rpc server consuming (queue: {queue})");
        inner.set_ready(true);

        Ok(())
    }

    fn on_disconnect(&self, error: Option<&str>) {
        // ---
        if let Some(inner) = self.0.upgrade() {
            log_warn!(
                "transport disconnected, server idle: {}",
                error.unwrap_or("unknown error")
            );
            inner.set_ready(false);
        }
    }
}

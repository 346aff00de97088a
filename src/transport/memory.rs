// src/transport/memory.rs

//! In-memory transport implementation.
//!
//! This transport simulates a message broker entirely within the process.
//! It is the **reference implementation** of the transport contract and the
//! test double for the RPC layer: it records every publish, supports
//! broker-generated queue names, buffers messages published while no
//! consumer is attached, honors broker-level message expiration at drain
//! time, and can simulate disconnect/reconnect cycles to exercise setup
//! hooks.
//!
//! ## Semantics
//!
//! - The routing key is the queue name; exchanges are accepted but not
//!   interpreted (default-exchange semantics only).
//! - Every publish lands in the queue's buffer; a per-consumer forwarding
//!   task drains it in order, waiting for inbox capacity, so no buffered
//!   message is lost however large the backlog.
//! - Each queue delivers to its most recent consumer, matching broker queue
//!   semantics rather than pub/sub fanout.
//! - Prefetch and acknowledgement are recorded but not enforced.
//! - Channels handed to setup hooks die on simulated disconnect; operations
//!   on a dead channel fail like they would on a real broker. Queue contents
//!   survive the disconnect.
//!
//! ## Non-Goals
//!
//! - Persistence or durability
//! - Network behavior beyond explicit disconnect simulation
//! - Exact emulation of AMQP exchange routing

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, Notify};
use uuid::Uuid;

use crate::domain::lock_ignore_poison;
use crate::{
    // ---
    log_debug,
    log_error,
    AckMode,
    Channel,
    ChannelSetup,
    ConnectionEvent,
    ConsumerHandle,
    Delivery,
    MessageProperties,
    QueueOptions,
    Result,
    Transport,
};

/// One recorded publish, in publish order.
#[derive(Debug, Clone)]
pub struct PublishRecord {
    // ---
    pub exchange: String,
    pub routing_key: String,
    pub properties: MessageProperties,
    pub payload: Bytes,
}

struct Buffered {
    // ---
    delivery: Delivery,
    /// Broker-level expiration; expired messages are dropped at drain time.
    expires_at: Option<Instant>,
}

#[derive(Default)]
struct QueueState {
    // ---
    buffered: VecDeque<Buffered>,

    /// Wakes the queue's forwarder when a message arrives.
    notify: Arc<Notify>,

    /// Bumped on every `consume` and on disconnect; a forwarder exits once
    /// the epoch it was created under is stale, so the newest consumer owns
    /// the queue.
    epoch: u64,
}

/// Broker state shared by every channel of a transport instance.
///
/// Queues outlive simulated disconnects — only channels and consumers die —
/// so buffered messages survive a reconnect like they would on a broker.
struct BrokerCore {
    // ---
    queues: Mutex<HashMap<String, QueueState>>,
    publishes: Mutex<Vec<PublishRecord>>,
    next_tag: AtomicU64,
    acked: AtomicU64,
}

impl BrokerCore {
    fn record_publish(&self, record: PublishRecord) {
        lock_ignore_poison(&self.publishes).push(record);
    }
}

/// In-memory transport.
pub struct MemoryTransport {
    // ---
    core: Arc<BrokerCore>,
    hooks: Mutex<Vec<Arc<dyn ChannelSetup>>>,
    channels: Mutex<Vec<Arc<MemoryChannel>>>,
    events: broadcast::Sender<ConnectionEvent>,
    connected: AtomicBool,
}

impl MemoryTransport {
    // ---
    /// Create a new in-memory transport, initially "connected".
    pub fn new() -> Arc<Self> {
        // ---
        let (events, _) = broadcast::channel(16);

        Arc::new(Self {
            core: Arc::new(BrokerCore {
                queues: Mutex::new(HashMap::new()),
                publishes: Mutex::new(Vec::new()),
                next_tag: AtomicU64::new(1),
                acked: AtomicU64::new(0),
            }),
            hooks: Mutex::new(Vec::new()),
            channels: Mutex::new(Vec::new()),
            events,
            connected: AtomicBool::new(true),
        })
    }

    fn new_channel(&self) -> Arc<MemoryChannel> {
        // ---
        let channel = Arc::new(MemoryChannel {
            core: Arc::clone(&self.core),
            open: AtomicBool::new(true),
        });
        lock_ignore_poison(&self.channels).push(Arc::clone(&channel));
        channel
    }

    /// A raw channel outside any setup hook, for publishing test traffic.
    pub fn raw_channel(&self) -> Arc<dyn Channel> {
        self.new_channel()
    }

    /// Every publish made through this transport, in order.
    pub fn publish_records(&self) -> Vec<PublishRecord> {
        lock_ignore_poison(&self.core.publishes).clone()
    }

    /// Total number of publishes made through this transport.
    pub fn publish_count(&self) -> usize {
        lock_ignore_poison(&self.core.publishes).len()
    }

    /// Total number of acknowledged deliveries.
    pub fn ack_count(&self) -> u64 {
        self.core.acked.load(Ordering::SeqCst)
    }

    /// Simulate losing the broker link.
    ///
    /// Kills every channel and consumer, emits `Disconnected`, and notifies
    /// every registered setup hook. Queue contents survive, as they would on
    /// a broker.
    pub fn simulate_disconnect(&self, error: Option<&str>) {
        // ---
        self.connected.store(false, Ordering::SeqCst);

        for channel in lock_ignore_poison(&self.channels).drain(..) {
            channel.open.store(false, Ordering::SeqCst);
        }

        // Staling the epochs ends every forwarder, which in turn closes the
        // consumer inboxes. Buffered messages stay put.
        for queue in lock_ignore_poison(&self.core.queues).values_mut() {
            queue.epoch += 1;
            queue.notify.notify_one();
        }

        let _ = self.events.send(ConnectionEvent::Disconnected {
            error: error.map(String::from),
        });

        let hooks: Vec<_> = lock_ignore_poison(&self.hooks).clone();
        for hook in hooks {
            hook.on_disconnect(error);
        }
    }

    /// Simulate the broker link coming back.
    ///
    /// Emits `Connected` and re-runs every registered setup hook with a
    /// fresh channel, exactly like a reconnecting transport would.
    pub async fn simulate_reconnect(&self) {
        // ---
        self.connected.store(true, Ordering::SeqCst);
        let _ = self.events.send(ConnectionEvent::Connected);

        let hooks: Vec<_> = lock_ignore_poison(&self.hooks).clone();
        for hook in hooks {
            let channel = self.new_channel();
            if let Err(err) = hook.setup(channel).await {
                log_error!("channel setup failed after reconnect: {err}");
            }
        }
    }
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    // ---
    async fn open_channel(&self, setup: Arc<dyn ChannelSetup>) -> Result<()> {
        // ---
        lock_ignore_poison(&self.hooks).push(Arc::clone(&setup));

        if self.connected.load(Ordering::SeqCst) {
            // Setup runs in the background, mirroring reconnecting
            // transports where registration never waits for the link.
            let channel = self.new_channel();
            tokio::spawn(async move {
                if let Err(err) = setup.setup(channel).await {
                    log_error!("channel setup failed: {err}");
                }
            });
        }

        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    async fn close(&self) -> Result<()> {
        // ---
        self.connected.store(false, Ordering::SeqCst);

        for channel in lock_ignore_poison(&self.channels).drain(..) {
            channel.open.store(false, Ordering::SeqCst);
        }

        let mut queues = lock_ignore_poison(&self.core.queues);
        for queue in queues.values_mut() {
            queue.epoch += 1;
            queue.notify.notify_one();
        }
        queues.clear();

        Ok(())
    }
}

/// One channel of the in-memory transport.
///
/// Dead after a simulated disconnect; every operation then fails, forcing
/// owners to wait for the next setup invocation.
struct MemoryChannel {
    // ---
    core: Arc<BrokerCore>,
    open: AtomicBool,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<()> {
        // ---
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(crate::Error::Transport("memory: channel closed".into()))
        }
    }
}

#[async_trait::async_trait]
impl Channel for MemoryChannel {
    // ---
    async fn assert_queue(&self, name: &str, _opts: QueueOptions) -> Result<String> {
        // ---
        self.ensure_open()?;

        let name = if name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4())
        } else {
            name.to_string()
        };

        // Idempotent: redeclaring an existing queue keeps its contents.
        lock_ignore_poison(&self.core.queues)
            .entry(name.clone())
            .or_default();

        Ok(name)
    }

    async fn prefetch(&self, _count: u16) -> Result<()> {
        // Recorded broker-side in a real transport; nothing to enforce here.
        self.ensure_open()
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Bytes,
        properties: MessageProperties,
    ) -> Result<()> {
        // ---
        self.ensure_open()?;

        self.core.record_publish(PublishRecord {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            properties: properties.clone(),
            payload: payload.clone(),
        });

        let expires_at = properties
            .expiration
            .as_deref()
            .and_then(|ms| ms.parse::<u64>().ok())
            .map(|ms| Instant::now() + Duration::from_millis(ms));

        let delivery = Delivery {
            payload,
            properties,
            delivery_tag: self.core.next_tag.fetch_add(1, Ordering::SeqCst),
        };

        // Every message goes through the buffer; the queue's forwarder picks
        // it up in publish order.
        let mut queues = lock_ignore_poison(&self.core.queues);
        let queue = queues.entry(routing_key.to_string()).or_default();
        queue.buffered.push_back(Buffered {
            delivery,
            expires_at,
        });
        queue.notify.notify_one();

        Ok(())
    }

    async fn consume(&self, queue: &str, _mode: AckMode) -> Result<ConsumerHandle> {
        // ---
        self.ensure_open()?;

        let (tx, rx) = mpsc::channel(64);

        let (notify, epoch) = {
            let mut queues = lock_ignore_poison(&self.core.queues);
            let state = queues.entry(queue.to_string()).or_default();
            state.epoch += 1;
            // Wake a forwarder parked under the previous epoch so it exits.
            state.notify.notify_one();
            (Arc::clone(&state.notify), state.epoch)
        };

        // Forwarder: drains the backlog in order, waiting for inbox capacity
        // instead of dropping, and parks when the queue is empty. Exits when
        // its epoch goes stale, the queue is deleted, or the handle drops.
        let core = Arc::clone(&self.core);
        let queue_name = queue.to_string();
        tokio::spawn(async move {
            // ---
            loop {
                let next = {
                    let mut queues = lock_ignore_poison(&core.queues);
                    let Some(state) = queues.get_mut(&queue_name) else {
                        break;
                    };
                    if state.epoch != epoch {
                        break;
                    }
                    state.buffered.pop_front()
                };

                match next {
                    Some(buffered) => {
                        // Broker-level expiration is honored at drain time.
                        if buffered.expires_at.is_some_and(|at| at <= Instant::now()) {
                            log_debug!("memory: dropping expired message on {queue_name}");
                            continue;
                        }
                        if let Err(send_err) = tx.send(buffered.delivery).await {
                            // Handle dropped mid-delivery; keep the message.
                            let mut queues = lock_ignore_poison(&core.queues);
                            if let Some(state) = queues.get_mut(&queue_name) {
                                state.buffered.push_front(Buffered {
                                    delivery: send_err.0,
                                    expires_at: buffered.expires_at,
                                });
                            }
                            break;
                        }
                    }
                    None => notify.notified().await,
                }
            }
        });

        Ok(ConsumerHandle { inbox: rx })
    }

    async fn ack(&self, _delivery_tag: u64) -> Result<()> {
        // ---
        self.ensure_open()?;
        self.core.acked.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn payload(text: &str) -> Bytes {
        Bytes::copy_from_slice(text.as_bytes())
    }

    #[tokio::test]
    async fn test_generated_queue_names_are_unique() {
        // ---
        let transport = MemoryTransport::new();
        let channel = transport.raw_channel();

        let a = channel
            .assert_queue("", QueueOptions::reply_queue())
            .await
            .unwrap();
        let b = channel
            .assert_queue("", QueueOptions::reply_queue())
            .await
            .unwrap();

        assert!(a.starts_with("amq.gen-"));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_publish_buffers_until_consumed() {
        // ---
        let transport = MemoryTransport::new();
        let channel = transport.raw_channel();

        channel
            .publish("", "jobs", payload("one"), MessageProperties::default())
            .await
            .unwrap();

        let mut consumer = channel.consume("jobs", AckMode::Manual).await.unwrap();
        let delivery = consumer.inbox.recv().await.unwrap();
        assert_eq!(&delivery.payload[..], b"one");
    }

    #[tokio::test]
    async fn test_expired_backlog_is_dropped_at_drain() {
        // ---
        let transport = MemoryTransport::new();
        let channel = transport.raw_channel();

        let props = MessageProperties {
            expiration: Some("0".to_string()),
            ..MessageProperties::default()
        };
        channel
            .publish("", "jobs", payload("stale"), props)
            .await
            .unwrap();
        channel
            .publish("", "jobs", payload("fresh"), MessageProperties::default())
            .await
            .unwrap();

        let mut consumer = channel.consume("jobs", AckMode::Manual).await.unwrap();
        let delivery = consumer.inbox.recv().await.unwrap();
        assert_eq!(&delivery.payload[..], b"fresh");
    }

    #[tokio::test]
    async fn test_large_backlog_is_delivered_completely_in_order() {
        // ---
        let transport = MemoryTransport::new();
        let channel = transport.raw_channel();

        // Far more than the consumer inbox holds at once.
        for i in 0..200u32 {
            channel
                .publish(
                    "",
                    "jobs",
                    payload(&format!("m{i}")),
                    MessageProperties::default(),
                )
                .await
                .unwrap();
        }

        let mut consumer = channel.consume("jobs", AckMode::Manual).await.unwrap();
        for i in 0..200u32 {
            let delivery = consumer.inbox.recv().await.unwrap();
            assert_eq!(&delivery.payload[..], format!("m{i}").as_bytes());
        }
    }

    #[tokio::test]
    async fn test_newest_consumer_takes_over_the_queue() {
        // ---
        let transport = MemoryTransport::new();
        let channel = transport.raw_channel();

        let _old = channel.consume("jobs", AckMode::Manual).await.unwrap();
        let mut new = channel.consume("jobs", AckMode::Manual).await.unwrap();

        channel
            .publish("", "jobs", payload("one"), MessageProperties::default())
            .await
            .unwrap();

        let delivery = new.inbox.recv().await.unwrap();
        assert_eq!(&delivery.payload[..], b"one");
    }

    #[tokio::test]
    async fn test_dead_channel_rejects_operations() {
        // ---
        let transport = MemoryTransport::new();
        let channel = transport.raw_channel();

        transport.simulate_disconnect(Some("boom"));

        let result = channel
            .publish("", "jobs", payload("late"), MessageProperties::default())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_publishes_are_recorded() {
        // ---
        let transport = MemoryTransport::new();
        let channel = transport.raw_channel();

        assert_eq!(transport.publish_count(), 0);
        channel
            .publish("", "jobs", payload("one"), MessageProperties::default())
            .await
            .unwrap();

        let records = transport.publish_records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].routing_key, "jobs");
    }
}

// src/transport/amqp.rs

//! AMQP transport implementation using `lapin`.
//!
//! A single background **supervisor task** owns the broker connection. It is
//! responsible for:
//!
//! - establishing the connection, cycling through the candidate URLs,
//! - emitting [`ConnectionEvent`]s as the link comes and goes,
//! - creating a fresh channel and re-running every registered
//!   [`ChannelSetup`] hook on each (re)connect,
//! - clean shutdown of the connection.
//!
//! All interaction with the connection object is serialized through this
//! task; channel handles given to setup hooks wrap their own `lapin`
//! channel and are safe to use concurrently.
//!
//! Reconnection is deliberately dumb: on any connection error the supervisor
//! waits `reconnect_delay`, dials the next URL in the list, and reruns
//! setup. Messages published on channels from before the drop fail and are
//! not buffered; the RPC layer's readiness gating handles that window.

use lapin::{
    //
    options::{
        //
        BasicAckOptions,
        BasicConsumeOptions,
        BasicPublishOptions,
        BasicQosOptions,
        QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties,
    Connection as LapinConnection,
    ConnectionProperties,
};

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, oneshot};
use uuid::Uuid;

use crate::{
    //
    log_error,
    log_info,
    log_warn,
    AckMode,
    Channel,
    ChannelSetup,
    ConnectOptions,
    ConnectionEvent,
    ConsumerHandle,
    Delivery,
    Error,
    MessageProperties,
    QueueOptions,
    Result,
    Transport,
};

//
// Supervisor commands
//

enum Cmd {
    //
    OpenChannel { hook: Arc<dyn ChannelSetup> },
    Close { resp: oneshot::Sender<()> },
}

/// AMQP transport backed by lapin.
pub(crate) struct AmqpTransport {
    // ---
    cmd_tx: mpsc::Sender<Cmd>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl AmqpTransport {
    /// Start the connection supervisor for the given broker URLs.
    ///
    /// Returns immediately; the link is established in the background and
    /// reported through [`Transport::events`].
    pub(crate) fn spawn(urls: Vec<String>, options: ConnectOptions) -> Result<Self> {
        // ---
        if urls.is_empty() {
            return Err(Error::Transport(
                "amqp: at least one broker url is required".into(),
            ));
        }

        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (events, _) = broadcast::channel(16);

        let supervisor = Supervisor {
            urls,
            options,
            cmd_rx,
            events: events.clone(),
            hooks: Vec::new(),
        };

        tokio::spawn(supervisor.run());

        Ok(Self { cmd_tx, events })
    }
}

#[async_trait::async_trait]
impl Transport for AmqpTransport {
    // ---
    async fn open_channel(&self, setup: Arc<dyn ChannelSetup>) -> Result<()> {
        // ---
        self.cmd_tx
            .send(Cmd::OpenChannel { hook: setup })
            .await
            .map_err(|err| Error::Transport(format!("amqp: supervisor gone: {err}")))
    }

    fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    async fn close(&self) -> Result<()> {
        // ---
        let (tx, rx) = oneshot::channel();
        let _ = self.cmd_tx.send(Cmd::Close { resp: tx }).await;
        let _ = rx.await;
        Ok(())
    }
}

/// Background task owning the broker connection.
struct Supervisor {
    // ---
    urls: Vec<String>,
    options: ConnectOptions,
    cmd_rx: mpsc::Receiver<Cmd>,
    events: broadcast::Sender<ConnectionEvent>,
    hooks: Vec<Arc<dyn ChannelSetup>>,
}

impl Supervisor {
    async fn run(mut self) {
        // ---
        let mut attempt: usize = 0;

        'outer: loop {
            let url = self.urls[attempt % self.urls.len()].clone();
            attempt += 1;

            let mut props = ConnectionProperties::default();
            if let Some(name) = &self.options.connection_name {
                props = props.with_connection_name(name.clone().into());
            }

            let connection = match LapinConnection::connect(&url, props).await {
                Ok(connection) => connection,
                Err(err) => {
                    log_warn!("amqp: connection to {url} failed: {err}");
                    let _ = self.events.send(ConnectionEvent::Disconnected {
                        error: Some(err.to_string()),
                    });
                    if self.idle_wait().await {
                        return;
                    }
                    continue;
                }
            };

            log_info!("amqp: connected to {url}");
            let _ = self.events.send(ConnectionEvent::Connected);

            let (err_tx, mut err_rx) = mpsc::channel::<String>(1);
            connection.on_error(move |err| {
                let _ = err_tx.try_send(err.to_string());
            });

            // Re-run every setup hook against the fresh connection.
            let hooks = self.hooks.clone();
            for hook in &hooks {
                if let Err(err) = open_for(&connection, hook).await {
                    log_error!("amqp: channel setup failed: {err}");
                }
            }

            loop {
                tokio::select! {
                    maybe_err = err_rx.recv() => {
                        let error = maybe_err.unwrap_or_else(|| "connection closed".to_string());
                        log_warn!("amqp: connection lost: {error}");
                        let _ = self.events.send(ConnectionEvent::Disconnected {
                            error: Some(error.clone()),
                        });
                        for hook in &self.hooks {
                            hook.on_disconnect(Some(&error));
                        }
                        if self.idle_wait().await {
                            return;
                        }
                        continue 'outer;
                    }
                    cmd = self.cmd_rx.recv() => match cmd {
                        Some(Cmd::OpenChannel { hook }) => {
                            if let Err(err) = open_for(&connection, &hook).await {
                                log_error!("amqp: channel setup failed: {err}");
                            }
                            self.hooks.push(hook);
                        }
                        Some(Cmd::Close { resp }) => {
                            let _ = connection.close(200, "client shutdown").await;
                            let _ = resp.send(());
                            return;
                        }
                        None => {
                            // Transport dropped.
                            let _ = connection.close(200, "transport dropped").await;
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Sleep out the reconnect delay while still accepting commands.
    ///
    /// Returns `true` when shutdown was requested.
    async fn idle_wait(&mut self) -> bool {
        // ---
        let sleep = tokio::time::sleep(self.options.reconnect_delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return false,
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(Cmd::OpenChannel { hook }) => {
                        // Registered now, set up on the next successful connect.
                        self.hooks.push(hook);
                    }
                    Some(Cmd::Close { resp }) => {
                        let _ = resp.send(());
                        return true;
                    }
                    None => return true,
                }
            }
        }
    }
}

async fn open_for(connection: &LapinConnection, hook: &Arc<dyn ChannelSetup>) -> Result<()> {
    // ---
    let channel = connection
        .create_channel()
        .await
        .map_err(|err| Error::Transport(format!("amqp: channel creation failed: {err}")))?;

    hook.setup(Arc::new(AmqpChannel { channel })).await
}

/// One lapin channel behind the domain [`Channel`] trait.
struct AmqpChannel {
    channel: lapin::Channel,
}

fn properties_from(props: &BasicProperties) -> MessageProperties {
    // ---
    MessageProperties {
        correlation_id: props
            .correlation_id()
            .as_ref()
            .map(|v| v.as_str().to_string()),
        reply_to: props.reply_to().as_ref().map(|v| v.as_str().to_string()),
        expiration: props.expiration().as_ref().map(|v| v.as_str().to_string()),
        content_type: props
            .content_type()
            .as_ref()
            .map(|v| v.as_str().to_string()),
    }
}

fn properties_into(properties: MessageProperties) -> BasicProperties {
    // ---
    let mut props = BasicProperties::default();
    if let Some(correlation_id) = properties.correlation_id {
        props = props.with_correlation_id(correlation_id.into());
    }
    if let Some(reply_to) = properties.reply_to {
        props = props.with_reply_to(reply_to.into());
    }
    if let Some(expiration) = properties.expiration {
        props = props.with_expiration(expiration.into());
    }
    if let Some(content_type) = properties.content_type {
        props = props.with_content_type(content_type.into());
    }
    props
}

#[async_trait::async_trait]
impl Channel for AmqpChannel {
    // ---
    async fn assert_queue(&self, name: &str, opts: QueueOptions) -> Result<String> {
        // ---
        let queue_opts = QueueDeclareOptions {
            passive: false,
            durable: opts.durable,
            exclusive: opts.exclusive,
            auto_delete: opts.auto_delete,
            nowait: false,
        };

        let queue = self
            .channel
            .queue_declare(name, queue_opts, FieldTable::default())
            .await
            .map_err(|err| Error::Transport(format!("amqp: queue declare failed: {err}")))?;

        Ok(queue.name().as_str().to_string())
    }

    async fn prefetch(&self, count: u16) -> Result<()> {
        // ---
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(|err| Error::Transport(format!("amqp: qos failed: {err}")))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Bytes,
        properties: MessageProperties,
    ) -> Result<()> {
        // ---
        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &payload,
                properties_into(properties),
            )
            .await
            .map_err(|err| Error::Transport(format!("amqp: publish failed: {err}")))?;

        Ok(())
    }

    async fn consume(&self, queue: &str, mode: AckMode) -> Result<ConsumerHandle> {
        // ---
        let consume_opts = BasicConsumeOptions {
            no_ack: mode == AckMode::Auto,
            ..BasicConsumeOptions::default()
        };

        let consumer = self
            .channel
            .basic_consume(
                queue,
                &format!("ctag-{}", Uuid::new_v4()),
                consume_opts,
                FieldTable::default(),
            )
            .await
            .map_err(|err| Error::Transport(format!("amqp: consume failed: {err}")))?;

        let (tx, rx) = mpsc::channel(16);

        tokio::spawn(async move {
            use futures_lite::stream::StreamExt;

            let mut consumer = consumer;
            while let Some(delivery_result) = consumer.next().await {
                match delivery_result {
                    Ok(delivery) => {
                        let delivery = Delivery {
                            payload: Bytes::from(delivery.data),
                            properties: properties_from(&delivery.properties),
                            delivery_tag: delivery.delivery_tag,
                        };
                        if tx.send(delivery).await.is_err() {
                            // Consumer handle dropped.
                            break;
                        }
                    }
                    Err(err) => {
                        log_error!("amqp: consumer error: {err}");
                        break;
                    }
                }
            }
        });

        Ok(ConsumerHandle { inbox: rx })
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        // ---
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|err| Error::Transport(format!("amqp: ack failed: {err}")))
    }
}

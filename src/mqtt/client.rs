use super::config::MqttConfig;
use super::message::BusMessage;
use super::payload::{Payload, StatusPayload};
use async_trait::async_trait;
use chrono::Utc;
use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet, QoS};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const REQUEST_CAPACITY: usize = 100;
const INBOUND_CAPACITY: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Invalid broker configuration: {0}")]
    Config(String),

    #[error("MQTT client error: {0}")]
    Client(#[from] rumqttc::ClientError),

    #[error("Bus connection closed")]
    Closed,
}

/// The bus as seen by the rest of the crate.
///
/// Inbound messages arrive on the receiver handed out when the concrete client
/// is connected.
#[async_trait]
pub trait BusClient: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), BusError>;

    /// Queues a publish without waiting. Fails instead of blocking when the
    /// client's outgoing queue is full.
    fn try_publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), BusError>;

    async fn subscribe(&self, filter: &str) -> Result<(), BusError>;

    async fn disconnect(&self) -> Result<(), BusError>;
}

/// rumqttc-backed bus client.
///
/// The event loop runs on its own task: it reconnects after a fixed delay,
/// re-issues every subscription on each ConnAck (sessions are clean), and
/// announces `online` on the presence topic when one is configured. The same
/// topic carries a retained `offline` last will.
pub struct MqttBus {
    client: AsyncClient,
    subscriptions: Arc<Mutex<Vec<String>>>,
    presence_topic: Option<String>,
    shutdown: CancellationToken,
    event_task: Mutex<Option<JoinHandle<()>>>,
}

impl MqttBus {
    pub fn connect(
        config: &MqttConfig,
        presence_topic: Option<String>,
    ) -> Result<(Self, mpsc::Receiver<BusMessage>), BusError> {
        if config.host.trim().is_empty() {
            return Err(BusError::Config("broker host is empty".to_string()));
        }

        let client_id = format!(
            "{}-{:08x}",
            config.client_id,
            Utc::now().timestamp_subsec_nanos() ^ std::process::id()
        );
        let mut options = MqttOptions::new(client_id.clone(), config.host.clone(), config.port);
        options
            .set_keep_alive(config.keep_alive())
            .set_clean_session(true);
        if config.has_credentials() {
            options.set_credentials(config.username.clone(), config.password.clone());
        }
        if let Some(topic) = &presence_topic {
            options.set_last_will(LastWill::new(
                topic.clone(),
                StatusPayload::offline().encode(),
                QoS::AtLeastOnce,
                true,
            ));
        }

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);

        let subscriptions = Arc::new(Mutex::new(Vec::new()));
        let shutdown = CancellationToken::new();

        let event_task = tokio::spawn(run_event_loop(
            eventloop,
            client.clone(),
            inbound_tx,
            subscriptions.clone(),
            presence_topic.clone(),
            config.reconnect_delay(),
            shutdown.clone(),
        ));

        info!(
            "MQTT client {} connecting to {}:{}",
            client_id, config.host, config.port
        );
        Ok((
            Self {
                client,
                subscriptions,
                presence_topic,
                shutdown,
                event_task: Mutex::new(Some(event_task)),
            },
            inbound_rx,
        ))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

async fn run_event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    inbound_tx: mpsc::Sender<BusMessage>,
    subscriptions: Arc<Mutex<Vec<String>>>,
    presence_topic: Option<String>,
    reconnect_delay: Duration,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("Connected to MQTT broker");
                let filters = lock(&subscriptions).clone();
                for filter in filters {
                    if let Err(e) = client.try_subscribe(filter.clone(), QoS::AtLeastOnce) {
                        error!("Failed to re-subscribe to {}: {}", filter, e);
                    }
                }
                if let Some(topic) = &presence_topic {
                    if let Err(e) = client.try_publish(
                        topic.clone(),
                        QoS::AtLeastOnce,
                        true,
                        StatusPayload::online().encode(),
                    ) {
                        error!("Failed to announce presence on {}: {}", topic, e);
                    }
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let mut message = BusMessage::new(publish.topic.clone(), publish.payload.to_vec());
                message.retain = publish.retain;
                debug!("Received {}", message);
                // This loop also drives keep-alives and outgoing publishes; it
                // must not wait on the consumer.
                match inbound_tx.try_send(message) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(message)) => {
                        warn!("Inbound queue full, dropping message on {}", message.topic)
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        debug!("Inbound receiver dropped; discarding message")
                    }
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                info!("MQTT disconnect sent");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(
                    "MQTT connection error: {}. Reconnecting in {:?}",
                    e, reconnect_delay
                );
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(reconnect_delay) => {}
                }
            }
        }
    }

    debug!("MQTT event loop finished");
}

#[async_trait]
impl BusClient for MqttBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), BusError> {
        if self.shutdown.is_cancelled() {
            return Err(BusError::Closed);
        }
        self.client
            .publish(topic, QoS::AtLeastOnce, retain, payload)
            .await?;
        debug!("Queued publish to {}", topic);
        Ok(())
    }

    fn try_publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), BusError> {
        if self.shutdown.is_cancelled() {
            return Err(BusError::Closed);
        }
        self.client
            .try_publish(topic, QoS::AtLeastOnce, retain, payload)?;
        Ok(())
    }

    async fn subscribe(&self, filter: &str) -> Result<(), BusError> {
        {
            let mut subscriptions = lock(&self.subscriptions);
            if !subscriptions.iter().any(|f| f == filter) {
                subscriptions.push(filter.to_string());
            }
        }
        self.client.subscribe(filter, QoS::AtLeastOnce).await?;
        info!("Subscribed to {}", filter);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BusError> {
        if self.shutdown.is_cancelled() {
            return Ok(());
        }
        if let Some(topic) = &self.presence_topic {
            if let Err(e) = self
                .client
                .publish(
                    topic.clone(),
                    QoS::AtLeastOnce,
                    true,
                    StatusPayload::offline().encode(),
                )
                .await
            {
                warn!("Failed to publish offline state: {}", e);
            }
        }
        let result = self.client.disconnect().await;

        let task = lock(&self.event_task).take();
        if let Some(mut task) = task {
            if tokio::time::timeout(Duration::from_secs(2), &mut task)
                .await
                .is_err()
            {
                warn!("MQTT event loop did not stop in time");
                task.abort();
            }
        }
        self.shutdown.cancel();
        info!("MQTT client disconnected");
        result.map_err(BusError::from)
    }
}

impl Drop for MqttBus {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

//! # Routing Module
//!
//! Turns inbound bus messages into work. Classification is a pure function
//! of the message; [`MessageRouter`] then hands the result to whichever
//! handler this process has:
//!
//! ```text
//! BusMessage ──► classify ──┬─ Telemetry ──► StoreSync      (server)
//!                           ├─ Status    ──► StoreSync      (server)
//!                           └─ Command   ──► CommandGateway (transmitter)
//! ```
//!
//! Routing never fails outward. A message that cannot be classified is
//! logged and dropped, and the next message is handled as usual.

pub mod command_gateway;

use crate::mqtt::payload::{CommandPayload, Payload, PayloadError, StatusPayload, TelemetryPayload};
use crate::mqtt::topic::{CommandTopic, StatusTopic, TelemetryTopic, Topic, TopicError};
use crate::mqtt::BusMessage;
use crate::store::sync::{status_update, telemetry_update};
use crate::store::StoreSync;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use command_gateway::{CommandGateway, CommandOutcome};

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("Ignoring topic with unknown prefix '{0}'")]
    UnknownPrefix(String),

    #[error("Malformed topic '{topic}': {source}")]
    MalformedTopic {
        topic: String,
        #[source]
        source: TopicError,
    },

    #[error("Malformed payload on '{topic}': {source}")]
    MalformedPayload {
        topic: String,
        #[source]
        source: PayloadError,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum RoutedMessage {
    Telemetry {
        topic: TelemetryTopic,
        payload: TelemetryPayload,
    },
    Status {
        topic: StatusTopic,
        payload: StatusPayload,
    },
    Command {
        topic: CommandTopic,
        payload: CommandPayload,
    },
}

fn decode<P: Payload>(message: &BusMessage) -> Result<P, RouteError> {
    P::decode(&message.payload).map_err(|source| RouteError::MalformedPayload {
        topic: message.topic.clone(),
        source,
    })
}

/// Parses topic and payload of one message.
pub fn classify(message: &BusMessage) -> Result<RoutedMessage, RouteError> {
    let topic = Topic::parse(&message.topic).map_err(|source| match source {
        TopicError::UnknownPrefix(prefix) => RouteError::UnknownPrefix(prefix),
        source => RouteError::MalformedTopic {
            topic: message.topic.clone(),
            source,
        },
    })?;

    Ok(match topic {
        Topic::Telemetry(topic) => RoutedMessage::Telemetry {
            topic,
            payload: decode(message)?,
        },
        Topic::Status(topic) => RoutedMessage::Status {
            topic,
            payload: decode(message)?,
        },
        Topic::Command(topic) => RoutedMessage::Command {
            topic,
            payload: decode(message)?,
        },
    })
}

/// Dispatches classified messages to the handlers this process owns.
#[derive(Default)]
pub struct MessageRouter {
    store_sync: Option<Arc<StoreSync>>,
    gateway: Option<Arc<CommandGateway>>,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_store_sync(mut self, store_sync: Arc<StoreSync>) -> Self {
        self.store_sync = Some(store_sync);
        self
    }

    pub fn with_command_gateway(mut self, gateway: Arc<CommandGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    /// Handles one message. Failures are logged here and go no further.
    ///
    /// Commands are handed to their station's queue and not awaited, so a
    /// slow write holds up neither this router nor other stations.
    pub async fn route(&self, message: &BusMessage) {
        let routed = match classify(message) {
            Ok(routed) => routed,
            Err(e @ RouteError::UnknownPrefix(_)) => {
                debug!("{}", e);
                return;
            }
            Err(e) => {
                warn!("Dropping message: {}", e);
                return;
            }
        };

        match routed {
            RoutedMessage::Telemetry { topic, payload } => match &self.store_sync {
                Some(sync) => {
                    debug!("Telemetry {} = {}", topic, payload.value);
                    sync.submit(telemetry_update(&topic, &payload, message.received_at))
                        .await;
                }
                None => debug!("No telemetry handler for {}", topic),
            },
            RoutedMessage::Status { topic, payload } => match &self.store_sync {
                Some(sync) => {
                    debug!("Status {} = {}", topic.emitter, payload.state.as_str());
                    sync.submit(status_update(&topic, &payload, message.received_at))
                        .await;
                }
                None => debug!("No status handler for {}", topic),
            },
            RoutedMessage::Command { topic, payload } => match &self.gateway {
                Some(gateway) => {
                    gateway
                        .dispatch(topic.station, &topic.address, payload.value)
                        .await;
                }
                None => debug!("No command handler for {}", topic),
            },
        }
    }

    /// Routes inbound messages in arrival order until cancelled or the bus
    /// closes the channel.
    pub async fn run(self, mut inbound: mpsc::Receiver<BusMessage>, cancel: CancellationToken) {
        info!("Message router started");
        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => break,
                message = inbound.recv() => message,
            };
            match message {
                Some(message) => self.route(&message).await,
                None => break,
            }
        }
        info!("Message router stopped");
    }
}

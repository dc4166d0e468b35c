//! In-process broker.
//!
//! Implements enough of MQTT for loopback runs and tests: `+`/`#` filters,
//! retained messages, and last-will delivery when a session is dropped
//! without a clean disconnect.

use super::client::{BusClient, BusError};
use super::message::BusMessage;
use super::topic::matches_filter;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, warn};

const INBOUND_CAPACITY: usize = 100;

struct Session {
    filters: Vec<String>,
    tx: mpsc::Sender<BusMessage>,
    will: Option<BusMessage>,
    open: bool,
}

#[derive(Default)]
struct BrokerState {
    sessions: Vec<Session>,
    retained: HashMap<String, BusMessage>,
    published: Vec<BusMessage>,
}

impl BrokerState {
    fn route(&mut self, message: BusMessage) {
        if message.retain {
            if message.payload.is_empty() {
                self.retained.remove(&message.topic);
            } else {
                self.retained.insert(message.topic.clone(), message.clone());
            }
        }
        for session in self.sessions.iter().filter(|s| s.open) {
            if session
                .filters
                .iter()
                .any(|f| matches_filter(f, &message.topic))
            {
                if let Err(e) = session.tx.try_send(message.clone()) {
                    warn!("Dropping message for slow subscriber on {}: {}", message.topic, e);
                }
            }
        }
        self.published.push(message);
    }
}

#[derive(Clone, Default)]
pub struct MemoryBus {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Opens a session. The optional will is published if the session is
    /// [`MemoryBusClient::drop_connection`]ed instead of disconnected.
    pub fn connect(&self, will: Option<BusMessage>) -> (MemoryBusClient, mpsc::Receiver<BusMessage>) {
        let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
        let mut state = self.state();
        state.sessions.push(Session {
            filters: Vec::new(),
            tx,
            will,
            open: true,
        });
        let session = state.sessions.len() - 1;
        debug!("Memory bus session {} opened", session);
        (
            MemoryBusClient {
                bus: self.clone(),
                session,
            },
            rx,
        )
    }

    /// Every message published so far, in order.
    pub fn published(&self) -> Vec<BusMessage> {
        self.state().published.clone()
    }

    pub fn published_matching(&self, filter: &str) -> Vec<BusMessage> {
        self.state()
            .published
            .iter()
            .filter(|m| matches_filter(filter, &m.topic))
            .cloned()
            .collect()
    }

    pub fn retained(&self, topic: &str) -> Option<BusMessage> {
        self.state().retained.get(topic).cloned()
    }
}

pub struct MemoryBusClient {
    bus: MemoryBus,
    session: usize,
}

impl MemoryBusClient {
    /// Ends the session ungracefully, publishing its will.
    pub fn drop_connection(&self) {
        let mut state = self.bus.state();
        let will = match state.sessions.get_mut(self.session) {
            Some(session) if session.open => {
                session.open = false;
                session.will.take()
            }
            _ => None,
        };
        if let Some(will) = will {
            state.route(will);
        }
    }

    fn is_open(&self) -> bool {
        self.bus
            .state()
            .sessions
            .get(self.session)
            .is_some_and(|s| s.open)
    }
}

#[async_trait]
impl BusClient for MemoryBusClient {
    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), BusError> {
        self.try_publish(topic, payload, retain)
    }

    fn try_publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), BusError> {
        if !self.is_open() {
            return Err(BusError::Closed);
        }
        let mut message = BusMessage::new(topic, payload);
        message.retain = retain;
        self.bus.state().route(message);
        Ok(())
    }

    async fn subscribe(&self, filter: &str) -> Result<(), BusError> {
        let mut state = self.bus.state();
        let retained: Vec<BusMessage> = state
            .retained
            .values()
            .filter(|m| matches_filter(filter, &m.topic))
            .cloned()
            .collect();
        let session = state
            .sessions
            .get_mut(self.session)
            .filter(|s| s.open)
            .ok_or(BusError::Closed)?;
        session.filters.push(filter.to_string());
        for message in retained {
            if let Err(e) = session.tx.try_send(message) {
                warn!("Dropping retained message for new subscriber on {}: {}", filter, e);
            }
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BusError> {
        if let Some(session) = self.bus.state().sessions.get_mut(self.session) {
            session.open = false;
            session.will = None;
        }
        Ok(())
    }
}

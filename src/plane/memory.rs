//! In-memory Plane
//!
//! Loopback plane that records every publish and keeps the set of active
//! subscriptions. Messages can be injected as if a broker had delivered
//! them; only topics with an active subscription reach the dispatch
//! channel, matching what a broker would do.

use std::collections::HashSet;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use super::{InboundMessage, Plane, PlaneError, PlaneStatus};

/// In-memory plane
pub struct MemoryPlane {
    name: String,
    state: Mutex<MemoryState>,
    inbound_tx: mpsc::Sender<InboundMessage>,
}

/// Capacity of the dispatch channel
const INBOUND_CAPACITY: usize = 1024;

#[derive(Default)]
struct MemoryState {
    closed: bool,
    published: Vec<InboundMessage>,
    subscriptions: Vec<String>,
    failing_filters: HashSet<String>,
}

impl MemoryPlane {
    /// Create a plane and the receiver its dispatch task drains
    pub fn new(name: impl Into<String>) -> (Self, mpsc::Receiver<InboundMessage>) {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let plane = Self {
            name: name.into(),
            state: Mutex::new(MemoryState::default()),
            inbound_tx,
        };
        (plane, inbound_rx)
    }

    /// Deliver a message as if the broker had sent it
    ///
    /// Returns false when no active subscription covers the topic or the
    /// dispatch channel is full.
    pub fn inject(&self, topic: &str, payload: impl Into<Bytes>) -> bool {
        if !self.is_subscribed(topic) {
            debug!("Plane '{}': No subscription for {}", self.name, topic);
            return false;
        }
        self.inbound_tx
            .try_send(InboundMessage::new(topic, payload))
            .is_ok()
    }

    /// Make every later subscribe to `filter` fail
    pub fn fail_subscribe(&self, filter: &str) {
        self.state.lock().failing_filters.insert(filter.to_string());
    }

    /// All publishes so far, oldest first
    pub fn published(&self) -> Vec<InboundMessage> {
        self.state.lock().published.clone()
    }

    /// Publishes so far on one topic
    pub fn published_on(&self, topic: &str) -> Vec<Bytes> {
        self.state
            .lock()
            .published
            .iter()
            .filter(|m| m.topic == topic)
            .map(|m| m.payload.clone())
            .collect()
    }

    /// Active subscriptions in subscribe order
    pub fn subscriptions(&self) -> Vec<String> {
        self.state.lock().subscriptions.clone()
    }

    /// Check if a topic is currently subscribed
    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.state.lock().subscriptions.iter().any(|s| s == topic)
    }
}

#[async_trait]
impl Plane for MemoryPlane {
    fn name(&self) -> &str {
        &self.name
    }

    fn status(&self) -> PlaneStatus {
        if self.state.lock().closed {
            PlaneStatus::Closed
        } else {
            PlaneStatus::Connected
        }
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), PlaneError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(PlaneError::Closed);
        }
        state.published.push(InboundMessage::new(topic, payload));
        Ok(())
    }

    async fn subscribe(&self, filter: &str) -> Result<(), PlaneError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(PlaneError::Closed);
        }
        if state.failing_filters.contains(filter) {
            return Err(PlaneError::Rejected(format!("subscribe to {}", filter)));
        }
        if !state.subscriptions.iter().any(|s| s == filter) {
            state.subscriptions.push(filter.to_string());
        }
        Ok(())
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), PlaneError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(PlaneError::Closed);
        }
        state.subscriptions.retain(|s| s != filter);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), PlaneError> {
        self.state.lock().closed = true;
        Ok(())
    }
}

//! Plane Abstraction
//!
//! A plane is one publish/subscribe connection used by the silo: the
//! virtual-plane control connection, the virtual-plane data connection,
//! or the local broker connection. The silo core only talks to planes
//! through the [`Plane`] trait, so the MQTT transport and the in-memory
//! loopback used in tests are interchangeable.
//!
//! Inbound traffic does not go through the trait. Each plane hands its
//! received messages to an mpsc channel that a single dispatch task
//! drains, which keeps handlers for one connection strictly sequential.

mod memory;
mod mqtt;

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;

pub use memory::MemoryPlane;
pub use mqtt::MqttPlane;

/// Error type for plane operations
#[derive(Debug)]
pub enum PlaneError {
    /// Connection to the broker failed or was lost
    ConnectionLost(String),
    /// Broker or client rejected the operation
    Rejected(String),
    /// The plane was disconnected and accepts no more requests
    Closed,
    /// Other error
    Other(String),
}

impl fmt::Display for PlaneError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlaneError::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            PlaneError::Rejected(msg) => write!(f, "Rejected: {}", msg),
            PlaneError::Closed => write!(f, "Plane closed"),
            PlaneError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for PlaneError {}

/// Status of a plane connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaneStatus {
    /// Not connected yet
    Disconnected,
    /// Currently connecting
    Connecting,
    /// Connected and operational
    Connected,
    /// Disconnected on request or after a transport failure, will not reconnect
    Closed,
}

/// A message received on a plane
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Topic the message was published on
    pub topic: String,
    /// Raw payload
    pub payload: Bytes,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// One publish/subscribe connection
///
/// Implementations must be safe to call from any task: the control,
/// data and local dispatch tasks all publish to planes they do not own.
#[async_trait]
pub trait Plane: Send + Sync {
    /// Get the name of this plane (used in logs)
    fn name(&self) -> &str;

    /// Get the current connection status
    fn status(&self) -> PlaneStatus;

    /// Publish a payload on a topic
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), PlaneError>;

    /// Subscribe to a topic filter
    async fn subscribe(&self, filter: &str) -> Result<(), PlaneError>;

    /// Unsubscribe from a topic filter
    async fn unsubscribe(&self, filter: &str) -> Result<(), PlaneError>;

    /// Disconnect gracefully; the plane accepts no requests afterwards
    async fn disconnect(&self) -> Result<(), PlaneError>;
}

//! MQTT Plane
//!
//! Connects one plane to an MQTT broker with rumqttc. The connection task
//! polls the event loop, tracks the connection status and hands every
//! received PUBLISH to the plane's dispatch channel.
//!
//! There is no reconnect: the first connection error ends the task with
//! [`PlaneError::ConnectionLost`] and the silo runtime exits with it.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use rumqttc::{
    AsyncClient, ClientError, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet,
    QoS,
};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{InboundMessage, Plane, PlaneError, PlaneStatus};
use crate::config::PlaneConfig;

/// MQTT-backed plane
pub struct MqttPlane {
    /// Plane configuration
    config: PlaneConfig,
    /// Request handle to the rumqttc event loop
    client: AsyncClient,
    /// Current connection status
    status: Arc<RwLock<PlaneStatus>>,
    /// QoS used for every publish and subscribe
    qos: QoS,
}

impl MqttPlane {
    /// Spawn the connection task for a plane
    ///
    /// Returns the plane handle, the receiver of inbound messages, and the
    /// connection task. The task ends with `Ok(())` after a requested
    /// disconnect and with an error when the connection is lost.
    pub fn spawn(
        config: PlaneConfig,
    ) -> (
        Arc<Self>,
        mpsc::Receiver<InboundMessage>,
        JoinHandle<Result<(), PlaneError>>,
    ) {
        let (host, port) = config.parse_address();

        let mut options = MqttOptions::new(config.client_id.clone(), host, port);
        options.set_keep_alive(config.keep_alive);
        options.set_clean_session(true);
        options.set_max_packet_size(config.max_packet_size, config.max_packet_size);
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            options.set_credentials(username, password);
        }

        let (client, eventloop) = AsyncClient::new(options, config.channel_capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel(config.channel_capacity);
        let status = Arc::new(RwLock::new(PlaneStatus::Disconnected));
        let qos = qos_from_level(config.qos);

        let name = config.name.clone();
        let task_status = status.clone();
        let task = tokio::spawn(async move {
            Self::connection_loop(name, eventloop, task_status, inbound_tx).await
        });

        let plane = Arc::new(Self {
            config,
            client,
            status,
            qos,
        });

        (plane, inbound_rx, task)
    }

    /// Run the event loop until disconnect or connection loss
    async fn connection_loop(
        name: String,
        mut eventloop: EventLoop,
        status: Arc<RwLock<PlaneStatus>>,
        inbound_tx: mpsc::Sender<InboundMessage>,
    ) -> Result<(), PlaneError> {
        *status.write() = PlaneStatus::Connecting;
        debug!("Plane '{}': Connecting", name);

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(connack))) => {
                    if connack.code != ConnectReturnCode::Success {
                        *status.write() = PlaneStatus::Closed;
                        return Err(PlaneError::Rejected(format!(
                            "CONNACK failed: {:?}",
                            connack.code
                        )));
                    }
                    info!(
                        "Plane '{}': Connected (session_present={})",
                        name, connack.session_present
                    );
                    *status.write() = PlaneStatus::Connected;
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let message = InboundMessage {
                        topic: publish.topic,
                        payload: publish.payload,
                    };
                    if !forward_inbound(&name, &inbound_tx, message) {
                        debug!("Plane '{}': Dispatch channel closed", name);
                        *status.write() = PlaneStatus::Closed;
                        return Ok(());
                    }
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    warn!("Plane '{}': Received DISCONNECT", name);
                    *status.write() = PlaneStatus::Closed;
                    return Err(PlaneError::ConnectionLost(
                        "Remote disconnected".to_string(),
                    ));
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    info!("Plane '{}': Disconnected gracefully", name);
                    *status.write() = PlaneStatus::Closed;
                    return Ok(());
                }
                Ok(_) => {}
                Err(e) => {
                    if *status.read() == PlaneStatus::Closed {
                        return Ok(());
                    }
                    error!("Plane '{}': Connection failed: {}", name, e);
                    *status.write() = PlaneStatus::Closed;
                    return Err(PlaneError::ConnectionLost(e.to_string()));
                }
            }
        }
    }
}

#[async_trait]
impl Plane for MqttPlane {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn status(&self) -> PlaneStatus {
        *self.status.read()
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), PlaneError> {
        self.client
            .publish(topic, self.qos, false, payload.to_vec())
            .await
            .map_err(client_error)
    }

    async fn subscribe(&self, filter: &str) -> Result<(), PlaneError> {
        self.client
            .subscribe(filter, self.qos)
            .await
            .map_err(client_error)
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), PlaneError> {
        self.client.unsubscribe(filter).await.map_err(client_error)
    }

    async fn disconnect(&self) -> Result<(), PlaneError> {
        *self.status.write() = PlaneStatus::Closed;
        self.client.disconnect().await.map_err(client_error)
    }
}

/// Hand a received message to the dispatch task without waiting
///
/// The event loop must never block: dispatch tasks publish through other
/// planes' request queues, and waiting here could close a cycle. A full
/// channel drops the message. Returns false once the channel is closed.
fn forward_inbound(
    name: &str,
    inbound_tx: &mpsc::Sender<InboundMessage>,
    message: InboundMessage,
) -> bool {
    match inbound_tx.try_send(message) {
        Ok(()) => true,
        Err(TrySendError::Full(message)) => {
            warn!(
                "Plane '{}': Dispatch channel full, dropping message on {}",
                name, message.topic
            );
            true
        }
        Err(TrySendError::Closed(_)) => false,
    }
}

/// Map a configured QoS level onto rumqttc's QoS
fn qos_from_level(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

fn client_error(e: ClientError) -> PlaneError {
    PlaneError::ConnectionLost(e.to_string())
}

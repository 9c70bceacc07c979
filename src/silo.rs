//! Silo runtime
//!
//! Wires the control channel, data relay and local adapter to the three
//! planes and runs one dispatch task per plane. The runtime stops when the
//! silo is destroyed, on interrupt, on [`Silo::shutdown`], or when a plane
//! connection task fails.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::SiloConfig;
use crate::control::ControlChannel;
use crate::error::HandlerError;
use crate::local::LocalAdapter;
use crate::plane::{InboundMessage, Plane, PlaneError};
use crate::registry::SubscriptionRegistry;
use crate::relay::DataRelay;
use crate::topic::{Route, Router};

/// Identity of this silo on both planes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiloIdentity {
    pub silo_id: String,
    pub tenant_id: String,
    pub owner_id: String,
}

impl From<&SiloConfig> for SiloIdentity {
    fn from(config: &SiloConfig) -> Self {
        Self {
            silo_id: config.id.clone(),
            tenant_id: config.tenant_id.clone(),
            owner_id: config.owner_id.clone(),
        }
    }
}

/// Error type for the silo runtime
#[derive(Debug)]
pub enum SiloError {
    /// A plane connection failed
    Plane(PlaneError),
    /// Startup handshake failed
    Handler(HandlerError),
    /// Signal handling failed
    Io(std::io::Error),
    /// A task panicked or was cancelled
    Join(String),
}

impl fmt::Display for SiloError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SiloError::Plane(e) => write!(f, "Plane error: {}", e),
            SiloError::Handler(e) => write!(f, "Startup failed: {}", e),
            SiloError::Io(e) => write!(f, "IO error: {}", e),
            SiloError::Join(msg) => write!(f, "Task failed: {}", msg),
        }
    }
}

impl std::error::Error for SiloError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SiloError::Plane(e) => Some(e),
            SiloError::Handler(e) => Some(e),
            SiloError::Io(e) => Some(e),
            SiloError::Join(_) => None,
        }
    }
}

impl From<PlaneError> for SiloError {
    fn from(e: PlaneError) -> Self {
        SiloError::Plane(e)
    }
}

impl From<HandlerError> for SiloError {
    fn from(e: HandlerError) -> Self {
        SiloError::Handler(e)
    }
}

impl From<std::io::Error> for SiloError {
    fn from(e: std::io::Error) -> Self {
        SiloError::Io(e)
    }
}

/// Receivers of the three planes' inbound messages
pub struct Inbound {
    pub control: mpsc::Receiver<InboundMessage>,
    pub data: mpsc::Receiver<InboundMessage>,
    pub local: mpsc::Receiver<InboundMessage>,
}

/// Connection task of a plane
pub type TransportTask = JoinHandle<Result<(), PlaneError>>;

/// One running silo
pub struct Silo {
    control: Arc<ControlChannel>,
    relay: Arc<DataRelay>,
    router: Router,
    planes: Vec<Arc<dyn Plane>>,
    shutdown: broadcast::Sender<()>,
    /// Set once shutdown was requested, so a request made before `run`
    /// subscribes is not lost
    stopping: AtomicBool,
}

impl Silo {
    pub fn new(
        identity: SiloIdentity,
        control_plane: Arc<dyn Plane>,
        data_plane: Arc<dyn Plane>,
        local_plane: Arc<dyn Plane>,
    ) -> Self {
        let registry = Arc::new(SubscriptionRegistry::new());
        let local = Arc::new(LocalAdapter::new(
            local_plane.clone(),
            registry,
            identity.tenant_id.clone(),
        ));
        let relay = Arc::new(DataRelay::new(
            data_plane.clone(),
            local,
            identity.silo_id.clone(),
        ));
        let router = Router::new(&identity.silo_id, &identity.tenant_id);
        let control = Arc::new(ControlChannel::new(identity, control_plane.clone(), relay.clone()));
        let (shutdown, _) = broadcast::channel(1);

        Self {
            control,
            relay,
            router,
            planes: vec![control_plane, data_plane, local_plane],
            shutdown,
            stopping: AtomicBool::new(false),
        }
    }

    pub fn identity(&self) -> &SiloIdentity {
        self.control.identity()
    }

    pub fn control(&self) -> &Arc<ControlChannel> {
        &self.control
    }

    pub fn relay(&self) -> &Arc<DataRelay> {
        &self.relay
    }

    /// Mirrored thing IDs in creation order
    pub fn mirrored_things(&self) -> Vec<String> {
        self.control.mirrored_things()
    }

    /// Stop the silo; a silo not yet running stops as soon as `run` starts
    pub fn shutdown(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        let _ = self.shutdown.send(());
    }

    /// Run until destroyed, interrupted, shut down, or a transport fails
    ///
    /// `transports` are the plane connection tasks; the first one to end
    /// with an error stops the silo with that error.
    pub async fn run(&self, inbound: Inbound, transports: Vec<TransportTask>) -> Result<(), SiloError> {
        let mut shutdown_rx = self.shutdown.subscribe();
        let (failure_tx, mut failure_rx) = mpsc::channel(transports.len().max(1));
        for transport in transports {
            let failure_tx = failure_tx.clone();
            tokio::spawn(async move {
                let failure = match transport.await {
                    Ok(Ok(())) => return,
                    Ok(Err(e)) => SiloError::Plane(e),
                    Err(e) => SiloError::Join(e.to_string()),
                };
                let _ = failure_tx.send(failure).await;
            });
        }
        drop(failure_tx);

        let Inbound {
            control,
            data,
            local,
        } = inbound;
        let dispatchers = vec![
            self.spawn_control_dispatch(control),
            self.spawn_data_dispatch(data),
            self.spawn_local_dispatch(local),
        ];

        info!("Silo '{}' starting", self.identity().silo_id);
        let result = if self.stopping.load(Ordering::SeqCst) {
            info!("Silo '{}': Shutdown requested before start", self.identity().silo_id);
            Ok(())
        } else {
            match self.control.start().await {
                Ok(()) => {
                    tokio::select! {
                        _ = shutdown_rx.recv() => Ok(()),
                        Some(failure) = failure_rx.recv() => {
                            error!("Silo '{}': {}", self.identity().silo_id, failure);
                            Err(failure)
                        }
                        signal = tokio::signal::ctrl_c() => {
                            info!("Interrupt received, shutting down");
                            signal.map_err(SiloError::from)
                        }
                    }
                }
                Err(e) => Err(SiloError::from(e)),
            }
        };

        self.shutdown();
        for dispatcher in dispatchers {
            if let Err(e) = dispatcher.await {
                warn!("Dispatch task failed: {}", e);
            }
        }
        for plane in &self.planes {
            if let Err(e) = plane.disconnect().await {
                debug!("Plane '{}': Disconnect failed: {}", plane.name(), e);
            }
        }
        info!("Silo '{}' stopped", self.identity().silo_id);
        result
    }

    fn spawn_control_dispatch(&self, mut rx: mpsc::Receiver<InboundMessage>) -> JoinHandle<()> {
        let control = self.control.clone();
        let router = self.router.clone();
        let shutdown = self.shutdown.clone();
        let mut shutdown_rx = self.shutdown.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    _ = shutdown_rx.recv() => break,
                    message = rx.recv() => {
                        let Some(message) = message else { break };
                        let outcome = match router.classify_virtual(&message.topic) {
                            Route::SiloControl => {
                                control.handle_control_message(&message.payload).await
                            }
                            Route::ThingControl { thing_id } => {
                                control
                                    .handle_thing_control_message(&thing_id, &message.payload)
                                    .await
                            }
                            _ => {
                                debug!("Control: Unrouted message on {}", message.topic);
                                continue;
                            }
                        };
                        debug!("Control: {} -> {}", message.topic, outcome);

                        if control.is_destroyed() {
                            let _ = shutdown.send(());
                            break;
                        }
                    }
                }
            }
        })
    }

    fn spawn_data_dispatch(&self, mut rx: mpsc::Receiver<InboundMessage>) -> JoinHandle<()> {
        let control = self.control.clone();
        let relay = self.relay.clone();
        let router = self.router.clone();
        let mut shutdown_rx = self.shutdown.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    _ = shutdown_rx.recv() => break,
                    message = rx.recv() => {
                        let Some(message) = message else { break };
                        let Route::ThingData { thing_id } = router.classify_virtual(&message.topic) else {
                            debug!("Data: Unrouted message on {}", message.topic);
                            continue;
                        };
                        if !control.is_mirrored(&thing_id) {
                            debug!("Data: Dropping data of unmirrored thing '{}'", thing_id);
                            continue;
                        }
                        if let Err(e) = relay.on_virtual_data(Some(&thing_id), &message.payload).await {
                            warn!("Data: Failed to relay data of thing '{}': {}", thing_id, e);
                        }
                    }
                }
            }
        })
    }

    fn spawn_local_dispatch(&self, mut rx: mpsc::Receiver<InboundMessage>) -> JoinHandle<()> {
        let control = self.control.clone();
        let relay = self.relay.clone();
        let router = self.router.clone();
        let mut shutdown_rx = self.shutdown.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    _ = shutdown_rx.recv() => break,
                    message = rx.recv() => {
                        let Some(message) = message else { break };
                        let Route::LocalCommand(command) = router.classify_local(&message.topic) else {
                            debug!("Local: Unrouted message on {}", message.topic);
                            continue;
                        };
                        if !control.is_mirrored(&command.thing_id) {
                            debug!("Local: Dropping command for unmirrored thing '{}'", command.thing_id);
                            continue;
                        }
                        let request = relay
                            .local()
                            .on_command_request(command, &message.topic, &message.payload);
                        if let Err(e) = relay.publish_to_virtual(&request).await {
                            warn!("Local: Failed to forward command {}: {}", message.topic, e);
                        }
                    }
                }
            }
        })
    }
}

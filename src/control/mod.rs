//! Control Channel
//!
//! Runs the silo's command protocol on the virtual control plane. Each
//! control message is decoded, dispatched on its `command` tag and answered
//! with an [`Outcome`]. Handler errors never escape: they are logged and
//! reported as [`Outcome::InvalidCommand`].
//!
//! Lifecycle of a mirrored thing:
//! - `addVThing` subscribes to `vThing/{id}/data_out` on the data plane and
//!   `vThing/{id}/c_out` on the control plane, records the thing, and asks
//!   it for its last context with `getContextRequest`
//! - `deleteVThing` (from the orchestrator or from the thing itself)
//!   withdraws both subscriptions and every local command subscription
//! - `restoreVThings` replays `addVThing` for each listed thing
//! - `destroyVSilo` acks, closes the control plane and stops all dispatch

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::error::{HandlerError, HandlerResult};
use crate::message::{thing_id_of, ControlCommand, ControlMessage, Notification};
use crate::plane::Plane;
use crate::relay::DataRelay;
use crate::silo::SiloIdentity;
use crate::topic;


/// What the control channel did with a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    CreatingVThing,
    DeletingVThing,
    DestroyingVSilo,
    ReceivedContextResponse,
    ReceivedRestoreVThings,
    InvalidCommand,
    /// A thing-side command other than `deleteVThing`
    CommandNotManaged,
    /// The silo was destroyed; nothing is dispatched any more
    Ignored,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Outcome::CreatingVThing => "creating vThing",
            Outcome::DeletingVThing => "deleting vThing",
            Outcome::DestroyingVSilo => "destroying vSilo",
            Outcome::ReceivedContextResponse => "received context response",
            Outcome::ReceivedRestoreVThings => "received restore virtual things",
            Outcome::InvalidCommand => "invalid command",
            Outcome::CommandNotManaged => "command not managed",
            Outcome::Ignored => "ignored",
        };
        f.write_str(text)
    }
}

/// Control channel of one silo
pub struct ControlChannel {
    identity: SiloIdentity,
    control: Arc<dyn Plane>,
    relay: Arc<DataRelay>,
    /// Mirrored thing IDs in creation order
    things: Mutex<Vec<String>>,
    destroyed: AtomicBool,
}

impl ControlChannel {
    pub fn new(identity: SiloIdentity, control: Arc<dyn Plane>, relay: Arc<DataRelay>) -> Self {
        Self {
            identity,
            control,
            relay,
            things: Mutex::new(Vec::new()),
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn identity(&self) -> &SiloIdentity {
        &self.identity
    }

    /// Subscribe to the silo's command topic and announce readiness
    ///
    /// The `restoreVThingsAck` tells the orchestrator it can send the list
    /// of things to restore after a restart.
    pub async fn start(&self) -> HandlerResult<()> {
        let command_topic = topic::silo_control_in(&self.identity.silo_id);
        self.control.subscribe(&command_topic).await?;
        info!("Control: Subscribed to {}", command_topic);

        self.notify(Notification::RestoreVThingsAck {
            owner_id: self.identity.owner_id.clone(),
            silo_id: self.identity.silo_id.clone(),
        })
        .await
    }

    /// Handle a message received on `vSilo/{silo}/c_in`
    pub async fn handle_control_message(&self, raw: &[u8]) -> Outcome {
        if self.is_destroyed() {
            debug!("Control: Silo destroyed, ignoring message");
            return Outcome::Ignored;
        }

        let message = match ControlMessage::decode(raw) {
            Ok(message) => message,
            Err(e) => {
                warn!("Control: Invalid control message: {}", e);
                return Outcome::InvalidCommand;
            }
        };

        let Some(command) = message.command() else {
            warn!("Control: Unknown command '{}'", message.tag);
            return Outcome::InvalidCommand;
        };
        info!("Control: Received {}", command.as_str());

        match self.dispatch(command, message).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Control: {} failed: {}", command.as_str(), e);
                Outcome::InvalidCommand
            }
        }
    }

    /// Handle a message a thing published on `vThing/{thing}/c_out`
    ///
    /// Only `deleteVThing` is acted on.
    pub async fn handle_thing_control_message(&self, thing_id: &str, raw: &[u8]) -> Outcome {
        if self.is_destroyed() {
            return Outcome::Ignored;
        }

        let message = match ControlMessage::decode(raw) {
            Ok(message) => message,
            Err(e) => {
                warn!("Control: Invalid message from thing '{}': {}", thing_id, e);
                return Outcome::InvalidCommand;
            }
        };

        match message.command() {
            Some(ControlCommand::DeleteVThing) => match message.thing_id() {
                Ok(target) => {
                    info!("Control: Thing '{}' requested deletion of '{}'", thing_id, target);
                    self.delete_thing(target).await;
                    Outcome::DeletingVThing
                }
                Err(e) => {
                    warn!("Control: Invalid message from thing '{}': {}", thing_id, e);
                    Outcome::InvalidCommand
                }
            },
            _ => {
                debug!(
                    "Control: Command '{}' from thing '{}' not managed",
                    message.tag, thing_id
                );
                Outcome::CommandNotManaged
            }
        }
    }

    async fn dispatch(&self, command: ControlCommand, message: ControlMessage) -> HandlerResult<Outcome> {
        match command {
            ControlCommand::AddVThing => {
                self.add_thing(message.thing_id()?).await;
                Ok(Outcome::CreatingVThing)
            }
            ControlCommand::DeleteVThing => {
                self.delete_thing(message.thing_id()?).await;
                Ok(Outcome::DeletingVThing)
            }
            ControlCommand::DestroyVSilo => {
                self.destroy().await;
                Ok(Outcome::DestroyingVSilo)
            }
            ControlCommand::GetContextResponse => {
                let envelope = message.into_envelope()?;
                let thing_id = envelope
                    .meta
                    .thing_id
                    .clone()
                    .ok_or(HandlerError::MissingField("vThingID"))?;
                if !self.is_mirrored(&thing_id) {
                    debug!("Control: Dropping context of unmirrored thing '{}'", thing_id);
                    return Ok(Outcome::ReceivedContextResponse);
                }
                self.relay.relay_envelope(Some(&thing_id), envelope).await?;
                Ok(Outcome::ReceivedContextResponse)
            }
            ControlCommand::RestoreVThings => {
                self.restore_things(message.things()?).await;
                Ok(Outcome::ReceivedRestoreVThings)
            }
        }
    }

    /// Mirror a thing
    ///
    /// Subscriptions are all-or-nothing: when the control subscription
    /// fails the data subscription is withdrawn and the thing is not
    /// recorded. Every step is safe to repeat. Returns whether the thing is
    /// mirrored afterwards.
    pub async fn add_thing(&self, thing_id: &str) -> bool {
        if let Err(e) = self.relay.local().create_thing(thing_id) {
            error!("Control: Cannot create thing '{}': {}", thing_id, e);
            return false;
        }

        let data_topic = topic::thing_data_out(thing_id);
        if let Err(e) = self.relay.plane().subscribe(&data_topic).await {
            error!("Control: Failed to subscribe to {}: {}", data_topic, e);
            return false;
        }

        let control_topic = topic::thing_control_out(thing_id);
        if let Err(e) = self.control.subscribe(&control_topic).await {
            error!("Control: Failed to subscribe to {}: {}", control_topic, e);
            if let Err(e) = self.relay.plane().unsubscribe(&data_topic).await {
                warn!("Control: Failed to withdraw {}: {}", data_topic, e);
            }
            return false;
        }

        {
            let mut things = self.things.lock();
            if !things.iter().any(|t| t == thing_id) {
                things.push(thing_id.to_string());
            }
        }
        info!("Control: Mirroring thing '{}'", thing_id);

        let request = Notification::GetContextRequest {
            owner_id: self.identity.owner_id.clone(),
            silo_id: self.identity.silo_id.clone(),
            thing_id: thing_id.to_string(),
        };
        if let Err(e) = self.publish(&topic::thing_control_in(thing_id), &request).await {
            warn!("Control: getContextRequest to '{}' failed: {}", thing_id, e);
        }
        true
    }

    /// Stop mirroring a thing and drop all of its subscriptions
    pub async fn delete_thing(&self, thing_id: &str) {
        let data_topic = topic::thing_data_out(thing_id);
        if let Err(e) = self.relay.plane().unsubscribe(&data_topic).await {
            warn!("Control: Failed to unsubscribe {}: {}", data_topic, e);
        }
        let control_topic = topic::thing_control_out(thing_id);
        if let Err(e) = self.control.unsubscribe(&control_topic).await {
            warn!("Control: Failed to unsubscribe {}: {}", control_topic, e);
        }

        self.things.lock().retain(|t| t != thing_id);
        self.relay.local().delete_thing(thing_id).await;
        info!("Control: Stopped mirroring thing '{}'", thing_id);
    }

    /// Replay `addVThing` for every listed entry that names a thing
    async fn restore_things(&self, things: &[Value]) {
        for entry in things {
            match entry.as_object().and_then(thing_id_of) {
                Some(thing_id) => {
                    self.add_thing(thing_id).await;
                }
                None => warn!("Control: Skipping restore entry without vThingID: {}", entry),
            }
        }
    }

    /// Ack the destroy request and close the control plane
    ///
    /// The silo is marked destroyed first so no message queued behind this
    /// one is dispatched.
    async fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);

        let ack = Notification::DestroyVSiloAck {
            owner_id: self.identity.owner_id.clone(),
            silo_id: self.identity.silo_id.clone(),
        };
        if let Err(e) = self.notify(ack).await {
            error!("Control: Failed to send destroyVSiloAck: {}", e);
        }
        if let Err(e) = self.control.disconnect().await {
            warn!("Control: Disconnect failed: {}", e);
        }
        info!("Control: Silo '{}' destroyed", self.identity.silo_id);
    }

    /// Check if `destroyVSilo` has been handled
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Check if a thing is currently mirrored
    pub fn is_mirrored(&self, thing_id: &str) -> bool {
        self.things.lock().iter().any(|t| t == thing_id)
    }

    /// Mirrored thing IDs in creation order
    pub fn mirrored_things(&self) -> Vec<String> {
        self.things.lock().clone()
    }

    /// Publish a notification on `vSilo/{silo}/c_out`
    async fn notify(&self, notification: Notification) -> HandlerResult<()> {
        let out_topic = topic::silo_control_out(&self.identity.silo_id);
        self.publish(&out_topic, &notification).await
    }

    async fn publish(&self, topic: &str, notification: &Notification) -> HandlerResult<()> {
        self.control.publish(topic, notification.to_bytes()?).await?;
        Ok(())
    }
}

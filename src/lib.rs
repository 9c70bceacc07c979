//! vSilo - virtual silo controller
//!
//! Mirrors vThings of the virtual IoT plane onto a local MQTT broker.
//! Entity data published by a thing reaches tenants under
//! `{tenant}/{thing}/{entity}`, and commands tenants publish on
//! `{tenant}/{thing}/{entity}/{command}` are sent back to the thing.

pub mod config;
pub mod control;
pub mod entity_id;
pub mod error;
pub mod local;
pub mod message;
pub mod plane;
pub mod registry;
pub mod relay;
pub mod silo;
pub mod topic;

pub use config::Config;
pub use control::{ControlChannel, Outcome};
pub use error::HandlerError;
pub use local::LocalAdapter;
pub use plane::{InboundMessage, MemoryPlane, MqttPlane, Plane, PlaneError, PlaneStatus};
pub use registry::SubscriptionRegistry;
pub use relay::DataRelay;
pub use silo::{Inbound, Silo, SiloError, SiloIdentity};

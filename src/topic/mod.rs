//! Topic grammar and routing
//!
//! Builds every topic the silo publishes or subscribes to, and classifies
//! inbound topics into a closed [`Route`] that the dispatch tasks match on.
//!
//! Virtual plane:
//! - `vSilo/{siloID}/c_in`, `vSilo/{siloID}/c_out`
//! - `vThing/{thingID}/data_out`, `vThing/{thingID}/data_in`
//! - `vThing/{thingID}/c_out`, `vThing/{thingID}/c_in`
//!
//! Local plane:
//! - `{tenantID}/{thingID}/{entityID}` for entity data
//! - `{tenantID}/{thingID}/{entityID}/{command}` for reverse commands
//!
//! Thing IDs may contain `/`; entity IDs and command names are single levels.

pub const SILO_PREFIX: &str = "vSilo";
pub const THING_PREFIX: &str = "vThing";
pub const DATA_OUT_SUFFIX: &str = "data_out";
pub const DATA_IN_SUFFIX: &str = "data_in";
pub const CONTROL_IN_SUFFIX: &str = "c_in";
pub const CONTROL_OUT_SUFFIX: &str = "c_out";

/// Control topic the orchestrator publishes silo commands on
pub fn silo_control_in(silo_id: &str) -> String {
    format!("{}/{}/{}", SILO_PREFIX, silo_id, CONTROL_IN_SUFFIX)
}

/// Control topic the silo publishes its acks on
pub fn silo_control_out(silo_id: &str) -> String {
    format!("{}/{}/{}", SILO_PREFIX, silo_id, CONTROL_OUT_SUFFIX)
}

/// Data published by a thing
pub fn thing_data_out(thing_id: &str) -> String {
    format!("{}/{}/{}", THING_PREFIX, thing_id, DATA_OUT_SUFFIX)
}

/// Data sent to a thing (actuation)
pub fn thing_data_in(thing_id: &str) -> String {
    format!("{}/{}/{}", THING_PREFIX, thing_id, DATA_IN_SUFFIX)
}

/// Control messages published by a thing
pub fn thing_control_out(thing_id: &str) -> String {
    format!("{}/{}/{}", THING_PREFIX, thing_id, CONTROL_OUT_SUFFIX)
}

/// Control messages sent to a thing
pub fn thing_control_in(thing_id: &str) -> String {
    format!("{}/{}/{}", THING_PREFIX, thing_id, CONTROL_IN_SUFFIX)
}

/// Local topic carrying an entity's data
pub fn local_entity(tenant_id: &str, thing_id: &str, entity_id: &str) -> String {
    format!("{}/{}/{}", tenant_id, thing_id, entity_id)
}

/// Local topic a tenant publishes commands for an entity on
pub fn local_command(tenant_id: &str, thing_id: &str, entity_id: &str, command: &str) -> String {
    format!("{}/{}/{}/{}", tenant_id, thing_id, entity_id, command)
}

/// Prefix shared by all local topics of one thing, including the trailing `/`
pub fn local_thing_prefix(tenant_id: &str, thing_id: &str) -> String {
    format!("{}/{}/", tenant_id, thing_id)
}

/// A parsed local command topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTopic {
    pub thing_id: String,
    pub entity_id: String,
    pub command: String,
}

/// Parse `{tenant}/{thing...}/{entity}/{command}`
///
/// The last two levels are the entity and command; everything between the
/// tenant and those is the thing ID.
pub fn parse_command_topic(tenant_id: &str, topic: &str) -> Option<CommandTopic> {
    let rest = topic.strip_prefix(tenant_id)?.strip_prefix('/')?;
    let (rest, command) = rest.rsplit_once('/')?;
    let (thing_id, entity_id) = rest.rsplit_once('/')?;

    if thing_id.is_empty() || entity_id.is_empty() || command.is_empty() {
        return None;
    }

    Some(CommandTopic {
        thing_id: thing_id.to_string(),
        entity_id: entity_id.to_string(),
        command: command.to_string(),
    })
}

/// Validate a name used as one or more topic levels (thing IDs, entity IDs)
///
/// Names:
/// - Must be at least 1 character
/// - Must not contain null character
/// - Must not contain wildcards (+ or #)
pub fn validate_topic_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("topic name cannot be empty");
    }

    if name.contains('\0') {
        return Err("topic name cannot contain null character");
    }

    if name.contains(['+', '#']) {
        return Err("topic name cannot contain wildcards");
    }

    Ok(())
}

/// Where an inbound message is dispatched
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Silo command from the orchestrator (`vSilo/{silo}/c_in`)
    SiloControl,
    /// Control message published by a thing (`vThing/{thing}/c_out`)
    ThingControl { thing_id: String },
    /// Data published by a thing (`vThing/{thing}/data_out`)
    ThingData { thing_id: String },
    /// Command request from a tenant on the local plane
    LocalCommand(CommandTopic),
    /// Anything else
    Unrouted,
}

/// Classifies topics of one silo
#[derive(Debug, Clone)]
pub struct Router {
    silo_control_in: String,
    tenant_id: String,
}

impl Router {
    pub fn new(silo_id: &str, tenant_id: &str) -> Self {
        Self {
            silo_control_in: silo_control_in(silo_id),
            tenant_id: tenant_id.to_string(),
        }
    }

    /// Classify a topic received on the control or data plane
    pub fn classify_virtual(&self, topic: &str) -> Route {
        if topic == self.silo_control_in {
            return Route::SiloControl;
        }

        let Some(rest) = topic
            .strip_prefix(THING_PREFIX)
            .and_then(|rest| rest.strip_prefix('/'))
        else {
            return Route::Unrouted;
        };

        match rest.rsplit_once('/') {
            Some((thing_id, CONTROL_OUT_SUFFIX)) if !thing_id.is_empty() => Route::ThingControl {
                thing_id: thing_id.to_string(),
            },
            Some((thing_id, DATA_OUT_SUFFIX)) if !thing_id.is_empty() => Route::ThingData {
                thing_id: thing_id.to_string(),
            },
            _ => Route::Unrouted,
        }
    }

    /// Classify a topic received on the local plane
    pub fn classify_local(&self, topic: &str) -> Route {
        match parse_command_topic(&self.tenant_id, topic) {
            Some(command) => Route::LocalCommand(command),
            None => Route::Unrouted,
        }
    }
}

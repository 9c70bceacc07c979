//! Wire messages
//!
//! JSON shapes exchanged on the virtual plane: silo control commands, the
//! notifications the silo emits, and the NGSI-LD data envelope.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{HandlerError, HandlerResult};

/// Commands accepted on `vSilo/{silo}/c_in` and `vThing/{thing}/c_out`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    AddVThing,
    DeleteVThing,
    DestroyVSilo,
    GetContextResponse,
    RestoreVThings,
}

impl ControlCommand {
    /// Look up a command by its `command` tag
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "addVThing" => Some(Self::AddVThing),
            "deleteVThing" => Some(Self::DeleteVThing),
            "destroyVSilo" => Some(Self::DestroyVSilo),
            "getContextResponse" => Some(Self::GetContextResponse),
            "restoreVThings" => Some(Self::RestoreVThings),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AddVThing => "addVThing",
            Self::DeleteVThing => "deleteVThing",
            Self::DestroyVSilo => "destroyVSilo",
            Self::GetContextResponse => "getContextResponse",
            Self::RestoreVThings => "restoreVThings",
        }
    }
}

/// A decoded control message: its tag and the remaining fields
#[derive(Debug, Clone, PartialEq)]
pub struct ControlMessage {
    /// Raw `command` tag
    pub tag: String,
    /// All fields except `command`
    pub fields: Map<String, Value>,
}

impl ControlMessage {
    /// Decode a control payload; fails on invalid JSON, a non-object
    /// payload, or a missing/non-string `command`
    pub fn decode(raw: &[u8]) -> HandlerResult<Self> {
        let value: Value = serde_json::from_slice(raw)?;
        let Value::Object(mut fields) = value else {
            return Err(HandlerError::Malformed(
                "control message is not a JSON object".to_string(),
            ));
        };
        match fields.shift_remove("command") {
            Some(Value::String(tag)) => Ok(Self { tag, fields }),
            _ => Err(HandlerError::MissingField("command")),
        }
    }

    /// The command, if the tag is one the silo understands
    pub fn command(&self) -> Option<ControlCommand> {
        ControlCommand::from_tag(&self.tag)
    }

    /// The `vThingID` field
    pub fn thing_id(&self) -> HandlerResult<&str> {
        thing_id_of(&self.fields).ok_or(HandlerError::MissingField("vThingID"))
    }

    /// The `vThings` list of `restoreVThings`
    pub fn things(&self) -> HandlerResult<&[Value]> {
        match self.fields.get("vThings") {
            Some(Value::Array(things)) => Ok(things),
            _ => Err(HandlerError::MissingField("vThings")),
        }
    }

    /// Re-read the remaining fields as a data envelope
    pub fn into_envelope(self) -> HandlerResult<DataEnvelope> {
        Ok(serde_json::from_value(Value::Object(self.fields))?)
    }
}

/// The `vThingID` string of a JSON object, if any
pub fn thing_id_of(fields: &Map<String, Value>) -> Option<&str> {
    fields.get("vThingID").and_then(Value::as_str)
}

/// Notifications the silo publishes on the virtual plane
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "command")]
pub enum Notification {
    /// Silo is ready to receive `restoreVThings`
    #[serde(rename = "restoreVThingsAck")]
    RestoreVThingsAck {
        #[serde(rename = "ownerID")]
        owner_id: String,
        #[serde(rename = "vSiloID")]
        silo_id: String,
    },
    /// Silo is shutting down on request
    #[serde(rename = "destroyVSiloAck")]
    DestroyVSiloAck {
        #[serde(rename = "ownerID")]
        owner_id: String,
        #[serde(rename = "vSiloID")]
        silo_id: String,
    },
    /// Ask a thing to resend its last known context
    #[serde(rename = "getContextRequest")]
    GetContextRequest {
        #[serde(rename = "ownerID")]
        owner_id: String,
        #[serde(rename = "vSiloID")]
        silo_id: String,
        #[serde(rename = "vThingID")]
        thing_id: String,
    },
}

impl Notification {
    pub fn to_bytes(&self) -> HandlerResult<bytes::Bytes> {
        Ok(serde_json::to_vec(self)?.into())
    }
}

/// Envelope of NGSI-LD entities exchanged on the data topics
///
/// Entities stay raw JSON until they are relayed one by one, so a single
/// malformed element does not reject its siblings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataEnvelope {
    pub data: Vec<Value>,
    #[serde(default)]
    pub meta: Meta,
}

/// Envelope metadata
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meta {
    #[serde(rename = "vThingID", default, skip_serializing_if = "Option::is_none")]
    pub thing_id: Option<String>,
    #[serde(rename = "vSiloID", default, skip_serializing_if = "Option::is_none")]
    pub silo_id: Option<String>,
}

/// An NGSI-LD-shaped entity
///
/// Attributes are kept as raw JSON in their original order so the entity
/// can be forwarded untouched apart from its `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Entity(pub Map<String, Value>);

impl Entity {
    /// Build a single-property entity carrying a command value
    pub fn command(
        long_id: &str,
        entity_type: Option<&str>,
        command: &str,
        value: Value,
    ) -> Self {
        let mut attributes = Map::new();
        attributes.insert("id".to_string(), Value::String(long_id.to_string()));
        if let Some(entity_type) = entity_type {
            attributes.insert("type".to_string(), Value::String(entity_type.to_string()));
        }
        attributes.insert(
            command.to_string(),
            serde_json::json!({ "type": "Property", "value": value }),
        );
        Self(attributes)
    }

    /// The entity `id`
    pub fn id(&self) -> HandlerResult<&str> {
        self.0
            .get("id")
            .and_then(Value::as_str)
            .ok_or(HandlerError::MissingField("id"))
    }

    /// Replace the entity `id`, keeping its position
    pub fn set_id(&mut self, id: &str) {
        self.0.insert("id".to_string(), Value::String(id.to_string()));
    }

    /// Command names declared in `commands.value`
    pub fn command_names(&self) -> Vec<&str> {
        self.0
            .get("commands")
            .and_then(|commands| commands.get("value"))
            .and_then(Value::as_array)
            .map(|names| names.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }
}

impl TryFrom<Value> for Entity {
    type Error = HandlerError;

    fn try_from(value: Value) -> HandlerResult<Self> {
        match value {
            Value::Object(attributes) => Ok(Self(attributes)),
            other => Err(HandlerError::Malformed(format!(
                "entity is not a JSON object: {}",
                other
            ))),
        }
    }
}

impl From<Entity> for Value {
    fn from(entity: Entity) -> Self {
        Value::Object(entity.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_decode_control_message() {
        let message = ControlMessage::decode(br#"{"command":"addVThing","vThingID":"T"}"#).unwrap();
        assert_eq!(message.command(), Some(ControlCommand::AddVThing));
        assert_eq!(message.thing_id().unwrap(), "T");
        assert!(!message.fields.contains_key("command"));
    }

    #[test]
    fn test_decode_rejects_bad_input() {
        assert!(matches!(
            ControlMessage::decode(b"not json"),
            Err(HandlerError::Malformed(_))
        ));
        assert!(matches!(
            ControlMessage::decode(br#"["addVThing"]"#),
            Err(HandlerError::Malformed(_))
        ));
        assert!(matches!(
            ControlMessage::decode(br#"{"vThingID":"T"}"#),
            Err(HandlerError::MissingField("command"))
        ));
        assert!(matches!(
            ControlMessage::decode(br#"{"command":42}"#),
            Err(HandlerError::MissingField("command"))
        ));
    }

    #[test]
    fn test_unknown_command_tag() {
        let message = ControlMessage::decode(br#"{"command":"rebootVSilo"}"#).unwrap();
        assert_eq!(message.tag, "rebootVSilo");
        assert_eq!(message.command(), None);
    }

    #[test]
    fn test_command_tags_roundtrip() {
        for command in [
            ControlCommand::AddVThing,
            ControlCommand::DeleteVThing,
            ControlCommand::DestroyVSilo,
            ControlCommand::GetContextResponse,
            ControlCommand::RestoreVThings,
        ] {
            assert_eq!(ControlCommand::from_tag(command.as_str()), Some(command));
        }
    }

    #[test]
    fn test_notifications_serialize() {
        let ack = Notification::RestoreVThingsAck {
            owner_id: "admin".to_string(),
            silo_id: "s1".to_string(),
        };
        assert_eq!(
            serde_json::to_string(&ack).unwrap(),
            r#"{"command":"restoreVThingsAck","ownerID":"admin","vSiloID":"s1"}"#
        );

        let request = Notification::GetContextRequest {
            owner_id: "admin".to_string(),
            silo_id: "s1".to_string(),
            thing_id: "T".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({
                "command": "getContextRequest",
                "ownerID": "admin",
                "vSiloID": "s1",
                "vThingID": "T"
            })
        );
    }

    #[test]
    fn test_envelope_without_meta() {
        let envelope: DataEnvelope = serde_json::from_value(json!({
            "data": [{"id": "urn:ngsi-ld:Sensor1"}]
        }))
        .unwrap();
        assert_eq!(envelope.meta, Meta::default());
        let entity = Entity::try_from(envelope.data[0].clone()).unwrap();
        assert_eq!(entity.id().unwrap(), "urn:ngsi-ld:Sensor1");
    }

    #[test]
    fn test_envelope_keeps_non_object_entities() {
        let envelope: DataEnvelope = serde_json::from_value(json!({
            "data": [{"id": "A"}, 5, "text"]
        }))
        .unwrap();
        assert_eq!(envelope.data.len(), 3);
        assert!(Entity::try_from(envelope.data[0].clone()).is_ok());
        assert!(matches!(
            Entity::try_from(envelope.data[1].clone()),
            Err(HandlerError::Malformed(_))
        ));
        assert!(Entity::try_from(envelope.data[2].clone()).is_err());
    }

    #[test]
    fn test_entity_command_names() {
        let entity: Entity = serde_json::from_value(json!({
            "id": "urn:ngsi-ld:Lamp",
            "commands": {"type": "Property", "value": ["on", "off", 3]}
        }))
        .unwrap();
        assert_eq!(entity.command_names(), vec!["on", "off"]);

        let plain: Entity = serde_json::from_value(json!({"id": "x"})).unwrap();
        assert!(plain.command_names().is_empty());
    }

    #[test]
    fn test_set_id_keeps_attribute_order() {
        let mut entity: Entity = serde_json::from_value(json!({
            "type": "Sensor",
            "id": "urn:ngsi-ld:Sensor1",
            "temperature": {"type": "Property", "value": 21}
        }))
        .unwrap();
        entity.set_id("Sensor1");
        assert_eq!(
            serde_json::to_string(&entity).unwrap(),
            r#"{"type":"Sensor","id":"Sensor1","temperature":{"type":"Property","value":21}}"#
        );
    }

    #[test]
    fn test_command_entity() {
        let entity = Entity::command("urn:ngsi-ld:Sensor1", None, "setTemp", json!(22.5));
        assert_eq!(
            serde_json::to_string(&entity).unwrap(),
            r#"{"id":"urn:ngsi-ld:Sensor1","setTemp":{"type":"Property","value":22.5}}"#
        );

        let typed = Entity::command("urn:ngsi-ld:Lamp", Some("Lamp"), "on", json!(true));
        assert_eq!(typed.0.get("type"), Some(&json!("Lamp")));
    }
}

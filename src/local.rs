//! Local Adapter
//!
//! Owns the local-plane connection and the subscription registry. Entity
//! data of mirrored things is published under `{tenant}/{thing}/{entity}`,
//! and every command an entity declares opens a reverse-command
//! subscription on `{tenant}/{thing}/{entity}/{command}`.

use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::entity_id;
use crate::error::{HandlerError, HandlerResult};
use crate::message::Entity;
use crate::plane::Plane;
use crate::registry::SubscriptionRegistry;
use crate::topic::{self, CommandTopic};

/// A command request received from a tenant, ready for the virtual plane
#[derive(Debug, Clone, PartialEq)]
pub struct CommandRequest {
    pub thing_id: String,
    /// Virtual-plane entity ID
    pub long_id: String,
    pub entity_type: Option<String>,
    pub command: String,
    pub value: Value,
}

pub struct LocalAdapter {
    plane: Arc<dyn Plane>,
    registry: Arc<SubscriptionRegistry>,
    tenant_id: String,
}

impl LocalAdapter {
    pub fn new(
        plane: Arc<dyn Plane>,
        registry: Arc<SubscriptionRegistry>,
        tenant_id: impl Into<String>,
    ) -> Self {
        Self {
            plane,
            registry,
            tenant_id: tenant_id.into(),
        }
    }

    pub fn plane(&self) -> &Arc<dyn Plane> {
        &self.plane
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// Prepare the local side of a new mirrored thing
    ///
    /// Subscriptions are opened lazily as entity data arrives, so this only
    /// checks that the thing ID can be used as topic levels.
    pub fn create_thing(&self, thing_id: &str) -> HandlerResult<()> {
        topic::validate_topic_name(thing_id).map_err(|reason| HandlerError::InvalidId {
            id: thing_id.to_string(),
            reason,
        })?;
        debug!("Local: Thing '{}' ready", thing_id);
        Ok(())
    }

    /// Tear down every reverse-command subscription of a thing
    ///
    /// Returns the number of registry entries removed. Unsubscribe failures
    /// are logged; the entries are dropped from the registry regardless.
    pub async fn delete_thing(&self, thing_id: &str) -> usize {
        let removed = self.registry.remove_thing(&self.tenant_id, thing_id);
        for entry in &removed {
            if let Err(e) = self.plane.unsubscribe(&entry.topic).await {
                warn!("Local: Failed to unsubscribe {}: {}", entry.topic, e);
            }
        }
        info!(
            "Local: Removed {} command subscriptions of thing '{}'",
            removed.len(),
            thing_id
        );
        removed.len()
    }

    /// Publish one entity of a mirrored thing on the local plane
    ///
    /// Opens the reverse-command subscriptions the entity declares, then
    /// publishes it with its short ID to `{tenant}/{thing}/{entity}`.
    pub async fn publish_entity(&self, thing_id: &str, mut entity: Entity) -> HandlerResult<()> {
        let long_id = entity.id()?.to_string();
        let short_id = entity_id::to_short(&long_id).to_string();
        validate_level(&short_id)?;

        let commands: Vec<String> = entity
            .command_names()
            .into_iter()
            .map(str::to_string)
            .collect();
        for command in &commands {
            self.ensure_command_subscription(thing_id, &short_id, &long_id, command)
                .await?;
        }

        entity.set_id(&short_id);
        let payload = serde_json::to_vec(&entity)?;
        let data_topic = topic::local_entity(&self.tenant_id, thing_id, &short_id);
        self.plane.publish(&data_topic, Bytes::from(payload)).await?;
        debug!("Local: Published entity on {}", data_topic);
        Ok(())
    }

    /// Subscribe to a reverse-command topic unless already registered
    async fn ensure_command_subscription(
        &self,
        thing_id: &str,
        short_id: &str,
        long_id: &str,
        command: &str,
    ) -> HandlerResult<()> {
        validate_level(command)?;
        let command_topic = topic::local_command(&self.tenant_id, thing_id, short_id, command);
        if self.registry.contains(&command_topic) {
            return Ok(());
        }

        self.plane.subscribe(&command_topic).await?;
        if self.registry.add(&command_topic, long_id) {
            info!("Local: Subscribed to command topic {}", command_topic);
        }
        Ok(())
    }

    /// Turn a command published by a tenant into a request for the thing
    ///
    /// The long entity ID is the one recorded when the command subscription
    /// was opened, falling back to the codec. A payload that is not valid
    /// JSON is forwarded as a string.
    pub fn on_command_request(
        &self,
        command: CommandTopic,
        topic: &str,
        payload: &[u8],
    ) -> CommandRequest {
        let long_id = self
            .registry
            .long_id_for(topic)
            .unwrap_or_else(|| entity_id::to_long(&command.entity_id));

        let value = serde_json::from_slice(payload).unwrap_or_else(|_| {
            Value::String(String::from_utf8_lossy(payload).into_owned())
        });

        CommandRequest {
            thing_id: command.thing_id,
            long_id,
            entity_type: None,
            command: command.command,
            value,
        }
    }
}

/// Check that an entity ID or command name fits in a single topic level
fn validate_level(name: &str) -> HandlerResult<()> {
    let invalid = |reason| HandlerError::InvalidId {
        id: name.to_string(),
        reason,
    };
    topic::validate_topic_name(name).map_err(invalid)?;
    if name.contains('/') {
        return Err(invalid("must be a single topic level"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plane::MemoryPlane;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn adapter() -> (LocalAdapter, Arc<MemoryPlane>) {
        let (plane, _rx) = MemoryPlane::new("local");
        let plane = Arc::new(plane);
        let adapter = LocalAdapter::new(
            plane.clone(),
            Arc::new(SubscriptionRegistry::new()),
            "tenant1",
        );
        (adapter, plane)
    }

    fn entity(value: Value) -> Entity {
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn test_publish_entity_opens_command_subscriptions() {
        let (adapter, plane) = adapter();
        adapter
            .publish_entity(
                "T",
                entity(json!({
                    "id": "urn:ngsi-ld:Sensor1",
                    "commands": {"value": ["setTemp"]}
                })),
            )
            .await
            .unwrap();

        assert_eq!(plane.subscriptions(), vec!["tenant1/T/Sensor1/setTemp"]);
        assert!(adapter.registry().contains("tenant1/T/Sensor1/setTemp"));

        let published = plane.published_on("tenant1/T/Sensor1");
        assert_eq!(published.len(), 1);
        let body: Value = serde_json::from_slice(&published[0]).unwrap();
        assert_eq!(
            body,
            json!({"id": "Sensor1", "commands": {"value": ["setTemp"]}})
        );
    }

    #[tokio::test]
    async fn test_repeated_entity_does_not_duplicate_subscriptions() {
        let (adapter, plane) = adapter();
        let sensor = json!({"id": "urn:ngsi-ld:Sensor1", "commands": {"value": ["a", "b"]}});
        adapter.publish_entity("T", entity(sensor.clone())).await.unwrap();
        adapter.publish_entity("T", entity(sensor)).await.unwrap();

        assert_eq!(adapter.registry().len(), 2);
        assert_eq!(plane.subscriptions().len(), 2);
        assert_eq!(plane.published_on("tenant1/T/Sensor1").len(), 2);
    }

    #[tokio::test]
    async fn test_entity_id_must_be_single_level() {
        let (adapter, plane) = adapter();
        for id in ["urn:ngsi-ld:a/b", "urn:ngsi-ld:a+", "urn:ngsi-ld:"] {
            let result = adapter.publish_entity("T", entity(json!({"id": id}))).await;
            assert!(matches!(result, Err(HandlerError::InvalidId { .. })), "{}", id);
        }
        assert!(plane.published().is_empty());
    }

    #[tokio::test]
    async fn test_entity_without_id() {
        let (adapter, _plane) = adapter();
        let result = adapter.publish_entity("T", entity(json!({"type": "x"}))).await;
        assert!(matches!(result, Err(HandlerError::MissingField("id"))));
    }

    #[tokio::test]
    async fn test_failed_subscribe_is_not_registered() {
        let (adapter, plane) = adapter();
        plane.fail_subscribe("tenant1/T/Lamp/on");
        let result = adapter
            .publish_entity("T", entity(json!({"id": "Lamp", "commands": {"value": ["on"]}})))
            .await;
        assert!(matches!(result, Err(HandlerError::Plane(_))));
        assert!(adapter.registry().is_empty());
    }

    #[tokio::test]
    async fn test_delete_thing_unsubscribes_only_that_thing() {
        let (adapter, plane) = adapter();
        for thing in ["T1", "T10"] {
            adapter
                .publish_entity(
                    thing,
                    entity(json!({"id": "urn:ngsi-ld:Sensor1", "commands": {"value": ["setTemp"]}})),
                )
                .await
                .unwrap();
        }

        assert_eq!(adapter.delete_thing("T1").await, 1);
        assert_eq!(plane.subscriptions(), vec!["tenant1/T10/Sensor1/setTemp"]);
        assert_eq!(adapter.registry().len(), 1);
    }

    #[test]
    fn test_create_thing_rejects_wildcards() {
        let (adapter, _plane) = adapter();
        assert!(adapter.create_thing("T").is_ok());
        assert!(adapter.create_thing("relay/T").is_ok());
        assert!(adapter.create_thing("T#").is_err());
        assert!(adapter.create_thing("").is_err());
    }

    #[tokio::test]
    async fn test_command_request_uses_recorded_long_id() {
        let (adapter, _plane) = adapter();
        adapter
            .publish_entity("T", entity(json!({"id": "Lamp", "commands": {"value": ["on"]}})))
            .await
            .unwrap();

        let topic = "tenant1/T/Lamp/on";
        let command = topic::parse_command_topic("tenant1", topic).unwrap();
        let request = adapter.on_command_request(command, topic, b"true");
        assert_eq!(request.long_id, "Lamp");
        assert_eq!(request.value, json!(true));
    }

    #[test]
    fn test_command_request_falls_back_to_codec() {
        let (adapter, _plane) = adapter();
        let topic = "tenant1/T/Sensor1/setTemp";
        let command = topic::parse_command_topic("tenant1", topic).unwrap();
        let request = adapter.on_command_request(command, topic, b"22.5");
        assert_eq!(
            request,
            CommandRequest {
                thing_id: "T".to_string(),
                long_id: "urn:ngsi-ld:Sensor1".to_string(),
                entity_type: None,
                command: "setTemp".to_string(),
                value: json!(22.5),
            }
        );
    }

    #[test]
    fn test_command_request_non_json_payload() {
        let (adapter, _plane) = adapter();
        let topic = "tenant1/T/Lamp/mode";
        let command = topic::parse_command_topic("tenant1", topic).unwrap();
        let request = adapter.on_command_request(command, topic, b"eco mode");
        assert_eq!(request.value, json!("eco mode"));
    }
}

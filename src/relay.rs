//! Data Relay
//!
//! Moves entity data between the virtual data plane and the local adapter.

use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{HandlerError, HandlerResult};
use crate::local::{CommandRequest, LocalAdapter};
use crate::message::{DataEnvelope, Entity, Meta};
use crate::plane::Plane;
use crate::topic;

/// Result of relaying one inbound data message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayReport {
    pub published: usize,
    pub failed: usize,
}

pub struct DataRelay {
    plane: Arc<dyn Plane>,
    local: Arc<LocalAdapter>,
    silo_id: String,
}

impl DataRelay {
    pub fn new(plane: Arc<dyn Plane>, local: Arc<LocalAdapter>, silo_id: impl Into<String>) -> Self {
        Self {
            plane,
            local,
            silo_id: silo_id.into(),
        }
    }

    pub fn plane(&self) -> &Arc<dyn Plane> {
        &self.plane
    }

    pub fn local(&self) -> &Arc<LocalAdapter> {
        &self.local
    }

    /// Relay a raw data message received on `vThing/{thing}/data_out`
    pub async fn on_virtual_data(
        &self,
        thing_hint: Option<&str>,
        payload: &[u8],
    ) -> HandlerResult<RelayReport> {
        let envelope: DataEnvelope = serde_json::from_slice(payload)?;
        self.relay_envelope(thing_hint, envelope).await
    }

    /// Relay a decoded envelope, entity by entity
    ///
    /// The thing is `meta.vThingID` when present, else `thing_hint`. A
    /// failing entity is logged and does not stop its siblings.
    pub async fn relay_envelope(
        &self,
        thing_hint: Option<&str>,
        envelope: DataEnvelope,
    ) -> HandlerResult<RelayReport> {
        let DataEnvelope { data, meta } = envelope;
        let thing_id = meta
            .thing_id
            .as_deref()
            .or(thing_hint)
            .ok_or(HandlerError::MissingField("vThingID"))?
            .to_string();

        let mut report = RelayReport {
            published: 0,
            failed: 0,
        };
        for value in data {
            let relayed = match Entity::try_from(value) {
                Ok(entity) => self.local.publish_entity(&thing_id, entity).await,
                Err(e) => Err(e),
            };
            match relayed {
                Ok(()) => report.published += 1,
                Err(e) => {
                    warn!("Relay: Dropped entity of thing '{}': {}", thing_id, e);
                    report.failed += 1;
                }
            }
        }

        debug!(
            "Relay: Thing '{}' relayed {} entities ({} failed)",
            thing_id, report.published, report.failed
        );
        Ok(report)
    }

    /// Publish a tenant command to the thing's `data_in` topic
    pub async fn publish_to_virtual(&self, request: &CommandRequest) -> HandlerResult<()> {
        let entity = Entity::command(
            &request.long_id,
            request.entity_type.as_deref(),
            &request.command,
            request.value.clone(),
        );
        let envelope = DataEnvelope {
            data: vec![Value::from(entity)],
            meta: Meta {
                thing_id: None,
                silo_id: Some(self.silo_id.clone()),
            },
        };

        let data_topic = topic::thing_data_in(&request.thing_id);
        let payload = serde_json::to_vec(&envelope)?;
        self.plane.publish(&data_topic, Bytes::from(payload)).await?;
        debug!(
            "Relay: Sent command '{}' for {} on {}",
            request.command, request.long_id, data_topic
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plane::MemoryPlane;
    use crate::registry::SubscriptionRegistry;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    struct Fixture {
        relay: DataRelay,
        data: Arc<MemoryPlane>,
        local: Arc<MemoryPlane>,
    }

    fn fixture() -> Fixture {
        let (data, _) = MemoryPlane::new("data");
        let (local, _) = MemoryPlane::new("local");
        let data = Arc::new(data);
        let local = Arc::new(local);
        let adapter = Arc::new(LocalAdapter::new(
            local.clone(),
            Arc::new(SubscriptionRegistry::new()),
            "tenant1",
        ));
        Fixture {
            relay: DataRelay::new(data.clone(), adapter, "tenant1_silo1"),
            data,
            local,
        }
    }

    #[tokio::test]
    async fn test_inbound_uses_meta_thing_id() {
        let f = fixture();
        let payload = json!({
            "data": [{"id": "urn:ngsi-ld:Sensor1", "temperature": {"type": "Property", "value": 20}}],
            "meta": {"vThingID": "relay/T"}
        });
        let report = f
            .relay
            .on_virtual_data(Some("ignored"), payload.to_string().as_bytes())
            .await
            .unwrap();

        assert_eq!(report, RelayReport { published: 1, failed: 0 });
        assert_eq!(f.local.published_on("tenant1/relay/T/Sensor1").len(), 1);
    }

    #[tokio::test]
    async fn test_inbound_falls_back_to_topic_thing() {
        let f = fixture();
        let payload = br#"{"data":[{"id":"Sensor1"}]}"#;
        f.relay.on_virtual_data(Some("T"), payload).await.unwrap();
        assert_eq!(f.local.published_on("tenant1/T/Sensor1").len(), 1);

        assert!(matches!(
            f.relay.on_virtual_data(None, payload).await,
            Err(HandlerError::MissingField("vThingID"))
        ));
    }

    #[tokio::test]
    async fn test_failing_entity_does_not_stop_siblings() {
        let f = fixture();
        let payload = json!({
            "data": [
                {"id": "urn:ngsi-ld:A"},
                5,
                {"type": "NoId"},
                {"id": "urn:ngsi-ld:bad/id"},
                {"id": "urn:ngsi-ld:B"}
            ]
        });
        let report = f
            .relay
            .on_virtual_data(Some("T"), payload.to_string().as_bytes())
            .await
            .unwrap();

        assert_eq!(report, RelayReport { published: 2, failed: 3 });
        let topics: Vec<String> = f.local.published().into_iter().map(|m| m.topic).collect();
        assert_eq!(topics, vec!["tenant1/T/A", "tenant1/T/B"]);
    }

    #[tokio::test]
    async fn test_malformed_envelope() {
        let f = fixture();
        assert!(f.relay.on_virtual_data(Some("T"), b"{").await.is_err());
        assert!(f
            .relay
            .on_virtual_data(Some("T"), br#"{"meta":{}}"#)
            .await
            .is_err());
        assert!(f.local.published().is_empty());
    }

    #[tokio::test]
    async fn test_publish_to_virtual() {
        let f = fixture();
        let request = CommandRequest {
            thing_id: "T".to_string(),
            long_id: "urn:ngsi-ld:Sensor1".to_string(),
            entity_type: None,
            command: "setTemp".to_string(),
            value: json!(22.5),
        };
        f.relay.publish_to_virtual(&request).await.unwrap();

        let published = f.data.published_on("vThing/T/data_in");
        assert_eq!(published.len(), 1);
        assert_eq!(
            std::str::from_utf8(&published[0]).unwrap(),
            r#"{"data":[{"id":"urn:ngsi-ld:Sensor1","setTemp":{"type":"Property","value":22.5}}],"meta":{"vSiloID":"tenant1_silo1"}}"#
        );
    }

    #[tokio::test]
    async fn test_publish_to_virtual_with_type() {
        let f = fixture();
        let request = CommandRequest {
            thing_id: "T".to_string(),
            long_id: "urn:ngsi-ld:Lamp".to_string(),
            entity_type: Some("Lamp".to_string()),
            command: "on".to_string(),
            value: json!(true),
        };
        f.relay.publish_to_virtual(&request).await.unwrap();

        let body: Value =
            serde_json::from_slice(&f.data.published_on("vThing/T/data_in")[0]).unwrap();
        assert_eq!(
            body,
            json!({
                "data": [{"id": "urn:ngsi-ld:Lamp", "type": "Lamp", "on": {"type": "Property", "value": true}}],
                "meta": {"vSiloID": "tenant1_silo1"}
            })
        );
    }
}

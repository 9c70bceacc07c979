//! Subscription registry
//!
//! Tracks the reverse-command topics the silo is subscribed to on the local
//! plane, so deleting a thing unsubscribes exactly the topics it opened.
//! Entries are kept in insertion order. Each entry remembers the long
//! entity ID that declared the command, which lets the command path
//! recover IDs the codec alone cannot rebuild.

use parking_lot::Mutex;

/// One reverse-command subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSubscription {
    /// Local topic `{tenant}/{thing}/{entity}/{command}`
    pub topic: String,
    /// Virtual-plane ID of the entity that declared the command
    pub long_id: String,
}

/// Lock-guarded, insertion-ordered set of command subscriptions
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    entries: Mutex<Vec<CommandSubscription>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry; returns false if the topic was already registered
    pub fn add(&self, topic: &str, long_id: &str) -> bool {
        let mut entries = self.entries.lock();
        if entries.iter().any(|e| e.topic == topic) {
            return false;
        }
        entries.push(CommandSubscription {
            topic: topic.to_string(),
            long_id: long_id.to_string(),
        });
        true
    }

    /// Remove and return every entry whose topic starts with `prefix`
    pub fn remove_by_prefix(&self, prefix: &str) -> Vec<CommandSubscription> {
        self.remove_where(|topic| topic.starts_with(prefix))
    }

    /// Remove and return every entry belonging to one thing
    ///
    /// Matches on whole levels: the topic must be exactly
    /// `{tenant}/{thing}/{entity}/{command}`, so removing `T1` leaves `T10`
    /// and a nested thing `T1/sub` untouched.
    pub fn remove_thing(&self, tenant_id: &str, thing_id: &str) -> Vec<CommandSubscription> {
        let prefix = crate::topic::local_thing_prefix(tenant_id, thing_id);
        self.remove_where(|topic| {
            topic
                .strip_prefix(prefix.as_str())
                .is_some_and(|rest| rest.matches('/').count() == 1)
        })
    }

    /// Long entity ID recorded for a topic
    pub fn long_id_for(&self, topic: &str) -> Option<String> {
        self.entries
            .lock()
            .iter()
            .find(|e| e.topic == topic)
            .map(|e| e.long_id.clone())
    }

    /// Check if a topic is registered
    pub fn contains(&self, topic: &str) -> bool {
        self.entries.lock().iter().any(|e| e.topic == topic)
    }

    /// Copy of all entries in insertion order
    pub fn snapshot(&self) -> Vec<CommandSubscription> {
        self.entries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn remove_where<F>(&self, predicate: F) -> Vec<CommandSubscription>
    where
        F: Fn(&str) -> bool,
    {
        let mut entries = self.entries.lock();
        let (removed, kept): (Vec<_>, Vec<_>) =
            entries.drain(..).partition(|e| predicate(&e.topic));
        *entries = kept;
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topics(entries: &[CommandSubscription]) -> Vec<&str> {
        entries.iter().map(|e| e.topic.as_str()).collect()
    }

    #[test]
    fn test_add_is_idempotent() {
        let registry = SubscriptionRegistry::new();
        assert!(registry.add("tenant1/T/Sensor1/setTemp", "urn:ngsi-ld:Sensor1"));
        assert!(!registry.add("tenant1/T/Sensor1/setTemp", "urn:ngsi-ld:Sensor1"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_snapshot_keeps_insertion_order() {
        let registry = SubscriptionRegistry::new();
        registry.add("t/B/e/c", "e");
        registry.add("t/A/e/c", "e");
        registry.add("t/C/e/c", "e");
        assert_eq!(
            topics(&registry.snapshot()),
            vec!["t/B/e/c", "t/A/e/c", "t/C/e/c"]
        );
    }

    #[test]
    fn test_remove_by_prefix() {
        let registry = SubscriptionRegistry::new();
        registry.add("t/A/e1/c", "e1");
        registry.add("t/B/e1/c", "e1");
        registry.add("t/A/e2/c", "e2");

        let removed = registry.remove_by_prefix("t/A/");
        assert_eq!(topics(&removed), vec!["t/A/e1/c", "t/A/e2/c"]);
        assert_eq!(topics(&registry.snapshot()), vec!["t/B/e1/c"]);
    }

    #[test]
    fn test_remove_thing_does_not_touch_shared_prefix() {
        let registry = SubscriptionRegistry::new();
        registry.add("tenant1/T1/Sensor1/setTemp", "urn:ngsi-ld:Sensor1");
        registry.add("tenant1/T10/Sensor1/setTemp", "urn:ngsi-ld:Sensor1");
        registry.add("tenant1/T1/sub/Lamp/on", "urn:ngsi-ld:Lamp");
        registry.add("tenant1/T1/Sensor2/reset", "urn:ngsi-ld:Sensor2");

        let removed = registry.remove_thing("tenant1", "T1");
        assert_eq!(
            topics(&removed),
            vec!["tenant1/T1/Sensor1/setTemp", "tenant1/T1/Sensor2/reset"]
        );
        assert_eq!(
            topics(&registry.snapshot()),
            vec!["tenant1/T10/Sensor1/setTemp", "tenant1/T1/sub/Lamp/on"]
        );
    }

    #[test]
    fn test_remove_nested_thing() {
        let registry = SubscriptionRegistry::new();
        registry.add("tenant1/T1/sub/Lamp/on", "urn:ngsi-ld:Lamp");
        let removed = registry.remove_thing("tenant1", "T1/sub");
        assert_eq!(topics(&removed), vec!["tenant1/T1/sub/Lamp/on"]);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_long_id_for() {
        let registry = SubscriptionRegistry::new();
        registry.add("tenant1/T/Sensor1/setTemp", "Sensor1");
        assert_eq!(
            registry.long_id_for("tenant1/T/Sensor1/setTemp").as_deref(),
            Some("Sensor1")
        );
        assert!(registry.long_id_for("tenant1/T/Sensor2/setTemp").is_none());
    }

    #[test]
    fn test_concurrent_add_and_remove() {
        use std::sync::Arc;

        let registry = Arc::new(SubscriptionRegistry::new());
        let writers: Vec<_> = (0..4)
            .map(|n| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        registry.add(&format!("t/T{}/e{}/c", n, i), "e");
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }
        assert_eq!(registry.len(), 400);

        let removed = registry.remove_thing("t", "T1");
        assert_eq!(removed.len(), 100);
        assert_eq!(registry.len(), 300);
    }
}

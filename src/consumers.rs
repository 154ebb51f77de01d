//! Consumer identities and their deduplicating registry.

use std::collections::{hash_map::Entry, HashMap, HashSet};

use parking_lot::Mutex;
use serde::Serialize;

/// Maximum length of a consumer identifier, in characters.
const MAX_IDENTIFIER_LEN: usize = 128;
/// Maximum length of a consumer name or group, in characters.
const MAX_NAME_LEN: usize = 64;

/// Authenticated caller identity attached to a request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[non_exhaustive]
pub struct Consumer {
    /// Unique consumer identifier.
    pub identifier: String,
    /// Human-readable display name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Group the consumer belongs to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

impl Consumer {
    /// Create a consumer from its identifier.
    ///
    /// The identifier is trimmed and limited to 128 characters. Returns
    /// `None` if the trimmed identifier is empty.
    #[must_use]
    pub fn new(identifier: impl AsRef<str>) -> Option<Self> {
        let identifier = limit(identifier.as_ref(), MAX_IDENTIFIER_LEN)?;
        Some(Self {
            identifier,
            name: None,
            group: None,
        })
    }

    /// Set the display name, trimmed and limited to 64 characters.
    #[must_use]
    pub fn with_name(mut self, name: impl AsRef<str>) -> Self {
        self.name = limit(name.as_ref(), MAX_NAME_LEN);
        self
    }

    /// Set the group, trimmed and limited to 64 characters.
    #[must_use]
    pub fn with_group(mut self, group: impl AsRef<str>) -> Self {
        self.group = limit(group.as_ref(), MAX_NAME_LEN);
        self
    }
}

/// Trim a value and cut it down to `max` characters, mapping empty to `None`.
fn limit(value: &str, max: usize) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(match trimmed.char_indices().nth(max) {
        Some((pos, _)) => trimmed[..pos].to_owned(),
        None => trimmed.to_owned(),
    })
}

/// Registry of consumer identities seen by this instance.
///
/// Retains all known consumers across drains; only identities that were
/// inserted or materially changed since the last drain are emitted.
#[derive(Debug, Default)]
pub(crate) struct ConsumerRegistry {
    inner: Mutex<RegistryInner>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    consumers: HashMap<String, Consumer>,
    updated: HashSet<String>,
}

impl ConsumerRegistry {
    /// Insert a consumer or update its name/group.
    ///
    /// A consumer carrying neither name nor group is usable as a request
    /// attribute but is not registered as an update. Known consumers are
    /// marked updated only when a non-empty incoming value differs from the
    /// stored one.
    pub(crate) fn add_or_update_consumer(&self, consumer: Option<&Consumer>) {
        let Some(consumer) = consumer else {
            return;
        };
        if consumer.name.is_none() && consumer.group.is_none() {
            return;
        }
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        match inner.consumers.entry(consumer.identifier.clone()) {
            Entry::Vacant(entry) => {
                entry.insert(consumer.clone());
                inner.updated.insert(consumer.identifier.clone());
            }
            Entry::Occupied(mut entry) => {
                let existing = entry.get_mut();
                let mut changed = false;
                if let Some(name) = &consumer.name {
                    if existing.name.as_ref() != Some(name) {
                        existing.name = Some(name.clone());
                        changed = true;
                    }
                }
                if let Some(group) = &consumer.group {
                    if existing.group.as_ref() != Some(group) {
                        existing.group = Some(group.clone());
                        changed = true;
                    }
                }
                if changed {
                    inner.updated.insert(consumer.identifier.clone());
                }
            }
        }
    }

    /// Return records for all consumers updated since the last drain and
    /// clear the updated set.
    pub(crate) fn get_and_reset_updated_consumers(&self) -> Vec<Consumer> {
        let mut inner = self.inner.lock();
        let updated = std::mem::take(&mut inner.updated);
        updated
            .iter()
            .filter_map(|identifier| inner.consumers.get(identifier).cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_is_trimmed_and_limited() {
        let consumer = Consumer::new(format!("  {}  ", "a".repeat(200))).unwrap();
        assert_eq!(consumer.identifier.len(), 128);
        assert!(Consumer::new("   ").is_none());
    }

    #[test]
    fn name_and_group_are_limited() {
        let consumer = Consumer::new("u1")
            .unwrap()
            .with_name("n".repeat(100))
            .with_group("  ");
        assert_eq!(consumer.name.as_deref().map(str::len), Some(64));
        assert_eq!(consumer.group, None);
    }

    #[test]
    fn identifier_only_consumer_is_not_registered() {
        let registry = ConsumerRegistry::default();
        registry.add_or_update_consumer(Consumer::new("u1").as_ref());
        assert!(registry.get_and_reset_updated_consumers().is_empty());
    }

    #[test]
    fn upsert_marks_updated_only_on_change() {
        let registry = ConsumerRegistry::default();
        let consumer = Consumer::new("u1").unwrap().with_name("A");
        registry.add_or_update_consumer(Some(&consumer));

        let drained = registry.get_and_reset_updated_consumers();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].identifier, "u1");
        assert_eq!(drained[0].name.as_deref(), Some("A"));

        // Same name plus a new group: emitted once with both fields.
        registry.add_or_update_consumer(Some(&consumer.clone().with_group("g")));
        let drained = registry.get_and_reset_updated_consumers();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].group.as_deref(), Some("g"));

        // No further updates: nothing to emit.
        assert!(registry.get_and_reset_updated_consumers().is_empty());

        // Changing only the name re-emits the merged record.
        registry.add_or_update_consumer(Some(&Consumer::new("u1").unwrap().with_name("B")));
        let drained = registry.get_and_reset_updated_consumers();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].name.as_deref(), Some("B"));
        assert_eq!(drained[0].group.as_deref(), Some("g"));
    }

    #[test]
    fn repeated_identical_updates_emit_once() {
        let registry = ConsumerRegistry::default();
        let consumer = Consumer::new("u1").unwrap().with_name("A").with_group("g");
        registry.add_or_update_consumer(Some(&consumer));
        registry.add_or_update_consumer(Some(&consumer));
        registry.add_or_update_consumer(Some(&consumer));
        assert_eq!(registry.get_and_reset_updated_consumers().len(), 1);
    }
}

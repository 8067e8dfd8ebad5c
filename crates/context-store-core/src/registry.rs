use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};

use crate::context::{SlaveContext, StateTarget};

pub type SharedTarget = Arc<Mutex<Box<dyn StateTarget>>>;

/// Process-local map of application name to its in-memory context.
///
/// Owned by the top-level application object and handed to collaborators;
/// entries are never shared across processes.
#[derive(Debug, Default)]
pub struct ContextRegistry {
    entries: RwLock<BTreeMap<String, SharedTarget>>,
}

impl ContextRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the entry for `app`, creating an empty [`SlaveContext`] when missing
    /// and `create_if_missing` is set. Repeated calls return the same instance.
    pub fn get_or_create_registry_entry(&self, app: &str, create_if_missing: bool) -> Option<SharedTarget> {
        if let Some(existing) = self.get(app) {
            return Some(existing);
        }
        if !create_if_missing {
            return None;
        }
        let mut entries = self.entries.write();
        let entry = entries.entry(app.to_string()).or_insert_with(|| {
            tracing::debug!(app, "registering new slave context");
            Arc::new(Mutex::new(Box::new(SlaveContext::new()) as Box<dyn StateTarget>))
        });
        Some(Arc::clone(entry))
    }

    #[must_use]
    pub fn get(&self, app: &str) -> Option<SharedTarget> {
        self.entries.read().get(app).map(Arc::clone)
    }

    /// Register `target` for `app`, replacing any previous entry.
    pub fn register<T>(&self, app: &str, target: T) -> SharedTarget
    where
        T: StateTarget + 'static,
    {
        let shared: SharedTarget = Arc::new(Mutex::new(Box::new(target)));
        self.entries.write().insert(app.to_string(), Arc::clone(&shared));
        shared
    }

    pub fn remove(&self, app: &str) -> Option<SharedTarget> {
        self.entries.write().remove(app)
    }

    #[must_use]
    pub fn app_names(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// State to persist for `app`, including live register blocks.
    #[must_use]
    pub fn snapshot_state(&self, app: &str) -> Option<Map<String, Value>> {
        self.get(app).map(|target| target.lock().persisted_state())
    }

    /// Mirror a freshly written entry into the in-memory context, if registered.
    pub fn sync_entry(&self, app: &str, key: &str, entry: &Value) -> bool {
        match self.get(app) {
            Some(target) => {
                target.lock().set_state(key, entry.clone());
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::block::RegisterBlock;

    #[test]
    fn registration_is_idempotent() {
        let registry = ContextRegistry::new();
        let first = registry.get_or_create_registry_entry("LSISsocket", true);
        let second = registry.get_or_create_registry_entry("LSISsocket", true);
        match (first, second) {
            (Some(a), Some(b)) => assert!(Arc::ptr_eq(&a, &b)),
            _ => panic!("entries should be created"),
        }
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn lookup_without_create_does_not_register() {
        let registry = ContextRegistry::new();
        assert!(registry.get_or_create_registry_entry("MCUnode", false).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn sync_entry_updates_registered_context() {
        let registry = ContextRegistry::new();
        assert!(!registry.sync_entry("app", "AB01", &json!({})));

        let target = registry.register("app", SlaveContext::new());
        target.lock().set_block("%MB", RegisterBlock::sparse(0, 1, json!(0)));
        assert!(registry.sync_entry("app", "AB01", &json!({"STATUS": {"v": 1}})));

        let snapshot = registry.snapshot_state("app").unwrap_or_default();
        assert_eq!(snapshot["AB01"], json!({"STATUS": {"v": 1}}));
        assert_eq!(registry.app_names(), vec!["app"]);
    }
}

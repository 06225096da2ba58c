use crate::generation::Generation;
use parking_lot::RwLock;
use std::sync::Arc;

/// Registry of named store generations.
///
/// Generations are handed out as `Arc<Generation>`, so a request still holding
/// a generation keeps working on it after `delete` drops it from the registry.
pub struct CacheStorage {
    generations: RwLock<Vec<Arc<Generation>>>,
    quota: Option<usize>,
}

impl CacheStorage {
    /// `quota` applies to every generation opened through this registry.
    pub fn new(quota: Option<usize>) -> Self {
        Self {
            generations: RwLock::new(Vec::new()),
            quota,
        }
    }

    /// Open a generation, creating it if it does not exist. The flag is true
    /// when this call created it.
    pub fn open(&self, name: &str) -> (Arc<Generation>, bool) {
        if let Some(existing) = self.get(name) {
            return (existing, false);
        }

        let mut generations = self.generations.write();
        // Another caller may have created it between the read and the write.
        if let Some(existing) = generations.iter().find(|g| g.name() == name) {
            return (Arc::clone(existing), false);
        }
        let created = Arc::new(Generation::new(name, self.quota));
        generations.push(Arc::clone(&created));
        tracing::debug!(generation = name, "store generation created");
        (created, true)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Generation>> {
        self.generations
            .read()
            .iter()
            .find(|g| g.name() == name)
            .cloned()
    }

    pub fn has(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Drop a generation from the registry. Returns whether it existed.
    pub fn delete(&self, name: &str) -> bool {
        let mut generations = self.generations.write();
        let before = generations.len();
        generations.retain(|g| g.name() != name);
        generations.len() != before
    }

    /// Generation names in creation order.
    pub fn keys(&self) -> Vec<String> {
        self.generations
            .read()
            .iter()
            .map(|g| g.name().to_string())
            .collect()
    }
}

impl Default for CacheStorage {
    fn default() -> Self {
        Self::new(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::CachedEntry;
    use crate::key::RequestKey;
    use bytes::Bytes;

    #[test]
    fn open_creates_once() {
        let storage = CacheStorage::default();
        let (first, created) = storage.open("v1");
        assert!(created);
        let (second, created) = storage.open("v1");
        assert!(!created);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(storage.keys(), vec!["v1"]);
    }

    #[test]
    fn delete_removes_from_registry_only() {
        let storage = CacheStorage::default();
        let (held, _) = storage.open("v1");
        held.put(
            RequestKey::get("/a"),
            CachedEntry::new(200, vec![], Bytes::from_static(b"a")),
        )
        .unwrap();

        assert!(storage.delete("v1"));
        assert!(!storage.delete("v1"));
        assert!(!storage.has("v1"));
        // A holder keeps a usable handle
        assert!(held.get(&RequestKey::get("/a")).is_some());
    }

    #[test]
    fn keys_in_creation_order() {
        let storage = CacheStorage::default();
        storage.open("v2");
        storage.open("v1");
        storage.open("v3");
        assert_eq!(storage.keys(), vec!["v2", "v1", "v3"]);
    }

    #[test]
    fn quota_is_applied_to_new_generations() {
        let storage = CacheStorage::new(Some(1));
        let (generation, _) = storage.open("v1");
        assert!(generation
            .put(
                RequestKey::get("/a"),
                CachedEntry::new(200, vec![], Bytes::from_static(b"ab")),
            )
            .is_err());
    }
}

//! Durable store contract and the in-memory implementation.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use kvault_core::{KvResult, StorageError, StorageItem};

/// Persistent table of [`StorageItem`]s keyed by item key.
///
/// Each operation is individually atomic. The storage core never needs
/// multi-key transactions; it serializes per-key read-modify-write itself.
pub trait DurableStore: Send + Sync {
    /// Load one record.
    fn get(&self, key: &str) -> KvResult<Option<StorageItem>>;

    /// Upsert a record under `item.key`.
    fn put(&self, item: &StorageItem) -> KvResult<()>;

    /// Remove a record. Removing an absent key is not an error.
    fn delete(&self, key: &str) -> KvResult<()>;

    /// Every record, ordered by key.
    fn scan_all(&self) -> KvResult<Vec<StorageItem>>;
}

impl<S: DurableStore + ?Sized> DurableStore for Arc<S> {
    fn get(&self, key: &str) -> KvResult<Option<StorageItem>> {
        (**self).get(key)
    }

    fn put(&self, item: &StorageItem) -> KvResult<()> {
        (**self).put(item)
    }

    fn delete(&self, key: &str) -> KvResult<()> {
        (**self).delete(key)
    }

    fn scan_all(&self) -> KvResult<Vec<StorageItem>> {
        (**self).scan_all()
    }
}

/// Volatile store for tests and ephemeral deployments.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    items: Arc<RwLock<BTreeMap<String, StorageItem>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records, expired ones included.
    pub fn len(&self) -> usize {
        self.items.read().map(|items| items.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DurableStore for MemoryStore {
    fn get(&self, key: &str) -> KvResult<Option<StorageItem>> {
        let items = self.items.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(items.get(key).cloned())
    }

    fn put(&self, item: &StorageItem) -> KvResult<()> {
        let mut items = self.items.write().map_err(|_| StorageError::LockPoisoned)?;
        items.insert(item.key.clone(), item.clone());
        Ok(())
    }

    fn delete(&self, key: &str) -> KvResult<()> {
        let mut items = self.items.write().map_err(|_| StorageError::LockPoisoned)?;
        items.remove(key);
        Ok(())
    }

    fn scan_all(&self) -> KvResult<Vec<StorageItem>> {
        let items = self.items.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(items.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvault_core::{Acl, Origin};
    use serde_json::json;

    fn item(key: &str, value: serde_json::Value) -> StorageItem {
        StorageItem {
            key: key.to_string(),
            value,
            acl: Acl::for_creator(&Origin::parse("https://a").expect("origin should parse")),
            expires_at: None,
        }
    }

    #[test]
    fn test_put_get_overwrite() {
        let store = MemoryStore::new();
        store.put(&item("k", json!(1))).expect("put should succeed");
        store.put(&item("k", json!(2))).expect("put should succeed");

        let loaded = store.get("k").expect("get should succeed");
        assert_eq!(loaded.map(|i| i.value), Some(json!(2)));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_delete_absent_is_ok() {
        let store = MemoryStore::new();
        store.delete("missing").expect("delete should succeed");
        assert!(store.is_empty());
    }

    #[test]
    fn test_scan_all_is_key_ordered() {
        let store = MemoryStore::new();
        for key in ["b", "c", "a"] {
            store.put(&item(key, json!(key))).expect("put should succeed");
        }
        let keys: Vec<String> = store
            .scan_all()
            .expect("scan should succeed")
            .into_iter()
            .map(|i| i.key)
            .collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_clones_share_state() {
        let store = MemoryStore::new();
        let shared = store.clone();
        store.put(&item("k", json!(true))).expect("put should succeed");
        assert!(shared.get("k").expect("get should succeed").is_some());
    }
}

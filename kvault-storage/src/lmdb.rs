//! LMDB-backed durable store.
//!
//! Uses the heed crate (Rust bindings for LMDB) to persist items as JSON
//! records in a single unnamed database keyed by the item key.
//!
//! # Transactions
//!
//! - Read transactions for `get` and `scan_all`
//! - One write transaction per `put` / `delete`, committed before returning,
//!   so a mutation is durable before the storage core answers the caller

use std::path::Path;

use heed::types::{Bytes, Str};
use heed::{Database, Env, EnvOpenOptions};
use kvault_core::{KvError, KvResult, StorageError, StorageItem};

/// Error type for opening an LMDB environment.
#[derive(Debug, thiserror::Error)]
pub enum LmdbStoreError {
    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    /// Failed to open the database within the environment.
    #[error("Failed to open database: {0}")]
    DbOpen(String),

    /// Transaction error.
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LmdbStoreError> for KvError {
    fn from(e: LmdbStoreError) -> Self {
        KvError::backend("open", e)
    }
}

/// Durable store on a memory-mapped LMDB environment.
///
/// # Example
///
/// ```ignore
/// let store = LmdbStore::open("/var/lib/kvault", 64)?;
/// let core = StorageCore::new(Arc::new(store), publisher);
/// ```
pub struct LmdbStore {
    env: Env,
    db: Database<Str, Bytes>,
}

impl LmdbStore {
    /// Open (or create) the store under `path`.
    ///
    /// # Arguments
    ///
    /// * `path` - Directory where LMDB files will be stored
    /// * `max_size_mb` - Maximum size of the database in megabytes
    pub fn open<P: AsRef<Path>>(path: P, max_size_mb: usize) -> Result<Self, LmdbStoreError> {
        std::fs::create_dir_all(&path)?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(max_size_mb * 1024 * 1024)
                .max_dbs(1)
                .open(path.as_ref())
        }
        .map_err(|e| LmdbStoreError::EnvOpen(e.to_string()))?;

        let mut wtxn = env
            .write_txn()
            .map_err(|e| LmdbStoreError::Transaction(e.to_string()))?;

        let db: Database<Str, Bytes> = env
            .create_database(&mut wtxn, None)
            .map_err(|e| LmdbStoreError::DbOpen(e.to_string()))?;

        wtxn.commit()
            .map_err(|e| LmdbStoreError::Transaction(e.to_string()))?;

        Ok(Self { env, db })
    }

    fn decode(key: &str, bytes: &[u8]) -> KvResult<StorageItem> {
        serde_json::from_slice(bytes).map_err(|e| {
            StorageError::Serialization {
                key: key.to_string(),
                reason: e.to_string(),
            }
            .into()
        })
    }
}

impl super::DurableStore for LmdbStore {
    fn get(&self, key: &str) -> KvResult<Option<StorageItem>> {
        let rtxn = self
            .env
            .read_txn()
            .map_err(|e| KvError::backend("get", e))?;

        match self.db.get(&rtxn, key) {
            Ok(Some(bytes)) => Self::decode(key, bytes).map(Some),
            Ok(None) => Ok(None),
            Err(e) => Err(KvError::backend("get", e)),
        }
    }

    fn put(&self, item: &StorageItem) -> KvResult<()> {
        let bytes = serde_json::to_vec(item).map_err(|e| StorageError::Serialization {
            key: item.key.clone(),
            reason: e.to_string(),
        })?;

        let mut wtxn = self
            .env
            .write_txn()
            .map_err(|e| KvError::backend("put", e))?;

        self.db
            .put(&mut wtxn, &item.key, &bytes)
            .map_err(|e| KvError::backend("put", e))?;

        wtxn.commit().map_err(|e| KvError::backend("put", e))
    }

    fn delete(&self, key: &str) -> KvResult<()> {
        let mut wtxn = self
            .env
            .write_txn()
            .map_err(|e| KvError::backend("delete", e))?;

        self.db
            .delete(&mut wtxn, key)
            .map_err(|e| KvError::backend("delete", e))?;

        wtxn.commit().map_err(|e| KvError::backend("delete", e))
    }

    fn scan_all(&self) -> KvResult<Vec<StorageItem>> {
        let rtxn = self
            .env
            .read_txn()
            .map_err(|e| KvError::backend("scan", e))?;

        let iter = self
            .db
            .iter(&rtxn)
            .map_err(|e| KvError::backend("scan", e))?;

        let mut items = Vec::new();
        for result in iter {
            let (key, bytes) = result.map_err(|e| KvError::backend("scan", e))?;
            items.push(Self::decode(key, bytes)?);
        }
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DurableStore;
    use kvault_core::{Acl, ErrorKind, Origin};
    use serde_json::json;
    use tempfile::TempDir;

    fn create_test_store() -> (LmdbStore, TempDir) {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        let store = LmdbStore::open(temp_dir.path(), 10).expect("store creation should succeed");
        (store, temp_dir)
    }

    fn make_item(key: &str) -> StorageItem {
        StorageItem {
            key: key.to_string(),
            value: json!({"name": key}),
            acl: Acl::for_creator(&Origin::parse("https://a").expect("origin should parse")),
            expires_at: Some(chrono::Utc::now()),
        }
    }

    #[test]
    fn test_put_and_get() {
        let (store, _temp_dir) = create_test_store();
        let item = make_item("profile");

        store.put(&item).expect("put should succeed");
        let loaded = store.get("profile").expect("get should succeed");

        assert_eq!(loaded, Some(item));
    }

    #[test]
    fn test_get_nonexistent() {
        let (store, _temp_dir) = create_test_store();
        assert!(store.get("missing").expect("get should succeed").is_none());
    }

    #[test]
    fn test_delete() {
        let (store, _temp_dir) = create_test_store();
        store.put(&make_item("k")).expect("put should succeed");
        store.delete("k").expect("delete should succeed");
        store.delete("k").expect("second delete should succeed");
        assert!(store.get("k").expect("get should succeed").is_none());
    }

    #[test]
    fn test_scan_all_sorted() {
        let (store, _temp_dir) = create_test_store();
        for key in ["zeta", "alpha", "mid"] {
            store.put(&make_item(key)).expect("put should succeed");
        }
        let keys: Vec<String> = store
            .scan_all()
            .expect("scan should succeed")
            .into_iter()
            .map(|i| i.key)
            .collect();
        assert_eq!(keys, vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn test_reopen_preserves_records() {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        {
            let store = LmdbStore::open(temp_dir.path(), 10).expect("open should succeed");
            store.put(&make_item("durable")).expect("put should succeed");
        }
        let reopened = LmdbStore::open(temp_dir.path(), 10).expect("reopen should succeed");
        assert!(reopened.get("durable").expect("get should succeed").is_some());
    }

    #[test]
    fn test_corrupt_record_is_backend_error() {
        let (store, _temp_dir) = create_test_store();
        {
            let mut wtxn = store.env.write_txn().expect("write txn should open");
            store
                .db
                .put(&mut wtxn, "broken", b"not json")
                .expect("raw put should succeed");
            wtxn.commit().expect("commit should succeed");
        }
        let err = store.get("broken").expect_err("decode should fail");
        assert_eq!(err.kind(), ErrorKind::StorageBackendError);
    }
}

//! The authoritative storage core.
//!
//! Sole writer of the durable store and arbiter of every permission and
//! expiry decision. Every operation takes the requesting tenant as supplied
//! by the transport, never from the request payload.
//!
//! # Ordering guarantees
//!
//! - `set`, `remove`, lazy eviction, and each per-key step of `clear` run
//!   under the key's lock, so "load existing, check ACL, persist" is atomic
//!   with respect to other writers of that key.
//! - Reads take no lock. The durable store returns whole records, so a racing
//!   read observes either the pre-write or the post-write item.
//! - Change events are published after the store accepts the mutation and
//!   while the key lock is still held, so events for one key are emitted in
//!   mutation order. A failed or denied operation publishes nothing.
//!
//! # Expiry
//!
//! Expiry is lazy. `get`, `set`, and `remove` evict an expired item they
//! observe (delete plus a `remove` event) before anything else, so the
//! expiry check always precedes the permission check. `keys` hides expired
//! items but leaves their eviction to the next keyed access.

use std::sync::Arc;

use kvault_core::{
    ChangeEvent, Clock, Command, KvError, KvResult, Origin, Permission, SetOptions, StorageItem,
    SystemClock, Timestamp, ValidationError,
};
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::durable::DurableStore;
use crate::locks::KeyLocks;
use crate::publisher::ChangePublisher;

/// ACL- and TTL-enforcing front of a [`DurableStore`].
pub struct StorageCore {
    store: Arc<dyn DurableStore>,
    publisher: Arc<dyn ChangePublisher>,
    clock: Arc<dyn Clock>,
    locks: KeyLocks,
}

impl StorageCore {
    /// Create a core that reads time from the wall clock.
    pub fn new(store: Arc<dyn DurableStore>, publisher: Arc<dyn ChangePublisher>) -> Self {
        Self::with_clock(store, publisher, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<dyn DurableStore>,
        publisher: Arc<dyn ChangePublisher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            publisher,
            clock,
            locks: KeyLocks::new(),
        }
    }

    /// Run one decoded command for `tenant`.
    ///
    /// `set`, `remove`, and `clear` yield no value; `get` yields the stored
    /// value or nothing; `keys` yields a JSON array of key strings.
    pub async fn execute(&self, tenant: &Origin, command: Command) -> KvResult<Option<Value>> {
        match command {
            Command::Set {
                key,
                value,
                options,
            } => self.set(tenant, &key, value, options).await.map(|_| None),
            Command::Get { key } => self.get(tenant, &key).await,
            Command::Remove { key } => self.remove(tenant, &key).await.map(|_| None),
            Command::Clear => self.clear(tenant).await.map(|_| None),
            Command::Keys => {
                let keys = self.keys(tenant).await?;
                Ok(Some(Value::Array(keys.into_iter().map(Value::String).collect())))
            }
        }
    }

    // ========================================================================
    // OPERATIONS
    // ========================================================================

    /// Create or overwrite `key`.
    ///
    /// A new item gets `options.acl` (read defaulting to the wildcard, write
    /// defaulting to the creator, with the creator always added). An existing
    /// item may only be overwritten by a tenant on its write list; that tenant
    /// may replace either list. Expiry is recomputed from `options` on every
    /// write: omitting the TTL makes the item permanent.
    pub async fn set(
        &self,
        tenant: &Origin,
        key: &str,
        value: Value,
        options: SetOptions,
    ) -> KvResult<()> {
        validate_key(key)?;
        options.validate()?;

        let _guard = self.locks.lock(key).await;
        let now = self.clock.now();

        let acl = match self.load_live(key, now)? {
            Some(existing) => {
                if !existing.can(Permission::Write, tenant) {
                    return Err(self.deny(tenant, key, Permission::Write));
                }
                match &options.acl {
                    Some(patch) => patch.resolve_for_update(&existing.acl),
                    None => existing.acl,
                }
            }
            None => options.acl.clone().unwrap_or_default().resolve_for_create(tenant),
        };

        let item = StorageItem {
            key: key.to_string(),
            value,
            acl,
            expires_at: options.expires_at(now)?,
        };

        self.store.put(&item).map_err(|e| self.backend_fault("set", key, e))?;
        debug!(tenant = %tenant, key, expires_at = ?item.expires_at, "Item stored");
        self.publisher.publish(ChangeEvent::set(key));
        Ok(())
    }

    /// Read `key`. Absent and expired items read as `None`.
    pub async fn get(&self, tenant: &Origin, key: &str) -> KvResult<Option<Value>> {
        validate_key(key)?;

        let Some(mut item) = self.store.get(key).map_err(|e| self.backend_fault("get", key, e))?
        else {
            return Ok(None);
        };

        if item.is_expired(self.clock.now()) {
            // A writer may have replaced the item since the unlocked read.
            let _guard = self.locks.lock(key).await;
            match self.load_live(key, self.clock.now())? {
                Some(live) => item = live,
                None => return Ok(None),
            }
        }

        if !item.can(Permission::Read, tenant) {
            return Err(self.deny(tenant, key, Permission::Read));
        }

        Ok(Some(item.value))
    }

    /// Delete `key`. Deleting an absent (or already expired) key succeeds
    /// without a permission check.
    pub async fn remove(&self, tenant: &Origin, key: &str) -> KvResult<()> {
        validate_key(key)?;

        let _guard = self.locks.lock(key).await;
        let Some(existing) = self.load_live(key, self.clock.now())? else {
            return Ok(());
        };

        if !existing.can(Permission::Write, tenant) {
            return Err(self.deny(tenant, key, Permission::Write));
        }

        self.store
            .delete(key)
            .map_err(|e| self.backend_fault("remove", key, e))?;
        debug!(tenant = %tenant, key, "Item removed");
        self.publisher.publish(ChangeEvent::remove(key));
        Ok(())
    }

    /// Delete every item `tenant` may write; leave everything else intact.
    ///
    /// Each candidate is re-checked under its key lock, so a concurrent `set`
    /// to the same key either lands before the deletion (and is cleared) or
    /// after it (and survives). Returns the number of deleted items.
    pub async fn clear(&self, tenant: &Origin) -> KvResult<usize> {
        let candidates = self
            .store
            .scan_all()
            .map_err(|e| self.backend_fault("clear", "*", e))?;

        let mut removed = 0;
        for candidate in candidates {
            if !candidate.can(Permission::Write, tenant) {
                continue;
            }

            let key = candidate.key;
            let _guard = self.locks.lock(&key).await;
            let current = self
                .store
                .get(&key)
                .map_err(|e| self.backend_fault("clear", &key, e))?;

            if current.is_some_and(|item| item.can(Permission::Write, tenant)) {
                self.store
                    .delete(&key)
                    .map_err(|e| self.backend_fault("clear", &key, e))?;
                self.publisher.publish(ChangeEvent::remove(key.as_str()));
                removed += 1;
            }
        }

        debug!(tenant = %tenant, removed, "Cleared writable items");
        Ok(removed)
    }

    /// Keys `tenant` may read, in key order. Expired items are skipped but
    /// not evicted.
    pub async fn keys(&self, tenant: &Origin) -> KvResult<Vec<String>> {
        let now = self.clock.now();
        let items = self
            .store
            .scan_all()
            .map_err(|e| self.backend_fault("keys", "*", e))?;

        Ok(items
            .into_iter()
            .filter(|item| !item.is_expired(now) && item.can(Permission::Read, tenant))
            .map(|item| item.key)
            .collect())
    }

    // ========================================================================
    // HELPERS
    // ========================================================================

    /// Load `key`, evicting it if it has expired. Caller must hold the key lock.
    fn load_live(&self, key: &str, now: Timestamp) -> KvResult<Option<StorageItem>> {
        let item = self
            .store
            .get(key)
            .map_err(|e| self.backend_fault("load", key, e))?;

        match item {
            Some(item) if item.is_expired(now) => {
                self.store
                    .delete(key)
                    .map_err(|e| self.backend_fault("evict", key, e))?;
                debug!(key, expired_at = ?item.expires_at, "Evicted expired item");
                self.publisher.publish(ChangeEvent::remove(key));
                Ok(None)
            }
            other => Ok(other),
        }
    }

    fn deny(&self, tenant: &Origin, key: &str, permission: Permission) -> KvError {
        warn!(tenant = %tenant, key, %permission, "Permission denied");
        KvError::permission_denied(tenant, key, permission)
    }

    fn backend_fault(&self, operation: &str, key: &str, err: KvError) -> KvError {
        error!(operation, key, error = %err, "Durable store failure");
        match err {
            KvError::Storage(_) => err,
            other => KvError::backend(operation, other),
        }
    }
}

/// Longest accepted key, in UTF-8 bytes. Matches LMDB's default maximum key
/// size so every backend accepts the same keys.
pub const MAX_KEY_BYTES: usize = 511;

fn validate_key(key: &str) -> Result<(), ValidationError> {
    if key.is_empty() {
        return Err(ValidationError::RequiredFieldMissing {
            field: "key".to_string(),
        });
    }
    if key.len() > MAX_KEY_BYTES {
        return Err(ValidationError::InvalidValue {
            field: "key".to_string(),
            reason: format!("{} bytes exceeds the {} byte limit", key.len(), MAX_KEY_BYTES),
        });
    }
    Ok(())
}


#[cfg(test)]
mod prop_tests {
    use super::*;
    use crate::durable::MemoryStore;
    use crate::publisher::BroadcastPublisher;
    use proptest::prelude::*;
    use serde_json::json;

    fn origin_strategy() -> impl Strategy<Value = Origin> {
        "https://[a-z]{1,6}".prop_map(|s| Origin::parse(s).expect("valid origin"))
    }

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("runtime should build")
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Property: with default ACLs, a second tenant can never overwrite
        /// the first tenant's key, and the stored value stays the creator's.
        #[test]
        fn prop_default_acl_blocks_foreign_writes(
            t1 in origin_strategy(),
            t2 in origin_strategy(),
            key in "[a-z]{1,12}",
            v1 in any::<i64>(),
            v2 in any::<i64>(),
        ) {
            prop_assume!(t1 != t2);
            let rt = runtime();
            let store = MemoryStore::new();
            let core = StorageCore::new(Arc::new(store.clone()), Arc::new(BroadcastPublisher::new(8)));

            rt.block_on(async {
                core.set(&t1, &key, json!(v1), SetOptions::default()).await
            }).expect("creator set should succeed");
            let denied = rt.block_on(async {
                core.set(&t2, &key, json!(v2), SetOptions::default()).await
            });

            prop_assert!(denied.is_err());
            let stored = store.get(&key).expect("get should succeed").expect("item exists");
            prop_assert_eq!(stored.value, json!(v1));
        }

        /// Property: clear removes exactly the keys the caller can write.
        #[test]
        fn prop_clear_removes_exactly_writable(
            owners in proptest::collection::vec(0usize..3, 1..12),
        ) {
            let tenants = [
                Origin::parse("https://a").expect("valid origin"),
                Origin::parse("https://b").expect("valid origin"),
                Origin::parse("https://c").expect("valid origin"),
            ];
            let rt = runtime();
            let store = MemoryStore::new();
            let core = StorageCore::new(Arc::new(store.clone()), Arc::new(BroadcastPublisher::new(64)));

            rt.block_on(async {
                for (i, owner) in owners.iter().enumerate() {
                    core.set(&tenants[*owner], &format!("k{}", i), json!(i), SetOptions::default())
                        .await
                        .expect("set should succeed");
                }
                core.clear(&tenants[0]).await.expect("clear should succeed");
            });

            let remaining = store.scan_all().expect("scan should succeed");
            let expected = owners.iter().filter(|o| **o != 0).count();
            prop_assert_eq!(remaining.len(), expected);
            for item in remaining {
                prop_assert!(!item.can(Permission::Write, &tenants[0]));
            }
        }
    }
}

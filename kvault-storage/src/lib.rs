//! kvault Storage - Durable Backends and the Storage Core
//!
//! The storage core is the single authority over persisted items. It owns
//! a [`DurableStore`], enforces per-item ACLs and lazy TTL expiry, and
//! announces every mutation through a [`ChangePublisher`].
//!
//! # Backends
//!
//! - [`MemoryStore`]: volatile, for tests and ephemeral deployments
//! - [`LmdbStore`]: memory-mapped LMDB environment via heed

pub mod durable;
pub mod engine;
pub mod lmdb;
pub mod locks;
pub mod publisher;

pub use durable::{DurableStore, MemoryStore};
pub use engine::{StorageCore, MAX_KEY_BYTES};
pub use lmdb::{LmdbStore, LmdbStoreError};
pub use locks::KeyLocks;
pub use publisher::{BroadcastPublisher, ChangePublisher};

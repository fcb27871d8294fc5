//! kvault Test Utilities
//!
//! Shared test infrastructure for the kvault workspace:
//! - Mock stores and publishers with failure injection and recording
//! - A harness wiring hub, storage core, and client proxies together
//! - Proptest generators for origins, keys, and values

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

pub use kvault_channel::LocalHub;
pub use kvault_client::{ClientConfig, ClientProxy, ConnectionState};
pub use kvault_core::{
    AclEntry, AclPatch, ChangeAction, ChangeEvent, ErrorKind, KvError, KvResult, ManualClock,
    Origin, SetOptions, StorageError, StorageItem,
};
pub use kvault_storage::{ChangePublisher, DurableStore, MemoryStore, StorageCore};

use kvault_server::{CoreService, ServerHandle};

/// Endpoint name every harness hub uses.
pub const TEST_ENDPOINT: &str = "kvault-test";

// ============================================================================
// MOCKS
// ============================================================================

/// Memory-backed store whose reads or writes can be made to fail.
#[derive(Debug, Default)]
pub struct FailingStore {
    inner: MemoryStore,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl FailingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The records as persisted, bypassing failure injection.
    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check(&self, flag: &AtomicBool, operation: &str) -> KvResult<()> {
        if flag.load(Ordering::SeqCst) {
            return Err(StorageError::Backend {
                operation: operation.to_string(),
                reason: "injected failure".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

impl DurableStore for FailingStore {
    fn get(&self, key: &str) -> KvResult<Option<StorageItem>> {
        self.check(&self.fail_reads, "get")?;
        self.inner.get(key)
    }

    fn put(&self, item: &StorageItem) -> KvResult<()> {
        self.check(&self.fail_writes, "put")?;
        self.inner.put(item)
    }

    fn delete(&self, key: &str) -> KvResult<()> {
        self.check(&self.fail_writes, "delete")?;
        self.inner.delete(key)
    }

    fn scan_all(&self) -> KvResult<Vec<StorageItem>> {
        self.check(&self.fail_reads, "scan")?;
        self.inner.scan_all()
    }
}

/// Publisher that records every event, optionally forwarding it on.
#[derive(Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<ChangeEvent>>,
    forward: Option<Arc<dyn ChangePublisher>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn forwarding(inner: Arc<dyn ChangePublisher>) -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            forward: Some(inner),
        }
    }

    /// Everything published so far.
    pub fn events(&self) -> Vec<ChangeEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Drain the recorded events.
    pub fn take(&self) -> Vec<ChangeEvent> {
        self.events
            .lock()
            .map(|mut e| std::mem::take(&mut *e))
            .unwrap_or_default()
    }

    /// Recorded events for `key` only.
    pub fn events_for(&self, key: &str) -> Vec<ChangeEvent> {
        self.events().into_iter().filter(|e| e.key == key).collect()
    }
}

impl ChangePublisher for RecordingPublisher {
    fn publish(&self, event: ChangeEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
        if let Some(inner) = &self.forward {
            inner.publish(event);
        }
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

/// Parse an origin literal, panicking on invalid input.
pub fn origin(raw: &str) -> Origin {
    Origin::parse(raw).expect("test origin should be valid")
}

/// A hub, a storage core on a [`FailingStore`] with a [`ManualClock`], and
/// a factory for proxies.
pub struct TestHarness {
    pub hub: LocalHub,
    pub store: Arc<FailingStore>,
    pub clock: ManualClock,
    pub events: Arc<RecordingPublisher>,
    server: Option<ServerHandle>,
}

impl TestHarness {
    /// Harness with the core already attached. Needs a tokio runtime.
    pub fn start() -> Self {
        let mut harness = Self::without_core();
        harness.attach_core();
        harness
    }

    /// Harness whose core has not attached yet; proxies will wait in
    /// `Initializing` until [`TestHarness::attach_core`].
    pub fn without_core() -> Self {
        let hub = LocalHub::new(TEST_ENDPOINT, 256);
        let events = Arc::new(RecordingPublisher::forwarding(Arc::new(hub.publisher())));
        Self {
            hub,
            store: Arc::new(FailingStore::new()),
            clock: ManualClock::starting_now(),
            events,
            server: None,
        }
    }

    pub fn attach_core(&mut self) {
        if self.server.is_some() {
            return;
        }
        let link = self.hub.attach_core().expect("hub should accept the core");
        let core = StorageCore::with_clock(
            self.store.clone(),
            self.events.clone(),
            Arc::new(self.clock.clone()),
        );
        self.server = Some(CoreService::new(Arc::new(core), link).spawn());
    }

    /// Stop the core and wait for it to detach.
    pub async fn stop_core(&mut self) {
        if let Some(server) = self.server.take() {
            server.shutdown().await;
        }
    }

    pub fn core(&self) -> &Arc<StorageCore> {
        self.server
            .as_ref()
            .expect("core should be attached")
            .core()
    }

    pub fn config(&self, origin_raw: &str) -> ClientConfig {
        ClientConfig::new(origin(origin_raw), TEST_ENDPOINT).with_connect_timeout_ms(2_000)
    }

    pub fn proxy(&self, origin_raw: &str) -> ClientProxy {
        self.proxy_with(self.config(origin_raw))
    }

    pub fn proxy_with(&self, config: ClientConfig) -> ClientProxy {
        ClientProxy::for_hub(&self.hub, config).expect("proxy config should be valid")
    }

    /// The stored value under `key`, read directly from the store.
    pub fn stored_value(&self, key: &str) -> Option<serde_json::Value> {
        self.store
            .inner()
            .get(key)
            .expect("memory store read should succeed")
            .map(|item| item.value)
    }
}

/// Wait for the next `action` event on `key` from `feed`, skipping others.
/// Panics after a second.
pub async fn await_change(
    feed: &mut tokio::sync::broadcast::Receiver<ChangeEvent>,
    key: &str,
    action: ChangeAction,
) -> ChangeEvent {
    let wait = async {
        loop {
            match feed.recv().await {
                Ok(event) if event.key == key && event.action == action => return event,
                Ok(_) => continue,
                Err(e) => panic!("change feed closed: {}", e),
            }
        }
    };
    tokio::time::timeout(std::time::Duration::from_secs(1), wait)
        .await
        .expect("change event should arrive")
}

// ============================================================================
// ASSERTIONS
// ============================================================================

/// Assert that `result` failed with `kind`.
pub fn assert_kind<T: std::fmt::Debug>(result: KvResult<T>, kind: ErrorKind) -> KvError {
    match result {
        Ok(value) => panic!("expected {} error, got Ok({:?})", kind, value),
        Err(err) => {
            assert_eq!(err.kind(), kind, "unexpected error: {}", err);
            err
        }
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for kvault types.

    use super::*;
    use proptest::prelude::*;
    use serde_json::{json, Value};

    pub fn arb_origin() -> impl Strategy<Value = Origin> {
        "https://[a-z]{1,8}(\\.[a-z]{2,4})?".prop_map(|s| origin(&s))
    }

    /// Two different origins.
    pub fn arb_distinct_origins() -> impl Strategy<Value = (Origin, Origin)> {
        (arb_origin(), arb_origin()).prop_filter("origins must differ", |(a, b)| a != b)
    }

    pub fn arb_key() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9_:-]{0,15}"
    }

    /// Non-null JSON values, nested at most two levels.
    pub fn arb_value() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(|n| json!(n)),
            "[a-zA-Z0-9 ]{0,12}".prop_map(Value::String),
        ];
        leaf.prop_recursive(2, 16, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                prop::collection::btree_map("[a-z]{1,6}", inner, 0..4)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        })
    }

    pub fn arb_acl_entry() -> impl Strategy<Value = AclEntry> {
        prop_oneof![
            1 => Just(AclEntry::Any),
            4 => arb_origin().prop_map(AclEntry::Origin),
        ]
    }

    pub fn arb_acl_patch() -> impl Strategy<Value = AclPatch> {
        (
            prop::option::of(prop::collection::vec(arb_acl_entry(), 0..3)),
            prop::option::of(prop::collection::vec(arb_acl_entry(), 0..3)),
        )
            .prop_map(|(read, write)| AclPatch { read, write })
    }
}

//! Outstanding requests keyed by correlation id.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use kvault_core::{KvError, KvResult, RequestId};
use serde_json::Value;
use tokio::sync::oneshot;

pub type Completion = oneshot::Sender<KvResult<Option<Value>>>;

#[derive(Debug, Default)]
pub struct PendingRequests {
    waiting: Mutex<HashMap<RequestId, Completion>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    fn waiting(&self) -> MutexGuard<'_, HashMap<RequestId, Completion>> {
        self.waiting.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn register(&self, request_id: RequestId) -> oneshot::Receiver<KvResult<Option<Value>>> {
        let (tx, rx) = oneshot::channel();
        self.waiting().insert(request_id, tx);
        rx
    }

    /// Settle `request_id`. Returns `false` if nothing was waiting for it.
    pub fn complete(&self, request_id: RequestId, result: KvResult<Option<Value>>) -> bool {
        match self.waiting().remove(&request_id) {
            // The caller may have stopped waiting; that still counts as matched.
            Some(tx) => {
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }

    /// Stop tracking `request_id` without settling it.
    pub fn forget(&self, request_id: RequestId) -> bool {
        self.waiting().remove(&request_id).is_some()
    }

    /// Settle everything with `err`. Returns how many were rejected.
    pub fn reject_all(&self, err: &KvError) -> usize {
        let drained: Vec<Completion> = self.waiting().drain().map(|(_, tx)| tx).collect();
        let count = drained.len();
        for tx in drained {
            let _ = tx.send(Err(err.clone()));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.waiting().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvault_core::{ClientError, ErrorKind};
    use serde_json::json;

    #[tokio::test]
    async fn test_complete_routes_by_id() {
        let pending = PendingRequests::new();
        let first = pending.register(1);
        let second = pending.register(2);

        assert!(pending.complete(2, Ok(Some(json!("two")))));
        assert!(pending.complete(1, Ok(None)));

        assert_eq!(first.await.expect("settled"), Ok(None));
        assert_eq!(second.await.expect("settled"), Ok(Some(json!("two"))));
        assert!(pending.is_empty());
    }

    #[test]
    fn test_unknown_id_is_unmatched() {
        let pending = PendingRequests::new();
        assert!(!pending.complete(42, Ok(None)));
    }

    #[tokio::test]
    async fn test_reject_all_drains() {
        let pending = PendingRequests::new();
        let a = pending.register(1);
        let b = pending.register(2);

        let err = KvError::from(ClientError::CoreUnavailable { cause: None });
        assert_eq!(pending.reject_all(&err), 2);
        assert!(pending.is_empty());

        for rx in [a, b] {
            let result = rx.await.expect("settled");
            assert_eq!(result.expect_err("rejected").kind(), ErrorKind::CoreUnavailable);
        }
    }

    #[test]
    fn test_forget() {
        let pending = PendingRequests::new();
        let _rx = pending.register(7);
        assert!(pending.forget(7));
        assert!(!pending.forget(7));
        assert_eq!(pending.len(), 0);
    }
}

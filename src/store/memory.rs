use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{BlobStore, Cas, Record};
use crate::error::StoreError;
use crate::model::WorkflowState;

struct Entry {
    rev: u64,
    cas: u64,
    state: WorkflowState,
}

/// An in-process `BlobStore` for tests and single-process deployments. Linearizable because
/// every operation holds the mutex for its entire duration (no `.await` while locked).
#[derive(Default)]
pub struct InMemoryBlobStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn get(&self, key: &str, cancel: &CancellationToken) -> Result<Option<Record>, StoreError> {
        // A `std::sync::Mutex` lock never suspends, so there is no future to race against
        // `cancel.cancelled()` here; the lock acquisition itself is this backend's only I/O
        // boundary, checked cooperatively before it's taken.
        if cancel.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        let entries = self.entries.lock().expect("blob store mutex poisoned");
        Ok(entries.get(key).map(|e| Record {
            rev: e.rev,
            state: e.state.clone(),
            cas: e.cas.to_string(),
        }))
    }

    async fn put(
        &self,
        key: &str,
        state: &WorkflowState,
        cas: Option<&Cas>,
        cancel: &CancellationToken,
    ) -> Result<u64, StoreError> {
        if cancel.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        let mut entries = self.entries.lock().expect("blob store mutex poisoned");

        match (entries.get(key), cas) {
            (None, None) => {}
            (None, Some(_)) => {
                return Err(StoreError::Conflict { key: key.to_string() });
            }
            (Some(existing), Some(given)) => {
                if existing.cas.to_string() != *given {
                    return Err(StoreError::Conflict { key: key.to_string() });
                }
            }
            (Some(_), None) => {
                return Err(StoreError::Conflict { key: key.to_string() });
            }
        }

        let next_rev = entries.get(key).map(|e| e.rev + 1).unwrap_or(1);
        let next_cas = entries.get(key).map(|e| e.cas + 1).unwrap_or(1);

        entries.insert(
            key.to_string(),
            Entry {
                rev: next_rev,
                cas: next_cas,
                state: state.clone(),
            },
        );

        Ok(next_rev)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn wf(id: &str) -> WorkflowState {
        WorkflowState::new(id.to_string(), "dec".into(), json!({}), 0)
    }

    #[tokio::test]
    async fn create_if_absent_then_conflicts_on_retry() {
        let store = InMemoryBlobStore::new();
        let cancel = CancellationToken::new();
        store.put("wf/a", &wf("a"), None, &cancel).await.unwrap();
        let err = store.put("wf/a", &wf("a"), None, &cancel).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
    }

    #[tokio::test]
    async fn compare_and_write_requires_matching_cas() {
        let store = InMemoryBlobStore::new();
        let cancel = CancellationToken::new();
        store.put("wf/a", &wf("a"), None, &cancel).await.unwrap();
        let rec = store.get("wf/a", &cancel).await.unwrap().unwrap();

        store.put("wf/a", &wf("a"), Some(&rec.cas), &cancel).await.unwrap();

        let err = store.put("wf/a", &wf("a"), Some(&rec.cas), &cancel).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
    }

    #[tokio::test]
    async fn missing_record_requires_none_cas() {
        let store = InMemoryBlobStore::new();
        let cancel = CancellationToken::new();
        let err = store
            .put("wf/missing", &wf("missing"), Some(&"1".to_string()), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits_before_touching_state() {
        let store = InMemoryBlobStore::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = store.get("wf/a", &cancel).await.unwrap_err();
        assert!(matches!(err, StoreError::Cancelled));

        let err = store.put("wf/a", &wf("a"), None, &cancel).await.unwrap_err();
        assert!(matches!(err, StoreError::Cancelled));
    }
}

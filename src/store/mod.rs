pub mod memory;
#[cfg(feature = "aws")]
pub mod s3;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::StoreError;
use crate::model::WorkflowState;

/// Opaque compare-and-swap token. Treated as opaque everywhere except inside a given `BlobStore`
/// implementation (§4.1): the in-memory store uses an incrementing counter, the S3 store uses
/// the object's `ETag`.
pub type Cas = String;

#[derive(Debug, Clone)]
pub struct Record {
    pub rev: u64,
    pub state: WorkflowState,
    pub cas: Cas,
}

/// A single-blob CAS-versioned persistence contract keyed by workflow id (§4.1). Implementations
/// must be linearizable per key and must never perform a partial write. Every operation takes a
/// `CancellationToken` and must race it cooperatively against its own I/O boundary (§5) rather
/// than accept and ignore it.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn get(&self, key: &str, cancel: &CancellationToken) -> Result<Option<Record>, StoreError>;

    /// Writes `state` under `key`. If `cas` is `None`, succeeds only if no record currently
    /// exists (create-if-absent); if `cas` is `Some`, succeeds only if the stored CAS token
    /// equals it exactly (compare-and-write). Returns the new revision on success.
    async fn put(
        &self,
        key: &str,
        state: &WorkflowState,
        cas: Option<&Cas>,
        cancel: &CancellationToken,
    ) -> Result<u64, StoreError>;
}

pub mod memory;
#[cfg(feature = "aws")]
pub mod sqs;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::QueueError;

/// The queue message body (§6.2): a nudge telling a worker which workflow/task became ready.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkMessage {
    #[serde(rename = "wfId")]
    pub wf_id: String,
    #[serde(rename = "taskId")]
    pub task_id: String,
}

#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub id: String,
    pub receipt: String,
    pub body: String,
}

/// Transport for "nudge" messages from the engine to workers (§4.2). All operations accept a
/// `CancellationToken` so a caller can abort cooperatively at the next I/O boundary (§5).
#[async_trait]
pub trait WorkQueue: Send + Sync {
    async fn send(&self, body: &str, cancel: &CancellationToken) -> Result<(), QueueError>;

    async fn receive(
        &self,
        max: usize,
        wait_seconds: u64,
        cancel: &CancellationToken,
    ) -> Result<Vec<ReceivedMessage>, QueueError>;

    async fn delete(&self, id: &str, receipt: &str, cancel: &CancellationToken) -> Result<(), QueueError>;
}

/// Wraps any `WorkQueue` so malformed payloads (not JSON, or missing `wfId`) are deleted instead
/// of handed to the caller (§6.2 "poison loops").
pub struct ValidatingQueue<Q> {
    inner: Q,
}

impl<Q: WorkQueue> ValidatingQueue<Q> {
    pub fn new(inner: Q) -> Self {
        Self { inner }
    }

    pub async fn receive_valid(
        &self,
        max: usize,
        wait_seconds: u64,
        cancel: &CancellationToken,
    ) -> Result<Vec<(ReceivedMessage, WorkMessage)>, QueueError> {
        let raw = self.inner.receive(max, wait_seconds, cancel).await?;
        let mut valid = Vec::with_capacity(raw.len());

        for msg in raw {
            match serde_json::from_str::<WorkMessage>(&msg.body) {
                Ok(parsed) => valid.push((msg, parsed)),
                Err(_) => {
                    tracing::warn!(message_id = %msg.id, "deleting malformed work message");
                    self.inner.delete(&msg.id, &msg.receipt, cancel).await?;
                }
            }
        }

        Ok(valid)
    }

    pub async fn send(&self, msg: &WorkMessage, cancel: &CancellationToken) -> Result<(), QueueError> {
        let body = serde_json::to_string(msg)
            .map_err(|err| QueueError::Malformed(err.to_string()))?;
        self.inner.send(&body, cancel).await
    }

    /// Sends with a caller-supplied hook that can observe/transform the message immediately
    /// before it is sent (e.g. attaching a trace id).
    pub async fn send_with_hook(
        &self,
        msg: WorkMessage,
        cancel: &CancellationToken,
        hook: impl FnOnce(WorkMessage) -> WorkMessage,
    ) -> Result<(), QueueError> {
        self.send(&hook(msg), cancel).await
    }

    pub async fn delete(&self, id: &str, receipt: &str, cancel: &CancellationToken) -> Result<(), QueueError> {
        self.inner.delete(id, receipt, cancel).await
    }
}

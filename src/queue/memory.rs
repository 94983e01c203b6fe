use std::collections::VecDeque;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{ReceivedMessage, WorkQueue};
use crate::error::QueueError;

struct Queued {
    id: String,
    body: String,
}

/// An in-process FIFO `WorkQueue` for tests and single-process deployments.
#[derive(Default)]
pub struct InMemoryQueue {
    messages: Mutex<VecDeque<Queued>>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkQueue for InMemoryQueue {
    async fn send(&self, body: &str, cancel: &CancellationToken) -> Result<(), QueueError> {
        let mut messages = tokio::select! {
            guard = self.messages.lock() => guard,
            _ = cancel.cancelled() => return Err(QueueError::Cancelled),
        };
        messages.push_back(Queued {
            id: Uuid::new_v4().to_string(),
            body: body.to_string(),
        });
        Ok(())
    }

    async fn receive(
        &self,
        max: usize,
        _wait_seconds: u64,
        cancel: &CancellationToken,
    ) -> Result<Vec<ReceivedMessage>, QueueError> {
        let mut messages = tokio::select! {
            guard = self.messages.lock() => guard,
            _ = cancel.cancelled() => return Err(QueueError::Cancelled),
        };
        let mut out = Vec::new();

        while out.len() < max {
            match messages.pop_front() {
                Some(msg) => out.push(ReceivedMessage {
                    id: msg.id.clone(),
                    receipt: msg.id,
                    body: msg.body,
                }),
                None => break,
            }
        }

        Ok(out)
    }

    async fn delete(&self, _id: &str, _receipt: &str, cancel: &CancellationToken) -> Result<(), QueueError> {
        // Messages are removed from the in-memory queue at receive time; the only boundary left
        // to honor cancellation at is this cooperative check.
        if cancel.is_cancelled() {
            return Err(QueueError::Cancelled);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{ValidatingQueue, WorkMessage};

    #[tokio::test]
    async fn round_trips_a_message() {
        let queue = ValidatingQueue::new(InMemoryQueue::new());
        let cancel = CancellationToken::new();

        queue
            .send(
                &WorkMessage {
                    wf_id: "wf1".into(),
                    task_id: "t000001".into(),
                },
                &cancel,
            )
            .await
            .unwrap();

        let received = queue.receive_valid(10, 0, &cancel).await.unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].1.wf_id, "wf1");
    }

    #[tokio::test]
    async fn deletes_malformed_payloads_instead_of_returning_them() {
        let inner = InMemoryQueue::new();
        inner.send("not json", &CancellationToken::new()).await.unwrap();
        let queue = ValidatingQueue::new(inner);

        let received = queue.receive_valid(10, 0, &CancellationToken::new()).await.unwrap();
        assert!(received.is_empty());
    }
}

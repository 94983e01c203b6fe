use async_trait::async_trait;
use aws_sdk_sqs::Client;
use tokio_util::sync::CancellationToken;

use super::{ReceivedMessage, WorkQueue};
use crate::error::QueueError;

/// `WorkQueue` backed by Amazon SQS.
pub struct SqsQueue {
    client: Client,
    queue_url: String,
}

impl SqsQueue {
    pub fn new(client: Client, queue_url: impl Into<String>) -> Self {
        Self {
            client,
            queue_url: queue_url.into(),
        }
    }
}

#[async_trait]
impl WorkQueue for SqsQueue {
    async fn send(&self, body: &str, cancel: &CancellationToken) -> Result<(), QueueError> {
        let request = self
            .client
            .send_message()
            .queue_url(&self.queue_url)
            .message_body(body)
            .send();

        tokio::select! {
            result = request => result.map_err(|err| QueueError::Backend(err.to_string()))?,
            _ = cancel.cancelled() => return Err(QueueError::Cancelled),
        };
        Ok(())
    }

    async fn receive(
        &self,
        max: usize,
        wait_seconds: u64,
        cancel: &CancellationToken,
    ) -> Result<Vec<ReceivedMessage>, QueueError> {
        // The long poll (`wait_time_seconds`) is exactly the suspension point worth racing: a
        // caller cancelling mid-poll should return immediately instead of waiting it out.
        let request = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(max.min(10) as i32)
            .wait_time_seconds(wait_seconds.min(20) as i32)
            .send();

        let resp = tokio::select! {
            result = request => result.map_err(|err| QueueError::Backend(err.to_string()))?,
            _ = cancel.cancelled() => return Err(QueueError::Cancelled),
        };

        Ok(resp
            .messages()
            .iter()
            .filter_map(|m| {
                Some(ReceivedMessage {
                    id: m.message_id()?.to_string(),
                    receipt: m.receipt_handle()?.to_string(),
                    body: m.body()?.to_string(),
                })
            })
            .collect())
    }

    async fn delete(&self, _id: &str, receipt: &str, cancel: &CancellationToken) -> Result<(), QueueError> {
        let request = self
            .client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt)
            .send();

        tokio::select! {
            result = request => result.map_err(|err| QueueError::Backend(err.to_string()))?,
            _ = cancel.cancelled() => return Err(QueueError::Cancelled),
        };
        Ok(())
    }
}

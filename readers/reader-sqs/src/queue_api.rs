use async_trait::async_trait;
use aws_sdk_sqs::types::{
    BatchResultErrorEntry, ChangeMessageVisibilityBatchRequestEntry,
    DeleteMessageBatchRequestEntry, Message, MessageSystemAttributeName,
    SendMessageBatchRequestEntry,
};
use aws_sdk_sqs::Client;
use std::fmt::Debug;

use crate::errors::{classify_sdk_error, QueueApiError};

/// Parameters for a single receive call against the queue service.
#[derive(Debug, Clone)]
pub struct ReceiveRequest {
    pub queue_url: String,
    pub max_number_of_messages: i32,
    pub wait_time_seconds: i32,
}

/// A per-entry failure reported by one of the batch operations.
#[derive(Debug, Clone)]
pub struct BatchEntryFailure {
    pub id: String,
    pub code: String,
    pub message: Option<String>,
    pub sender_fault: bool,
}

impl From<BatchResultErrorEntry> for BatchEntryFailure {
    fn from(entry: BatchResultErrorEntry) -> Self {
        BatchEntryFailure {
            id: entry.id,
            code: entry.code,
            message: entry.message,
            sender_fault: entry.sender_fault,
        }
    }
}

/// Provides a trait for the queue service operations the reader
/// depends on, so that tests can install in-process doubles.
/// Each batch operation returns the entries that failed; an empty
/// list means the whole batch was applied.
#[async_trait]
pub trait QueueApi: Debug + Send + Sync {
    /// Receives up to `max_number_of_messages` messages, waiting up to
    /// `wait_time_seconds` for at least one to become available.
    /// All system attributes and message attributes are requested.
    async fn receive_messages(
        &self,
        request: ReceiveRequest,
    ) -> Result<Vec<Message>, QueueApiError>;

    async fn delete_messages(
        &self,
        queue_url: &str,
        entries: Vec<DeleteMessageBatchRequestEntry>,
    ) -> Result<Vec<BatchEntryFailure>, QueueApiError>;

    async fn change_visibility_timeout(
        &self,
        queue_url: &str,
        entries: Vec<ChangeMessageVisibilityBatchRequestEntry>,
    ) -> Result<Vec<BatchEntryFailure>, QueueApiError>;

    /// Present for symmetry with the other batch operations;
    /// the reader never produces messages.
    async fn send_messages(
        &self,
        queue_url: &str,
        entries: Vec<SendMessageBatchRequestEntry>,
    ) -> Result<Vec<BatchEntryFailure>, QueueApiError>;
}

#[async_trait]
impl QueueApi for Client {
    async fn receive_messages(
        &self,
        request: ReceiveRequest,
    ) -> Result<Vec<Message>, QueueApiError> {
        let output = self
            .receive_message()
            .queue_url(request.queue_url)
            .set_max_number_of_messages(Some(request.max_number_of_messages))
            .set_wait_time_seconds(Some(request.wait_time_seconds))
            .set_message_system_attribute_names(Some(vec![MessageSystemAttributeName::All]))
            .set_message_attribute_names(Some(vec!["All".to_string()]))
            .send()
            .await
            .map_err(classify_sdk_error)?;
        Ok(output.messages.unwrap_or_default())
    }

    async fn delete_messages(
        &self,
        queue_url: &str,
        entries: Vec<DeleteMessageBatchRequestEntry>,
    ) -> Result<Vec<BatchEntryFailure>, QueueApiError> {
        let output = self
            .delete_message_batch()
            .queue_url(queue_url)
            .set_entries(Some(entries))
            .send()
            .await
            .map_err(classify_sdk_error)?;
        Ok(output.failed.into_iter().map(Into::into).collect())
    }

    async fn change_visibility_timeout(
        &self,
        queue_url: &str,
        entries: Vec<ChangeMessageVisibilityBatchRequestEntry>,
    ) -> Result<Vec<BatchEntryFailure>, QueueApiError> {
        let output = self
            .change_message_visibility_batch()
            .queue_url(queue_url)
            .set_entries(Some(entries))
            .send()
            .await
            .map_err(classify_sdk_error)?;
        Ok(output.failed.into_iter().map(Into::into).collect())
    }

    async fn send_messages(
        &self,
        queue_url: &str,
        entries: Vec<SendMessageBatchRequestEntry>,
    ) -> Result<Vec<BatchEntryFailure>, QueueApiError> {
        let output = self
            .send_message_batch()
            .queue_url(queue_url)
            .set_entries(Some(entries))
            .send()
            .await
            .map_err(classify_sdk_error)?;
        Ok(output.failed.into_iter().map(Into::into).collect())
    }
}

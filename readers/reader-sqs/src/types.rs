use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use aws_sdk_sqs::types::{Message as SqsMessage, MessageSystemAttributeName};
use conveyor_helpers::readers::Message;
use serde::Deserialize;

/// Metadata keys attached to every delivered message.
pub const METADATA_MESSAGE_ID: &str = "sqs_message_id";
pub const METADATA_RECEIPT_HANDLE: &str = "sqs_receipt_handle";
pub const METADATA_APPROXIMATE_RECEIVE_COUNT: &str = "sqs_approximate_receive_count";

/// Metadata keys attached when the message body carries an SNS
/// notification envelope.
pub const METADATA_SNS_MESSAGE_ID: &str = "sns_message_id";
pub const METADATA_SNS_TOPIC_ARN: &str = "sns_topic_arn";

/// Metadata delivered alongside each message, keyed by the constants
/// above plus one entry per string-valued message attribute.
pub type SqsMessageMetadata = HashMap<String, String>;

/// Sentinel deadline marking a handle that has been acknowledged or
/// negatively acknowledged. A handle carrying this deadline must not
/// have its visibility extended.
pub const DEADLINE_DELETED: u64 = u64::MAX;

/// Identifies an in-flight SQS message for delete and
/// change-visibility operations, together with the locally tracked
/// expiry of its current visibility lease.
///
/// The deadline is read and written atomically so that the flush path
/// can check for the deleted sentinel without taking the tracker lock.
#[derive(Debug)]
pub struct MessageHandle {
    pub message_id: String,
    pub receipt_handle: String,
    deadline_ms: AtomicU64,
}

impl MessageHandle {
    pub fn new(message_id: String, receipt_handle: String, deadline_ms: u64) -> Self {
        MessageHandle {
            message_id,
            receipt_handle,
            deadline_ms: AtomicU64::new(deadline_ms),
        }
    }

    pub fn deadline_ms(&self) -> u64 {
        self.deadline_ms.load(Ordering::Acquire)
    }

    pub fn set_deadline_ms(&self, deadline_ms: u64) {
        self.deadline_ms.store(deadline_ms, Ordering::Release);
    }

    /// Marks the handle as acknowledged or negatively acknowledged.
    pub fn mark_deleted(&self) {
        self.deadline_ms.store(DEADLINE_DELETED, Ordering::Release);
    }

    pub fn is_deleted(&self) -> bool {
        self.deadline_ms() == DEADLINE_DELETED
    }
}

/// A received message waiting to be handed to the consumer.
/// The handle is absent when the message is missing its ID or receipt
/// handle; such messages are still delivered but cannot be deleted or
/// have their visibility changed.
#[derive(Debug, Clone)]
pub struct PendingMessage {
    pub message: SqsMessage,
    pub handle: Option<Arc<MessageHandle>>,
}

impl PendingMessage {
    pub fn new(message: SqsMessage, deadline_ms: u64) -> Self {
        let handle = match (&message.message_id, &message.receipt_handle) {
            (Some(message_id), Some(receipt_handle)) => Some(Arc::new(MessageHandle::new(
                message_id.clone(),
                receipt_handle.clone(),
                deadline_ms,
            ))),
            _ => None,
        };
        PendingMessage { message, handle }
    }
}

/// The envelope SNS wraps around notifications delivered
/// through an SQS subscription.
#[derive(Debug, Clone, Deserialize)]
pub struct SnsEnvelope {
    #[serde(rename = "Type")]
    pub message_type: String,
    #[serde(rename = "MessageId")]
    pub message_id: String,
    #[serde(rename = "TopicArn")]
    pub topic_arn: String,
    #[serde(rename = "Message")]
    pub message: String,
    #[serde(rename = "Timestamp")]
    pub timestamp: String,
}

pub trait FromSqsMessage {
    fn from_sqs_message(message: &SqsMessage) -> Self;
}

impl FromSqsMessage for Message<SqsMessageMetadata> {
    fn from_sqs_message(message: &SqsMessage) -> Self {
        let mut metadata = SqsMessageMetadata::new();
        if let Some(message_id) = &message.message_id {
            metadata.insert(METADATA_MESSAGE_ID.to_string(), message_id.clone());
        }
        if let Some(receipt_handle) = &message.receipt_handle {
            metadata.insert(METADATA_RECEIPT_HANDLE.to_string(), receipt_handle.clone());
        }
        if let Some(attributes) = &message.attributes {
            if let Some(receive_count) =
                attributes.get(&MessageSystemAttributeName::ApproximateReceiveCount)
            {
                metadata.insert(
                    METADATA_APPROXIMATE_RECEIVE_COUNT.to_string(),
                    receive_count.clone(),
                );
            }
        }
        if let Some(message_attributes) = &message.message_attributes {
            for (name, value) in message_attributes {
                if let Some(string_value) = value.string_value() {
                    metadata.insert(name.clone(), string_value.to_string());
                }
            }
        }

        let (body, sns_envelope) = unwrap_sns_body(message.body.clone());
        if let Some(envelope) = sns_envelope {
            metadata.insert(METADATA_SNS_MESSAGE_ID.to_string(), envelope.message_id);
            metadata.insert(METADATA_SNS_TOPIC_ARN.to_string(), envelope.topic_arn);
        }

        Message {
            message_id: message.message_id.clone().unwrap_or_default(),
            body,
            md5_of_body: message.md5_of_body.clone(),
            metadata,
        }
    }
}

/// When the body parses as an SNS notification envelope, the embedded
/// message becomes the delivered body. Anything else is passed through
/// untouched.
fn unwrap_sns_body(body: Option<String>) -> (Option<String>, Option<SnsEnvelope>) {
    match body {
        Some(raw) => match serde_json::from_str::<SnsEnvelope>(&raw) {
            Ok(envelope) if envelope.message_type == "Notification" => {
                let unwrapped = envelope.message.clone();
                (Some(unwrapped), Some(envelope))
            }
            _ => (Some(raw), None),
        },
        None => (None, None),
    }
}

#[cfg(test)]
mod tests {
    use aws_sdk_sqs::types::MessageAttributeValue;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_handle_deadline_round_trips_through_the_sentinel() {
        let handle = MessageHandle::new("m1".to_string(), "r1".to_string(), 1000);

        assert_eq!(handle.deadline_ms(), 1000);
        assert!(!handle.is_deleted());

        handle.set_deadline_ms(2500);
        assert_eq!(handle.deadline_ms(), 2500);

        handle.mark_deleted();
        assert!(handle.is_deleted());
        assert_eq!(handle.deadline_ms(), DEADLINE_DELETED);
    }

    #[test]
    fn test_pending_message_without_receipt_handle_has_no_handle() {
        let message = SqsMessage::builder()
            .message_id("m1")
            .body("hello")
            .build();

        let pending = PendingMessage::new(message, 1000);

        assert!(pending.handle.is_none());
    }

    #[test]
    fn test_from_sqs_message_decorates_metadata() {
        let message = SqsMessage::builder()
            .message_id("m1")
            .receipt_handle("r1")
            .body("hello")
            .attributes(MessageSystemAttributeName::ApproximateReceiveCount, "3")
            .message_attributes(
                "tenant",
                MessageAttributeValue::builder()
                    .data_type("String")
                    .string_value("acme")
                    .build()
                    .unwrap(),
            )
            .build();

        let reader_message = Message::<SqsMessageMetadata>::from_sqs_message(&message);

        assert_eq!(reader_message.message_id, "m1");
        assert_eq!(reader_message.body.as_deref(), Some("hello"));
        assert_eq!(
            reader_message.metadata.get(METADATA_MESSAGE_ID),
            Some(&"m1".to_string())
        );
        assert_eq!(
            reader_message.metadata.get(METADATA_RECEIPT_HANDLE),
            Some(&"r1".to_string())
        );
        assert_eq!(
            reader_message.metadata.get(METADATA_APPROXIMATE_RECEIVE_COUNT),
            Some(&"3".to_string())
        );
        assert_eq!(
            reader_message.metadata.get("tenant"),
            Some(&"acme".to_string())
        );
    }

    #[test]
    fn test_from_sqs_message_unwraps_sns_envelopes() {
        let body = "{\"Type\": \"Notification\", \"MessageId\": \"sns-1\", \
            \"TopicArn\": \"arn:aws:sns:us-east-1:123456789012:orders\", \
            \"Message\": \"order created\", \"Timestamp\": \"2025-06-01T00:00:00Z\"}";
        let message = SqsMessage::builder()
            .message_id("m1")
            .receipt_handle("r1")
            .body(body)
            .build();

        let reader_message = Message::<SqsMessageMetadata>::from_sqs_message(&message);

        assert_eq!(reader_message.body.as_deref(), Some("order created"));
        assert_eq!(
            reader_message.metadata.get(METADATA_SNS_MESSAGE_ID),
            Some(&"sns-1".to_string())
        );
        assert_eq!(
            reader_message.metadata.get(METADATA_SNS_TOPIC_ARN),
            Some(&"arn:aws:sns:us-east-1:123456789012:orders".to_string())
        );
    }

    #[test]
    fn test_from_sqs_message_leaves_non_sns_json_bodies_untouched() {
        let message = SqsMessage::builder()
            .message_id("m1")
            .receipt_handle("r1")
            .body("{\"id\": \"30492\"}")
            .build();

        let reader_message = Message::<SqsMessageMetadata>::from_sqs_message(&message);

        assert_eq!(reader_message.body.as_deref(), Some("{\"id\": \"30492\"}"));
        assert!(!reader_message.metadata.contains_key(METADATA_SNS_MESSAGE_ID));
    }
}

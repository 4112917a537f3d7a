use std::env::VarError;
use std::time::Duration;

use conveyor_helpers::env::EnvVars;

/// Configuration for an SQS message reader.
#[derive(Debug, Clone)]
pub struct SqsReaderConfig {
    /// The URL of the SQS queue to consume messages from.
    pub queue_url: String,
    /// The time to wait for messages on each receive call.
    /// 0 disables long polling; SQS allows up to 20 seconds.
    ///
    /// Defaults to 0.
    pub wait_time_seconds: Option<i32>,
    /// The maximum number of messages per receive call and per
    /// outbound delete/change-visibility batch.
    /// SQS only allows a maximum of 10 messages per call.
    ///
    /// Defaults to 10 messages.
    pub max_number_of_messages: Option<i32>,
    /// Soft ceiling on the number of messages that have been received
    /// but not yet acknowledged. Admission of a new receive batch waits
    /// until the count drops below this value, so occupancy can exceed
    /// it by up to one batch.
    ///
    /// Defaults to 1000 messages.
    pub max_outstanding_messages: Option<usize>,
    /// The visibility duration maintained for in-flight messages.
    /// Leases are renewed once less than half of this remains.
    ///
    /// Defaults to 30 seconds.
    pub message_timeout: Option<Duration>,
    /// Whether acknowledged messages are deleted from the queue.
    /// When false, acknowledgements only release the in-flight slot
    /// and deletion is left to an external actor.
    ///
    /// Defaults to true.
    pub delete_message: Option<bool>,
    /// Whether negatively acknowledged messages have their visibility
    /// reset to zero for immediate redelivery. When false, the message
    /// redelivers after its current visibility lease expires.
    ///
    /// Defaults to true.
    pub reset_visibility: Option<bool>,
    /// The pause applied after a connection or authentication failure
    /// on receive, instead of the regular backoff.
    ///
    /// Defaults to 10 seconds.
    pub auth_error_timeout: Option<Duration>,
    /// The AWS region used when constructing the real queue client.
    pub aws_region: Option<String>,
    /// A custom SQS endpoint, useful for VPC endpoints and emulators
    /// such as LocalStack.
    pub sqs_endpoint: Option<String>,
}

impl SqsReaderConfig {
    pub fn new(queue_url: String) -> Self {
        SqsReaderConfig {
            queue_url,
            wait_time_seconds: None,
            max_number_of_messages: None,
            max_outstanding_messages: None,
            message_timeout: None,
            delete_message: None,
            reset_visibility: None,
            auth_error_timeout: None,
            aws_region: None,
            sqs_endpoint: None,
        }
    }

    /// Reads the recognised `CONVEYOR_SQS_READER_*` options from the
    /// provided environment. Only the queue URL is required; options
    /// that are absent or fail to parse fall back to their defaults.
    pub fn from_env(env: &impl EnvVars) -> Result<Self, VarError> {
        let queue_url = env.var("CONVEYOR_SQS_READER_QUEUE_URL")?;

        Ok(SqsReaderConfig {
            queue_url,
            wait_time_seconds: env.parsed_var("CONVEYOR_SQS_READER_WAIT_TIME_SECONDS"),
            max_number_of_messages: env.parsed_var("CONVEYOR_SQS_READER_MAX_NUMBER_OF_MESSAGES"),
            max_outstanding_messages: env
                .parsed_var("CONVEYOR_SQS_READER_MAX_OUTSTANDING_MESSAGES"),
            message_timeout: env
                .parsed_var::<u64>("CONVEYOR_SQS_READER_MESSAGE_TIMEOUT_SECONDS")
                .map(Duration::from_secs),
            delete_message: env.parsed_var("CONVEYOR_SQS_READER_DELETE_MESSAGE"),
            reset_visibility: env.parsed_var("CONVEYOR_SQS_READER_RESET_VISIBILITY"),
            auth_error_timeout: env
                .parsed_var::<u64>("CONVEYOR_SQS_READER_AUTH_ERROR_TIMEOUT_SECONDS")
                .map(Duration::from_secs),
            aws_region: env.var("CONVEYOR_SQS_READER_AWS_REGION").ok(),
            sqs_endpoint: env.var("CONVEYOR_SQS_READER_SQS_ENDPOINT").ok(),
        })
    }

    pub(crate) fn finalise(self) -> SqsReaderFinalisedConfig {
        SqsReaderFinalisedConfig {
            queue_url: self.queue_url,
            wait_time_seconds: self.wait_time_seconds.unwrap_or(0).clamp(0, 20),
            max_number_of_messages: self.max_number_of_messages.unwrap_or(10).clamp(1, 10),
            max_outstanding_messages: self.max_outstanding_messages.unwrap_or(1000),
            message_timeout: self.message_timeout.unwrap_or(Duration::from_secs(30)),
            delete_message: self.delete_message.unwrap_or(true),
            reset_visibility: self.reset_visibility.unwrap_or(true),
            auth_error_timeout: self.auth_error_timeout.unwrap_or(Duration::from_secs(10)),
            aws_region: self.aws_region,
            sqs_endpoint: self.sqs_endpoint,
        }
    }
}

#[derive(Debug)]
pub(crate) struct SqsReaderFinalisedConfig {
    pub queue_url: String,
    pub wait_time_seconds: i32,
    pub max_number_of_messages: i32,
    pub max_outstanding_messages: usize,
    pub message_timeout: Duration,
    pub delete_message: bool,
    pub reset_visibility: bool,
    pub auth_error_timeout: Duration,
    pub aws_region: Option<String>,
    pub sqs_endpoint: Option<String>,
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use conveyor_helpers::env::EnvSnapshot;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_from_env_reads_recognised_options() {
        let env = EnvSnapshot::from_map(HashMap::from([
            (
                "CONVEYOR_SQS_READER_QUEUE_URL".to_string(),
                "https://sqs.eu-west-2.amazonaws.com/123456789012/orders".to_string(),
            ),
            (
                "CONVEYOR_SQS_READER_WAIT_TIME_SECONDS".to_string(),
                "20".to_string(),
            ),
            (
                "CONVEYOR_SQS_READER_MAX_NUMBER_OF_MESSAGES".to_string(),
                "5".to_string(),
            ),
            (
                "CONVEYOR_SQS_READER_MAX_OUTSTANDING_MESSAGES".to_string(),
                "50".to_string(),
            ),
            (
                "CONVEYOR_SQS_READER_MESSAGE_TIMEOUT_SECONDS".to_string(),
                "45".to_string(),
            ),
            (
                "CONVEYOR_SQS_READER_DELETE_MESSAGE".to_string(),
                "false".to_string(),
            ),
        ]));

        let config = SqsReaderConfig::from_env(&env).unwrap();

        assert_eq!(
            config.queue_url,
            "https://sqs.eu-west-2.amazonaws.com/123456789012/orders"
        );
        assert_eq!(config.wait_time_seconds, Some(20));
        assert_eq!(config.max_number_of_messages, Some(5));
        assert_eq!(config.max_outstanding_messages, Some(50));
        assert_eq!(config.message_timeout, Some(Duration::from_secs(45)));
        assert_eq!(config.delete_message, Some(false));
        assert_eq!(config.reset_visibility, None);
    }

    #[test]
    fn test_from_env_requires_the_queue_url() {
        let env = EnvSnapshot::default();

        let result = SqsReaderConfig::from_env(&env);

        assert!(result.is_err());
    }

    #[test]
    fn test_finalise_applies_defaults_and_clamps_the_batch_size() {
        let mut config = SqsReaderConfig::new("https://example.com/queue".to_string());
        config.max_number_of_messages = Some(25);

        let finalised = config.finalise();

        assert_eq!(finalised.wait_time_seconds, 0);
        assert_eq!(finalised.max_number_of_messages, 10);
        assert_eq!(finalised.max_outstanding_messages, 1000);
        assert_eq!(finalised.message_timeout, Duration::from_secs(30));
        assert!(finalised.delete_message);
        assert!(finalised.reset_visibility);
        assert_eq!(finalised.auth_error_timeout, Duration::from_secs(10));
    }
}

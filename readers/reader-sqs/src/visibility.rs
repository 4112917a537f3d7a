use std::collections::HashMap;
use std::sync::Arc;

use aws_sdk_sqs::types::ChangeMessageVisibilityBatchRequestEntry;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::SqsReaderFinalisedConfig;
use crate::queue_api::QueueApi;
use crate::types::MessageHandle;

/// Issues the change-visibility calls that keep in-flight messages
/// hidden from other consumers, and the zero-timeout resets that make
/// negatively acknowledged messages immediately redeliverable.
#[derive(Debug)]
pub(crate) struct VisibilityExtender {
    client: Arc<dyn QueueApi>,
    config: Arc<SqsReaderFinalisedConfig>,
}

impl VisibilityExtender {
    pub(crate) fn new(client: Arc<dyn QueueApi>, config: Arc<SqsReaderFinalisedConfig>) -> Self {
        VisibilityExtender { client, config }
    }

    /// Extends the visibility lease of each handle by a full message
    /// timeout. Handles that have been acknowledged since they were
    /// captured are skipped. Extension failures are best effort: the
    /// message simply becomes redeliverable sooner.
    pub(crate) async fn extend(&self, handles: &[Arc<MessageHandle>], cancel: &CancellationToken) {
        let timeout_seconds = self.config.message_timeout.as_secs() as i32;
        self.change_visibility(handles, timeout_seconds, true, cancel)
            .await
    }

    /// Resets visibility to zero so the messages redeliver immediately.
    pub(crate) async fn reset(&self, handles: &[Arc<MessageHandle>], cancel: &CancellationToken) {
        if handles.is_empty() {
            return;
        }
        if !self.config.reset_visibility {
            debug!(
                count = handles.len(),
                "reader not configured to reset visibility, messages will redeliver after their current lease"
            );
            return;
        }
        self.change_visibility(handles, 0, false, cancel).await
    }

    async fn change_visibility(
        &self,
        handles: &[Arc<MessageHandle>],
        timeout_seconds: i32,
        skip_deleted: bool,
        cancel: &CancellationToken,
    ) {
        for chunk in handles.chunks(self.config.max_number_of_messages as usize) {
            let live: Vec<&Arc<MessageHandle>> = chunk
                .iter()
                .filter(|handle| !(skip_deleted && handle.is_deleted()))
                .collect();
            if live.is_empty() {
                continue;
            }

            let by_id: HashMap<&str, &Arc<MessageHandle>> = live
                .iter()
                .map(|handle| (handle.message_id.as_str(), *handle))
                .collect();
            let entries = live
                .iter()
                .map(|handle| {
                    ChangeMessageVisibilityBatchRequestEntry::builder()
                        .id(handle.message_id.clone())
                        .receipt_handle(handle.receipt_handle.clone())
                        .visibility_timeout(timeout_seconds)
                        .build()
                        .unwrap()
                })
                .collect();

            let result = tokio::select! {
                _ = cancel.cancelled() => return,
                result = self
                    .client
                    .change_visibility_timeout(&self.config.queue_url, entries) => result,
            };
            match result {
                Ok(failed) => {
                    for failure in failed {
                        // A handle acknowledged while the call was in
                        // flight no longer needs its lease.
                        let deleted_since = by_id
                            .get(failure.id.as_str())
                            .map(|handle| handle.is_deleted())
                            .unwrap_or(false);
                        if skip_deleted && deleted_since {
                            continue;
                        }
                        debug!(
                            id = %failure.id,
                            code = %failure.code,
                            "failed to change message visibility"
                        );
                    }
                }
                Err(err) => debug!("failed to change message visibility: {err}"),
            }
        }
    }
}

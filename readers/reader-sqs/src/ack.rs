use std::sync::Arc;
use std::time::Duration;

use aws_sdk_sqs::types::DeleteMessageBatchRequestEntry;
use tokio::sync::{mpsc, Mutex};
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::config::SqsReaderFinalisedConfig;
use crate::queue_api::QueueApi;
use crate::tracker::InFlightTracker;
use crate::types::MessageHandle;
use crate::visibility::VisibilityExtender;

/// Deletes acknowledged messages from the queue in batches of up to
/// the configured batch size. Per-entry failures are logged and never
/// retried; the affected messages will simply redeliver once their
/// visibility lease expires.
pub(crate) async fn delete_handles(
    client: &Arc<dyn QueueApi>,
    config: &SqsReaderFinalisedConfig,
    handles: &[Arc<MessageHandle>],
    cancel: &CancellationToken,
) {
    if handles.is_empty() {
        return;
    }
    if !config.delete_message {
        debug!(
            count = handles.len(),
            "reader not configured to delete messages, leaving deletion to an external actor"
        );
        return;
    }

    for chunk in handles.chunks(config.max_number_of_messages as usize) {
        let entries = chunk
            .iter()
            .map(|handle| {
                DeleteMessageBatchRequestEntry::builder()
                    .id(handle.message_id.clone())
                    .receipt_handle(handle.receipt_handle.clone())
                    .build()
                    .unwrap()
            })
            .collect();

        let result = tokio::select! {
            _ = cancel.cancelled() => return,
            result = client.delete_messages(&config.queue_url, entries) => result,
        };
        match result {
            Ok(failed) => {
                for failure in failed {
                    error!(
                        id = %failure.id,
                        code = %failure.code,
                        "failed to delete message from queue"
                    );
                }
            }
            Err(err) => error!("failed to delete messages from queue: {err}"),
        }
    }
}

/// The event loop that batches acknowledgement traffic back to the
/// queue service and keeps long-running messages hidden.
pub(crate) struct AckLoop {
    pub client: Arc<dyn QueueApi>,
    pub config: Arc<SqsReaderFinalisedConfig>,
    pub tracker: Arc<InFlightTracker>,
    pub extender: Arc<VisibilityExtender>,
    pub ack_rx: mpsc::Receiver<Arc<MessageHandle>>,
    pub nack_rx: mpsc::Receiver<Arc<MessageHandle>>,
    pub soft_stop: CancellationToken,
    pub hard_stop: CancellationToken,
    pub refresh_gate: Arc<Mutex<()>>,
}

impl AckLoop {
    pub(crate) async fn run(mut self) {
        let batch_size = self.config.max_number_of_messages as usize;
        let mut pending_acks: Vec<Arc<MessageHandle>> = Vec::new();
        let mut pending_nacks: Vec<Arc<MessageHandle>> = Vec::new();
        let mut flush_tick = interval(Duration::from_secs(1));

        loop {
            tokio::select! {
                _ = self.soft_stop.cancelled() => break,
                Some(handle) = self.ack_rx.recv() => {
                    self.tracker.remove(&handle.message_id);
                    handle.mark_deleted();
                    pending_acks.push(handle);
                    if pending_acks.len() >= batch_size {
                        delete_handles(&self.client, &self.config, &pending_acks, &self.hard_stop)
                            .await;
                        pending_acks.clear();
                    }
                }
                Some(handle) = self.nack_rx.recv() => {
                    self.tracker.remove(&handle.message_id);
                    handle.mark_deleted();
                    pending_nacks.push(handle);
                    if pending_nacks.len() >= batch_size {
                        self.extender.reset(&pending_nacks, &self.hard_stop).await;
                        pending_nacks.clear();
                    }
                }
                _ = flush_tick.tick() => {
                    delete_handles(&self.client, &self.config, &pending_acks, &self.hard_stop)
                        .await;
                    pending_acks.clear();
                    self.extender.reset(&pending_nacks, &self.hard_stop).await;
                    pending_nacks.clear();
                    self.spawn_refresh_pass();
                }
            }
        }

        // One last flush so nothing already acknowledged is lost,
        // then release every remaining in-flight slot.
        delete_handles(&self.client, &self.config, &pending_acks, &self.hard_stop).await;
        self.extender.reset(&pending_nacks, &self.hard_stop).await;
        self.tracker.clear();
    }

    /// Kicks off an asynchronous visibility refresh for handles close
    /// to their deadline. If the previous pass is still in flight the
    /// tick is skipped; acknowledgement flushing is unaffected.
    fn spawn_refresh_pass(&self) {
        let Ok(guard) = self.refresh_gate.clone().try_lock_owned() else {
            debug!("previous visibility refresh pass still in flight, skipping");
            return;
        };

        let tracker = self.tracker.clone();
        let extender = self.extender.clone();
        let hard_stop = self.hard_stop.clone();
        tokio::spawn(async move {
            let _guard = guard;
            let due = tracker.pull_to_refresh();
            if due.is_empty() {
                return;
            }
            debug!(
                count = due.len(),
                "extending visibility timeout for in-flight messages"
            );
            extender.extend(&due, &hard_stop).await;
        });
    }
}

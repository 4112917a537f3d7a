use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use conveyor_helpers::backoff::ExponentialBackoff;
use conveyor_helpers::time::Clock;
use tokio::sync::mpsc;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::config::SqsReaderFinalisedConfig;
use crate::queue_api::{QueueApi, ReceiveRequest};
use crate::tracker::InFlightTracker;
use crate::types::{MessageHandle, PendingMessage};
use crate::visibility::VisibilityExtender;

/// The long-polling loop that keeps the hand-off channel supplied
/// with messages. Received batches are registered with the in-flight
/// tracker (which applies backpressure at capacity) and then served
/// to the reader one message at a time.
pub(crate) struct FetchLoop {
    pub client: Arc<dyn QueueApi>,
    pub config: Arc<SqsReaderFinalisedConfig>,
    pub clock: Arc<dyn Clock>,
    pub tracker: Arc<InFlightTracker>,
    pub extender: Arc<VisibilityExtender>,
    pub handoff_tx: mpsc::Sender<PendingMessage>,
    pub soft_stop: CancellationToken,
    pub hard_stop: CancellationToken,
}

impl FetchLoop {
    pub(crate) async fn run(self) {
        let mut pending: VecDeque<PendingMessage> = VecDeque::new();
        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(10), Duration::from_secs(60))
                .with_jitter();

        'poll: loop {
            if pending.is_empty() {
                let request = ReceiveRequest {
                    queue_url: self.config.queue_url.clone(),
                    max_number_of_messages: self.config.max_number_of_messages,
                    wait_time_seconds: self.config.wait_time_seconds,
                };
                let result = tokio::select! {
                    _ = self.soft_stop.cancelled() => break 'poll,
                    result = self.client.receive_messages(request) => result,
                };
                match result {
                    Ok(messages) => {
                        let deadline_ms = self.clock.now_ms()
                            + self.config.message_timeout.as_millis() as u64;
                        let batch: Vec<PendingMessage> = messages
                            .into_iter()
                            .map(|message| PendingMessage::new(message, deadline_ms))
                            .collect();
                        // A long-poll call that waited counts as a
                        // successful poll even when it came back empty.
                        if !batch.is_empty() || self.config.wait_time_seconds > 0 {
                            backoff.reset();
                        }
                        if !batch.is_empty() {
                            debug!(count = batch.len(), "received message batch from queue");
                            self.tracker.add_new(&self.soft_stop, &batch).await;
                            pending.extend(batch);
                        }
                    }
                    Err(err) if err.is_timeout() => {
                        // Long-poll expiry, nothing to report.
                    }
                    Err(err) if err.is_connection() => {
                        debug!(
                            "connection error receiving messages, pausing before retrying: {err}"
                        );
                        tokio::select! {
                            _ = self.soft_stop.cancelled() => break 'poll,
                            _ = time::sleep(self.config.auth_error_timeout) => {}
                        }
                        continue 'poll;
                    }
                    Err(err) => error!("failed to receive messages from queue: {err}"),
                }
            }

            if let Some(message) = pending.pop_front() {
                tokio::select! {
                    _ = self.soft_stop.cancelled() => {
                        pending.push_front(message);
                        break 'poll;
                    }
                    result = self.handoff_tx.send(message.clone()) => {
                        if result.is_err() {
                            // Receiver dropped, treat as shutdown.
                            pending.push_front(message);
                            break 'poll;
                        }
                    }
                }
            } else {
                let wait = backoff.next_interval();
                tokio::select! {
                    _ = self.soft_stop.cancelled() => break 'poll,
                    _ = time::sleep(wait) => {}
                }
            }
        }

        self.reset_undispatched(pending).await;
    }

    /// Converts everything still buffered at shutdown into a
    /// visibility reset so the messages redeliver promptly.
    async fn reset_undispatched(&self, pending: VecDeque<PendingMessage>) {
        let handles: Vec<Arc<MessageHandle>> = pending
            .into_iter()
            .filter_map(|message| message.handle)
            .collect();
        if handles.is_empty() {
            return;
        }
        debug!(
            count = handles.len(),
            "resetting visibility for undispatched messages"
        );
        for handle in &handles {
            self.tracker.remove(&handle.message_id);
            handle.mark_deleted();
        }
        self.extender.reset(&handles, &self.hard_stop).await;
    }
}

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use conveyor_helpers::time::Clock;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::types::{MessageHandle, PendingMessage};

/// Tracks messages that have been received from the queue service but
/// not yet acknowledged, bounding how many may be outstanding at once.
///
/// Admission of a new batch waits until the count drops below
/// `max_outstanding`; the check is made against the pre-insertion size,
/// so a whole batch is admitted even when it pushes occupancy past the
/// ceiling. This guarantees forward progress for receive batches larger
/// than the remaining headroom.
#[derive(Debug)]
pub struct InFlightTracker {
    clock: Arc<dyn Clock>,
    message_timeout: Duration,
    max_outstanding: usize,
    handles: Mutex<HashMap<String, Arc<MessageHandle>>>,
    slot_freed: Notify,
}

impl InFlightTracker {
    pub fn new(clock: Arc<dyn Clock>, message_timeout: Duration, max_outstanding: usize) -> Self {
        InFlightTracker {
            clock,
            message_timeout,
            max_outstanding,
            handles: Mutex::new(HashMap::new()),
            slot_freed: Notify::new(),
        }
    }

    /// Registers the handles of a received batch, waiting while the
    /// tracker is at capacity. Returns without inserting anything when
    /// `cancel` fires first.
    pub async fn add_new(&self, cancel: &CancellationToken, messages: &[PendingMessage]) {
        loop {
            let notified = self.slot_freed.notified();
            if self.handles.lock().unwrap().len() < self.max_outstanding {
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = notified => {}
            }
        }

        let mut handles = self.handles.lock().unwrap();
        for message in messages {
            if let Some(handle) = &message.handle {
                handles.insert(handle.message_id.clone(), handle.clone());
            }
        }
    }

    /// Removes a single entry and wakes one admission waiter.
    pub fn remove(&self, message_id: &str) {
        self.handles.lock().unwrap().remove(message_id);
        self.slot_freed.notify_one();
    }

    /// Removes every entry and wakes all admission waiters.
    pub fn clear(&self) {
        self.handles.lock().unwrap().clear();
        self.slot_freed.notify_waiters();
    }

    pub fn size(&self) -> usize {
        self.handles.lock().unwrap().len()
    }

    /// Returns the handles whose visibility lease has less than half of
    /// the message timeout remaining, bumping each returned deadline to
    /// a full timeout from now. The bump happens before the
    /// corresponding extension call is made, so a failed call leaves
    /// the tracker optimistic about the lease until the next pass.
    pub fn pull_to_refresh(&self) -> Vec<Arc<MessageHandle>> {
        let now_ms = self.clock.now_ms();
        let timeout_ms = self.message_timeout.as_millis() as u64;
        let threshold_ms = timeout_ms / 2;

        let handles = self.handles.lock().unwrap();
        let mut due = Vec::new();
        for handle in handles.values() {
            let deadline_ms = handle.deadline_ms();
            if handle.is_deleted() {
                continue;
            }
            if deadline_ms.saturating_sub(now_ms) < threshold_ms {
                handle.set_deadline_ms(now_ms + timeout_ms);
                due.push(handle.clone());
            }
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use std::fmt;
    use std::sync::atomic::{AtomicU64, Ordering};

    use aws_sdk_sqs::types::Message as SqsMessage;
    use pretty_assertions::assert_eq;
    use tokio::time::{sleep, timeout};

    use super::*;

    struct TestClock {
        now_ms: AtomicU64,
    }

    impl TestClock {
        fn new(now_ms: u64) -> Self {
            TestClock {
                now_ms: AtomicU64::new(now_ms),
            }
        }

        fn advance(&self, by_ms: u64) {
            self.now_ms.fetch_add(by_ms, Ordering::SeqCst);
        }
    }

    impl fmt::Debug for TestClock {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "TestClock")
        }
    }

    impl Clock for TestClock {
        fn now_ms(&self) -> u64 {
            self.now_ms.load(Ordering::SeqCst)
        }
    }

    fn pending_message(message_id: &str, deadline_ms: u64) -> PendingMessage {
        let message = SqsMessage::builder()
            .message_id(message_id)
            .receipt_handle(format!("receipt-{message_id}"))
            .body("body")
            .build();
        PendingMessage::new(message, deadline_ms)
    }

    #[test_log::test(tokio::test)]
    async fn test_add_new_admits_a_whole_batch_past_the_ceiling() {
        let clock = Arc::new(TestClock::new(0));
        let tracker = InFlightTracker::new(clock, Duration::from_secs(30), 2);
        let cancel = CancellationToken::new();

        let batch: Vec<PendingMessage> = (1..=5)
            .map(|n| pending_message(&format!("m{n}"), 30_000))
            .collect();
        tracker.add_new(&cancel, &batch).await;

        assert_eq!(tracker.size(), 5);
    }

    #[test_log::test(tokio::test)]
    async fn test_add_new_waits_until_a_slot_is_freed() {
        let clock = Arc::new(TestClock::new(0));
        let tracker = Arc::new(InFlightTracker::new(clock, Duration::from_secs(30), 1));
        let cancel = CancellationToken::new();

        tracker
            .add_new(&cancel, &[pending_message("m1", 30_000)])
            .await;

        let tracker_for_admission = tracker.clone();
        let cancel_for_admission = cancel.clone();
        let admission = tokio::spawn(async move {
            tracker_for_admission
                .add_new(&cancel_for_admission, &[pending_message("m2", 30_000)])
                .await;
        });

        // The second batch must not be admitted while m1 holds the slot.
        sleep(Duration::from_millis(50)).await;
        assert!(!admission.is_finished());
        assert_eq!(tracker.size(), 1);

        tracker.remove("m1");

        timeout(Duration::from_secs(1), admission)
            .await
            .expect("admission should complete once a slot is freed")
            .unwrap();
        assert_eq!(tracker.size(), 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_add_new_returns_without_inserting_when_cancelled() {
        let clock = Arc::new(TestClock::new(0));
        let tracker = Arc::new(InFlightTracker::new(clock, Duration::from_secs(30), 1));
        let cancel = CancellationToken::new();

        tracker
            .add_new(&cancel, &[pending_message("m1", 30_000)])
            .await;

        let tracker_for_admission = tracker.clone();
        let cancel_for_admission = cancel.clone();
        let admission = tokio::spawn(async move {
            tracker_for_admission
                .add_new(&cancel_for_admission, &[pending_message("m2", 30_000)])
                .await;
        });

        sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        timeout(Duration::from_secs(1), admission)
            .await
            .expect("admission should return once cancelled")
            .unwrap();
        assert_eq!(tracker.size(), 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_pull_to_refresh_bumps_deadlines_near_expiry() {
        let clock = Arc::new(TestClock::new(0));
        let tracker = InFlightTracker::new(clock.clone(), Duration::from_secs(10), 10);
        let cancel = CancellationToken::new();

        let near = pending_message("near", 10_000);
        let far = pending_message("far", 30_000);
        tracker
            .add_new(&cancel, std::slice::from_ref(&near))
            .await;
        tracker.add_new(&cancel, std::slice::from_ref(&far)).await;

        // 6s in, "near" has 4s left (< 5s threshold), "far" has 24s.
        clock.advance(6_000);
        let due = tracker.pull_to_refresh();

        assert_eq!(due.len(), 1);
        assert_eq!(due[0].message_id, "near");
        assert_eq!(due[0].deadline_ms(), 16_000);
    }

    #[test_log::test(tokio::test)]
    async fn test_pull_to_refresh_skips_deleted_handles() {
        let clock = Arc::new(TestClock::new(0));
        let tracker = InFlightTracker::new(clock.clone(), Duration::from_secs(10), 10);
        let cancel = CancellationToken::new();

        let message = pending_message("m1", 10_000);
        let handle = message.handle.clone().unwrap();
        tracker.add_new(&cancel, &[message]).await;

        handle.mark_deleted();
        clock.advance(6_000);

        assert!(tracker.pull_to_refresh().is_empty());
        assert!(handle.is_deleted());
    }

    #[test_log::test(tokio::test)]
    async fn test_clear_wakes_all_waiters() {
        let clock = Arc::new(TestClock::new(0));
        let tracker = Arc::new(InFlightTracker::new(clock, Duration::from_secs(30), 2));
        let cancel = CancellationToken::new();

        tracker
            .add_new(
                &cancel,
                &[pending_message("m1", 30_000), pending_message("m2", 30_000)],
            )
            .await;

        let mut waiters = Vec::new();
        for n in 3..=4 {
            let tracker_for_admission = tracker.clone();
            let cancel_for_admission = cancel.clone();
            waiters.push(tokio::spawn(async move {
                tracker_for_admission
                    .add_new(
                        &cancel_for_admission,
                        &[pending_message(&format!("m{n}"), 30_000)],
                    )
                    .await;
            }));
        }

        sleep(Duration::from_millis(50)).await;
        tracker.clear();

        for waiter in waiters {
            timeout(Duration::from_secs(1), waiter)
                .await
                .expect("waiter should complete after clear")
                .unwrap();
        }
        assert_eq!(tracker.size(), 2);
    }
}

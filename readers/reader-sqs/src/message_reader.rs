use std::fmt::{self, Debug};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use conveyor_aws_helpers::clients::build_sqs_client;
use conveyor_helpers::readers::{AckCallback, Message, MessageReader};
use conveyor_helpers::time::{Clock, MonotonicClock};
use futures::future::join;
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info_span, Instrument};

use crate::ack::{delete_handles, AckLoop};
use crate::config::{SqsReaderConfig, SqsReaderFinalisedConfig};
use crate::errors::SqsReaderError;
use crate::fetch::FetchLoop;
use crate::queue_api::QueueApi;
use crate::tracker::InFlightTracker;
use crate::types::{FromSqsMessage, MessageHandle, PendingMessage, SqsMessageMetadata};
use crate::visibility::VisibilityExtender;

/// Provides an implementation of a streaming message reader over an
/// AWS SQS queue. Messages are long-polled in the background, served
/// to callers one at a time and acknowledged back to the queue in
/// batches, while in-flight messages have their visibility leases
/// renewed for as long as the consumer holds them.
pub struct SqsMessageReader {
    config: Arc<SqsReaderFinalisedConfig>,
    clock: Arc<dyn Clock>,
    client: Mutex<Option<Arc<dyn QueueApi>>>,
    session: Mutex<Option<Arc<ReaderSession>>>,
}

impl Debug for SqsMessageReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SqsMessageReader")
    }
}

struct ReaderSession {
    client: Arc<dyn QueueApi>,
    config: Arc<SqsReaderFinalisedConfig>,
    tracker: Arc<InFlightTracker>,
    extender: Arc<VisibilityExtender>,
    handoff_rx: AsyncMutex<mpsc::Receiver<PendingMessage>>,
    ack_tx: mpsc::Sender<Arc<MessageHandle>>,
    nack_tx: mpsc::Sender<Arc<MessageHandle>>,
    soft_stop: CancellationToken,
    hard_stop: CancellationToken,
    loops: Mutex<Option<(JoinHandle<()>, JoinHandle<()>)>>,
}

impl ReaderSession {
    /// Settles a message directly when the background loops are
    /// already draining, so the acknowledgement is not lost.
    async fn finalise_direct(&self, handle: Arc<MessageHandle>, acknowledged: bool) {
        self.tracker.remove(&handle.message_id);
        handle.mark_deleted();
        let handles = [handle];
        if acknowledged {
            delete_handles(&self.client, &self.config, &handles, &self.hard_stop).await;
        } else {
            self.extender.reset(&handles, &self.hard_stop).await;
        }
    }
}

impl SqsMessageReader {
    /// Creates a reader that constructs the real SQS client from the
    /// configured region and endpoint on first connect.
    pub fn new(config: SqsReaderConfig) -> SqsMessageReader {
        SqsMessageReader {
            config: Arc::new(config.finalise()),
            clock: Arc::new(MonotonicClock::new()),
            client: Mutex::new(None),
            session: Mutex::new(None),
        }
    }

    /// Creates a reader over a caller-supplied queue client.
    pub fn with_client(config: SqsReaderConfig, client: Arc<dyn QueueApi>) -> SqsMessageReader {
        SqsMessageReader {
            config: Arc::new(config.finalise()),
            clock: Arc::new(MonotonicClock::new()),
            client: Mutex::new(Some(client)),
            session: Mutex::new(None),
        }
    }

    fn session(&self) -> Option<Arc<ReaderSession>> {
        self.session.lock().unwrap().clone()
    }

    async fn get_or_build_client(&self) -> Arc<dyn QueueApi> {
        {
            let client = self.client.lock().unwrap();
            if let Some(client) = client.as_ref() {
                return client.clone();
            }
        }

        let client: Arc<dyn QueueApi> = Arc::new(
            build_sqs_client(
                self.config.aws_region.clone(),
                self.config.sqs_endpoint.clone(),
            )
            .await,
        );

        let mut slot = self.client.lock().unwrap();
        if let Some(existing) = slot.as_ref() {
            return existing.clone();
        }
        *slot = Some(client.clone());
        client
    }
}

#[async_trait]
impl MessageReader<SqsMessageMetadata> for SqsMessageReader {
    type Error = SqsReaderError;

    async fn connect(&self) -> Result<(), Self::Error> {
        if self.session.lock().unwrap().is_some() {
            return Ok(());
        }

        let client = self.get_or_build_client().await;

        let mut session_slot = self.session.lock().unwrap();
        if session_slot.is_some() {
            return Ok(());
        }

        let tracker = Arc::new(InFlightTracker::new(
            self.clock.clone(),
            self.config.message_timeout,
            self.config.max_outstanding_messages,
        ));
        let extender = Arc::new(VisibilityExtender::new(client.clone(), self.config.clone()));
        // Capacity-one channels so that a stalled consumer stalls the
        // fetch loop after a single message.
        let (handoff_tx, handoff_rx) = mpsc::channel(1);
        let (ack_tx, ack_rx) = mpsc::channel(1);
        let (nack_tx, nack_rx) = mpsc::channel(1);
        let soft_stop = CancellationToken::new();
        let hard_stop = CancellationToken::new();

        let fetch_loop = FetchLoop {
            client: client.clone(),
            config: self.config.clone(),
            clock: self.clock.clone(),
            tracker: tracker.clone(),
            extender: extender.clone(),
            handoff_tx,
            soft_stop: soft_stop.clone(),
            hard_stop: hard_stop.clone(),
        };
        let ack_loop = AckLoop {
            client: client.clone(),
            config: self.config.clone(),
            tracker: tracker.clone(),
            extender: extender.clone(),
            ack_rx,
            nack_rx,
            soft_stop: soft_stop.clone(),
            hard_stop: hard_stop.clone(),
            refresh_gate: Arc::new(AsyncMutex::new(())),
        };
        let fetch_handle = tokio::spawn(fetch_loop.run().instrument(info_span!("sqs_fetch_loop")));
        let ack_handle = tokio::spawn(ack_loop.run().instrument(info_span!("sqs_ack_loop")));

        *session_slot = Some(Arc::new(ReaderSession {
            client,
            config: self.config.clone(),
            tracker,
            extender,
            handoff_rx: AsyncMutex::new(handoff_rx),
            ack_tx,
            nack_tx,
            soft_stop,
            hard_stop,
            loops: Mutex::new(Some((fetch_handle, ack_handle))),
        }));
        Ok(())
    }

    async fn read(&self) -> Result<(Message<SqsMessageMetadata>, AckCallback), Self::Error> {
        let session = self.session().ok_or(SqsReaderError::NotConnected)?;

        let received = {
            let mut handoff_rx = session.handoff_rx.lock().await;
            tokio::select! {
                _ = session.soft_stop.cancelled() => return Err(SqsReaderError::EndOfInput),
                received = handoff_rx.recv() => received,
            }
        };
        let Some(pending) = received else {
            return Err(SqsReaderError::EndOfInput);
        };

        if pending.message.body.is_none() {
            debug!("dropping received message with no body");
            if let Some(handle) = &pending.handle {
                session.tracker.remove(&handle.message_id);
                handle.mark_deleted();
            }
            return Err(SqsReaderError::Cancelled);
        }

        let message = Message::from_sqs_message(&pending.message);
        let ack_callback = make_ack_callback(session, pending.handle);
        Ok((message, ack_callback))
    }

    async fn close(&self, deadline: Option<Duration>) -> Result<(), Self::Error> {
        let Some(session) = self.session() else {
            return Ok(());
        };
        session.soft_stop.cancel();

        let loops = session.loops.lock().unwrap().take();
        let Some((fetch_handle, ack_handle)) = loops else {
            return Ok(());
        };

        if let Some(deadline) = deadline {
            let hard_stop = session.hard_stop.clone();
            let escalate_after = deadline.saturating_sub(Duration::from_secs(1));
            tokio::spawn(async move {
                tokio::time::sleep(escalate_after).await;
                hard_stop.cancel();
            });
        }

        let joined = join(fetch_handle, ack_handle);
        let (fetch_result, ack_result) = match deadline {
            Some(deadline) => match tokio::time::timeout(deadline, joined).await {
                Ok(results) => results,
                Err(_) => {
                    session.hard_stop.cancel();
                    return Err(SqsReaderError::CloseTimedOut);
                }
            },
            None => joined.await,
        };
        if let Err(err) = fetch_result {
            error!("fetch loop panicked: {err}");
        }
        if let Err(err) = ack_result {
            error!("ack loop panicked: {err}");
        }
        Ok(())
    }
}

/// Builds the acknowledgement callback for a delivered message.
/// A successful outcome routes the handle to the delete batch; a
/// failure routes it to a visibility reset. When shutdown has already
/// begun the handle is settled directly with a single-message call.
fn make_ack_callback(
    session: Arc<ReaderSession>,
    handle: Option<Arc<MessageHandle>>,
) -> AckCallback {
    Box::new(move |outcome| {
        Box::pin(async move {
            // No handle means the message was missing its ID or
            // receipt handle; there is nothing to settle at the wire.
            let Some(handle) = handle else {
                return;
            };
            let acknowledged = match outcome {
                Ok(()) => true,
                Err(err) => {
                    debug!("consumer reported a handling failure, scheduling redelivery: {err}");
                    false
                }
            };
            let tx = if acknowledged {
                session.ack_tx.clone()
            } else {
                session.nack_tx.clone()
            };
            tokio::select! {
                _ = session.soft_stop.cancelled() => {
                    session.finalise_direct(handle, acknowledged).await;
                }
                result = tx.send(handle.clone()) => {
                    if result.is_err() {
                        session.finalise_direct(handle, acknowledged).await;
                    }
                }
            }
        })
    })
}

use async_trait::async_trait;
use std::{
    error::Error,
    fmt::{self, Debug},
    future::Future,
    pin::Pin,
    time::Duration,
};
use tokio::time::error::Elapsed;

/// A message that has been received from a message service.
#[derive(Debug, Clone)]
pub struct Message<Metadata: Debug> {
    /// A unique identifier for the message.
    pub message_id: String,
    /// The contents of the message.
    pub body: Option<String>,
    /// An MD5 digest of the message body string,
    /// can be used to verify that the original message
    /// was not corrupted.
    /// When set, this is expected to be computed by the sender
    /// or the message service (e.g. Amazon SQS)
    /// the message was received from.
    pub md5_of_body: Option<String>,
    /// Additional metadata about the message,
    /// this will often have information specific
    /// to the message service used to deliver the message.
    pub metadata: Metadata,
}

/// A pinned future produced by an acknowledgement callback.
pub type PinnedAckFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// A callback handed out alongside each delivered message.
/// Calling it with `Ok(())` acknowledges the message as processed;
/// calling it with an error negatively acknowledges it so the message
/// service can make it available for redelivery.
pub type AckCallback = Box<dyn FnOnce(Result<(), MessageHandlerError>) -> PinnedAckFuture + Send>;

/// Provides a trait for a message reader that pulls messages
/// from a queue or message broker one at a time, leaving
/// acknowledgement to the caller via a per-message callback.
#[async_trait]
pub trait MessageReader<Metadata: Debug> {
    type Error;

    /// Establishes the session with the message service and starts
    /// any background work needed to serve messages.
    /// Calling this when already connected is a no-op.
    async fn connect(&self) -> Result<(), Self::Error>;

    /// Returns the next message along with its acknowledgement callback.
    /// Blocks until a message is available or the reader is closed.
    async fn read(&self) -> Result<(Message<Metadata>, AckCallback), Self::Error>;

    /// Stops the reader, draining in-flight work.
    /// When a deadline is provided, shutdown is escalated so that
    /// this call returns before the deadline elapses.
    async fn close(&self, deadline: Option<Duration>) -> Result<(), Self::Error>;
}

// Provides a custom error type to be used for failures
// within message handlers.
#[derive(Debug)]
pub enum MessageHandlerError {
    Timeout(Elapsed),
    HandlerFailure(Box<dyn Error + Send + Sync + 'static>),
}

impl fmt::Display for MessageHandlerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MessageHandlerError::Timeout(elapsed_error) => {
                write!(f, "message handler failed: timeout {elapsed_error}")
            }
            MessageHandlerError::HandlerFailure(handler_error) => {
                write!(f, "message handler failed: {handler_error}")
            }
        }
    }
}

impl Error for MessageHandlerError {}

use std::error::Error;
use std::fmt::{self, Display};

use aws_sdk_sqs::error::{ProvideErrorMetadata, SdkError};
use aws_smithy_runtime_api::client::orchestrator::HttpResponse;
use aws_smithy_runtime_api::http::StatusCode;
use http::StatusCode as StatusCodeHttp;

/// An error surfaced by an implementation of the queue API.
#[derive(Debug, Clone)]
pub enum QueueApiError {
    /// The call did not complete before a client-side timeout elapsed.
    /// Expected under long polling when the queue is empty.
    Timeout,
    /// The queue service could not be reached or rejected the
    /// caller's credentials.
    Connection { message: String },
    /// The queue service returned a failure response.
    Service {
        code: Option<String>,
        message: String,
    },
}

impl QueueApiError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, QueueApiError::Timeout)
    }

    pub fn is_connection(&self) -> bool {
        matches!(self, QueueApiError::Connection { .. })
    }
}

impl Display for QueueApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueApiError::Timeout => write!(f, "queue API error: request timed out"),
            QueueApiError::Connection { message } => {
                write!(f, "queue API error: connection failure: {message}")
            }
            QueueApiError::Service { code, message } => {
                let code = code.as_deref().unwrap_or("unknown");
                write!(f, "queue API error: service failure ({code}): {message}")
            }
        }
    }
}

impl Error for QueueApiError {}

fn is_connection_error<E: ProvideErrorMetadata>(err: &E, status: StatusCode) -> bool {
    let is_forbidden_response = status == StatusCode::from(StatusCodeHttp::FORBIDDEN);
    let err_code = err.code().unwrap_or("");
    let is_auth_err_code = err_code == "CredentialsError" || err_code == "UnknownEndpoint";
    is_forbidden_response || is_auth_err_code
}

/// Classifies an AWS SDK error into the queue API error kinds,
/// so that long-poll expiry and connection failures can be told
/// apart from real service failures.
pub(crate) fn classify_sdk_error<E>(err: SdkError<E, HttpResponse>) -> QueueApiError
where
    E: ProvideErrorMetadata + Error + Send + Sync + 'static,
{
    match &err {
        SdkError::TimeoutError(_) => QueueApiError::Timeout,
        SdkError::DispatchFailure(failure) => {
            if failure.is_timeout() {
                QueueApiError::Timeout
            } else {
                QueueApiError::Connection {
                    message: err.to_string(),
                }
            }
        }
        SdkError::ServiceError(service_err) => {
            let source = service_err.err();
            if is_connection_error(source, service_err.raw().status()) {
                QueueApiError::Connection {
                    message: source.to_string(),
                }
            } else {
                QueueApiError::Service {
                    code: source.code().map(String::from),
                    message: source.to_string(),
                }
            }
        }
        _ => QueueApiError::Service {
            code: err.code().map(String::from),
            message: err.to_string(),
        },
    }
}

/// An error surfaced through the reader's public contract.
#[derive(Debug)]
pub enum SqsReaderError {
    /// `connect` has not been called or did not complete successfully.
    NotConnected,
    /// The reader has been closed and no further messages will be served.
    EndOfInput,
    /// The current read could not produce a usable message;
    /// the caller should read again.
    Cancelled,
    /// Shutdown did not finish draining before the close deadline.
    CloseTimedOut,
}

impl Display for SqsReaderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqsReaderError::NotConnected => {
                write!(f, "reader error: not connected to the queue service")
            }
            SqsReaderError::EndOfInput => write!(f, "reader error: end of input"),
            SqsReaderError::Cancelled => write!(f, "reader error: read cancelled"),
            SqsReaderError::CloseTimedOut => {
                write!(f, "reader error: close deadline exceeded before loops stopped")
            }
        }
    }
}

impl Error for SqsReaderError {}

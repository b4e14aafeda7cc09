use std::error::Error as StdError;
use std::future::Future;
use std::io::ErrorKind;

use tracing::warn;

use crate::server::error::{AppResult, Error};

/// live playback gets one retry, the player will ask again anyway
pub const LIVE_MAX_ATTEMPTS: u32 = 2;
/// catchup requests are user initiated and worth a couple more tries
pub const CATCHUP_MAX_ATTEMPTS: u32 = 3;

/// why a request never produced a response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportFailure {
    /// the backend dropped the connection before the first byte, safe to resend
    ConnectionClosed,
    Timeout,
    Other,
}

impl TransportFailure {
    pub fn classify(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::Timeout;
        }

        let mut source = err.source();
        while let Some(cause) = source {
            // a peer that hangs up before answering surfaces as hyper's IncompleteMessage
            if let Some(http) = cause.downcast_ref::<hyper::Error>() {
                if http.is_incomplete_message() || http.is_closed() {
                    return Self::ConnectionClosed;
                }
            }
            if let Some(io) = cause.downcast_ref::<std::io::Error>() {
                if Self::is_closed_kind(io.kind()) {
                    return Self::ConnectionClosed;
                }
            }
            source = cause.source();
        }

        Self::Other
    }

    pub fn is_closed_kind(kind: ErrorKind) -> bool {
        matches!(
            kind,
            ErrorKind::ConnectionReset
                | ErrorKind::ConnectionAborted
                | ErrorKind::UnexpectedEof
                | ErrorKind::BrokenPipe
        )
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConnectionClosed)
    }
}

/// outcome of one attempt
pub enum RetryAction<T> {
    Success(T),
    /// transient failure, the message ends up in the final error if every attempt fails
    Retry(String),
    Fail(Error),
}

impl<T> RetryAction<T> {
    /// turns a send error into the right action
    pub fn from_transport(err: reqwest::Error, what: &str) -> Self {
        match TransportFailure::classify(&err) {
            kind if kind.is_retryable() => Self::Retry(format!("{}: {}", what, err)),
            TransportFailure::Timeout => Self::Fail(Error::TransientNetworkError {
                attempts: 1,
                message: format!("{} timed out: {}", what, err),
            }),
            _ => Self::Fail(Error::InternalServerErrorWithContext(format!(
                "{} failed: {}",
                what, err
            ))),
        }
    }
}

/// runs `operation` up to `max_attempts` times, resending right away on transient failures.
/// the closure gets the 1-indexed attempt number
pub async fn retry_immediately<F, Fut, T>(max_attempts: u32, operation: F) -> AppResult<T>
where
    F: Fn(u32) -> Fut,
    Fut: Future<Output = RetryAction<T>>,
{
    let mut last_message = String::new();

    for attempt in 1..=max_attempts {
        match operation(attempt).await {
            RetryAction::Success(value) => return Ok(value),
            RetryAction::Fail(err) => return Err(err),
            RetryAction::Retry(message) => {
                warn!(
                    attempt,
                    max = max_attempts,
                    error = %message,
                    "connection closed before response, retrying"
                );
                last_message = message;
            }
        }
    }

    Err(Error::TransientNetworkError {
        attempts: max_attempts,
        message: last_message,
    })
}

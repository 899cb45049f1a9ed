// SPDX-License-Identifier: Apache-2.0

//! The capability a flow uses to deliver record buffers.

use std::time::Duration;

use thiserror::Error;
use tower::BoxError;

use crate::tailing::buffer::RecordBuffer;

/// Pause before retrying a buffer whose destination does not exist yet
pub const DESTINATION_NOT_FOUND_PAUSE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Success,
    /// Only the records at these ascending indices were accepted.
    PartialSuccess { succeeded: Vec<usize> },
}

#[derive(Error, Debug)]
pub enum SendError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Service error (status {status}): {message}")]
    Service { status: u16, message: String },

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Unknown host: {0}")]
    UnknownHost(String),

    #[error("Interrupted: {0}")]
    Interrupted(String),

    #[error("Destination not found: {0}")]
    DestinationNotFound(String),

    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    #[error(transparent)]
    Other(BoxError),
}

impl SendError {
    /// Whether the same buffer may succeed on a later attempt.
    pub fn is_retriable(&self) -> bool {
        match self {
            SendError::Io(_)
            | SendError::Service { .. }
            | SendError::DestinationNotFound(_)
            | SendError::Other(_) => true,
            SendError::Authentication(_)
            | SendError::UnknownHost(_)
            | SendError::Interrupted(_)
            | SendError::MalformedRequest(_) => false,
        }
    }

    /// Extra pause before the retry, on top of the regular backoff.
    pub fn retry_pause(&self) -> Option<Duration> {
        match self {
            SendError::DestinationNotFound(_) => Some(DESTINATION_NOT_FOUND_PAUSE),
            _ => None,
        }
    }
}

/// Delivers buffers to a destination.
///
/// Implementations must not modify the buffer. They are shared by every
/// publisher worker of a flow and called from worker threads.
pub trait Sender: Send + Sync {
    fn send(&self, buffer: &RecordBuffer) -> Result<SendOutcome, SendError>;

    /// Destination name for logs
    fn name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(SendError::Io(std::io::Error::other("reset")).is_retriable());
        assert!(
            SendError::Service {
                status: 503,
                message: "busy".to_string()
            }
            .is_retriable()
        );
        assert!(SendError::Other("boom".into()).is_retriable());
        assert!(!SendError::Authentication("denied".to_string()).is_retriable());
        assert!(!SendError::UnknownHost("nowhere".to_string()).is_retriable());
        assert!(!SendError::Interrupted("shutdown".to_string()).is_retriable());
        assert!(!SendError::MalformedRequest("bad".to_string()).is_retriable());

        let missing = SendError::DestinationNotFound("stream".to_string());
        assert!(missing.is_retriable());
        assert_eq!(missing.retry_pause(), Some(DESTINATION_NOT_FOUND_PAUSE));
    }
}

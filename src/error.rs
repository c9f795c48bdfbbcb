//! Error types for the capture layer.
//!
//! Every failure is scoped to one capture instance and reported to the caller
//! of the operation that hit it. Nothing here is globally fatal, and the
//! interrupt path never produces an error at all: counters wrap, overruns are
//! counted, and the condition surfaces later through [`crate::CaptureStats`].
//!
//! ## Error Categories
//!
//! - **`InvalidArgument`**: bad instance/lane id, unsupported lane count,
//!   malformed geometry. Always detected before any register write.
//! - **`ResourceUnavailable`**: register mapping failed or the shared PHY
//!   register could not be locked in time.
//! - **`Timeout`**: the quiescence wait in `stop` ran past its deadline. The
//!   device stays `Draining` and the caller may retry.
//! - **`InvalidState`**: a lifecycle operation was called from a state that
//!   does not allow it (e.g. `start` on a closed device).

use std::time::Duration;

use thiserror::Error;

use crate::state::CaptureState;

/// Result type alias for capture operations.
pub type Result<T> = std::result::Result<T, CaptureError>;

/// Errors that can occur while configuring or driving a capture instance.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    /// A parameter was outside its declared range.
    #[error("Invalid argument: {message}")]
    InvalidArgument {
        /// What was wrong.
        message: String,
    },

    /// A hardware resource could not be acquired.
    #[error("Resource unavailable: {message}")]
    ResourceUnavailable {
        /// Which resource, and why.
        message: String,
    },

    /// A blocking wait exceeded its deadline.
    #[error("Timed out after {waited:?} waiting for {what}")]
    Timeout {
        /// Condition that was awaited.
        what: &'static str,
        /// Time actually spent waiting.
        waited: Duration,
    },

    /// Lifecycle operation not permitted in the current state.
    #[error("Operation '{op}' not allowed in state {state}")]
    InvalidState {
        /// Rejected operation.
        op: &'static str,
        /// State the device was in.
        state: CaptureState,
    },
}

/// Coarse error category, for callers that only need to branch on the class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// See [`CaptureError::InvalidArgument`].
    InvalidArgument,
    /// See [`CaptureError::ResourceUnavailable`].
    ResourceUnavailable,
    /// See [`CaptureError::Timeout`].
    Timeout,
    /// See [`CaptureError::InvalidState`].
    InvalidState,
}

impl CaptureError {
    pub(crate) fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    pub(crate) fn unavailable(message: impl Into<String>) -> Self {
        Self::ResourceUnavailable {
            message: message.into(),
        }
    }

    /// Category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            Self::ResourceUnavailable { .. } => ErrorKind::ResourceUnavailable,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::InvalidState { .. } => ErrorKind::InvalidState,
        }
    }

    /// Whether re-issuing the same operation may succeed without other changes.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::ResourceUnavailable { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CaptureError::invalid_argument("data lane count 5 not in 1..=4");
        assert!(err.to_string().contains("lane count 5"));

        let err = CaptureError::InvalidState {
            op: "start",
            state: CaptureState::Closed,
        };
        assert_eq!(err.to_string(), "Operation 'start' not allowed in state Closed");
    }

    #[test]
    fn test_error_kind() {
        let timeout = CaptureError::Timeout {
            what: "quiescence",
            waited: Duration::from_millis(5),
        };
        assert_eq!(timeout.kind(), ErrorKind::Timeout);
        assert!(timeout.is_retryable());
        assert!(!CaptureError::invalid_argument("x").is_retryable());
    }
}

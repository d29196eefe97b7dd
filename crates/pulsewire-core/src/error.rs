//! Error taxonomy for the measurement streaming engine.

use thiserror::Error;

/// Errors surfaced by the streaming engine and its transports.
///
/// Errors are `Clone` because a terminal close status is recorded once and
/// then handed to every poller and completion waiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    /// Local validation failed; no network action was performed.
    #[error("validation failed: {reason}")]
    Validation {
        /// What failed to validate.
        reason: String,
    },

    /// Channel-level failure (connect, read, or write).
    #[error("transport failure: {reason}")]
    Transport {
        /// What the channel reported.
        reason: String,
    },

    /// The underlying connection has been closed.
    #[error("transport closed: {reason}")]
    TransportClosed {
        /// Why the connection closed.
        reason: String,
    },

    /// An operation exceeded its timeout.
    #[error("timed out after {timeout_ms}ms")]
    Timeout {
        /// The timeout that elapsed, in milliseconds.
        timeout_ms: u64,
    },

    /// The server rejected the credentials.
    #[error("unauthenticated: {reason}")]
    Unauthenticated {
        /// What the server reported.
        reason: String,
    },

    /// The credentials lack permission for the operation.
    #[error("unauthorized: {reason}")]
    Unauthorized {
        /// What the server reported.
        reason: String,
    },

    /// The referenced entity does not exist.
    #[error("not found: {reason}")]
    NotFound {
        /// What was missing.
        reason: String,
    },

    /// The measurement has already been closed.
    #[error("measurement already closed")]
    AlreadyClosed,

    /// The stream is already active; `reset` is required before reuse.
    #[error("stream already active, must reset before reuse")]
    AlreadyActive,

    /// An unexpected internal failure.
    #[error("internal error: {reason}")]
    Internal {
        /// What went wrong.
        reason: String,
    },

    /// The peer violated the wire protocol.
    #[error("protocol violation: {reason}")]
    Protocol {
        /// How the protocol was violated.
        reason: String,
    },
}

impl StreamError {
    /// Shorthand for a validation error.
    pub fn validation(reason: impl Into<String>) -> Self {
        StreamError::Validation {
            reason: reason.into(),
        }
    }

    /// Shorthand for a transport failure.
    pub fn transport(reason: impl Into<String>) -> Self {
        StreamError::Transport {
            reason: reason.into(),
        }
    }

    /// Shorthand for a closed-transport error.
    pub fn transport_closed(reason: impl Into<String>) -> Self {
        StreamError::TransportClosed {
            reason: reason.into(),
        }
    }

    /// Shorthand for a protocol violation.
    pub fn protocol(reason: impl Into<String>) -> Self {
        StreamError::Protocol {
            reason: reason.into(),
        }
    }

    /// Shorthand for an internal error.
    pub fn internal(reason: impl Into<String>) -> Self {
        StreamError::Internal {
            reason: reason.into(),
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StreamError>;

/// Terminal status recorded when a measurement closes.
///
/// `Ok(())` is a natural completion; an error carries the status that
/// triggered the close. The first writer wins and the value is immutable
/// afterwards.
pub type CloseStatus = Result<()>;

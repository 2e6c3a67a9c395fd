use thiserror::Error;

/// Failures of a [`crate::StreamingSession`].
///
/// Payloads are plain strings so the error can be cloned into
/// `last_error()` and handed back to the caller at the same time.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("receiver rejected request: {0}")]
    ReceiverRejected(String),

    #[error("stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("session is not streaming")]
    NotConnected,

    #[error("start cancelled")]
    Cancelled,

    #[error("resource busy: {0}")]
    ResourceBusy(String),

    /// The lock artifact could not be created for a reason other than
    /// another holder.
    #[error("lock unavailable: {0}")]
    LockFailed(String),

    #[error("capture failed: {0}")]
    CaptureFailed(String),

    #[error("invalid audio source: {0}")]
    InvalidSource(String),
}

pub type Result<T> = std::result::Result<T, SessionError>;

use std::sync::Arc;

/// Errors produced by the stream state machines.
///
/// `InvalidState` and `Locked` surface synchronously at the call site and
/// are never stored on a stream. Every other kind can become a stream's
/// stored error, in which case all pending and future requests on that
/// stream settle with a clone of the same reason.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StreamError {
    /// The operation is illegal for the stream's current state or lock,
    /// e.g. writing after close.
    #[error("operation invalid in current state: {0}")]
    InvalidState(&'static str),

    /// A second reader/writer lock acquisition was attempted.
    #[error("stream is already locked")]
    Locked,

    /// The size algorithm returned a negative or non-finite chunk size.
    #[error("size algorithm produced an invalid chunk size: {0}")]
    SizeAlgorithm(f64),

    /// A source/sink hook failed.
    #[error("hook failed: {0}")]
    Hook(Arc<str>),

    /// A byte stream was closed while a zero-copy buffer held a partial
    /// fill that is not a whole number of elements.
    #[error("stream closed with partially filled buffer")]
    ClosedWithPendingBytes,

    /// The reader/writer lock was released while this operation was
    /// pending.
    #[error("lock released while operation pending")]
    LockReleased,

    /// The pipe's cancellation signal fired.
    #[error("pipe cancelled")]
    Cancelled,

    /// A constructor option failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// A caller-supplied cancel/abort/error reason.
    #[error("{0}")]
    Other(Arc<str>),
}

impl StreamError {
    /// A caller-supplied reason.
    pub fn other(reason: impl Into<String>) -> Self {
        StreamError::Other(Arc::from(reason.into()))
    }

    /// A hook-failure reason.
    pub fn hook(reason: impl Into<String>) -> Self {
        StreamError::Hook(Arc::from(reason.into()))
    }
}

pub type Result<T> = std::result::Result<T, StreamError>;

//! Network error types

/// Network result type
pub type Result<T> = std::result::Result<T, Error>;

/// Session engine errors
///
/// Each variant corresponds to one status the legacy-facing shim reports.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Core(#[from] relayplay_core::Error),

    #[error("Invalid parameter: {0}")]
    InvalidParam(&'static str),

    #[error("Invalid player")]
    InvalidPlayer,

    #[error("Not connected")]
    NotConnected,

    #[error("Not initialized")]
    Uninitialized,

    #[error("Already initialized")]
    AlreadyInitialized,

    #[error("No service provider for this address")]
    NoServiceProvider,

    #[error("Unsupported: {0}")]
    Unsupported(&'static str),

    #[error("Timed out")]
    Timeout,

    #[error("Cancelled")]
    Cancelled,

    #[error("No messages")]
    NoMessages,

    #[error("Buffer too small, {required} bytes required")]
    BufferTooSmall { required: usize },

    #[error("Failed to allocate message of {size} bytes")]
    AllocationFailed { size: usize },

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Rejected: {0}")]
    Rejected(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("{0}")]
    Generic(String),
}

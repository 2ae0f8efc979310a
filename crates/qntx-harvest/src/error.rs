//! Error types for the acquisition engine

use std::time::Duration;

use thiserror::Error;

/// Result type for acquisition operations
pub type Result<T> = std::result::Result<T, HarvestError>;

/// Errors surfaced by the engine, the pool and the decoder
#[derive(Debug, Error)]
pub enum HarvestError {
    /// No buffer became available before the deadline
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// fetch/queue outside a running session
    #[error("Acquisition is not running")]
    NotAcquiring,

    /// The producer raced with an already terminated stream
    #[error("Resource busy: {0}")]
    ResourceBusy(String),

    /// Requested buffer count is below what the producer requires
    #[error("Cannot announce {requested} buffers, producer requires at least {minimum}")]
    Allocation { requested: usize, minimum: usize },

    /// Memory for a raw block could not be reserved
    #[error("Allocation failed: {0}")]
    AllocationFailed(String),

    /// Pixel format the decoder does not recognise
    #[error("Unsupported payload: {0}")]
    DecodeUnsupported(String),

    /// Malformed chunk metadata
    #[error("Chunk parse error: {0}")]
    ChunkParse(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A buffer was in a state that forbids the requested transition
    #[error("Invalid buffer state: {0}")]
    InvalidState(String),

    /// The host cancelled the engine's token
    #[error("Acquisition cancelled")]
    Cancelled,

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Feature error: {0}")]
    Feature(#[from] FeatureError),
}

impl HarvestError {
    /// True for fetch or delivery timeouts.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            HarvestError::Timeout(_) | HarvestError::Transport(TransportError::Timeout)
        )
    }

    /// Errors after which the caller can simply retry.
    pub fn is_recoverable(&self) -> bool {
        self.is_timeout()
            || matches!(
                self,
                HarvestError::ResourceBusy(_)
                    | HarvestError::DecodeUnsupported(_)
                    | HarvestError::ChunkParse(_)
                    | HarvestError::Transport(TransportError::Busy(_))
            )
    }
}

/// Errors reported by a producer implementation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("wait timed out")]
    Timeout,

    /// A blocked wait was woken by a flush
    #[error("wait aborted")]
    Aborted,

    #[error("busy: {0}")]
    Busy(String),

    #[error("not available: {0}")]
    NotAvailable(String),

    #[error("invalid handle {0}")]
    InvalidHandle(u64),

    #[error("{0}")]
    Other(String),
}

/// Errors reported by a node map implementation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FeatureError {
    #[error("feature {0} not found")]
    NotFound(String),

    #[error("feature {name} is not a {expected}")]
    TypeMismatch { name: String, expected: &'static str },

    #[error("feature {0} is not accessible")]
    AccessDenied(String),

    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Map onto the engine taxonomy. Wait timeouts and flush wakeups are not errors.
    pub fn escalate(self) -> Option<HarvestError> {
        match self {
            TransportError::Timeout | TransportError::Aborted => None,
            TransportError::Busy(msg) => Some(HarvestError::ResourceBusy(msg)),
            other => Some(HarvestError::Transport(other)),
        }
    }
}

//! Error types for the revisioned cache.

use crate::types::EntityId;
use thiserror::Error;

/// Result type alias for cache operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the revisioned cache.
///
/// Staleness never shows up here: a stale entry is reloaded transparently.
/// A loader reporting "not found" is not an error either, it surfaces as
/// `Ok(None)` from the read path.
#[derive(Error, Debug)]
pub enum Error {
    /// The loader failed while this caller held the init lock.
    ///
    /// The entry has already been reset to `Uninitialized`, so a later call
    /// may retry.
    #[error("initialization of {id} failed: {reason}")]
    InitializationFailure { id: EntityId, reason: String },

    /// Internal consistency violation in the entry state machine.
    ///
    /// This is a programming defect, never retried automatically.
    #[error("invalid cache state: {0}")]
    InvalidCacheState(String),

    /// Invalidation bus errors.
    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    /// The revision substrate rejected or failed an operation.
    #[error("revision store error: {0}")]
    Revision(String),

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// Wire encoding or decoding failed.
    #[error("codec error: {0}")]
    Codec(String),

    /// The cache has been shut down.
    #[error("cache is shut down")]
    Shutdown,
}

impl Error {
    /// Whether this error indicates a defect rather than a transient failure.
    pub fn is_defect(&self) -> bool {
        matches!(self, Error::InvalidCacheState(_))
    }

    /// Short label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InitializationFailure { .. } => "initialization_failure",
            Error::InvalidCacheState(_) => "invalid_cache_state",
            Error::Bus(_) => "bus",
            Error::Revision(_) => "revision",
            Error::Config(_) => "config",
            Error::Codec(_) => "codec",
            Error::Shutdown => "shutdown",
        }
    }
}

/// Invalidation bus errors.
#[derive(Error, Debug)]
pub enum BusError {
    /// The transport has no live subscribers or was closed.
    #[error("bus closed")]
    Closed,
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Codec(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_state_is_defect() {
        assert!(Error::InvalidCacheState("unlock without lock".into()).is_defect());
        assert!(!Error::InitializationFailure {
            id: EntityId::from("user#1"),
            reason: "db down".into(),
        }
        .is_defect());
    }

    #[test]
    fn test_error_display() {
        let err = Error::InitializationFailure {
            id: EntityId::from("realm#master"),
            reason: "timeout".into(),
        };
        assert_eq!(err.to_string(), "initialization of realm#master failed: timeout");
        assert_eq!(err.kind(), "initialization_failure");

        let err: Error = BusError::Closed.into();
        assert_eq!(err.to_string(), "bus error: bus closed");
    }
}

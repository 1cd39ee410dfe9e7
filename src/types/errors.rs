//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation and provide
//! clear error messages with context.

use thiserror::Error;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error enum for the supervisor, registries and transport.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors (reserved-key collision, bad task declaration).
    /// Always fatal, raised before any spawn.
    #[error("configuration error: {0}")]
    Config(String),

    /// Unknown task, token or primitive name.
    #[error("not found: {0}")]
    NotFound(String),

    /// Malformed encoded argument sequence or wire message.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Process or thread creation failed.
    #[error("spawn error: {0}")]
    Spawn(String),

    /// The peer side of a channel or socket is gone.
    #[error("channel closed: {0}")]
    ChannelClosed(String),

    /// Internal errors.
    #[error("internal error: {0}")]
    Internal(String),

    /// JSON serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Msgpack encoding errors on the wire.
    #[error("encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// Msgpack decoding errors on the wire.
    #[error("decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// Signal delivery errors.
    #[error("signal error: {0}")]
    Signal(#[from] nix::errno::Errno),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

// Convenience constructors
impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn spawn(msg: impl Into<String>) -> Self {
        Self::Spawn(msg.into())
    }

    pub fn channel_closed(msg: impl Into<String>) -> Self {
        Self::ChannelClosed(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether the error must abort startup rather than be logged and absorbed.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Config(_))
    }
}

/// Error returned by a unit's entry point.
///
/// `GracefulExit` is a control-flow signal, not a failure: it is logged as a
/// clean stop and never reported through the notifier.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("graceful exit requested")]
    GracefulExit,

    #[error("{0}")]
    Failed(Box<dyn std::error::Error + Send + Sync>),
}

impl WorkerError {
    pub fn failed(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Failed(err.into())
    }

    pub fn is_graceful(&self) -> bool {
        matches!(self, WorkerError::GracefulExit)
    }
}

impl From<Error> for WorkerError {
    fn from(err: Error) -> Self {
        WorkerError::Failed(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_errors_are_fatal() {
        assert!(Error::config("reserved key").is_fatal());
        assert!(!Error::protocol("bad marker").is_fatal());
        assert!(!Error::Io(std::io::Error::other("x")).is_fatal());
    }

    #[test]
    fn test_worker_error_display() {
        assert_eq!(
            WorkerError::GracefulExit.to_string(),
            "graceful exit requested"
        );
        let err = WorkerError::failed("queue exploded");
        assert_eq!(err.to_string(), "queue exploded");
        assert!(!err.is_graceful());

        let wrapped: WorkerError = Error::not_found("counter jobs").into();
        assert_eq!(wrapped.to_string(), "not found: counter jobs");
    }
}

//! Crate level errors.
//!
//! The backplane distinguishes failures by how the consuming loop must react
//! to them:
//!
//! - [`Error::Codec`]: a single consumed record could not be decoded. The loop
//!   logs it and skips the record.
//! - [`Error::Storage`]: persisting merged chat state failed. The batch is not
//!   committed and the consumer rewinds to its committed offsets so the broker
//!   redelivers it.
//! - [`Error::Broker`]: the broker client itself failed (poll, commit, seek).
//!   This escapes the loop and terminates its dedicated thread.
//!
//! Publish failures never surface here: they are reported through the
//! producer's delivery callback only.

use bytes::Bytes;
use std::{io, result};
use thiserror::Error as ThisError;

pub type Result<T> = result::Result<T, Error>;

#[derive(Clone, Debug, ThisError)]
pub enum Error {
    /// An envelope could not be decoded.
    #[error("Codec error: {reason} ({} bytes)", .data.len())]
    Codec { reason: String, data: Bytes },

    /// The broker client reported an error.
    #[error("Broker error: {0}")]
    Broker(String),

    /// Chat state could not be loaded or persisted.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// An error in the network or filesystem.
    #[error("IO error: {0:?}")]
    IoError(io::ErrorKind),

    /// The operation observed the shutdown signal.
    #[error("Cancelled")]
    Cancelled,
}

impl Error {
    /// Build a codec error carrying the offending bytes.
    pub fn codec(reason: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Error::Codec {
            reason: reason.into(),
            data: data.into(),
        }
    }

    /// Whether a failed batch should be redelivered rather than stop the loop.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Error::Storage(_))
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (
                Error::Codec {
                    reason: a,
                    data: da,
                },
                Error::Codec {
                    reason: b,
                    data: db,
                },
            ) => a == b && da == db,
            (Error::Broker(a), Error::Broker(b)) => a == b,
            (Error::Storage(a), Error::Storage(b)) => a == b,
            (Error::Config(a), Error::Config(b)) => a == b,
            (Error::IoError(a), Error::IoError(b)) => a == b,
            (Error::Cancelled, Error::Cancelled) => true,
            _ => false,
        }
    }
}

impl Eq for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::IoError(e.kind())
    }
}

#[cfg(feature = "kafka")]
impl From<rdkafka::error::KafkaError> for Error {
    fn from(e: rdkafka::error::KafkaError) -> Self {
        Error::Broker(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_error_display() {
        let err = Error::codec("truncated header", vec![1u8, 2, 3]);
        let display = err.to_string();
        assert!(display.contains("truncated header"));
        assert!(display.contains("3 bytes"));
    }

    #[test]
    fn test_only_storage_is_retriable() {
        assert!(Error::Storage("timeout".into()).is_retriable());
        assert!(!Error::Broker("fatal".into()).is_retriable());
        assert!(!Error::codec("bad", Bytes::new()).is_retriable());
        assert!(!Error::Cancelled.is_retriable());
    }

    #[test]
    fn test_io_error_conversion() {
        let err: Error = io::Error::new(io::ErrorKind::AddrInUse, "busy").into();
        assert_eq!(err, Error::IoError(io::ErrorKind::AddrInUse));
    }

    #[test]
    fn test_error_eq() {
        assert_eq!(Error::Broker("x".into()), Error::Broker("x".into()));
        assert_ne!(Error::Broker("x".into()), Error::Storage("x".into()));
        assert_eq!(Error::Cancelled, Error::Cancelled);
    }

    #[test]
    fn test_error_is_std_error() {
        let err: Box<dyn std::error::Error> = Box::new(Error::Config("missing".into()));
        assert!(err.to_string().contains("missing"));
    }
}

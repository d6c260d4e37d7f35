//! Error taxonomy for the monitoring service

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::event::BackendKind;

pub type Result<T, E = WatchError> = std::result::Result<T, E>;

/// Errors that can occur while registering, reading or decoding notifications
#[derive(Error, Debug)]
pub enum WatchError {
    #[error("Cannot watch {}: {reason}", path.display())]
    Registration { path: PathBuf, reason: String },

    #[error("Notification backend {backend} is unavailable: {source}")]
    BackendUnavailable {
        backend: BackendKind,
        #[source]
        source: io::Error,
    },

    #[error("Short read on control channel: expected {expected} bytes, got {actual}")]
    ControlRead { expected: usize, actual: usize },

    #[error("Malformed event record at offset {offset}: {reason}")]
    MalformedRecord { offset: usize, reason: String },

    #[error("Received unexpected signal {signal}")]
    UnexpectedSignal { signal: i32 },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl WatchError {
    pub fn registration(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        WatchError::Registration {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn malformed(offset: usize, reason: impl Into<String>) -> Self {
        WatchError::MalformedRecord {
            offset,
            reason: reason.into(),
        }
    }

    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        WatchError::Io {
            context: context.into(),
            source,
        }
    }

    /// Whether the service must stop after this error.
    ///
    /// Every condition is fatal except an unexpected signal, which is reported
    /// and ignored.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, WatchError::UnexpectedSignal { .. })
    }
}

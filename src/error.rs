//! Error kinds shared across every subsystem.
//!
//! Internally, errors propagate as `Result<T, Error>`; the OS-level cause
//! (an `io::Error` or `nix::Error`) is preserved as `source` so diagnostics
//! can report the underlying errno without every call site matching on it.

use std::fmt;
use thiserror::Error;

/// Coarse error categories used throughout the orchestrator, deliberately
/// named after the *situation*, not the Rust type that carries them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Null/invalid parameter, wrong endpoint role, bad state.
    InvalidArgument,
    /// Allocation failure.
    OutOfMemory,
    /// Empty or oversized frame payload.
    MessageSize,
    /// Send retries exhausted.
    TimedOut,
    /// Slot index out of bounds or already free.
    Range,
    /// Corrupt serialized record.
    IllegalByteSequence,
    /// Peer FIFO absent (server down or wrong pid).
    NotFound,
    /// Server FIFO already present at startup.
    AlreadyExists,
    /// Requested timestamp not set.
    Domain,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::InvalidArgument => "invalid argument",
            ErrorKind::OutOfMemory => "out of memory",
            ErrorKind::MessageSize => "message size",
            ErrorKind::TimedOut => "timed out",
            ErrorKind::Range => "range",
            ErrorKind::IllegalByteSequence => "illegal byte sequence",
            ErrorKind::NotFound => "not found",
            ErrorKind::AlreadyExists => "already exists",
            ErrorKind::Domain => "domain",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct Error {
    pub kind: ErrorKind,
    pub message: String,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Error {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        kind: ErrorKind,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Error {
            kind,
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        let kind = match e.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::NotFound,
            std::io::ErrorKind::AlreadyExists => ErrorKind::AlreadyExists,
            std::io::ErrorKind::InvalidInput | std::io::ErrorKind::InvalidData => {
                ErrorKind::InvalidArgument
            }
            std::io::ErrorKind::TimedOut => ErrorKind::TimedOut,
            _ => ErrorKind::InvalidArgument,
        };
        Error::with_source(kind, e.to_string(), e)
    }
}

impl From<nix::Error> for Error {
    fn from(e: nix::Error) -> Self {
        let kind = match e {
            nix::Error::ENOENT => ErrorKind::NotFound,
            nix::Error::EEXIST => ErrorKind::AlreadyExists,
            nix::Error::ENOMEM => ErrorKind::OutOfMemory,
            nix::Error::ETIMEDOUT => ErrorKind::TimedOut,
            _ => ErrorKind::InvalidArgument,
        };
        let io_err = std::io::Error::from_raw_os_error(e as i32);
        Error::with_source(kind, e.to_string(), io_err)
    }
}

//! Error types for pool-to-pool transfers.
//!
//! Every failure a transfer can hit ends up as a [`TransferError`] recorded
//! on the companion and handed to the completion callback.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

use crate::types::FileId;

pub type Result<T, E = TransferError> = std::result::Result<T, E>;

/// Malformed or unexpected traffic from the source pool's mover.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("ack too small: {following} bytes, need at least {min}")]
    FrameTooSmall { following: u32, min: u32 },

    #[error("frame of {0} bytes exceeds maximum allowed size")]
    FrameTooLarge(u32),

    #[error("expected {expected}, got message type {actual}")]
    UnexpectedType { expected: &'static str, actual: u32 },

    #[error("expected {expected} mode, got {actual}")]
    UnexpectedMode { expected: &'static str, actual: u32 },

    #[error("{request} request failed: ({code}) {message}")]
    Remote {
        request: &'static str,
        code: i32,
        message: String,
    },

    #[error("remote file size {remote} does not match expected size {expected}")]
    SizeMismatch { expected: u64, remote: u64 },

    #[error("amount of received data ({received}) does not match expected file size ({expected})")]
    TotalMismatch { expected: u64, received: u64 },

    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("source mover finished before connecting")]
    FinishedBeforeConnect,
}

/// Failure of an asynchronous request to the namespace or a remote pool.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoordinationError {
    #[error("({code}) {message}")]
    Failure { code: i32, message: String },

    #[error("request timed out")]
    Timeout,

    #[error("no route to {0}")]
    NoRoute(String),
}

impl CoordinationError {
    pub fn failure(code: i32, message: impl Into<String>) -> Self {
        Self::Failure {
            code,
            message: message.into(),
        }
    }
}

/// Errors raised by the local replica repository.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("replica of {0} already exists")]
    FileInCache(FileId),

    #[error("not enough space to allocate {requested} bytes")]
    NoSpace { requested: u64 },

    #[error("repository I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("{0}")]
    Other(String),
}

/// Final outcome of a failed transfer.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("transport failure: {0}")]
    Transport(#[from] io::Error),

    #[error("{during} failed: {source}")]
    Coordination {
        during: &'static str,
        #[source]
        source: CoordinationError,
    },

    #[error("transfer cancelled: {0}")]
    Cancelled(String),

    #[error("repository failure: {0}")]
    Repository(#[from] RepositoryError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl TransferError {
    pub fn coordination(during: &'static str, source: CoordinationError) -> Self {
        Self::Coordination { during, source }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    /// Programming errors are logged louder but propagate like any other failure.
    pub fn is_bug(&self) -> bool {
        matches!(self, Self::Internal(_))
    }
}

/// Errors from the shared connection acceptor.
#[derive(Debug, Error)]
pub enum AcceptorError {
    #[error("problem opening listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("acceptor is not running")]
    NotRunning,

    #[error("port already listening")]
    PortLocked,
}

/// Errors while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Validation(String),
}

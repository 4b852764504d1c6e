//! Error types surfaced by the planner, storage, SOCKS5 front-end and tunnel dispatcher.

use seed_core::PriorityError;
use seed_core::socks5::WireError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors from the file-backed storage.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid piece index: {0}")]
    InvalidPiece(u32),

    #[error("range out of bounds: piece {piece}, offset {offset}, length {length}")]
    OutOfRange { piece: u32, offset: u32, length: u32 },

    #[error("data of disabled file {path} is not kept at this offset")]
    FileDisabled { path: PathBuf },

    #[error("{path}: {source}")]
    FileIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the file selector.
#[derive(Debug, Error)]
pub enum SelectorError {
    #[error("bad priority: {0}")]
    BadPriority(#[from] PriorityError),

    #[error("unable to {action} {path}: {source}")]
    Io {
        action: &'static str,
        path: String,
        #[source]
        source: StorageError,
    },

    #[error("no file with index {0}")]
    NoSuchFile(usize),

    #[error("pieces failed verification after relocation: {0:?}")]
    HashMismatch(Vec<u32>),

    #[error("relocation failed: {0}")]
    Relocation(#[source] StorageError),

    #[error("resume data is malformed: {0}")]
    BadResumeData(String),

    #[error("file selector has shut down")]
    Closed,
}

/// Errors on a single SOCKS5 connection. They close that connection only.
#[derive(Debug, Error)]
pub enum SocksError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    #[error("client offered no acceptable authentication method")]
    NoAcceptableMethod,

    #[error("client sent a command request that cannot be parsed")]
    BadRequest,
}

/// Errors from the tunnel side.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("no usable circuit")]
    CircuitUnavailable,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timeout")]
    Timeout,
}

mod fs_types;
mod path;
mod service;

pub use fs_types::*;
pub use path::*;
pub use service::*;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MemFsError {
    #[error("file already exists: {0}")]
    FileAlreadyExist(String),
    #[error("file does not exist: {0}")]
    FileDoesNotExist(String),
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("suspected file size: {0}")]
    SuspectedFileSize(String),
    #[error("bad column count: {0}")]
    TableColumn(String),
    #[error("not a raw table: {0}")]
    TableDoesNotExist(String),
    #[error("no local worker: {0}")]
    NoLocalWorker(String),
    #[error("out of memory for pinned file {0}")]
    OutOfMemoryForPinFile(FileId),
    #[error("failed to checkpoint: {0}")]
    FailedToCheckpoint(String),

    #[error("I/O error: {0}")]
    IoError(String),
    #[error("remote error: {0}")]
    RemoteError(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl MemFsError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, MemFsError::FileDoesNotExist(_))
    }
}

pub type MemFsResult<T> = std::result::Result<T, MemFsError>;

impl From<std::io::Error> for MemFsError {
    fn from(err: std::io::Error) -> Self {
        MemFsError::IoError(err.to_string())
    }
}

/// Upper bound on the column count accepted by `user_createRawTable`.
pub const MAX_COLUMNS: i32 = 1000;

/// Interval between worker heartbeats to the master.
pub const TO_MASTER_HEARTBEAT_INTERVAL_MS: u64 = 1000;
/// A worker silent for longer than this is dropped from the registry.
pub const WORKER_TIMEOUT_MS: i64 = 10 * 1000;
/// A worker that cannot reach the master for this long gives up and exits.
pub const HEARTBEAT_TIMEOUT_MS: u64 = 60 * 1000;
/// A user silent for longer than this loses its temp folders and
/// uncommitted reservations.
pub const USER_TIMEOUT_MS: i64 = 60 * 1000;

//! Error types for all TideDB operations.

use std::io;
use thiserror::Error;

use crate::types::{PageNo, Xid};

/// Top-level error type for TideDB operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Transaction(#[from] TxnError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Storage(StorageError::Io(err))
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("cache is full")]
    CacheFull,

    #[error("database busy: no page with enough free space after retries")]
    DatabaseBusy,

    #[error("record exceeds maximum size of {max} bytes (got {actual})")]
    DataTooLarge { max: usize, actual: usize },

    #[error("bad log file: {0}")]
    BadLogFile(String),

    #[error("bad xid file: {0}")]
    BadXidFile(String),

    #[error("corrupted page: {0}")]
    CorruptedPage(String),

    #[error("page out of bounds: {pgno} > {page_count}")]
    PageOutOfBounds { pgno: PageNo, page_count: PageNo },

    #[error("database file is locked")]
    FileLocked,

    #[error("file already exists: {0}")]
    FileExists(String),

    #[error("file does not exist: {0}")]
    FileMissing(String),

    #[error("database is closed")]
    Closed,
}

/// Transaction-level failures.
///
/// Cloneable so a transaction can keep the first failure it hit and hand it
/// back on every later operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TxnError {
    #[error("deadlock detected")]
    Deadlock,

    #[error("concurrent update conflict")]
    ConcurrentUpdate,

    #[error("transaction timed out and was aborted")]
    TimedOut,

    #[error("unknown transaction: {0}")]
    UnknownTransaction(Xid),

    #[error("invalid isolation level: {0} (expected 0 or 1)")]
    InvalidIsolationLevel(u8),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("memory budget too small: {pages} pages, need at least {min_pages}")]
    MemoryTooSmall { pages: usize, min_pages: usize },

    #[error("invalid memory size: {0}")]
    InvalidMemory(String),

    #[error("invalid config: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

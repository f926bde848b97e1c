//! Error types for ldbm-import.

use thiserror::Error;

/// Main error type for the import pipeline.
///
/// Per-entry problems (bad LDIF, schema violations, duplicate DNs) are not
/// errors: they are counted and skipped. Everything here is fatal to the job.
#[derive(Error, Debug)]
pub enum ImportError {
    #[error("Database error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Disk full while writing {0}. Free some space and re-run the import.")]
    DiskFull(String),

    #[error("Instance '{0}' is busy with another task")]
    Busy(String),

    #[error("Import aborted")]
    Aborted,

    #[error("Could not spawn {0} thread: {1}")]
    ThreadSpawn(String, std::io::Error),

    #[error("Corrupt parent chain while rebuilding the DN of entry {id}")]
    CorruptParentChain { id: u64 },

    #[error("Ancestorid cache still holds {0} pending id lists after the build")]
    AncestorCacheNotEmpty(usize),

    #[error("Unique id generation failed for '{0}'")]
    UniqueIdGeneration(String),

    #[error("Entry {dn} ({size} bytes) does not fit in the import cache")]
    EntryTooLarge { dn: String, size: u64 },

    #[error("Malformed stored entry {id}: {reason}")]
    CorruptEntry { id: u64, reason: String },
}

impl ImportError {
    /// Map a SQLite failure to [`ImportError::DiskFull`] when the engine reports a full disk.
    pub fn from_write(err: rusqlite::Error, what: &str) -> Self {
        if let rusqlite::Error::SqliteFailure(ref code, _) = err
            && code.code == rusqlite::ErrorCode::DiskFull
        {
            return Self::DiskFull(what.to_string());
        }
        Self::Storage(err)
    }
}

/// Result type alias for ldbm-import operations.
pub type Result<T> = std::result::Result<T, ImportError>;

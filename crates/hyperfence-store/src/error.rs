//! Store client error types (spec §4.1, §8).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("path not found: {0}")]
    NotFound(String),
    #[error("version conflict on {path}: expected {expected:?}, found {actual}")]
    VersionConflict {
        path: String,
        expected: Option<u64>,
        actual: u64,
    },
    #[error("lock {name} already held by {holder}")]
    LockHeld { name: String, holder: String },
    #[error("session lost")]
    SessionLost,
    #[error("store operation on {0} timed out")]
    Timeout(String),
    #[error("unsupported schema version {declared}; this binary supports {supported:?}")]
    SchemaVersionUnsupported { declared: u32, supported: Vec<u32> },
    #[error("unknown logical field: {0}")]
    UnknownField(String),
    #[error("failed to encode/decode value at {path}: {source}")]
    Codec {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

pub type StoreResult<T> = Result<T, StoreError>;

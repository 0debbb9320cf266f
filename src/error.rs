//! Crate-wide error taxonomy.
//!
//! The kinds here are the stable surface: every admin RPC maps them onto a
//! fixed wire code table (see `admin::wire`) and the client re-inflates
//! received codes back into kinds. Keep the set flat and additive.

use thiserror::Error;

use crate::versioning::ClockError;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// Put with a version that is not strictly newer than what is stored.
    /// Recoverable at the caller.
    #[error("obsolete version: {0}")]
    ObsoleteVersion(String),

    /// Metadata holds an impossible number of current versions. Requires
    /// operator intervention.
    #[error("inconsistent metadata: {0}")]
    InconsistentMetadata(String),

    #[error("store `{0}` not found")]
    StoreNotFound(String),

    #[error("unknown metadata key `{0}`")]
    UnknownMetadataKey(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("invalid clock format: {0}")]
    InvalidClockFormat(#[from] ClockError),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("not supported: {0}")]
    NotSupported(String),
}

impl StoreError {
    /// True for failures where retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Io(_) | StoreError::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

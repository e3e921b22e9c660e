use crate::types::ResourceKind;
use sled::transaction::{ConflictableTransactionError, ConflictableTransactionResult, TransactionError};

pub type Result<T> = std::result::Result<T, ArchiveError>;

#[derive(thiserror::Error, Debug)]
pub enum ArchiveError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("{kind} {id} not found")]
    NotFound { kind: ResourceKind, id: String },
    #[error("no archived snapshot for {kind} {id} version {version}")]
    SnapshotNotFound {
        kind: ResourceKind,
        id: String,
        version: u64,
    },
    #[error("{kind} {id} version {version} is already archived")]
    DuplicateVersion {
        kind: ResourceKind,
        id: String,
        version: u64,
    },
    #[error("import job {0} not found")]
    JobNotFound(String),
    #[error("stored record is corrupted: {0}")]
    Corrupted(String),
    #[error("version counter overflow for {kind} {id}")]
    VersionOverflow { kind: ResourceKind, id: String },
    #[error("storage failure: {0}")]
    Storage(#[from] sled::Error),
    #[error("failed to encode record: {0}")]
    Encode(String),
    #[error("failed to decode record: {0}")]
    Decode(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ArchiveError {
    pub fn validation(msg: impl Into<String>) -> Self {
        ArchiveError::Validation(msg.into())
    }

    pub fn not_found(kind: ResourceKind, id: &str) -> Self {
        ArchiveError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ArchiveError::NotFound { .. }
                | ArchiveError::SnapshotNotFound { .. }
                | ArchiveError::JobNotFound(_)
        )
    }

    /// True for errors caused by a lost race that a caller may simply retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ArchiveError::DuplicateVersion { .. })
    }
}

impl From<TransactionError<ArchiveError>> for ArchiveError {
    fn from(value: TransactionError<ArchiveError>) -> Self {
        match value {
            TransactionError::Abort(err) => err,
            TransactionError::Storage(err) => ArchiveError::Storage(err),
        }
    }
}

impl From<serde_json::Error> for ArchiveError {
    fn from(value: serde_json::Error) -> Self {
        ArchiveError::Validation(value.to_string())
    }
}

/// Lifts a crate result into a sled transaction result, aborting on error.
pub trait OrAbort<T> {
    fn or_abort(self) -> ConflictableTransactionResult<T, ArchiveError>;
}

impl<T> OrAbort<T> for Result<T> {
    fn or_abort(self) -> ConflictableTransactionResult<T, ArchiveError> {
        self.map_err(ConflictableTransactionError::Abort)
    }
}

pub(crate) fn abort<T>(err: ArchiveError) -> ConflictableTransactionResult<T, ArchiveError> {
    Err(ConflictableTransactionError::Abort(err))
}

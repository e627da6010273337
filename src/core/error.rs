use std::time::Duration;
use thiserror::Error;

/// Why the store refused to commit a staged write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictReason {
    /// The row-version token moved since the record was read.
    VersionMismatch,
    /// An insert targeted a key that already exists.
    DuplicateKey,
    /// A record read through a repeatable-read transaction changed before commit.
    ReadSetChanged,
}

impl std::fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::VersionMismatch => "version_mismatch",
            Self::DuplicateKey => "duplicate_key",
            Self::ReadSetChanged => "read_set_changed",
        };
        write!(f, "{label}")
    }
}

/// Failures reported by a [`RecordStore`](crate::storage::RecordStore).
///
/// The retry loop dispatches on [`StoreError::is_conflict`] instead of
/// matching on message text.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Conflict({reason}) on {kind}:{key}")]
    Conflict {
        kind: String,
        key: String,
        reason: ConflictReason,
    },

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Transaction {0} not found")]
    TransactionNotFound(u64),

    #[error("Transaction {0} is no longer active")]
    TransactionClosed(u64),

    #[error("Store error: {0}")]
    Other(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }

    /// Failures worth one more try on a later drain.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum CoordError {
    #[error("Concurrency conflict on {kind}:{key} after {attempts} attempt(s): {reason}")]
    ConcurrencyConflict {
        kind: String,
        key: String,
        attempts: u32,
        reason: String,
    },

    #[error("Entity {kind}:{key} vanished before it could be updated")]
    EntityVanished { kind: String, key: String },

    #[error("Could not acquire the {kind} gate within {waited:?}")]
    LockTimeout { kind: String, waited: Duration },

    #[error("Transient failure on {kind}:{key}: {source}")]
    TransientFailure {
        kind: String,
        key: String,
        #[source]
        source: StoreError,
    },

    #[error("Operation on {kind} cancelled")]
    Cancelled { kind: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Entity kind '{kind}' is already registered for another type")]
    KindMismatch { kind: String },

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoordError {
    /// Conflict-family failures surfaced after retries stopped.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            CoordError::ConcurrencyConflict { .. } | CoordError::EntityVanished { .. }
        )
    }

    /// A commit refused by the store's conflict check.
    pub(crate) fn is_store_conflict(&self) -> bool {
        matches!(self, CoordError::Store(err) if err.is_conflict())
    }

    /// Failures the drain loop may requeue once.
    pub fn is_transient(&self) -> bool {
        match self {
            CoordError::TransientFailure { .. } => true,
            CoordError::Store(err) => err.is_transient(),
            _ => false,
        }
    }

    /// Rewraps a raw store failure with the entity it concerned.
    pub(crate) fn from_store(kind: &str, key: &str, err: StoreError) -> Self {
        if err.is_transient() {
            CoordError::TransientFailure {
                kind: kind.to_string(),
                key: key.to_string(),
                source: err,
            }
        } else {
            CoordError::Store(err)
        }
    }
}

impl From<serde_json::Error> for CoordError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CoordError>;

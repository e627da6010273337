// ============================================================================
// Record Store Contract
// ============================================================================
//
// The coordination layer never touches a physical schema. It stages opaque
// JSON payloads keyed by (kind, key) into store-side transactions and relies
// on the store to detect stale writes with a row-version token.
//
// ============================================================================

pub mod memory;

pub use memory::MemoryStore;

use crate::core::StoreResult;
use crate::transaction::{IsolationLevel, TransactionId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A committed record as the store currently holds it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub kind: String,
    pub key: String,
    /// Row-version token. Starts at 1 and grows on every committed update.
    pub version: u64,
    pub payload: serde_json::Value,
    pub committed_at: DateTime<Utc>,
}

/// A staged write: the caller's intended end-state for one record.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordWrite {
    pub kind: String,
    pub key: String,
    pub payload: serde_json::Value,
}

impl RecordWrite {
    pub fn new(kind: impl Into<String>, key: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            key: key.into(),
            payload,
        }
    }
}

/// Version assigned to one record by a successful commit.
/// `version` is `None` when the commit removed the record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordVersion {
    pub kind: String,
    pub key: String,
    pub version: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitReceipt {
    pub txn: TransactionId,
    pub versions: Vec<RecordVersion>,
}

impl CommitReceipt {
    pub fn version_of(&self, kind: &str, key: &str) -> Option<u64> {
        self.versions
            .iter()
            .find(|v| v.kind == kind && v.key == key)
            .and_then(|v| v.version)
    }
}

/// Transactional record store the coordination layer runs on.
///
/// Mutations are staged against a transaction and only become visible on
/// [`commit`](RecordStore::commit). A commit that finds a staged record
/// changed since it was read must fail with
/// [`StoreError::Conflict`](crate::core::StoreError::Conflict) and leave the
/// transaction closed.
#[async_trait]
pub trait RecordStore: Send + Sync + 'static {
    /// Looks a record up by key.
    ///
    /// With `txn = None` this always returns committed truth and bypasses any
    /// tracking. Reads through a transaction see that transaction's staged
    /// writes and, under repeatable read, join its read set.
    async fn find(
        &self,
        txn: Option<TransactionId>,
        kind: &str,
        key: &str,
    ) -> StoreResult<Option<StoredRecord>>;

    /// All committed records of a kind, for predicate queries.
    async fn scan(&self, kind: &str) -> StoreResult<Vec<StoredRecord>>;

    async fn begin(&self, isolation: IsolationLevel) -> StoreResult<TransactionId>;

    async fn add(&self, txn: TransactionId, record: RecordWrite) -> StoreResult<()>;

    async fn mark_for_update(
        &self,
        txn: TransactionId,
        record: RecordWrite,
        expected_version: u64,
    ) -> StoreResult<()>;

    async fn mark_for_removal(
        &self,
        txn: TransactionId,
        kind: &str,
        key: &str,
        expected_version: u64,
    ) -> StoreResult<()>;

    async fn commit(&self, txn: TransactionId) -> StoreResult<CommitReceipt>;

    async fn rollback(&self, txn: TransactionId) -> StoreResult<()>;
}

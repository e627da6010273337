use super::{CommitReceipt, RecordStore, RecordVersion, RecordWrite, StoredRecord};
use crate::core::{ConflictReason, StoreError, StoreResult};
use crate::transaction::{IsolationLevel, TransactionId};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, RwLock};

type RecordId = (String, String);

#[derive(Debug, Clone)]
enum StagedWrite {
    Insert {
        payload: serde_json::Value,
    },
    Update {
        payload: serde_json::Value,
        expected_version: u64,
    },
    Remove {
        expected_version: u64,
    },
}

#[derive(Debug)]
struct PendingTransaction {
    isolation: IsolationLevel,
    /// Versions observed through this transaction; `None` means observed absent.
    read_set: HashMap<RecordId, Option<u64>>,
    writes: HashMap<RecordId, StagedWrite>,
    /// Staging order, used for the commit receipt.
    order: Vec<RecordId>,
}

impl PendingTransaction {
    fn new(isolation: IsolationLevel) -> Self {
        Self {
            isolation,
            read_set: HashMap::new(),
            writes: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// Folds a new staged write onto whatever this transaction already staged
    /// for the same record. The first expected version observed wins.
    fn stage(&mut self, id: RecordId, write: StagedWrite) {
        let merged = match (self.writes.remove(&id), write) {
            (None, write) => Some(write),
            (Some(StagedWrite::Insert { .. }), StagedWrite::Insert { payload })
            | (Some(StagedWrite::Insert { .. }), StagedWrite::Update { payload, .. }) => {
                Some(StagedWrite::Insert { payload })
            }
            (Some(StagedWrite::Insert { .. }), StagedWrite::Remove { .. }) => None,
            (
                Some(StagedWrite::Update {
                    expected_version, ..
                }),
                StagedWrite::Insert { payload },
            )
            | (
                Some(StagedWrite::Update {
                    expected_version, ..
                }),
                StagedWrite::Update { payload, .. },
            ) => Some(StagedWrite::Update {
                payload,
                expected_version,
            }),
            (
                Some(StagedWrite::Update {
                    expected_version, ..
                }),
                StagedWrite::Remove { .. },
            ) => Some(StagedWrite::Remove { expected_version }),
            (Some(StagedWrite::Remove { expected_version }), StagedWrite::Insert { payload })
            | (
                Some(StagedWrite::Remove { expected_version }),
                StagedWrite::Update { payload, .. },
            ) => Some(StagedWrite::Update {
                payload,
                expected_version,
            }),
            (Some(StagedWrite::Remove { expected_version }), StagedWrite::Remove { .. }) => {
                Some(StagedWrite::Remove { expected_version })
            }
        };

        match merged {
            Some(write) => {
                if !self.order.contains(&id) {
                    self.order.push(id.clone());
                }
                self.writes.insert(id, write);
            }
            None => self.order.retain(|staged| staged != &id),
        }
    }
}

/// Versioned in-memory record store with optimistic commit validation.
///
/// Writes are buffered per transaction and validated against the committed
/// row versions when the transaction commits, so two transactions that staged
/// changes to the same record cannot both succeed.
pub struct MemoryStore {
    records: RwLock<HashMap<RecordId, StoredRecord>>,
    transactions: Mutex<HashMap<TransactionId, PendingTransaction>>,
    next_txn_id: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            transactions: Mutex::new(HashMap::new()),
            next_txn_id: AtomicU64::new(1),
        }
    }

    /// Number of committed records across all kinds.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Number of transactions begun but not yet committed or rolled back.
    pub async fn active_transactions(&self) -> usize {
        self.transactions.lock().await.len()
    }

    /// Committed version of one record, if present.
    pub async fn version_of(&self, kind: &str, key: &str) -> Option<u64> {
        let records = self.records.read().await;
        records
            .get(&(kind.to_string(), key.to_string()))
            .map(|record| record.version)
    }

    fn conflict(id: &RecordId, reason: ConflictReason) -> StoreError {
        StoreError::Conflict {
            kind: id.0.clone(),
            key: id.1.clone(),
            reason,
        }
    }

    fn validate(
        records: &HashMap<RecordId, StoredRecord>,
        txn: &PendingTransaction,
    ) -> StoreResult<()> {
        for id in &txn.order {
            let Some(write) = txn.writes.get(id) else {
                continue;
            };
            let current = records.get(id).map(|record| record.version);
            match write {
                StagedWrite::Insert { .. } => {
                    if current.is_some() {
                        return Err(Self::conflict(id, ConflictReason::DuplicateKey));
                    }
                }
                StagedWrite::Update {
                    expected_version, ..
                }
                | StagedWrite::Remove { expected_version } => {
                    if current != Some(*expected_version) {
                        return Err(Self::conflict(id, ConflictReason::VersionMismatch));
                    }
                }
            }
        }

        if txn.isolation.validates_reads() {
            for (id, observed) in &txn.read_set {
                if txn.writes.contains_key(id) {
                    continue;
                }
                let current = records.get(id).map(|record| record.version);
                if current != *observed {
                    return Err(Self::conflict(id, ConflictReason::ReadSetChanged));
                }
            }
        }

        Ok(())
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn find(
        &self,
        txn: Option<TransactionId>,
        kind: &str,
        key: &str,
    ) -> StoreResult<Option<StoredRecord>> {
        let id = (kind.to_string(), key.to_string());

        let Some(txn_id) = txn else {
            let records = self.records.read().await;
            return Ok(records.get(&id).cloned());
        };

        let mut transactions = self.transactions.lock().await;
        let pending = transactions
            .get_mut(&txn_id)
            .ok_or(StoreError::TransactionNotFound(txn_id.0))?;

        let records = self.records.read().await;
        let committed = records.get(&id).cloned();

        if let Some(write) = pending.writes.get(&id) {
            // Read-your-writes. Staged updates keep the base version so a
            // follow-up update in the same transaction expects the same token.
            return Ok(match write {
                StagedWrite::Remove { .. } => None,
                StagedWrite::Insert { payload } => Some(StoredRecord {
                    kind: id.0.clone(),
                    key: id.1.clone(),
                    version: 0,
                    payload: payload.clone(),
                    committed_at: Utc::now(),
                }),
                StagedWrite::Update {
                    payload,
                    expected_version,
                } => Some(StoredRecord {
                    kind: id.0.clone(),
                    key: id.1.clone(),
                    version: *expected_version,
                    payload: payload.clone(),
                    committed_at: committed
                        .as_ref()
                        .map(|record| record.committed_at)
                        .unwrap_or_else(Utc::now),
                }),
            });
        }

        if pending.isolation.validates_reads() {
            pending
                .read_set
                .entry(id)
                .or_insert_with(|| committed.as_ref().map(|record| record.version));
        }

        Ok(committed)
    }

    async fn scan(&self, kind: &str) -> StoreResult<Vec<StoredRecord>> {
        let records = self.records.read().await;
        let mut matching: Vec<StoredRecord> = records
            .values()
            .filter(|record| record.kind == kind)
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(matching)
    }

    async fn begin(&self, isolation: IsolationLevel) -> StoreResult<TransactionId> {
        let txn_id = TransactionId(self.next_txn_id.fetch_add(1, Ordering::SeqCst));
        let mut transactions = self.transactions.lock().await;
        transactions.insert(txn_id, PendingTransaction::new(isolation));
        Ok(txn_id)
    }

    async fn add(&self, txn: TransactionId, record: RecordWrite) -> StoreResult<()> {
        let mut transactions = self.transactions.lock().await;
        let pending = transactions
            .get_mut(&txn)
            .ok_or(StoreError::TransactionNotFound(txn.0))?;
        pending.stage(
            (record.kind, record.key),
            StagedWrite::Insert {
                payload: record.payload,
            },
        );
        Ok(())
    }

    async fn mark_for_update(
        &self,
        txn: TransactionId,
        record: RecordWrite,
        expected_version: u64,
    ) -> StoreResult<()> {
        let mut transactions = self.transactions.lock().await;
        let pending = transactions
            .get_mut(&txn)
            .ok_or(StoreError::TransactionNotFound(txn.0))?;
        pending.stage(
            (record.kind, record.key),
            StagedWrite::Update {
                payload: record.payload,
                expected_version,
            },
        );
        Ok(())
    }

    async fn mark_for_removal(
        &self,
        txn: TransactionId,
        kind: &str,
        key: &str,
        expected_version: u64,
    ) -> StoreResult<()> {
        let mut transactions = self.transactions.lock().await;
        let pending = transactions
            .get_mut(&txn)
            .ok_or(StoreError::TransactionNotFound(txn.0))?;
        pending.stage(
            (kind.to_string(), key.to_string()),
            StagedWrite::Remove { expected_version },
        );
        Ok(())
    }

    async fn commit(&self, txn: TransactionId) -> StoreResult<CommitReceipt> {
        let mut transactions = self.transactions.lock().await;
        // Removed up front: a conflicting commit also closes the transaction.
        let mut pending = transactions
            .remove(&txn)
            .ok_or(StoreError::TransactionNotFound(txn.0))?;

        let mut records = self.records.write().await;
        Self::validate(&records, &pending)?;

        let now = Utc::now();
        let mut versions = Vec::with_capacity(pending.order.len());
        for id in pending.order.drain(..) {
            let Some(write) = pending.writes.remove(&id) else {
                continue;
            };
            let version = match write {
                StagedWrite::Insert { payload } => {
                    records.insert(
                        id.clone(),
                        StoredRecord {
                            kind: id.0.clone(),
                            key: id.1.clone(),
                            version: 1,
                            payload,
                            committed_at: now,
                        },
                    );
                    Some(1)
                }
                StagedWrite::Update { payload, .. } => {
                    let record = records
                        .get_mut(&id)
                        .ok_or_else(|| Self::conflict(&id, ConflictReason::VersionMismatch))?;
                    record.version += 1;
                    record.payload = payload;
                    record.committed_at = now;
                    Some(record.version)
                }
                StagedWrite::Remove { .. } => {
                    records.remove(&id);
                    None
                }
            };
            versions.push(RecordVersion {
                kind: id.0,
                key: id.1,
                version,
            });
        }

        Ok(CommitReceipt { txn, versions })
    }

    async fn rollback(&self, txn: TransactionId) -> StoreResult<()> {
        let mut transactions = self.transactions.lock().await;
        transactions
            .remove(&txn)
            .map(|_| ())
            .ok_or(StoreError::TransactionNotFound(txn.0))
    }
}

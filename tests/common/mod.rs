#![allow(dead_code)]

use async_trait::async_trait;
use coordb::core::{ConflictReason, StoreResult};
use coordb::{
    CommitReceipt, CoordinationConfig, CoordinationRegistry, Entity, IsolationLevel, MemoryStore,
    RecordStore, RecordWrite, StoreError, StoredRecord, TransactionId,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Entity)]
#[entity(kind = "Agency")]
pub struct Agency {
    #[entity(key)]
    pub id: Uuid,
    pub name: String,
    pub capacity: u32,
}

impl Agency {
    pub fn new(name: &str, capacity: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            capacity,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Entity)]
#[entity(kind = "Appointment")]
pub struct Appointment {
    #[entity(key)]
    pub id: Uuid,
    pub agency_id: Uuid,
    pub slot: String,
}

impl Appointment {
    pub fn new(agency_id: Uuid, slot: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            agency_id,
            slot: slot.to_string(),
        }
    }
}

coordb::unit_of_work! {
    pub struct Booking {
        agencies: Agency,
        appointments: Appointment,
    }
}

/// `MemoryStore` wrapper that can refuse commits and records what it saw.
#[derive(Default)]
pub struct FaultyStore {
    inner: MemoryStore,
    always_conflict: AtomicBool,
    transient_commits: AtomicUsize,
    commits: AtomicUsize,
    open: AtomicUsize,
    max_open: AtomicUsize,
    commit_times: Mutex<Vec<Instant>>,
    committed_keys: Mutex<Vec<String>>,
}

impl FaultyStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every commit from now on fails with a version conflict.
    pub fn conflict_always(&self) {
        self.always_conflict.store(true, Ordering::SeqCst);
    }

    /// The next `count` commits fail as unavailable.
    pub fn fail_next_commits(&self, count: usize) {
        self.transient_commits.store(count, Ordering::SeqCst);
    }

    /// Commit calls, refused ones included.
    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn max_concurrent_transactions(&self) -> usize {
        self.max_open.load(Ordering::SeqCst)
    }

    pub fn commit_times(&self) -> Vec<Instant> {
        self.commit_times.lock().unwrap().clone()
    }

    pub fn committed_keys(&self) -> Vec<String> {
        self.committed_keys.lock().unwrap().clone()
    }

    pub async fn stored<E: Entity>(&self, key: &E::Key) -> Option<E> {
        self.inner
            .find(None, E::KIND, &key.to_string())
            .await
            .unwrap()
            .map(|record| serde_json::from_value(record.payload).unwrap())
    }

    pub async fn open_transactions(&self) -> usize {
        self.inner.active_transactions().await
    }

    fn closed(&self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
    }

    async fn refuse(&self, txn: TransactionId, err: StoreError) -> StoreResult<CommitReceipt> {
        self.inner.rollback(txn).await?;
        Err(err)
    }
}

#[async_trait]
impl RecordStore for FaultyStore {
    async fn find(
        &self,
        txn: Option<TransactionId>,
        kind: &str,
        key: &str,
    ) -> StoreResult<Option<StoredRecord>> {
        self.inner.find(txn, kind, key).await
    }

    async fn scan(&self, kind: &str) -> StoreResult<Vec<StoredRecord>> {
        self.inner.scan(kind).await
    }

    async fn begin(&self, isolation: IsolationLevel) -> StoreResult<TransactionId> {
        let open = self.open.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_open.fetch_max(open, Ordering::SeqCst);
        self.inner.begin(isolation).await
    }

    async fn add(&self, txn: TransactionId, record: RecordWrite) -> StoreResult<()> {
        self.inner.add(txn, record).await
    }

    async fn mark_for_update(
        &self,
        txn: TransactionId,
        record: RecordWrite,
        expected_version: u64,
    ) -> StoreResult<()> {
        self.inner.mark_for_update(txn, record, expected_version).await
    }

    async fn mark_for_removal(
        &self,
        txn: TransactionId,
        kind: &str,
        key: &str,
        expected_version: u64,
    ) -> StoreResult<()> {
        self.inner
            .mark_for_removal(txn, kind, key, expected_version)
            .await
    }

    async fn commit(&self, txn: TransactionId) -> StoreResult<CommitReceipt> {
        self.commits.fetch_add(1, Ordering::SeqCst);
        self.commit_times.lock().unwrap().push(Instant::now());
        self.closed();

        if self.always_conflict.load(Ordering::SeqCst) {
            return self
                .refuse(
                    txn,
                    StoreError::Conflict {
                        kind: "injected".into(),
                        key: "injected".into(),
                        reason: ConflictReason::VersionMismatch,
                    },
                )
                .await;
        }
        let injected = self
            .transient_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if injected {
            return self
                .refuse(txn, StoreError::Unavailable("injected outage".into()))
                .await;
        }

        let receipt = self.inner.commit(txn).await?;
        self.committed_keys
            .lock()
            .unwrap()
            .extend(receipt.versions.iter().map(|v| v.key.clone()));
        Ok(receipt)
    }

    async fn rollback(&self, txn: TransactionId) -> StoreResult<()> {
        self.closed();
        self.inner.rollback(txn).await
    }
}

pub fn registry(store: Arc<FaultyStore>, config: CoordinationConfig) -> Arc<CoordinationRegistry> {
    Arc::new(CoordinationRegistry::new(store, config).unwrap())
}

/// Config for tests that drive drains by hand.
pub fn manual_config() -> CoordinationConfig {
    CoordinationConfig::default().auto_drain(false)
}

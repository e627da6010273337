// ============================================================================
// Scoped Transactions
// ============================================================================

use super::{IsolationLevel, TransactionId, TransactionState};
use crate::core::{CoordError, Result, StoreResult};
use crate::storage::{CommitReceipt, RecordStore, RecordWrite, StoredRecord};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

/// Cloneable access to an open store transaction.
///
/// Handed to transaction bodies; it does not own the transaction and cannot
/// end it.
#[derive(Clone)]
pub struct TransactionHandle {
    store: Arc<dyn RecordStore>,
    id: TransactionId,
    isolation: IsolationLevel,
}

impl TransactionHandle {
    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    pub async fn find(&self, kind: &str, key: &str) -> StoreResult<Option<StoredRecord>> {
        self.store.find(Some(self.id), kind, key).await
    }

    pub async fn add(&self, record: RecordWrite) -> StoreResult<()> {
        self.store.add(self.id, record).await
    }

    pub async fn mark_for_update(&self, record: RecordWrite, expected_version: u64) -> StoreResult<()> {
        self.store.mark_for_update(self.id, record, expected_version).await
    }

    pub async fn mark_for_removal(&self, kind: &str, key: &str, expected_version: u64) -> StoreResult<()> {
        self.store
            .mark_for_removal(self.id, kind, key, expected_version)
            .await
    }
}

/// Owner of one open store transaction.
///
/// Consumed by [`commit`](Transaction::commit) or
/// [`rollback`](Transaction::rollback). A transaction dropped while still
/// active is rolled back on the current tokio runtime.
pub struct Transaction {
    handle: TransactionHandle,
    state: TransactionState,
}

impl Transaction {
    pub async fn begin(store: Arc<dyn RecordStore>, isolation: IsolationLevel) -> StoreResult<Self> {
        let id = store.begin(isolation).await?;
        debug!(txn = %id, isolation = %isolation, "transaction started");
        Ok(Self {
            handle: TransactionHandle {
                store,
                id,
                isolation,
            },
            state: TransactionState::Active,
        })
    }

    pub fn handle(&self) -> TransactionHandle {
        self.handle.clone()
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub async fn commit(mut self) -> StoreResult<CommitReceipt> {
        let id = self.handle.id;
        match self.handle.store.commit(id).await {
            Ok(receipt) => {
                self.state = TransactionState::Committed;
                debug!(txn = %id, writes = receipt.versions.len(), "transaction committed");
                Ok(receipt)
            }
            Err(err) => {
                // A refused commit closes the transaction on the store side.
                self.state = TransactionState::Aborted;
                Err(err)
            }
        }
    }

    pub async fn rollback(mut self) -> StoreResult<()> {
        self.state = TransactionState::Aborted;
        self.handle.store.rollback(self.handle.id).await?;
        debug!(txn = %self.handle.id, "transaction rolled back");
        Ok(())
    }
}

impl std::ops::Deref for Transaction {
    type Target = TransactionHandle;

    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.state.is_active() {
            return;
        }
        let store = Arc::clone(&self.handle.store);
        let id = self.handle.id;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = store.rollback(id).await {
                        debug!(txn = %id, error = %err, "rollback of dropped transaction failed");
                    }
                });
            }
            Err(_) => warn!(txn = %id, "transaction dropped outside a runtime; left open"),
        }
    }
}

/// Runs `body` inside a fresh transaction.
///
/// Commits when `body` returns `Ok`; rolls back and returns the body's error
/// otherwise. A commit-time conflict surfaces as
/// [`CoordError::Store`] carrying [`StoreError::Conflict`](crate::core::StoreError::Conflict).
pub async fn run_in_transaction<T, F, Fut>(
    store: &Arc<dyn RecordStore>,
    isolation: IsolationLevel,
    body: F,
) -> Result<(T, CommitReceipt)>
where
    F: FnOnce(TransactionHandle) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let txn = Transaction::begin(Arc::clone(store), isolation).await?;
    let outcome = body(txn.handle()).await;
    match outcome {
        Ok(value) => {
            let receipt = txn.commit().await.map_err(CoordError::from)?;
            Ok((value, receipt))
        }
        Err(err) => {
            let id = txn.id();
            if let Err(rollback_err) = txn.rollback().await {
                warn!(txn = %id, error = %rollback_err, "rollback after failed body also failed");
            }
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use serde_json::json;

    fn store() -> Arc<dyn RecordStore> {
        Arc::new(MemoryStore::new())
    }

    #[tokio::test]
    async fn test_run_in_transaction_commits() {
        let store = store();
        let (value, receipt) = run_in_transaction(&store, IsolationLevel::RepeatableRead, |txn| async move {
            txn.add(RecordWrite::new("Agency", "a", json!({ "n": 1 })))
                .await?;
            Ok(42)
        })
        .await
        .unwrap();

        assert_eq!(value, 42);
        assert_eq!(receipt.version_of("Agency", "a"), Some(1));
        assert!(store.find(None, "Agency", "a").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_run_in_transaction_rolls_back_on_error() {
        let store = store();
        let result: Result<((), CommitReceipt)> =
            run_in_transaction(&store, IsolationLevel::RepeatableRead, |txn| async move {
                txn.add(RecordWrite::new("Agency", "a", json!({})))
                    .await?;
                Err(CoordError::Internal("body failed".into()))
            })
            .await;

        assert!(matches!(result, Err(CoordError::Internal(_))));
        assert!(store.find(None, "Agency", "a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dropped_transaction_rolls_back() {
        let memory = Arc::new(MemoryStore::new());
        let store: Arc<dyn RecordStore> = memory.clone();
        {
            let txn = Transaction::begin(Arc::clone(&store), IsolationLevel::RepeatableRead)
                .await
                .unwrap();
            txn.add(RecordWrite::new("Agency", "a", json!({})))
                .await
                .unwrap();
        }

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(memory.active_transactions().await, 0);
        assert!(memory.is_empty().await);
    }
}

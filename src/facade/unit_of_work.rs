use super::{PendingWork, Repository};
use crate::coordination::retry::commit_conflict;
use crate::coordination::{CoordinationRegistry, OperationOutcome};
use crate::core::{CoordError, Entity, Result};
use crate::storage::CommitReceipt;
use crate::transaction::{AmbientTransaction, Transaction};
use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What one `save_changes` call did.
#[derive(Debug, Clone, Default)]
pub struct SaveReport {
    pub outcomes: Vec<OperationOutcome>,
    /// Present when the call committed its own transaction.
    pub receipt: Option<CommitReceipt>,
}

impl SaveReport {
    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }
}

/// Shared state behind one unit of work: the registry, the explicit
/// transaction slot every repository stages into, and the cancellation token
/// handed to every queued operation.
pub struct UnitOfWorkContext {
    registry: Arc<CoordinationRegistry>,
    ambient: Arc<AmbientTransaction>,
    cancel: CancellationToken,
}

impl UnitOfWorkContext {
    pub fn new(registry: Arc<CoordinationRegistry>) -> Self {
        Self::with_cancellation(registry, CancellationToken::new())
    }

    pub fn with_cancellation(registry: Arc<CoordinationRegistry>, cancel: CancellationToken) -> Self {
        Self {
            registry,
            ambient: Arc::new(AmbientTransaction::new()),
            cancel,
        }
    }

    pub fn registry(&self) -> &Arc<CoordinationRegistry> {
        &self.registry
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Aborts every backoff, gate wait and store call this unit of work has
    /// in flight.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn repository<E: Entity>(&self) -> Result<Repository<E>> {
        Repository::new(&self.registry, Arc::clone(&self.ambient), self.cancel.clone())
    }

    pub fn in_transaction(&self) -> bool {
        self.ambient.is_open()
    }

    pub async fn begin_transaction(&self) -> Result<()> {
        if self.in_transaction() {
            return Err(CoordError::Transaction(
                "a transaction is already open for this unit of work".into(),
            ));
        }
        let txn = Transaction::begin(
            Arc::clone(self.registry.store()),
            self.registry.config().isolation,
        )
        .await?;
        let id = txn.id();
        self.ambient.install(txn).await?;
        debug!(txn = %id, "unit of work transaction started");
        Ok(())
    }

    /// Flushes every repository into the open transaction and commits it.
    ///
    /// Any failure rolls the whole transaction back; nothing recorded in this
    /// unit of work is applied.
    pub async fn commit_transaction(&self, repos: &[&dyn PendingWork]) -> Result<CommitReceipt> {
        if !self.in_transaction() {
            return Err(CoordError::Transaction("no transaction is open".into()));
        }
        let flushed = flush_all(repos).await;
        let txn = self
            .ambient
            .take()
            .await
            .ok_or_else(|| CoordError::Transaction("transaction closed during commit".into()))?;

        if let Err(err) = flushed {
            let id = txn.id();
            if let Err(rollback_err) = txn.rollback().await {
                warn!(txn = %id, error = %rollback_err, "rollback after failed flush also failed");
            }
            reset_all(repos);
            return Err(err);
        }
        self.commit(txn, repos).await
    }

    /// Discards the open transaction and everything staged into it. A no-op
    /// when no transaction is open.
    pub async fn rollback_transaction(&self, repos: &[&dyn PendingWork]) -> Result<()> {
        let Some(txn) = self.ambient.take().await else {
            return Ok(());
        };
        let id = txn.id();
        reset_all(repos);
        txn.rollback().await?;
        info!(txn = %id, "unit of work rolled back");
        Ok(())
    }

    /// Applies every recorded change across `repos` in one transaction.
    ///
    /// Inside an explicit transaction the changes are only staged into it.
    /// Otherwise a transaction is opened for the call and committed once; if
    /// any change fails, nothing is applied and the first error is returned.
    pub async fn save_changes(&self, repos: &[&dyn PendingWork]) -> Result<SaveReport> {
        if self.in_transaction() {
            let outcomes = flush_all(repos).await?;
            return Ok(SaveReport {
                outcomes,
                receipt: None,
            });
        }
        if !repos.iter().any(|repo| repo.has_pending()) {
            return Ok(SaveReport::default());
        }

        self.begin_transaction().await?;
        let flushed = flush_all(repos).await;
        let Some(txn) = self.ambient.take().await else {
            return Err(CoordError::Transaction("transaction closed during save".into()));
        };
        let outcomes = match flushed {
            Ok(outcomes) => outcomes,
            Err(err) => {
                if let Err(rollback_err) = txn.rollback().await {
                    warn!(error = %rollback_err, "rollback after failed save also failed");
                }
                reset_all(repos);
                return Err(err);
            }
        };
        let receipt = self.commit(txn, repos).await?;
        Ok(SaveReport {
            outcomes,
            receipt: Some(receipt),
        })
    }

    async fn commit(&self, txn: Transaction, repos: &[&dyn PendingWork]) -> Result<CommitReceipt> {
        match txn.commit().await {
            Ok(receipt) => {
                for repo in repos {
                    repo.absorb(&receipt);
                }
                info!(txn = %receipt.txn, writes = receipt.versions.len(), "unit of work committed");
                Ok(receipt)
            }
            Err(err) => {
                warn!(error = %err, "unit of work commit refused");
                reset_all(repos);
                Err(commit_conflict(err))
            }
        }
    }
}

async fn flush_all(repos: &[&dyn PendingWork]) -> Result<Vec<OperationOutcome>> {
    let results = join_all(repos.iter().map(|repo| repo.flush())).await;
    let mut outcomes = Vec::new();
    let mut first_err = None;
    for result in results {
        match result {
            Ok(flushed) => outcomes.extend(flushed),
            Err(err) => {
                first_err.get_or_insert(err);
            }
        }
    }
    match first_err {
        Some(err) => Err(err),
        None => Ok(outcomes),
    }
}

fn reset_all(repos: &[&dyn PendingWork]) {
    for repo in repos {
        repo.reset();
    }
}

/// A named set of repositories sharing one [`UnitOfWorkContext`].
///
/// Usually implemented through [`unit_of_work!`](crate::unit_of_work).
#[async_trait]
pub trait UnitOfWork: Send + Sync {
    fn context(&self) -> &UnitOfWorkContext;

    fn repositories(&self) -> Vec<&dyn PendingWork>;

    async fn begin_transaction(&self) -> Result<()> {
        self.context().begin_transaction().await
    }

    async fn commit_transaction(&self) -> Result<CommitReceipt> {
        let repos = self.repositories();
        self.context().commit_transaction(&repos).await
    }

    async fn rollback_transaction(&self) -> Result<()> {
        let repos = self.repositories();
        self.context().rollback_transaction(&repos).await
    }

    async fn save_changes(&self) -> Result<SaveReport> {
        let repos = self.repositories();
        self.context().save_changes(&repos).await
    }
}

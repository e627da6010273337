use super::{ConflictResolver, OperationOutcome, OutcomeStatus, QueuedOperation};
use crate::config::RetryPolicy;
use crate::core::{CoordError, Entity, OperationKind, Result, StoreError};
use crate::storage::{RecordStore, RecordWrite};
use crate::transaction::{IsolationLevel, TransactionHandle, run_in_transaction};
use std::future::Future;
use std::sync::Arc;
use tokio::time::sleep;
use tracing::{debug, error, warn};

/// What staging did inside the transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Staged {
    Write,
    Nothing,
}

/// Runs one queued operation to completion.
///
/// Attempt 0 writes the caller's snapshot against the version the caller
/// observed. A conflict at commit reloads the record, merges the intended
/// changes through the kind's [`ConflictResolver`] and tries again after an
/// exponential backoff, up to [`RetryPolicy::max_attempts`] attempts in total.
pub struct RetryController<E: Entity> {
    store: Arc<dyn RecordStore>,
    policy: RetryPolicy,
    isolation: IsolationLevel,
    resolver: Arc<dyn ConflictResolver<E>>,
}

impl<E: Entity> RetryController<E> {
    pub fn new(
        store: Arc<dyn RecordStore>,
        policy: RetryPolicy,
        isolation: IsolationLevel,
        resolver: Arc<dyn ConflictResolver<E>>,
    ) -> Self {
        Self {
            store,
            policy,
            isolation,
            resolver,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn execute(&self, op: &QueuedOperation<E>) -> Result<OperationOutcome> {
        {
            let ambient = op.ambient().lock().await;
            if let Some(txn) = ambient.handle() {
                return self.stage_into_open(&txn, op).await;
            }
        }
        self.execute_with_retry(op).await
    }

    /// Single attempt inside the owner's explicit transaction. Conflicts
    /// surface when that transaction commits.
    async fn stage_into_open(
        &self,
        txn: &TransactionHandle,
        op: &QueuedOperation<E>,
    ) -> Result<OperationOutcome> {
        let staged = cancellable(op, self.stage_initial(txn, op)).await?;
        Ok(self.outcome(
            op,
            match staged {
                Staged::Write => OutcomeStatus::Staged,
                Staged::Nothing => OutcomeStatus::AlreadySatisfied,
            },
            1,
            None,
        ))
    }

    async fn execute_with_retry(&self, op: &QueuedOperation<E>) -> Result<OperationOutcome> {
        let key = op.store_key();
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt: u32 = 0;

        loop {
            let result = cancellable(op, self.attempt_once(op, attempt)).await;
            match result {
                Ok((staged, version)) => {
                    let status = match staged {
                        Staged::Write => OutcomeStatus::Applied,
                        Staged::Nothing => OutcomeStatus::AlreadySatisfied,
                    };
                    return Ok(self.outcome(op, status, attempt + 1, version));
                }
                Err(err) if err.is_store_conflict() => {
                    attempt += 1;
                    warn!(
                        kind = E::KIND,
                        key = %key,
                        attempt,
                        error = %err,
                        "concurrency conflict detected"
                    );
                    if attempt >= max_attempts {
                        error!(
                            kind = E::KIND,
                            key = %key,
                            attempts = attempt,
                            "concurrency conflict retries exhausted"
                        );
                        return Err(CoordError::ConcurrencyConflict {
                            kind: E::KIND.to_string(),
                            key,
                            attempts: attempt,
                            reason: "exhausted retries".to_string(),
                        });
                    }
                    let delay = self.policy.delay_for(attempt);
                    debug!(
                        kind = E::KIND,
                        key = %key,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "backing off"
                    );
                    cancellable(op, async {
                        sleep(delay).await;
                        Ok(())
                    })
                    .await?;
                }
                Err(CoordError::Store(err)) => return Err(CoordError::from_store(E::KIND, &key, err)),
                Err(err) => return Err(err),
            }
        }
    }

    async fn attempt_once(
        &self,
        op: &QueuedOperation<E>,
        attempt: u32,
    ) -> Result<(Staged, Option<u64>)> {
        let (staged, receipt) = run_in_transaction(&self.store, self.isolation, |txn| async move {
            if attempt == 0 {
                self.stage_initial(&txn, op).await
            } else {
                self.stage_reloaded(&txn, op).await
            }
        })
        .await?;
        let version = receipt.version_of(E::KIND, &op.store_key());
        Ok((staged, version))
    }

    /// Stages the caller's snapshot as-is.
    async fn stage_initial(&self, txn: &TransactionHandle, op: &QueuedOperation<E>) -> Result<Staged> {
        let key = op.store_key();
        match op.kind() {
            OperationKind::Save => {
                let write = self.write_of(op.entity())?;
                match op.expected_version() {
                    Some(expected) => txn.mark_for_update(write, expected).await,
                    None => txn.add(write).await,
                }
                .map_err(|err| CoordError::from_store(E::KIND, &key, err))?;
                Ok(Staged::Write)
            }
            OperationKind::Update => {
                let expected = match op.expected_version() {
                    Some(expected) => expected,
                    None => match self.current_version(txn, &key).await? {
                        Some(version) => version,
                        None => return Err(self.vanished(&key)),
                    },
                };
                let write = self.write_of(op.entity())?;
                txn.mark_for_update(write, expected)
                    .await
                    .map_err(|err| CoordError::from_store(E::KIND, &key, err))?;
                Ok(Staged::Write)
            }
            OperationKind::Delete => {
                let expected = match op.expected_version() {
                    Some(expected) => expected,
                    None => match self.current_version(txn, &key).await? {
                        Some(version) => version,
                        None => {
                            self.log_already_satisfied(&key);
                            return Ok(Staged::Nothing);
                        }
                    },
                };
                txn.mark_for_removal(E::KIND, &key, expected)
                    .await
                    .map_err(|err| CoordError::from_store(E::KIND, &key, err))?;
                Ok(Staged::Write)
            }
        }
    }

    /// Reloads the stored record, discarding the version the caller observed,
    /// and stages a merged change against it.
    async fn stage_reloaded(&self, txn: &TransactionHandle, op: &QueuedOperation<E>) -> Result<Staged> {
        let key = op.store_key();
        debug!(kind = E::KIND, key = %key, "detached stale tracking, reloading");
        let reloaded = txn
            .find(E::KIND, &key)
            .await
            .map_err(|err| CoordError::from_store(E::KIND, &key, err))?;

        let Some(record) = reloaded else {
            return match op.kind() {
                OperationKind::Save => {
                    let write = self.write_of(op.entity())?;
                    txn.add(write)
                        .await
                        .map_err(|err| CoordError::from_store(E::KIND, &key, err))?;
                    Ok(Staged::Write)
                }
                OperationKind::Delete => {
                    self.log_already_satisfied(&key);
                    Ok(Staged::Nothing)
                }
                OperationKind::Update => Err(self.vanished(&key)),
            };
        };

        match op.kind() {
            OperationKind::Save | OperationKind::Update => {
                let stored: E = serde_json::from_value(record.payload)?;
                let merged = self.resolver.resolve(stored, op.entity());
                if merged.store_key() != key {
                    return Err(CoordError::Internal(format!(
                        "conflict resolver for {} changed identity key {} to {}",
                        E::KIND,
                        key,
                        merged.store_key()
                    )));
                }
                let write = self.write_of(&merged)?;
                txn.mark_for_update(write, record.version)
                    .await
                    .map_err(|err| CoordError::from_store(E::KIND, &key, err))?;
                Ok(Staged::Write)
            }
            OperationKind::Delete => {
                txn.mark_for_removal(E::KIND, &key, record.version)
                    .await
                    .map_err(|err| CoordError::from_store(E::KIND, &key, err))?;
                Ok(Staged::Write)
            }
        }
    }

    async fn current_version(&self, txn: &TransactionHandle, key: &str) -> Result<Option<u64>> {
        let record = txn
            .find(E::KIND, key)
            .await
            .map_err(|err| CoordError::from_store(E::KIND, key, err))?;
        Ok(record.map(|record| record.version))
    }

    fn write_of(&self, entity: &E) -> Result<RecordWrite> {
        Ok(RecordWrite::new(
            E::KIND,
            entity.store_key(),
            serde_json::to_value(entity)?,
        ))
    }

    fn vanished(&self, key: &str) -> CoordError {
        warn!(kind = E::KIND, key = %key, "update target vanished");
        CoordError::EntityVanished {
            kind: E::KIND.to_string(),
            key: key.to_string(),
        }
    }

    fn log_already_satisfied(&self, key: &str) {
        debug!(kind = E::KIND, key = %key, "delete of absent entity, already satisfied");
    }

    fn outcome(
        &self,
        op: &QueuedOperation<E>,
        status: OutcomeStatus,
        attempts: u32,
        version: Option<u64>,
    ) -> OperationOutcome {
        OperationOutcome {
            entity_kind: E::KIND,
            key: op.store_key(),
            operation: op.kind(),
            status,
            attempts,
            version,
        }
    }
}

/// Races `fut` against the operation's cancellation token.
async fn cancellable<E, T, F>(op: &QueuedOperation<E>, fut: F) -> Result<T>
where
    E: Entity,
    F: Future<Output = Result<T>>,
{
    let cancel = op.cancel_token();
    if cancel.is_cancelled() {
        return Err(cancelled::<E>());
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            debug!(kind = E::KIND, key = %op.store_key(), "operation cancelled");
            Err(cancelled::<E>())
        }
        result = fut => result,
    }
}

fn cancelled<E: Entity>() -> CoordError {
    CoordError::Cancelled {
        kind: E::KIND.to_string(),
    }
}

/// Maps a refused explicit-transaction commit onto the caller-facing error.
pub(crate) fn commit_conflict(err: StoreError) -> CoordError {
    match err {
        StoreError::Conflict { kind, key, reason } => CoordError::ConcurrencyConflict {
            kind,
            key,
            attempts: 1,
            reason: reason.to_string(),
        },
        other => CoordError::Store(other),
    }
}

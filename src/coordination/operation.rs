use crate::core::{CoordError, Entity, OperationKind, Result};
use crate::transaction::AmbientTransaction;
use std::sync::Arc;
use tokio::sync::oneshot::{self, error::TryRecvError};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// How an operation ended up applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeStatus {
    /// Committed in the operation's own transaction.
    Applied,
    /// Staged into the owner's open transaction; durable once that commits.
    Staged,
    /// Nothing to do, e.g. deleting a key that is already gone.
    AlreadySatisfied,
}

/// Result delivered to the caller awaiting one queued operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationOutcome {
    pub entity_kind: &'static str,
    pub key: String,
    pub operation: OperationKind,
    pub status: OutcomeStatus,
    /// Attempts made, the successful one included.
    pub attempts: u32,
    /// Row version after commit; `None` for removals and staged writes.
    pub version: Option<u64>,
}

type Completion = oneshot::Sender<Result<OperationOutcome>>;

/// One requested mutation waiting in a per-kind queue.
///
/// The snapshot is the caller's intended end-state, not necessarily what the
/// store holds. Consumed exactly once by a drain: applied, requeued once, or
/// reported failed.
pub struct QueuedOperation<E: Entity> {
    entity: E,
    kind: OperationKind,
    expected_version: Option<u64>,
    ambient: Arc<AmbientTransaction>,
    cancel: CancellationToken,
    completion: Completion,
    requeued: bool,
}

impl<E: Entity> QueuedOperation<E> {
    /// Builds an operation and the ticket its caller awaits.
    pub fn new(
        entity: E,
        kind: OperationKind,
        expected_version: Option<u64>,
        ambient: Arc<AmbientTransaction>,
        cancel: CancellationToken,
    ) -> (Self, PendingOperation) {
        let (completion, receiver) = oneshot::channel();
        let ticket = PendingOperation {
            entity_kind: E::KIND,
            key: entity.store_key(),
            operation: kind,
            receiver,
        };
        let op = Self {
            entity,
            kind,
            expected_version,
            ambient,
            cancel,
            completion,
            requeued: false,
        };
        (op, ticket)
    }

    pub fn entity(&self) -> &E {
        &self.entity
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn store_key(&self) -> String {
        self.entity.store_key()
    }

    /// Row version the enqueuing repository last observed for this key.
    pub fn expected_version(&self) -> Option<u64> {
        self.expected_version
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn ambient(&self) -> &AmbientTransaction {
        &self.ambient
    }

    pub fn is_requeued(&self) -> bool {
        self.requeued
    }

    /// The awaiting caller has gone away.
    pub fn is_abandoned(&self) -> bool {
        self.completion.is_closed()
    }

    pub(crate) fn into_requeued(mut self) -> Self {
        self.requeued = true;
        self
    }

    pub(crate) fn complete(self, result: Result<OperationOutcome>) {
        let key = self.entity.store_key();
        if self.completion.send(result).is_err() {
            debug!(kind = E::KIND, key = %key, "outcome dropped, caller no longer waiting");
        }
    }
}

/// Ticket for one queued operation.
pub struct PendingOperation {
    entity_kind: &'static str,
    key: String,
    operation: OperationKind,
    receiver: oneshot::Receiver<Result<OperationOutcome>>,
}

impl PendingOperation {
    pub fn entity_kind(&self) -> &'static str {
        self.entity_kind
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn operation(&self) -> OperationKind {
        self.operation
    }

    /// Non-blocking check; `None` while the operation is still queued.
    pub fn try_take(&mut self) -> Option<Result<OperationOutcome>> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Closed) => Some(Err(self.dropped())),
        }
    }

    /// Waits for the drain that handles this operation.
    ///
    /// Only resolves once the operation committed, exhausted its retries or
    /// failed; never on an intermediate retry.
    pub async fn wait(self) -> Result<OperationOutcome> {
        let err = self.dropped();
        self.receiver.await.unwrap_or(Err(err))
    }

    fn dropped(&self) -> CoordError {
        CoordError::Internal(format!(
            "{} on {}:{} was dropped without an outcome",
            self.operation, self.entity_kind, self.key
        ))
    }
}

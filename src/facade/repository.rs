use crate::coordination::{
    CoordinationRegistry, EntityLane, OperationOutcome, OutcomeStatus, PendingOperation,
    QueuedOperation,
};
use crate::core::{CoordError, Entity, OperationKind, Result};
use crate::storage::{CommitReceipt, RecordStore, StoredRecord};
use crate::transaction::AmbientTransaction;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Collection-level view of a repository, as the unit of work sees it.
#[async_trait]
pub trait PendingWork: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Changes recorded but not yet handed to the drain loop.
    fn pending(&self) -> usize;

    fn has_pending(&self) -> bool {
        self.pending() > 0
    }

    /// Hands every recorded change to the kind's lane and waits for all of
    /// them. Fails with the first error once every change has an outcome.
    async fn flush(&self) -> Result<Vec<OperationOutcome>>;

    /// Picks up the row versions a unit-of-work commit produced.
    fn absorb(&self, receipt: &CommitReceipt);

    /// Forgets recorded changes and observed versions.
    fn reset(&self);
}

/// Typed access to one entity kind within a unit of work.
///
/// Remembers the row version of every entity it loaded or wrote so later
/// writes carry the version the caller actually observed.
pub struct Repository<E: Entity> {
    lane: Arc<EntityLane<E>>,
    store: Arc<dyn RecordStore>,
    ambient: Arc<AmbientTransaction>,
    cancel: CancellationToken,
    tracked: Mutex<HashMap<String, u64>>,
    changes: Mutex<Vec<(E, OperationKind)>>,
}

impl<E: Entity> Repository<E> {
    pub(crate) fn new(
        registry: &CoordinationRegistry,
        ambient: Arc<AmbientTransaction>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        Ok(Self {
            lane: registry.lane::<E>()?,
            store: Arc::clone(registry.store()),
            ambient,
            cancel,
            tracked: Mutex::new(HashMap::new()),
            changes: Mutex::new(Vec::new()),
        })
    }

    /// Records a save to apply on the next `save_changes` or commit.
    pub fn enqueue_save(&self, entity: E) {
        self.record(entity, OperationKind::Save);
    }

    pub fn enqueue_update(&self, entity: E) {
        self.record(entity, OperationKind::Update);
    }

    pub fn enqueue_delete(&self, entity: E) {
        self.record(entity, OperationKind::Delete);
    }

    /// Queues the operation right away and returns its ticket.
    ///
    /// Outside an explicit transaction this also kicks a background drain for
    /// the kind, so the ticket resolves without further calls.
    pub fn submit(&self, entity: E, kind: OperationKind) -> PendingOperation {
        let (op, ticket) = self.operation(entity, kind);
        self.lane.push(op, !self.ambient.is_open());
        ticket
    }

    /// Saves and waits for the outcome; inserts when the key is untracked.
    pub async fn save(&self, entity: E) -> Result<OperationOutcome> {
        self.apply(entity, OperationKind::Save).await
    }

    pub async fn update(&self, entity: E) -> Result<OperationOutcome> {
        self.apply(entity, OperationKind::Update).await
    }

    pub async fn delete(&self, entity: E) -> Result<OperationOutcome> {
        self.apply(entity, OperationKind::Delete).await
    }

    /// Loads one entity, reading through the open transaction if any.
    pub async fn get(&self, key: &E::Key) -> Result<Option<E>> {
        let key = key.to_string();
        let found = {
            let ambient = self.ambient.lock().await;
            match ambient.handle() {
                Some(txn) => txn.find(E::KIND, &key).await,
                None => self.store.find(None, E::KIND, &key).await,
            }
        }
        .map_err(|err| CoordError::from_store(E::KIND, &key, err))?;

        match found {
            Some(record) => self.load(record).map(Some),
            None => {
                self.tracked().remove(&key);
                Ok(None)
            }
        }
    }

    /// Committed entities of this kind matching `predicate`.
    pub async fn find_where<P>(&self, predicate: P) -> Result<Vec<E>>
    where
        P: Fn(&E) -> bool + Send,
    {
        let records = self.store.scan(E::KIND).await?;
        let mut matched = Vec::new();
        for record in records {
            let entity = self.load(record)?;
            if predicate(&entity) {
                matched.push(entity);
            }
        }
        Ok(matched)
    }

    /// Row version last observed for `key`.
    pub fn tracked_version(&self, key: &E::Key) -> Option<u64> {
        self.tracked().get(&key.to_string()).copied()
    }

    /// Stops tracking `key`; the next save inserts or reloads.
    pub fn detach(&self, key: &E::Key) {
        self.tracked().remove(&key.to_string());
    }

    /// Hands this repository's recorded changes to the lane and awaits them.
    pub async fn save_changes(&self) -> Result<Vec<OperationOutcome>> {
        let changes = std::mem::take(&mut *self.changes());
        if changes.is_empty() {
            return Ok(Vec::new());
        }
        let tickets = changes
            .into_iter()
            .map(|(entity, kind)| {
                let (op, ticket) = self.operation(entity, kind);
                self.lane.push(op, false);
                ticket
            })
            .collect();
        let results = self.settle(tickets).await?;

        let mut outcomes = Vec::with_capacity(results.len());
        let mut first_err = None;
        for result in results {
            match result {
                Ok(outcome) => outcomes.push(outcome),
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

    async fn apply(&self, entity: E, kind: OperationKind) -> Result<OperationOutcome> {
        let (op, ticket) = self.operation(entity, kind);
        self.lane.push(op, false);
        let mut results = self.settle(vec![ticket]).await?;
        results
            .pop()
            .unwrap_or_else(|| Err(CoordError::Internal("operation produced no outcome".into())))
    }

    /// Drains the lane until every ticket has an outcome.
    ///
    /// A drain that cannot take the gate ends the wait; unfinished operations
    /// stay queued and are skipped once their tickets are dropped.
    async fn settle(
        &self,
        mut tickets: Vec<PendingOperation>,
    ) -> Result<Vec<Result<OperationOutcome>>> {
        let mut results: Vec<Option<Result<OperationOutcome>>> =
            tickets.iter().map(|_| None).collect();
        loop {
            for (slot, ticket) in results.iter_mut().zip(tickets.iter_mut()) {
                if slot.is_none() {
                    *slot = ticket.try_take();
                }
            }
            if results.iter().all(Option::is_some) {
                break;
            }
            self.lane.drain(&self.cancel).await?;
        }

        let results: Vec<Result<OperationOutcome>> = results.into_iter().flatten().collect();
        for outcome in results.iter().flatten() {
            self.observe(outcome);
        }
        Ok(results)
    }

    fn observe(&self, outcome: &OperationOutcome) {
        let mut tracked = self.tracked();
        match (outcome.status, outcome.operation, outcome.version) {
            (OutcomeStatus::Applied, OperationKind::Save | OperationKind::Update, Some(version)) => {
                tracked.insert(outcome.key.clone(), version);
            }
            _ => {
                tracked.remove(&outcome.key);
            }
        }
    }

    fn load(&self, record: StoredRecord) -> Result<E> {
        let entity: E = serde_json::from_value(record.payload)?;
        self.tracked().insert(record.key, record.version);
        Ok(entity)
    }

    fn record(&self, entity: E, kind: OperationKind) {
        debug!(kind = E::KIND, key = %entity.store_key(), operation = %kind, "change recorded");
        self.changes().push((entity, kind));
    }

    fn operation(&self, entity: E, kind: OperationKind) -> (QueuedOperation<E>, PendingOperation) {
        let expected = self.tracked().get(&entity.store_key()).copied();
        QueuedOperation::new(
            entity,
            kind,
            expected,
            Arc::clone(&self.ambient),
            self.cancel.clone(),
        )
    }

    fn tracked(&self) -> MutexGuard<'_, HashMap<String, u64>> {
        self.tracked.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn changes(&self) -> MutexGuard<'_, Vec<(E, OperationKind)>> {
        self.changes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl<E: Entity> PendingWork for Repository<E> {
    fn kind(&self) -> &'static str {
        E::KIND
    }

    fn pending(&self) -> usize {
        self.changes().len()
    }

    async fn flush(&self) -> Result<Vec<OperationOutcome>> {
        self.save_changes().await
    }

    fn absorb(&self, receipt: &CommitReceipt) {
        let mut tracked = self.tracked();
        for written in receipt.versions.iter().filter(|v| v.kind == E::KIND) {
            match written.version {
                Some(version) => tracked.insert(written.key.clone(), version),
                None => tracked.remove(&written.key),
            };
        }
    }

    fn reset(&self) {
        self.changes().clear();
        self.tracked().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoordinationConfig;
    use crate::storage::MemoryStore;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize, crate::Entity)]
    struct Desk {
        #[entity(key)]
        id: u32,
        owner: String,
    }

    fn desk(id: u32, owner: &str) -> Desk {
        Desk {
            id,
            owner: owner.to_string(),
        }
    }

    fn repository() -> Repository<Desk> {
        let registry =
            CoordinationRegistry::new(Arc::new(MemoryStore::new()), CoordinationConfig::default())
                .unwrap();
        Repository::new(
            &registry,
            Arc::new(AmbientTransaction::new()),
            CancellationToken::new(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_save_tracks_version() {
        let repo = repository();
        let outcome = repo.save(desk(1, "ana")).await.unwrap();
        assert_eq!(outcome.version, Some(1));
        assert_eq!(repo.tracked_version(&1), Some(1));

        repo.save(desk(1, "bo")).await.unwrap();
        assert_eq!(repo.tracked_version(&1), Some(2));
        assert_eq!(repo.get(&1).await.unwrap(), Some(desk(1, "bo")));
    }

    #[tokio::test]
    async fn test_recorded_changes_wait_for_save_changes() {
        let repo = repository();
        repo.enqueue_save(desk(1, "ana"));
        repo.enqueue_save(desk(2, "bo"));
        assert_eq!(repo.pending(), 2);
        assert_eq!(repo.get(&1).await.unwrap(), None);

        let outcomes = repo.save_changes().await.unwrap();
        assert_eq!(outcomes.len(), 2);
        assert_eq!(repo.pending(), 0);
        let owners = repo.find_where(|d| d.owner == "bo").await.unwrap();
        assert_eq!(owners, vec![desk(2, "bo")]);
    }

    #[tokio::test]
    async fn test_delete_untracks() {
        let repo = repository();
        repo.save(desk(1, "ana")).await.unwrap();
        repo.delete(desk(1, "ana")).await.unwrap();
        assert_eq!(repo.tracked_version(&1), None);
        assert_eq!(repo.get(&1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_submitted_ticket_resolves_in_background() {
        let repo = repository();
        let ticket = repo.submit(desk(7, "cy"), OperationKind::Save);
        let outcome = ticket.wait().await.unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Applied);
    }
}

use super::{ConflictResolver, EntityGate, EntityLane, OverwriteNonKey, RetryController};
use crate::config::CoordinationConfig;
use crate::core::{CoordError, Entity, Result};
use crate::storage::RecordStore;
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

type Shared = Arc<dyn Any + Send + Sync>;

/// Process-wide coordination state, built once and shared by every unit of
/// work that talks to the same store.
///
/// Gates and lanes are created on first use and live as long as the registry.
pub struct CoordinationRegistry {
    store: Arc<dyn RecordStore>,
    config: CoordinationConfig,
    gates: Mutex<HashMap<&'static str, Arc<EntityGate>>>,
    lanes: Mutex<HashMap<&'static str, Shared>>,
    resolvers: HashMap<&'static str, Shared>,
}

impl CoordinationRegistry {
    pub fn new(store: Arc<dyn RecordStore>, config: CoordinationConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            config,
            gates: Mutex::new(HashMap::new()),
            lanes: Mutex::new(HashMap::new()),
            resolvers: HashMap::new(),
        })
    }

    /// Replaces the default [`OverwriteNonKey`] strategy for `E`.
    pub fn with_resolver<E, R>(mut self, resolver: R) -> Self
    where
        E: Entity,
        R: ConflictResolver<E> + 'static,
    {
        let resolver: Arc<dyn ConflictResolver<E>> = Arc::new(resolver);
        self.resolvers.insert(E::KIND, Arc::new(resolver));
        self
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn config(&self) -> &CoordinationConfig {
        &self.config
    }

    /// Gate for `kind`, created on first request.
    pub fn gate(&self, kind: &'static str) -> Arc<EntityGate> {
        let mut gates = lock(&self.gates);
        Arc::clone(
            gates
                .entry(kind)
                .or_insert_with(|| Arc::new(EntityGate::new(kind))),
        )
    }

    /// Lane for `E`, shared by every repository of that kind.
    pub fn lane<E: Entity>(&self) -> Result<Arc<EntityLane<E>>> {
        let mut lanes = lock(&self.lanes);
        if let Some(existing) = lanes.get(E::KIND) {
            return Arc::clone(existing)
                .downcast::<EntityLane<E>>()
                .map_err(|_| mismatch::<E>());
        }

        let retry = RetryController::new(
            Arc::clone(&self.store),
            self.config.retry.clone(),
            self.config.isolation,
            self.resolver::<E>()?,
        );
        let lane = Arc::new(EntityLane::new(
            self.gate(E::KIND),
            retry,
            self.config.lock_timeout_duration(),
            self.config.auto_drain,
        ));
        lanes.insert(E::KIND, lane.clone());
        debug!(kind = E::KIND, "entity lane created");
        Ok(lane)
    }

    fn resolver<E: Entity>(&self) -> Result<Arc<dyn ConflictResolver<E>>> {
        match self.resolvers.get(E::KIND) {
            Some(shared) => Arc::clone(shared)
                .downcast::<Arc<dyn ConflictResolver<E>>>()
                .map(|resolver| Arc::clone(&*resolver))
                .map_err(|_| mismatch::<E>()),
            None => Ok(Arc::new(OverwriteNonKey)),
        }
    }
}

fn mismatch<E: Entity>() -> CoordError {
    CoordError::KindMismatch {
        kind: E::KIND.to_string(),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::resolver_fn;
    use crate::storage::MemoryStore;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize, crate::Entity)]
    #[entity(kind = "Room")]
    struct Room {
        #[entity(key)]
        id: u32,
        seats: u32,
    }

    #[derive(Debug, Clone, Serialize, Deserialize, crate::Entity)]
    #[entity(kind = "Room")]
    struct Impostor {
        #[entity(key)]
        id: u32,
    }

    fn registry() -> CoordinationRegistry {
        CoordinationRegistry::new(Arc::new(MemoryStore::new()), CoordinationConfig::default()).unwrap()
    }

    #[test]
    fn test_lane_is_shared_per_kind() {
        let registry = registry();
        let first = registry.lane::<Room>().unwrap();
        let second = registry.lane::<Room>().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(first.gate(), &registry.gate("Room")));
    }

    #[test]
    fn test_conflicting_types_for_one_kind() {
        let registry = registry();
        registry.lane::<Room>().unwrap();
        let err = registry.lane::<Impostor>().err().unwrap();
        assert!(matches!(err, CoordError::KindMismatch { .. }));
    }

    #[test]
    fn test_resolver_override_installs() {
        let registry = registry().with_resolver::<Room, _>(resolver_fn(|stored: Room, _: &Room| stored));
        assert!(registry.lane::<Room>().is_ok());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = CoordinationConfig::default().max_attempts(0);
        assert!(CoordinationRegistry::new(Arc::new(MemoryStore::new()), config).is_err());
    }
}

use crate::core::{CoordError, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{Instant, timeout};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Mutual exclusion token for one entity kind.
///
/// At most one drain cycle per kind holds the gate. Waiting suspends the task,
/// never the worker thread.
pub struct EntityGate {
    kind: &'static str,
    permits: Arc<Semaphore>,
}

/// Scoped hold on an [`EntityGate`]; released on drop.
pub struct GatePermit {
    kind: &'static str,
    acquired_at: Instant,
    _permit: OwnedSemaphorePermit,
}

impl GatePermit {
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }
}

impl EntityGate {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            permits: Arc::new(Semaphore::new(1)),
        }
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn is_held(&self) -> bool {
        self.permits.available_permits() == 0
    }

    /// Waits for the gate up to `wait`.
    ///
    /// Fails with [`CoordError::LockTimeout`] when the bound elapses and with
    /// [`CoordError::Cancelled`] when `cancel` fires first.
    pub async fn acquire(&self, wait: Duration, cancel: &CancellationToken) -> Result<GatePermit> {
        let acquire = timeout(wait, Arc::clone(&self.permits).acquire_owned());
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(CoordError::Cancelled {
                kind: self.kind.to_string(),
            }),
            acquired = acquire => match acquired {
                Ok(Ok(permit)) => Ok(GatePermit {
                    kind: self.kind,
                    acquired_at: Instant::now(),
                    _permit: permit,
                }),
                Ok(Err(_)) => Err(CoordError::Internal(format!(
                    "gate for {} was closed",
                    self.kind
                ))),
                Err(_) => {
                    warn!(
                        kind = self.kind,
                        waited_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
                        "entity gate acquisition timed out"
                    );
                    Err(CoordError::LockTimeout {
                        kind: self.kind.to_string(),
                        waited: wait,
                    })
                }
            },
        }
    }
}

use super::QueuedOperation;
use crate::core::Entity;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// FIFO buffer of queued operations for one entity kind.
///
/// Enqueue never blocks on a drain and never fails; the lock is only held for
/// the push or pop itself.
pub struct OperationQueue<E: Entity> {
    items: Mutex<VecDeque<QueuedOperation<E>>>,
}

impl<E: Entity> Default for OperationQueue<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Entity> OperationQueue<E> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
        }
    }

    pub fn enqueue(&self, op: QueuedOperation<E>) {
        self.items().push_back(op);
    }

    pub fn try_dequeue(&self) -> Option<QueuedOperation<E>> {
        self.items().pop_front()
    }

    pub fn len(&self) -> usize {
        self.items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items().is_empty()
    }

    // A panic while holding the lock cannot leave the deque half-updated.
    fn items(&self) -> MutexGuard<'_, VecDeque<QueuedOperation<E>>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

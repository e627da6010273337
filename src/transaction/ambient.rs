use super::{Transaction, TransactionHandle};
use crate::core::{CoordError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, MutexGuard};

/// Slot for an explicitly opened unit-of-work transaction.
///
/// While a transaction sits here, operations owned by the unit of work are
/// staged into it instead of running in their own retrying transactions.
#[derive(Default)]
pub struct AmbientTransaction {
    open: AtomicBool,
    slot: Mutex<Option<Transaction>>,
}

impl AmbientTransaction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cheap check that does not wait on the slot lock.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub(crate) async fn install(&self, txn: Transaction) -> Result<()> {
        let mut slot = self.slot.lock().await;
        if slot.is_some() {
            return Err(CoordError::Transaction(
                "a transaction is already open for this unit of work".into(),
            ));
        }
        *slot = Some(txn);
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub(crate) async fn take(&self) -> Option<Transaction> {
        let mut slot = self.slot.lock().await;
        self.open.store(false, Ordering::SeqCst);
        slot.take()
    }

    /// Holds the slot while a change is staged so the transaction cannot be
    /// committed underneath it.
    pub(crate) async fn lock(&self) -> AmbientGuard<'_> {
        AmbientGuard {
            guard: self.slot.lock().await,
        }
    }
}

pub(crate) struct AmbientGuard<'a> {
    guard: MutexGuard<'a, Option<Transaction>>,
}

impl AmbientGuard<'_> {
    pub(crate) fn handle(&self) -> Option<TransactionHandle> {
        self.guard.as_ref().map(Transaction::handle)
    }
}

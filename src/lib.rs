// ============================================================================
// coordb: concurrent mutation coordination over a transactional record store
// ============================================================================

extern crate self as coordb;

pub mod config;
pub mod coordination;
pub mod core;
pub mod facade;
pub mod storage;
pub mod transaction;

pub use crate::config::{CoordinationConfig, RetryPolicy};
pub use crate::coordination::{
    ConflictResolver, CoordinationRegistry, DrainReport, OperationOutcome, OutcomeStatus,
    OverwriteNonKey, PendingOperation, resolver_fn,
};
pub use crate::core::{ConflictReason, CoordError, Entity, OperationKind, Result, StoreError};
pub use crate::facade::{PendingWork, Repository, SaveReport, UnitOfWork, UnitOfWorkContext};
pub use crate::storage::{CommitReceipt, MemoryStore, RecordStore, RecordWrite, StoredRecord};
pub use crate::transaction::{IsolationLevel, TransactionId};

/// Derives [`Entity`] for a struct with one `#[entity(key)]` field.
pub use coordb_derive::Entity;

pub use tokio_util::sync::CancellationToken;

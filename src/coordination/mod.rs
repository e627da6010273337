//! Per-kind queues, gates, drains and the retry controller behind them.

pub mod gate;
pub mod lane;
pub mod operation;
pub mod queue;
pub mod registry;
pub mod resolver;
pub mod retry;

pub use gate::{EntityGate, GatePermit};
pub use lane::{DrainReport, EntityLane};
pub use operation::{OperationOutcome, OutcomeStatus, PendingOperation, QueuedOperation};
pub use queue::OperationQueue;
pub use registry::CoordinationRegistry;
pub use resolver::{ConflictResolver, FnResolver, OverwriteNonKey, resolver_fn};
pub use retry::RetryController;

// ============================================================================
// Transaction Module
// ============================================================================
//
// Scoped acquisition of store transactions: every handle is either committed,
// rolled back, or rolled back on drop.
//
// ============================================================================

pub mod ambient;
pub mod scope;
pub mod state;

pub use ambient::AmbientTransaction;
pub use scope::{Transaction, TransactionHandle, run_in_transaction};
pub use state::{IsolationLevel, TransactionId, TransactionState};

pub mod entity;
pub mod error;

pub use entity::{Entity, OperationKind};
pub use error::{ConflictReason, CoordError, Result, StoreError, StoreResult};

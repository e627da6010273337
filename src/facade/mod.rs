pub mod macros;
pub mod repository;
pub mod unit_of_work;

pub use repository::{PendingWork, Repository};
pub use unit_of_work::{SaveReport, UnitOfWork, UnitOfWorkContext};

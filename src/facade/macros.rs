//! Declarative construction of unit-of-work types.

/// Declares a unit-of-work struct with one [`Repository`](crate::Repository)
/// per field, all sharing one [`UnitOfWorkContext`](crate::UnitOfWorkContext).
///
/// ```
/// use coordb::{CoordinationConfig, CoordinationRegistry, Entity, MemoryStore, UnitOfWork};
/// use serde::{Deserialize, Serialize};
/// use std::sync::Arc;
///
/// #[derive(Debug, Clone, Serialize, Deserialize, Entity)]
/// struct Agency {
///     #[entity(key)]
///     id: u32,
///     name: String,
/// }
///
/// coordb::unit_of_work! {
///     pub struct Booking {
///         agencies: Agency,
///     }
/// }
///
/// # tokio_test::block_on(async {
/// let registry = Arc::new(
///     CoordinationRegistry::new(Arc::new(MemoryStore::new()), CoordinationConfig::default()).unwrap(),
/// );
/// let uow = Booking::new(registry).unwrap();
/// uow.agencies().enqueue_save(Agency { id: 1, name: "North".into() });
/// let report = uow.save_changes().await.unwrap();
/// assert_eq!(report.outcomes.len(), 1);
/// # });
/// ```
#[macro_export]
macro_rules! unit_of_work {
    ($(#[$meta:meta])* $vis:vis struct $name:ident { $($field:ident : $entity:ty),* $(,)? }) => {
        $(#[$meta])*
        $vis struct $name {
            context: $crate::UnitOfWorkContext,
            $($field: $crate::Repository<$entity>,)*
        }

        impl $name {
            /// Builds the unit of work with a fresh context on `registry`.
            pub fn new(
                registry: ::std::sync::Arc<$crate::CoordinationRegistry>,
            ) -> $crate::Result<Self> {
                Self::with_context($crate::UnitOfWorkContext::new(registry))
            }

            pub fn with_context(context: $crate::UnitOfWorkContext) -> $crate::Result<Self> {
                Ok(Self {
                    $($field: context.repository::<$entity>()?,)*
                    context,
                })
            }

            $(
                pub fn $field(&self) -> &$crate::Repository<$entity> {
                    &self.$field
                }
            )*
        }

        impl $crate::UnitOfWork for $name {
            fn context(&self) -> &$crate::UnitOfWorkContext {
                &self.context
            }

            fn repositories(&self) -> ::std::vec::Vec<&dyn $crate::PendingWork> {
                ::std::vec![$(&self.$field as &dyn $crate::PendingWork),*]
            }
        }
    };
}

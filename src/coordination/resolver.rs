use crate::core::Entity;

/// Produces the state to persist after a conflict forced a reload.
///
/// `stored` is the record as freshly reloaded from the store; `intended` is
/// the caller's snapshot. The result must keep the identity key.
pub trait ConflictResolver<E: Entity>: Send + Sync {
    fn resolve(&self, stored: E, intended: &E) -> E;
}

/// Caller's intent wins field by field.
///
/// Every non-key field of the reloaded record is overwritten with the
/// intended value, so a concurrent writer's change to any field is lost.
/// Kinds where two writers may legitimately touch the same field (counters,
/// capacities) should install their own resolver.
#[derive(Debug, Clone, Copy, Default)]
pub struct OverwriteNonKey;

impl<E: Entity> ConflictResolver<E> for OverwriteNonKey {
    fn resolve(&self, stored: E, intended: &E) -> E {
        let mut merged = stored;
        merged.overwrite_non_key_fields(intended);
        merged
    }
}

/// Adapts a closure into a [`ConflictResolver`].
pub struct FnResolver<F>(F);

pub fn resolver_fn<E, F>(f: F) -> FnResolver<F>
where
    E: Entity,
    F: Fn(E, &E) -> E + Send + Sync,
{
    FnResolver(f)
}

impl<E, F> ConflictResolver<E> for FnResolver<F>
where
    E: Entity,
    F: Fn(E, &E) -> E + Send + Sync,
{
    fn resolve(&self, stored: E, intended: &E) -> E {
        (self.0)(stored, intended)
    }
}

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt::{Debug, Display};
use std::hash::Hash;

/// A record the coordination layer can queue, reload and merge.
///
/// Usually derived:
///
/// ```
/// use coordb::Entity;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Clone, Serialize, Deserialize, Entity)]
/// #[entity(kind = "Agency")]
/// struct Agency {
///     #[entity(key)]
///     id: u64,
///     name: String,
///     capacity: u32,
/// }
///
/// let mut stored = Agency { id: 7, name: "old".into(), capacity: 1 };
/// let intended = Agency { id: 7, name: "new".into(), capacity: 5 };
/// stored.overwrite_non_key_fields(&intended);
/// assert_eq!(stored.name, "new");
/// assert_eq!(Agency::KIND, "Agency");
/// ```
pub trait Entity: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Immutable identity key.
    type Key: Clone + Eq + Hash + Display + Debug + Send + Sync + 'static;

    /// Entity kind name; shards queues and gates.
    const KIND: &'static str;

    fn key(&self) -> Self::Key;

    /// Copies every field except the identity key from `intended` onto `self`.
    fn overwrite_non_key_fields(&mut self, intended: &Self);

    /// Key as seen by the record store.
    fn store_key(&self) -> String {
        self.key().to_string()
    }
}

/// Requested mutation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// Insert if absent, otherwise treated as an update.
    Save,
    /// Target must already exist.
    Update,
    /// Remove by key; removing an absent key is a no-op.
    Delete,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationKind::Save => write!(f, "SAVE"),
            OperationKind::Update => write!(f, "UPDATE"),
            OperationKind::Delete => write!(f, "DELETE"),
        }
    }
}

//! Storage mutation events streamed from the sandbox to the host cache.

use serde::{Deserialize, Serialize};

use super::JsonMap;

/// The scope a storage mirror belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageScope {
    /// Session-scoped storage, cleared when the application session ends.
    Session,
    /// Durable storage, persisted across sessions.
    Local,
}

/// Whether a mutation originated from a write or a delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MutationKind {
    /// A key was written.
    Set,
    /// A key was removed.
    Delete,
}

/// A single already-committed storage side effect. Each event carries a
/// self-contained full snapshot of the scope's map, so replaying only the
/// latest event reconstructs the same state as replaying all of them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageMutation {
    /// Which scope was mutated.
    pub scope: StorageScope,

    /// Whether the mutation was a write or a delete.
    pub kind: MutationKind,

    /// Full current contents of the scope's map as mirrored to the host:
    /// keys whose latest write was suppressed by the size ceiling carry
    /// their last successfully mirrored value.
    pub snapshot: JsonMap,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_mutation_round_trip() {
        let mut snapshot = JsonMap::new();
        snapshot.insert("count".into(), json!(3));
        let mutation =
            StorageMutation { scope: StorageScope::Session, kind: MutationKind::Set, snapshot };

        let encoded = serde_json::to_value(&mutation).unwrap();
        assert_eq!(encoded["scope"], "session");
        assert_eq!(encoded["kind"], "set");

        let decoded: StorageMutation = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, mutation);
    }
}

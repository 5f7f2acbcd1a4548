//! The storage-cache collaborator consuming mutation events from invocations.
//!
//! Mutations are applied optimistically as they arrive; the cache provides no
//! locking across invocations, so concurrent scripts touching the same node's
//! storage resolve last-write-wins.

use std::collections::HashMap;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::models::{JsonMap, StorageMutation, StorageScope};

/// Errors that can occur while applying mutations to the cache.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The cache backend rejected the snapshot.
    #[error("Failed to apply storage snapshot: {0}")]
    Apply(String),
}

/// Consumes the stream of storage mutation events, independent of the
/// invocation's terminal outcome.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StorageCacheSink: Send + Sync {
    /// Applies one already-committed mutation for a project's node. Each
    /// event carries a full snapshot, so applying only the latest event for a
    /// scope yields the same state as applying all of them.
    async fn apply(
        &self,
        project_id: &str,
        node_id: &str,
        mutation: StorageMutation,
    ) -> Result<(), CacheError>;
}

type ScopeKey = (String, String, StorageScope);

/// In-memory cache implementation backing the application shell and tests.
#[derive(Default)]
pub struct MemoryStorageCache {
    scopes: RwLock<HashMap<ScopeKey, JsonMap>>,
}

impl MemoryStorageCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached map for a scope, if any mutation reached it yet.
    pub async fn scope_contents(
        &self,
        project_id: &str,
        node_id: &str,
        scope: StorageScope,
    ) -> Option<JsonMap> {
        self.scopes
            .read()
            .await
            .get(&(project_id.to_string(), node_id.to_string(), scope))
            .cloned()
    }
}

#[async_trait]
impl StorageCacheSink for MemoryStorageCache {
    #[tracing::instrument(skip(self, mutation), level = "debug")]
    async fn apply(
        &self,
        project_id: &str,
        node_id: &str,
        mutation: StorageMutation,
    ) -> Result<(), CacheError> {
        tracing::debug!(scope = ?mutation.scope, keys = mutation.snapshot.len(), "Applying storage snapshot");
        self.scopes.write().await.insert(
            (project_id.to_string(), node_id.to_string(), mutation.scope),
            mutation.snapshot,
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MutationKind;
    use serde_json::json;

    fn mutation(scope: StorageScope, entries: &[(&str, serde_json::Value)]) -> StorageMutation {
        let snapshot =
            entries.iter().map(|(k, v)| (k.to_string(), v.clone())).collect::<JsonMap>();
        StorageMutation { scope, kind: MutationKind::Set, snapshot }
    }

    #[tokio::test]
    async fn test_latest_snapshot_wins() {
        let cache = MemoryStorageCache::new();

        cache
            .apply("p", "n", mutation(StorageScope::Session, &[("a", json!(1))]))
            .await
            .unwrap();
        cache
            .apply("p", "n", mutation(StorageScope::Session, &[("a", json!(1)), ("b", json!(2))]))
            .await
            .unwrap();

        let contents = cache.scope_contents("p", "n", StorageScope::Session).await.unwrap();
        assert_eq!(contents.len(), 2);
        assert_eq!(contents["b"], json!(2));
    }

    #[tokio::test]
    async fn test_scopes_are_isolated() {
        let cache = MemoryStorageCache::new();

        cache
            .apply("p", "n", mutation(StorageScope::Session, &[("k", json!("s"))]))
            .await
            .unwrap();
        cache.apply("p", "n", mutation(StorageScope::Local, &[("k", json!("l"))])).await.unwrap();

        let session = cache.scope_contents("p", "n", StorageScope::Session).await.unwrap();
        let local = cache.scope_contents("p", "n", StorageScope::Local).await.unwrap();
        assert_eq!(session["k"], json!("s"));
        assert_eq!(local["k"], json!("l"));
    }

    #[tokio::test]
    async fn test_unknown_scope_is_empty() {
        let cache = MemoryStorageCache::new();
        assert!(cache.scope_contents("p", "n", StorageScope::Local).await.is_none());
    }
}

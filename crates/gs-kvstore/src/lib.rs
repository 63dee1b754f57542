//! Trait boundary for the external, strongly-consistent key/value store
//! that persists plans and operator binaries. The store's own replication
//! and consistency protocol is explicitly out of scope — this crate only
//! defines the boundary the rest of the workspace programs against, plus
//! an in-memory implementation for tests and local development.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("key not found: {0}")]
    NotFound(String),
    #[error("key already exists: {0}")]
    AlreadyExists(String),
    #[error("backend error: {0}")]
    Backend(String),
}

/// The generic store contract named in the purpose & scope section:
/// `list(prefix)`, `get`, `put-if-absent`, `delete-if-exists`. Used by
/// `gs-meta` as the plan store (`PlanStore` in the component table is this
/// trait, keyed under [`keys::plan`]).
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError>;
    async fn put_if_absent(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError>;
    async fn delete_if_exists(&self, key: &str) -> Result<(), StoreError>;
    /// Unconditional overwrite, used for the plan watcher rewriting an
    /// in-flight `PlanNode.outbound` edge back to the persisted plan.
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError>;
}

/// In-memory `KvStore`, used by `gs-meta`/`gs-agent` tests and by local
/// development. Mirrors the persisted layout's key conventions
/// (`/plans/<name>`, `/actions/<name>`) but is agnostic to them.
#[derive(Default)]
pub struct MemStore {
    data: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemStore {
    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let data = self.data.lock().unwrap();
        Ok(data.keys().filter(|k| k.starts_with(prefix)).cloned().collect())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let data = self.data.lock().unwrap();
        data.get(key).cloned().ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn put_if_absent(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        let mut data = self.data.lock().unwrap();
        if data.contains_key(key) {
            return Err(StoreError::AlreadyExists(key.to_string()));
        }
        data.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete_if_exists(&self, key: &str) -> Result<(), StoreError> {
        let mut data = self.data.lock().unwrap();
        if data.remove(key).is_none() {
            return Err(StoreError::NotFound(key.to_string()));
        }
        Ok(())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        let mut data = self.data.lock().unwrap();
        data.insert(key.to_string(), value);
        Ok(())
    }
}

/// Action-binary storage, separate from [`KvStore`] because its values are
/// opaque zstd-compressed blobs rather than JSON documents and it has no
/// conditional-write semantics. The machine agent decompresses and
/// `chmod 0700`s what `get` returns; it never writes back.
#[async_trait]
pub trait ActionStore: Send + Sync {
    async fn get(&self, name: &str) -> Result<Vec<u8>, StoreError>;
    async fn put(&self, name: &str, zstd_bytes: Vec<u8>) -> Result<(), StoreError>;
    async fn delete(&self, name: &str) -> Result<(), StoreError>;
    async fn list(&self) -> Result<Vec<String>, StoreError>;
}

/// In-memory [`ActionStore`], used by `gs-meta`/`gs-agent` tests.
#[derive(Default)]
pub struct MemActionStore {
    data: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemActionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ActionStore for MemActionStore {
    async fn get(&self, name: &str) -> Result<Vec<u8>, StoreError> {
        self.data.lock().unwrap().get(name).cloned().ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    async fn put(&self, name: &str, zstd_bytes: Vec<u8>) -> Result<(), StoreError> {
        self.data.lock().unwrap().insert(name.to_string(), zstd_bytes);
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        if self.data.lock().unwrap().remove(name).is_none() {
            return Err(StoreError::NotFound(name.to_string()));
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.data.lock().unwrap().keys().cloned().collect())
    }
}

/// Key-naming helpers for the persisted layout: `/plans/<name>` for
/// compiled plans, alongside the separate action-binary namespace.
pub mod keys {
    pub fn plan(name: &str) -> String {
        format!("/plans/{name}")
    }
    pub fn action(name: &str) -> String {
        format!("/actions/{name}")
    }
    pub const PLAN_PREFIX: &str = "/plans/";
    pub const ACTION_PREFIX: &str = "/actions/";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_if_absent_then_conflict() {
        let store = MemStore::new();
        store.put_if_absent("/plans/a", b"v1".to_vec()).await.unwrap();
        let err = store.put_if_absent("/plans/a", b"v2".to_vec()).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn list_prefix_filters() {
        let store = MemStore::new();
        store.put_if_absent("/plans/a", vec![]).await.unwrap();
        store.put_if_absent("/actions/b", vec![]).await.unwrap();
        let plans = store.list_prefix(keys::PLAN_PREFIX).await.unwrap();
        assert_eq!(plans, vec!["/plans/a".to_string()]);
    }

    #[tokio::test]
    async fn delete_if_exists_errors_when_missing() {
        let store = MemStore::new();
        let err = store.delete_if_exists("/plans/missing").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn action_store_round_trips_and_lists() {
        let store = MemActionStore::new();
        store.put("filter", vec![1, 2, 3]).await.unwrap();
        assert_eq!(store.get("filter").await.unwrap(), vec![1, 2, 3]);
        assert_eq!(store.list().await.unwrap(), vec!["filter".to_string()]);
        store.delete("filter").await.unwrap();
        assert!(matches!(store.get("filter").await.unwrap_err(), StoreError::NotFound(_)));
    }
}

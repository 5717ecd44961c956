//! Store/load/list/delete snapshots of aggregate state at specific stream
//! versions, so a reader can fast-forward instead of folding from scratch.
//!
//! Grounded in the `create_snapshot`/`get_latest_snapshot` shape surfaced by
//! the broader pack's event-store traits (an `EventSnapshot{stream_id,
//! version, state, created_at}` keyed lookup), adapted to the explicit
//! path/key convention and named-snapshot support this crate's wire format
//! fixes.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::StreamEngineError;

/// Metadata describing one stored snapshot, without its payload bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotMetadata {
    /// The stream version this snapshot was taken at.
    pub version: i64,
    /// When the snapshot was written.
    pub created_at: chrono::DateTime<chrono::Utc>,
    /// Optional caller-supplied discriminator, for more than one named
    /// snapshot at the same version.
    pub name: Option<String>,
    /// Size of the snapshot payload in bytes, if known.
    pub size_bytes: Option<u64>,
}

fn snapshot_key(stream_identifier: &str, version: i64, name: Option<&str>) -> String {
    match name {
        Some(name) => format!("snapshot/{stream_identifier}-{version:020}_{name}.json"),
        None => format!("snapshot/{stream_identifier}-{version:020}.json"),
    }
}

/// Pluggable store for snapshot blobs, keyed by `(streamIdentifier, version,
/// name)`.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Overwrites the snapshot at this key with `payload`. Idempotent.
    async fn set(
        &self,
        stream_identifier: &str,
        version: i64,
        name: Option<&str>,
        payload: Vec<u8>,
    ) -> Result<(), StreamEngineError>;

    /// Loads the snapshot payload at this key, or `None` if absent.
    async fn get(
        &self,
        stream_identifier: &str,
        version: i64,
        name: Option<&str>,
    ) -> Result<Option<Vec<u8>>, StreamEngineError>;

    /// Lists all snapshots for `stream_identifier`, sorted by version
    /// descending.
    async fn list_snapshots(
        &self,
        stream_identifier: &str,
    ) -> Result<Vec<SnapshotMetadata>, StreamEngineError>;

    /// Deletes the snapshot at this key. Returns `true` if it existed;
    /// deleting a nonexistent snapshot is not an error.
    async fn delete(
        &self,
        stream_identifier: &str,
        version: i64,
        name: Option<&str>,
    ) -> Result<bool, StreamEngineError>;

    /// Deletes every snapshot in `versions` for `stream_identifier`,
    /// returning how many actually existed.
    async fn delete_many(
        &self,
        stream_identifier: &str,
        versions: &[i64],
    ) -> Result<usize, StreamEngineError> {
        let mut count = 0;
        for version in versions {
            if self.delete(stream_identifier, *version, None).await? {
                count += 1;
            }
        }
        Ok(count)
    }
}

#[derive(Debug, Clone)]
struct StoredSnapshot {
    metadata: SnapshotMetadata,
    payload: Vec<u8>,
}

/// In-memory [`SnapshotStore`] reference implementation.
#[derive(Clone)]
pub struct InMemorySnapshotStore {
    backend: Arc<RwLock<HashMap<(String, String), StoredSnapshot>>>,
}

impl Default for InMemorySnapshotStore {
    fn default() -> Self {
        Self {
            backend: Arc::default(),
        }
    }
}

impl InMemorySnapshotStore {
    /// Builds an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn set(
        &self,
        stream_identifier: &str,
        version: i64,
        name: Option<&str>,
        payload: Vec<u8>,
    ) -> Result<(), StreamEngineError> {
        let key = snapshot_key(stream_identifier, version, name);
        let mut backend = self.backend.write().await;
        backend.insert(
            (stream_identifier.to_string(), key),
            StoredSnapshot {
                metadata: SnapshotMetadata {
                    version,
                    created_at: chrono::Utc::now(),
                    name: name.map(str::to_string),
                    size_bytes: Some(payload.len() as u64),
                },
                payload,
            },
        );
        Ok(())
    }

    async fn get(
        &self,
        stream_identifier: &str,
        version: i64,
        name: Option<&str>,
    ) -> Result<Option<Vec<u8>>, StreamEngineError> {
        let key = snapshot_key(stream_identifier, version, name);
        let backend = self.backend.read().await;
        Ok(backend
            .get(&(stream_identifier.to_string(), key))
            .map(|s| s.payload.clone()))
    }

    async fn list_snapshots(
        &self,
        stream_identifier: &str,
    ) -> Result<Vec<SnapshotMetadata>, StreamEngineError> {
        let backend = self.backend.read().await;
        let mut metadata: Vec<SnapshotMetadata> = backend
            .iter()
            .filter(|((owner, _), _)| owner == stream_identifier)
            .map(|(_, stored)| stored.metadata.clone())
            .collect();

        metadata.sort_by(|a, b| b.version.cmp(&a.version));
        Ok(metadata)
    }

    async fn delete(
        &self,
        stream_identifier: &str,
        version: i64,
        name: Option<&str>,
    ) -> Result<bool, StreamEngineError> {
        let key = snapshot_key(stream_identifier, version, name);
        let mut backend = self.backend.write().await;
        Ok(backend.remove(&(stream_identifier.to_string(), key)).is_some())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn set_is_idempotent_overwrite_at_same_key() {
        let store = InMemorySnapshotStore::new();

        store.set("s1", 250, None, b"counter=250".to_vec()).await.unwrap();
        store.set("s1", 250, None, b"counter=250-updated".to_vec()).await.unwrap();

        let loaded = store.get("s1", 250, None).await.unwrap().unwrap();
        assert_eq!(loaded, b"counter=250-updated");

        let listed = store.list_snapshots("s1").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].version, 250);
    }

    #[tokio::test]
    async fn list_snapshots_sorted_descending() {
        let store = InMemorySnapshotStore::new();
        store.set("s1", 10, None, b"a".to_vec()).await.unwrap();
        store.set("s1", 30, None, b"b".to_vec()).await.unwrap();
        store.set("s1", 20, None, b"c".to_vec()).await.unwrap();

        let listed = store.list_snapshots("s1").await.unwrap();
        let versions: Vec<i64> = listed.iter().map(|m| m.version).collect();
        assert_eq!(versions, vec![30, 20, 10]);
    }

    #[tokio::test]
    async fn delete_nonexistent_returns_false() {
        let store = InMemorySnapshotStore::new();
        assert!(!store.delete("s1", 5, None).await.unwrap());
    }

    #[tokio::test]
    async fn delete_many_counts_only_existing() {
        let store = InMemorySnapshotStore::new();
        store.set("s1", 1, None, vec![]).await.unwrap();
        store.set("s1", 2, None, vec![]).await.unwrap();

        let deleted = store.delete_many("s1", &[1, 2, 3]).await.unwrap();
        assert_eq!(deleted, 2);
    }
}

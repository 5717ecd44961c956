//! Reverse indexes from tag to object/stream identifiers.
//!
//! These are separate stores with their own consistency: reads may be
//! momentarily stale with respect to very recent writes, which is
//! acceptable and is documented on the traits rather than hidden. Grounded
//! in the same in-memory-map-behind-a-lock shape as [`crate::document`]'s
//! `InMemoryObjectDocumentStore`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::StreamEngineError;

/// Reverse index from a document tag to the `objectId`s carrying it.
///
/// Reads may lag behind very recent `DocumentTagStore`-external writes by
/// an implementation-defined amount; callers that need read-your-writes
/// consistency must not rely on this store alone.
#[async_trait]
pub trait DocumentTagStore: Send + Sync {
    /// Returns one `objectId` tagged with `tag` under `object_name`, if any.
    async fn get_first_by_tag(
        &self,
        object_name: &str,
        tag: &str,
    ) -> Result<Option<String>, StreamEngineError>;

    /// Returns every `objectId` tagged with `tag` under `object_name`.
    async fn get_by_tag(&self, object_name: &str, tag: &str) -> Result<Vec<String>, StreamEngineError>;

    /// Associates `object_id` with `tag` under `object_name`.
    async fn tag(&self, object_name: &str, tag: &str, object_id: &str) -> Result<(), StreamEngineError>;
}

/// Reverse index from a stream tag to the `streamId`s carrying it.
///
/// Same staleness caveat as [`DocumentTagStore`].
#[async_trait]
pub trait StreamTagStore: Send + Sync {
    /// Returns one `streamId` tagged with `tag`, if any.
    async fn get_first_by_tag(&self, tag: &str) -> Result<Option<String>, StreamEngineError>;

    /// Returns every `streamId` tagged with `tag`.
    async fn get_by_tag(&self, tag: &str) -> Result<Vec<String>, StreamEngineError>;

    /// Associates `stream_id` with `tag`.
    async fn tag(&self, tag: &str, stream_id: &str) -> Result<(), StreamEngineError>;
}

#[derive(Default)]
struct TagIndex {
    entries: HashMap<String, Vec<String>>,
}

impl TagIndex {
    fn insert(&mut self, tag: &str, id: &str) {
        let ids = self.entries.entry(tag.to_string()).or_default();
        if !ids.iter().any(|existing| existing == id) {
            ids.push(id.to_string());
        }
    }
}

/// In-memory [`DocumentTagStore`] reference implementation, keyed by
/// `(objectName, tag)`.
#[derive(Clone)]
pub struct InMemoryDocumentTagStore {
    backend: Arc<RwLock<HashMap<String, TagIndex>>>,
}

impl Default for InMemoryDocumentTagStore {
    fn default() -> Self {
        Self {
            backend: Arc::default(),
        }
    }
}

impl InMemoryDocumentTagStore {
    /// Builds an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentTagStore for InMemoryDocumentTagStore {
    async fn get_first_by_tag(
        &self,
        object_name: &str,
        tag: &str,
    ) -> Result<Option<String>, StreamEngineError> {
        let backend = self.backend.read().await;
        Ok(backend
            .get(&object_name.to_lowercase())
            .and_then(|index| index.entries.get(tag))
            .and_then(|ids| ids.first().cloned()))
    }

    async fn get_by_tag(&self, object_name: &str, tag: &str) -> Result<Vec<String>, StreamEngineError> {
        let backend = self.backend.read().await;
        Ok(backend
            .get(&object_name.to_lowercase())
            .and_then(|index| index.entries.get(tag))
            .cloned()
            .unwrap_or_default())
    }

    async fn tag(&self, object_name: &str, tag: &str, object_id: &str) -> Result<(), StreamEngineError> {
        let mut backend = self.backend.write().await;
        backend
            .entry(object_name.to_lowercase())
            .or_default()
            .insert(tag, object_id);
        Ok(())
    }
}

/// In-memory [`StreamTagStore`] reference implementation.
#[derive(Clone)]
pub struct InMemoryStreamTagStore {
    backend: Arc<RwLock<TagIndex>>,
}

impl Default for InMemoryStreamTagStore {
    fn default() -> Self {
        Self {
            backend: Arc::default(),
        }
    }
}

impl InMemoryStreamTagStore {
    /// Builds an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StreamTagStore for InMemoryStreamTagStore {
    async fn get_first_by_tag(&self, tag: &str) -> Result<Option<String>, StreamEngineError> {
        let backend = self.backend.read().await;
        Ok(backend.entries.get(tag).and_then(|ids| ids.first().cloned()))
    }

    async fn get_by_tag(&self, tag: &str) -> Result<Vec<String>, StreamEngineError> {
        let backend = self.backend.read().await;
        Ok(backend.entries.get(tag).cloned().unwrap_or_default())
    }

    async fn tag(&self, tag: &str, stream_id: &str) -> Result<(), StreamEngineError> {
        let mut backend = self.backend.write().await;
        backend.insert(tag, stream_id);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn document_tag_store_round_trips() {
        let store = InMemoryDocumentTagStore::new();
        store.tag("Order", "vip", "o1").await.unwrap();
        store.tag("Order", "vip", "o2").await.unwrap();

        assert_eq!(store.get_first_by_tag("Order", "vip").await.unwrap(), Some("o1".to_string()));
        assert_eq!(
            store.get_by_tag("Order", "vip").await.unwrap(),
            vec!["o1".to_string(), "o2".to_string()]
        );
        assert_eq!(store.get_by_tag("Order", "missing").await.unwrap(), Vec::<String>::new());
    }

    #[tokio::test]
    async fn stream_tag_store_round_trips() {
        let store = InMemoryStreamTagStore::new();
        store.tag("archived", "stream-1").await.unwrap();

        assert_eq!(store.get_first_by_tag("archived").await.unwrap(), Some("stream-1".to_string()));
    }
}

//! Per-entity metadata: active stream, terminated streams, chunk layout,
//! and the store contract that persists it with optimistic concurrency.
//!
//! Grounded in the `entity`/`entity::repository` pair of a typical
//! event-sourcing crate: a `Repository<T>` that `get`s and `save`s a value
//! keyed by its own id, backed here by a thread-safe `HashMap`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use crate::error::{ConcurrencyError, StreamEngineError};

/// Sentinel `currentStreamVersion` meaning the stream has never been
/// appended to.
pub const EMPTY_STREAM_VERSION: i64 = -1;

/// Per-entity document: identity, content hash for optimistic concurrency,
/// the currently active stream, and the ordered history of streams that
/// preceded it (left behind by live migrations).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectDocument {
    /// Logical entity type name, stored as originally supplied for display.
    pub object_name: String,
    /// Entity identifier.
    pub object_id: String,
    /// Schema version of this document record itself.
    pub schema_version: u32,
    /// Content hash of the document at the time it was last read, used as
    /// an etag for optimistic concurrency when the backend has none of its
    /// own.
    pub hash: String,
    /// The stream currently accepting writes for this entity.
    pub active: StreamInformation,
    /// Append-only history of streams superseded by live migration,
    /// oldest first.
    pub terminated_streams: Vec<TerminatedStream>,
}

impl ObjectDocument {
    /// Normalizes `object_name` to lower case, as required for
    /// container/partition keying; the original casing is retained in
    /// `object_name` for display.
    #[must_use]
    pub fn partition_key(&self) -> String {
        self.object_name.to_lowercase()
    }

    /// Recomputes and stores this document's content hash from its current
    /// field values. Must be called before `set` whenever fields change.
    pub fn rehash(&mut self) {
        self.hash = compute_document_hash(self);
    }
}

/// Computes the SHA-256 hex digest of the canonical representation of a
/// document, used for optimistic concurrency at the document layer.
#[must_use]
pub fn compute_document_hash(document: &ObjectDocument) -> String {
    let mut hasher = Sha256::new();
    hasher.update(document.object_name.as_bytes());
    hasher.update(b"\0");
    hasher.update(document.object_id.as_bytes());
    hasher.update(b"\0");
    hasher.update(document.schema_version.to_be_bytes());
    hasher.update(b"\0");
    hasher.update(document.active.stream_identifier.as_bytes());
    hasher.update(b"\0");
    hasher.update(document.active.current_stream_version.to_be_bytes());
    hasher.update(b"\0");
    for terminated in &document.terminated_streams {
        hasher.update(terminated.stream_identifier.as_bytes());
        hasher.update(terminated.stream_version.to_be_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Metadata describing the stream currently active for an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamInformation {
    /// Identifier of this stream incarnation.
    pub stream_identifier: String,
    /// Backend kind this stream is stored in, e.g. `"blob"`, `"cosmosdb"`,
    /// `"table"`.
    pub stream_type: String,
    /// Last appended version, or [`EMPTY_STREAM_VERSION`] when empty.
    pub current_stream_version: i64,
    /// Connection name hint for the `DataStore` backing this stream.
    pub data_connection_name: Option<String>,
    /// Connection name hint for the `SnapshotStore`, deprecated in favor of
    /// falling back to `data_connection_name`, see
    /// [`Self::resolved_snapshot_connection`].
    pub snapshot_connection_name: Option<String>,
    /// Connection name hint for the `DocumentTagStore`.
    pub document_tag_connection_name: Option<String>,
    /// Connection name hint for the `StreamTagStore`.
    pub stream_tag_connection_name: Option<String>,
    /// Whether/how this stream is subdivided into chunks.
    pub chunk_settings: StreamChunkSettings,
    /// Current chunk layout.
    pub stream_chunks: StreamChunks,
    /// True while a live migration has quiesced this stream for new
    /// writes; see [`crate::migration`].
    pub quiescing: bool,
}

impl StreamInformation {
    /// Builds a fresh, empty stream with chunking disabled.
    #[must_use]
    pub fn new(stream_identifier: impl Into<String>, stream_type: impl Into<String>) -> Self {
        Self {
            stream_identifier: stream_identifier.into(),
            stream_type: stream_type.into(),
            current_stream_version: EMPTY_STREAM_VERSION,
            data_connection_name: None,
            snapshot_connection_name: None,
            document_tag_connection_name: None,
            stream_tag_connection_name: None,
            chunk_settings: StreamChunkSettings::default(),
            stream_chunks: StreamChunks::default(),
            quiescing: false,
        }
    }

    /// Resolves which connection name a `SnapshotStore` should use for this
    /// stream.
    ///
    /// Canonical rule (see `DESIGN.md`, Open Question 1): an explicit
    /// `snapshot_connection_name` always wins; when absent, this stream's
    /// own `data_connection_name` is used instead, since a snapshot that
    /// has no explicit home belongs alongside the data it snapshots.
    #[must_use]
    pub fn resolved_snapshot_connection(&self) -> Option<&str> {
        self.snapshot_connection_name
            .as_deref()
            .or(self.data_connection_name.as_deref())
    }

    /// True when the stream has never been appended to.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.current_stream_version == EMPTY_STREAM_VERSION
    }
}

/// Record of a stream that was once active but has been superseded,
/// typically by a live migration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminatedStream {
    /// Identifier of the terminated stream incarnation.
    pub stream_identifier: String,
    /// Last version the terminated stream reached before closing.
    pub stream_version: i64,
    /// When the stream was terminated.
    pub termination_date: chrono::DateTime<chrono::Utc>,
    /// Why the stream was terminated, e.g. `"live-migration"`.
    pub reason: String,
}

/// Whether/how a stream is subdivided into bounded chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamChunkSettings {
    /// When false, the stream is a single unbounded chunk.
    pub enable_chunks: bool,
    /// Maximum number of events per chunk when `enable_chunks` is true.
    pub chunk_size: i64,
}

impl Default for StreamChunkSettings {
    fn default() -> Self {
        Self {
            enable_chunks: false,
            chunk_size: 0,
        }
    }
}

/// One contiguous, bounded slice of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamChunk {
    /// Zero-based chunk index.
    pub chunk_id: i64,
    /// First version stored in this chunk, inclusive.
    pub first_version: i64,
    /// Last version stored in this chunk, inclusive, or `-1` while this is
    /// still the open chunk.
    pub last_version: i64,
}

impl StreamChunk {
    /// True while this chunk is still accepting new events.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.last_version == EMPTY_STREAM_VERSION
    }

    /// True when `version` falls within this chunk's range.
    #[must_use]
    pub fn contains(&self, version: i64) -> bool {
        version >= self.first_version
            && (self.is_open() || version <= self.last_version)
    }
}

/// Ordered sequence of [`StreamChunk`]s describing a stream's layout.
///
/// Invariants: chunks are contiguous, non-overlapping, strictly increasing
/// in `first_version`; at most one open chunk (`last_version == -1`) and it
/// is always the last one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamChunks {
    chunks: Vec<StreamChunk>,
}

impl StreamChunks {
    /// Returns the chunk layout as a slice.
    #[must_use]
    pub fn as_slice(&self) -> &[StreamChunk] {
        &self.chunks
    }

    /// Returns the currently open chunk, if any.
    #[must_use]
    pub fn open_chunk(&self) -> Option<&StreamChunk> {
        self.chunks.last().filter(|c| c.is_open())
    }

    /// Returns the chunk containing `version`, if the layout covers it.
    #[must_use]
    pub fn chunk_containing(&self, version: i64) -> Option<&StreamChunk> {
        self.chunks.iter().find(|c| c.contains(version))
    }

    /// Opens the very first chunk, starting at version 0.
    pub fn open_first(&mut self) {
        self.chunks.push(StreamChunk {
            chunk_id: 0,
            first_version: 0,
            last_version: EMPTY_STREAM_VERSION,
        });
    }

    /// Closes the currently open chunk at `last_version` and opens a new
    /// one starting at `next_first_version`.
    pub fn roll(&mut self, last_version: i64, next_first_version: i64) {
        let next_chunk_id = if let Some(open) = self.chunks.last_mut().filter(|c| c.is_open()) {
            open.last_version = last_version;
            open.chunk_id + 1
        } else {
            0
        };

        self.chunks.push(StreamChunk {
            chunk_id: next_chunk_id,
            first_version: next_first_version,
            last_version: EMPTY_STREAM_VERSION,
        });
    }
}

/// Store contract for [`ObjectDocument`]s, including the document-tag
/// reverse index lookups.
#[async_trait]
pub trait ObjectDocumentStore: Send + Sync {
    /// Fetches the document for `(object_name, object_id)`.
    async fn get(&self, object_name: &str, object_id: &str) -> Result<ObjectDocument, StreamEngineError>;

    /// Fetches the document for `(object_name, object_id)`, creating a
    /// fresh one idempotently if none exists yet. Concurrent first-creates
    /// must converge to the same active stream identifier.
    async fn get_or_create(
        &self,
        object_name: &str,
        object_id: &str,
    ) -> Result<ObjectDocument, StreamEngineError>;

    /// Persists `document`. When the backend supports it, uses optimistic
    /// concurrency keyed on the document's last-observed `hash`; on
    /// mismatch, fails with [`StreamEngineError::Concurrency`].
    async fn set(&self, document: &ObjectDocument) -> Result<(), StreamEngineError>;

    /// Returns one `objectId` carrying `tag` under `object_name`, if any.
    async fn get_first_by_tag(
        &self,
        object_name: &str,
        tag: &str,
    ) -> Result<Option<String>, StreamEngineError>;

    /// Returns all `objectId`s carrying `tag` under `object_name`.
    async fn get_by_tag(&self, object_name: &str, tag: &str) -> Result<Vec<String>, StreamEngineError>;
}

/// Derives the stream identifier a first-create should use, so that
/// concurrent `get_or_create` calls for the same `(object_name, object_id)`
/// converge on the same active stream.
#[must_use]
pub fn default_stream_identifier(object_name: &str, object_id: &str) -> String {
    format!("{}-{}", object_name.to_lowercase(), object_id)
}

#[derive(Default)]
struct Backend {
    documents: HashMap<(String, String), ObjectDocument>,
    document_tags: HashMap<(String, String), Vec<String>>,
}

/// In-memory [`ObjectDocumentStore`] reference implementation, backed by a
/// `tokio::sync::RwLock<HashMap<..>>`.
#[derive(Clone)]
pub struct InMemoryObjectDocumentStore {
    backend: Arc<RwLock<Backend>>,
}

impl Default for InMemoryObjectDocumentStore {
    fn default() -> Self {
        Self {
            backend: Arc::default(),
        }
    }
}

impl InMemoryObjectDocumentStore {
    /// Builds an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Tags `object_id` under `object_name` with `tag`. Reference-only
    /// helper; real backends populate their tag index as a side effect of
    /// `set`.
    pub async fn tag(&self, object_name: &str, tag: &str, object_id: &str) {
        let mut backend = self.backend.write().await;
        backend
            .document_tags
            .entry((object_name.to_lowercase(), tag.to_string()))
            .or_default()
            .push(object_id.to_string());
    }
}

#[async_trait]
impl ObjectDocumentStore for InMemoryObjectDocumentStore {
    async fn get(&self, object_name: &str, object_id: &str) -> Result<ObjectDocument, StreamEngineError> {
        let backend = self.backend.read().await;
        backend
            .documents
            .get(&(object_name.to_lowercase(), object_id.to_string()))
            .cloned()
            .ok_or_else(|| StreamEngineError::NotFound(format!("{object_name}/{object_id}")))
    }

    async fn get_or_create(
        &self,
        object_name: &str,
        object_id: &str,
    ) -> Result<ObjectDocument, StreamEngineError> {
        let key = (object_name.to_lowercase(), object_id.to_string());
        {
            let backend = self.backend.read().await;
            if let Some(existing) = backend.documents.get(&key) {
                return Ok(existing.clone());
            }
        }

        let mut backend = self.backend.write().await;
        if let Some(existing) = backend.documents.get(&key) {
            return Ok(existing.clone());
        }

        let stream_identifier = default_stream_identifier(object_name, object_id);
        let mut document = ObjectDocument {
            object_name: object_name.to_string(),
            object_id: object_id.to_string(),
            schema_version: 1,
            hash: String::new(),
            active: StreamInformation::new(stream_identifier, "memory"),
            terminated_streams: Vec::new(),
        };
        document.rehash();

        backend.documents.insert(key, document.clone());
        Ok(document)
    }

    async fn set(&self, document: &ObjectDocument) -> Result<(), StreamEngineError> {
        let key = (document.object_name.to_lowercase(), document.object_id.clone());
        let mut backend = self.backend.write().await;

        if let Some(existing) = backend.documents.get(&key) {
            if existing.hash != document.hash {
                return Err(ConcurrencyError::document_hash(&document.hash, &existing.hash).into());
            }
        }

        let mut updated = document.clone();
        updated.rehash();
        backend.documents.insert(key, updated);
        Ok(())
    }

    async fn get_first_by_tag(
        &self,
        object_name: &str,
        tag: &str,
    ) -> Result<Option<String>, StreamEngineError> {
        let backend = self.backend.read().await;
        Ok(backend
            .document_tags
            .get(&(object_name.to_lowercase(), tag.to_string()))
            .and_then(|ids| ids.first().cloned()))
    }

    async fn get_by_tag(&self, object_name: &str, tag: &str) -> Result<Vec<String>, StreamEngineError> {
        let backend = self.backend.read().await;
        Ok(backend
            .document_tags
            .get(&(object_name.to_lowercase(), tag.to_string()))
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn get_or_create_is_idempotent() {
        let store = InMemoryObjectDocumentStore::new();

        let first = store.get_or_create("Order", "o1").await.unwrap();
        let second = store.get_or_create("Order", "o1").await.unwrap();

        assert_eq!(first.active.stream_identifier, second.active.stream_identifier);
        assert_eq!(first.hash, second.hash);
    }

    #[tokio::test]
    async fn set_detects_hash_conflict() {
        let store = InMemoryObjectDocumentStore::new();
        let mut document = store.get_or_create("Order", "o1").await.unwrap();

        // Simulate a concurrent writer updating first, presenting the hash it
        // last observed; `set` recomputes and stores the new one internally.
        let mut winner = document.clone();
        winner.active.current_stream_version = 0;
        store.set(&winner).await.unwrap();

        // Our stale copy's hash no longer matches.
        document.active.current_stream_version = 0;
        let err = store.set(&document).await.expect_err("should conflict");
        assert!(matches!(err, StreamEngineError::Concurrency(_)));
    }

    #[test]
    fn chunk_layout_rolls_contiguously() {
        let mut chunks = StreamChunks::default();
        chunks.open_first();
        chunks.roll(99, 100);
        chunks.roll(199, 200);

        let slice = chunks.as_slice();
        assert_eq!(slice.len(), 3);
        assert_eq!(slice[0], StreamChunk { chunk_id: 0, first_version: 0, last_version: 99 });
        assert_eq!(slice[1], StreamChunk { chunk_id: 1, first_version: 100, last_version: 199 });
        assert_eq!(slice[2], StreamChunk { chunk_id: 2, first_version: 200, last_version: -1 });
        assert!(chunks.open_chunk().unwrap().is_open());
    }

    #[test]
    fn snapshot_connection_falls_back_to_data_connection() {
        let mut stream = StreamInformation::new("s1", "blob");
        assert_eq!(stream.resolved_snapshot_connection(), None);

        stream.data_connection_name = Some("primary".to_string());
        assert_eq!(stream.resolved_snapshot_connection(), Some("primary"));

        stream.snapshot_connection_name = Some("snapshots".to_string());
        assert_eq!(stream.resolved_snapshot_connection(), Some("snapshots"));
    }
}

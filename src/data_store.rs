//! Pluggable append/range-read of events for a document's active stream,
//! honoring its chunk layout.
//!
//! Grounded in a typical event-sourcing crate's `event::store` module: a
//! `Streamer` trait returning a boxed stream (sync fn, not `async-trait`,
//! since opening a stream is itself synchronous and only polling it
//! suspends) paired with an `async-trait` `Appender`, and an `InMemory`
//! backend over a `RwLock<HashMap>`.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use futures::stream::{iter, BoxStream, StreamExt};

use crate::document::StreamInformation;
use crate::error::StreamEngineError;
use crate::event::Event;

/// Interface used to stream events back from a [`DataStore`], honoring
/// chunk boundaries when the backend has them.
pub trait DataStreamer: Send + Sync {
    /// Opens a lazy, restartable sequence of events in
    /// `[start_version, until_version]` (inclusive), ascending by version.
    /// `until_version = None` means "to the stream head".
    fn read_as_stream<'a>(
        &'a self,
        stream: &'a StreamInformation,
        start_version: i64,
        until_version: Option<i64>,
    ) -> BoxStream<'a, Result<Event, StreamEngineError>>;
}

/// Interface used to append events to a [`DataStore`].
#[async_trait]
pub trait DataAppender: Send + Sync {
    /// Appends `events` to `stream`'s backing storage, mutating `stream`'s
    /// `current_stream_version` and `stream_chunks` in place to reflect the
    /// new layout. Returns the new `current_stream_version`.
    ///
    /// Writes are all-or-nothing at the chunk level. When `preserve_timestamp`
    /// is true, each event's own `action_metadata.event_occurred_at` is kept
    /// as supplied rather than being stamped with the write time (used by
    /// live migration to carry original timestamps across backends).
    async fn append(
        &self,
        stream: &mut StreamInformation,
        preserve_timestamp: bool,
        events: Vec<Event>,
    ) -> Result<i64, StreamEngineError>;
}

/// A pluggable event store for one document's active stream.
pub trait DataStore: DataStreamer + DataAppender + Send + Sync {}

impl<T> DataStore for T where T: DataStreamer + DataAppender + Send + Sync {}

/// Convenience non-streaming read, built on [`DataStreamer::read_as_stream`].
/// Returns `None` when the stream has no events in range because it has
/// never been appended to at all; returns `Some(vec![])` when the range
/// simply selects no events from an existing, non-empty stream.
pub async fn read<S>(
    store: &S,
    stream: &StreamInformation,
    start_version: i64,
    until_version: Option<i64>,
) -> Result<Option<Vec<Event>>, StreamEngineError>
where
    S: DataStore + ?Sized,
{
    if stream.is_empty() {
        return Ok(None);
    }

    let events: Vec<Event> = store
        .read_as_stream(stream, start_version, until_version)
        .collect::<Vec<_>>()
        .await
        .into_iter()
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Some(events))
}

#[derive(Default)]
struct Backend {
    streams: HashMap<String, Vec<Event>>,
}

/// In-memory [`DataStore`] reference implementation, backed by a
/// thread-safe `std::sync::RwLock<HashMap<..>>` keyed by stream identifier.
#[derive(Clone)]
pub struct InMemoryDataStore {
    backend: Arc<RwLock<Backend>>,
}

impl Default for InMemoryDataStore {
    fn default() -> Self {
        Self {
            backend: Arc::default(),
        }
    }
}

impl InMemoryDataStore {
    /// Builds an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl DataStreamer for InMemoryDataStore {
    fn read_as_stream<'a>(
        &'a self,
        stream: &'a StreamInformation,
        start_version: i64,
        until_version: Option<i64>,
    ) -> BoxStream<'a, Result<Event, StreamEngineError>> {
        let events = {
            let backend = self.backend.read().expect("acquire read lock on data store backend");
            backend
                .streams
                .get(&stream.stream_identifier)
                .cloned()
                .unwrap_or_default()
        };

        let filtered = events.into_iter().filter(move |event| {
            event.version >= start_version
                && until_version.map_or(true, |until| event.version <= until)
        });

        iter(filtered).map(Ok).boxed()
    }
}

#[async_trait]
impl DataAppender for InMemoryDataStore {
    async fn append(
        &self,
        stream: &mut StreamInformation,
        _preserve_timestamp: bool,
        events: Vec<Event>,
    ) -> Result<i64, StreamEngineError> {
        if events.is_empty() {
            return Ok(stream.current_stream_version);
        }

        let mut backend = self.backend.write().expect("acquire write lock on data store backend");
        let entry = backend.streams.entry(stream.stream_identifier.clone()).or_default();

        let mut next_version = stream.current_stream_version + 1;

        for mut event in events {
            let version = next_version;

            if stream.chunk_settings.enable_chunks {
                let should_roll = match stream.stream_chunks.open_chunk() {
                    Some(open) => (version - open.first_version + 1) > stream.chunk_settings.chunk_size,
                    None => true,
                };

                if should_roll {
                    if stream.stream_chunks.as_slice().is_empty() {
                        stream.stream_chunks.open_first();
                    } else {
                        stream.stream_chunks.roll(version - 1, version);
                    }
                }
            } else if stream.stream_chunks.as_slice().is_empty() {
                stream.stream_chunks.open_first();
            }

            event.version = version;
            entry.push(event);
            next_version += 1;
        }

        stream.current_stream_version = next_version - 1;
        Ok(stream.current_stream_version)
    }
}

//! `tracing` instrumentation decorators for the pluggable store traits and
//! the post-commit executor.
//!
//! A generic wrapper struct per decorated trait, plus a `with_tracing()`
//! extension trait blanket-implemented for any type implementing the
//! wrapped trait. Only present behind the `tracing` Cargo feature, so the
//! `tracing` dependency stays optional for callers who don't want it.

use async_trait::async_trait;
use futures::stream::BoxStream;
use tracing::instrument;

use crate::data_store::{DataAppender, DataStore, DataStreamer};
use crate::document::{ObjectDocument, ObjectDocumentStore, StreamInformation};
use crate::error::StreamEngineError;
use crate::event::Event;
use crate::postcommit::{PostCommitAction, PostCommitActionResult, PostCommitExecutor};

/// [`DataStore`] wrapper that emits a `tracing` span around every call.
#[derive(Debug, Clone)]
pub struct InstrumentedDataStore<T> {
    inner: T,
}

impl<T: DataStore> DataStreamer for InstrumentedDataStore<T> {
    #[instrument(name = "DataStore.read_as_stream", skip(self, stream))]
    fn read_as_stream<'a>(
        &'a self,
        stream: &'a StreamInformation,
        start_version: i64,
        until_version: Option<i64>,
    ) -> BoxStream<'a, Result<Event, StreamEngineError>> {
        self.inner.read_as_stream(stream, start_version, until_version)
    }
}

#[async_trait]
impl<T: DataStore> DataAppender for InstrumentedDataStore<T> {
    #[allow(clippy::blocks_in_conditions)]
    #[instrument(name = "DataStore.append", ret, err, skip(self, stream, events), fields(event_count = events.len()))]
    async fn append(
        &self,
        stream: &mut StreamInformation,
        preserve_timestamp: bool,
        events: Vec<Event>,
    ) -> Result<i64, StreamEngineError> {
        self.inner.append(stream, preserve_timestamp, events).await
    }
}

/// Extension trait wrapping any [`DataStore`] with tracing instrumentation.
pub trait DataStoreExt: DataStore + Sized {
    /// Returns an instrumented version of this `DataStore`.
    fn with_tracing(self) -> InstrumentedDataStore<Self> {
        InstrumentedDataStore { inner: self }
    }
}

impl<T: DataStore> DataStoreExt for T {}

/// [`ObjectDocumentStore`] wrapper that emits a `tracing` span around every
/// call.
#[derive(Debug, Clone)]
pub struct InstrumentedObjectDocumentStore<T> {
    inner: T,
}

#[async_trait]
impl<T: ObjectDocumentStore> ObjectDocumentStore for InstrumentedObjectDocumentStore<T> {
    #[allow(clippy::blocks_in_conditions)]
    #[instrument(name = "ObjectDocumentStore.get", ret, err, skip(self))]
    async fn get(&self, object_name: &str, object_id: &str) -> Result<ObjectDocument, StreamEngineError> {
        self.inner.get(object_name, object_id).await
    }

    #[allow(clippy::blocks_in_conditions)]
    #[instrument(name = "ObjectDocumentStore.get_or_create", ret, err, skip(self))]
    async fn get_or_create(
        &self,
        object_name: &str,
        object_id: &str,
    ) -> Result<ObjectDocument, StreamEngineError> {
        self.inner.get_or_create(object_name, object_id).await
    }

    #[allow(clippy::blocks_in_conditions)]
    #[instrument(name = "ObjectDocumentStore.set", ret, err, skip(self, document))]
    async fn set(&self, document: &ObjectDocument) -> Result<(), StreamEngineError> {
        self.inner.set(document).await
    }

    #[allow(clippy::blocks_in_conditions)]
    #[instrument(name = "ObjectDocumentStore.get_first_by_tag", ret, err, skip(self))]
    async fn get_first_by_tag(
        &self,
        object_name: &str,
        tag: &str,
    ) -> Result<Option<String>, StreamEngineError> {
        self.inner.get_first_by_tag(object_name, tag).await
    }

    #[allow(clippy::blocks_in_conditions)]
    #[instrument(name = "ObjectDocumentStore.get_by_tag", ret, err, skip(self))]
    async fn get_by_tag(&self, object_name: &str, tag: &str) -> Result<Vec<String>, StreamEngineError> {
        self.inner.get_by_tag(object_name, tag).await
    }
}

/// Extension trait wrapping any [`ObjectDocumentStore`] with tracing
/// instrumentation.
pub trait ObjectDocumentStoreExt: ObjectDocumentStore + Sized {
    /// Returns an instrumented version of this `ObjectDocumentStore`.
    fn with_tracing(self) -> InstrumentedObjectDocumentStore<Self> {
        InstrumentedObjectDocumentStore { inner: self }
    }
}

impl<T: ObjectDocumentStore> ObjectDocumentStoreExt for T {}

/// [`PostCommitExecutor`] wrapper that emits a `tracing` span around each
/// action run.
#[derive(Debug, Clone, Copy)]
pub struct InstrumentedPostCommitExecutor {
    inner: PostCommitExecutor,
}

impl InstrumentedPostCommitExecutor {
    /// Wraps `inner` with tracing instrumentation.
    #[must_use]
    pub fn new(inner: PostCommitExecutor) -> Self {
        Self { inner }
    }

    /// Instrumented [`PostCommitExecutor::run_with_retry`].
    #[allow(clippy::blocks_in_conditions)]
    #[instrument(name = "PostCommitExecutor.run_with_retry", skip(self, action, events, document), fields(action = action.name()))]
    pub async fn run_with_retry(
        &self,
        action: &(dyn PostCommitAction),
        events: &[Event],
        document: &ObjectDocument,
    ) -> PostCommitActionResult {
        self.inner.run_with_retry(action, events, document).await
    }
}

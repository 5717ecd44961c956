//! [`LeasedSession`]: a single-use write transaction over one stream that
//! buffers appended events, enforces a [`Constraint`], runs pre/post-append
//! actions, and schedules post-commit actions on a successful commit.
//!
//! Grounded in a typical event-sourcing crate's `aggregate::root::Context<T>`
//! (which buffers `recorded_events` and exposes `take_uncommitted_events`),
//! generalized here from folding aggregate state to buffering a raw,
//! session-local event log.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::data_store::{self, DataStore};
use crate::document::{ObjectDocument, EMPTY_STREAM_VERSION};
use crate::error::StreamEngineError;
use crate::event::{ActionMetadata, Event, EventTypeRegistry, Metadata};
use crate::postcommit::{PostCommitAction, PostCommitExecutor};

/// Precondition a [`LeasedSession::commit`] enforces against the stream's
/// version at commit time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Constraint {
    /// Any state is acceptable, whether the stream is empty or not.
    Loose = 0,
    /// The stream must be empty (`currentStreamVersion == -1`).
    New = 1,
    /// The stream must already have at least one event.
    Existing = 2,
}

/// Observable state of a [`LeasedSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Just created, nothing appended yet.
    Open,
    /// At least one event buffered.
    Buffering,
    /// `commit()` is in progress.
    Committing,
    /// `commit()` succeeded. Terminal.
    Committed,
    /// `commit()` failed, or the session was aborted. Terminal.
    Failed,
}

/// Runs before an event is added to a session's buffer. May mutate the
/// event's payload/metadata, but never its version.
#[async_trait]
pub trait PreAppendAction: Send + Sync {
    /// Applies this action to `event`, which is about to be buffered.
    async fn apply(&self, event: &mut Event, document: &ObjectDocument) -> Result<(), StreamEngineError>;
}

/// Runs once per committed event, inline, in the same call that produced
/// the commit, as opposed to [`crate::postcommit::PostCommitAction`], which
/// runs detached and retried.
#[async_trait]
pub trait PostAppendAction: Send + Sync {
    /// Applies this action to `event`, which has just been committed.
    async fn apply(&self, event: &Event, document: &ObjectDocument) -> Result<(), StreamEngineError>;
}

/// Optional extra fields a caller may supply when appending an event.
#[derive(Debug, Clone, Default)]
pub struct AppendOptions {
    /// Correlation/causation/idempotency context for the new event.
    pub action_metadata: Option<ActionMetadata>,
    /// Cross-stream ordering hint.
    pub external_sequencer: Option<String>,
    /// Free-form string metadata.
    pub metadata: Metadata,
}

/// Result of a successful [`LeasedSession::commit`].
#[derive(Debug, Clone)]
pub struct CommitOutcome {
    /// The events that were just made durable, in append order.
    pub committed_events: Vec<Event>,
    /// The stream's `currentStreamVersion` after this commit.
    pub new_version: i64,
}

/// A single-use write transaction over one document's active stream.
///
/// Not safe for concurrent use: a `LeasedSession` is meant to be driven
/// start-to-finish by one caller on one task.
pub struct LeasedSession {
    document: ObjectDocument,
    expected_version: i64,
    constraint: Constraint,
    buffer: Vec<Event>,
    state: SessionState,

    registry: Arc<EventTypeRegistry>,
    data_store: Arc<dyn DataStore>,
    document_store: Arc<dyn crate::document::ObjectDocumentStore>,
    pre_append_actions: Vec<Arc<dyn PreAppendAction>>,
    post_append_actions: Vec<Arc<dyn PostAppendAction>>,
    post_commit_actions: Vec<Arc<dyn PostCommitAction>>,
    post_commit_executor: PostCommitExecutor,
}

impl LeasedSession {
    /// Builds a new session over `document`'s active stream. Captures the
    /// document's current version as the baseline for [`Constraint`]
    /// enforcement and for computing buffered events' versions.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        document: ObjectDocument,
        constraint: Constraint,
        registry: Arc<EventTypeRegistry>,
        data_store: Arc<dyn DataStore>,
        document_store: Arc<dyn crate::document::ObjectDocumentStore>,
        pre_append_actions: Vec<Arc<dyn PreAppendAction>>,
        post_append_actions: Vec<Arc<dyn PostAppendAction>>,
        post_commit_actions: Vec<Arc<dyn PostCommitAction>>,
        post_commit_executor: PostCommitExecutor,
    ) -> Self {
        let expected_version = document.active.current_stream_version;
        Self {
            document,
            expected_version,
            constraint,
            buffer: Vec::new(),
            state: SessionState::Open,
            registry,
            data_store,
            document_store,
            pre_append_actions,
            post_append_actions,
            post_commit_actions,
            post_commit_executor,
        }
    }

    /// Current observable state of the session.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Encodes `payload` as `event_type`/`schema_version` via the event-type
    /// registry, runs pre-append actions, and buffers the result. Returns a
    /// clone of the buffered event.
    pub async fn append<T>(
        &mut self,
        payload: &T,
        event_type: &str,
        schema_version: u32,
        options: AppendOptions,
    ) -> Result<Event, StreamEngineError>
    where
        T: Serialize + Send + Sync + 'static,
    {
        if matches!(self.state, SessionState::Committed | SessionState::Failed) {
            return Err(StreamEngineError::SessionClosed);
        }

        let encoded = self.registry.encode(event_type, schema_version, payload)?;
        let payload_string = String::from_utf8(encoded)
            .map_err(|e| StreamEngineError::Serialization(format!("payload is not valid UTF-8: {e}")))?;

        let version = self.expected_version + 1 + (self.buffer.len() as i64);

        let mut event = Event {
            payload: payload_string,
            event_type: event_type.to_string(),
            version,
            schema_version,
            external_sequencer: options.external_sequencer,
            action_metadata: options.action_metadata,
            metadata: options.metadata,
        };

        for action in &self.pre_append_actions {
            action.apply(&mut event, &self.document).await?;
        }

        self.buffer.push(event.clone());
        self.state = SessionState::Buffering;

        Ok(event)
    }

    /// Reads events in `[start_version, until_version]`, concatenating
    /// already-committed events with this session's uncommitted buffer, by
    /// ascending version.
    pub async fn read_async(
        &self,
        start_version: i64,
        until_version: Option<i64>,
    ) -> Result<Vec<Event>, StreamEngineError> {
        let mut events = data_store::read(
            self.data_store.as_ref(),
            &self.document.active,
            start_version,
            until_version,
        )
        .await?
        .unwrap_or_default();

        events.extend(
            self.buffer
                .iter()
                .filter(|e| e.version >= start_version && until_version.map_or(true, |u| e.version <= u))
                .cloned(),
        );

        events.sort_by_key(|e| e.version);
        Ok(events)
    }

    /// Checks whether `stream_id` names one of this document's terminated
    /// streams.
    #[must_use]
    pub fn is_terminated(&self, stream_id: &str) -> bool {
        self.document
            .terminated_streams
            .iter()
            .any(|t| t.stream_identifier == stream_id)
    }

    /// Runs the commit pipeline exactly once. Buffering an empty session is
    /// a no-op success. On any failure the session transitions to
    /// [`SessionState::Failed`] and the buffer is left untouched for caller
    /// inspection.
    pub async fn commit(&mut self) -> Result<CommitOutcome, StreamEngineError> {
        if matches!(self.state, SessionState::Committed | SessionState::Failed) {
            return Err(StreamEngineError::SessionClosed);
        }

        // a. empty buffer is a trivial success.
        if self.buffer.is_empty() {
            self.state = SessionState::Committed;
            return Ok(CommitOutcome {
                committed_events: Vec::new(),
                new_version: self.document.active.current_stream_version,
            });
        }

        self.state = SessionState::Committing;

        if self.document.active.quiescing {
            self.state = SessionState::Failed;
            return Err(StreamEngineError::Migrating(
                self.document.active.stream_identifier.clone(),
            ));
        }

        // b. enforce constraint against the version captured at session creation.
        if let Err(err) = self.check_constraint() {
            self.state = SessionState::Failed;
            return Err(err);
        }

        // c. append to the DataStore; also performs d. (version bump + chunk roll)
        // in place on `self.document.active`.
        let events = std::mem::take(&mut self.buffer);
        let append_result = self
            .data_store
            .append(&mut self.document.active, false, events.clone())
            .await;

        let new_version = match append_result {
            Ok(version) => version,
            Err(err) => {
                self.buffer = events;
                self.state = SessionState::Failed;
                return Err(err);
            }
        };

        // e. persist the document; a hash conflict reloads the latest copy for
        // caller inspection but leaves committed events durable in the DataStore.
        if let Err(err) = self.document_store.set(&self.document).await {
            self.buffer = events;
            self.state = SessionState::Failed;

            if let Ok(latest) = self
                .document_store
                .get(&self.document.object_name, &self.document.object_id)
                .await
            {
                self.document = latest;
            }

            return Err(err);
        }

        // f. inline post-append actions, per event, in order.
        for event in &events {
            for action in &self.post_append_actions {
                action.apply(event, &self.document).await?;
            }
        }

        // g. schedule post-commit actions, detached, so a slow one never blocks
        // the caller or any other commit.
        if !self.post_commit_actions.is_empty() {
            self.post_commit_executor.schedule(
                self.post_commit_actions.clone(),
                events.clone(),
                self.document.clone(),
                None,
            );
        }

        self.state = SessionState::Committed;
        Ok(CommitOutcome {
            committed_events: events,
            new_version,
        })
    }

    fn check_constraint(&self) -> Result<(), StreamEngineError> {
        match self.constraint {
            Constraint::Loose => Ok(()),
            Constraint::New if self.expected_version == EMPTY_STREAM_VERSION => Ok(()),
            Constraint::New => Err(StreamEngineError::Constraint(
                "New constraint requires an empty stream".to_string(),
            )),
            Constraint::Existing if self.expected_version != EMPTY_STREAM_VERSION => Ok(()),
            Constraint::Existing => Err(StreamEngineError::Constraint(
                "Existing constraint requires a non-empty stream".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::data_store::InMemoryDataStore;
    use crate::document::{InMemoryObjectDocumentStore, ObjectDocumentStore, StreamInformation};
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize)]
    struct OrderCreated {
        id: String,
    }

    async fn new_session(constraint: Constraint) -> (LeasedSession, Arc<InMemoryDataStore>, Arc<InMemoryObjectDocumentStore>) {
        let mut registry = EventTypeRegistry::new();
        registry.register::<OrderCreated>("OrderCreated", 1);

        let data_store = Arc::new(InMemoryDataStore::new());
        let document_store = Arc::new(InMemoryObjectDocumentStore::new());
        let document = document_store.get_or_create("Order", "o1").await.unwrap();

        let session = LeasedSession::new(
            document,
            constraint,
            Arc::new(registry),
            data_store.clone(),
            document_store.clone(),
            Vec::new(),
            Vec::new(),
            Vec::new(),
            PostCommitExecutor::default(),
        );

        (session, data_store, document_store)
    }

    #[tokio::test]
    async fn create_and_read_scenario() {
        let (mut session, _data_store, _document_store) = new_session(Constraint::Loose).await;

        session
            .append(&OrderCreated { id: "o1".to_string() }, "OrderCreated", 1, AppendOptions::default())
            .await
            .unwrap();

        let outcome = session.commit().await.unwrap();
        assert_eq!(outcome.committed_events.len(), 1);
        assert_eq!(outcome.committed_events[0].version, 0);
        assert_eq!(outcome.committed_events[0].event_type, "OrderCreated");
        assert_eq!(outcome.new_version, 0);
    }

    #[tokio::test]
    async fn new_constraint_fails_on_existing_stream() {
        let (mut session, data_store, document_store) = new_session(Constraint::Loose).await;
        session
            .append(&OrderCreated { id: "o1".to_string() }, "OrderCreated", 1, AppendOptions::default())
            .await
            .unwrap();
        session.commit().await.unwrap();

        let document = document_store.get("Order", "o1").await.unwrap();
        let mut second = LeasedSession::new(
            document,
            Constraint::New,
            Arc::new({
                let mut r = EventTypeRegistry::new();
                r.register::<OrderCreated>("OrderCreated", 1);
                r
            }),
            data_store,
            document_store,
            Vec::new(),
            Vec::new(),
            Vec::new(),
            PostCommitExecutor::default(),
        );

        second
            .append(&OrderCreated { id: "o1".to_string() }, "OrderCreated", 1, AppendOptions::default())
            .await
            .unwrap();

        let err = second.commit().await.expect_err("should fail Constraint");
        assert!(matches!(err, StreamEngineError::Constraint(_)));
    }

    #[tokio::test]
    async fn append_after_commit_fails_with_session_closed() {
        let (mut session, ..) = new_session(Constraint::Loose).await;
        session.commit().await.unwrap();

        let err = session
            .append(&OrderCreated { id: "o1".to_string() }, "OrderCreated", 1, AppendOptions::default())
            .await
            .expect_err("should be closed");
        assert!(matches!(err, StreamEngineError::SessionClosed));
    }
}

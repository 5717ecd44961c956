//! Live-migration state machine: moves a document's active stream to a new
//! backend while it keeps accepting writes, then quiesces and cuts over.
//!
//! Built directly on this crate's own `data_store`/`document` modules: the
//! executor is just two more `DataStore` handles and an `ObjectDocumentStore`
//! driven through an explicit state enum, reusing `DataAppender::append`'s
//! `preserve_timestamp` mode and `Event::STREAM_CLOSED_EVENT_TYPE`.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::data_store::{self, DataStore};
use crate::document::{ObjectDocumentStore, StreamInformation, EMPTY_STREAM_VERSION};
use crate::error::StreamEngineError;
use crate::event::Event;

/// Tunables governing how a live migration converges before cutting over.
#[derive(Debug, Clone, Copy)]
pub struct LiveMigrationOptions {
    /// Maximum number of events read per `CopyLoop` iteration.
    pub batch_size: usize,
    /// Hard cap on `CopyLoop` iterations before forcing a quiesce.
    pub max_iterations: u32,
    /// An iteration that copies fewer than this many events is considered
    /// to have converged and proceeds to `QuiesceSource`.
    pub min_delta_threshold: usize,
}

impl Default for LiveMigrationOptions {
    fn default() -> Self {
        Self {
            batch_size: 500,
            max_iterations: 20,
            min_delta_threshold: 1,
        }
    }
}

/// Everything one live migration run needs: identity, the document it
/// migrates, the stream it migrates to, and the backend handles for both
/// sides.
pub struct LiveMigrationContext {
    /// Unique identifier for this migration run, used in logs/progress.
    pub migration_id: Uuid,
    /// Entity type name of the document being migrated.
    pub object_name: String,
    /// Entity identifier of the document being migrated.
    pub object_id: String,
    /// Freshly created, empty stream on the destination backend.
    pub target_stream: StreamInformation,
    /// Tunables for convergence and batching.
    pub options: LiveMigrationOptions,
    /// Backend the source stream currently lives on.
    pub source_data_store: Arc<dyn DataStore>,
    /// Backend the target stream is being created on.
    pub target_data_store: Arc<dyn DataStore>,
    /// Store for the document being migrated.
    pub document_store: Arc<dyn ObjectDocumentStore>,
}

/// Progress reported after each `CopyLoop` iteration.
#[derive(Debug, Clone, Copy)]
pub struct LiveMigrationProgress {
    /// 1-based iteration number.
    pub iteration: u32,
    /// Events copied in this iteration alone.
    pub events_copied_this_iteration: usize,
    /// Events copied across all iterations so far.
    pub total_events_copied: usize,
    /// Source stream's `currentStreamVersion` observed at the start of this
    /// iteration.
    pub source_version: i64,
    /// Target stream's `currentStreamVersion` after this iteration's copy.
    pub target_version: i64,
}

/// Final outcome of a live migration run.
#[derive(Debug, Clone)]
pub struct LiveMigrationResult {
    /// Whether the migration reached `Done`.
    pub success: bool,
    /// Identifier of the stream that was migrated away from.
    pub source_stream_id: String,
    /// Identifier of the stream now authoritative.
    pub target_stream_id: String,
    /// Total events copied to the target, excluding the close marker.
    pub total_events_copied: usize,
    /// Number of `CopyLoop` iterations run.
    pub iterations: u32,
    /// Failure detail, set only when `success` is false.
    pub error: Option<String>,
}

/// States of the live-migration state machine. `Failed` is reachable from
/// every other state on an unrecoverable error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationState {
    /// Not yet started.
    Init,
    /// Copying events from source to target while the source still accepts
    /// writes.
    CopyLoop,
    /// Deciding whether another `CopyLoop` pass is needed.
    ConvergenceCheck,
    /// Source document marked quiescing; new commits against it now fail.
    QuiesceSource,
    /// Draining the last events written before the quiesce took effect.
    FinalCopy,
    /// Writing the close marker and cutting the document over to target.
    CloseSource,
    /// Migration completed successfully.
    Done,
    /// Migration aborted; source remains (or was left) authoritative unless
    /// `CloseSource` had already completed.
    Failed,
}

/// Runs a live migration to completion, synchronously driving the state
/// machine end to end. `on_progress` is called after every `CopyLoop`
/// iteration, before the convergence check.
pub async fn run_live_migration(
    ctx: LiveMigrationContext,
    mut on_progress: Option<Box<dyn FnMut(LiveMigrationProgress) + Send>>,
) -> Result<LiveMigrationResult, StreamEngineError> {
    let mut state = MigrationState::Init;
    let mut target_stream = ctx.target_stream;
    let mut total_copied = 0usize;
    let mut iteration = 0u32;

    let source_stream_id;
    let target_stream_id = target_stream.stream_identifier.clone();

    let run_result: Result<(), StreamEngineError> = async {
        state = MigrationState::CopyLoop;

        loop {
            iteration += 1;

            let document = ctx
                .document_store
                .get(&ctx.object_name, &ctx.object_id)
                .await?;
            let source_stream = document.active.clone();
            let source_version_at_start = source_stream.current_stream_version;

            let copied = copy_batch(
                ctx.source_data_store.as_ref(),
                ctx.target_data_store.as_ref(),
                &source_stream,
                &mut target_stream,
                ctx.options.batch_size,
            )
            .await?;

            total_copied += copied;

            if let Some(callback) = on_progress.as_mut() {
                callback(LiveMigrationProgress {
                    iteration,
                    events_copied_this_iteration: copied,
                    total_events_copied: total_copied,
                    source_version: source_version_at_start,
                    target_version: target_stream.current_stream_version,
                });
            }

            state = MigrationState::ConvergenceCheck;

            let converged = copied < ctx.options.min_delta_threshold;
            let exhausted = iteration >= ctx.options.max_iterations;

            if converged || exhausted {
                break;
            }

            state = MigrationState::CopyLoop;
        }

        state = MigrationState::QuiesceSource;
        let mut document = ctx
            .document_store
            .get(&ctx.object_name, &ctx.object_id)
            .await?;
        document.active.quiescing = true;
        document.rehash();
        ctx.document_store.set(&document).await?;

        state = MigrationState::FinalCopy;
        let final_copied = copy_batch(
            ctx.source_data_store.as_ref(),
            ctx.target_data_store.as_ref(),
            &document.active,
            &mut target_stream,
            ctx.options.batch_size,
        )
        .await?;
        total_copied += final_copied;

        state = MigrationState::CloseSource;
        let mut source_stream = document.active.clone();
        let close_event = Event::new(String::new(), Event::STREAM_CLOSED_EVENT_TYPE);
        ctx.source_data_store
            .append(&mut source_stream, true, vec![close_event])
            .await?;

        let mut document = ctx
            .document_store
            .get(&ctx.object_name, &ctx.object_id)
            .await?;
        document.terminated_streams.push(crate::document::TerminatedStream {
            stream_identifier: source_stream.stream_identifier.clone(),
            stream_version: source_stream.current_stream_version,
            termination_date: chrono::Utc::now(),
            reason: "live-migration".to_string(),
        });
        target_stream.quiescing = false;
        document.active = target_stream.clone();
        document.rehash();
        ctx.document_store.set(&document).await?;

        state = MigrationState::Done;
        Ok(())
    }
    .await;

    source_stream_id = ctx
        .document_store
        .get(&ctx.object_name, &ctx.object_id)
        .await
        .map(|d| {
            d.terminated_streams
                .last()
                .map(|t| t.stream_identifier.clone())
                .unwrap_or_else(|| d.active.stream_identifier.clone())
        })
        .unwrap_or_default();

    match run_result {
        Ok(()) => Ok(LiveMigrationResult {
            success: true,
            source_stream_id,
            target_stream_id,
            total_events_copied: total_copied,
            iterations: iteration,
            error: None,
        }),
        Err(err) => {
            let failed_at = state;
            state = MigrationState::Failed;
            Ok(LiveMigrationResult {
                success: false,
                source_stream_id,
                target_stream_id,
                total_events_copied: total_copied,
                iterations: iteration,
                error: Some(format!("migration failed in state {failed_at:?} (now {state:?}): {err}")),
            })
        }
    }
}

/// Copies every event in `source`'s stream that is newer than `target`'s
/// current version, bounded by `batch_size`, skipping any close marker
/// (which must never reach the target). Returns how many were copied.
async fn copy_batch(
    source_store: &dyn DataStore,
    target_store: &dyn DataStore,
    source: &StreamInformation,
    target: &mut StreamInformation,
    batch_size: usize,
) -> Result<usize, StreamEngineError> {
    let start_version = target.current_stream_version + 1;

    let events = data_store::read(source_store, source, start_version, None)
        .await?
        .unwrap_or_default();

    let batch: Vec<Event> = events
        .into_iter()
        .filter(|e| !e.is_stream_closed())
        .take(batch_size)
        .collect();

    if batch.is_empty() {
        return Ok(0);
    }

    let copied = batch.len();
    target_store.append(target, true, batch).await?;
    Ok(copied)
}

/// Builds a fresh quiesce-free stream on the target backend, ready to
/// receive a migration's copied events.
#[must_use]
pub fn new_target_stream(stream_identifier: impl Into<String>, stream_type: impl Into<String>) -> StreamInformation {
    let mut stream = StreamInformation::new(stream_identifier, stream_type);
    stream.current_stream_version = EMPTY_STREAM_VERSION;
    stream
}

/// How long a caller should sleep between polling `on_progress` updates
/// when driving a migration from a separate supervisory task. Not used by
/// `run_live_migration` itself, which drives the loop synchronously.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[cfg(test)]
mod test {
    use super::*;
    use crate::data_store::InMemoryDataStore;
    use crate::document::InMemoryObjectDocumentStore;
    use crate::session::{AppendOptions, Constraint, LeasedSession};
    use crate::postcommit::PostCommitExecutor;
    use crate::event::EventTypeRegistry;
    use serde::Serialize;

    #[derive(Debug, Serialize)]
    struct Ticked;

    async fn seed_source(document_store: &Arc<InMemoryObjectDocumentStore>, data_store: &Arc<InMemoryDataStore>, count: usize) {
        let document = document_store.get_or_create("Order", "o1").await.unwrap();
        let mut session = LeasedSession::new(
            document,
            Constraint::Loose,
            Arc::new(EventTypeRegistry::new()),
            data_store.clone(),
            document_store.clone(),
            Vec::new(),
            Vec::new(),
            Vec::new(),
            PostCommitExecutor::default(),
        );

        for _ in 0..count {
            session
                .append(&Ticked, "Ticked", 1, AppendOptions::default())
                .await
                .unwrap();
        }
        session.commit().await.unwrap();
    }

    #[tokio::test]
    async fn live_migration_happy_path() {
        let document_store = Arc::new(InMemoryObjectDocumentStore::new());
        let source_data_store = Arc::new(InMemoryDataStore::new());
        let target_data_store = Arc::new(InMemoryDataStore::new());

        seed_source(&document_store, &source_data_store, 3).await;

        let target_stream = new_target_stream("order-o1-target", "memory-target");

        let ctx = LiveMigrationContext {
            migration_id: Uuid::nil(),
            object_name: "Order".to_string(),
            object_id: "o1".to_string(),
            target_stream,
            options: LiveMigrationOptions::default(),
            source_data_store: source_data_store.clone(),
            target_data_store: target_data_store.clone(),
            document_store: document_store.clone(),
        };

        let result = run_live_migration(ctx, None).await.unwrap();
        assert!(result.success);
        assert_eq!(result.total_events_copied, 3);

        let document = document_store.get("Order", "o1").await.unwrap();
        assert_eq!(document.active.stream_identifier, "order-o1-target");
        assert!(!document.active.quiescing);
        assert_eq!(document.terminated_streams.len(), 1);

        let target_events = data_store::read(target_data_store.as_ref(), &document.active, 0, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(target_events.len(), 3);
        assert_eq!(target_events.iter().map(|e| e.version).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert!(!target_events.iter().any(|e| e.is_stream_closed()));

        let terminated = &document.terminated_streams[0];
        let mut source_stream = StreamInformation::new(terminated.stream_identifier.clone(), "memory");
        source_stream.current_stream_version = terminated.stream_version;
        let source_events = data_store::read(source_data_store.as_ref(), &source_stream, 0, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(source_events.len(), 4);
        assert!(source_events.last().unwrap().is_stream_closed());
    }

    #[tokio::test]
    async fn empty_source_migrates_in_one_iteration() {
        let document_store = Arc::new(InMemoryObjectDocumentStore::new());
        let source_data_store = Arc::new(InMemoryDataStore::new());
        let target_data_store = Arc::new(InMemoryDataStore::new());

        document_store.get_or_create("Order", "o1").await.unwrap();

        let ctx = LiveMigrationContext {
            migration_id: Uuid::nil(),
            object_name: "Order".to_string(),
            object_id: "o1".to_string(),
            target_stream: new_target_stream("order-o1-target", "memory-target"),
            options: LiveMigrationOptions::default(),
            source_data_store,
            target_data_store,
            document_store,
        };

        let result = run_live_migration(ctx, None).await.unwrap();
        assert!(result.success);
        assert_eq!(result.total_events_copied, 0);
        assert_eq!(result.iterations, 1);
    }
}

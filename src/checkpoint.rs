//! Minimal projection contract: [`Foldable`] state plus a [`Checkpoint`]
//! recording the last applied event per source entity.
//!
//! The source system this crate's behavior is modeled on builds projections
//! through a deep inheritance hierarchy (`Projection`, `RoutedProjection`,
//! `Aggregate`, ...). Here that collapses to one trait, in the same spirit a
//! typical event-sourcing crate's `Aggregate::apply`/`AggregateExt::fold`
//! folds events into state without an inheritance chain -- a `Foldable` is
//! just "something that can consume an event and, optionally, a snapshot".

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::StreamEngineError;
use crate::event::Event;

/// Something that derives its state by folding a stream of events, and can
/// optionally be fast-forwarded from a snapshot blob.
pub trait Foldable {
    /// Applies one more event to this value's state.
    fn fold(&mut self, event: &Event);

    /// Restores state from a previously stored snapshot, in place of
    /// folding every event from the beginning. The default implementation
    /// does nothing, for `Foldable`s with no snapshot support.
    fn process_snapshot(&mut self, _bytes: &[u8]) -> Result<(), StreamEngineError> {
        Ok(())
    }
}

/// Identifies a source entity a checkpoint refers to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectIdentifier {
    /// Logical entity type name.
    pub object_name: String,
    /// Entity identifier.
    pub object_id: String,
}

/// Identifies a position within one stream incarnation of an entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionIdentifier {
    /// Stream incarnation identifier.
    pub stream_identifier: String,
    /// Zero-based event version.
    pub version: i64,
}

/// Map from source entity to the last event position a projection has
/// consumed from it.
#[derive(Debug, Clone, Default)]
pub struct Checkpoint {
    positions: HashMap<ObjectIdentifier, VersionIdentifier>,
}

impl Checkpoint {
    /// Builds an empty checkpoint.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the last applied position for `object`, if any.
    #[must_use]
    pub fn position_of(&self, object: &ObjectIdentifier) -> Option<&VersionIdentifier> {
        self.positions.get(object)
    }

    /// Records that `object` has been consumed up to `position`.
    pub fn advance(&mut self, object: ObjectIdentifier, position: VersionIdentifier) {
        self.positions.insert(object, position);
    }
}

/// Persists and loads [`Checkpoint`]s so a projection can resume where it
/// left off after a restart.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Loads the checkpoint previously saved under `projection_name`, or an
    /// empty one if none was ever saved.
    async fn load(&self, projection_name: &str) -> Result<Checkpoint, StreamEngineError>;

    /// Persists `checkpoint` under `projection_name`.
    async fn save(
        &self,
        projection_name: &str,
        checkpoint: &Checkpoint,
    ) -> Result<(), StreamEngineError>;
}

/// In-memory [`CheckpointStore`] reference implementation.
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    backend: tokio::sync::RwLock<HashMap<String, Checkpoint>>,
}

impl InMemoryCheckpointStore {
    /// Builds an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn load(&self, projection_name: &str) -> Result<Checkpoint, StreamEngineError> {
        let backend = self.backend.read().await;
        Ok(backend.get(projection_name).cloned().unwrap_or_default())
    }

    async fn save(
        &self,
        projection_name: &str,
        checkpoint: &Checkpoint,
    ) -> Result<(), StreamEngineError> {
        let mut backend = self.backend.write().await;
        backend.insert(projection_name.to_string(), checkpoint.clone());
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct Counter(i64);

    impl Foldable for Counter {
        fn fold(&mut self, event: &Event) {
            if event.event_type == "Incremented" {
                self.0 += 1;
            }
        }
    }

    #[test]
    fn foldable_applies_events_in_order() {
        let mut counter = Counter(0);
        let events = vec![
            Event::new("{}".to_string(), "Incremented"),
            Event::new("{}".to_string(), "Incremented"),
        ];

        for event in &events {
            counter.fold(event);
        }

        assert_eq!(counter.0, 2);
    }

    #[tokio::test]
    async fn checkpoint_store_round_trips() {
        let store = InMemoryCheckpointStore::new();
        let object = ObjectIdentifier {
            object_name: "Order".to_string(),
            object_id: "o1".to_string(),
        };

        let mut checkpoint = store.load("orders-projection").await.unwrap();
        assert!(checkpoint.position_of(&object).is_none());

        checkpoint.advance(
            object.clone(),
            VersionIdentifier {
                stream_identifier: "stream-1".to_string(),
                version: 5,
            },
        );
        store.save("orders-projection", &checkpoint).await.unwrap();

        let reloaded = store.load("orders-projection").await.unwrap();
        assert_eq!(reloaded.position_of(&object).unwrap().version, 5);
    }
}

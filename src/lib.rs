//! A pluggable event-sourcing runtime: chunked append-only streams, leased
//! commit sessions, snapshots, live backend migration, and backup/restore.
//!
//! The storage, snapshot, and tag concerns are each a separate pluggable
//! trait (see [`data_store`], [`snapshot`], [`tag_store`]) composed together
//! by [`stream::EventStream`]; writes go through a single-use
//! [`session::LeasedSession`] that enforces an optimistic-concurrency
//! constraint and schedules post-commit actions via
//! [`postcommit::PostCommitExecutor`].

#![allow(missing_docs)]

pub mod backup;
pub mod checkpoint;
pub mod data_store;
pub mod document;
pub mod error;
pub mod event;
pub mod migration;
pub mod postcommit;
pub mod session;
pub mod snapshot;
pub mod stream;
pub mod tag_store;

#[cfg(feature = "tracing")]
pub mod tracing;

pub mod version_token;

pub use error::StreamEngineError;
pub use event::{ActionMetadata, Event, EventTypeRegistry};
pub use session::LeasedSession;
pub use stream::EventStream;
pub use version_token::VersionToken;

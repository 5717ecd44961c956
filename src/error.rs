//! Central error type returned by every public operation in this crate.
//!
//! The source system this crate's behavior is modeled on scatters error kinds
//! across several independent subsystems, each with its own `thiserror` enum
//! (see e.g. the per-module errors in `event::store` and `aggregate::repository`
//! of a typical event-sourcing crate). Here the engine is a single coherent
//! surface, so the kinds are collapsed into one enum instead.

use std::fmt;

use crate::version_token::VersionToken;

/// Errors returned by the stream engine and its pluggable stores.
#[derive(Debug, thiserror::Error)]
pub enum StreamEngineError {
    /// The requested document or snapshot does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// An optimistic-concurrency conflict was detected at the stream or
    /// document layer. The caller must retry with a freshly read document.
    #[error("concurrency conflict: {0}")]
    Concurrency(#[from] ConcurrencyError),

    /// A session [`Constraint`](crate::session::Constraint) was violated.
    #[error("constraint violated: {0}")]
    Constraint(String),

    /// A version gap or out-of-order event was detected on read.
    #[error("stream integrity violated: {0}")]
    StreamIntegrity(String),

    /// An event or snapshot payload failed to encode/decode.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A retryable backend error (timeout, throttle, connection drop).
    #[error("transient backend error: {0}")]
    Transient(#[from] anyhow::Error),

    /// A document's backend configuration is missing or invalid
    /// (missing connection, invalid chunk layout, unresolved backend).
    #[error("invalid document configuration: {0}")]
    DocumentConfiguration(String),

    /// A write was rejected because the stream is being live-migrated.
    #[error("stream is migrating and rejects writes: {0}")]
    Migrating(String),

    /// A [`VersionToken`] failed to parse.
    #[error("malformed version token: {0}")]
    MalformedToken(String),

    /// The operation was cooperatively cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// A backup's checksum or shape did not match on restore/validation.
    #[error("backup validation failed: {0}")]
    BackupValidation(String),

    /// A session was used after it had already committed or failed.
    #[error("session already closed")]
    SessionClosed,
}

/// Optimistic-concurrency conflict, raised at either the stream (`DataStore`)
/// or document (`ObjectDocumentStore`) layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConcurrencyError {
    /// What was being checked when the conflict was detected.
    pub subject: ConcurrencySubject,
    /// Human-readable detail, e.g. expected/actual versions or hashes.
    pub detail: String,
}

impl fmt::Display for ConcurrencyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.subject, self.detail)
    }
}

impl std::error::Error for ConcurrencyError {}

/// What layer an optimistic-concurrency check failed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConcurrencySubject {
    /// `DataStore::append`'s version check failed.
    StreamVersion,
    /// `ObjectDocumentStore::set`'s hash/etag check failed.
    DocumentHash,
}

impl ConcurrencyError {
    /// Builds a stream-version conflict error.
    #[must_use]
    pub fn stream_version(expected: i64, actual: i64) -> Self {
        Self {
            subject: ConcurrencySubject::StreamVersion,
            detail: format!("expected version {expected}, found {actual}"),
        }
    }

    /// Builds a document-hash conflict error.
    #[must_use]
    pub fn document_hash(expected: &str, actual: &str) -> Self {
        Self {
            subject: ConcurrencySubject::DocumentHash,
            detail: format!("expected hash {expected}, found {actual}"),
        }
    }
}

impl StreamEngineError {
    /// Builds a [`StreamEngineError::NotFound`] for the given version token.
    #[must_use]
    pub fn not_found_token(token: &VersionToken) -> Self {
        Self::NotFound(crate::version_token::format_version_token(token))
    }
}

/// Convenience alias used throughout the crate's public operations.
pub type Result<T> = std::result::Result<T, StreamEngineError>;

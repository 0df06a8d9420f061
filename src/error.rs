//! Component-boundary error taxonomy.
//!
//! Internal failures are translated into one of these kinds before crossing
//! a component boundary. Nothing propagates to a caller as an unclassified
//! fault: ingestion failures mark the document failed, retrieval failures
//! downgrade the chat turn, connector failures degrade accounting reads to
//! demo data, and validation failures are rejected up front.

use thiserror::Error;

/// Failure while normalizing, fetching, or extracting a source.
///
/// Always results in a Document with `status = failed` and a human-readable
/// reason; other documents in the same batch continue unaffected.
#[derive(Debug, Error)]
pub enum IngestionError {
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("source unreachable: {0}")]
    Unreachable(String),

    #[error("payload too large: {got} bytes (limit {limit})")]
    Oversized { got: u64, limit: u64 },

    #[error("extraction failed: {0}")]
    Extraction(String),

    #[error("no usable text extracted")]
    EmptyText,

    #[error("embedding failed: {0}")]
    Embedding(String),

    #[error("storage error: {0}")]
    Storage(String),
}

/// Failure while querying the vector index.
///
/// The orchestrator treats this as "no context available" and falls back to
/// general mode with `context_used = false`; it is never user-visible.
#[derive(Debug, Error)]
#[error("retrieval failed: {0}")]
pub struct RetrievalError(pub String);

/// Failure invoking the language model.
///
/// The user's message is already persisted by the time this can occur; the
/// assistant turn is persisted with an explicit error marker instead of
/// being dropped.
#[derive(Debug, Error)]
#[error("model invocation failed: {0}")]
pub struct ModelInvocationError(pub String);

/// Failure talking to the external accounting system.
#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("endpoint unreachable: {0}")]
    Unreachable(String),

    #[error("request timed out after {0}s")]
    Timeout(u64),

    #[error("malformed response: {0}")]
    Protocol(String),

    #[error("not connected")]
    NotConnected,
}

/// Synchronous request rejection, raised before any record is created.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("malformed URL: {0}")]
    MalformedUrl(String),

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl From<sqlx::Error> for IngestionError {
    fn from(e: sqlx::Error) -> Self {
        IngestionError::Storage(e.to_string())
    }
}

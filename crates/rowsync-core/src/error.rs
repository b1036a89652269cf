//! Error types for the clone pipeline.
//!
//! [`CloneError`] is the pipeline-level taxonomy: each stage wraps its
//! first failure with context (table, chunk bounds) and the supervisor
//! reports the first non-cancellation error. [`DbError`] is what reader
//! and executor implementations return; the core never retries it —
//! transient-error retry belongs to the statement executor.

use thiserror::Error;

/// Result alias for pipeline operations.
pub type CloneResult<T> = Result<T, CloneError>;

/// Errors surfaced by [`DbReader`](crate::DbReader) and
/// [`BatchExecutor`](crate::BatchExecutor) implementations.
#[derive(Debug, Error)]
pub enum DbError {
    /// Could not obtain or keep a connection.
    #[error("connection failed: {0}")]
    Connection(String),

    /// A query failed on the server or in transit.
    #[error("query failed: {0}")]
    Query(String),

    /// A returned cell could not be decoded into a [`Value`](crate::Value).
    ///
    /// Decoding errors are fatal: the core never guesses at column types.
    #[error("decode error: {0}")]
    Decode(String),

    /// Applying a batch failed after any executor-side retries.
    #[error("execute failed: {0}")]
    Exec(String),
}

/// Errors from the clone pipeline.
#[derive(Debug, Error)]
pub enum CloneError {
    /// Ambient cancellation. Swallowed at the top of the pipeline and
    /// never logged as an error.
    #[error("clone cancelled")]
    Cancelled,

    /// Chunk generation failed or exceeded the chunking timeout. The
    /// table is either fully chunked or the pipeline fails; partial
    /// coverage is never emitted.
    #[error("chunking failed for table '{table}': {message}")]
    Chunking {
        /// Table being chunked.
        table: String,
        /// Underlying failure.
        message: String,
    },

    /// A diff-side query failed or a chunk exceeded the read timeout.
    #[error("read failed for table '{table}', chunk {chunk}: {message}")]
    Read {
        /// Table being diffed.
        table: String,
        /// Chunk bounds, e.g. `[100, 200)`.
        chunk: String,
        /// Underlying failure.
        message: String,
    },

    /// The target key-range filter is malformed (unordered, overlapping,
    /// or inverted ranges). Raised before any I/O.
    #[error("invalid shard filter: {0}")]
    InvalidFilter(String),

    /// A batch could not be applied to the target. Already-applied
    /// batches are not rolled back.
    #[error("write failed for table '{table}': {message}")]
    Write {
        /// Table being written.
        table: String,
        /// Underlying failure.
        message: String,
    },

    /// A protocol invariant was violated, e.g. a scanned row whose
    /// primary key is not an integer. Fatal; never retried.
    #[error("protocol invariant violated: {0}")]
    Protocol(String),
}

impl CloneError {
    /// True for ambient cancellation, which the supervisor swallows.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, CloneError::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_is_distinguished() {
        assert!(CloneError::Cancelled.is_cancelled());
        assert!(!CloneError::Protocol("pk mismatch".into()).is_cancelled());
    }

    #[test]
    fn errors_carry_context() {
        let err = CloneError::Read {
            table: "customers".into(),
            chunk: "[100, 200)".into(),
            message: "query failed: connection reset".into(),
        };
        let text = err.to_string();
        assert!(text.contains("customers"));
        assert!(text.contains("[100, 200)"));
    }
}

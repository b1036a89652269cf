//! # rowsync core
//!
//! Clones and continually reconciles relational tables from a source
//! database into a target database, where the target may be a sharded
//! cluster. The core is a per-table streaming pipeline of four stages
//! connected by bounded channels:
//!
//! ```text
//! ┌─────────┐      ┌────────┐      ┌─────────┐      ┌────────┐
//! │ Chunker │─────▶│ Differ │─────▶│ Batcher │─────▶│ Writer │
//! └─────────┘chunks└────────┘diffs └─────────┘batch └────────┘
//!      │               │                                 │
//!      └── reader ─────┘                          writer semaphore
//!        semaphore                                 (process-wide)
//! ```
//!
//! The chunker partitions a table's primary-key space into half-open
//! ranges; the differ merge-walks source and target rows per chunk and
//! emits a minimal edit script; the batcher groups edits by kind up to a
//! size cap; the writer applies batches to the target under a
//! process-wide admission semaphore. Source rows whose hashed sharding
//! key falls outside the configured key-range filter are rejected before
//! diffing, so rows the target cluster routes elsewhere never show up as
//! missing.
//!
//! All stages run under one supervisor per table: the first stage error
//! cancels the others, every channel is closed exactly once, and
//! cancellation is never reported as a failure.
//!
//! Database access goes through two capability traits — [`DbReader`] for
//! ordered row streams and [`BatchExecutor`] for applying batches — so
//! the core never assembles connection strings or handles dialect
//! quirks. `rowsync-connectors` provides PostgreSQL implementations;
//! [`testing::MemoryDb`] provides an in-memory one for tests.

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

pub mod batcher;
pub mod chunk;
pub mod chunker;
pub mod config;
pub mod differ;
pub mod error;
pub mod keyrange;
pub mod metrics;
pub mod pipeline;
pub mod stream;
pub mod table;
pub mod testing;
pub mod value;
pub mod writer;

pub use batcher::{batch_diffs, Batch};
pub use chunk::Chunk;
pub use config::CloneConfig;
pub use differ::{Diff, DiffKind};
pub use error::{CloneError, CloneResult, DbError};
pub use keyrange::{vhash, KeyRange, KeyRangeFilter, KeyspaceId};
pub use pipeline::{process_tables, TablePipeline, TableReport};
pub use stream::{DbReader, LimitedReader, Row, RowCursor, RowStream};
pub use table::Table;
pub use value::Value;
pub use writer::BatchExecutor;

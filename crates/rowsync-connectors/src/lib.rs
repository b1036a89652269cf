//! # rowsync connectors
//!
//! Database implementations of the `rowsync-core` capability seams:
//! [`DbReader`](rowsync_core::DbReader) for ordered row streams and
//! [`BatchExecutor`](rowsync_core::BatchExecutor) for applying write
//! batches. The core stays dialect-free; everything connection- and
//! SQL-flavor-specific lives here.

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

pub mod postgres;

pub use postgres::{PgConfig, PgExecutor, PgReader};

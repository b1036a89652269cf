//! Clone pipeline configuration.

use std::time::Duration;

use crate::keyrange::KeyRangeFilter;

/// Tuning knobs for one clone invocation.
///
/// All state is in-memory and scoped to the invocation; there is no
/// persisted checkpoint to configure.
#[derive(Debug, Clone)]
pub struct CloneConfig {
    /// Target row count per chunk.
    pub chunk_size: usize,

    /// Capacity of each inter-stage channel. Bounds per-table memory to
    /// roughly `3 * queue_size * average row size` plus in-flight
    /// batches.
    pub queue_size: usize,

    /// Maximum rows per write statement.
    pub write_batch_size: usize,

    /// Wall-clock cap on generating all chunks for one table.
    pub chunking_timeout: Duration,

    /// Wall-clock cap on diffing a single chunk.
    pub read_timeout: Duration,

    /// Key ranges owned by the target shard. The default admits every
    /// row (unsharded target).
    pub target_filter: KeyRangeFilter,

    /// Maximum concurrently diffed chunks per table. The chunker holds
    /// one of these permits while it runs.
    pub reader_concurrency: usize,

    /// Maximum concurrent batch writes, shared process-wide across all
    /// tables cloned through one [`TablePipeline`](crate::TablePipeline).
    pub writer_concurrency: usize,
}

impl Default for CloneConfig {
    fn default() -> Self {
        CloneConfig {
            chunk_size: 1000,
            queue_size: 64,
            write_batch_size: 100,
            chunking_timeout: Duration::from_secs(300),
            read_timeout: Duration::from_secs(60),
            target_filter: KeyRangeFilter::all(),
            reader_concurrency: 8,
            writer_concurrency: 16,
        }
    }
}

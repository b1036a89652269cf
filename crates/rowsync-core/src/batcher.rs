//! Grouping diffs into write batches.
//!
//! Batching amortizes write latency and keeps each apply inside the
//! target's statements-per-transaction limits; segregating by kind lets
//! every batch become a single multi-row statement. A batch never mixes
//! kinds or tables and is never empty.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::differ::{Diff, DiffKind};
use crate::error::{CloneError, CloneResult};
use crate::stream::Row;
use crate::table::Table;

/// A non-empty run of rows sharing one `(kind, table)`.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Edit kind of every row in the batch.
    pub kind: DiffKind,
    /// Table every row belongs to.
    pub table: Arc<Table>,
    /// The rows; `1 ≤ len ≤ write_batch_size`.
    pub rows: Vec<Row>,
}

/// Batches diffs for a single table, grouped by kind.
///
/// One open buffer is kept per kind; a buffer reaching `batch_size` is
/// emitted and reset. When the upstream closes, every non-empty buffer
/// is flushed. On cancellation nothing partial is emitted — the
/// supervisor is already failing the table.
///
/// # Errors
///
/// Only [`CloneError::Cancelled`].
pub async fn batch_table_diffs(
    batch_size: usize,
    mut diffs: mpsc::Receiver<Diff>,
    batches: &mpsc::Sender<Batch>,
    cancel: &CancellationToken,
) -> CloneResult<()> {
    let mut open: HashMap<DiffKind, Vec<Row>> = HashMap::new();

    loop {
        let diff = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(CloneError::Cancelled),
            diff = diffs.recv() => diff,
        };
        let Some(diff) = diff else {
            // Upstream closed: flush the unfilled buffers.
            for (kind, rows) in open {
                if !rows.is_empty() {
                    send_batch(batches, kind, rows, cancel).await?;
                }
            }
            return Ok(());
        };

        let rows = open.entry(diff.kind).or_default();
        rows.push(diff.row);
        if rows.len() >= batch_size {
            let full = std::mem::take(rows);
            send_batch(batches, diff.kind, full, cancel).await?;
        }
    }
}

/// Batches diffs spanning multiple tables, grouped by `(kind, table)`.
///
/// Same contract as [`batch_table_diffs`], for consumers that fan many
/// tables' diffs into one stream.
///
/// # Errors
///
/// Only [`CloneError::Cancelled`].
pub async fn batch_diffs(
    batch_size: usize,
    mut diffs: mpsc::Receiver<Diff>,
    batches: mpsc::Sender<Batch>,
    cancel: CancellationToken,
) -> CloneResult<()> {
    let mut open: HashMap<(DiffKind, String), Vec<Row>> = HashMap::new();

    loop {
        let diff = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(CloneError::Cancelled),
            diff = diffs.recv() => diff,
        };
        let Some(diff) = diff else {
            for ((kind, _), rows) in open {
                if !rows.is_empty() {
                    send_batch(&batches, kind, rows, &cancel).await?;
                }
            }
            return Ok(());
        };

        let key = (diff.kind, diff.row.table.name.clone());
        let rows = open.entry(key).or_default();
        rows.push(diff.row);
        if rows.len() >= batch_size {
            let full = std::mem::take(rows);
            send_batch(&batches, diff.kind, full, &cancel).await?;
        }
    }
}

async fn send_batch(
    batches: &mpsc::Sender<Batch>,
    kind: DiffKind,
    rows: Vec<Row>,
    cancel: &CancellationToken,
) -> CloneResult<()> {
    let table = Arc::clone(&rows[0].table);
    let batch = Batch { kind, table, rows };
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(CloneError::Cancelled),
        sent = batches.send(batch) => sent.map_err(|_| CloneError::Cancelled),
    }
}

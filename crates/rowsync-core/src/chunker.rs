//! Chunk generation by primary-key stride probing.
//!
//! The chunker reads only the PK column, `chunk_size + 1` rows at a
//! time. A full probe's last PK becomes the exclusive upper bound of the
//! chunk being emitted and the inclusive lower bound of the next probe;
//! a short probe means the remaining rows fit in the tail chunk. The
//! emitted chunks partition the PK domain in ascending order, and a
//! table is either fully chunked or the pipeline fails — partial
//! coverage is never emitted.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::chunk::Chunk;
use crate::error::{CloneError, CloneResult};
use crate::stream::DbReader;
use crate::table::Table;
use crate::value::Value;

/// Renders the PK-only probe starting at `start` (inclusive).
fn probe_sql(table: &Table, start: Option<i64>, limit: usize) -> String {
    let id = table.id_column();
    match start {
        None => format!("select {id} from {} order by {id} asc limit {limit}", table.name),
        Some(start) => format!(
            "select {id} from {} where {id} >= {start} order by {id} asc limit {limit}",
            table.name
        ),
    }
}

/// Generates the chunk partition of `table` onto `tx`, in ascending PK
/// order. An empty table yields a single full-table chunk.
///
/// # Errors
///
/// Probe failures surface as [`CloneError::Chunking`]; cancellation as
/// [`CloneError::Cancelled`]. No chunks beyond the failure point are
/// emitted.
pub async fn generate_chunks(
    reader: &dyn DbReader,
    table: &Arc<Table>,
    chunk_size: usize,
    tx: &mpsc::Sender<Chunk>,
    cancel: &CancellationToken,
) -> CloneResult<()> {
    // One extra row: a full probe's last PK is the first row of the
    // *next* chunk, so chunks end up with chunk_size rows each.
    let probe_limit = chunk_size + 1;
    let mut start: Option<i64> = None;

    loop {
        if cancel.is_cancelled() {
            return Err(CloneError::Cancelled);
        }

        let sql = probe_sql(table, start, probe_limit);
        let (count, last) = run_probe(reader, table, &sql).await?;

        if count == probe_limit {
            let end = last.ok_or_else(|| {
                CloneError::Protocol(format!("table '{}': probe returned no PK", table.name))
            })?;
            send_chunk(tx, Chunk { table: Arc::clone(table), start, end: Some(end) }, cancel)
                .await?;
            start = Some(end);
        } else {
            // Short probe: everything from `start` on fits in one chunk.
            // With no prior boundary this is the whole (possibly empty)
            // table.
            send_chunk(tx, Chunk { table: Arc::clone(table), start, end: None }, cancel).await?;
            tracing::debug!(table = %table.name, "chunk generation complete");
            return Ok(());
        }
    }
}

/// Runs one probe, returning the row count and the last PK seen.
async fn run_probe(
    reader: &dyn DbReader,
    table: &Arc<Table>,
    sql: &str,
) -> CloneResult<(usize, Option<i64>)> {
    let chunking_error = |message: String| CloneError::Chunking {
        table: table.name.clone(),
        message,
    };

    let mut cursor = reader
        .query(sql)
        .await
        .map_err(|e| chunking_error(e.to_string()))?;

    let mut count = 0usize;
    let mut last = None;
    while let Some(cells) = cursor
        .next_row()
        .await
        .map_err(|e| chunking_error(e.to_string()))?
    {
        let id = cells.first().and_then(Value::as_int).ok_or_else(|| {
            CloneError::Protocol(format!(
                "table '{}': probe returned a non-integer PK",
                table.name
            ))
        })?;
        count += 1;
        last = Some(id);
    }
    Ok((count, last))
}

async fn send_chunk(
    tx: &mpsc::Sender<Chunk>,
    chunk: Chunk,
    cancel: &CancellationToken,
) -> CloneResult<()> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(CloneError::Cancelled),
        sent = tx.send(chunk) => sent.map_err(|_| CloneError::Cancelled),
    }
}

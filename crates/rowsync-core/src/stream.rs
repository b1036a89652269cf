//! Row streams and the reader capability.
//!
//! [`DbReader`] is the only way the core reads a database: it takes SQL
//! text and hands back a [`RowCursor`]. A cursor owns whatever
//! connection slot backs it until dropped, so every stream is a scoped
//! acquisition released on every exit path, including cancellation.
//!
//! [`RowStream`] layers typed [`Row`]s on top of a cursor for one chunk:
//! it extracts the primary key and sharding key and enforces the
//! PK-shape invariant. [`ShardFilteredStream`] drops rows the target
//! shard does not own, and [`LimitedReader`] decorates any reader with a
//! query-admission semaphore.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use crate::chunk::Chunk;
use crate::error::{CloneError, DbError};
use crate::keyrange::KeyRangeFilter;
use crate::table::Table;
use crate::value::Value;

/// Capability for running a SELECT and streaming its rows.
///
/// Implementations handle connections and transport; the core renders
/// the SQL. Safe for concurrent use.
#[async_trait]
pub trait DbReader: Send + Sync {
    /// Runs `sql` and returns a cursor over the result rows.
    async fn query(&self, sql: &str) -> Result<Box<dyn RowCursor>, DbError>;
}

/// A streaming cursor over query results.
///
/// Dropping the cursor releases its connection slot.
#[async_trait]
pub trait RowCursor: Send {
    /// Returns the next row's cells in column order, or `None` at the
    /// end of the result set.
    async fn next_row(&mut self) -> Result<Option<Vec<Value>>, DbError>;
}

/// One scanned row.
///
/// `data[table.id_column_index]` always equals `id`; `sharding_id`
/// equals `id` when the table has no separate sharding column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    /// Owning table.
    pub table: Arc<Table>,
    /// Primary key.
    pub id: i64,
    /// Sharding key; routed through `vhash` by the shard filter.
    pub sharding_id: i64,
    /// Cells in column order.
    pub data: Vec<Value>,
}

impl Row {
    /// Builds a row from scanned cells, extracting the primary and
    /// sharding keys.
    ///
    /// # Errors
    ///
    /// Returns [`CloneError::Protocol`] when the PK or sharding cell is
    /// missing or not an integer; that is a bug in the table descriptor
    /// or the reader, never something to retry.
    pub fn from_cells(table: &Arc<Table>, data: Vec<Value>) -> Result<Row, CloneError> {
        let id = table.pk_of(&data).ok_or_else(|| {
            CloneError::Protocol(format!(
                "table '{}': cell {} is not an integer primary key",
                table.name, table.id_column_index
            ))
        })?;
        let sharding_id = match table.sharding_column_index {
            None => id,
            Some(index) => data.get(index).and_then(Value::as_int).ok_or_else(|| {
                CloneError::Protocol(format!(
                    "table '{}': cell {index} is not an integer sharding key",
                    table.name
                ))
            })?,
        };
        Ok(Row { table: Arc::clone(table), id, sharding_id, data })
    }
}

/// Renders the full-column SELECT for one chunk, ordered by PK.
#[must_use]
pub fn chunk_select_sql(chunk: &Chunk) -> String {
    let table = &chunk.table;
    format!(
        "select {} from {}{} order by {} asc",
        table.column_list(),
        table.name,
        chunk.where_clause(),
        table.id_column()
    )
}

/// A typed row stream for one chunk, in ascending PK order.
pub struct RowStream {
    table: Arc<Table>,
    chunk_label: String,
    cursor: Box<dyn RowCursor>,
}

impl RowStream {
    /// Opens the chunk's SELECT against `reader`.
    ///
    /// # Errors
    ///
    /// Query failures come back as [`CloneError::Read`] carrying the
    /// table name and chunk bounds.
    pub async fn open(reader: &dyn DbReader, chunk: &Chunk) -> Result<RowStream, CloneError> {
        let sql = chunk_select_sql(chunk);
        let cursor = reader
            .query(&sql)
            .await
            .map_err(|e| read_error(&chunk.table.name, &chunk.to_string(), &e))?;
        Ok(RowStream {
            table: Arc::clone(&chunk.table),
            chunk_label: chunk.to_string(),
            cursor,
        })
    }

    /// Returns the next row, or `None` when the chunk is exhausted.
    ///
    /// # Errors
    ///
    /// Driver errors surface as [`CloneError::Read`]; malformed rows as
    /// [`CloneError::Protocol`].
    pub async fn next(&mut self) -> Result<Option<Row>, CloneError> {
        let cells = self
            .cursor
            .next_row()
            .await
            .map_err(|e| read_error(&self.table.name, &self.chunk_label, &e))?;
        match cells {
            None => Ok(None),
            Some(data) => Row::from_cells(&self.table, data).map(Some),
        }
    }
}

fn read_error(table: &str, chunk: &str, err: &DbError) -> CloneError {
    CloneError::Read {
        table: table.to_string(),
        chunk: chunk.to_string(),
        message: err.to_string(),
    }
}

/// A row stream that rejects rows outside the target's key ranges.
///
/// Hashing the sharding key with the same fixed function the target
/// cluster routes by is what makes an unsharded source comparable
/// against one target shard: rows routed elsewhere are dropped here
/// instead of surfacing as spurious inserts.
pub struct ShardFilteredStream {
    inner: RowStream,
    filter: KeyRangeFilter,
}

impl ShardFilteredStream {
    /// Wraps `inner`, admitting only rows inside `filter`.
    #[must_use]
    pub fn new(inner: RowStream, filter: KeyRangeFilter) -> ShardFilteredStream {
        ShardFilteredStream { inner, filter }
    }

    /// Returns the next admitted row.
    ///
    /// # Errors
    ///
    /// Propagates the underlying stream's errors.
    pub async fn next(&mut self) -> Result<Option<Row>, CloneError> {
        while let Some(row) = self.inner.next().await? {
            if self.filter.admits(row.sharding_id) {
                return Ok(Some(row));
            }
        }
        Ok(None)
    }
}

/// Cumulative admission-wait counters for a [`LimitedReader`].
#[derive(Debug, Default)]
pub struct AcquireMetrics {
    /// Queries admitted through the limiter.
    pub queries: AtomicU64,
    /// Total nanoseconds spent waiting for admission.
    pub wait_ns: AtomicU64,
}

impl AcquireMetrics {
    /// Returns `(queries, total wait)` as plain numbers.
    #[must_use]
    pub fn snapshot(&self) -> (u64, u64) {
        (
            self.queries.load(Ordering::Relaxed),
            self.wait_ns.load(Ordering::Relaxed),
        )
    }
}

/// Decorates a [`DbReader`] with a query-admission semaphore.
///
/// The permit covers query admission only: it is released as soon as the
/// cursor is handed back, not held while rows are consumed. Useful for
/// capping how hard a shared source database is probed across tables.
pub struct LimitedReader {
    inner: Arc<dyn DbReader>,
    limiter: Arc<Semaphore>,
    metrics: Arc<AcquireMetrics>,
}

impl LimitedReader {
    /// Wraps `inner`, admitting at most `max_concurrent_queries` at once.
    #[must_use]
    pub fn new(inner: Arc<dyn DbReader>, max_concurrent_queries: usize) -> LimitedReader {
        LimitedReader {
            inner,
            limiter: Arc::new(Semaphore::new(max_concurrent_queries)),
            metrics: Arc::new(AcquireMetrics::default()),
        }
    }

    /// Admission-wait counters, shared with clones of this reader.
    #[must_use]
    pub fn metrics(&self) -> Arc<AcquireMetrics> {
        Arc::clone(&self.metrics)
    }
}

#[async_trait]
impl DbReader for LimitedReader {
    async fn query(&self, sql: &str) -> Result<Box<dyn RowCursor>, DbError> {
        let wait_start = Instant::now();
        let _permit = self
            .limiter
            .acquire()
            .await
            .map_err(|_| DbError::Connection("query limiter closed".into()))?;
        #[allow(clippy::cast_possible_truncation)]
        let waited = wait_start.elapsed().as_nanos() as u64;
        self.metrics.queries.fetch_add(1, Ordering::Relaxed);
        self.metrics.wait_ns.fetch_add(waited, Ordering::Relaxed);
        self.inner.query(sql).await
    }
}

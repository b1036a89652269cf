//! PostgreSQL reader and batch executor.
//!
//! [`PgReader`] streams query results through `deadpool-postgres`; each
//! cursor holds its pool slot until dropped, so the core's
//! scoped-stream contract maps directly onto pool checkout. [`PgExecutor`]
//! applies one batch per transaction and owns transient-error retry —
//! serialization failures and deadlocks are retried with backoff, hard
//! errors surface immediately.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use thiserror::Error;
use tokio_postgres::error::SqlState;
use tokio_postgres::types::{ToSql, Type};

use rowsync_core::{Batch, BatchExecutor, DbError, DbReader, DiffKind, RowCursor, Table, Value};

/// Connection and tuning settings shared by reader and executor.
#[derive(Debug, Clone)]
pub struct PgConfig {
    /// Connection string, key-value (`host=... dbname=...`) or URI form.
    pub connection_string: String,
    /// Maximum connections in the pool.
    pub max_pool_size: usize,
    /// Per-query timeout.
    pub query_timeout: Duration,
    /// Attempts per batch before a transient failure becomes fatal.
    pub max_write_attempts: u32,
    /// Base delay between write retries; scales with the attempt number.
    pub retry_backoff: Duration,
}

impl Default for PgConfig {
    fn default() -> Self {
        PgConfig {
            connection_string: String::new(),
            max_pool_size: 10,
            query_timeout: Duration::from_secs(30),
            max_write_attempts: 3,
            retry_backoff: Duration::from_millis(100),
        }
    }
}

fn build_pool(config: &PgConfig) -> Result<deadpool_postgres::Pool, DbError> {
    let pg_config: tokio_postgres::Config = config
        .connection_string
        .parse()
        .map_err(|e| DbError::Connection(format!("invalid connection string: {e}")))?;
    let mgr_config = deadpool_postgres::ManagerConfig {
        recycling_method: deadpool_postgres::RecyclingMethod::Fast,
    };
    let mgr = deadpool_postgres::Manager::from_config(pg_config, tokio_postgres::NoTls, mgr_config);
    deadpool_postgres::Pool::builder(mgr)
        .max_size(config.max_pool_size)
        .build()
        .map_err(|e| DbError::Connection(format!("pool creation failed: {e}")))
}

/// Streaming reader over a PostgreSQL pool.
pub struct PgReader {
    pool: deadpool_postgres::Pool,
    config: PgConfig,
    query_count: AtomicU64,
    error_count: AtomicU64,
}

impl PgReader {
    /// Creates a reader and its pool. Connectivity is not validated
    /// until the first query.
    ///
    /// # Errors
    ///
    /// [`DbError::Connection`] on a malformed connection string or pool
    /// build failure.
    pub fn new(config: PgConfig) -> Result<PgReader, DbError> {
        let pool = build_pool(&config)?;
        Ok(PgReader {
            pool,
            config,
            query_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
        })
    }

    /// Queries executed so far.
    #[must_use]
    pub fn query_count(&self) -> u64 {
        self.query_count.load(Ordering::Relaxed)
    }

    /// Query errors so far.
    #[must_use]
    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl DbReader for PgReader {
    async fn query(&self, sql: &str) -> Result<Box<dyn RowCursor>, DbError> {
        let client = self.pool.get().await.map_err(|e| {
            self.error_count.fetch_add(1, Ordering::Relaxed);
            DbError::Connection(format!("pool get failed: {e}"))
        })?;

        let params: Vec<&(dyn ToSql + Sync)> = Vec::new();
        let stream = tokio::time::timeout(self.config.query_timeout, client.query_raw(sql, params))
            .await
            .map_err(|_| {
                self.error_count.fetch_add(1, Ordering::Relaxed);
                DbError::Query(format!("query timed out after {:?}", self.config.query_timeout))
            })?
            .map_err(|e| {
                self.error_count.fetch_add(1, Ordering::Relaxed);
                DbError::Query(e.to_string())
            })?;

        self.query_count.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(PgRowCursor {
            stream: Box::pin(stream),
            _client: client,
        }))
    }
}

/// A cursor that owns its pool slot until dropped.
struct PgRowCursor {
    stream: Pin<Box<tokio_postgres::RowStream>>,
    // Keeps the connection checked out while rows are being consumed;
    // dropped after the stream.
    _client: deadpool_postgres::Object,
}

#[async_trait]
impl RowCursor for PgRowCursor {
    async fn next_row(&mut self) -> Result<Option<Vec<Value>>, DbError> {
        match self.stream.next().await {
            None => Ok(None),
            Some(Err(e)) => Err(DbError::Query(e.to_string())),
            Some(Ok(row)) => {
                let mut cells = Vec::with_capacity(row.len());
                for index in 0..row.len() {
                    cells.push(decode_cell(&row, index)?);
                }
                Ok(Some(cells))
            }
        }
    }
}

fn decode_cell(row: &tokio_postgres::Row, index: usize) -> Result<Value, DbError> {
    let column_type = row.columns()[index].type_();
    let decode_failure =
        |e: tokio_postgres::Error| DbError::Decode(format!("column {index}: {e}"));

    let cell = if *column_type == Type::BOOL {
        row.try_get::<_, Option<bool>>(index).map_err(decode_failure)?.map(Value::Bool)
    } else if *column_type == Type::INT2 {
        row.try_get::<_, Option<i16>>(index)
            .map_err(decode_failure)?
            .map(|v| Value::Int(i64::from(v)))
    } else if *column_type == Type::INT4 {
        row.try_get::<_, Option<i32>>(index)
            .map_err(decode_failure)?
            .map(|v| Value::Int(i64::from(v)))
    } else if *column_type == Type::INT8 {
        row.try_get::<_, Option<i64>>(index).map_err(decode_failure)?.map(Value::Int)
    } else if *column_type == Type::FLOAT4 {
        row.try_get::<_, Option<f32>>(index)
            .map_err(decode_failure)?
            .map(|v| Value::Float(f64::from(v)))
    } else if *column_type == Type::FLOAT8 {
        row.try_get::<_, Option<f64>>(index).map_err(decode_failure)?.map(Value::Float)
    } else if *column_type == Type::TEXT
        || *column_type == Type::VARCHAR
        || *column_type == Type::BPCHAR
    {
        row.try_get::<_, Option<String>>(index).map_err(decode_failure)?.map(Value::Text)
    } else if *column_type == Type::BYTEA {
        row.try_get::<_, Option<Vec<u8>>>(index).map_err(decode_failure)?.map(Value::Bytes)
    } else {
        // No untyped fallback: an unmapped column type is a fatal
        // decode error, not a guess.
        return Err(DbError::Decode(format!(
            "unsupported column type {column_type} at index {index}"
        )));
    };
    Ok(cell.unwrap_or(Value::Null))
}

/// Applies write batches to a PostgreSQL target.
pub struct PgExecutor {
    pool: deadpool_postgres::Pool,
    config: PgConfig,
}

impl PgExecutor {
    /// Creates an executor and its pool.
    ///
    /// # Errors
    ///
    /// [`DbError::Connection`] on a malformed connection string or pool
    /// build failure.
    pub fn new(config: PgConfig) -> Result<PgExecutor, DbError> {
        let pool = build_pool(&config)?;
        Ok(PgExecutor { pool, config })
    }

    async fn try_apply(&self, batch: &Batch) -> Result<(), ApplyError> {
        let mut client = self
            .pool
            .get()
            .await
            .map_err(|e| ApplyError::Pool(e.to_string()))?;
        let transaction = client.transaction().await.map_err(ApplyError::Backend)?;
        for statement in batch_statements(batch) {
            transaction
                .batch_execute(&statement)
                .await
                .map_err(ApplyError::Backend)?;
        }
        transaction.commit().await.map_err(ApplyError::Backend)
    }
}

#[async_trait]
impl BatchExecutor for PgExecutor {
    async fn exec(&self, batch: &Batch) -> Result<(), DbError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.try_apply(batch).await {
                Ok(()) => return Ok(()),
                Err(err) if attempt < self.config.max_write_attempts && err.is_transient() => {
                    tracing::warn!(
                        table = %batch.table.name,
                        kind = batch.kind.as_str(),
                        attempt,
                        error = %err,
                        "transient batch failure, retrying"
                    );
                    tokio::time::sleep(self.config.retry_backoff * attempt).await;
                }
                Err(err) => {
                    return Err(DbError::Exec(format!(
                        "{} batch of {} rows: {err}",
                        batch.kind.as_str(),
                        batch.rows.len()
                    )))
                }
            }
        }
    }
}

/// Failure applying one batch attempt.
#[derive(Debug, Error)]
enum ApplyError {
    /// Pool checkout failed; no statement ran.
    #[error("pool checkout failed: {0}")]
    Pool(String),

    /// The server or transport rejected the transaction.
    #[error(transparent)]
    Backend(tokio_postgres::Error),
}

impl ApplyError {
    /// Transient failures roll the transaction back before commit and
    /// can be replayed safely: serialization failures and deadlocks.
    fn is_transient(&self) -> bool {
        match self {
            ApplyError::Pool(_) => false,
            ApplyError::Backend(err) => matches!(
                err.code(),
                Some(&SqlState::T_R_SERIALIZATION_FAILURE)
                    | Some(&SqlState::T_R_DEADLOCK_DETECTED)
            ),
        }
    }
}

/// Renders the statement group for one batch.
fn batch_statements(batch: &Batch) -> Vec<String> {
    match batch.kind {
        DiffKind::Insert => vec![insert_statement(batch)],
        DiffKind::Delete => vec![delete_statement(batch)],
        DiffKind::Update => update_statements(&batch.table, batch),
    }
}

fn insert_statement(batch: &Batch) -> String {
    let table = &batch.table;
    let tuples: Vec<String> = batch
        .rows
        .iter()
        .map(|row| {
            let cells: Vec<String> = row.data.iter().map(render_literal).collect();
            format!("({})", cells.join(", "))
        })
        .collect();
    format!(
        "insert into {} ({}) values {}",
        table.name,
        table.column_list(),
        tuples.join(", ")
    )
}

fn delete_statement(batch: &Batch) -> String {
    let table = &batch.table;
    let ids: Vec<String> = batch.rows.iter().map(|row| row.id.to_string()).collect();
    format!(
        "delete from {} where {} in ({})",
        table.name,
        table.id_column(),
        ids.join(", ")
    )
}

/// One UPDATE per row, applied inside the batch's transaction.
fn update_statements(table: &Table, batch: &Batch) -> Vec<String> {
    batch
        .rows
        .iter()
        .map(|row| {
            let assignments: Vec<String> = table
                .column_names
                .iter()
                .enumerate()
                .filter(|(index, _)| *index != table.id_column_index)
                .map(|(index, column)| format!("{column} = {}", render_literal(&row.data[index])))
                .collect();
            format!(
                "update {} set {} where {} = {}",
                table.name,
                assignments.join(", "),
                table.id_column(),
                row.id
            )
        })
        .collect()
}

fn render_literal(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Int(i) => i.to_string(),
        Value::Float(f) => {
            if f.is_finite() {
                format!("{f}")
            } else if f.is_nan() {
                "'NaN'::float8".to_string()
            } else if *f > 0.0 {
                "'Infinity'::float8".to_string()
            } else {
                "'-Infinity'::float8".to_string()
            }
        }
        Value::Text(s) => format!("'{}'", s.replace('\'', "''")),
        Value::Bytes(bytes) => {
            let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
            format!("'\\x{hex}'")
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use rowsync_core::Row;

    fn table() -> Arc<Table> {
        Table::new("customers", vec!["id".into(), "name".into(), "score".into()], 0)
    }

    fn row(table: &Arc<Table>, id: i64, name: &str, score: f64) -> Row {
        Row {
            table: Arc::clone(table),
            id,
            sharding_id: id,
            data: vec![Value::Int(id), Value::Text(name.into()), Value::Float(score)],
        }
    }

    #[test]
    fn insert_renders_one_multirow_statement() {
        let t = table();
        let batch = Batch {
            kind: DiffKind::Insert,
            table: Arc::clone(&t),
            rows: vec![row(&t, 1, "A", 1.5), row(&t, 2, "B", 2.0)],
        };
        let statements = batch_statements(&batch);
        assert_eq!(
            statements,
            vec![
                "insert into customers (id, name, score) values (1, 'A', 1.5), (2, 'B', 2)"
                    .to_string()
            ]
        );
    }

    #[test]
    fn delete_renders_a_single_in_list() {
        let t = table();
        let batch = Batch {
            kind: DiffKind::Delete,
            table: Arc::clone(&t),
            rows: vec![row(&t, 3, "x", 0.0), row(&t, 9, "y", 0.0)],
        };
        assert_eq!(
            batch_statements(&batch),
            vec!["delete from customers where id in (3, 9)".to_string()]
        );
    }

    #[test]
    fn update_renders_per_row_and_skips_the_pk() {
        let t = table();
        let batch = Batch {
            kind: DiffKind::Update,
            table: Arc::clone(&t),
            rows: vec![row(&t, 7, "Z", 3.5)],
        };
        assert_eq!(
            batch_statements(&batch),
            vec!["update customers set name = 'Z', score = 3.5 where id = 7".to_string()]
        );
    }

    #[test]
    fn literals_escape_quotes_and_encode_bytes() {
        assert_eq!(render_literal(&Value::Text("O'Brien".into())), "'O''Brien'");
        assert_eq!(render_literal(&Value::Bytes(vec![0xde, 0xad])), "'\\xdead'");
        assert_eq!(render_literal(&Value::Null), "null");
        assert_eq!(render_literal(&Value::Bool(true)), "true");
        assert_eq!(render_literal(&Value::Float(f64::NAN)), "'NaN'::float8");
    }

    #[test]
    fn pool_errors_are_not_transient() {
        let err = ApplyError::Pool("timed out".into());
        assert!(!err.is_transient());
        assert!(err.to_string().contains("pool checkout failed"));
    }
}

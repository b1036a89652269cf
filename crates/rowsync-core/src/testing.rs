//! In-memory database doubles for tests.
//!
//! [`MemoryDb`] implements both capability seams — [`DbReader`] and
//! [`BatchExecutor`] — over plain `BTreeMap`s, so a whole clone run can
//! be exercised without a database server. The reader side interprets
//! the two SELECT shapes the core renders (PK probes and chunk
//! selects); anything else is a query error, which keeps the core
//! honest about the SQL it emits.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::batcher::Batch;
use crate::differ::DiffKind;
use crate::error::DbError;
use crate::keyrange::{vhash, KeyRange, KeyRangeFilter};
use crate::stream::{DbReader, RowCursor};
use crate::table::Table;
use crate::value::Value;
use crate::writer::BatchExecutor;

#[derive(Default)]
struct StoredTable {
    columns: Vec<String>,
    rows: BTreeMap<i64, Vec<Value>>,
}

#[derive(Default)]
struct Inner {
    tables: Mutex<HashMap<String, StoredTable>>,
    fail_queries_containing: Mutex<Option<String>>,
    fail_writes: AtomicBool,
}

/// A shared in-memory database.
///
/// Clones share state, so the same instance can serve as source,
/// target, or executor in a test.
#[derive(Clone, Default)]
pub struct MemoryDb {
    inner: Arc<Inner>,
}

impl MemoryDb {
    /// Creates an empty database.
    #[must_use]
    pub fn new() -> MemoryDb {
        MemoryDb::default()
    }

    /// Registers a table so queries and writes can resolve its columns.
    pub fn register_table(&self, table: &Table) {
        let mut tables = self.inner.tables.lock();
        tables.entry(table.name.clone()).or_insert_with(|| StoredTable {
            columns: table.column_names.clone(),
            rows: BTreeMap::new(),
        });
    }

    /// Inserts or replaces one row.
    ///
    /// # Panics
    ///
    /// Panics if the table is unregistered or the PK cell is not an
    /// integer — both are test-setup bugs.
    pub fn insert(&self, table: &Table, data: Vec<Value>) {
        let id = table.pk_of(&data).expect("test row needs an integer PK");
        let mut tables = self.inner.tables.lock();
        let stored = tables
            .get_mut(&table.name)
            .expect("table must be registered before insert");
        stored.rows.insert(id, data);
    }

    /// Returns `(id, data)` for every row, in PK order.
    #[must_use]
    pub fn rows(&self, table_name: &str) -> Vec<(i64, Vec<Value>)> {
        let tables = self.inner.tables.lock();
        tables.get(table_name).map_or_else(Vec::new, |t| {
            t.rows.iter().map(|(id, data)| (*id, data.clone())).collect()
        })
    }

    /// Number of rows currently stored.
    #[must_use]
    pub fn row_count(&self, table_name: &str) -> usize {
        let tables = self.inner.tables.lock();
        tables.get(table_name).map_or(0, |t| t.rows.len())
    }

    /// Makes every query whose SQL contains `needle` fail.
    pub fn fail_queries_containing(&self, needle: &str) {
        *self.inner.fail_queries_containing.lock() = Some(needle.to_string());
    }

    /// Makes every batch apply fail while set.
    pub fn fail_writes(&self, fail: bool) {
        self.inner.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn execute_select(&self, sql: &str) -> Result<Vec<Vec<Value>>, DbError> {
        if let Some(needle) = self.inner.fail_queries_containing.lock().as_deref() {
            if sql.contains(needle) {
                return Err(DbError::Query(format!("injected failure for '{needle}'")));
            }
        }
        let select = parse_select(sql)?;
        let tables = self.inner.tables.lock();
        let stored = tables
            .get(&select.table)
            .ok_or_else(|| DbError::Query(format!("no such table '{}'", select.table)))?;

        let projection: Vec<usize> = select
            .columns
            .iter()
            .map(|name| {
                stored
                    .columns
                    .iter()
                    .position(|c| c == name)
                    .ok_or_else(|| DbError::Query(format!("no such column '{name}'")))
            })
            .collect::<Result<_, _>>()?;

        let lower = select.pk_ge.map_or(Bound::Unbounded, Bound::Included);
        let upper = select.pk_lt.map_or(Bound::Unbounded, Bound::Excluded);
        let mut out = Vec::new();
        for data in stored.rows.range((lower, upper)).map(|(_, data)| data) {
            // Predicates beyond the PK bounds are unsupported on purpose:
            // the core never emits them.
            out.push(projection.iter().map(|&i| data[i].clone()).collect());
            if select.limit.is_some_and(|limit| out.len() >= limit) {
                break;
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl DbReader for MemoryDb {
    async fn query(&self, sql: &str) -> Result<Box<dyn RowCursor>, DbError> {
        let rows = self.execute_select(sql)?;
        Ok(Box::new(MemoryCursor { rows: rows.into() }))
    }
}

struct MemoryCursor {
    rows: VecDeque<Vec<Value>>,
}

#[async_trait]
impl RowCursor for MemoryCursor {
    async fn next_row(&mut self) -> Result<Option<Vec<Value>>, DbError> {
        Ok(self.rows.pop_front())
    }
}

#[async_trait]
impl BatchExecutor for MemoryDb {
    async fn exec(&self, batch: &Batch) -> Result<(), DbError> {
        if self.inner.fail_writes.load(Ordering::SeqCst) {
            return Err(DbError::Exec("injected write failure".into()));
        }
        let mut tables = self.inner.tables.lock();
        let stored = tables
            .get_mut(&batch.table.name)
            .ok_or_else(|| DbError::Exec(format!("no such table '{}'", batch.table.name)))?;
        for row in &batch.rows {
            match batch.kind {
                DiffKind::Insert => {
                    if stored.rows.insert(row.id, row.data.clone()).is_some() {
                        return Err(DbError::Exec(format!(
                            "duplicate key {} on insert into '{}'",
                            row.id, batch.table.name
                        )));
                    }
                }
                DiffKind::Update => {
                    stored.rows.insert(row.id, row.data.clone());
                }
                DiffKind::Delete => {
                    stored.rows.remove(&row.id);
                }
            }
        }
        Ok(())
    }
}

struct ParsedSelect {
    table: String,
    columns: Vec<String>,
    pk_ge: Option<i64>,
    pk_lt: Option<i64>,
    limit: Option<usize>,
}

/// Recognizes the statements the core renders:
/// `select <cols> from <table>[ where <pk-bounds>] order by <id> asc[ limit <n>]`.
fn parse_select(sql: &str) -> Result<ParsedSelect, DbError> {
    let bad = |what: &str| DbError::Query(format!("unsupported SQL ({what}): {sql}"));

    let rest = sql.strip_prefix("select ").ok_or_else(|| bad("not a select"))?;
    let (column_list, rest) = rest.split_once(" from ").ok_or_else(|| bad("no from"))?;
    let columns: Vec<String> = column_list.split(", ").map(str::to_string).collect();

    let (before_order, order_tail) =
        rest.split_once(" order by ").ok_or_else(|| bad("no order by"))?;
    let limit = match order_tail.split_once(" limit ") {
        None => None,
        Some((_, n)) => Some(n.trim().parse().map_err(|_| bad("bad limit"))?),
    };

    let (table, where_clause) = match before_order.split_once(" where ") {
        None => (before_order.to_string(), None),
        Some((table, clause)) => (table.to_string(), Some(clause)),
    };

    let mut pk_ge = None;
    let mut pk_lt = None;
    if let Some(clause) = where_clause {
        for predicate in clause.split(" and ") {
            if let Some((_, bound)) = predicate.split_once(" >= ") {
                pk_ge = Some(bound.trim().parse().map_err(|_| bad("bad bound"))?);
            } else if let Some((_, bound)) = predicate.split_once(" < ") {
                pk_lt = Some(bound.trim().parse().map_err(|_| bad("bad bound"))?);
            } else {
                return Err(bad("unsupported predicate"));
            }
        }
    }

    Ok(ParsedSelect { table, columns, pk_ge, pk_lt, limit })
}

/// Builds a filter admitting every sharding id except the given ones.
///
/// Carves the excluded ids' keyspace points out of the full range;
/// handy for shard-exclusion tests.
///
/// # Panics
///
/// Panics on (astronomically unlikely) hash collisions between the
/// excluded ids.
#[must_use]
pub fn filter_excluding(sharding_ids: &[i64]) -> KeyRangeFilter {
    let mut excluded: Vec<[u8; 8]> = sharding_ids.iter().map(|&id| vhash(id)).collect();
    excluded.sort_unstable();
    excluded.dedup();
    assert_eq!(excluded.len(), sharding_ids.len(), "vhash collision in test filter");

    let mut ranges = Vec::new();
    let mut cursor: Vec<u8> = Vec::new();
    for key in excluded {
        ranges.push(KeyRange::new(cursor.clone(), key.to_vec()));
        // Resume immediately after the excluded key: its 8-byte value
        // followed by a zero byte is the next key upward.
        let mut next = key.to_vec();
        next.push(0);
        cursor = next;
    }
    ranges.push(KeyRange::new(cursor, Vec::new()));
    KeyRangeFilter::new(ranges).expect("constructed ranges are ordered")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> Arc<Table> {
        Table::new("customers", vec!["id".into(), "name".into()], 0)
    }

    #[tokio::test]
    async fn chunk_select_shape_is_recognized() {
        let db = MemoryDb::new();
        let t = table();
        db.register_table(&t);
        db.insert(&t, vec![Value::Int(1), Value::Text("A".into())]);
        db.insert(&t, vec![Value::Int(2), Value::Text("B".into())]);
        db.insert(&t, vec![Value::Int(3), Value::Text("C".into())]);

        let rows = db
            .execute_select("select id, name from customers where id >= 2 and id < 3 order by id asc")
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][0], Value::Int(2));
    }

    #[tokio::test]
    async fn probe_shape_is_recognized_with_limit() {
        let db = MemoryDb::new();
        let t = table();
        db.register_table(&t);
        for id in 1..=5 {
            db.insert(&t, vec![Value::Int(id), Value::Text("x".into())]);
        }
        let rows = db
            .execute_select("select id from customers where id >= 2 order by id asc limit 2")
            .unwrap();
        assert_eq!(rows, vec![vec![Value::Int(2)], vec![Value::Int(3)]]);
    }

    #[tokio::test]
    async fn unknown_sql_is_rejected() {
        let db = MemoryDb::new();
        let err = db.execute_select("delete from customers");
        assert!(matches!(err, Err(DbError::Query(_))));
    }

    #[test]
    fn exclusion_filter_carves_out_only_the_given_ids() {
        let filter = filter_excluding(&[2, 40]);
        assert!(!filter.admits(2));
        assert!(!filter.admits(40));
        for id in [-5, 0, 1, 3, 39, 41, 1000] {
            assert!(filter.admits(id), "id {id} should be admitted");
        }
    }
}

//! Half-open primary-key chunks.
//!
//! Chunks for one table partition the PK domain: their predicates are
//! pairwise disjoint and their union covers every possible id. A missing
//! lower bound marks the first chunk, a missing upper bound the last;
//! a chunk with neither bound spans the whole table.

use std::fmt;
use std::sync::Arc;

use crate::table::Table;

/// A half-open primary-key range `[start, end)` over one table.
#[derive(Debug, Clone)]
pub struct Chunk {
    /// Table this chunk belongs to.
    pub table: Arc<Table>,
    /// Inclusive lower bound; `None` for the first chunk.
    pub start: Option<i64>,
    /// Exclusive upper bound; `None` for the last chunk.
    pub end: Option<i64>,
}

impl Chunk {
    /// True for the first chunk of a table (no lower bound).
    #[must_use]
    pub fn is_first(&self) -> bool {
        self.start.is_none()
    }

    /// True for the last chunk of a table (no upper bound).
    ///
    /// The tail chunk is unbounded above, so rows inserted after
    /// chunking began may appear in it; the clone is a best-effort
    /// snapshot and downstream replication converges the tail.
    #[must_use]
    pub fn is_last(&self) -> bool {
        self.end.is_none()
    }

    /// True when a primary key satisfies this chunk's predicate.
    #[must_use]
    pub fn contains(&self, id: i64) -> bool {
        self.start.is_none_or(|s| id >= s) && self.end.is_none_or(|e| id < e)
    }

    /// Renders the WHERE clause for this chunk's predicate, with a
    /// leading space, or an empty string for the full-table chunk.
    #[must_use]
    pub fn where_clause(&self) -> String {
        let id = self.table.id_column();
        match (self.start, self.end) {
            (None, None) => String::new(),
            (None, Some(end)) => format!(" where {id} < {end}"),
            (Some(start), None) => format!(" where {id} >= {start}"),
            (Some(start), Some(end)) => {
                format!(" where {id} >= {start} and {id} < {end}")
            }
        }
    }
}

impl fmt::Display for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.start {
            Some(start) => write!(f, "[{start}, ")?,
            None => write!(f, "[-inf, ")?,
        }
        match self.end {
            Some(end) => write!(f, "{end})"),
            None => write!(f, "+inf)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> Arc<Table> {
        Table::new("customers", vec!["id".into(), "name".into()], 0)
    }

    #[test]
    fn full_table_chunk_has_no_predicate() {
        let chunk = Chunk { table: table(), start: None, end: None };
        assert!(chunk.is_first() && chunk.is_last());
        assert_eq!(chunk.where_clause(), "");
        assert!(chunk.contains(i64::MIN) && chunk.contains(i64::MAX));
    }

    #[test]
    fn prefix_chunk_bounds_above() {
        let chunk = Chunk { table: table(), start: None, end: Some(3) };
        assert_eq!(chunk.where_clause(), " where id < 3");
        assert!(chunk.contains(2));
        assert!(!chunk.contains(3));
    }

    #[test]
    fn tail_chunk_is_unbounded_above() {
        let chunk = Chunk { table: table(), start: Some(3), end: None };
        assert_eq!(chunk.where_clause(), " where id >= 3");
        assert!(chunk.contains(3));
        assert!(chunk.contains(i64::MAX));
        assert!(!chunk.contains(2));
    }

    #[test]
    fn interior_chunk_is_half_open() {
        let chunk = Chunk { table: table(), start: Some(3), end: Some(7) };
        assert_eq!(chunk.where_clause(), " where id >= 3 and id < 7");
        assert!(chunk.contains(3) && chunk.contains(6));
        assert!(!chunk.contains(7));
    }

    #[test]
    fn display_shows_bounds() {
        let chunk = Chunk { table: table(), start: Some(3), end: None };
        assert_eq!(chunk.to_string(), "[3, +inf)");
        let chunk = Chunk { table: table(), start: None, end: Some(9) };
        assert_eq!(chunk.to_string(), "[-inf, 9)");
    }
}

//! Per-chunk source-vs-target diffing.
//!
//! For one chunk, the differ opens an ordered row stream against each
//! database — the source side behind the shard filter — and merge-walks
//! them in lock-step on the PK. Matching rows with equal data produce
//! nothing; matching rows with different data produce an update; a PK
//! present on only one side produces an insert or a delete. Diffs for
//! different chunks may interleave arbitrarily downstream.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::chunk::Chunk;
use crate::error::{CloneError, CloneResult};
use crate::keyrange::KeyRangeFilter;
use crate::stream::{DbReader, Row, RowStream, ShardFilteredStream};

/// The kind of edit a diff describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiffKind {
    /// Source row missing from the target.
    Insert,
    /// Source row whose data differs from the target's.
    Update,
    /// Target row absent from the source.
    Delete,
}

impl DiffKind {
    /// Stable label used in metrics and logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            DiffKind::Insert => "insert",
            DiffKind::Update => "update",
            DiffKind::Delete => "delete",
        }
    }
}

/// One edit that would make the target equal to the source.
///
/// Inserts and updates carry the source row; deletes carry the target
/// row being removed.
#[derive(Debug, Clone)]
pub struct Diff {
    /// Edit kind.
    pub kind: DiffKind,
    /// The row to apply.
    pub row: Row,
}

/// Diffs one chunk, emitting edits onto `tx`.
///
/// Both streams are consumed in ascending PK order; source rows outside
/// `filter` are rejected before comparison, so rows the target cluster
/// routes to other shards are never reported missing.
///
/// # Errors
///
/// Query and decode failures surface as [`CloneError::Read`] (with chunk
/// bounds) or [`CloneError::Protocol`]; cancellation as
/// [`CloneError::Cancelled`].
pub async fn diff_chunk(
    source: &dyn DbReader,
    target: &dyn DbReader,
    filter: &KeyRangeFilter,
    chunk: &Chunk,
    tx: &mpsc::Sender<Diff>,
    cancel: &CancellationToken,
) -> CloneResult<()> {
    let mut source_rows =
        ShardFilteredStream::new(RowStream::open(source, chunk).await?, filter.clone());
    let mut target_rows = RowStream::open(target, chunk).await?;

    let mut src = source_rows.next().await?;
    let mut dst = target_rows.next().await?;

    loop {
        match (src.take(), dst.take()) {
            (None, None) => return Ok(()),
            (Some(s), None) => {
                emit(tx, DiffKind::Insert, s, cancel).await?;
                src = source_rows.next().await?;
            }
            (None, Some(t)) => {
                emit(tx, DiffKind::Delete, t, cancel).await?;
                dst = target_rows.next().await?;
            }
            (Some(s), Some(t)) => {
                if s.id == t.id {
                    if s.data != t.data {
                        emit(tx, DiffKind::Update, s, cancel).await?;
                    }
                    src = source_rows.next().await?;
                    dst = target_rows.next().await?;
                } else if s.id < t.id {
                    emit(tx, DiffKind::Insert, s, cancel).await?;
                    src = source_rows.next().await?;
                    dst = Some(t);
                } else {
                    emit(tx, DiffKind::Delete, t, cancel).await?;
                    src = Some(s);
                    dst = target_rows.next().await?;
                }
            }
        }
    }
}

async fn emit(
    tx: &mpsc::Sender<Diff>,
    kind: DiffKind,
    row: Row,
    cancel: &CancellationToken,
) -> CloneResult<()> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(CloneError::Cancelled),
        sent = tx.send(Diff { kind, row }) => sent.map_err(|_| CloneError::Cancelled),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::table::Table;
    use crate::testing::{filter_excluding, MemoryDb};
    use crate::value::Value;

    fn table() -> Arc<Table> {
        Table::new("customers", vec!["id".into(), "name".into()], 0)
    }

    fn seed(db: &MemoryDb, table: &Arc<Table>, rows: &[(i64, &str)]) {
        db.register_table(table);
        for (id, name) in rows {
            db.insert(table, vec![Value::Int(*id), Value::Text((*name).to_string())]);
        }
    }

    async fn diffs_for(
        source: &MemoryDb,
        target: &MemoryDb,
        table: &Arc<Table>,
        filter: &KeyRangeFilter,
    ) -> Vec<(DiffKind, i64)> {
        let chunk = Chunk { table: Arc::clone(table), start: None, end: None };
        let (tx, mut rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        diff_chunk(source, target, filter, &chunk, &tx, &cancel)
            .await
            .unwrap();
        drop(tx);
        let mut out = Vec::new();
        while let Some(diff) = rx.recv().await {
            out.push((diff.kind, diff.row.id));
        }
        out
    }

    #[tokio::test]
    async fn equal_rows_emit_nothing() {
        let source = MemoryDb::new();
        let target = MemoryDb::new();
        let table = table();
        seed(&source, &table, &[(1, "A"), (2, "B")]);
        seed(&target, &table, &[(1, "A"), (2, "B")]);

        let diffs = diffs_for(&source, &target, &table, &KeyRangeFilter::all()).await;
        assert!(diffs.is_empty());
    }

    #[tokio::test]
    async fn missing_target_rows_become_inserts() {
        let source = MemoryDb::new();
        let target = MemoryDb::new();
        let table = table();
        seed(&source, &table, &[(1, "A"), (2, "B"), (3, "C")]);
        seed(&target, &table, &[]);

        let diffs = diffs_for(&source, &target, &table, &KeyRangeFilter::all()).await;
        assert_eq!(
            diffs,
            vec![(DiffKind::Insert, 1), (DiffKind::Insert, 2), (DiffKind::Insert, 3)]
        );
    }

    #[tokio::test]
    async fn extra_target_rows_become_deletes() {
        let source = MemoryDb::new();
        let target = MemoryDb::new();
        let table = table();
        seed(&source, &table, &[]);
        seed(&target, &table, &[(1, "A"), (2, "B")]);

        let diffs = diffs_for(&source, &target, &table, &KeyRangeFilter::all()).await;
        assert_eq!(diffs, vec![(DiffKind::Delete, 1), (DiffKind::Delete, 2)]);
    }

    #[tokio::test]
    async fn changed_data_becomes_update_carrying_source_row() {
        let source = MemoryDb::new();
        let target = MemoryDb::new();
        let table = table();
        seed(&source, &table, &[(1, "A"), (2, "Z")]);
        seed(&target, &table, &[(1, "A"), (2, "B")]);

        let chunk = Chunk { table: Arc::clone(&table), start: None, end: None };
        let (tx, mut rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        diff_chunk(&source, &target, &KeyRangeFilter::all(), &chunk, &tx, &cancel)
            .await
            .unwrap();
        drop(tx);

        let diff = rx.recv().await.unwrap();
        assert_eq!(diff.kind, DiffKind::Update);
        assert_eq!(diff.row.id, 2);
        assert_eq!(diff.row.data[1], Value::Text("Z".into()));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn mixed_edit_script() {
        let source = MemoryDb::new();
        let target = MemoryDb::new();
        let table = table();
        seed(&source, &table, &[(1, "A"), (3, "C"), (4, "D")]);
        seed(&target, &table, &[(1, "A"), (2, "B"), (3, "X")]);

        let diffs = diffs_for(&source, &target, &table, &KeyRangeFilter::all()).await;
        assert_eq!(
            diffs,
            vec![
                (DiffKind::Delete, 2),
                (DiffKind::Update, 3),
                (DiffKind::Insert, 4)
            ]
        );
    }

    #[tokio::test]
    async fn null_cells_compare_as_equal_only_to_null() {
        let source = MemoryDb::new();
        let target = MemoryDb::new();
        let table = table();
        db_seed_nullable(&source, &table, &[(1, None), (2, Some("B"))]);
        db_seed_nullable(&target, &table, &[(1, None), (2, None)]);

        let diffs = diffs_for(&source, &target, &table, &KeyRangeFilter::all()).await;
        assert_eq!(diffs, vec![(DiffKind::Update, 2)]);
    }

    fn db_seed_nullable(db: &MemoryDb, table: &Arc<Table>, rows: &[(i64, Option<&str>)]) {
        db.register_table(table);
        for (id, name) in rows {
            let cell = name.map_or(Value::Null, |n| Value::Text(n.to_string()));
            db.insert(table, vec![Value::Int(*id), cell]);
        }
    }

    #[tokio::test]
    async fn filtered_source_rows_are_not_reported_missing() {
        let source = MemoryDb::new();
        let target = MemoryDb::new();
        let table = table();
        seed(&source, &table, &[(1, "A"), (2, "B"), (3, "C")]);
        seed(&target, &table, &[(1, "A")]);

        let filter = filter_excluding(&[2]);
        let diffs = diffs_for(&source, &target, &table, &filter).await;
        assert_eq!(diffs, vec![(DiffKind::Insert, 3)]);
    }

    #[tokio::test]
    async fn chunk_predicate_restricts_the_walk() {
        let source = MemoryDb::new();
        let target = MemoryDb::new();
        let table = table();
        seed(&source, &table, &[(1, "A"), (2, "B"), (3, "C"), (4, "D")]);
        seed(&target, &table, &[]);

        let chunk = Chunk { table: Arc::clone(&table), start: Some(2), end: Some(4) };
        let (tx, mut rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        diff_chunk(&source, &target, &KeyRangeFilter::all(), &chunk, &tx, &cancel)
            .await
            .unwrap();
        drop(tx);
        let mut ids = Vec::new();
        while let Some(diff) = rx.recv().await {
            ids.push(diff.row.id);
        }
        assert_eq!(ids, vec![2, 3]);
    }
}

//! Process-global write counters.
//!
//! Two counter vectors labelled by `(table, kind)`: rows enqueued for
//! writing and rows durably applied. `enqueued >= processed` always
//! holds, with equality at successful termination. Registration is lazy
//! under a one-shot guard, so re-running the pipeline in one process
//! (tests do) reuses the same counters. Increments are lock-free; the
//! registry lock is only taken to mint a new labelled cell.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;

use crate::differ::DiffKind;

/// A counter vector labelled by `(table, kind)`.
#[derive(Debug, Default)]
pub struct CounterVec {
    cells: RwLock<HashMap<(String, DiffKind), Arc<AtomicU64>>>,
}

impl CounterVec {
    /// Returns the counter cell for a label pair, creating it on first
    /// use. Hold the returned handle to increment without re-locking.
    #[must_use]
    pub fn with_labels(&self, table: &str, kind: DiffKind) -> Arc<AtomicU64> {
        if let Some(cell) = self.cells.read().get(&(table.to_string(), kind)) {
            return Arc::clone(cell);
        }
        let mut cells = self.cells.write();
        Arc::clone(
            cells
                .entry((table.to_string(), kind))
                .or_insert_with(|| Arc::new(AtomicU64::new(0))),
        )
    }

    /// Adds `n` to the labelled counter.
    pub fn add(&self, table: &str, kind: DiffKind, n: u64) {
        self.with_labels(table, kind).fetch_add(n, Ordering::Relaxed);
    }

    /// Current value of the labelled counter.
    #[must_use]
    pub fn value(&self, table: &str, kind: DiffKind) -> u64 {
        self.cells
            .read()
            .get(&(table.to_string(), kind))
            .map_or(0, |cell| cell.load(Ordering::Relaxed))
    }

    /// Sum across kinds for one table.
    #[must_use]
    pub fn table_total(&self, table: &str) -> u64 {
        self.cells
            .read()
            .iter()
            .filter(|((t, _), _)| t == table)
            .map(|(_, cell)| cell.load(Ordering::Relaxed))
            .sum()
    }
}

/// Rows enqueued for writing, by `(table, kind)`.
pub fn writes_enqueued() -> &'static CounterVec {
    static ENQUEUED: OnceLock<CounterVec> = OnceLock::new();
    ENQUEUED.get_or_init(CounterVec::default)
}

/// Rows durably applied to the target, by `(table, kind)`.
pub fn writes_processed() -> &'static CounterVec {
    static PROCESSED: OnceLock<CounterVec> = OnceLock::new();
    PROCESSED.get_or_init(CounterVec::default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_is_idempotent() {
        let a = writes_enqueued().with_labels("metrics_test_t1", DiffKind::Insert);
        let b = writes_enqueued().with_labels("metrics_test_t1", DiffKind::Insert);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn labels_are_independent() {
        writes_enqueued().add("metrics_test_t2", DiffKind::Insert, 3);
        writes_enqueued().add("metrics_test_t2", DiffKind::Delete, 2);
        assert_eq!(writes_enqueued().value("metrics_test_t2", DiffKind::Insert), 3);
        assert_eq!(writes_enqueued().value("metrics_test_t2", DiffKind::Delete), 2);
        assert_eq!(writes_enqueued().table_total("metrics_test_t2"), 5);
    }

    #[test]
    fn unknown_labels_read_zero() {
        assert_eq!(writes_processed().value("metrics_test_never", DiffKind::Update), 0);
    }
}

//! The writer stage and the executor capability.
//!
//! The writer consumes batches and applies each one in its own subtask,
//! gated by a process-wide admission semaphore shared across every
//! table being cloned. Batches are independent transactional units and
//! may land in any order; the core treats each apply as atomic and
//! non-idempotent, so statement-level retry lives in the
//! [`BatchExecutor`] implementation, never here.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::batcher::Batch;
use crate::differ::DiffKind;
use crate::error::{CloneError, CloneResult, DbError};
use crate::metrics;

/// Capability for applying one batch to the target database.
///
/// Implementations turn the batch into its statement group (multi-row
/// INSERT, batched UPDATE by PK, DELETE ... IN) inside one transaction,
/// handle dialect quirks, and retry transient failures.
#[async_trait]
pub trait BatchExecutor: Send + Sync {
    /// Applies `batch` transactionally.
    async fn exec(&self, batch: &Batch) -> Result<(), DbError>;
}

/// Per-kind row tallies accumulated by the writer.
#[derive(Debug, Default, Clone, Copy)]
pub struct WriteTally {
    /// Rows inserted.
    pub inserts: u64,
    /// Rows updated.
    pub updates: u64,
    /// Rows deleted.
    pub deletes: u64,
}

impl WriteTally {
    fn record(&mut self, kind: DiffKind, rows: u64) {
        match kind {
            DiffKind::Insert => self.inserts += rows,
            DiffKind::Update => self.updates += rows,
            DiffKind::Delete => self.deletes += rows,
        }
    }
}

/// Applies every batch from `batches`, bounded by `limiter`.
///
/// Each batch is counted as enqueued when received, then applied in a
/// subtask holding one writer permit; successful applies count as
/// processed. The first sub-error cancels `cancel` and fails the table;
/// already-applied batches stay applied.
///
/// # Errors
///
/// [`CloneError::Write`] on the first apply failure, or
/// [`CloneError::Cancelled`].
pub async fn write_batches(
    executor: Arc<dyn BatchExecutor>,
    limiter: Arc<Semaphore>,
    mut batches: mpsc::Receiver<Batch>,
    cancel: CancellationToken,
) -> CloneResult<WriteTally> {
    let mut tally = WriteTally::default();
    let mut inflight: JoinSet<CloneResult<()>> = JoinSet::new();
    let mut first_err: Option<CloneError> = None;

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                record_err(&mut first_err, CloneError::Cancelled, &cancel);
                break;
            }
            Some(done) = inflight.join_next(), if !inflight.is_empty() => {
                if let Err(e) = flatten(done) {
                    record_err(&mut first_err, e, &cancel);
                    break;
                }
            }
            batch = batches.recv() => {
                let Some(batch) = batch else { break };
                #[allow(clippy::cast_possible_truncation)]
                let rows = batch.rows.len() as u64;
                tally.record(batch.kind, rows);
                metrics::writes_enqueued().add(&batch.table.name, batch.kind, rows);

                let permit = tokio::select! {
                    biased;
                    () = cancel.cancelled() => {
                        record_err(&mut first_err, CloneError::Cancelled, &cancel);
                        break;
                    }
                    permit = Arc::clone(&limiter).acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => {
                            record_err(&mut first_err, CloneError::Cancelled, &cancel);
                            break;
                        }
                    }
                };
                let executor = Arc::clone(&executor);
                let subtask_cancel = cancel.clone();
                inflight.spawn(async move {
                    let _permit = permit;
                    apply_batch(&*executor, &batch, &subtask_cancel).await
                });
            }
        }
    }

    while let Some(done) = inflight.join_next().await {
        if let Err(e) = flatten(done) {
            record_err(&mut first_err, e, &cancel);
        }
    }

    match first_err {
        Some(err) => Err(err),
        None => Ok(tally),
    }
}

async fn apply_batch(
    executor: &dyn BatchExecutor,
    batch: &Batch,
    cancel: &CancellationToken,
) -> CloneResult<()> {
    let applied = tokio::select! {
        biased;
        () = cancel.cancelled() => return Err(CloneError::Cancelled),
        applied = executor.exec(batch) => applied,
    };
    applied.map_err(|e| CloneError::Write {
        table: batch.table.name.clone(),
        message: e.to_string(),
    })?;
    #[allow(clippy::cast_possible_truncation)]
    let rows = batch.rows.len() as u64;
    metrics::writes_processed().add(&batch.table.name, batch.kind, rows);
    Ok(())
}

/// Keeps the first meaningful error; a real failure displaces an
/// earlier `Cancelled` and cancels the peers.
fn record_err(slot: &mut Option<CloneError>, err: CloneError, cancel: &CancellationToken) {
    if !err.is_cancelled() {
        cancel.cancel();
    }
    match slot {
        None => *slot = Some(err),
        Some(existing) if existing.is_cancelled() && !err.is_cancelled() => *slot = Some(err),
        Some(_) => {}
    }
}

fn flatten(done: Result<CloneResult<()>, tokio::task::JoinError>) -> CloneResult<()> {
    match done {
        Ok(result) => result,
        Err(join) => Err(CloneError::Protocol(format!("writer subtask failed: {join}"))),
    }
}

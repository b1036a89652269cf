//! Per-table pipeline supervision and the table dispatcher.
//!
//! [`TablePipeline::clone_table`] runs the four stages concurrently over
//! bounded channels under one child cancellation token. The first stage
//! to fail cancels the token; every other stage observes it at its next
//! channel operation, closes its output by dropping the sender, and
//! exits. The supervisor reports the first non-cancellation error and
//! logs exactly one line per table — success or failure — with
//! cumulative counters. Ambient cancellation is swallowed: it is not a
//! failure and is never logged as one.
//!
//! [`process_tables`] drives one pipeline per incoming table descriptor,
//! sequentially or with a small caller-chosen fan-out.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::batcher::{batch_table_diffs, Batch};
use crate::chunk::Chunk;
use crate::chunker::generate_chunks;
use crate::config::CloneConfig;
use crate::differ::{diff_chunk, Diff};
use crate::error::{CloneError, CloneResult};
use crate::keyrange::KeyRangeFilter;
use crate::stream::DbReader;
use crate::table::Table;
use crate::writer::{write_batches, BatchExecutor};

/// Cumulative counters for one table clone.
#[derive(Debug, Clone, Copy, Default)]
pub struct TableReport {
    /// Chunks diffed.
    pub chunks: u64,
    /// Rows enqueued as inserts.
    pub inserts: u64,
    /// Rows enqueued as updates.
    pub updates: u64,
    /// Rows enqueued as deletes.
    pub deletes: u64,
    /// Total wall-clock time.
    pub elapsed: Duration,
    /// Time spent generating chunks.
    pub chunking: Duration,
}

/// The clone engine for one source/target pair.
///
/// Cheap to clone; clones share the process-wide writer semaphore, so
/// one `TablePipeline` instance (or its clones) gives all tables a
/// single admission-control domain for writes.
#[derive(Clone)]
pub struct TablePipeline {
    source: Arc<dyn DbReader>,
    target: Arc<dyn DbReader>,
    executor: Arc<dyn BatchExecutor>,
    config: Arc<CloneConfig>,
    writer_limiter: Arc<Semaphore>,
}

impl TablePipeline {
    /// Builds a pipeline over the given reader and executor capabilities.
    #[must_use]
    pub fn new(
        source: Arc<dyn DbReader>,
        target: Arc<dyn DbReader>,
        executor: Arc<dyn BatchExecutor>,
        config: CloneConfig,
    ) -> TablePipeline {
        let writer_limiter = Arc::new(Semaphore::new(config.writer_concurrency.max(1)));
        TablePipeline {
            source,
            target,
            executor,
            config: Arc::new(config),
            writer_limiter,
        }
    }

    /// Clones one table: chunk, diff, batch, write.
    ///
    /// Returns the cumulative report on success. On ambient cancellation
    /// the error is [`CloneError::Cancelled`] and nothing is logged at
    /// error level; partial progress stays applied and is observable
    /// through the write counters.
    ///
    /// # Errors
    ///
    /// The first non-cancellation stage error, with stage context.
    #[allow(clippy::cast_possible_truncation)]
    pub async fn clone_table(
        &self,
        table: Arc<Table>,
        cancel: &CancellationToken,
    ) -> CloneResult<TableReport> {
        let started = Instant::now();
        tracing::info!(table = %table.name, "table clone started");

        let child = cancel.child_token();
        let reader_limiter = Arc::new(Semaphore::new(self.config.reader_concurrency.max(1)));
        let (chunk_tx, chunk_rx) = mpsc::channel::<Chunk>(self.config.queue_size);
        let (diff_tx, diff_rx) = mpsc::channel::<Diff>(self.config.queue_size);
        let (batch_tx, batch_rx) = mpsc::channel::<Batch>(self.config.queue_size);

        let chunker = tokio::spawn(supervised(
            child.clone(),
            chunker_stage(
                Arc::clone(&self.source),
                Arc::clone(&table),
                Arc::clone(&self.config),
                Arc::clone(&reader_limiter),
                chunk_tx,
                child.clone(),
            ),
        ));
        let differ = tokio::spawn(supervised(
            child.clone(),
            differ_stage(
                Arc::clone(&self.source),
                Arc::clone(&self.target),
                self.config.target_filter.clone(),
                self.config.read_timeout,
                reader_limiter,
                chunk_rx,
                diff_tx,
                child.clone(),
            ),
        ));
        let batcher = tokio::spawn(supervised(
            child.clone(),
            batcher_stage(self.config.write_batch_size, diff_rx, batch_tx, child.clone()),
        ));
        let writer = tokio::spawn(supervised(
            child.clone(),
            write_batches(
                Arc::clone(&self.executor),
                Arc::clone(&self.writer_limiter),
                batch_rx,
                child.clone(),
            ),
        ));

        let mut report = TableReport::default();
        let mut first_err: Option<CloneError> = None;

        match join_stage(chunker).await {
            Ok(chunking) => report.chunking = chunking,
            Err(e) => keep_first(&mut first_err, e),
        }
        match join_stage(differ).await {
            Ok(chunks) => report.chunks = chunks,
            Err(e) => keep_first(&mut first_err, e),
        }
        if let Err(e) = join_stage(batcher).await {
            keep_first(&mut first_err, e);
        }
        match join_stage(writer).await {
            Ok(tally) => {
                report.inserts = tally.inserts;
                report.updates = tally.updates;
                report.deletes = tally.deletes;
            }
            Err(e) => keep_first(&mut first_err, e),
        }
        report.elapsed = started.elapsed();

        match first_err {
            None => {
                tracing::info!(
                    table = %table.name,
                    duration_ms = report.elapsed.as_millis() as u64,
                    chunking_ms = report.chunking.as_millis() as u64,
                    chunks = report.chunks,
                    inserts = report.inserts,
                    deletes = report.deletes,
                    updates = report.updates,
                    "table clone complete"
                );
                Ok(report)
            }
            Some(err) if err.is_cancelled() => Err(err),
            Some(err) => {
                tracing::error!(
                    table = %table.name,
                    error = %err,
                    chunks = report.chunks,
                    inserts = report.inserts,
                    deletes = report.deletes,
                    updates = report.updates,
                    "table clone failed"
                );
                Err(err)
            }
        }
    }
}

/// Wraps a stage so its failure cancels the sibling stages.
fn supervised<T>(
    cancel: CancellationToken,
    stage: impl Future<Output = CloneResult<T>>,
) -> impl Future<Output = CloneResult<T>> {
    async move {
        let result = stage.await;
        if let Err(err) = &result {
            if !err.is_cancelled() {
                cancel.cancel();
            }
        }
        result
    }
}

async fn join_stage<T>(handle: tokio::task::JoinHandle<CloneResult<T>>) -> CloneResult<T> {
    handle.await.map_err(join_failure)?
}

fn join_failure(err: JoinError) -> CloneError {
    CloneError::Protocol(format!("pipeline stage failed: {err}"))
}

fn keep_first(slot: &mut Option<CloneError>, err: CloneError) {
    match slot {
        None => *slot = Some(err),
        Some(existing) if existing.is_cancelled() && !err.is_cancelled() => *slot = Some(err),
        Some(_) => {}
    }
}

/// Chunker stage: hold one reader permit for the whole generation run,
/// bounded by the chunking timeout. Returns the chunking duration.
async fn chunker_stage(
    source: Arc<dyn DbReader>,
    table: Arc<Table>,
    config: Arc<CloneConfig>,
    reader_limiter: Arc<Semaphore>,
    chunk_tx: mpsc::Sender<Chunk>,
    cancel: CancellationToken,
) -> CloneResult<Duration> {
    let started = Instant::now();
    let _permit = tokio::select! {
        biased;
        () = cancel.cancelled() => return Err(CloneError::Cancelled),
        permit = reader_limiter.acquire() => permit.map_err(|_| CloneError::Cancelled)?,
    };

    let generated = tokio::time::timeout(
        config.chunking_timeout,
        generate_chunks(&*source, &table, config.chunk_size, &chunk_tx, &cancel),
    )
    .await;
    match generated {
        Err(_) => Err(CloneError::Chunking {
            table: table.name.clone(),
            message: format!(
                "chunk generation exceeded {}ms",
                config.chunking_timeout.as_millis()
            ),
        }),
        Ok(result) => result.map(|()| started.elapsed()),
    }
}

/// Differ stage: fan chunks out to per-chunk subtasks, each under one
/// reader permit and the read timeout. Returns the chunk count.
#[allow(clippy::too_many_arguments)]
async fn differ_stage(
    source: Arc<dyn DbReader>,
    target: Arc<dyn DbReader>,
    filter: KeyRangeFilter,
    read_timeout: Duration,
    reader_limiter: Arc<Semaphore>,
    mut chunk_rx: mpsc::Receiver<Chunk>,
    diff_tx: mpsc::Sender<Diff>,
    cancel: CancellationToken,
) -> CloneResult<u64> {
    let mut inflight: JoinSet<CloneResult<()>> = JoinSet::new();
    let mut chunks = 0u64;
    let mut first_err: Option<CloneError> = None;

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                keep_first(&mut first_err, CloneError::Cancelled);
                break;
            }
            Some(done) = inflight.join_next(), if !inflight.is_empty() => {
                if let Err(e) = done.map_err(join_failure).and_then(|r| r) {
                    if !e.is_cancelled() {
                        cancel.cancel();
                    }
                    keep_first(&mut first_err, e);
                    break;
                }
            }
            chunk = chunk_rx.recv() => {
                let Some(chunk) = chunk else { break };
                chunks += 1;

                let permit = tokio::select! {
                    biased;
                    () = cancel.cancelled() => {
                        keep_first(&mut first_err, CloneError::Cancelled);
                        break;
                    }
                    permit = Arc::clone(&reader_limiter).acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => {
                            keep_first(&mut first_err, CloneError::Cancelled);
                            break;
                        }
                    }
                };

                let source = Arc::clone(&source);
                let target = Arc::clone(&target);
                let filter = filter.clone();
                let diff_tx = diff_tx.clone();
                let subtask_cancel = cancel.clone();
                inflight.spawn(async move {
                    let _permit = permit;
                    diff_chunk_deadline(
                        &*source,
                        &*target,
                        &filter,
                        read_timeout,
                        chunk,
                        &diff_tx,
                        &subtask_cancel,
                    )
                    .await
                });
            }
        }
    }

    while let Some(done) = inflight.join_next().await {
        if let Err(e) = done.map_err(join_failure).and_then(|r| r) {
            if !e.is_cancelled() {
                cancel.cancel();
            }
            keep_first(&mut first_err, e);
        }
    }

    match first_err {
        Some(err) => Err(err),
        None => {
            tracing::debug!(chunks, "chunk diffing complete");
            Ok(chunks)
        }
    }
}

async fn diff_chunk_deadline(
    source: &dyn DbReader,
    target: &dyn DbReader,
    filter: &KeyRangeFilter,
    read_timeout: Duration,
    chunk: Chunk,
    diff_tx: &mpsc::Sender<Diff>,
    cancel: &CancellationToken,
) -> CloneResult<()> {
    let diffed = tokio::time::timeout(
        read_timeout,
        diff_chunk(source, target, filter, &chunk, diff_tx, cancel),
    )
    .await;
    match diffed {
        Err(_) => Err(CloneError::Read {
            table: chunk.table.name.clone(),
            chunk: chunk.to_string(),
            message: format!("chunk diff exceeded {}ms", read_timeout.as_millis()),
        }),
        Ok(result) => result,
    }
}

async fn batcher_stage(
    write_batch_size: usize,
    diff_rx: mpsc::Receiver<Diff>,
    batch_tx: mpsc::Sender<Batch>,
    cancel: CancellationToken,
) -> CloneResult<()> {
    batch_table_diffs(write_batch_size, diff_rx, &batch_tx, &cancel).await
}

/// Clones every table arriving on `tables` until the channel closes.
///
/// `fanout` bounds how many tables are cloned concurrently; `1` means
/// strictly sequential. The first table failure cancels the rest and is
/// returned; ambient cancellation is a clean exit.
///
/// # Errors
///
/// The first non-cancellation table error.
pub async fn process_tables(
    pipeline: &TablePipeline,
    mut tables: mpsc::Receiver<Arc<Table>>,
    fanout: usize,
    cancel: &CancellationToken,
) -> CloneResult<()> {
    let fanout = fanout.max(1);
    let child = cancel.child_token();
    let mut running: JoinSet<CloneResult<TableReport>> = JoinSet::new();
    let mut first_err: Option<CloneError> = None;

    'accept: loop {
        while running.len() >= fanout {
            let Some(done) = running.join_next().await else { break };
            if let Err(e) = done.map_err(join_failure).and_then(|r| r.map(|_| ())) {
                if !e.is_cancelled() {
                    child.cancel();
                }
                keep_first(&mut first_err, e);
                break 'accept;
            }
        }

        let table = tokio::select! {
            biased;
            () = child.cancelled() => break,
            table = tables.recv() => table,
        };
        let Some(table) = table else { break };

        let pipeline = pipeline.clone();
        let table_cancel = child.clone();
        running.spawn(async move { pipeline.clone_table(table, &table_cancel).await });
    }

    while let Some(done) = running.join_next().await {
        if let Err(e) = done.map_err(join_failure).and_then(|r| r.map(|_| ())) {
            if !e.is_cancelled() {
                child.cancel();
            }
            keep_first(&mut first_err, e);
        }
    }

    match first_err {
        Some(err) if !err.is_cancelled() => Err(err),
        _ => Ok(()),
    }
}

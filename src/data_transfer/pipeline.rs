//! Bounded read -> transform -> write pipeline.
//!
//! One reader task feeds a raw queue, a pool of transform workers turns raw
//! rows into batches, and one or more writers drain the batch queue, each on
//! its own connection. Both queues are bounded so a slow target applies
//! backpressure all the way to the source.

use crate::config::PipelineSettings;
use crate::data_transfer::engine::{log_skip, process_row, CancelSignal, MigrationRun};
use crate::data_transfer::loader::{load_batch, BatchOutcome, BatchWriter, PendingRow};
use crate::data_transfer::lookup::LookupContext;
use crate::data_transfer::migration::TableMigration;
use crate::data_transfer::models::{RunCounters, RunState, SkipRecord};
use crate::data_transfer::transform::TransformContext;
use crate::db_types::ColumnReader;
use crate::error::MigrationError;
use futures::future::join_all;
use futures::{Stream, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct TallyState {
    counters: RunCounters,
    skips: Vec<(u64, SkipRecord)>,
    duplicates: Vec<SkipRecord>,
    first_error: Option<MigrationError>,
}

/// Counters shared by every stage. The first fatal error wins.
#[derive(Default)]
struct SharedTally {
    processed: AtomicU64,
    state: Mutex<TallyState>,
}

impl SharedTally {
    fn lock(&self) -> std::sync::MutexGuard<'_, TallyState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record_skip(&self, table: &str, ordinal: u64, skip: SkipRecord) {
        log_skip(table, &skip);
        let mut state = self.lock();
        if skip.kind.is_error() {
            state.counters.errored += 1;
        } else {
            state.counters.skipped += 1;
        }
        state.skips.push((ordinal, skip));
    }

    fn apply(&self, table: &str, outcome: BatchOutcome) -> u64 {
        let mut state = self.lock();
        state.counters.inserted += outcome.inserted;
        state.counters.updated += outcome.updated;
        state.counters.superseded += outcome.superseded;
        state.counters.migrated += outcome.migrated();
        for duplicate in outcome.duplicates {
            log_skip(table, &duplicate);
            state.counters.skipped += 1;
            state.duplicates.push(duplicate);
        }
        state.counters.migrated
    }

    fn fail(&self, error: MigrationError) {
        let mut state = self.lock();
        if state.first_error.is_none() {
            state.first_error = Some(error);
        }
    }

    fn take_parts(&self) -> (RunCounters, Vec<SkipRecord>, Option<MigrationError>) {
        let processed = self.processed.load(Ordering::SeqCst);
        let state = std::mem::take(&mut *self.lock());
        let mut counters = state.counters;
        counters.processed = processed;

        let mut skips = state.skips;
        skips.sort_by_key(|(ordinal, _)| *ordinal);
        let mut records: Vec<SkipRecord> = skips.into_iter().map(|(_, skip)| skip).collect();
        records.extend(state.duplicates);
        (counters, records, state.first_error)
    }
}

/// Worker and writer counts actually used. Ordered tables collapse to one of
/// each so batches reach the target in source order.
pub fn effective_parallelism(ordered: bool, settings: &PipelineSettings, available_writers: usize) -> (usize, usize) {
    if ordered {
        return (1, available_writers.min(1));
    }
    (
        settings.transform_workers.max(1),
        settings.writers.max(1).min(available_writers),
    )
}

async fn send_batch(
    tx: &mpsc::Sender<Vec<PendingRow>>,
    batch: Vec<PendingRow>,
    token: &CancellationToken,
) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        sent = tx.send(batch) => sent.is_ok(),
    }
}

#[allow(clippy::too_many_arguments)]
async fn transform_worker<M, R>(
    worker: usize,
    migration: M,
    lookups: Arc<LookupContext>,
    run_started_at: chrono::DateTime<chrono::Utc>,
    batch_size: usize,
    raw_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<(u64, R)>>>,
    batch_tx: mpsc::Sender<Vec<PendingRow>>,
    tally: Arc<SharedTally>,
    token: CancellationToken,
) where
    M: TableMigration,
    R: ColumnReader + Send + 'static,
{
    let table = migration.target().name;
    let ctx = TransformContext::new(&lookups, run_started_at);
    let mut batch: Vec<PendingRow> = Vec::with_capacity(batch_size);

    loop {
        let next = {
            let mut rx = raw_rx.lock().await;
            tokio::select! {
                _ = token.cancelled() => None,
                item = rx.recv() => item,
            }
        };
        let (ordinal, row) = match next {
            Some(item) => item,
            None => break,
        };

        match process_row(&migration, &ctx, &row, ordinal) {
            Ok(pending) => {
                batch.push(pending);
                if batch.len() >= batch_size {
                    let full = std::mem::replace(&mut batch, Vec::with_capacity(batch_size));
                    if !send_batch(&batch_tx, full, &token).await {
                        return;
                    }
                }
            }
            Err(skip) => tally.record_skip(table, ordinal, skip),
        }
    }

    if !batch.is_empty() && !token.is_cancelled() {
        send_batch(&batch_tx, batch, &token).await;
    }
    log::debug!("[{}] Transform worker {} finished", table, worker);
}

/// Runs one table through the pipeline. Counters and skips are merged into
/// `run` whether or not the pipeline succeeds.
pub async fn run_pipeline<M, S, R>(
    migration: &M,
    run: &mut MigrationRun,
    lookups: Arc<LookupContext>,
    mut rows: S,
    writers: &mut [Box<dyn BatchWriter + '_>],
    settings: &PipelineSettings,
    cancel: &CancelSignal,
) -> Result<(), MigrationError>
where
    M: TableMigration + Clone,
    S: Stream<Item = Result<R, String>> + Unpin + Send,
    R: ColumnReader + Send + 'static,
{
    run.advance(RunState::Streaming)?;

    let table = migration.target();
    let ordered = migration.is_ordered();
    let (worker_count, writer_count) = effective_parallelism(ordered, settings, writers.len());
    if writer_count == 0 {
        return Err(MigrationError::Configuration(
            "At least one batch writer is required".to_string(),
        ));
    }
    log::info!(
        "[{}] Pipeline: {} transform workers, {} writers, queues {}/{}",
        table.name,
        worker_count,
        writer_count,
        settings.raw_queue_capacity,
        settings.write_queue_capacity
    );

    let token = cancel.token().child_token();
    let tally = Arc::new(SharedTally::default());
    let batch_size = run.batch_size();
    let run_started_at = run.report().started_at;

    let (raw_tx, raw_rx) = mpsc::channel::<(u64, R)>(settings.raw_queue_capacity.max(1));
    let (batch_tx, batch_rx) = mpsc::channel::<Vec<PendingRow>>(settings.write_queue_capacity.max(1));
    let raw_rx = Arc::new(tokio::sync::Mutex::new(raw_rx));

    let handles: Vec<_> = (0..worker_count)
        .map(|worker| {
            tokio::spawn(transform_worker(
                worker,
                migration.clone(),
                lookups.clone(),
                run_started_at,
                batch_size,
                raw_rx.clone(),
                batch_tx.clone(),
                tally.clone(),
                token.clone(),
            ))
        })
        .collect();
    drop(batch_tx);

    let reader = {
        let tally = tally.clone();
        let token = token.clone();
        async move {
            let mut ordinal = 0u64;
            loop {
                let next = tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    next = rows.next() => next,
                };
                let row = match next {
                    Some(Ok(row)) => row,
                    Some(Err(e)) => {
                        tally.fail(MigrationError::Source(e));
                        token.cancel();
                        break;
                    }
                    None => break,
                };
                ordinal += 1;
                tally.processed.fetch_add(1, Ordering::SeqCst);
                let sent = tokio::select! {
                    _ = token.cancelled() => false,
                    sent = raw_tx.send((ordinal, row)) => sent.is_ok(),
                };
                if !sent {
                    break;
                }
            }
            drop(raw_tx);
        }
    };

    let workers_done = {
        let tally = tally.clone();
        let token = token.clone();
        async move {
            for result in join_all(handles).await {
                if let Err(e) = result {
                    tally.fail(MigrationError::batch_load(
                        table.name,
                        format!("Transform worker failed: {}", e),
                    ));
                    token.cancel();
                }
            }
        }
    };

    let batch_rx = tokio::sync::Mutex::new(batch_rx);
    let writers_done = join_all(writers.iter_mut().take(writer_count).map(|writer| {
        let tally = &tally;
        let token = &token;
        let batch_rx = &batch_rx;
        async move {
            loop {
                let next = {
                    let mut rx = batch_rx.lock().await;
                    tokio::select! {
                        _ = token.cancelled() => None,
                        batch = rx.recv() => batch,
                    }
                };
                let batch = match next {
                    Some(batch) => batch,
                    None => break,
                };
                match load_batch(writer.as_mut(), table, batch, ordered).await {
                    Ok(outcome) => {
                        let migrated = tally.apply(table.name, outcome);
                        log::info!(
                            "[{}] Processed {} rows, migrated {}",
                            table.name,
                            tally.processed.load(Ordering::SeqCst),
                            migrated
                        );
                    }
                    Err(e) => {
                        tally.fail(e);
                        token.cancel();
                        break;
                    }
                }
            }
        }
    }));

    tokio::join!(reader, workers_done, writers_done);

    let (counters, skips, first_error) = tally.take_parts();
    run.absorb(counters, skips);

    if let Some(error) = first_error {
        return Err(error);
    }
    if cancel.is_cancelled() {
        return Err(cancel.error());
    }
    run.advance(RunState::Draining)
}

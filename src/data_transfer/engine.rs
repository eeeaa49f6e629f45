use crate::data_transfer::connection_resolver::ResolvedConnections;
use crate::data_transfer::loader::{load_batch, BatchOutcome, BatchWriter, DiscardWriter, PendingRow};
use crate::data_transfer::lookup::{build_lookups, LookupContext, LookupSpec, LookupStore};
use crate::data_transfer::migration::{TableMigration, TargetRow};
use crate::data_transfer::models::{
    RunCounters, RunOptions, RunReport, RunState, SkipKind, SkipReason, SkipRecord, TargetTable,
};
use crate::data_transfer::pipeline;
use crate::data_transfer::sink::StatsReporter;
use crate::data_transfer::transform::TransformContext;
use crate::db_types::ColumnReader;
use crate::error::MigrationError;
use crate::{mssql, postgres};
use chrono::Utc;
use futures::{Stream, StreamExt};
use sqlx::{Connection, PgConnection};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// --- Cancellation ---

/// Run-scoped cancellation: a child of the process shutdown token plus an
/// optional wall-clock deadline that trips the same token.
pub struct CancelSignal {
    token: CancellationToken,
    finished: CancellationToken,
    timed_out: Arc<AtomicBool>,
    max_duration: Option<Duration>,
}

impl CancelSignal {
    pub fn new(shutdown: &CancellationToken, max_duration: Option<Duration>) -> Self {
        let token = shutdown.child_token();
        let finished = CancellationToken::new();
        let timed_out = Arc::new(AtomicBool::new(false));

        if let Some(limit) = max_duration {
            let token = token.clone();
            let finished = finished.clone();
            let timed_out = timed_out.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = finished.cancelled() => {}
                    _ = tokio::time::sleep(limit) => {
                        log::warn!("Maximum run duration of {:?} reached, cancelling", limit);
                        timed_out.store(true, Ordering::SeqCst);
                        token.cancel();
                    }
                }
            });
        }

        Self {
            token,
            finished,
            timed_out,
            max_duration,
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    pub fn error(&self) -> MigrationError {
        if self.timed_out.load(Ordering::SeqCst) {
            MigrationError::TimedOut(self.max_duration.map(|d| d.as_secs()).unwrap_or(0))
        } else {
            MigrationError::Cancelled
        }
    }

    /// Stops the deadline timer once the run no longer needs it.
    pub fn disarm(&self) {
        self.finished.cancel();
    }
}

impl Drop for CancelSignal {
    fn drop(&mut self) {
        self.finished.cancel();
    }
}

// --- Row Processing ---

/// Decodes and transforms one source row. `ordinal` is the 1-based read
/// position, used as the record id when the row cannot even be decoded.
pub fn process_row<M: TableMigration>(
    migration: &M,
    ctx: &TransformContext<'_>,
    row: &dyn ColumnReader,
    ordinal: u64,
) -> Result<PendingRow, SkipRecord> {
    let source = migration.decode(row).map_err(|e| {
        SkipRecord::new(
            format!("row #{}", ordinal),
            SkipReason::new(SkipKind::TransformError, format!("Failed to decode source row: {}", e)),
        )
    })?;
    let record_id = migration.record_id(&source);

    let target = migration
        .transform(&source, ctx)
        .map_err(|reason| SkipRecord::new(record_id.clone(), reason))?;
    let key = target.key();
    let key_columns = migration.target().key_columns.len();
    if key.arity() != key_columns {
        return Err(SkipRecord::new(
            record_id,
            SkipReason::new(
                SkipKind::TransformError,
                format!("Key {} has {} parts but the table has {} key columns", key, key.arity(), key_columns),
            ),
        ));
    }

    Ok(PendingRow {
        record_id,
        ordering: migration.ordering_key(&source),
        key,
        values: target.values(),
    })
}

pub(crate) fn log_skip(table: &str, skip: &SkipRecord) {
    if skip.kind.is_error() {
        log::error!("[{}] {}: Skipped - {}", table, skip.record_id, skip.reason);
    } else {
        log::warn!("[{}] {}: Skipped - {}", table, skip.record_id, skip.reason);
    }
}

// --- Run Controller ---

pub struct MigrationRun {
    report: RunReport,
    batch_size: usize,
}

impl MigrationRun {
    pub fn new(table: &str, batch_size: usize, dry_run: bool) -> Self {
        let mut report = RunReport::new(table);
        report.dry_run = dry_run;
        Self {
            report,
            batch_size: batch_size.max(1),
        }
    }

    pub fn state(&self) -> RunState {
        self.report.state
    }

    pub fn report(&self) -> &RunReport {
        &self.report
    }

    pub fn counters(&self) -> &RunCounters {
        &self.report.counters
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn advance(&mut self, next: RunState) -> Result<(), MigrationError> {
        let current = self.report.state;
        if !current.can_transition_to(next) {
            return Err(MigrationError::InvalidTransition {
                from: current.to_string(),
                to: next.to_string(),
            });
        }
        log::debug!("[{}] Run state {} -> {}", self.report.table, current, next);
        self.report.state = next;
        Ok(())
    }

    pub async fn load_lookups(
        &mut self,
        specs: &[LookupSpec],
        target: &mut dyn LookupStore,
        source: &mut dyn LookupStore,
    ) -> Result<LookupContext, MigrationError> {
        if self.report.state != RunState::NotStarted {
            return Err(MigrationError::InvalidTransition {
                from: self.report.state.to_string(),
                to: RunState::LookupsLoaded.to_string(),
            });
        }
        let lookups = build_lookups(specs, target, source).await?;
        let sizes: Vec<String> = specs
            .iter()
            .map(|spec| format!("{}={}", spec.name, lookups.len_of(spec.name)))
            .collect();
        log::info!("[{}] Lookups loaded: {}", self.report.table, sizes.join(", "));
        self.advance(RunState::LookupsLoaded)?;
        Ok(lookups)
    }

    pub fn record_skip(&mut self, skip: SkipRecord) {
        log_skip(&self.report.table, &skip);
        if skip.kind.is_error() {
            self.report.counters.errored += 1;
        } else {
            self.report.counters.skipped += 1;
        }
        self.report.skip_details.push(skip);
    }

    pub(crate) fn apply_outcome(&mut self, outcome: BatchOutcome) {
        let counters = &mut self.report.counters;
        counters.inserted += outcome.inserted;
        counters.updated += outcome.updated;
        counters.superseded += outcome.superseded;
        counters.migrated += outcome.migrated();
        for duplicate in outcome.duplicates {
            self.record_skip(duplicate);
        }
    }

    /// Merges tallies gathered outside the run, e.g. by the pipeline.
    pub(crate) fn absorb(&mut self, counters: RunCounters, skips: Vec<SkipRecord>) {
        let own = &mut self.report.counters;
        own.processed += counters.processed;
        own.migrated += counters.migrated;
        own.skipped += counters.skipped;
        own.errored += counters.errored;
        own.inserted += counters.inserted;
        own.updated += counters.updated;
        own.superseded += counters.superseded;
        self.report.skip_details.extend(skips);
    }

    async fn flush<W>(
        &mut self,
        writer: &mut W,
        table: &TargetTable,
        batch: &mut Vec<PendingRow>,
        ordered: bool,
    ) -> Result<(), MigrationError>
    where
        W: BatchWriter + ?Sized,
    {
        if batch.is_empty() {
            return Ok(());
        }
        let rows = std::mem::take(batch);
        let outcome = load_batch(writer, table, rows, ordered).await?;
        self.apply_outcome(outcome);
        log::info!(
            "[{}] Processed {} rows, migrated {}",
            table.name,
            self.report.counters.processed,
            self.report.counters.migrated
        );
        Ok(())
    }

    /// Single-task streaming: read, transform, batch and flush in lockstep.
    pub async fn stream<M, S, R, W>(
        &mut self,
        migration: &M,
        ctx: &TransformContext<'_>,
        mut rows: S,
        writer: &mut W,
        cancel: &CancelSignal,
    ) -> Result<(), MigrationError>
    where
        M: TableMigration,
        S: Stream<Item = Result<R, String>> + Unpin,
        R: ColumnReader,
        W: BatchWriter + ?Sized,
    {
        self.advance(RunState::Streaming)?;
        let table = migration.target();
        let ordered = migration.is_ordered();
        let mut batch: Vec<PendingRow> = Vec::with_capacity(self.batch_size);

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(cancel.error()),
                next = rows.next() => next,
            };
            let row = match next {
                Some(row) => row.map_err(MigrationError::Source)?,
                None => break,
            };

            self.report.counters.processed += 1;
            match process_row(migration, ctx, &row, self.report.counters.processed) {
                Ok(pending) => {
                    batch.push(pending);
                    if batch.len() >= self.batch_size {
                        self.flush(writer, table, &mut batch, ordered).await?;
                    }
                }
                Err(skip) => self.record_skip(skip),
            }
        }

        self.advance(RunState::Draining)?;
        if cancel.is_cancelled() {
            return Err(cancel.error());
        }
        self.flush(writer, table, &mut batch, ordered).await
    }

    /// Draining -> Reporting -> Done. The returned report is what the
    /// reporter receives.
    pub fn finish(&mut self) -> Result<RunReport, MigrationError> {
        self.advance(RunState::Reporting)?;
        self.report.finished_at = Some(Utc::now());
        if !self.report.counters.is_balanced() {
            log::warn!(
                "[{}] Counters do not balance: processed={} migrated={} skipped={} errored={}",
                self.report.table,
                self.report.counters.processed,
                self.report.counters.migrated,
                self.report.counters.skipped,
                self.report.counters.errored
            );
        }
        self.advance(RunState::Done)?;
        Ok(self.report.clone())
    }

    /// Moves a non-terminal run to Failed, keeping the partial counters.
    pub fn fail(&mut self, error: &MigrationError) -> RunReport {
        if !self.report.state.is_terminal() {
            self.report.state = RunState::Failed;
        }
        self.report.error = Some(error.to_string());
        self.report.finished_at = Some(Utc::now());
        self.report.clone()
    }
}

// --- Loading Strategy ---

/// Streams `rows` through either the single-task loop or the parallel
/// pipeline, depending on the run options.
pub async fn load_rows<M, S, R>(
    migration: &M,
    run: &mut MigrationRun,
    lookups: LookupContext,
    rows: S,
    writers: &mut [Box<dyn BatchWriter + '_>],
    options: &RunOptions,
    cancel: &CancelSignal,
) -> Result<(), MigrationError>
where
    M: TableMigration + Clone,
    S: Stream<Item = Result<R, String>> + Unpin + Send,
    R: ColumnReader + Send + 'static,
{
    if options.parallel {
        return pipeline::run_pipeline(
            migration,
            run,
            Arc::new(lookups),
            rows,
            writers,
            &options.pipeline,
            cancel,
        )
        .await;
    }

    let writer = writers.first_mut().ok_or_else(|| {
        MigrationError::Configuration("At least one batch writer is required".to_string())
    })?;
    let ctx = TransformContext::new(&lookups, run.report().started_at);
    run.stream(migration, &ctx, rows, writer.as_mut(), cancel).await
}

// --- Table Execution ---

pub struct RunEnvironment {
    pub connections: ResolvedConnections,
    pub options: RunOptions,
    pub reporter: Arc<dyn StatsReporter>,
    pub shutdown: CancellationToken,
}

fn writer_count<M: TableMigration>(migration: &M, options: &RunOptions) -> usize {
    if !options.parallel || options.use_transaction || migration.is_ordered() {
        1
    } else {
        options.pipeline.writers.max(1)
    }
}

async fn run_post_load<M: TableMigration>(
    migration: &M,
    conn: &mut PgConnection,
) -> Result<(), MigrationError> {
    let table = migration.target().name;
    if let Some(sql) = migration.post_load_sql() {
        let affected = postgres::execute_statement(conn, sql)
            .await
            .map_err(|e| MigrationError::batch_load(table, format!("Post-load step failed: {}", e)))?;
        log::info!("[{}] Post-load step updated {} rows", table, affected);
    }
    Ok(())
}

async fn load_in_transaction<M, S, R>(
    migration: &M,
    run: &mut MigrationRun,
    lookups: LookupContext,
    rows: S,
    options: &RunOptions,
    cancel: &CancelSignal,
    tx: &mut PgConnection,
) -> Result<(), MigrationError>
where
    M: TableMigration + Clone,
    S: Stream<Item = Result<R, String>> + Unpin + Send,
    R: ColumnReader + Send + 'static,
{
    let table = migration.target();
    if options.truncate {
        postgres::truncate_table(tx, table.name).await?;
    }
    {
        let mut writers: Vec<Box<dyn BatchWriter + '_>> = vec![Box::new(postgres::PgBatchWriter::new(&mut *tx))];
        load_rows(migration, run, lookups, rows, &mut writers, options, cancel).await?;
    }
    run_post_load(migration, tx).await
}

async fn drive<M: TableMigration + Clone>(
    migration: &M,
    env: &RunEnvironment,
    run: &mut MigrationRun,
    cancel: &CancelSignal,
) -> Result<(), MigrationError> {
    let table = migration.target();
    table.validate().map_err(MigrationError::Configuration)?;
    let options = &env.options;
    let writers_needed = writer_count(migration, options);

    let pool = postgres::create_pool(&env.connections.postgres, writers_needed as u32 + 1).await?;
    let mut source = mssql::connect(&env.connections.sql_server).await?;
    let mut target = pool
        .acquire()
        .await
        .map_err(|e| MigrationError::Connection(format!("Failed to acquire target connection: {}", e)))?;

    postgres::verify_conflict_target(&mut target, table).await?;
    let lookups = run
        .load_lookups(&migration.lookups(), &mut *target, &mut source)
        .await?;
    let rows = mssql::stream_rows(&mut source, migration.source_query()).await?;

    if options.dry_run {
        log::info!("[{}] Dry run: batches are discarded", table.name);
        let mut writers: Vec<Box<dyn BatchWriter>> = (0..writers_needed)
            .map(|_| Box::new(DiscardWriter::default()) as Box<dyn BatchWriter>)
            .collect();
        return load_rows(migration, run, lookups, rows, &mut writers, options, cancel).await;
    }

    if options.use_transaction {
        let mut tx = (*target)
            .begin()
            .await
            .map_err(|e| MigrationError::Connection(format!("Failed to begin transaction: {}", e)))?;
        let loaded = load_in_transaction(migration, run, lookups, rows, options, cancel, &mut tx).await;
        return match loaded {
            Ok(()) => tx.commit().await.map_err(|e| {
                MigrationError::batch_load(table.name, format!("Failed to commit transaction: {}", e))
            }),
            Err(e) => {
                match tx.rollback().await {
                    Ok(()) => log::warn!("[{}] Transaction rolled back", table.name),
                    Err(rollback) => {
                        log::error!("[{}] Failed to roll back transaction: {}", table.name, rollback)
                    }
                }
                Err(e)
            }
        };
    }

    if options.truncate {
        postgres::truncate_table(&mut target, table.name).await?;
    }
    let mut writers: Vec<Box<dyn BatchWriter>> = Vec::with_capacity(writers_needed);
    for _ in 0..writers_needed {
        let conn = pool
            .acquire()
            .await
            .map_err(|e| MigrationError::Connection(format!("Failed to acquire writer connection: {}", e)))?;
        writers.push(Box::new(postgres::PgBatchWriter::new(conn)));
    }
    load_rows(migration, run, lookups, rows, &mut writers, options, cancel).await?;
    drop(writers);
    run_post_load(migration, &mut target).await
}

async fn report_run(reporter: &dyn StatsReporter, report: &RunReport) {
    if let Err(e) = reporter.report(report).await {
        log::warn!("[{}] Failed to report run {}: {}", report.table, report.run_id, e);
    }
}

/// Runs one table end to end and returns the number of migrated rows. The
/// report reaches the reporter whether the run succeeds or fails.
pub async fn execute_table<M: TableMigration + Clone>(
    migration: &M,
    env: &RunEnvironment,
) -> Result<u64, MigrationError> {
    let table = migration.target();
    let batch_size = env.options.effective_batch_size(migration.default_batch_size());
    let mut run = MigrationRun::new(table.name, batch_size, env.options.dry_run);
    let cancel = CancelSignal::new(&env.shutdown, env.options.max_duration);

    log::info!(
        "[{}] Starting migration (batch size {}, {})",
        table.name,
        batch_size,
        if env.options.parallel { "parallel" } else { "serial" }
    );

    let result = match drive(migration, env, &mut run, &cancel).await {
        Ok(()) => run.finish(),
        Err(e) => Err(e),
    };
    cancel.disarm();

    match result {
        Ok(report) => {
            report_run(env.reporter.as_ref(), &report).await;
            log::info!(
                "[{}] Migration completed. Migrated: {}, Skipped: {}, Errored: {}",
                table.name,
                report.counters.migrated,
                report.counters.skipped,
                report.counters.errored
            );
            Ok(report.migrated())
        }
        Err(e) => {
            log::error!("[{}] Migration failed: {}", table.name, e);
            let report = run.fail(&e);
            report_run(env.reporter.as_ref(), &report).await;
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests;

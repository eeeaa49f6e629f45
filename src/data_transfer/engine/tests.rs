use super::*;
use crate::config::PipelineSettings;
use crate::data_transfer::loader::WriteError;
use crate::data_transfer::mapper::ColumnMapping;
use crate::data_transfer::models::SkipKind;
use crate::data_transfer::testing::{
    dec, events, source_row, MemoryStore, MemoryWriter, TestMigration, TestSource, TestTarget, APPEND_TABLE,
    EVENT_QUERY, UPSERT_TABLE,
};
use crate::db_types::{CellValue, PgValue};
use futures::stream;

type Rows = Vec<Result<Vec<CellValue>, String>>;

fn ok_rows(rows: Vec<Vec<CellValue>>) -> Rows {
    rows.into_iter().map(Ok).collect()
}

fn streaming_run(batch_size: usize) -> MigrationRun {
    let mut run = MigrationRun::new("lot_price", batch_size, false);
    run.advance(RunState::LookupsLoaded).unwrap();
    run
}

fn parallel_options(workers: usize, writers: usize) -> RunOptions {
    RunOptions {
        parallel: true,
        pipeline: PipelineSettings {
            transform_workers: workers,
            raw_queue_capacity: 4,
            write_queue_capacity: 2,
            writers,
        },
        ..RunOptions::default()
    }
}

async fn serial_report(migration: &TestMigration, lookups: &LookupContext, rows: Rows, batch_size: usize) -> RunReport {
    let mut run = streaming_run(batch_size);
    let ctx = TransformContext::new(lookups, run.report().started_at);
    let cancel = CancelSignal::new(&CancellationToken::new(), None);
    let mut writer = MemoryWriter::default();
    run.stream(migration, &ctx, stream::iter(rows), &mut writer, &cancel)
        .await
        .unwrap();
    run.finish().unwrap()
}

#[tokio::test]
async fn test_append_run_counts_and_skip_reasons() {
    let migration = TestMigration::default();
    let mut target = MemoryStore::default().with_result(EVENT_QUERY, vec![vec![CellValue::from(10)]]);
    let mut source = MemoryStore::default();
    let mut run = MigrationRun::new("lot_price", 500, false);
    let lookups = run
        .load_lookups(&migration.lookups(), &mut target, &mut source)
        .await
        .unwrap();
    assert_eq!(run.state(), RunState::LookupsLoaded);

    let rows = ok_rows(vec![
        source_row(1, Some(10), 100, "5.00", 1),
        source_row(2, Some(99), 100, "6.00", 2),
        source_row(3, None, 100, "7.00", 3),
    ]);
    let ctx = TransformContext::new(&lookups, run.report().started_at);
    let cancel = CancelSignal::new(&CancellationToken::new(), None);
    let mut writer = MemoryWriter::default();

    run.stream(&migration, &ctx, stream::iter(rows), &mut writer, &cancel)
        .await
        .unwrap();
    assert_eq!(run.state(), RunState::Draining);
    let report = run.finish().unwrap();

    assert_eq!(report.state, RunState::Done);
    assert_eq!(report.counters.processed, 3);
    assert_eq!(report.counters.migrated, 1);
    assert_eq!(report.counters.skipped, 2);
    assert_eq!(report.counters.errored, 0);
    assert!(report.finished_at.is_some());

    let reasons: Vec<(&str, &str)> = report
        .skip_details
        .iter()
        .map(|s| (s.record_id.as_str(), s.reason.as_str()))
        .collect();
    assert_eq!(
        reasons,
        vec![
            ("id:2", "event_id=99 not found in event_master"),
            ("id:3", "event_id is null"),
        ]
    );
    assert_eq!(writer.rows.len(), 1);
}

#[tokio::test]
async fn test_lookup_failure_leaves_run_not_started() {
    let migration = TestMigration::default();
    let mut run = MigrationRun::new("lot_price", 500, false);
    let err = run
        .load_lookups(&migration.lookups(), &mut MemoryStore::default(), &mut MemoryStore::default())
        .await
        .unwrap_err();
    assert!(matches!(err, MigrationError::Lookup { ref name, .. } if name == "event_master"));
    assert_eq!(run.state(), RunState::NotStarted);
}

#[tokio::test]
async fn test_upsert_latest_update_wins_and_existing_rows_update() {
    let migration = TestMigration { upsert: true };
    let lookups = events(&[10]);
    let mut run = streaming_run(500);
    let ctx = TransformContext::new(&lookups, run.report().started_at);
    let cancel = CancelSignal::new(&CancellationToken::new(), None);
    let mut writer = MemoryWriter::with_existing(
        &UPSERT_TABLE,
        vec![vec![PgValue::Int4(Some(10)), PgValue::Int4(Some(100)), PgValue::Numeric(Some(dec("1.00")))]],
    );

    let rows = ok_rows(vec![
        source_row(1, Some(10), 100, "2.00", 2),
        source_row(2, Some(10), 100, "3.00", 1),
        source_row(3, Some(10), 200, "4.00", 3),
    ]);
    run.stream(&migration, &ctx, stream::iter(rows), &mut writer, &cancel)
        .await
        .unwrap();
    let report = run.finish().unwrap();

    assert_eq!(report.counters.processed, 3);
    assert_eq!(report.counters.migrated, 3);
    assert_eq!(report.counters.inserted, 1);
    assert_eq!(report.counters.updated, 1);
    assert_eq!(report.counters.superseded, 1);
    assert_eq!(
        writer.value("10|100", &UPSERT_TABLE, "price"),
        Some(PgValue::Numeric(Some(dec("2.00"))))
    );
    assert_eq!(writer.insert_calls, 1);
}

#[tokio::test]
async fn test_existing_rows_become_duplicate_skips_on_append() {
    let migration = TestMigration::default();
    let lookups = events(&[10]);
    let mut run = streaming_run(500);
    let ctx = TransformContext::new(&lookups, run.report().started_at);
    let cancel = CancelSignal::new(&CancellationToken::new(), None);
    let mut writer = MemoryWriter::with_existing(
        migration.target(),
        vec![vec![PgValue::Int4(Some(10)), PgValue::Int4(Some(100)), PgValue::Numeric(Some(dec("1.00")))]],
    );

    let rows = ok_rows(vec![
        source_row(1, Some(10), 100, "2.00", 1),
        source_row(2, Some(10), 200, "3.00", 2),
    ]);
    run.stream(&migration, &ctx, stream::iter(rows), &mut writer, &cancel)
        .await
        .unwrap();
    let report = run.finish().unwrap();

    assert_eq!(report.counters.migrated, 1);
    assert_eq!(report.counters.skipped, 1);
    assert_eq!(report.skip_details[0].record_id, "id:1");
    assert_eq!(report.skip_details[0].kind, SkipKind::Duplicate);
    assert_eq!(
        writer.value("10|100", migration.target(), "price"),
        Some(PgValue::Numeric(Some(dec("1.00"))))
    );
}

#[tokio::test]
async fn test_append_batch_with_repeated_key_migrates_rows_written() {
    let migration = TestMigration::default();
    let lookups = events(&[10]);
    let mut run = streaming_run(500);
    let ctx = TransformContext::new(&lookups, run.report().started_at);
    let cancel = CancelSignal::new(&CancellationToken::new(), None);
    let mut writer = MemoryWriter::default();

    let rows = ok_rows(vec![
        source_row(1, Some(10), 100, "2.00", 1),
        source_row(2, Some(10), 100, "3.00", 2),
    ]);
    run.stream(&migration, &ctx, stream::iter(rows), &mut writer, &cancel)
        .await
        .unwrap();
    let report = run.finish().unwrap();

    assert_eq!(writer.rows.len(), 1);
    assert_eq!(report.counters.migrated, writer.rows.len() as u64);
    assert_eq!(report.counters.superseded, 0);
    assert_eq!(report.counters.skipped, 1);
    assert!(report.counters.is_balanced());
    assert_eq!(report.skip_details.len(), 1);
    assert_eq!(report.skip_details[0].record_id, "id:1");
    assert_eq!(report.skip_details[0].kind, SkipKind::Duplicate);
}

const SINGLE_KEY_TABLE: TargetTable = TargetTable {
    key_columns: &["event_id"],
    ..APPEND_TABLE
};

/// Declares one key column while its rows carry a two-part key.
#[derive(Clone, Default)]
struct SingleKeyMigration(TestMigration);

impl TableMigration for SingleKeyMigration {
    type Source = TestSource;
    type Target = TestTarget;

    fn target(&self) -> &'static TargetTable {
        &SINGLE_KEY_TABLE
    }

    fn lookups(&self) -> Vec<LookupSpec> {
        self.0.lookups()
    }

    fn source_query(&self) -> &'static str {
        self.0.source_query()
    }

    fn decode(&self, row: &dyn ColumnReader) -> Result<TestSource, String> {
        self.0.decode(row)
    }

    fn record_id(&self, source: &TestSource) -> String {
        self.0.record_id(source)
    }

    fn transform(&self, source: &TestSource, ctx: &TransformContext<'_>) -> Result<TestTarget, SkipReason> {
        self.0.transform(source, ctx)
    }

    fn mappings(&self) -> Vec<ColumnMapping> {
        self.0.mappings()
    }
}

#[test]
fn test_key_shape_mismatch_is_a_transform_error() {
    let lookups = events(&[10]);
    let ctx = TransformContext::new(&lookups, Utc::now());
    let row = source_row(7, Some(10), 100, "2.00", 1);

    let skip = process_row(&SingleKeyMigration::default(), &ctx, &row, 1).unwrap_err();
    assert_eq!(skip.record_id, "id:7");
    assert_eq!(skip.kind, SkipKind::TransformError);
    assert_eq!(skip.reason, "Key 10|100 has 2 parts but the table has 1 key columns");

    assert!(process_row(&TestMigration::default(), &ctx, &row, 1).is_ok());
}

#[tokio::test]
async fn test_undecodable_rows_count_as_errored() {
    let migration = TestMigration::default();
    let lookups = events(&[10]);
    let rows = ok_rows(vec![
        source_row(1, Some(10), 100, "2.00", 1),
        vec![CellValue::Text("abc".to_string()), CellValue::Null, CellValue::Null, CellValue::Null, CellValue::Null],
        source_row(3, None, 100, "2.00", 3),
    ]);

    let report = serial_report(&migration, &lookups, rows, 500).await;

    assert_eq!(report.counters.processed, 3);
    assert_eq!(report.counters.migrated, 1);
    assert_eq!(report.counters.skipped, 1);
    assert_eq!(report.counters.errored, 1);
    assert!(report.counters.is_balanced());
    let decode = &report.skip_details[0];
    assert_eq!(decode.record_id, "row #2");
    assert_eq!(decode.kind, SkipKind::TransformError);
    assert!(decode.reason.starts_with("Failed to decode source row:"));
}

#[tokio::test]
async fn test_batches_flush_at_batch_size() {
    let migration = TestMigration::default();
    let lookups = events(&[10]);
    let mut run = streaming_run(2);
    let ctx = TransformContext::new(&lookups, run.report().started_at);
    let cancel = CancelSignal::new(&CancellationToken::new(), None);
    let mut writer = MemoryWriter::default();

    let rows = ok_rows((1..=5).map(|id| source_row(id, Some(10), id, "1.00", id)).collect());
    run.stream(&migration, &ctx, stream::iter(rows), &mut writer, &cancel)
        .await
        .unwrap();

    assert_eq!(writer.copy_calls, 3);
    assert_eq!(run.counters().migrated, 5);
}

#[tokio::test]
async fn test_skip_reports_are_deterministic() {
    let migration = TestMigration::default();
    let lookups = events(&[10, 20]);
    let rows = || {
        ok_rows(vec![
            source_row(1, Some(30), 1, "1.00", 1),
            source_row(2, Some(10), 2, "1.00", 2),
            source_row(3, None, 3, "1.00", 3),
            source_row(4, Some(40), 4, "1.00", 4),
        ])
    };

    let first = serial_report(&migration, &lookups, rows(), 2).await;
    let second = serial_report(&migration, &lookups, rows(), 3).await;

    assert_eq!(first.counters, second.counters);
    assert_eq!(first.skip_details, second.skip_details);
}

#[tokio::test]
async fn test_cancelled_run_stops_and_fails() {
    let migration = TestMigration::default();
    let lookups = events(&[10]);
    let mut run = streaming_run(500);
    let ctx = TransformContext::new(&lookups, run.report().started_at);
    let shutdown = CancellationToken::new();
    let cancel = CancelSignal::new(&shutdown, None);
    shutdown.cancel();
    let mut writer = MemoryWriter::default();

    let rows = ok_rows(vec![source_row(1, Some(10), 100, "2.00", 1)]);
    let err = run
        .stream(&migration, &ctx, stream::iter(rows), &mut writer, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, MigrationError::Cancelled));
    assert_eq!(writer.copy_calls, 0);

    let report = run.fail(&err);
    assert_eq!(report.state, RunState::Failed);
    assert_eq!(report.error.as_deref(), Some("Migration cancelled"));
}

#[tokio::test]
async fn test_max_duration_times_out_a_stalled_source() {
    let migration = TestMigration::default();
    let lookups = events(&[10]);
    let mut run = streaming_run(500);
    let ctx = TransformContext::new(&lookups, run.report().started_at);
    let cancel = CancelSignal::new(&CancellationToken::new(), Some(Duration::from_millis(50)));
    let mut writer = MemoryWriter::default();

    let err = run
        .stream(
            &migration,
            &ctx,
            stream::pending::<Result<Vec<CellValue>, String>>(),
            &mut writer,
            &cancel,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, MigrationError::TimedOut(_)));
    assert_eq!(err.kind(), "timed_out");
}

#[tokio::test]
async fn test_disarmed_deadline_never_fires() {
    let cancel = CancelSignal::new(&CancellationToken::new(), Some(Duration::from_millis(20)));
    cancel.disarm();
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(!cancel.is_cancelled());
    assert!(matches!(cancel.error(), MigrationError::Cancelled));
}

#[tokio::test]
async fn test_streaming_requires_loaded_lookups() {
    let migration = TestMigration::default();
    let lookups = events(&[10]);
    let mut run = MigrationRun::new("lot_price", 500, false);
    let ctx = TransformContext::new(&lookups, run.report().started_at);
    let cancel = CancelSignal::new(&CancellationToken::new(), None);
    let mut writer = MemoryWriter::default();

    let err = run
        .stream(&migration, &ctx, stream::iter(ok_rows(Vec::new())), &mut writer, &cancel)
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "Invalid run state transition from not_started to streaming"
    );
}

#[tokio::test]
async fn test_source_read_error_is_fatal() {
    let migration = TestMigration::default();
    let lookups = events(&[10]);
    let mut run = streaming_run(500);
    let ctx = TransformContext::new(&lookups, run.report().started_at);
    let cancel = CancelSignal::new(&CancellationToken::new(), None);
    let mut writer = MemoryWriter::default();

    let rows: Rows = vec![
        Ok(source_row(1, Some(10), 100, "2.00", 1)),
        Err("Failed to read source row: connection reset".to_string()),
    ];
    let err = run
        .stream(&migration, &ctx, stream::iter(rows), &mut writer, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, MigrationError::Source(_)));
    assert_eq!(run.counters().processed, 1);
    assert_eq!(run.fail(&err).state, RunState::Failed);
}

#[tokio::test]
async fn test_failed_fallback_insert_is_fatal() {
    let migration = TestMigration::default();
    let lookups = events(&[10]);
    let mut run = streaming_run(500);
    let ctx = TransformContext::new(&lookups, run.report().started_at);
    let cancel = CancelSignal::new(&CancellationToken::new(), None);
    let mut writer = MemoryWriter {
        fail_copy: Some(WriteError::UniqueViolation("duplicate key".to_string())),
        fail_inserts: true,
        ..MemoryWriter::default()
    };

    let rows = ok_rows(vec![source_row(1, Some(10), 100, "2.00", 1)]);
    let err = run
        .stream(&migration, &ctx, stream::iter(rows), &mut writer, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, MigrationError::BatchLoad { .. }));
}

#[tokio::test]
async fn test_dry_run_discards_batches() {
    let migration = TestMigration::default();
    let mut run = MigrationRun::new("lot_price", 500, true);
    run.advance(RunState::LookupsLoaded).unwrap();
    let cancel = CancelSignal::new(&CancellationToken::new(), None);
    let mut writers: Vec<Box<dyn BatchWriter>> = vec![Box::new(DiscardWriter::default())];

    let rows = ok_rows(vec![
        source_row(1, Some(10), 100, "2.00", 1),
        source_row(2, Some(11), 100, "2.00", 2),
    ]);
    load_rows(
        &migration,
        &mut run,
        events(&[10]),
        stream::iter(rows),
        &mut writers,
        &RunOptions::default(),
        &cancel,
    )
    .await
    .unwrap();
    let report = run.finish().unwrap();

    assert!(report.dry_run);
    assert_eq!(report.counters.migrated, 1);
    assert_eq!(report.counters.skipped, 1);
}

// --- Pipeline ---

async fn pipeline_report(migration: &TestMigration, rows: Rows, options: &RunOptions, writers: usize) -> RunReport {
    let mut run = streaming_run(2);
    let cancel = CancelSignal::new(&CancellationToken::new(), None);
    let mut boxed: Vec<Box<dyn BatchWriter>> = (0..writers)
        .map(|_| Box::new(MemoryWriter::default()) as Box<dyn BatchWriter>)
        .collect();
    load_rows(
        migration,
        &mut run,
        events(&[10, 20]),
        stream::iter(rows),
        &mut boxed,
        options,
        &cancel,
    )
    .await
    .unwrap();
    run.finish().unwrap()
}

fn mixed_rows() -> Rows {
    ok_rows(
        (1..=40)
            .map(|id| match id % 4 {
                0 => source_row(id, None, id, "1.00", id),
                1 => source_row(id, Some(99), id, "1.00", id),
                _ => source_row(id, Some(10 + (id % 2) * 10), id, "1.50", id),
            })
            .collect(),
    )
}

#[tokio::test]
async fn test_pipeline_matches_serial_counts_and_skips() {
    let migration = TestMigration::default();
    let serial = serial_report(&migration, &events(&[10, 20]), mixed_rows(), 2).await;
    let parallel = pipeline_report(&migration, mixed_rows(), &parallel_options(3, 2), 2).await;

    assert_eq!(parallel.state, RunState::Done);
    assert_eq!(parallel.counters, serial.counters);
    assert_eq!(parallel.skip_details, serial.skip_details);
    assert!(parallel.counters.is_balanced());
}

#[tokio::test]
async fn test_pipeline_keeps_source_order_for_ordered_tables() {
    let migration = TestMigration { upsert: true };
    let rows = || {
        ok_rows(vec![
            source_row(1, Some(10), 100, "1.00", 1),
            source_row(2, Some(10), 100, "2.00", 2),
            source_row(3, Some(10), 100, "3.00", 3),
            source_row(4, Some(10), 100, "4.00", 4),
            source_row(5, Some(10), 100, "5.00", 5),
        ])
    };

    let serial = serial_report(&migration, &events(&[10]), rows(), 2).await;
    let parallel = pipeline_report(&migration, rows(), &parallel_options(4, 3), 3).await;

    assert_eq!(parallel.counters, serial.counters);
    assert_eq!(parallel.counters.migrated, 5);
    assert_eq!(parallel.counters.inserted, 1);
    assert_eq!(parallel.counters.updated, 2);
    assert_eq!(parallel.counters.superseded, 2);
}

#[tokio::test]
async fn test_pipeline_cancellation() {
    let migration = TestMigration::default();
    let mut run = streaming_run(2);
    let shutdown = CancellationToken::new();
    let cancel = CancelSignal::new(&shutdown, None);
    let mut writers: Vec<Box<dyn BatchWriter>> = vec![Box::new(MemoryWriter::default())];

    let stopper = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        stopper.cancel();
    });

    let err = load_rows(
        &migration,
        &mut run,
        events(&[10]),
        stream::pending::<Result<Vec<CellValue>, String>>(),
        &mut writers,
        &parallel_options(2, 1),
        &cancel,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, MigrationError::Cancelled));
}

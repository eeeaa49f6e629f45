use super::*;
use crate::data_transfer::models::RunState;
use chrono::{Duration, Utc};

async fn memory_pool() -> Pool<Sqlite> {
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap()
}

#[tokio::test]
async fn test_migration_run_storage_crud() {
    let pool = memory_pool().await;
    ensure_schema(&pool).await.unwrap();

    let mut report = RunReport::new("event_supplier_line_item");
    report.state = RunState::Streaming;
    report.counters.processed = 10;

    // Save
    persist_run(&pool, &report).await.unwrap();

    // Load
    let fetched = load_run(&pool, &report.run_id).await.unwrap().unwrap();
    assert_eq!(fetched.table, "event_supplier_line_item");
    assert_eq!(fetched.counters.processed, 10);

    // Conflict (Update)
    report.state = RunState::Done;
    report.counters.migrated = 9;
    report.finished_at = Some(Utc::now());
    persist_run(&pool, &report).await.unwrap();

    let fetched = load_run(&pool, &report.run_id).await.unwrap().unwrap();
    assert_eq!(fetched.state, RunState::Done);
    assert_eq!(fetched.counters.migrated, 9);

    assert!(load_run(&pool, "missing").await.unwrap().is_none());
}

#[tokio::test]
async fn test_recent_runs_filter_and_order() {
    let history = RunHistory::from_pool(memory_pool().await).await.unwrap();

    let mut older = RunReport::new("nfa_po_condition");
    older.started_at = Utc::now() - Duration::hours(1);
    let newer = RunReport::new("nfa_po_condition");
    let other = RunReport::new("supplier_price_bid_lot_price");

    for report in [&older, &newer, &other] {
        history.report(report).await.unwrap();
    }

    let all = history.recent(None, 10).await.unwrap();
    assert_eq!(all.len(), 3);

    let filtered = history.recent(Some("nfa_po_condition"), 10).await.unwrap();
    assert_eq!(filtered.len(), 2);
    assert_eq!(filtered[0].run_id, newer.run_id);
    assert_eq!(filtered[1].run_id, older.run_id);

    let limited = history.recent(None, 1).await.unwrap();
    assert_eq!(limited.len(), 1);
}

use crate::data_transfer::models::RunReport;
use crate::data_transfer::sink::StatsReporter;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};
use std::path::Path;

const MAX_HISTORY_LIMIT: i64 = 500;

async fn ensure_schema(pool: &Pool<Sqlite>) -> Result<(), String> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS migration_runs (
            run_id TEXT PRIMARY KEY,
            table_name TEXT NOT NULL,
            state TEXT NOT NULL,
            migrated INTEGER NOT NULL,
            report_json TEXT NOT NULL,
            started_at INTEGER NOT NULL,
            finished_at INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_migration_runs_started_at ON migration_runs(started_at DESC);
        CREATE INDEX IF NOT EXISTS idx_migration_runs_table ON migration_runs(table_name, started_at DESC);
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| format!("Failed to initialize migration run storage: {}", e))?;

    Ok(())
}

async fn persist_run(pool: &Pool<Sqlite>, report: &RunReport) -> Result<(), String> {
    let report_json = serde_json::to_string(report)
        .map_err(|e| format!("Failed to serialize migration run report: {}", e))?;

    sqlx::query(
        r#"
        INSERT INTO migration_runs (run_id, table_name, state, migrated, report_json, started_at, finished_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(run_id) DO UPDATE SET
            state = excluded.state,
            migrated = excluded.migrated,
            report_json = excluded.report_json,
            finished_at = excluded.finished_at
        "#,
    )
    .bind(&report.run_id)
    .bind(&report.table)
    .bind(report.state.as_str())
    .bind(i64::try_from(report.counters.migrated).unwrap_or(i64::MAX))
    .bind(report_json)
    .bind(report.started_at.timestamp())
    .bind(report.finished_at.map(|t| t.timestamp()))
    .execute(pool)
    .await
    .map_err(|e| format!("Failed to persist migration run report: {}", e))?;

    Ok(())
}

async fn load_run(pool: &Pool<Sqlite>, run_id: &str) -> Result<Option<RunReport>, String> {
    let row = sqlx::query(
        r#"
        SELECT report_json
        FROM migration_runs
        WHERE run_id = ?
        LIMIT 1
        "#,
    )
    .bind(run_id)
    .fetch_optional(pool)
    .await
    .map_err(|e| format!("Failed to load migration run {}: {}", run_id, e))?;

    match row {
        Some(row) => {
            let raw: String = row
                .try_get("report_json")
                .map_err(|e| format!("Failed to read migration run {}: {}", run_id, e))?;
            serde_json::from_str::<RunReport>(&raw)
                .map(Some)
                .map_err(|e| format!("Failed to parse migration run {}: {}", run_id, e))
        }
        None => Ok(None),
    }
}

async fn load_recent_runs(
    pool: &Pool<Sqlite>,
    table: Option<&str>,
    limit: usize,
) -> Result<Vec<RunReport>, String> {
    let safe_limit = i64::try_from(limit).unwrap_or(i64::MAX).clamp(1, MAX_HISTORY_LIMIT);
    let rows = sqlx::query(
        r#"
        SELECT report_json
        FROM migration_runs
        WHERE (? IS NULL OR table_name = ?)
        ORDER BY started_at DESC, rowid DESC
        LIMIT ?
        "#,
    )
    .bind(table)
    .bind(table)
    .bind(safe_limit)
    .fetch_all(pool)
    .await
    .map_err(|e| format!("Failed to list migration runs: {}", e))?;

    // Rows written by an older schema of the report are skipped rather than failing the listing.
    Ok(rows
        .into_iter()
        .filter_map(|row| {
            let raw: String = row.try_get("report_json").ok()?;
            serde_json::from_str::<RunReport>(&raw).ok()
        })
        .collect())
}

/// Sqlite-backed history of migration runs.
#[derive(Clone)]
pub struct RunHistory {
    pool: Pool<Sqlite>,
}

impl RunHistory {
    pub async fn open(path: &Path) -> Result<Self, String> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    format!("Failed to create history directory {}: {}", parent.display(), e)
                })?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await
            .map_err(|e| format!("Failed to open run history {}: {}", path.display(), e))?;

        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: Pool<Sqlite>) -> Result<Self, String> {
        ensure_schema(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn get(&self, run_id: &str) -> Result<Option<RunReport>, String> {
        load_run(&self.pool, run_id).await
    }

    pub async fn recent(&self, table: Option<&str>, limit: usize) -> Result<Vec<RunReport>, String> {
        load_recent_runs(&self.pool, table, limit).await
    }
}

#[async_trait]
impl StatsReporter for RunHistory {
    async fn report(&self, report: &RunReport) -> Result<(), String> {
        persist_run(&self.pool, report).await
    }
}

#[cfg(test)]
mod tests;

// =====================================================
// POSTGRESQL TARGET OPERATIONS
// =====================================================

use crate::data_transfer::copy_codec::{copy_statement, CopyEncoder};
use crate::data_transfer::loader::{BatchWriter, InsertedKey, WriteError};
use crate::data_transfer::lookup::LookupStore;
use crate::data_transfer::models::{ConflictPolicy, TargetTable};
use crate::db_types::{ColumnReader, PgValue};
use crate::error::MigrationError;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use futures::TryStreamExt;
use rust_decimal::Decimal;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgRow};
use sqlx::query_builder::Separated;
use sqlx::{ConnectOptions, Connection, PgConnection, Pool, Postgres, QueryBuilder, Row};
use std::ops::DerefMut;
use std::str::FromStr;
use std::time::Duration;

/// PostgreSQL's limit on bind parameters in one statement.
const MAX_BIND_PARAMS: usize = 65_535;
const COPY_CHUNK_BYTES: usize = 64 * 1024;

// --- Connection ---

pub async fn create_pool(url: &str, max_connections: u32) -> Result<Pool<Postgres>, MigrationError> {
    let options = PgConnectOptions::from_str(url)
        .map_err(|e| MigrationError::Configuration(format!("Invalid PostgreSQL connection string: {}", e)))?
        .log_statements(log::LevelFilter::Debug);

    PgPoolOptions::new()
        .max_connections(max_connections.max(1))
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Duration::from_secs(300))
        .max_lifetime(Duration::from_secs(1800))
        .connect_with(options)
        .await
        .map_err(|e| {
            let err_msg = e.to_string();
            if err_msg.contains("connection refused") {
                return MigrationError::Connection(
                    "Connection refused. Check that PostgreSQL is running and reachable".to_string(),
                );
            }
            if err_msg.contains("timed out") {
                return MigrationError::Connection(
                    "PostgreSQL did not respond within 10 seconds".to_string(),
                );
            }
            MigrationError::Connection(format!("Failed to create pool: {}", e))
        })
}

// --- Row Access ---

impl ColumnReader for PgRow {
    fn get_i32(&self, index: usize) -> Result<Option<i32>, String> {
        if let Ok(value) = self.try_get::<Option<i32>, _>(index) {
            return Ok(value);
        }
        if let Ok(value) = self.try_get::<Option<i16>, _>(index) {
            return Ok(value.map(i32::from));
        }
        match self.try_get::<Option<i64>, _>(index) {
            Ok(Some(value)) => i32::try_from(value)
                .map(Some)
                .map_err(|_| format!("Column {} value {} does not fit in int4", index, value)),
            Ok(None) => Ok(None),
            Err(e) => Err(format!("Failed to read integer column {}: {}", index, e)),
        }
    }

    fn get_i64(&self, index: usize) -> Result<Option<i64>, String> {
        if let Ok(value) = self.try_get::<Option<i64>, _>(index) {
            return Ok(value);
        }
        self.get_i32(index).map(|value| value.map(i64::from))
    }

    fn get_decimal(&self, index: usize) -> Result<Option<Decimal>, String> {
        if let Ok(value) = self.try_get::<Option<Decimal>, _>(index) {
            return Ok(value);
        }
        self.get_i64(index)
            .map(|value| value.map(Decimal::from))
            .map_err(|e| format!("Failed to read numeric column {}: {}", index, e))
    }

    fn get_string(&self, index: usize) -> Result<Option<String>, String> {
        self.try_get::<Option<String>, _>(index)
            .map_err(|e| format!("Failed to read text column {}: {}", index, e))
    }

    fn get_datetime(&self, index: usize) -> Result<Option<NaiveDateTime>, String> {
        if let Ok(value) = self.try_get::<Option<NaiveDateTime>, _>(index) {
            return Ok(value);
        }
        self.try_get::<Option<DateTime<Utc>>, _>(index)
            .map(|value| value.map(|v| v.naive_utc()))
            .map_err(|e| format!("Failed to read timestamp column {}: {}", index, e))
    }

    fn get_bool(&self, index: usize) -> Result<Option<bool>, String> {
        self.try_get::<Option<bool>, _>(index)
            .map_err(|e| format!("Failed to read boolean column {}: {}", index, e))
    }
}

#[async_trait]
impl LookupStore for PgConnection {
    async fn visit_rows(
        &mut self,
        query: &str,
        visit: &mut (dyn for<'r> FnMut(&'r dyn ColumnReader) -> Result<(), String> + Send),
    ) -> Result<u64, String> {
        let mut rows = sqlx::query(query).fetch(&mut *self);
        let mut count = 0u64;
        while let Some(row) = rows
            .try_next()
            .await
            .map_err(|e| format!("Query failed: {}", e))?
        {
            visit(&row)?;
            count += 1;
        }
        Ok(count)
    }
}

// --- Schema Checks ---

/// True when one of `unique_indexes` covers exactly `key_columns`, in any order.
pub fn matches_unique_index(key_columns: &[&str], unique_indexes: &[Vec<String>]) -> bool {
    unique_indexes.iter().any(|index| {
        index.len() == key_columns.len()
            && key_columns
                .iter()
                .all(|key| index.iter().any(|column| column.eq_ignore_ascii_case(key)))
    })
}

/// ON CONFLICT needs a unique, non-partial index on exactly the key columns.
/// Checked before any row is read so a missing constraint fails fast.
pub async fn verify_conflict_target(
    conn: &mut PgConnection,
    table: &TargetTable,
) -> Result<(), MigrationError> {
    let rows = sqlx::query(
        r#"
        SELECT array_agg(a.attname::text) AS columns
        FROM pg_index i
        JOIN pg_class c ON c.oid = i.indrelid
        JOIN pg_attribute a ON a.attrelid = c.oid AND a.attnum = ANY(i.indkey)
        WHERE c.relname = $1
          AND pg_table_is_visible(c.oid)
          AND i.indisunique
          AND i.indpred IS NULL
        GROUP BY i.indexrelid
        "#,
    )
    .bind(table.name)
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| {
        MigrationError::Configuration(format!("Failed to inspect indexes of {}: {}", table.name, e))
    })?;

    let indexes = rows
        .iter()
        .map(|row| row.try_get::<Vec<String>, _>("columns"))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| {
            MigrationError::Configuration(format!("Failed to read indexes of {}: {}", table.name, e))
        })?;

    if matches_unique_index(table.key_columns, &indexes) {
        Ok(())
    } else {
        Err(MigrationError::Configuration(format!(
            "Table {} has no unique constraint on ({}) to use as ON CONFLICT target",
            table.name,
            table.key_columns.join(", ")
        )))
    }
}

// --- Statements ---

pub async fn truncate_table(conn: &mut PgConnection, table: &str) -> Result<(), MigrationError> {
    sqlx::query(&format!("TRUNCATE TABLE {} RESTART IDENTITY", table))
        .execute(&mut *conn)
        .await
        .map_err(|e| MigrationError::batch_load(table, format!("Failed to truncate: {}", e)))?;
    log::info!("[{}] Truncated target table", table);
    Ok(())
}

pub async fn execute_statement(conn: &mut PgConnection, sql: &str) -> Result<u64, String> {
    sqlx::query(sql)
        .execute(&mut *conn)
        .await
        .map(|result| result.rows_affected())
        .map_err(|e| format!("Failed to execute statement: {}", e))
}

// --- Batch Writer ---

pub fn conflict_clause(table: &TargetTable) -> String {
    let target = table.key_columns.join(", ");
    let mut assignments: Vec<String> = match table.conflict {
        ConflictPolicy::DoNothing => Vec::new(),
        ConflictPolicy::DoUpdate => table
            .assignment_columns()
            .into_iter()
            .map(|column| format!("{} = EXCLUDED.{}", column, column))
            .collect(),
    };
    if table.conflict == ConflictPolicy::DoUpdate && table.touch_modified_date {
        assignments.push("modified_date = CURRENT_TIMESTAMP".to_string());
    }

    if assignments.is_empty() {
        format!(" ON CONFLICT ({}) DO NOTHING", target)
    } else {
        format!(" ON CONFLICT ({}) DO UPDATE SET {}", target, assignments.join(", "))
    }
}

/// `xmax = 0` holds for freshly inserted tuples and not for ones rewritten by DO UPDATE.
pub fn returning_clause(table: &TargetTable) -> String {
    let parts: Vec<String> = table
        .key_columns
        .iter()
        .map(|column| format!("{}::text", column))
        .collect();
    format!(
        " RETURNING concat_ws('|', {}) AS row_key, (xmax = 0) AS inserted",
        parts.join(", ")
    )
}

pub fn rows_per_statement(column_count: usize) -> usize {
    (MAX_BIND_PARAMS / column_count.max(1)).max(1)
}

fn push_value(builder: &mut Separated<'_, '_, Postgres, &'static str>, value: &PgValue) {
    match value {
        PgValue::Int4(v) => builder.push_bind(*v),
        PgValue::Int8(v) => builder.push_bind(*v),
        PgValue::Numeric(v) => builder.push_bind(*v),
        PgValue::Text(v) => builder.push_bind(v.clone()),
        PgValue::Bool(v) => builder.push_bind(*v),
        PgValue::TimestampTz(v) => builder.push_bind(*v),
    };
}

fn classify(e: sqlx::Error) -> WriteError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => WriteError::UniqueViolation(db.message().to_string()),
        _ => WriteError::Other(e.to_string()),
    }
}

/// Writes batches over one target connection. `C` may be a pooled
/// connection, a bare connection or an open transaction; COPY runs inside a
/// savepoint so a failed COPY leaves an outer transaction usable.
pub struct PgBatchWriter<C> {
    conn: C,
}

impl<C> PgBatchWriter<C>
where
    C: DerefMut<Target = PgConnection> + Send,
{
    pub fn new(conn: C) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl<C> BatchWriter for PgBatchWriter<C>
where
    C: DerefMut<Target = PgConnection> + Send,
{
    async fn copy_rows(&mut self, table: &TargetTable, rows: &[Vec<PgValue>]) -> Result<u64, WriteError> {
        let mut encoder = CopyEncoder::new(table.columns);
        for row in rows {
            encoder.write_row(row).map_err(WriteError::Other)?;
        }
        log::debug!("[{}] Encoded {} rows for COPY", table.name, encoder.rows());
        let payload = encoder.finish();

        let mut tx = (*self.conn).begin().await.map_err(classify)?;
        let copied = {
            let mut copy = tx.copy_in_raw(&copy_statement(table)).await.map_err(classify)?;
            let mut send_error = None;
            for chunk in payload.chunks(COPY_CHUNK_BYTES) {
                if let Err(e) = copy.send(chunk).await {
                    send_error = Some(e);
                    break;
                }
            }
            match send_error {
                Some(e) => {
                    let _ = copy.abort(format!("Failed to send COPY data: {}", e)).await;
                    Err(classify(e))
                }
                None => copy.finish().await.map_err(classify),
            }
        };

        match copied {
            Ok(count) => {
                tx.commit().await.map_err(classify)?;
                Ok(count)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    log::warn!("[{}] Failed to roll back COPY savepoint: {}", table.name, rollback);
                }
                Err(e)
            }
        }
    }

    async fn insert_rows(
        &mut self,
        table: &TargetTable,
        rows: &[Vec<PgValue>],
    ) -> Result<Vec<InsertedKey>, WriteError> {
        let conflict = conflict_clause(table);
        let returning = returning_clause(table);
        let header = format!(
            "INSERT INTO {} ({}) ",
            table.name,
            table.column_names().join(", ")
        );

        let mut written = Vec::with_capacity(rows.len());
        for chunk in rows.chunks(rows_per_statement(table.columns.len())) {
            let mut builder = QueryBuilder::<Postgres>::new(&header);
            builder.push_values(chunk, |mut separated, row| {
                for value in row {
                    push_value(&mut separated, value);
                }
            });
            builder.push(&conflict);
            builder.push(&returning);

            let returned = builder
                .build()
                .fetch_all(&mut *self.conn)
                .await
                .map_err(classify)?;

            for row in returned {
                let key: String = row
                    .try_get("row_key")
                    .map_err(|e| WriteError::Other(format!("Failed to read returned key: {}", e)))?;
                let inserted: bool = row
                    .try_get("inserted")
                    .map_err(|e| WriteError::Other(format!("Failed to read returned flag: {}", e)))?;
                written.push(InsertedKey { key, inserted });
            }
        }
        Ok(written)
    }
}

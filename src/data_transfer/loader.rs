use crate::data_transfer::models::{ConflictPolicy, SkipKind, SkipReason, SkipRecord, TargetTable};
use crate::db_types::{CompositeKey, PgValue};
use crate::error::MigrationError;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::fmt;

// --- Writer Seam ---

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteError {
    /// The bulk path hit a unique constraint (SQLSTATE 23505).
    UniqueViolation(String),
    Other(String),
}

impl fmt::Display for WriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteError::UniqueViolation(message) => write!(f, "unique violation: {}", message),
            WriteError::Other(message) => f.write_str(message),
        }
    }
}

/// Key reported back by a fallback INSERT, rendered like [`CompositeKey`]'s
/// `Display`, with whether the row was newly inserted or updated in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertedKey {
    pub key: String,
    pub inserted: bool,
}

#[async_trait]
pub trait BatchWriter: Send {
    /// Binary COPY of the whole batch. All-or-nothing.
    async fn copy_rows(&mut self, table: &TargetTable, rows: &[Vec<PgValue>]) -> Result<u64, WriteError>;

    /// Multi-row INSERT with the table's ON CONFLICT clause. Returns one entry
    /// per row actually written; rows ignored by `DO NOTHING` are absent.
    async fn insert_rows(
        &mut self,
        table: &TargetTable,
        rows: &[Vec<PgValue>],
    ) -> Result<Vec<InsertedKey>, WriteError>;
}

/// Accepts every batch without writing it anywhere. Used for dry runs.
#[derive(Debug, Default)]
pub struct DiscardWriter {
    pub rows_seen: u64,
}

#[async_trait]
impl BatchWriter for DiscardWriter {
    async fn copy_rows(&mut self, _table: &TargetTable, rows: &[Vec<PgValue>]) -> Result<u64, WriteError> {
        self.rows_seen += rows.len() as u64;
        Ok(rows.len() as u64)
    }

    async fn insert_rows(
        &mut self,
        _table: &TargetTable,
        _rows: &[Vec<PgValue>],
    ) -> Result<Vec<InsertedKey>, WriteError> {
        Ok(Vec::new())
    }
}

// --- Batches ---

/// A transformed row waiting in a batch buffer.
#[derive(Debug, Clone)]
pub struct PendingRow {
    pub record_id: String,
    /// Source update sequence, when the table orders "latest wins" by one.
    pub ordering: Option<i64>,
    pub key: CompositeKey,
    pub values: Vec<PgValue>,
}

#[derive(Debug, Default, Clone)]
pub struct BatchOutcome {
    pub inserted: u64,
    pub updated: u64,
    pub superseded: u64,
    pub duplicates: Vec<SkipRecord>,
}

impl BatchOutcome {
    pub fn migrated(&self) -> u64 {
        self.inserted + self.updated + self.superseded
    }
}

/// Keeps only the last row for every key and returns the rows it dropped.
/// With `ordered`, rows are first stable-sorted by their ordering value so
/// "last" means latest update.
pub fn dedup_last_wins(mut rows: Vec<PendingRow>, ordered: bool) -> (Vec<PendingRow>, Vec<PendingRow>) {
    if ordered {
        rows.sort_by_key(|row| row.ordering);
    }

    let mut last_index: HashMap<&CompositeKey, usize> = HashMap::with_capacity(rows.len());
    for (index, row) in rows.iter().enumerate() {
        last_index.insert(&row.key, index);
    }
    let keep: HashSet<usize> = last_index.into_values().collect();

    let (kept, dropped): (Vec<_>, Vec<_>) = rows
        .into_iter()
        .enumerate()
        .partition(|(index, _)| keep.contains(index));
    (
        kept.into_iter().map(|(_, row)| row).collect(),
        dropped.into_iter().map(|(_, row)| row).collect(),
    )
}

fn duplicate_skip(row: PendingRow, message: String) -> SkipRecord {
    SkipRecord::new(row.record_id, SkipReason::new(SkipKind::Duplicate, message))
}

/// Flushes one batch: dedup, COPY, and on a unique violation a single
/// INSERT ... ON CONFLICT retry. A failing retry is fatal.
pub async fn load_batch<W>(
    writer: &mut W,
    table: &TargetTable,
    rows: Vec<PendingRow>,
    ordered: bool,
) -> Result<BatchOutcome, MigrationError>
where
    W: BatchWriter + ?Sized,
{
    let mut outcome = BatchOutcome::default();
    if rows.is_empty() {
        return Ok(outcome);
    }

    let (rows, dropped) = dedup_last_wins(rows, ordered);
    if !dropped.is_empty() {
        log::debug!(
            "[{}] {} rows superseded by later rows with the same key",
            table.name,
            dropped.len()
        );
    }
    match table.conflict {
        // Earlier versions of an upserted key count as migrated.
        ConflictPolicy::DoUpdate => outcome.superseded = dropped.len() as u64,
        ConflictPolicy::DoNothing => {
            for row in dropped {
                let message = format!(
                    "Superseded by a later row with the same key ({})=({}) in the batch",
                    table.key_columns.join(", "),
                    row.key
                );
                outcome.duplicates.push(duplicate_skip(row, message));
            }
        }
    }

    let values: Vec<Vec<PgValue>> = rows.iter().map(|row| row.values.clone()).collect();

    match writer.copy_rows(table, &values).await {
        Ok(copied) => {
            log::debug!("[{}] COPY loaded {} rows", table.name, copied);
            outcome.inserted = rows.len() as u64;
            return Ok(outcome);
        }
        Err(WriteError::UniqueViolation(message)) => {
            log::warn!(
                "[{}] COPY hit a unique violation ({}), retrying {} rows with ON CONFLICT {}",
                table.name,
                message,
                rows.len(),
                table.conflict.as_str()
            );
        }
        Err(WriteError::Other(message)) => {
            return Err(MigrationError::batch_load(table.name, message));
        }
    }

    let written = writer
        .insert_rows(table, &values)
        .await
        .map_err(|e| MigrationError::batch_load(table.name, format!("Fallback insert failed: {}", e)))?;

    let written: HashMap<String, bool> = written
        .into_iter()
        .map(|entry| (entry.key, entry.inserted))
        .collect();

    for row in rows {
        match written.get(&row.key.to_string()) {
            Some(true) => outcome.inserted += 1,
            Some(false) => outcome.updated += 1,
            None => {
                let message = format!(
                    "Duplicate key ({})=({}) already exists in {}",
                    table.key_columns.join(", "),
                    row.key,
                    table.name
                );
                outcome.duplicates.push(duplicate_skip(row, message));
            }
        }
    }

    if table.conflict == ConflictPolicy::DoNothing && !outcome.duplicates.is_empty() {
        log::info!(
            "[{}] {} rows already present in target were left untouched",
            table.name,
            outcome.duplicates.len()
        );
    }

    Ok(outcome)
}

use crate::config::PipelineSettings;
use crate::db_types::PgType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

// --- Run State Machine ---

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    #[default]
    NotStarted,
    LookupsLoaded,
    Streaming,
    Draining,
    Reporting,
    Done,
    Failed,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::NotStarted => "not_started",
            RunState::LookupsLoaded => "lookups_loaded",
            RunState::Streaming => "streaming",
            RunState::Draining => "draining",
            RunState::Reporting => "reporting",
            RunState::Done => "done",
            RunState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Done | RunState::Failed)
    }

    pub fn can_transition_to(&self, next: RunState) -> bool {
        if next == RunState::Failed {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (RunState::NotStarted, RunState::LookupsLoaded)
                | (RunState::LookupsLoaded, RunState::Streaming)
                | (RunState::Streaming, RunState::Draining)
                | (RunState::Draining, RunState::Reporting)
                | (RunState::Reporting, RunState::Done)
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// --- Target Table Descriptor ---

/// What happens when a fallback INSERT hits an existing key.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Append-only migration: existing rows win, the incoming row is reported as a duplicate skip.
    DoNothing,
    /// Upsert from an incremental audit trail: the incoming row overwrites.
    DoUpdate,
}

impl ConflictPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictPolicy::DoNothing => "do_nothing",
            ConflictPolicy::DoUpdate => "do_update",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetColumn {
    pub name: &'static str,
    pub pg_type: PgType,
}

pub const fn col(name: &'static str, pg_type: PgType) -> TargetColumn {
    TargetColumn { name, pg_type }
}

#[derive(Debug, Clone, Copy)]
pub struct TargetTable {
    pub name: &'static str,
    pub columns: &'static [TargetColumn],
    /// Columns of the unique constraint used as the conflict target.
    pub key_columns: &'static [&'static str],
    pub conflict: ConflictPolicy,
    /// Columns overwritten by `DO UPDATE`; empty means every non-key column.
    pub update_columns: &'static [&'static str],
    /// Stamp `modified_date = CURRENT_TIMESTAMP` when `DO UPDATE` fires.
    pub touch_modified_date: bool,
}

impl TargetTable {
    pub fn column_names(&self) -> Vec<&'static str> {
        self.columns.iter().map(|c| c.name).collect()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn assignment_columns(&self) -> Vec<&'static str> {
        if !self.update_columns.is_empty() {
            return self.update_columns.to_vec();
        }
        self.columns
            .iter()
            .map(|c| c.name)
            .filter(|name| !self.key_columns.contains(name))
            .filter(|name| !(self.touch_modified_date && *name == "modified_date"))
            .collect()
    }

    /// Checks the descriptor is internally consistent before any I/O.
    pub fn validate(&self) -> Result<(), String> {
        if self.columns.is_empty() {
            return Err(format!("Target table {} has no columns", self.name));
        }
        if self.key_columns.is_empty() {
            return Err(format!("Target table {} has no key columns", self.name));
        }
        for key in self.key_columns.iter().chain(self.update_columns.iter()) {
            if self.column_index(key).is_none() {
                return Err(format!(
                    "Target table {} references unknown column {}",
                    self.name, key
                ));
            }
        }
        Ok(())
    }
}

// --- Skips ---

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SkipKind {
    MissingField,
    ForeignKey,
    InvalidValue,
    Duplicate,
    /// Unexpected failure while decoding or computing a row; counted as errored.
    TransformError,
}

impl SkipKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipKind::MissingField => "missing_field",
            SkipKind::ForeignKey => "foreign_key",
            SkipKind::InvalidValue => "invalid_value",
            SkipKind::Duplicate => "duplicate",
            SkipKind::TransformError => "transform_error",
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, SkipKind::TransformError)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkipReason {
    pub kind: SkipKind,
    pub message: String,
}

impl SkipReason {
    pub fn new(kind: SkipKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SkipRecord {
    pub record_id: String,
    pub kind: SkipKind,
    pub reason: String,
}

impl SkipRecord {
    pub fn new(record_id: impl Into<String>, reason: SkipReason) -> Self {
        Self {
            record_id: record_id.into(),
            kind: reason.kind,
            reason: reason.message,
        }
    }
}

// --- Counters and Report ---

/// Per-run tallies. `processed == migrated + skipped + errored` once a run
/// has drained; `migrated == inserted + updated + superseded`.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RunCounters {
    pub processed: u64,
    pub migrated: u64,
    pub skipped: u64,
    pub errored: u64,
    pub inserted: u64,
    pub updated: u64,
    /// Upsert rows replaced by a later row with the same key inside one batch.
    pub superseded: u64,
}

impl RunCounters {
    pub fn is_balanced(&self) -> bool {
        self.processed == self.migrated + self.skipped + self.errored
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub run_id: String,
    pub table: String,
    pub state: RunState,
    #[serde(flatten)]
    pub counters: RunCounters,
    #[serde(default)]
    pub skip_details: Vec<SkipRecord>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub dry_run: bool,
}

impl RunReport {
    pub fn new(table: &str) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            table: table.to_string(),
            state: RunState::NotStarted,
            counters: RunCounters::default(),
            skip_details: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
            error: None,
            dry_run: false,
        }
    }

    pub fn migrated(&self) -> u64 {
        self.counters.migrated
    }
}

// --- Run Options ---

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub batch_size: Option<usize>,
    pub use_transaction: bool,
    pub truncate: bool,
    pub parallel: bool,
    pub dry_run: bool,
    pub max_duration: Option<Duration>,
    pub pipeline: PipelineSettings,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            batch_size: None,
            use_transaction: false,
            truncate: false,
            parallel: false,
            dry_run: false,
            max_duration: None,
            pipeline: PipelineSettings {
                transform_workers: 1,
                raw_queue_capacity: 10_000,
                write_queue_capacity: 20,
                writers: 1,
            },
        }
    }
}

impl RunOptions {
    pub fn effective_batch_size(&self, table_default: usize) -> usize {
        self.batch_size
            .filter(|size| *size > 0)
            .unwrap_or(table_default)
            .max(1)
    }
}

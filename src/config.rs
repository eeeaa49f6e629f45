// =====================================================
// APPLICATION CONFIGURATION
// =====================================================

use crate::data_transfer::sink::ReportFormat;
use crate::error::MigrationError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_FILE: &str = "datamigrate.json";
const DEFAULT_REPORT_DIR: &str = "migration_outputs";
const DEFAULT_RAW_QUEUE_CAPACITY: usize = 10_000;
const MAX_WRITERS: usize = 4;

fn default_report_dir() -> String {
    DEFAULT_REPORT_DIR.to_string()
}

// --- File Model ---

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStrings {
    pub sql_server: Option<String>,
    pub postgre_sql: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct PipelineConfig {
    pub transform_workers: Option<usize>,
    pub raw_queue_capacity: Option<usize>,
    pub write_queue_capacity: Option<usize>,
    pub writers: Option<usize>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct MigrationSettings {
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub use_transaction: bool,
    #[serde(default)]
    pub truncate_before_run: bool,
    pub max_duration_secs: Option<u64>,
    #[serde(default = "default_report_dir")]
    pub report_dir: String,
    #[serde(default)]
    pub report_format: ReportFormat,
    pub history_db: Option<String>,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

impl Default for MigrationSettings {
    fn default() -> Self {
        Self {
            batch_size: None,
            use_transaction: false,
            truncate_before_run: false,
            max_duration_secs: None,
            report_dir: default_report_dir(),
            report_format: ReportFormat::default(),
            history_db: None,
            pipeline: PipelineConfig::default(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    #[serde(default)]
    pub connection_strings: ConnectionStrings,
    #[serde(default)]
    pub migration: MigrationSettings,
}

// --- Resolved Pipeline Settings ---

/// Queue and worker sizes for the parallel pipeline after defaults are applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSettings {
    pub transform_workers: usize,
    pub raw_queue_capacity: usize,
    pub write_queue_capacity: usize,
    pub writers: usize,
}

impl PipelineConfig {
    pub fn resolve(&self, use_transaction: bool) -> PipelineSettings {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        self.resolve_for(cpus, use_transaction)
    }

    pub fn resolve_for(&self, cpus: usize, use_transaction: bool) -> PipelineSettings {
        let transform_workers = self
            .transform_workers
            .filter(|n| *n > 0)
            .unwrap_or_else(|| cpus.saturating_sub(1).max(1));
        let raw_queue_capacity = self
            .raw_queue_capacity
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_RAW_QUEUE_CAPACITY);
        let write_queue_capacity = self
            .write_queue_capacity
            .filter(|n| *n > 0)
            .unwrap_or_else(|| (raw_queue_capacity / 500).max(4));

        // One transaction-bound connection cannot be shared between writers.
        let writers = if use_transaction {
            1
        } else {
            self.writers
                .filter(|n| *n > 0)
                .unwrap_or_else(|| (cpus / 2).clamp(1, MAX_WRITERS))
        };

        PipelineSettings {
            transform_workers,
            raw_queue_capacity,
            write_queue_capacity,
            writers,
        }
    }
}

// --- Loading ---

impl AppConfig {
    /// Loads `.env`, the JSON config file and `DATAMIGRATE_*` overrides.
    ///
    /// An explicit path must exist. Without one, `datamigrate.json` in the
    /// working directory is used when present.
    pub fn load(path: Option<&Path>) -> Result<AppConfig, MigrationError> {
        if let Err(e) = dotenvy::dotenv() {
            if !e.not_found() {
                log::warn!("Failed to read .env file: {}", e);
            }
        }

        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default_path = PathBuf::from(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    Self::from_file(&default_path)?
                } else {
                    log::debug!("No {} found, using defaults", DEFAULT_CONFIG_FILE);
                    AppConfig::default()
                }
            }
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<AppConfig, MigrationError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            MigrationError::Configuration(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<AppConfig, MigrationError> {
        serde_json::from_str(raw).map_err(|e| {
            MigrationError::Configuration(format!("Failed to parse config: {}", e))
        })
    }

    pub fn apply_overrides<F>(&mut self, get: F) -> Result<(), MigrationError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let value_of = |key: &str| get(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(value) = value_of("DATAMIGRATE_SQLSERVER") {
            self.connection_strings.sql_server = Some(value);
        }
        if let Some(value) = value_of("DATAMIGRATE_POSTGRES") {
            self.connection_strings.postgre_sql = Some(value);
        }
        if let Some(value) = value_of("DATAMIGRATE_BATCH_SIZE") {
            self.migration.batch_size = Some(parse_env("DATAMIGRATE_BATCH_SIZE", &value)?);
        }
        if let Some(value) = value_of("DATAMIGRATE_USE_TRANSACTION") {
            self.migration.use_transaction = parse_bool("DATAMIGRATE_USE_TRANSACTION", &value)?;
        }
        if let Some(value) = value_of("DATAMIGRATE_MAX_DURATION_SECS") {
            self.migration.max_duration_secs =
                Some(parse_env("DATAMIGRATE_MAX_DURATION_SECS", &value)?);
        }
        if let Some(value) = value_of("DATAMIGRATE_REPORT_DIR") {
            self.migration.report_dir = value;
        }
        if let Some(value) = value_of("DATAMIGRATE_HISTORY_DB") {
            self.migration.history_db = Some(value);
        }
        if let Some(value) = value_of("DATAMIGRATE_TRANSFORM_WORKERS") {
            self.migration.pipeline.transform_workers =
                Some(parse_env("DATAMIGRATE_TRANSFORM_WORKERS", &value)?);
        }

        Ok(())
    }

    /// Location of the sqlite run-history database.
    pub fn history_db_path(&self) -> PathBuf {
        match self.migration.history_db.as_deref() {
            Some(path) => PathBuf::from(path),
            None => dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("datamigrate")
                .join("history.db"),
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, MigrationError> {
    value.parse::<T>().map_err(|_| {
        MigrationError::Configuration(format!("{} has an invalid value '{}'", key, value))
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, MigrationError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(MigrationError::Configuration(format!(
            "{} has an invalid value '{}'",
            key, value
        ))),
    }
}

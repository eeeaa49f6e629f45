use crate::data_transfer::models::RunReport;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const LOGGED_SKIP_SAMPLE: usize = 20;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReportFormat {
    #[default]
    Json,
    Csv,
}

impl ReportFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportFormat::Json => "json",
            ReportFormat::Csv => "csv",
        }
    }
}

/// Receives the final (or partial, on failure) report of every run.
#[async_trait]
pub trait StatsReporter: Send + Sync {
    async fn report(&self, report: &RunReport) -> Result<(), String>;
}

// --- Log ---

pub struct LogReporter;

#[async_trait]
impl StatsReporter for LogReporter {
    async fn report(&self, report: &RunReport) -> Result<(), String> {
        let c = &report.counters;
        log::info!(
            "[{}] Run {} {}: processed={} migrated={} (inserted={} updated={} superseded={}) skipped={} errored={}",
            report.table,
            report.run_id,
            report.state,
            c.processed,
            c.migrated,
            c.inserted,
            c.updated,
            c.superseded,
            c.skipped,
            c.errored
        );
        for skip in report.skip_details.iter().take(LOGGED_SKIP_SAMPLE) {
            log::info!("[{}]   {}: {}", report.table, skip.record_id, skip.reason);
        }
        if report.skip_details.len() > LOGGED_SKIP_SAMPLE {
            log::info!(
                "[{}]   ... and {} more skipped records",
                report.table,
                report.skip_details.len() - LOGGED_SKIP_SAMPLE
            );
        }
        if let Some(error) = &report.error {
            log::error!("[{}] Run failed: {}", report.table, error);
        }
        Ok(())
    }
}

// --- File ---

pub struct FileReporter {
    dir: PathBuf,
    format: ReportFormat,
}

impl FileReporter {
    pub fn new(dir: impl Into<PathBuf>, format: ReportFormat) -> Self {
        Self {
            dir: dir.into(),
            format,
        }
    }

    pub fn report_path(&self, report: &RunReport) -> PathBuf {
        let stamp = report.started_at.format("%Y%m%d_%H%M%S");
        self.dir.join(format!(
            "{}_{}_{}.{}",
            report.table,
            stamp,
            &report.run_id[..8.min(report.run_id.len())],
            self.format.as_str()
        ))
    }

    fn write_json(path: &Path, report: &RunReport) -> Result<(), String> {
        let file = std::fs::File::create(path)
            .map_err(|e| format!("Failed to create report {}: {}", path.display(), e))?;
        serde_json::to_writer_pretty(file, report)
            .map_err(|e| format!("Failed to write report {}: {}", path.display(), e))
    }

    fn write_csv(path: &Path, report: &RunReport) -> Result<(), String> {
        let mut writer = csv::Writer::from_path(path)
            .map_err(|e| format!("Failed to create report {}: {}", path.display(), e))?;
        let c = &report.counters;

        writer
            .write_record(["table", "state", "processed", "migrated", "skipped", "errored"])
            .map_err(|e| format!("Failed to write report header: {}", e))?;
        writer
            .write_record([
                report.table.clone(),
                report.state.as_str().to_string(),
                c.processed.to_string(),
                c.migrated.to_string(),
                c.skipped.to_string(),
                c.errored.to_string(),
            ])
            .map_err(|e| format!("Failed to write report summary: {}", e))?;

        writer
            .write_record(["record_id", "kind", "reason", "", "", ""])
            .map_err(|e| format!("Failed to write skip header: {}", e))?;
        for skip in &report.skip_details {
            writer
                .write_record([skip.record_id.as_str(), skip.kind.as_str(), skip.reason.as_str(), "", "", ""])
                .map_err(|e| format!("Failed to write skip record: {}", e))?;
        }
        writer
            .flush()
            .map_err(|e| format!("Failed to flush report {}: {}", path.display(), e))
    }
}

#[async_trait]
impl StatsReporter for FileReporter {
    async fn report(&self, report: &RunReport) -> Result<(), String> {
        std::fs::create_dir_all(&self.dir)
            .map_err(|e| format!("Failed to create report directory {}: {}", self.dir.display(), e))?;
        let path = self.report_path(report);
        match self.format {
            ReportFormat::Json => Self::write_json(&path, report)?,
            ReportFormat::Csv => Self::write_csv(&path, report)?,
        }
        log::info!("[{}] Report written to {}", report.table, path.display());
        Ok(())
    }
}

// --- Fan-out ---

#[derive(Default)]
pub struct CompositeReporter {
    reporters: Vec<Box<dyn StatsReporter>>,
}

impl CompositeReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, reporter: impl StatsReporter + 'static) -> Self {
        self.reporters.push(Box::new(reporter));
        self
    }
}

#[async_trait]
impl StatsReporter for CompositeReporter {
    /// Every reporter gets the report even when an earlier one fails.
    async fn report(&self, report: &RunReport) -> Result<(), String> {
        let mut errors = Vec::new();
        for reporter in &self.reporters {
            if let Err(e) = reporter.report(report).await {
                errors.push(e);
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.join("; "))
        }
    }
}

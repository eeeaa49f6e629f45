// =====================================================
// RUN-LEVEL ERRORS
// =====================================================

use thiserror::Error;

/// Fatal outcome of a migration run.
///
/// Per-row problems never surface here; they are recorded as skips on the
/// run report. Everything in this enum stops the run.
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Lookup '{name}' failed: {message}")]
    Lookup { name: String, message: String },

    #[error("Source read failed: {0}")]
    Source(String),

    #[error("Batch load into '{table}' failed: {message}")]
    BatchLoad { table: String, message: String },

    #[error("Migration cancelled")]
    Cancelled,

    #[error("Migration exceeded its maximum duration of {0} seconds")]
    TimedOut(u64),

    #[error("Invalid run state transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Run history storage error: {0}")]
    Storage(String),
}

impl MigrationError {
    pub fn batch_load(table: &str, message: impl Into<String>) -> Self {
        MigrationError::BatchLoad {
            table: table.to_string(),
            message: message.into(),
        }
    }

    pub fn lookup(name: &str, message: impl Into<String>) -> Self {
        MigrationError::Lookup {
            name: name.to_string(),
            message: message.into(),
        }
    }

    /// Short machine-friendly label stored alongside failed run reports.
    pub fn kind(&self) -> &'static str {
        match self {
            MigrationError::Configuration(_) => "configuration",
            MigrationError::Connection(_) => "connection",
            MigrationError::Lookup { .. } => "lookup",
            MigrationError::Source(_) => "source",
            MigrationError::BatchLoad { .. } => "batch_load",
            MigrationError::Cancelled => "cancelled",
            MigrationError::TimedOut(_) => "timed_out",
            MigrationError::InvalidTransition { .. } => "invalid_transition",
            MigrationError::Storage(_) => "storage",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_name_the_failing_part() {
        let err = MigrationError::lookup("event_master", "relation does not exist");
        assert_eq!(
            err.to_string(),
            "Lookup 'event_master' failed: relation does not exist"
        );
        assert_eq!(err.kind(), "lookup");

        let err = MigrationError::batch_load("nfa_po_condition", "duplicate key");
        assert!(err.to_string().contains("nfa_po_condition"));
        assert_eq!(MigrationError::TimedOut(30).kind(), "timed_out");
    }
}

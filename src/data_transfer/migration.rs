use crate::data_transfer::lookup::LookupSpec;
use crate::data_transfer::mapper::ColumnMapping;
use crate::data_transfer::models::{SkipReason, TargetTable};
use crate::data_transfer::transform::TransformContext;
use crate::db_types::{ColumnReader, CompositeKey, PgValue};

/// A fully validated row ready for the target table.
pub trait TargetRow: Send + 'static {
    /// Values of the descriptor's key columns, in order.
    fn key(&self) -> CompositeKey;
    /// One value per descriptor column, in descriptor order.
    fn values(&self) -> Vec<PgValue>;
}

/// Everything the engine needs to migrate one legacy table.
pub trait TableMigration: Send + Sync + 'static {
    type Source: Send + 'static;
    type Target: TargetRow;

    fn target(&self) -> &'static TargetTable;

    fn lookups(&self) -> Vec<LookupSpec>;

    fn source_query(&self) -> &'static str;

    fn decode(&self, row: &dyn ColumnReader) -> Result<Self::Source, String>;

    /// Identifier used in skip reports, e.g. `PBID:1042`.
    fn record_id(&self, source: &Self::Source) -> String;

    fn transform(
        &self,
        source: &Self::Source,
        ctx: &TransformContext<'_>,
    ) -> Result<Self::Target, SkipReason>;

    fn mappings(&self) -> Vec<ColumnMapping>;

    fn default_batch_size(&self) -> usize {
        500
    }

    /// Source update sequence for "latest wins" tables.
    fn ordering_key(&self, _source: &Self::Source) -> Option<i64> {
        None
    }

    fn is_ordered(&self) -> bool {
        false
    }

    /// Statement run on the target after the last batch.
    fn post_load_sql(&self) -> Option<&'static str> {
        None
    }
}

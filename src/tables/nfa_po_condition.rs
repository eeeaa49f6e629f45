use crate::data_transfer::lookup::{int_key, LookupSpec};
use crate::data_transfer::mapper::{map, ColumnMapping};
use crate::data_transfer::migration::{TableMigration, TargetRow};
use crate::data_transfer::models::{col, ConflictPolicy, SkipReason, TargetColumn, TargetTable};
use crate::data_transfer::transform::{parse_decimal, require, TransformContext};
use crate::db_types::{ColumnReader, CompositeKey, PgType, PgValue};
use rust_decimal::Decimal;

pub const NFA_LINE: &str = "nfa_line";
pub const PO_CONDITION_MASTER: &str = "po_condition_master";

/// Refreshes `nfa_line.po_condition_id` with the comma-joined condition ids
/// of each line.
pub const REFRESH_NFA_LINE_SQL: &str = "UPDATE nfa_line nl \
     SET po_condition_id = agg.ids \
     FROM ( \
         SELECT nfa_line_id, \
                string_agg(nfa_po_condition_id::text, ',' ORDER BY nfa_po_condition_id) AS ids \
         FROM nfa_po_condition \
         WHERE nfa_line_id IS NOT NULL \
         GROUP BY nfa_line_id \
     ) AS agg \
     WHERE nl.nfa_line_id = agg.nfa_line_id";

const COLUMNS: &[TargetColumn] = &[
    col("nfa_po_condition_id", PgType::Int4),
    col("nfa_line_id", PgType::Int4),
    col("po_condition_id", PgType::Int4),
    col("value", PgType::Numeric),
    col("created_by", PgType::Int4),
    col("created_date", PgType::TimestampTz),
    col("modified_by", PgType::Int4),
    col("modified_date", PgType::TimestampTz),
    col("is_deleted", PgType::Bool),
    col("deleted_by", PgType::Int4),
    col("deleted_date", PgType::TimestampTz),
];

pub const NFA_PO_CONDITION_TABLE: TargetTable = TargetTable {
    name: "nfa_po_condition",
    columns: COLUMNS,
    key_columns: &["nfa_po_condition_id"],
    conflict: ConflictPolicy::DoNothing,
    update_columns: &[],
    touch_modified_date: false,
};

#[derive(Debug, Clone, Default)]
pub struct PoConditionSource {
    pub id: i32,
    pub award_event_item_id: Option<i32>,
    pub po_condition_id: Option<i32>,
    pub percentage: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PoConditionRow {
    pub nfa_po_condition_id: i32,
    pub nfa_line_id: i32,
    pub po_condition_id: i32,
    pub value: Decimal,
}

impl TargetRow for PoConditionRow {
    fn key(&self) -> CompositeKey {
        CompositeKey::from(self.nfa_po_condition_id)
    }

    fn values(&self) -> Vec<PgValue> {
        vec![
            PgValue::Int4(Some(self.nfa_po_condition_id)),
            PgValue::Int4(Some(self.nfa_line_id)),
            PgValue::Int4(Some(self.po_condition_id)),
            PgValue::Numeric(Some(self.value)),
            PgValue::Int4(None),
            PgValue::TimestampTz(None),
            PgValue::Int4(None),
            PgValue::TimestampTz(None),
            PgValue::Bool(Some(false)),
            PgValue::Int4(None),
            PgValue::TimestampTz(None),
        ]
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NfaPoConditionMigration;

impl TableMigration for NfaPoConditionMigration {
    type Source = PoConditionSource;
    type Target = PoConditionRow;

    fn target(&self) -> &'static TargetTable {
        &NFA_PO_CONDITION_TABLE
    }

    fn lookups(&self) -> Vec<LookupSpec> {
        vec![
            LookupSpec::target_set(
                NFA_LINE,
                "SELECT nfa_line_id FROM nfa_line WHERE nfa_line_id IS NOT NULL",
                int_key,
            ),
            LookupSpec::target_set(
                PO_CONDITION_MASTER,
                "SELECT po_condition_id FROM po_condition_master WHERE po_condition_id IS NOT NULL",
                int_key,
            ),
        ]
    }

    fn source_query(&self) -> &'static str {
        "SELECT AwardEventPoConditionId, AwardEventItemId, PoConditionId, Percentage \
         FROM TBL_AwardEventPoCondition \
         WHERE AwardEventPoConditionId IS NOT NULL \
         ORDER BY AwardEventPoConditionId"
    }

    fn decode(&self, row: &dyn ColumnReader) -> Result<PoConditionSource, String> {
        Ok(PoConditionSource {
            id: row
                .get_i32(0)?
                .ok_or_else(|| "AwardEventPoConditionId is null".to_string())?,
            award_event_item_id: row.get_i32(1)?,
            po_condition_id: row.get_i32(2)?,
            percentage: row.get_string(3)?,
        })
    }

    fn record_id(&self, source: &PoConditionSource) -> String {
        format!("AwardEventPoConditionId:{}", source.id)
    }

    fn transform(
        &self,
        source: &PoConditionSource,
        ctx: &TransformContext<'_>,
    ) -> Result<PoConditionRow, SkipReason> {
        let nfa_line_id = require(source.award_event_item_id, "AwardEventItemId")?;
        let po_condition_id = require(source.po_condition_id, "PoConditionId")?;

        ctx.ensure_exists(NFA_LINE, "AwardEventItemId", nfa_line_id)?;
        ctx.ensure_exists(PO_CONDITION_MASTER, "PoConditionId", po_condition_id)?;

        let value = parse_decimal(source.percentage.as_deref(), "Percentage")?;

        Ok(PoConditionRow {
            nfa_po_condition_id: source.id,
            nfa_line_id,
            po_condition_id,
            value,
        })
    }

    fn mappings(&self) -> Vec<ColumnMapping> {
        vec![
            map("AwardEventPoConditionId", "nfa_po_condition_id", "direct"),
            map("AwardEventItemId", "nfa_line_id", "required, FK nfa_line"),
            map("PoConditionId", "po_condition_id", "required, FK po_condition_master"),
            map("Percentage", "value", "text parsed as decimal"),
            map("-", "created_by", "null"),
            map("-", "created_date", "null"),
            map("-", "modified_by", "null"),
            map("-", "modified_date", "null"),
            map("-", "is_deleted", "false"),
            map("-", "deleted_by", "null"),
            map("-", "deleted_date", "null"),
        ]
    }

    fn post_load_sql(&self) -> Option<&'static str> {
        Some(REFRESH_NFA_LINE_SQL)
    }
}

use crate::data_transfer::lookup::{int_key, int_pair_entry, LookupSpec};
use crate::data_transfer::mapper::{map, ColumnMapping};
use crate::data_transfer::migration::{TableMigration, TargetRow};
use crate::data_transfer::models::{col, ConflictPolicy, SkipKind, SkipReason, TargetColumn, TargetTable};
use crate::data_transfer::transform::{optional_sum, require, TransformContext};
use crate::db_types::{ColumnReader, CompositeKey, PgType, PgValue};
use crate::tables::{event_master, EVENT_MASTER};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

pub const BUYER_CHARGES: &str = "TBL_PB_BUYEROTHERCHARGES";
pub const PRICE_BID_CHARGES: &str = "price_bid_charges_master";
pub const TAX_MASTER: &str = "tax_master";

const DOCUMENT_ROOT: &str = "/Documents/PriceBidDocuments/";

/// `tax_percentage -> tax_master_id`; the first id seen for a rate wins.
fn tax_entry(row: &dyn ColumnReader) -> Result<Option<(CompositeKey, i32)>, String> {
    match (row.get_i32(0)?, row.get_decimal(1)?) {
        (Some(id), Some(rate)) => Ok(Some((CompositeKey::from(rate), id))),
        _ => Ok(None),
    }
}

const COLUMNS: &[TargetColumn] = &[
    col("event_id", PgType::Int4),
    col("user_price_bid_lot_charges_id", PgType::Int4),
    col("price_bid_charges_id", PgType::Int4),
    col("supplier_id", PgType::Int4),
    col("percentage", PgType::Numeric),
    col("basic_lot_charges_amount", PgType::Numeric),
    col("tax_master_id", PgType::Int4),
    col("tax_percentage", PgType::Numeric),
    col("tax_amount", PgType::Numeric),
    col("total_lot_charges_amount", PgType::Numeric),
    col("supplier_lot_charges_file_name", PgType::Text),
    col("supplier_lot_charges_file_path", PgType::Text),
    col("reason", PgType::Text),
    col("created_by", PgType::Int4),
    col("created_date", PgType::TimestampTz),
    col("modified_by", PgType::Int4),
    col("modified_date", PgType::TimestampTz),
    col("is_deleted", PgType::Bool),
    col("deleted_by", PgType::Int4),
    col("deleted_date", PgType::TimestampTz),
];

pub const LOT_CHARGES_TABLE: TargetTable = TargetTable {
    name: "supplier_price_bid_lot_charges",
    columns: COLUMNS,
    key_columns: &["event_id", "supplier_id", "user_price_bid_lot_charges_id"],
    conflict: ConflictPolicy::DoNothing,
    update_columns: &[],
    touch_modified_date: false,
};

#[derive(Debug, Clone, Default)]
pub struct LotChargesSource {
    pub charges_id: i32,
    pub event_id: Option<i32>,
    pub buyer_charges_id: Option<i32>,
    pub amount: Option<Decimal>,
    pub supplier_id: Option<i32>,
    pub percentage: Option<Decimal>,
    pub file_name: Option<String>,
    pub gst_per: Option<Decimal>,
    pub gst_amount: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LotChargesRow {
    pub event_id: i32,
    pub user_price_bid_lot_charges_id: i32,
    pub price_bid_charges_id: i32,
    pub supplier_id: i32,
    pub percentage: Option<Decimal>,
    pub basic_lot_charges_amount: Option<Decimal>,
    pub tax_master_id: Option<i32>,
    pub tax_percentage: Option<Decimal>,
    pub tax_amount: Option<Decimal>,
    pub total_lot_charges_amount: Option<Decimal>,
    pub file_name: String,
    pub file_path: String,
    pub created_date: DateTime<Utc>,
}

impl TargetRow for LotChargesRow {
    fn key(&self) -> CompositeKey {
        CompositeKey::from((self.event_id, self.supplier_id, self.user_price_bid_lot_charges_id))
    }

    fn values(&self) -> Vec<PgValue> {
        vec![
            PgValue::Int4(Some(self.event_id)),
            PgValue::Int4(Some(self.user_price_bid_lot_charges_id)),
            PgValue::Int4(Some(self.price_bid_charges_id)),
            PgValue::Int4(Some(self.supplier_id)),
            PgValue::Numeric(self.percentage),
            PgValue::Numeric(self.basic_lot_charges_amount),
            PgValue::Int4(self.tax_master_id),
            PgValue::Numeric(self.tax_percentage),
            PgValue::Numeric(self.tax_amount),
            PgValue::Numeric(self.total_lot_charges_amount),
            PgValue::Text(Some(self.file_name.clone())),
            PgValue::Text(Some(self.file_path.clone())),
            PgValue::Text(Some(String::new())),
            PgValue::Int4(None),
            PgValue::TimestampTz(Some(self.created_date)),
            PgValue::Int4(None),
            PgValue::TimestampTz(None),
            PgValue::Bool(Some(false)),
            PgValue::Int4(None),
            PgValue::TimestampTz(None),
        ]
    }
}

fn resolve_tax_master(
    ctx: &TransformContext<'_>,
    gst_per: Option<Decimal>,
    gst_amount: Option<Decimal>,
) -> Result<Option<i32>, SkipReason> {
    match gst_per {
        Some(rate) => ctx
            .lookups
            .resolve(TAX_MASTER, &CompositeKey::from(rate))
            .map(Some)
            .ok_or_else(|| {
                SkipReason::new(
                    SkipKind::ForeignKey,
                    format!("tax_master_id not found for GSTPer={}", rate),
                )
            }),
        None => match gst_amount {
            Some(amount) if !amount.is_zero() => Err(SkipReason::new(
                SkipKind::InvalidValue,
                format!("GSTPer is null but GSTAmount is {}", amount),
            )),
            _ => Ok(None),
        },
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LotChargesMigration;

impl TableMigration for LotChargesMigration {
    type Source = LotChargesSource;
    type Target = LotChargesRow;

    fn target(&self) -> &'static TargetTable {
        &LOT_CHARGES_TABLE
    }

    fn lookups(&self) -> Vec<LookupSpec> {
        vec![
            event_master(),
            LookupSpec::target_set(
                PRICE_BID_CHARGES,
                "SELECT price_bid_charges_id FROM price_bid_charges_master WHERE price_bid_charges_id IS NOT NULL",
                int_key,
            ),
            LookupSpec::source_map(
                BUYER_CHARGES,
                "SELECT PB_BuyerChargesId, PB_ChargesId FROM TBL_PB_BUYEROTHERCHARGES \
                 WHERE PB_BuyerChargesId IS NOT NULL AND PB_ChargesId IS NOT NULL",
                int_pair_entry,
            ),
            LookupSpec::target_map(
                TAX_MASTER,
                "SELECT tax_master_id, tax_percentage FROM tax_master WHERE tax_percentage IS NOT NULL",
                tax_entry,
            ),
        ]
    }

    fn source_query(&self) -> &'static str {
        "SELECT PB_SupplerChargesId, EVENT_ID, PB_BuyerChargesId, Amount, SUPPLIER_ID, Percentage, \
         LotChargeFileName, GSTPer, GSTAmount \
         FROM TBL_PB_SUPPLIEROTHERCHARGES WHERE PB_SupplerChargesId IS NOT NULL"
    }

    fn decode(&self, row: &dyn ColumnReader) -> Result<LotChargesSource, String> {
        Ok(LotChargesSource {
            charges_id: row
                .get_i32(0)?
                .ok_or_else(|| "PB_SupplerChargesId is null".to_string())?,
            event_id: row.get_i32(1)?,
            buyer_charges_id: row.get_i32(2)?,
            amount: row.get_decimal(3)?,
            supplier_id: row.get_i32(4)?,
            percentage: row.get_decimal(5)?,
            file_name: row.get_string(6)?,
            gst_per: row.get_decimal(7)?,
            gst_amount: row.get_decimal(8)?,
        })
    }

    fn record_id(&self, source: &LotChargesSource) -> String {
        format!("PB_SupplerChargesId:{}", source.charges_id)
    }

    fn transform(
        &self,
        source: &LotChargesSource,
        ctx: &TransformContext<'_>,
    ) -> Result<LotChargesRow, SkipReason> {
        let event_id = require(source.event_id, "EVENT_ID")?;
        let supplier_id = require(source.supplier_id, "SUPPLIER_ID")?;
        let buyer_charges_id = require(source.buyer_charges_id, "PB_BuyerChargesId")?;

        ctx.ensure_exists(EVENT_MASTER, "event_id", event_id)?;
        let charges_id = ctx
            .lookups
            .resolve(BUYER_CHARGES, &CompositeKey::from(buyer_charges_id))
            .ok_or_else(|| {
                SkipReason::new(
                    SkipKind::ForeignKey,
                    format!(
                        "PB_BuyerChargesId={} not found in {}",
                        buyer_charges_id, BUYER_CHARGES
                    ),
                )
            })?;
        ctx.ensure_exists(PRICE_BID_CHARGES, "PB_ChargesId", charges_id)?;
        let tax_master_id = resolve_tax_master(ctx, source.gst_per, source.gst_amount)?;

        let file_name = source.file_name.clone().unwrap_or_default();
        Ok(LotChargesRow {
            event_id,
            user_price_bid_lot_charges_id: buyer_charges_id,
            price_bid_charges_id: charges_id,
            supplier_id,
            percentage: source.percentage,
            basic_lot_charges_amount: source.amount,
            tax_master_id,
            tax_percentage: source.gst_per,
            tax_amount: source.gst_amount,
            total_lot_charges_amount: optional_sum(source.amount, source.gst_amount)?,
            file_path: format!("{}{}", DOCUMENT_ROOT, file_name),
            file_name,
            created_date: ctx.run_started_at,
        })
    }

    fn mappings(&self) -> Vec<ColumnMapping> {
        vec![
            map("EVENT_ID", "event_id", "required, FK event_master"),
            map("PB_BuyerChargesId", "user_price_bid_lot_charges_id", "required"),
            map(
                "PB_BuyerChargesId",
                "price_bid_charges_id",
                "TBL_PB_BUYEROTHERCHARGES.PB_ChargesId, FK price_bid_charges_master",
            ),
            map("SUPPLIER_ID", "supplier_id", "required"),
            map("Percentage", "percentage", "direct"),
            map("Amount", "basic_lot_charges_amount", "direct"),
            map("GSTPer", "tax_master_id", "tax_master by tax_percentage, first wins"),
            map("GSTPer", "tax_percentage", "direct"),
            map("GSTAmount", "tax_amount", "direct"),
            map("Amount, GSTAmount", "total_lot_charges_amount", "Amount + GSTAmount, null when both null"),
            map("LotChargeFileName", "supplier_lot_charges_file_name", "default ''"),
            map("LotChargeFileName", "supplier_lot_charges_file_path", "'/Documents/PriceBidDocuments/' + name"),
            map("-", "reason", "''"),
            map("-", "created_by", "null"),
            map("-", "created_date", "run start"),
            map("-", "modified_by", "null"),
            map("-", "modified_date", "null"),
            map("-", "is_deleted", "false"),
            map("-", "deleted_by", "null"),
            map("-", "deleted_date", "null"),
        ]
    }
}

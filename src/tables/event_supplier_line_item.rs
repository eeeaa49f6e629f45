//! Supplier bid lines, from the price-bid table (append) and from the
//! auction audit trail (latest update wins).

use crate::data_transfer::lookup::{int_key, LookupSpec};
use crate::data_transfer::mapper::{map, ColumnMapping};
use crate::data_transfer::migration::{TableMigration, TargetRow};
use crate::data_transfer::models::{col, ConflictPolicy, SkipReason, TargetColumn, TargetTable};
use crate::data_transfer::transform::{discounted_price, line_total, naive_as_utc, require, TransformContext};
use crate::db_types::{ColumnReader, CompositeKey, PgType, PgValue};
use crate::tables::{event_master, pair_entry, supplier_master, EVENT_MASTER, SUPPLIER_MASTER};
use chrono::{DateTime, NaiveDateTime, Utc};
use rust_decimal::Decimal;

pub const EVENT_ITEMS: &str = "event_items";
pub const BUYER_LINES: &str = "TBL_PB_BUYER";
pub const PRICE_BIDS: &str = "event_supplier_price_bid";

fn line_item_lookups() -> Vec<LookupSpec> {
    vec![
        event_master(),
        supplier_master(),
        LookupSpec::target_set(EVENT_ITEMS, "SELECT event_item_id FROM event_items", int_key),
        LookupSpec::source_map(
            BUYER_LINES,
            "SELECT EVENTID, PRTRANSID, PBID FROM TBL_PB_BUYER \
             WHERE EVENTID IS NOT NULL AND PRTRANSID IS NOT NULL AND PBID IS NOT NULL",
            pair_entry,
        ),
        LookupSpec::target_map(
            PRICE_BIDS,
            "SELECT supplier_id, event_id, event_supplier_price_bid_id FROM event_supplier_price_bid",
            pair_entry,
        ),
    ]
}

/// Legacy bid status codes.
pub fn item_bid_status(code: Option<i32>) -> Option<&'static str> {
    match code? {
        0 => Some("Bidding"),
        1 => Some("Included"),
        2 => Some("Regret"),
        _ => None,
    }
}

/// Keys shared by both routines, checked in the same order.
struct ResolvedLine {
    event_id: i32,
    supplier_id: i32,
    erp_pr_lines_id: i32,
    tax_master_id: i32,
    event_item_id: i32,
    price_bid_id: i32,
}

fn resolve_line(
    ctx: &TransformContext<'_>,
    event_id: Option<i32>,
    supplier_id: Option<i32>,
    pr_trans_id: Option<i32>,
    gst_id: Option<i32>,
) -> Result<ResolvedLine, SkipReason> {
    let event_id = require(event_id, "EVENTID")?;
    let supplier_id = require(supplier_id, "SUPPLIER_ID")?;
    let erp_pr_lines_id = require(pr_trans_id, "PRTRANSID")?;
    let tax_master_id = require(gst_id, "GSTID")?;

    ctx.ensure_exists(EVENT_MASTER, "event_id", event_id)?;
    ctx.ensure_exists(SUPPLIER_MASTER, "supplier_id", supplier_id)?;
    let event_item_id = ctx.resolve(BUYER_LINES, "EVENTID|PRTRANSID", (event_id, erp_pr_lines_id))?;
    ctx.ensure_exists(EVENT_ITEMS, "event_item_id", event_item_id)?;
    let price_bid_id = ctx.resolve(PRICE_BIDS, "SUPPLIER_ID|EVENTID", (supplier_id, event_id))?;

    Ok(ResolvedLine {
        event_id,
        supplier_id,
        erp_pr_lines_id,
        tax_master_id,
        event_item_id,
        price_bid_id,
    })
}

struct BidAmounts {
    qty: Decimal,
    unit_price: Decimal,
    discount_percentage: Decimal,
    final_unit_price: Decimal,
    item_total: Decimal,
}

fn bid_amounts(
    qty: Option<Decimal>,
    unit_price: Option<Decimal>,
    discount: Option<Decimal>,
) -> Result<BidAmounts, SkipReason> {
    let qty = qty.unwrap_or(Decimal::ZERO);
    let unit_price = unit_price.unwrap_or(Decimal::ZERO);
    let discount_percentage = discount.unwrap_or(Decimal::ZERO);
    let final_unit_price = discounted_price(unit_price, discount_percentage)?;
    let item_total = line_total(final_unit_price, qty)?;
    Ok(BidAmounts {
        qty,
        unit_price,
        discount_percentage,
        final_unit_price,
        item_total,
    })
}

// =====================================================
// PRICE BID LINES (append)
// =====================================================

const LINE_ITEM_COLUMNS: &[TargetColumn] = &[
    col("event_supplier_line_item_id", PgType::Int4),
    col("event_id", PgType::Int4),
    col("supplier_id", PgType::Int4),
    col("event_item_id", PgType::Int4),
    col("event_supplier_price_bid_id", PgType::Int4),
    col("erp_pr_lines_id", PgType::Int4),
    col("hsn_code", PgType::Text),
    col("qty", PgType::Numeric),
    col("proposed_qty", PgType::Numeric),
    col("item_bid_status", PgType::Text),
    col("unit_price", PgType::Numeric),
    col("discount_percentage", PgType::Numeric),
    col("final_unit_price", PgType::Numeric),
    col("tax_master_id", PgType::Int4),
    col("tax_percentage", PgType::Numeric),
    col("tax_amount", PgType::Numeric),
    col("item_total", PgType::Numeric),
    col("supplier_ready_stock", PgType::Numeric),
    col("item_delivery_date", PgType::TimestampTz),
    col("created_by", PgType::Int4),
    col("created_date", PgType::TimestampTz),
    col("modified_by", PgType::Int4),
    col("modified_date", PgType::TimestampTz),
    col("is_deleted", PgType::Bool),
    col("deleted_by", PgType::Int4),
    col("deleted_date", PgType::TimestampTz),
];

pub const LINE_ITEM_TABLE: TargetTable = TargetTable {
    name: "event_supplier_line_item",
    columns: LINE_ITEM_COLUMNS,
    key_columns: &["event_supplier_line_item_id"],
    conflict: ConflictPolicy::DoNothing,
    update_columns: &[],
    touch_modified_date: false,
};

#[derive(Debug, Clone)]
pub struct LineItemSource {
    pub pbid: i32,
    pub event_id: Option<i32>,
    pub supplier_id: Option<i32>,
    pub pr_trans_id: Option<i32>,
    pub hsn_code: Option<String>,
    pub qty: Option<Decimal>,
    pub proposed_qty: Option<Decimal>,
    pub item_bid_status: Option<i32>,
    pub unit_price: Option<Decimal>,
    pub discount_per: Option<Decimal>,
    pub gst_id: Option<i32>,
    pub gst_per: Option<Decimal>,
    pub gst_amount: Option<Decimal>,
    pub ready_stock: Option<Decimal>,
    pub delivery_date: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LineItemRow {
    pub event_supplier_line_item_id: i32,
    pub event_id: i32,
    pub supplier_id: i32,
    pub event_item_id: i32,
    pub event_supplier_price_bid_id: i32,
    pub erp_pr_lines_id: i32,
    pub hsn_code: String,
    pub qty: Decimal,
    pub proposed_qty: Decimal,
    pub item_bid_status: Option<&'static str>,
    pub unit_price: Decimal,
    pub discount_percentage: Decimal,
    pub final_unit_price: Decimal,
    pub tax_master_id: i32,
    pub tax_percentage: Decimal,
    pub tax_amount: Decimal,
    pub item_total: Decimal,
    pub supplier_ready_stock: Decimal,
    pub item_delivery_date: Option<DateTime<Utc>>,
    pub created_date: DateTime<Utc>,
}

impl TargetRow for LineItemRow {
    fn key(&self) -> CompositeKey {
        CompositeKey::from(self.event_supplier_line_item_id)
    }

    fn values(&self) -> Vec<PgValue> {
        vec![
            PgValue::Int4(Some(self.event_supplier_line_item_id)),
            PgValue::Int4(Some(self.event_id)),
            PgValue::Int4(Some(self.supplier_id)),
            PgValue::Int4(Some(self.event_item_id)),
            PgValue::Int4(Some(self.event_supplier_price_bid_id)),
            PgValue::Int4(Some(self.erp_pr_lines_id)),
            PgValue::Text(Some(self.hsn_code.clone())),
            PgValue::Numeric(Some(self.qty)),
            PgValue::Numeric(Some(self.proposed_qty)),
            PgValue::Text(self.item_bid_status.map(str::to_string)),
            PgValue::Numeric(Some(self.unit_price)),
            PgValue::Numeric(Some(self.discount_percentage)),
            PgValue::Numeric(Some(self.final_unit_price)),
            PgValue::Int4(Some(self.tax_master_id)),
            PgValue::Numeric(Some(self.tax_percentage)),
            PgValue::Numeric(Some(self.tax_amount)),
            PgValue::Numeric(Some(self.item_total)),
            PgValue::Numeric(Some(self.supplier_ready_stock)),
            PgValue::TimestampTz(self.item_delivery_date),
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

#[derive(Debug, Clone, Copy, Default)]
pub struct LineItemMigration;

impl TableMigration for LineItemMigration {
    type Source = LineItemSource;
    type Target = LineItemRow;

    fn target(&self) -> &'static TargetTable {
        &LINE_ITEM_TABLE
    }

    fn lookups(&self) -> Vec<LookupSpec> {
        line_item_lookups()
    }

    fn source_query(&self) -> &'static str {
        "SELECT PBID, EVENTID, SUPPLIER_ID, PRTRANSID, HSNCode, QTY, ProposedQty, ItemBidStatus, \
         UNIT_PRICE, DiscountPer, GSTID, GSTPer, GSTAmount, AddtheReadyStock, DeliveryDate \
         FROM TBL_PB_SUPPLIER WHERE ISNULL(SEQUENCEID, 0) > 0"
    }

    fn decode(&self, row: &dyn ColumnReader) -> Result<LineItemSource, String> {
        Ok(LineItemSource {
            pbid: row.get_i32(0)?.ok_or_else(|| "PBID is null".to_string())?,
            event_id: row.get_i32(1)?,
            supplier_id: row.get_i32(2)?,
            pr_trans_id: row.get_i32(3)?,
            hsn_code: row.get_string(4)?,
            qty: row.get_decimal(5)?,
            proposed_qty: row.get_decimal(6)?,
            item_bid_status: row.get_i32(7)?,
            unit_price: row.get_decimal(8)?,
            discount_per: row.get_decimal(9)?,
            gst_id: row.get_i32(10)?,
            gst_per: row.get_decimal(11)?,
            gst_amount: row.get_decimal(12)?,
            ready_stock: row.get_decimal(13)?,
            delivery_date: row.get_datetime(14)?,
        })
    }

    fn record_id(&self, source: &LineItemSource) -> String {
        format!("PBID:{}", source.pbid)
    }

    fn transform(&self, source: &LineItemSource, ctx: &TransformContext<'_>) -> Result<LineItemRow, SkipReason> {
        let line = resolve_line(
            ctx,
            source.event_id,
            source.supplier_id,
            source.pr_trans_id,
            source.gst_id,
        )?;
        let amounts = bid_amounts(source.qty, source.unit_price, source.discount_per)?;

        Ok(LineItemRow {
            event_supplier_line_item_id: source.pbid,
            event_id: line.event_id,
            supplier_id: line.supplier_id,
            event_item_id: line.event_item_id,
            event_supplier_price_bid_id: line.price_bid_id,
            erp_pr_lines_id: line.erp_pr_lines_id,
            hsn_code: source.hsn_code.clone().unwrap_or_default(),
            qty: amounts.qty,
            proposed_qty: source.proposed_qty.unwrap_or(Decimal::ZERO),
            item_bid_status: item_bid_status(source.item_bid_status),
            unit_price: amounts.unit_price,
            discount_percentage: amounts.discount_percentage,
            final_unit_price: amounts.final_unit_price,
            tax_master_id: line.tax_master_id,
            tax_percentage: source.gst_per.unwrap_or(Decimal::ZERO),
            tax_amount: source.gst_amount.unwrap_or(Decimal::ZERO),
            item_total: amounts.item_total,
            supplier_ready_stock: source.ready_stock.unwrap_or(Decimal::ZERO),
            item_delivery_date: source.delivery_date.map(naive_as_utc),
            created_date: ctx.run_started_at,
        })
    }

    fn mappings(&self) -> Vec<ColumnMapping> {
        vec![
            map("PBID", "event_supplier_line_item_id", "direct"),
            map("EVENTID", "event_id", "required, FK event_master"),
            map("SUPPLIER_ID", "supplier_id", "required, FK supplier_master"),
            map("EVENTID, PRTRANSID", "event_item_id", "TBL_PB_BUYER.PBID, FK event_items"),
            map("SUPPLIER_ID, EVENTID", "event_supplier_price_bid_id", "lookup event_supplier_price_bid"),
            map("PRTRANSID", "erp_pr_lines_id", "required"),
            map("HSNCode", "hsn_code", "default ''"),
            map("QTY", "qty", "default 0"),
            map("ProposedQty", "proposed_qty", "default 0"),
            map("ItemBidStatus", "item_bid_status", "0=Bidding, 1=Included, 2=Regret, else null"),
            map("UNIT_PRICE", "unit_price", "default 0"),
            map("DiscountPer", "discount_percentage", "default 0"),
            map("UNIT_PRICE, DiscountPer", "final_unit_price", "unit - unit * discount / 100"),
            map("GSTID", "tax_master_id", "required"),
            map("GSTPer", "tax_percentage", "default 0"),
            map("GSTAmount", "tax_amount", "default 0"),
            map("final_unit_price, QTY", "item_total", "final_unit_price * qty"),
            map("AddtheReadyStock", "supplier_ready_stock", "default 0"),
            map("DeliveryDate", "item_delivery_date", "naive, read as UTC"),
            map("-", "created_by", "null"),
            map("-", "created_date", "run start"),
            map("-", "modified_by", "null"),
            map("-", "modified_date", "null"),
            map("-", "is_deleted", "false"),
            map("-", "deleted_by", "null"),
            map("-", "deleted_date", "null"),
        ]
    }

    fn default_batch_size(&self) -> usize {
        2000
    }
}

// =====================================================
// AUCTION LINES (upsert, ordered by UPDATEID)
// =====================================================

const AUCTION_COLUMNS: &[TargetColumn] = &[
    col("event_id", PgType::Int4),
    col("supplier_id", PgType::Int4),
    col("erp_pr_lines_id", PgType::Int4),
    col("event_item_id", PgType::Int4),
    col("event_supplier_price_bid_id", PgType::Int4),
    col("qty", PgType::Numeric),
    col("proposed_qty", PgType::Numeric),
    col("unit_price", PgType::Numeric),
    col("discount_percentage", PgType::Numeric),
    col("final_unit_price", PgType::Numeric),
    col("tax_master_id", PgType::Int4),
    col("tax_percentage", PgType::Numeric),
    col("tax_amount", PgType::Numeric),
    col("item_total", PgType::Numeric),
    col("supplier_ready_stock", PgType::Numeric),
    col("hsn_code", PgType::Text),
    col("item_delivery_date", PgType::TimestampTz),
    col("created_date", PgType::TimestampTz),
    col("modified_date", PgType::TimestampTz),
    col("is_deleted", PgType::Bool),
];

pub const AUCTION_TABLE: TargetTable = TargetTable {
    name: "event_supplier_line_item",
    columns: AUCTION_COLUMNS,
    key_columns: &["event_id", "supplier_id", "erp_pr_lines_id"],
    conflict: ConflictPolicy::DoUpdate,
    update_columns: &[
        "event_item_id",
        "event_supplier_price_bid_id",
        "qty",
        "unit_price",
        "discount_percentage",
        "final_unit_price",
        "tax_master_id",
        "tax_percentage",
        "tax_amount",
        "item_total",
        "proposed_qty",
        "supplier_ready_stock",
        "hsn_code",
        "item_delivery_date",
    ],
    touch_modified_date: true,
};

#[derive(Debug, Clone)]
pub struct AuctionSource {
    pub update_id: i32,
    pub event_id: Option<i32>,
    pub supplier_id: Option<i32>,
    pub pr_trans_id: Option<i32>,
    pub qty: Option<Decimal>,
    pub unit_price: Option<Decimal>,
    pub discount_per: Option<Decimal>,
    pub gst_id: Option<i32>,
    pub gst_per: Option<Decimal>,
    pub gst_amount: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AuctionRow {
    pub event_id: i32,
    pub supplier_id: i32,
    pub erp_pr_lines_id: i32,
    pub event_item_id: i32,
    pub event_supplier_price_bid_id: i32,
    pub qty: Decimal,
    pub unit_price: Decimal,
    pub discount_percentage: Decimal,
    pub final_unit_price: Decimal,
    pub tax_master_id: i32,
    pub tax_percentage: Decimal,
    pub tax_amount: Decimal,
    pub item_total: Decimal,
    pub stamped_at: DateTime<Utc>,
}

impl TargetRow for AuctionRow {
    fn key(&self) -> CompositeKey {
        CompositeKey::from((self.event_id, self.supplier_id, self.erp_pr_lines_id))
    }

    fn values(&self) -> Vec<PgValue> {
        vec![
            PgValue::Int4(Some(self.event_id)),
            PgValue::Int4(Some(self.supplier_id)),
            PgValue::Int4(Some(self.erp_pr_lines_id)),
            PgValue::Int4(Some(self.event_item_id)),
            PgValue::Int4(Some(self.event_supplier_price_bid_id)),
            PgValue::Numeric(Some(self.qty)),
            PgValue::Numeric(Some(Decimal::ZERO)),
            PgValue::Numeric(Some(self.unit_price)),
            PgValue::Numeric(Some(self.discount_percentage)),
            PgValue::Numeric(Some(self.final_unit_price)),
            PgValue::Int4(Some(self.tax_master_id)),
            PgValue::Numeric(Some(self.tax_percentage)),
            PgValue::Numeric(Some(self.tax_amount)),
            PgValue::Numeric(Some(self.item_total)),
            PgValue::Numeric(Some(Decimal::ZERO)),
            PgValue::Text(Some(String::new())),
            PgValue::TimestampTz(None),
            PgValue::TimestampTz(Some(self.stamped_at)),
            PgValue::TimestampTz(Some(self.stamped_at)),
            PgValue::Bool(Some(false)),
        ]
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AuctionLineItemMigration;

impl TableMigration for AuctionLineItemMigration {
    type Source = AuctionSource;
    type Target = AuctionRow;

    fn target(&self) -> &'static TargetTable {
        &AUCTION_TABLE
    }

    fn lookups(&self) -> Vec<LookupSpec> {
        line_item_lookups()
    }

    fn source_query(&self) -> &'static str {
        "SELECT UPDATEID, EVENTID, SUPPLIER_ID, PRTRANSID, QTY, UNIT_PRICE, DiscountPer, GSTID, GSTPer, GSTAmount \
         FROM TBL_AUC_SUPPLIER \
         WHERE ISNULL(UPDATEID, 0) > 0 AND ISNULL(SEQUENCEID, 0) > 0 \
         ORDER BY UPDATEID"
    }

    fn decode(&self, row: &dyn ColumnReader) -> Result<AuctionSource, String> {
        Ok(AuctionSource {
            update_id: row.get_i32(0)?.ok_or_else(|| "UPDATEID is null".to_string())?,
            event_id: row.get_i32(1)?,
            supplier_id: row.get_i32(2)?,
            pr_trans_id: row.get_i32(3)?,
            qty: row.get_decimal(4)?,
            unit_price: row.get_decimal(5)?,
            discount_per: row.get_decimal(6)?,
            gst_id: row.get_i32(7)?,
            gst_per: row.get_decimal(8)?,
            gst_amount: row.get_decimal(9)?,
        })
    }

    fn record_id(&self, source: &AuctionSource) -> String {
        format!("UPDATEID:{}", source.update_id)
    }

    fn transform(&self, source: &AuctionSource, ctx: &TransformContext<'_>) -> Result<AuctionRow, SkipReason> {
        let line = resolve_line(
            ctx,
            source.event_id,
            source.supplier_id,
            source.pr_trans_id,
            source.gst_id,
        )?;
        let amounts = bid_amounts(source.qty, source.unit_price, source.discount_per)?;

        Ok(AuctionRow {
            event_id: line.event_id,
            supplier_id: line.supplier_id,
            erp_pr_lines_id: line.erp_pr_lines_id,
            event_item_id: line.event_item_id,
            event_supplier_price_bid_id: line.price_bid_id,
            qty: amounts.qty,
            unit_price: amounts.unit_price,
            discount_percentage: amounts.discount_percentage,
            final_unit_price: amounts.final_unit_price,
            tax_master_id: line.tax_master_id,
            tax_percentage: source.gst_per.unwrap_or(Decimal::ZERO),
            tax_amount: source.gst_amount.unwrap_or(Decimal::ZERO),
            item_total: amounts.item_total,
            stamped_at: ctx.run_started_at,
        })
    }

    fn mappings(&self) -> Vec<ColumnMapping> {
        vec![
            map("EVENTID", "event_id", "required, FK event_master"),
            map("SUPPLIER_ID", "supplier_id", "required, FK supplier_master"),
            map("PRTRANSID", "erp_pr_lines_id", "required"),
            map("EVENTID, PRTRANSID", "event_item_id", "TBL_PB_BUYER.PBID, FK event_items"),
            map("SUPPLIER_ID, EVENTID", "event_supplier_price_bid_id", "lookup event_supplier_price_bid"),
            map("QTY", "qty", "default 0"),
            map("-", "proposed_qty", "0"),
            map("UNIT_PRICE", "unit_price", "default 0"),
            map("DiscountPer", "discount_percentage", "default 0"),
            map("UNIT_PRICE, DiscountPer", "final_unit_price", "unit - unit * discount / 100"),
            map("GSTID", "tax_master_id", "required"),
            map("GSTPer", "tax_percentage", "default 0"),
            map("GSTAmount", "tax_amount", "default 0"),
            map("final_unit_price, QTY", "item_total", "final_unit_price * qty"),
            map("-", "supplier_ready_stock", "0"),
            map("-", "hsn_code", "''"),
            map("-", "item_delivery_date", "null"),
            map("-", "created_date", "run start"),
            map("-", "modified_date", "run start, CURRENT_TIMESTAMP on update"),
            map("-", "is_deleted", "false"),
        ]
    }

    fn default_batch_size(&self) -> usize {
        500
    }

    fn ordering_key(&self, source: &AuctionSource) -> Option<i64> {
        Some(i64::from(source.update_id))
    }

    fn is_ordered(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests;

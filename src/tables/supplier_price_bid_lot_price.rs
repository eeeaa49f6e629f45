use crate::data_transfer::lookup::LookupSpec;
use crate::data_transfer::mapper::{map, ColumnMapping};
use crate::data_transfer::migration::{TableMigration, TargetRow};
use crate::data_transfer::models::{col, ConflictPolicy, SkipReason, TargetColumn, TargetTable};
use crate::data_transfer::transform::{ist_to_utc, require, TransformContext};
use crate::db_types::{ColumnReader, CompositeKey, PgType, PgValue};
use crate::tables::{event_master, supplier_master, EVENT_MASTER, SUPPLIER_MASTER};
use chrono::{DateTime, NaiveDateTime, Utc};
use rust_decimal::Decimal;

const COLUMNS: &[TargetColumn] = &[
    col("event_id", PgType::Int4),
    col("supplier_id", PgType::Int4),
    col("supplier_price_bid_lot_price", PgType::Numeric),
    col("created_by", PgType::Int4),
    col("created_date", PgType::TimestampTz),
    col("modified_by", PgType::Int4),
    col("modified_date", PgType::TimestampTz),
    col("is_deleted", PgType::Bool),
    col("deleted_by", PgType::Int4),
    col("deleted_date", PgType::TimestampTz),
];

pub const LOT_PRICE_TABLE: TargetTable = TargetTable {
    name: "supplier_price_bid_lot_price",
    columns: COLUMNS,
    key_columns: &["event_id", "supplier_id"],
    conflict: ConflictPolicy::DoUpdate,
    update_columns: &["supplier_price_bid_lot_price", "modified_by", "modified_date"],
    touch_modified_date: false,
};

#[derive(Debug, Clone, Default)]
pub struct LotPriceSource {
    pub event_id: Option<i32>,
    pub vendor_id: Option<i32>,
    pub total: Option<Decimal>,
    pub created_by: Option<i32>,
    /// Wall-clock India time in the legacy database.
    pub created_date: Option<NaiveDateTime>,
    pub update_id: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LotPriceRow {
    pub event_id: i32,
    pub supplier_id: i32,
    pub price: Decimal,
    pub created_by: Option<i32>,
    pub created_date: Option<DateTime<Utc>>,
}

impl TargetRow for LotPriceRow {
    fn key(&self) -> CompositeKey {
        CompositeKey::from((self.event_id, self.supplier_id))
    }

    fn values(&self) -> Vec<PgValue> {
        vec![
            PgValue::Int4(Some(self.event_id)),
            PgValue::Int4(Some(self.supplier_id)),
            PgValue::Numeric(Some(self.price)),
            PgValue::Int4(self.created_by),
            PgValue::TimestampTz(self.created_date),
            PgValue::Int4(None),
            PgValue::TimestampTz(None),
            PgValue::Bool(Some(false)),
            PgValue::Int4(None),
            PgValue::TimestampTz(None),
        ]
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LotPriceMigration;

impl TableMigration for LotPriceMigration {
    type Source = LotPriceSource;
    type Target = LotPriceRow;

    fn target(&self) -> &'static TargetTable {
        &LOT_PRICE_TABLE
    }

    fn lookups(&self) -> Vec<LookupSpec> {
        vec![event_master(), supplier_master()]
    }

    fn source_query(&self) -> &'static str {
        "SELECT EVENTID, VendorId, TOTAL, CreatedBy, CreatedDate, UPDATEID \
         FROM TBL_AUC_SUPPLIERLotPrice \
         WHERE EVENTID IS NOT NULL AND VendorId IS NOT NULL \
         ORDER BY UPDATEID"
    }

    fn decode(&self, row: &dyn ColumnReader) -> Result<LotPriceSource, String> {
        Ok(LotPriceSource {
            event_id: row.get_i32(0)?,
            vendor_id: row.get_i32(1)?,
            total: row.get_decimal(2)?,
            created_by: row.get_i32(3)?,
            created_date: row.get_datetime(4)?,
            update_id: row.get_i32(5)?.unwrap_or(0),
        })
    }

    fn record_id(&self, source: &LotPriceSource) -> String {
        format!("UPDATEID:{}", source.update_id)
    }

    fn transform(&self, source: &LotPriceSource, ctx: &TransformContext<'_>) -> Result<LotPriceRow, SkipReason> {
        let event_id = require(source.event_id, "EVENTID")?;
        let supplier_id = require(source.vendor_id, "VendorId")?;
        let price = require(source.total, "TOTAL")?;

        ctx.ensure_exists(EVENT_MASTER, "event_id", event_id)?;
        ctx.ensure_exists(SUPPLIER_MASTER, "supplier_id", supplier_id)?;

        Ok(LotPriceRow {
            event_id,
            supplier_id,
            price,
            created_by: source.created_by,
            created_date: source.created_date.map(ist_to_utc),
        })
    }

    fn mappings(&self) -> Vec<ColumnMapping> {
        vec![
            map("EVENTID", "event_id", "required, FK event_master"),
            map("VendorId", "supplier_id", "required, FK supplier_master"),
            map("TOTAL", "supplier_price_bid_lot_price", "required"),
            map("CreatedBy", "created_by", "direct"),
            map("CreatedDate", "created_date", "IST -> UTC"),
            map("-", "modified_by", "null"),
            map("-", "modified_date", "null"),
            map("-", "is_deleted", "false"),
            map("-", "deleted_by", "null"),
            map("-", "deleted_date", "null"),
        ]
    }

    fn ordering_key(&self, source: &LotPriceSource) -> Option<i64> {
        Some(i64::from(source.update_id))
    }

    fn is_ordered(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_transfer::lookup::LookupContext;
    use crate::data_transfer::models::SkipKind;
    use chrono::{NaiveDate, TimeZone};

    fn lookups() -> LookupContext {
        LookupContext::new()
            .with_set(EVENT_MASTER, [10])
            .with_set(SUPPLIER_MASTER, [20])
    }

    fn source() -> LotPriceSource {
        LotPriceSource {
            event_id: Some(10),
            vendor_id: Some(20),
            total: Some(Decimal::new(125050, 2)),
            created_by: Some(4),
            created_date: NaiveDate::from_ymd_opt(2024, 6, 1).and_then(|d| d.and_hms_opt(10, 0, 0)),
            update_id: 33,
        }
    }

    #[test]
    fn test_created_date_moves_from_ist_to_utc() {
        let lookups = lookups();
        let ctx = TransformContext::new(&lookups, Utc::now());

        let row = LotPriceMigration.transform(&source(), &ctx).unwrap();
        assert_eq!(
            row.created_date,
            Some(Utc.with_ymd_and_hms(2024, 6, 1, 4, 30, 0).unwrap())
        );
        assert_eq!(row.key().to_string(), "10|20");
        assert_eq!(row.values()[2], PgValue::Numeric(Some(Decimal::new(125050, 2))));
        assert_eq!(LotPriceMigration.record_id(&source()), "UPDATEID:33");
        assert_eq!(LotPriceMigration.ordering_key(&source()), Some(33));
    }

    #[test]
    fn test_required_fields_are_checked_before_lookups() {
        let lookups = lookups();
        let ctx = TransformContext::new(&lookups, Utc::now());
        let reason = |edit: fn(&mut LotPriceSource)| {
            let mut source = source();
            edit(&mut source);
            LotPriceMigration.transform(&source, &ctx).unwrap_err()
        };

        assert_eq!(reason(|s| s.event_id = None).message, "EVENTID is null");

        let skip = reason(|s| {
            s.event_id = Some(11);
            s.total = None;
        });
        assert_eq!(skip.kind, SkipKind::MissingField);
        assert_eq!(skip.message, "TOTAL is null");

        let skip = reason(|s| {
            s.vendor_id = None;
            s.total = None;
        });
        assert_eq!(skip.message, "VendorId is null");

        let skip = reason(|s| {
            s.event_id = Some(11);
            s.vendor_id = Some(21);
        });
        assert_eq!(skip.kind, SkipKind::ForeignKey);
        assert_eq!(skip.message, "event_id=11 not found in event_master");
        assert_eq!(
            reason(|s| s.vendor_id = Some(21)).message,
            "supplier_id=21 not found in supplier_master"
        );
    }

    #[test]
    fn test_update_overwrites_price_and_modification_columns_only() {
        assert_eq!(
            LOT_PRICE_TABLE.assignment_columns(),
            vec!["supplier_price_bid_lot_price", "modified_by", "modified_date"]
        );
        assert!(LotPriceMigration.is_ordered());
    }
}

use super::*;
use crate::data_transfer::lookup::LookupContext;
use crate::data_transfer::models::SkipKind;
use crate::db_types::CellValue;
use chrono::{NaiveDate, TimeZone};
use std::str::FromStr;

fn dec(value: &str) -> Decimal {
    Decimal::from_str(value).unwrap()
}

fn lookups() -> LookupContext {
    LookupContext::new()
        .with_set(EVENT_MASTER, [100])
        .with_set(SUPPLIER_MASTER, [7])
        .with_set(EVENT_ITEMS, [9001])
        .with_map(BUYER_LINES, [((100, 55), 9001), ((100, 56), 9002)])
        .with_map(PRICE_BIDS, [((7, 100), 300)])
}

fn run_start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 15, 8, 0, 0).unwrap()
}

fn source() -> LineItemSource {
    LineItemSource {
        pbid: 42,
        event_id: Some(100),
        supplier_id: Some(7),
        pr_trans_id: Some(55),
        hsn_code: None,
        qty: Some(dec("4")),
        proposed_qty: None,
        item_bid_status: Some(1),
        unit_price: Some(dec("250.00")),
        discount_per: Some(dec("10")),
        gst_id: Some(3),
        gst_per: Some(dec("18")),
        gst_amount: None,
        ready_stock: None,
        delivery_date: NaiveDate::from_ymd_opt(2025, 2, 1).and_then(|d| d.and_hms_opt(12, 0, 0)),
    }
}

#[test]
fn test_line_item_transform_computes_and_defaults() {
    let lookups = lookups();
    let ctx = TransformContext::new(&lookups, run_start());

    let row = LineItemMigration.transform(&source(), &ctx).unwrap();

    assert_eq!(row.event_supplier_line_item_id, 42);
    assert_eq!(row.event_item_id, 9001);
    assert_eq!(row.event_supplier_price_bid_id, 300);
    assert_eq!(row.final_unit_price, dec("225"));
    assert_eq!(row.item_total, dec("900"));
    assert_eq!(row.hsn_code, "");
    assert_eq!(row.proposed_qty, Decimal::ZERO);
    assert_eq!(row.tax_amount, Decimal::ZERO);
    assert_eq!(row.item_bid_status, Some("Included"));
    assert_eq!(
        row.item_delivery_date,
        Some(Utc.with_ymd_and_hms(2025, 2, 1, 12, 0, 0).unwrap())
    );
    assert_eq!(row.created_date, run_start());

    let values = row.values();
    assert_eq!(values.len(), LINE_ITEM_TABLE.columns.len());
    let is_deleted = LINE_ITEM_TABLE.column_index("is_deleted").unwrap();
    assert_eq!(values[is_deleted], PgValue::Bool(Some(false)));
    let modified_by = LINE_ITEM_TABLE.column_index("modified_by").unwrap();
    assert!(values[modified_by].is_null());
    for (value, column) in values.iter().zip(LINE_ITEM_TABLE.columns) {
        assert_eq!(value.pg_type(), column.pg_type, "{}", column.name);
    }
}

#[test]
fn test_missing_values_default_to_zero() {
    let lookups = lookups();
    let ctx = TransformContext::new(&lookups, run_start());
    let mut source = source();
    source.unit_price = None;
    source.discount_per = None;
    source.qty = None;
    source.item_bid_status = Some(7);

    let row = LineItemMigration.transform(&source, &ctx).unwrap();
    assert_eq!(row.final_unit_price, Decimal::ZERO);
    assert_eq!(row.item_total, Decimal::ZERO);
    assert_eq!(row.item_bid_status, None);
}

#[test]
fn test_skip_reasons_follow_validation_order() {
    let lookups = lookups();
    let ctx = TransformContext::new(&lookups, run_start());
    let reason = |edit: fn(&mut LineItemSource)| {
        let mut source = source();
        edit(&mut source);
        LineItemMigration.transform(&source, &ctx).unwrap_err()
    };

    let skip = reason(|s| {
        s.gst_id = None;
        s.event_id = Some(999);
    });
    assert_eq!(skip.kind, SkipKind::MissingField);
    assert_eq!(skip.message, "GSTID is null");

    assert_eq!(
        reason(|s| s.event_id = Some(999)).message,
        "event_id=999 not found in event_master"
    );
    assert_eq!(
        reason(|s| s.supplier_id = Some(8)).message,
        "supplier_id=8 not found in supplier_master"
    );
    assert_eq!(
        reason(|s| s.pr_trans_id = Some(57)).message,
        "No TBL_PB_BUYER entry for EVENTID|PRTRANSID=100|57"
    );
    assert_eq!(
        reason(|s| s.pr_trans_id = Some(56)).message,
        "event_item_id=9002 not found in event_items"
    );
}

#[test]
fn test_item_bid_status_codes() {
    assert_eq!(item_bid_status(Some(0)), Some("Bidding"));
    assert_eq!(item_bid_status(Some(2)), Some("Regret"));
    assert_eq!(item_bid_status(Some(3)), None);
    assert_eq!(item_bid_status(None), None);
}

#[test]
fn test_decode_and_record_id() {
    let row = vec![
        CellValue::from(42),
        CellValue::from(100),
        CellValue::from(7),
        CellValue::from(55),
        CellValue::from("8471"),
        CellValue::from(dec("4")),
        CellValue::Null,
        CellValue::from(0),
        CellValue::from(dec("250.00")),
        CellValue::Null,
        CellValue::from(3),
        CellValue::from(dec("18")),
        CellValue::from(dec("180")),
        CellValue::Null,
        CellValue::Null,
    ];
    let source = LineItemMigration.decode(&row).unwrap();
    assert_eq!(LineItemMigration.record_id(&source), "PBID:42");
    assert_eq!(source.hsn_code.as_deref(), Some("8471"));
    assert_eq!(source.item_bid_status, Some(0));
    assert_eq!(source.delivery_date, None);
}

#[test]
fn test_auction_row_keys_and_ordering() {
    let lookups = lookups();
    let ctx = TransformContext::new(&lookups, run_start());
    let source = AuctionSource {
        update_id: 12,
        event_id: Some(100),
        supplier_id: Some(7),
        pr_trans_id: Some(55),
        qty: Some(dec("2")),
        unit_price: Some(dec("100")),
        discount_per: None,
        gst_id: Some(3),
        gst_per: None,
        gst_amount: None,
    };

    let migration = AuctionLineItemMigration;
    let row = migration.transform(&source, &ctx).unwrap();

    assert_eq!(row.key().to_string(), "100|7|55");
    assert_eq!(row.item_total, dec("200"));
    assert_eq!(migration.record_id(&source), "UPDATEID:12");
    assert_eq!(migration.ordering_key(&source), Some(12));
    assert!(migration.is_ordered());

    let values = row.values();
    assert_eq!(values.len(), AUCTION_TABLE.columns.len());
    let modified = AUCTION_TABLE.column_index("modified_date").unwrap();
    assert_eq!(values[modified], PgValue::TimestampTz(Some(run_start())));
    for (value, column) in values.iter().zip(AUCTION_TABLE.columns) {
        assert_eq!(value.pg_type(), column.pg_type, "{}", column.name);
    }
}

#[test]
fn test_auction_updates_bid_columns_and_resets_defaults() {
    let assigned = AUCTION_TABLE.assignment_columns();
    assert!(assigned.contains(&"unit_price"));
    for column in ["proposed_qty", "supplier_ready_stock", "hsn_code", "item_delivery_date"] {
        assert!(assigned.contains(&column), "{}", column);
    }
    assert!(!assigned.contains(&"created_date"));
    assert!(AUCTION_TABLE.touch_modified_date);
    assert!(AUCTION_TABLE.validate().is_ok());
}

// =====================================================
// TABLE REGISTRY
// Every legacy table the tool knows how to migrate
// =====================================================

pub mod event_supplier_line_item;
pub mod nfa_po_condition;
pub mod supplier_price_bid_lot_charges;
pub mod supplier_price_bid_lot_price;

use crate::data_transfer::engine::{execute_table, RunEnvironment};
use crate::data_transfer::lookup::{int_key, LookupSpec};
use crate::data_transfer::mapper::ColumnMapping;
use crate::data_transfer::migration::TableMigration;
use crate::data_transfer::models::TargetTable;
use crate::db_types::{ColumnReader, CompositeKey};
use crate::error::MigrationError;
use event_supplier_line_item::{AuctionLineItemMigration, LineItemMigration};
use nfa_po_condition::NfaPoConditionMigration;
use serde::Serialize;
use supplier_price_bid_lot_charges::LotChargesMigration;
use supplier_price_bid_lot_price::LotPriceMigration;

// --- Shared Lookups ---

pub const EVENT_MASTER: &str = "event_master";
pub const SUPPLIER_MASTER: &str = "supplier_master";

pub const fn event_master() -> LookupSpec {
    LookupSpec::target_set(EVENT_MASTER, "SELECT event_id FROM event_master", int_key)
}

pub const fn supplier_master() -> LookupSpec {
    LookupSpec::target_set(SUPPLIER_MASTER, "SELECT supplier_id FROM supplier_master", int_key)
}

/// `SELECT a, b, id`: maps the `(a, b)` pair to `id`, ignoring rows with a
/// null in any column.
pub fn pair_entry(row: &dyn ColumnReader) -> Result<Option<(CompositeKey, i32)>, String> {
    match (row.get_i32(0)?, row.get_i32(1)?, row.get_i32(2)?) {
        (Some(a), Some(b), Some(id)) => Ok(Some((CompositeKey::from((a, b)), id))),
        _ => Ok(None),
    }
}

// --- Registry ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationTable {
    EventSupplierLineItem,
    AuctionSupplierLineItem,
    SupplierPriceBidLotCharges,
    SupplierPriceBidLotPrice,
    NfaPoCondition,
}

impl MigrationTable {
    /// Registry order: parents before the tables whose lookups read them.
    pub const ALL: [MigrationTable; 5] = [
        MigrationTable::EventSupplierLineItem,
        MigrationTable::AuctionSupplierLineItem,
        MigrationTable::SupplierPriceBidLotCharges,
        MigrationTable::SupplierPriceBidLotPrice,
        MigrationTable::NfaPoCondition,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            MigrationTable::EventSupplierLineItem => "event_supplier_line_item",
            MigrationTable::AuctionSupplierLineItem => "auction_supplier_line_item",
            MigrationTable::SupplierPriceBidLotCharges => "supplier_price_bid_lot_charges",
            MigrationTable::SupplierPriceBidLotPrice => "supplier_price_bid_lot_price",
            MigrationTable::NfaPoCondition => "nfa_po_condition",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim();
        Self::ALL
            .iter()
            .copied()
            .find(|table| table.name().eq_ignore_ascii_case(name))
    }

    pub fn source_table(&self) -> &'static str {
        match self {
            MigrationTable::EventSupplierLineItem => "TBL_PB_SUPPLIER",
            MigrationTable::AuctionSupplierLineItem => "TBL_AUC_SUPPLIER",
            MigrationTable::SupplierPriceBidLotCharges => "TBL_PB_SUPPLIEROTHERCHARGES",
            MigrationTable::SupplierPriceBidLotPrice => "TBL_AUC_SUPPLIERLotPrice",
            MigrationTable::NfaPoCondition => "TBL_AwardEventPoCondition",
        }
    }

    pub fn target(&self) -> &'static TargetTable {
        match self {
            MigrationTable::EventSupplierLineItem => LineItemMigration.target(),
            MigrationTable::AuctionSupplierLineItem => AuctionLineItemMigration.target(),
            MigrationTable::SupplierPriceBidLotCharges => LotChargesMigration.target(),
            MigrationTable::SupplierPriceBidLotPrice => LotPriceMigration.target(),
            MigrationTable::NfaPoCondition => NfaPoConditionMigration.target(),
        }
    }

    pub fn mappings(&self) -> Vec<ColumnMapping> {
        match self {
            MigrationTable::EventSupplierLineItem => LineItemMigration.mappings(),
            MigrationTable::AuctionSupplierLineItem => AuctionLineItemMigration.mappings(),
            MigrationTable::SupplierPriceBidLotCharges => LotChargesMigration.mappings(),
            MigrationTable::SupplierPriceBidLotPrice => LotPriceMigration.mappings(),
            MigrationTable::NfaPoCondition => NfaPoConditionMigration.mappings(),
        }
    }

    /// One line for `list`: name, source, target and conflict handling.
    pub fn describe(&self) -> String {
        let target = self.target();
        format!(
            "{:<32} {:<30} -> {:<32} key ({}) on conflict {}",
            self.name(),
            self.source_table(),
            target.name,
            target.key_columns.join(", "),
            target.conflict.as_str()
        )
    }

    pub async fn execute(&self, env: &RunEnvironment) -> Result<u64, MigrationError> {
        match self {
            MigrationTable::EventSupplierLineItem => execute_table(&LineItemMigration, env).await,
            MigrationTable::AuctionSupplierLineItem => execute_table(&AuctionLineItemMigration, env).await,
            MigrationTable::SupplierPriceBidLotCharges => execute_table(&LotChargesMigration, env).await,
            MigrationTable::SupplierPriceBidLotPrice => execute_table(&LotPriceMigration, env).await,
            MigrationTable::NfaPoCondition => execute_table(&NfaPoConditionMigration, env).await,
        }
    }
}

//! In-memory stand-ins for the SQL Server and PostgreSQL sides of a run.

use crate::data_transfer::loader::{BatchWriter, InsertedKey, WriteError};
use crate::data_transfer::lookup::{int_key, LookupContext, LookupSpec, LookupStore};
use crate::data_transfer::mapper::{map, ColumnMapping};
use crate::data_transfer::migration::{TableMigration, TargetRow};
use crate::data_transfer::models::{col, ConflictPolicy, SkipReason, TargetColumn, TargetTable};
use crate::data_transfer::transform::{require, TransformContext};
use crate::db_types::{CellValue, ColumnReader, CompositeKey, PgType, PgValue};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::str::FromStr;

#[derive(Default)]
pub struct MemoryStore {
    results: HashMap<String, Vec<Vec<CellValue>>>,
}

impl MemoryStore {
    pub fn with_result(mut self, query: &str, rows: Vec<Vec<CellValue>>) -> Self {
        self.results.insert(query.to_string(), rows);
        self
    }
}

#[async_trait]
impl LookupStore for MemoryStore {
    async fn visit_rows(
        &mut self,
        query: &str,
        visit: &mut (dyn for<'r> FnMut(&'r dyn ColumnReader) -> Result<(), String> + Send),
    ) -> Result<u64, String> {
        let rows = self
            .results
            .get(query)
            .ok_or_else(|| format!("relation for query '{}' does not exist", query))?;
        for row in rows {
            visit(row)?;
        }
        Ok(rows.len() as u64)
    }
}

fn render_key_part(value: &PgValue) -> String {
    match value {
        PgValue::Int4(Some(v)) => v.to_string(),
        PgValue::Int8(Some(v)) => v.to_string(),
        PgValue::Numeric(Some(v)) => v.to_string(),
        PgValue::Text(Some(v)) => v.clone(),
        PgValue::Bool(Some(v)) => v.to_string(),
        PgValue::TimestampTz(Some(v)) => v.to_rfc3339(),
        _ => String::new(),
    }
}

/// A single target table with a unique constraint on the descriptor's key
/// columns. COPY is all-or-nothing like the real protocol.
#[derive(Default)]
pub struct MemoryWriter {
    pub rows: HashMap<String, Vec<PgValue>>,
    pub copy_calls: usize,
    pub insert_calls: usize,
    pub fail_inserts: bool,
    pub fail_copy: Option<WriteError>,
}

impl MemoryWriter {
    pub fn with_existing(table: &TargetTable, rows: Vec<Vec<PgValue>>) -> Self {
        let mut writer = MemoryWriter::default();
        for values in rows {
            writer.rows.insert(Self::key_of(table, &values), values);
        }
        writer
    }

    pub fn key_of(table: &TargetTable, values: &[PgValue]) -> String {
        table
            .key_columns
            .iter()
            .filter_map(|name| table.column_index(name))
            .map(|index| render_key_part(&values[index]))
            .collect::<Vec<_>>()
            .join("|")
    }

    pub fn value(&self, key: &str, table: &TargetTable, column: &str) -> Option<PgValue> {
        let index = table.column_index(column)?;
        self.rows.get(key).map(|values| values[index].clone())
    }
}

#[async_trait]
impl BatchWriter for MemoryWriter {
    async fn copy_rows(&mut self, table: &TargetTable, rows: &[Vec<PgValue>]) -> Result<u64, WriteError> {
        self.copy_calls += 1;
        if let Some(error) = self.fail_copy.clone() {
            return Err(error);
        }

        let mut seen = std::collections::HashSet::new();
        for values in rows {
            let key = Self::key_of(table, values);
            if self.rows.contains_key(&key) || !seen.insert(key.clone()) {
                return Err(WriteError::UniqueViolation(format!(
                    "duplicate key value violates unique constraint ({})",
                    key
                )));
            }
        }
        for values in rows {
            self.rows.insert(Self::key_of(table, values), values.clone());
        }
        Ok(rows.len() as u64)
    }

    async fn insert_rows(
        &mut self,
        table: &TargetTable,
        rows: &[Vec<PgValue>],
    ) -> Result<Vec<InsertedKey>, WriteError> {
        self.insert_calls += 1;
        if self.fail_inserts {
            return Err(WriteError::Other("connection reset by peer".to_string()));
        }

        let mut written = Vec::new();
        for values in rows {
            let key = Self::key_of(table, values);
            let exists = self.rows.contains_key(&key);
            match (exists, table.conflict) {
                (true, ConflictPolicy::DoNothing) => {}
                (true, ConflictPolicy::DoUpdate) => {
                    self.rows.insert(key.clone(), values.clone());
                    written.push(InsertedKey { key, inserted: false });
                }
                (false, _) => {
                    self.rows.insert(key.clone(), values.clone());
                    written.push(InsertedKey { key, inserted: true });
                }
            }
        }
        Ok(written)
    }
}

// --- A small two-lookup table ---

pub const EVENT_QUERY: &str = "SELECT event_id FROM event_master";

const LOT_PRICE_COLUMNS: &[TargetColumn] = &[
    col("event_id", PgType::Int4),
    col("supplier_id", PgType::Int4),
    col("price", PgType::Numeric),
];

pub const APPEND_TABLE: TargetTable = TargetTable {
    name: "lot_price",
    columns: LOT_PRICE_COLUMNS,
    key_columns: &["event_id", "supplier_id"],
    conflict: ConflictPolicy::DoNothing,
    update_columns: &[],
    touch_modified_date: false,
};

pub const UPSERT_TABLE: TargetTable = TargetTable {
    conflict: ConflictPolicy::DoUpdate,
    update_columns: &["price"],
    ..APPEND_TABLE
};

/// Source columns: `id, event_id, supplier_id, price, update_id`.
#[derive(Clone, Default)]
pub struct TestMigration {
    pub upsert: bool,
}

pub struct TestSource {
    id: i32,
    event_id: Option<i32>,
    supplier_id: Option<i32>,
    price: Option<Decimal>,
    update_id: Option<i64>,
}

pub struct TestTarget {
    event_id: i32,
    supplier_id: i32,
    price: Decimal,
}

impl TargetRow for TestTarget {
    fn key(&self) -> CompositeKey {
        CompositeKey::from((self.event_id, self.supplier_id))
    }

    fn values(&self) -> Vec<PgValue> {
        vec![
            PgValue::Int4(Some(self.event_id)),
            PgValue::Int4(Some(self.supplier_id)),
            PgValue::Numeric(Some(self.price)),
        ]
    }
}

impl TableMigration for TestMigration {
    type Source = TestSource;
    type Target = TestTarget;

    fn target(&self) -> &'static TargetTable {
        if self.upsert {
            &UPSERT_TABLE
        } else {
            &APPEND_TABLE
        }
    }

    fn lookups(&self) -> Vec<LookupSpec> {
        vec![LookupSpec::target_set("event_master", EVENT_QUERY, int_key)]
    }

    fn source_query(&self) -> &'static str {
        "SELECT Id, EventId, SupplierId, Price, UpdateId FROM LotPrice"
    }

    fn decode(&self, row: &dyn ColumnReader) -> Result<TestSource, String> {
        Ok(TestSource {
            id: row.get_i32(0)?.ok_or_else(|| "Id is null".to_string())?,
            event_id: row.get_i32(1)?,
            supplier_id: row.get_i32(2)?,
            price: row.get_decimal(3)?,
            update_id: row.get_i64(4)?,
        })
    }

    fn record_id(&self, source: &TestSource) -> String {
        format!("id:{}", source.id)
    }

    fn transform(&self, source: &TestSource, ctx: &TransformContext<'_>) -> Result<TestTarget, SkipReason> {
        let event_id = require(source.event_id, "event_id")?;
        let supplier_id = require(source.supplier_id, "supplier_id")?;
        let price = require(source.price, "price")?;
        ctx.ensure_exists("event_master", "event_id", event_id)?;
        Ok(TestTarget {
            event_id,
            supplier_id,
            price,
        })
    }

    fn mappings(&self) -> Vec<ColumnMapping> {
        vec![
            map("EventId", "event_id", "FK event_master"),
            map("SupplierId", "supplier_id", "direct"),
            map("Price", "price", "direct"),
        ]
    }

    fn ordering_key(&self, source: &TestSource) -> Option<i64> {
        if self.upsert {
            source.update_id
        } else {
            None
        }
    }

    fn is_ordered(&self) -> bool {
        self.upsert
    }
}

pub fn dec(value: &str) -> Decimal {
    Decimal::from_str(value).unwrap()
}

pub fn source_row(id: i32, event_id: Option<i32>, supplier_id: i32, price: &str, update_id: i32) -> Vec<CellValue> {
    vec![
        CellValue::from(id),
        CellValue::from(event_id),
        CellValue::from(supplier_id),
        CellValue::from(dec(price)),
        CellValue::from(update_id),
    ]
}

pub fn events(ids: &[i32]) -> LookupContext {
    LookupContext::new().with_set("event_master", ids.iter().copied())
}

// =====================================================
// SQL SERVER SOURCE OPERATIONS (via Tiberius)
// =====================================================

use crate::data_transfer::lookup::LookupStore;
use crate::db_types::ColumnReader;
use crate::error::MigrationError;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use rust_decimal::Decimal;
use std::str::FromStr;
use tiberius::{Client, Config, Row};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};

pub type SourceClient = Client<Compat<TcpStream>>;

/// Row stream of one source query; errors are already rendered.
pub type SourceRows<'a> = BoxStream<'a, Result<Row, String>>;

// --- Connection ---

pub fn parse_config(ado: &str) -> Result<Config, MigrationError> {
    Config::from_ado_string(ado)
        .map_err(|e| MigrationError::Configuration(format!("Invalid SQL Server connection string: {}", e)))
}

pub async fn connect(ado: &str) -> Result<SourceClient, MigrationError> {
    let config = parse_config(ado)?;

    let tcp = TcpStream::connect(config.get_addr())
        .await
        .map_err(|e| MigrationError::Connection(format!("Failed to reach SQL Server: {}", e)))?;
    tcp.set_nodelay(true)
        .map_err(|e| MigrationError::Connection(e.to_string()))?;

    Client::connect(config, tcp.compat_write())
        .await
        .map_err(|e| MigrationError::Connection(format!("SQL Server handshake failed: {}", e)))
}

// --- Query Execution ---

/// Streams the rows of `query` without buffering the result set.
pub async fn stream_rows<'a>(
    client: &'a mut SourceClient,
    query: &'a str,
) -> Result<SourceRows<'a>, MigrationError> {
    let stream = client
        .query(query, &[])
        .await
        .map_err(|e| MigrationError::Source(format!("Failed to start source query: {}", e)))?;

    Ok(stream
        .into_row_stream()
        .map_err(|e| format!("Failed to read source row: {}", e))
        .boxed())
}

#[async_trait]
impl LookupStore for SourceClient {
    async fn visit_rows(
        &mut self,
        query: &str,
        visit: &mut (dyn for<'r> FnMut(&'r dyn ColumnReader) -> Result<(), String> + Send),
    ) -> Result<u64, String> {
        let mut rows = self
            .query(query, &[])
            .await
            .map_err(|e| format!("Query failed: {}", e))?
            .into_row_stream();

        let mut count = 0u64;
        while let Some(row) = rows.try_next().await.map_err(|e| format!("Query failed: {}", e))? {
            visit(&row)?;
            count += 1;
        }
        Ok(count)
    }
}

// --- Row Access ---

/// Legacy columns mix `int`, `smallint`, `tinyint` and `bigint` for the same
/// logical ids, and money-like values live in `decimal`, `float` or even
/// `varchar`. Each getter tries the expected type first and widens from
/// there.
impl ColumnReader for Row {
    fn get_i32(&self, index: usize) -> Result<Option<i32>, String> {
        if let Ok(value) = self.try_get::<i32, _>(index) {
            return Ok(value);
        }
        if let Ok(value) = self.try_get::<i16, _>(index) {
            return Ok(value.map(i32::from));
        }
        if let Ok(value) = self.try_get::<u8, _>(index) {
            return Ok(value.map(i32::from));
        }
        match self.try_get::<i64, _>(index) {
            Ok(Some(value)) => i32::try_from(value)
                .map(Some)
                .map_err(|_| format!("Column {} value {} does not fit in int", index, value)),
            Ok(None) => Ok(None),
            Err(e) => Err(format!("Failed to read integer column {}: {}", index, e)),
        }
    }

    fn get_i64(&self, index: usize) -> Result<Option<i64>, String> {
        if let Ok(value) = self.try_get::<i64, _>(index) {
            return Ok(value);
        }
        self.get_i32(index).map(|value| value.map(i64::from))
    }

    fn get_decimal(&self, index: usize) -> Result<Option<Decimal>, String> {
        if let Ok(value) = self.try_get::<Decimal, _>(index) {
            return Ok(value);
        }
        if let Ok(value) = self.try_get::<f64, _>(index) {
            return value.map(decimal_from_float).transpose();
        }
        if let Ok(value) = self.try_get::<f32, _>(index) {
            return value.map(|v| decimal_from_float(f64::from(v))).transpose();
        }
        if let Ok(value) = self.get_i64(index) {
            return Ok(value.map(Decimal::from));
        }
        match self.try_get::<&str, _>(index) {
            Ok(Some(raw)) => decimal_from_text(raw).map(Some),
            Ok(None) => Ok(None),
            Err(e) => Err(format!("Failed to read numeric column {}: {}", index, e)),
        }
    }

    fn get_string(&self, index: usize) -> Result<Option<String>, String> {
        if let Ok(value) = self.try_get::<&str, _>(index) {
            return Ok(value.map(str::to_string));
        }
        if let Ok(value) = self.try_get::<Decimal, _>(index) {
            return Ok(value.map(|v| v.to_string()));
        }
        if let Ok(value) = self.try_get::<f64, _>(index) {
            return Ok(value.map(|v| v.to_string()));
        }
        self.get_i64(index)
            .map(|value| value.map(|v| v.to_string()))
            .map_err(|e| format!("Failed to read text column {}: {}", index, e))
    }

    fn get_datetime(&self, index: usize) -> Result<Option<NaiveDateTime>, String> {
        if let Ok(value) = self.try_get::<NaiveDateTime, _>(index) {
            return Ok(value);
        }
        if let Ok(value) = self.try_get::<DateTime<Utc>, _>(index) {
            return Ok(value.map(|v| v.naive_utc()));
        }
        self.try_get::<NaiveDate, _>(index)
            .map(|value| value.and_then(|d| d.and_hms_opt(0, 0, 0)))
            .map_err(|e| format!("Failed to read datetime column {}: {}", index, e))
    }

    fn get_bool(&self, index: usize) -> Result<Option<bool>, String> {
        if let Ok(value) = self.try_get::<bool, _>(index) {
            return Ok(value);
        }
        self.get_i32(index)
            .map(|value| value.map(|v| v != 0))
            .map_err(|e| format!("Failed to read bit column {}: {}", index, e))
    }
}

fn decimal_from_float(value: f64) -> Result<Decimal, String> {
    Decimal::try_from(value).map_err(|e| format!("Float {} is not representable as decimal: {}", value, e))
}

pub fn decimal_from_text(raw: &str) -> Result<Decimal, String> {
    let trimmed = raw.trim();
    Decimal::from_str(trimmed)
        .or_else(|_| Decimal::from_scientific(trimmed))
        .map_err(|_| format!("'{}' is not a valid number", trimmed))
}

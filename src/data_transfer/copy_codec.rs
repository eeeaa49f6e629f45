//! PostgreSQL `COPY ... FROM STDIN (FORMAT BINARY)` payload encoding.

use crate::data_transfer::models::{TargetColumn, TargetTable};
use crate::db_types::PgValue;
use bytes::{BufMut, BytesMut};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

const COPY_SIGNATURE: &[u8; 11] = b"PGCOPY\n\xff\r\n\0";
/// Microseconds between the Unix epoch and 2000-01-01, PostgreSQL's epoch.
const PG_EPOCH_OFFSET_MICROS: i64 = 946_684_800_000_000;
const NUMERIC_POS: u16 = 0x0000;
const NUMERIC_NEG: u16 = 0x4000;
const NUMERIC_GROUP_DIGITS: usize = 4;

pub fn copy_statement(table: &TargetTable) -> String {
    format!(
        "COPY {} ({}) FROM STDIN (FORMAT BINARY)",
        table.name,
        table.column_names().join(", ")
    )
}

pub struct CopyEncoder {
    buf: BytesMut,
    columns: &'static [TargetColumn],
    rows: usize,
}

impl CopyEncoder {
    pub fn new(columns: &'static [TargetColumn]) -> Self {
        let mut buf = BytesMut::with_capacity(1024);
        buf.put_slice(COPY_SIGNATURE);
        buf.put_i32(0); // flags
        buf.put_i32(0); // header extension length
        Self {
            buf,
            columns,
            rows: 0,
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn write_row(&mut self, values: &[PgValue]) -> Result<(), String> {
        if values.len() != self.columns.len() {
            return Err(format!(
                "Row has {} values but COPY expects {} columns",
                values.len(),
                self.columns.len()
            ));
        }
        for (column, value) in self.columns.iter().zip(values) {
            if column.pg_type != value.pg_type() {
                return Err(format!(
                    "Column {} expects {} but got {}",
                    column.name,
                    column.pg_type.as_str(),
                    value.pg_type().as_str()
                ));
            }
        }

        self.buf.put_i16(self.columns.len() as i16);
        for value in values {
            write_field(&mut self.buf, value)?;
        }
        self.rows += 1;
        Ok(())
    }

    pub fn finish(mut self) -> BytesMut {
        self.buf.put_i16(-1);
        self.buf
    }
}

fn write_field(buf: &mut BytesMut, value: &PgValue) -> Result<(), String> {
    match value {
        PgValue::Int4(Some(v)) => {
            buf.put_i32(4);
            buf.put_i32(*v);
        }
        PgValue::Int8(Some(v)) => {
            buf.put_i32(8);
            buf.put_i64(*v);
        }
        PgValue::Bool(Some(v)) => {
            buf.put_i32(1);
            buf.put_u8(u8::from(*v));
        }
        PgValue::Text(Some(v)) => {
            let len = i32::try_from(v.len())
                .map_err(|_| format!("Text value of {} bytes is too large for COPY", v.len()))?;
            buf.put_i32(len);
            buf.put_slice(v.as_bytes());
        }
        PgValue::TimestampTz(Some(v)) => {
            buf.put_i32(8);
            buf.put_i64(timestamp_to_pg_micros(v));
        }
        PgValue::Numeric(Some(v)) => {
            let encoded = encode_numeric(v);
            buf.put_i32(encoded.len() as i32);
            buf.put_slice(&encoded);
        }
        _ => buf.put_i32(-1),
    }
    Ok(())
}

pub fn timestamp_to_pg_micros(value: &DateTime<Utc>) -> i64 {
    value.timestamp_micros() - PG_EPOCH_OFFSET_MICROS
}

/// Encodes a decimal in PostgreSQL's base-10000 `numeric` wire format:
/// ndigits, weight, sign and display scale followed by the digit groups.
pub fn encode_numeric(value: &Decimal) -> Vec<u8> {
    let scale = value.scale() as usize;
    let mantissa = value.mantissa();
    let digits = mantissa.unsigned_abs().to_string();

    let (int_part, frac_part) = if digits.len() > scale {
        let (int_part, frac_part) = digits.split_at(digits.len() - scale);
        (int_part.to_string(), frac_part.to_string())
    } else {
        (String::new(), format!("{:0>width$}", digits, width = scale))
    };

    let int_padded = pad_to_groups(&int_part, true);
    let frac_padded = pad_to_groups(&frac_part, false);

    let mut weight = (int_padded.len() / NUMERIC_GROUP_DIGITS) as i16 - 1;
    let mut groups: Vec<i16> = int_padded
        .as_bytes()
        .chunks(NUMERIC_GROUP_DIGITS)
        .chain(frac_padded.as_bytes().chunks(NUMERIC_GROUP_DIGITS))
        .map(|chunk| {
            chunk
                .iter()
                .fold(0i16, |acc, digit| acc * 10 + (digit - b'0') as i16)
        })
        .collect();

    let leading_zeros = groups.iter().take_while(|g| **g == 0).count();
    groups.drain(..leading_zeros);
    weight -= leading_zeros as i16;
    while groups.last() == Some(&0) {
        groups.pop();
    }
    if groups.is_empty() {
        weight = 0;
    }

    let sign = if mantissa < 0 && !groups.is_empty() {
        NUMERIC_NEG
    } else {
        NUMERIC_POS
    };

    let mut out = Vec::with_capacity(8 + groups.len() * 2);
    out.put_i16(groups.len() as i16);
    out.put_i16(weight);
    out.put_u16(sign);
    out.put_u16(scale as u16);
    for group in groups {
        out.put_i16(group);
    }
    out
}

fn pad_to_groups(digits: &str, left: bool) -> String {
    let remainder = digits.len() % NUMERIC_GROUP_DIGITS;
    if remainder == 0 {
        return digits.to_string();
    }
    let zeros = "0".repeat(NUMERIC_GROUP_DIGITS - remainder);
    if left {
        format!("{}{}", zeros, digits)
    } else {
        format!("{}{}", digits, zeros)
    }
}

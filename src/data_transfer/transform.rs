//! Building blocks for per-table row transforms.
//!
//! Transforms are pure: they read the source row and the lookup context and
//! either produce a target row or a [`SkipReason`]. Each helper returns
//! `Result<_, SkipReason>` so a transform reads as a sequence of `?` checks
//! and the first failing check decides the reported reason.

use crate::data_transfer::lookup::LookupContext;
use crate::data_transfer::models::{SkipKind, SkipReason};
use crate::db_types::CompositeKey;
use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use std::str::FromStr;

/// India Standard Time, UTC+05:30.
pub const IST_OFFSET_SECS: i64 = 5 * 3600 + 30 * 60;

pub struct TransformContext<'a> {
    pub lookups: &'a LookupContext,
    /// Fixed for the run so defaulted timestamps are identical across rows.
    pub run_started_at: DateTime<Utc>,
}

impl<'a> TransformContext<'a> {
    pub fn new(lookups: &'a LookupContext, run_started_at: DateTime<Utc>) -> Self {
        Self {
            lookups,
            run_started_at,
        }
    }

    pub fn ensure_exists(
        &self,
        lookup: &str,
        field: &str,
        key: impl Into<CompositeKey>,
    ) -> Result<(), SkipReason> {
        let key = key.into();
        if self.lookups.contains(lookup, &key) {
            Ok(())
        } else {
            Err(SkipReason::new(
                SkipKind::ForeignKey,
                format!("{}={} not found in {}", field, key, lookup),
            ))
        }
    }

    pub fn resolve(
        &self,
        lookup: &str,
        field: &str,
        key: impl Into<CompositeKey>,
    ) -> Result<i32, SkipReason> {
        let key = key.into();
        self.lookups.resolve(lookup, &key).ok_or_else(|| {
            SkipReason::new(
                SkipKind::ForeignKey,
                format!("No {} entry for {}={}", lookup, field, key),
            )
        })
    }
}

// --- Validation ---

pub fn require<T>(value: Option<T>, field: &str) -> Result<T, SkipReason> {
    value.ok_or_else(|| SkipReason::new(SkipKind::MissingField, format!("{} is null", field)))
}

pub fn parse_decimal(raw: Option<&str>, field: &str) -> Result<Decimal, SkipReason> {
    let trimmed = raw.map(str::trim).unwrap_or("");
    if trimmed.is_empty() {
        return Err(SkipReason::new(
            SkipKind::InvalidValue,
            format!("{} is null/empty", field),
        ));
    }
    Decimal::from_str(trimmed)
        .or_else(|_| Decimal::from_scientific(trimmed))
        .map_err(|_| {
            SkipReason::new(
                SkipKind::InvalidValue,
                format!("{}='{}' is not a valid number", field, trimmed),
            )
        })
}

// --- Computed Columns ---

fn overflow(what: &str) -> SkipReason {
    SkipReason::new(
        SkipKind::TransformError,
        format!("Arithmetic overflow while computing {}", what),
    )
}

/// `unit_price - unit_price * discount_percent / 100`
pub fn discounted_price(unit_price: Decimal, discount_percent: Decimal) -> Result<Decimal, SkipReason> {
    unit_price
        .checked_mul(discount_percent)
        .and_then(|d| d.checked_div(Decimal::ONE_HUNDRED))
        .and_then(|discount| unit_price.checked_sub(discount))
        .ok_or_else(|| overflow("final_unit_price"))
}

pub fn line_total(price: Decimal, qty: Decimal) -> Result<Decimal, SkipReason> {
    price.checked_mul(qty).ok_or_else(|| overflow("item_total"))
}

/// Sum of two optional amounts; `None` only when both are absent.
pub fn optional_sum(base: Option<Decimal>, tax: Option<Decimal>) -> Result<Option<Decimal>, SkipReason> {
    if base.is_none() && tax.is_none() {
        return Ok(None);
    }
    base.unwrap_or(Decimal::ZERO)
        .checked_add(tax.unwrap_or(Decimal::ZERO))
        .map(Some)
        .ok_or_else(|| overflow("total amount"))
}

// --- Timezone Normalization ---

/// Reinterprets a naive IST wall-clock value as UTC.
pub fn ist_to_utc(value: NaiveDateTime) -> DateTime<Utc> {
    Utc.from_utc_datetime(&(value - Duration::seconds(IST_OFFSET_SECS)))
}

/// For source columns already written in UTC.
pub fn naive_as_utc(value: NaiveDateTime) -> DateTime<Utc> {
    Utc.from_utc_datetime(&value)
}

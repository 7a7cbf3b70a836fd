//! Repository layer: table-scoped database operations.
//!
//! Functions take `&Connection` and a caller-supplied `now` so time is
//! explicit in tests. Timestamps are stored as fixed-width UTC strings,
//! which makes SQL string comparison chronological.

mod audit;
mod notification;
mod report;

use chrono::{DateTime, NaiveDateTime, Utc};

use super::DatabaseError;

pub use audit::*;
pub use notification::*;
pub use report::*;

/// Millisecond UTC timestamps, e.g. `2026-03-01T14:05:09.120Z`.
pub const TS_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

pub fn fmt_ts(ts: &DateTime<Utc>) -> String {
    ts.format(TS_FORMAT).to_string()
}

pub fn parse_ts(raw: &str) -> Result<DateTime<Utc>, DatabaseError> {
    NaiveDateTime::parse_from_str(raw, TS_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|e| DatabaseError::ConstraintViolation(format!("bad timestamp {raw:?}: {e}")))
}

pub(crate) fn parse_opt_ts(raw: Option<String>) -> Result<Option<DateTime<Utc>>, DatabaseError> {
    raw.as_deref().map(parse_ts).transpose()
}

/// Never earlier than `floor`, so a row's own timestamps only move forward.
pub(crate) fn stamp_after(now: DateTime<Utc>, floor: Option<DateTime<Utc>>) -> DateTime<Utc> {
    match floor {
        Some(floor) if floor > now => floor,
        _ => now,
    }
}

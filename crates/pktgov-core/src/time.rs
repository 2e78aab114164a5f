//! UTC timestamp discipline shared by every serialized document.
//!
//! All timestamps that reach disk are RFC 3339 UTC with a `Z` suffix,
//! truncated to microseconds. Truncation happens at capture time so that a
//! value round-trips byte-identically through serialization and canonical
//! hashing.

use chrono::{DateTime, SecondsFormat, Timelike, Utc};

/// Returns the current UTC time truncated to microsecond precision.
#[must_use]
pub fn now_utc() -> DateTime<Utc> {
    truncate_to_micros(Utc::now())
}

/// Truncates a timestamp to microsecond precision.
#[must_use]
pub fn truncate_to_micros(ts: DateTime<Utc>) -> DateTime<Utc> {
    let nanos = ts.nanosecond();
    let truncated = nanos - (nanos % 1_000);
    ts.with_nanosecond(truncated).unwrap_or(ts)
}

/// Formats a timestamp as RFC 3339 UTC with `Z` suffix and microsecond
/// precision, e.g. `2026-08-02T10:15:30.123456Z`.
#[must_use]
pub fn format_utc(ts: DateTime<Utc>) -> String {
    truncate_to_micros(ts).to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Returns the current UTC time pre-formatted for storage.
#[must_use]
pub fn now_utc_string() -> String {
    format_utc(Utc::now())
}

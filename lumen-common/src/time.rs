//! Timestamp utilities

use chrono::{DateTime, NaiveDate, Utc};

/// Get current UTC timestamp
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Current calendar day in UTC, the unit streaks are counted in
pub fn today() -> NaiveDate {
    Utc::now().date_naive()
}

/// Parse a `YYYY-MM-DD` calendar date
pub fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok()
}

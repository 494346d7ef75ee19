//! Timestamp encoding used throughout the store.
//!
//! RFC 3339 UTC with fixed millisecond precision. Rows written by other
//! producers may use other SQLite date formats, so window queries compare
//! through `julianday()` rather than as text.

use chrono::{DateTime, SecondsFormat, Utc};

pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn lexical_order_matches_time_order() {
        let a = Utc.with_ymd_and_hms(2026, 1, 1, 9, 59, 59).unwrap();
        let b = a + Duration::milliseconds(1500);
        assert!(format_ts(a) < format_ts(b));
    }

    #[test]
    fn fixed_millisecond_precision() {
        let a = Utc.with_ymd_and_hms(2026, 5, 2, 3, 4, 5).unwrap();
        assert_eq!(format_ts(a), "2026-05-02T03:04:05.000Z");
    }
}

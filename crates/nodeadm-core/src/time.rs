use chrono::{DateTime, NaiveDateTime, Utc};

/// Timestamp format used in archive directory names.
const ARCHIVE_STAMP_FORMAT: &str = "%Y%m%d%H%M%S";

/// Compact UTC timestamp for archive directory names, e.g. `20260119143055`.
pub fn archive_stamp(at: DateTime<Utc>) -> String {
    at.format(ARCHIVE_STAMP_FORMAT).to_string()
}

/// Parse a timestamp produced by [`archive_stamp`].
pub fn parse_archive_stamp(stamp: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(stamp, ARCHIVE_STAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

// ABOUTME: Timestamp helpers shared by the SQL layer and the API
// ABOUTME: Fixed-width RFC 3339 so stored timestamps compare lexicographically

use chrono::{DateTime, SecondsFormat, Utc};

/// Render a timestamp as `YYYY-MM-DDTHH:MM:SS.mmmZ`.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s).map(|dt| dt.with_timezone(&Utc))
}

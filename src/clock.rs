use chrono::{DateTime, Duration, NaiveDateTime, Utc};

/// Every timestamp in the database is stored with this literal format, UTC.
pub const DB_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

pub fn format_db_time(t: DateTime<Utc>) -> String {
    t.format(DB_TIME_FORMAT).to_string()
}

pub fn parse_db_time(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    Ok(NaiveDateTime::parse_from_str(s, DB_TIME_FORMAT)?.and_utc())
}

/// Current time without the sub-second part, so the value written to the
/// panel in milliseconds and the one persisted as text agree.
pub fn now_seconds() -> DateTime<Utc> {
    truncate_to_seconds(Utc::now())
}

pub fn truncate_to_seconds(t: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp(t.timestamp(), 0).unwrap_or(t)
}

pub fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

pub fn days(n: i64) -> Duration {
    Duration::days(n)
}

/// Renewal policy: a lapsed subscription restarts from `now`, an active
/// one is pushed back from its current expiry.
pub fn extended_expiry(current_ms: i64, now_ms: i64, days: i64) -> i64 {
    let start = if current_ms < now_ms { now_ms } else { current_ms };
    start + days * DAY_MS
}

/// Same policy over `DateTime`s, for the database side.
pub fn extended_date(current: DateTime<Utc>, now: DateTime<Utc>, n: i64) -> DateTime<Utc> {
    let start = if current < now { now } else { current };
    start + days(n)
}

use chrono::{DateTime, NaiveDateTime, Timelike, Utc};

/// Canonical storage representation: UTC with the timezone stripped.
pub fn to_naive_utc(ts: DateTime<Utc>) -> NaiveDateTime {
    ts.naive_utc()
}

/// Floors a timestamp to the hour (zero minutes, seconds, and subseconds).
pub fn floor_hour(ts: NaiveDateTime) -> NaiveDateTime {
    ts.with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(ts)
}

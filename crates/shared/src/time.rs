//! Canonical clock basis for message timestamps.
//!
//! Timestamps are UTC instants at millisecond precision. The store keeps unix
//! milliseconds, so a message renders identically whether it is observed live
//! or through replay.

use chrono::{DateTime, TimeZone, Utc};

pub fn canonical_now() -> DateTime<Utc> {
    from_unix_millis(Utc::now().timestamp_millis())
}

pub fn to_unix_millis(instant: DateTime<Utc>) -> i64 {
    instant.timestamp_millis()
}

pub fn from_unix_millis(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

use chrono::{DateTime, NaiveDateTime, Utc};

use crate::{AppError, AppResult};

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Interpret `ms` as an absolute UTC instant.
pub fn utc_from_ms(ms: i64) -> AppResult<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms).ok_or_else(|| {
        AppError::new("TIME/INVALID_TIMESTAMP", "Invalid UTC timestamp")
            .with_context("timestamp", ms.to_string())
    })
}

/// Interpret `ms` as wall-clock milliseconds with no zone attached.
pub fn naive_from_ms(ms: i64) -> AppResult<NaiveDateTime> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .map(|dt| dt.naive_utc())
        .ok_or_else(|| {
            AppError::new("TIME/INVALID_TIMESTAMP", "Invalid wall-clock timestamp")
                .with_context("timestamp", ms.to_string())
        })
}

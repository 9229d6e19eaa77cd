use chrono::{DateTime, SecondsFormat, Utc};

use crate::{AppError, AppResult};

/// Timestamps persist and travel as RFC 3339 UTC strings so they round-trip
/// through JSON without a decode step.
pub fn now_utc() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Today's date without a time component, for `date` column defaults.
pub fn today() -> String {
    Utc::now().date_naive().to_string()
}

pub fn parse_utc(value: &str) -> AppResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| {
            AppError::validation("Timestamp is not valid RFC 3339")
                .with_context("timestamp", value.to_string())
        })
}

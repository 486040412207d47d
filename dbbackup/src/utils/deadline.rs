//! "Backup must finish by HH:MM:SS" deadlines.

use crate::utils::errors::{BackupError, Result};
use chrono::{DateTime, Duration, Local, NaiveTime, TimeZone};

pub fn parse_time_of_day(value: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M:%S")
        .map_err(|e| BackupError::validation(format!("invalid time of day {:?}: {}", value, e)))
}

/// Today's `finish_by`, or tomorrow's if that instant has already passed.
pub fn next_deadline(now: DateTime<Local>, finish_by: NaiveTime) -> DateTime<Local> {
    let today = now.date_naive().and_time(finish_by);
    let candidate = Local
        .from_local_datetime(&today)
        .earliest()
        .unwrap_or_else(|| now + Duration::hours(1));
    if candidate <= now {
        candidate + Duration::days(1)
    } else {
        candidate
    }
}

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};

use crate::error::AppError;
use crate::models::RetentionWindow;

/// How the operator expressed the retention window
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetentionInput {
    /// `<N><unit>` with unit one of s, m, h, d
    Ago(String),
    /// Absolute date or date-time
    Timestamp(String),
}

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y/%m/%d %H:%M:%S",
    "%Y/%m/%d %H:%M",
    "%d.%m.%Y %H:%M:%S",
    "%d.%m.%Y %H:%M",
];

const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d", "%Y/%m/%d", "%d.%m.%Y", "%B %d, %Y", "%b %d, %Y", "%d %B %Y", "%d %b %Y",
];

/// Resolve the retention input against `now` into the frozen window of a run
pub fn resolve(input: &RetentionInput, now: DateTime<Utc>) -> Result<RetentionWindow, AppError> {
    match input {
        RetentionInput::Ago(ago) => {
            let cutoff = parse_ago(ago, now)?;
            let (magnitude, unit) = split_ago(ago)?;
            Ok(RetentionWindow {
                cutoff,
                purge_ago: format!("{}{}", magnitude, unit),
            })
        }
        RetentionInput::Timestamp(ts) => {
            let cutoff = parse_timestamp(ts)?;
            Ok(RetentionWindow {
                purge_ago: format!("{}m", minutes_since(cutoff, now)),
                cutoff,
            })
        }
    }
}

/// Whole minutes from `cutoff` to `now`, rounded up so that a purge by age
/// never reaches past the cutoff. Zero when the cutoff lies in the future.
fn minutes_since(cutoff: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    let gap = now - cutoff;
    if gap <= Duration::zero() {
        return 0;
    }
    let minutes = gap.num_minutes();
    if gap > Duration::minutes(minutes) {
        minutes + 1
    } else {
        minutes
    }
}

/// `now` minus a relative specifier like `360d` or `12H`
pub fn parse_ago(ago: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>, AppError> {
    let (magnitude, unit) = split_ago(ago)?;
    subtract(ago, now, magnitude, unit)
}

fn split_ago(ago: &str) -> Result<(i64, char), AppError> {
    let invalid = |reason: &str| AppError::InvalidDurationFormat {
        input: ago.to_string(),
        reason: reason.to_string(),
    };

    let trimmed = ago.trim();
    let unit = trimmed
        .chars()
        .last()
        .ok_or_else(|| invalid("empty duration"))?;
    let magnitude = &trimmed[..trimmed.len() - unit.len_utf8()];

    let magnitude: i64 = magnitude
        .parse()
        .map_err(|_| invalid("invalid duration number"))?;
    if magnitude < 0 {
        return Err(invalid("duration must not be negative"));
    }

    let unit = unit.to_ascii_lowercase();
    if !matches!(unit, 's' | 'm' | 'h' | 'd') {
        return Err(invalid(
            "invalid duration type. Use 's' for seconds, 'm' for minutes, 'h' for hours, or 'd' for days",
        ));
    }

    Ok((magnitude, unit))
}

fn subtract(
    ago: &str,
    now: DateTime<Utc>,
    magnitude: i64,
    unit: char,
) -> Result<DateTime<Utc>, AppError> {
    let delta = match unit {
        's' => Duration::try_seconds(magnitude),
        'm' => Duration::try_minutes(magnitude),
        'h' => Duration::try_hours(magnitude),
        _ => Duration::try_days(magnitude),
    };

    delta
        .and_then(|d| now.checked_sub_signed(d))
        .ok_or_else(|| AppError::InvalidDurationFormat {
            input: ago.to_string(),
            reason: "duration out of range".to_string(),
        })
}

/// Best-effort parse of an absolute date/time. Inputs without an offset
/// are taken as UTC.
pub fn parse_timestamp(input: &str) -> Result<DateTime<Utc>, AppError> {
    let s = input.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    for fmt in DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(naive.and_utc());
        }
    }
    for fmt in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(s, fmt) {
            if let Some(naive) = date.and_hms_opt(0, 0, 0) {
                return Ok(naive.and_utc());
            }
        }
    }

    Err(AppError::UnparseableTimestamp(input.to_string()))
}

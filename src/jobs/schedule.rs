use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use cron::Schedule;

use super::QueueError;

/// Parse a cron pattern. Classic five-field patterns (`min hour dom mon dow`,
/// Sunday as 0 or 7) get a leading seconds field of `0` and their numeric
/// weekdays rewritten as names. Six- and seven-field patterns are passed
/// through in the `cron` crate's own dialect.
pub fn parse(pattern: &str) -> Result<Schedule, QueueError> {
    let invalid = |reason: String| QueueError::InvalidCron {
        pattern: pattern.to_string(),
        reason,
    };
    let normalized = normalize(pattern).map_err(invalid)?;
    Schedule::from_str(&normalized).map_err(|e| invalid(e.to_string()))
}

fn normalize(pattern: &str) -> Result<String, String> {
    let fields: Vec<&str> = pattern.split_whitespace().collect();
    if fields.len() != 5 {
        return Ok(fields.join(" "));
    }
    let dow = day_of_week_names(fields[4])
        .ok_or_else(|| format!("invalid day-of-week field '{}'", fields[4]))?;
    Ok(format!(
        "0 {} {} {} {} {}",
        fields[0], fields[1], fields[2], fields[3], dow
    ))
}

const DAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// Rewrite a numeric day-of-week field (lists, ranges, steps) as day names.
/// Fields that are `*`, `?` or already use names are returned unchanged.
fn day_of_week_names(field: &str) -> Option<String> {
    if field == "*" || field == "?" || field.chars().any(|c| c.is_ascii_alphabetic()) {
        return Some(field.to_string());
    }

    let mut days = [false; 7];
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => (range, step.parse::<usize>().ok().filter(|s| *s > 0)?),
            None => (part, 1),
        };
        let (lo, hi) = if range == "*" {
            (0, 6)
        } else if let Some((lo, hi)) = range.split_once('-') {
            (day_number(lo)?, day_number(hi)?)
        } else {
            let day = day_number(range)?;
            (day, if step > 1 { 6 } else { day })
        };
        if lo > hi {
            return None;
        }
        for day in (lo..=hi).step_by(step) {
            days[day % 7] = true;
        }
    }

    let names: Vec<&str> = DAY_NAMES
        .iter()
        .zip(days)
        .filter_map(|(name, set)| set.then_some(*name))
        .collect();
    Some(names.join(","))
}

fn day_number(s: &str) -> Option<usize> {
    s.parse::<usize>().ok().filter(|d| *d <= 7)
}

/// First fire time strictly after `after_ms`, in Unix milliseconds.
pub fn next_fire(schedule: &Schedule, after_ms: i64) -> Option<i64> {
    let after: DateTime<Utc> = Utc.timestamp_millis_opt(after_ms).single()?;
    schedule.after(&after).next().map(|dt| dt.timestamp_millis())
}

/// Registration key for a recurring job.
pub fn repeat_key(queue: &str) -> String {
    format!("{}:{}", queue, uuid::Uuid::new_v4())
}

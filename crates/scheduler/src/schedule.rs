//! Five-field cron validation, next-fire computation and descriptions.

use std::str::FromStr;

use {
    chrono::{DateTime, Utc},
    chrono_tz::Tz,
    cron::Schedule,
};

use crate::{Error, Result};

const FIELD_NAMES: [&str; 5] = ["minute", "hour", "day-of-month", "month", "day-of-week"];

const WEEKDAYS: [&str; 7] = [
    "Sunday",
    "Monday",
    "Tuesday",
    "Wednesday",
    "Thursday",
    "Friday",
    "Saturday",
];

/// Validate a five-field cron expression (`minute hour day month weekday`).
pub fn validate(expr: &str) -> Result<()> {
    parse(expr).map(|_| ())
}

/// Boolean form of [`validate`].
#[must_use]
pub fn is_valid(expr: &str) -> bool {
    validate(expr).is_ok()
}

/// Parse a five-field expression into a `cron` crate schedule.
///
/// The `cron` crate wants `sec min hour dom month dow year` and numbers
/// weekdays 1-7 from Sunday, so the expression is padded and its weekday
/// field renumbered.
pub fn parse(expr: &str) -> Result<Schedule> {
    let trimmed = expr.trim();
    if trimmed.is_empty() {
        return Err(Error::invalid_schedule(expr, "expression is empty"));
    }

    let fields: Vec<&str> = trimmed.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(Error::invalid_schedule(
            expr,
            format!("expected 5 fields, got {}", fields.len()),
        ));
    }

    for (field, name) in fields.iter().zip(FIELD_NAMES) {
        if let Some(bad) = field
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '*' | '/' | '-' | ',' | '?')))
        {
            return Err(Error::invalid_schedule(
                expr,
                format!("unexpected character '{bad}' in {name} field"),
            ));
        }
    }

    let weekday = translate_weekday(fields[4]);
    let padded = format!(
        "0 {} {} {} {} {weekday} *",
        fields[0], fields[1], fields[2], fields[3]
    );
    Schedule::from_str(&padded).map_err(|e| Error::invalid_schedule(expr, e.to_string()))
}

pub fn parse_timezone(timezone: &str) -> Result<Tz> {
    timezone
        .parse()
        .map_err(|_| Error::unknown_timezone(timezone))
}

pub fn validate_timezone(timezone: &str) -> Result<()> {
    parse_timezone(timezone).map(|_| ())
}

/// Next fire time strictly after `after_ms`, evaluated in `timezone` (UTC when `None`).
pub fn next_fire(expr: &str, timezone: Option<&str>, after_ms: u64) -> Result<Option<u64>> {
    Ok(upcoming(expr, timezone, after_ms, 1)?.into_iter().next())
}

/// Up to `count` fire times strictly after `after_ms`.
pub fn upcoming(
    expr: &str,
    timezone: Option<&str>,
    after_ms: u64,
    count: usize,
) -> Result<Vec<u64>> {
    let schedule = parse(expr)?;
    let tz = match timezone {
        Some(name) => parse_timezone(name)?,
        None => Tz::UTC,
    };
    let after = DateTime::<Utc>::from_timestamp_millis(after_ms as i64)
        .ok_or_else(|| Error::message(format!("timestamp out of range: {after_ms}")))?
        .with_timezone(&tz);

    Ok(schedule
        .after(&after)
        .take(count)
        .map(|dt| dt.timestamp_millis().max(0) as u64)
        .collect())
}

/// Renumber a standard weekday field (0-7, Sunday = 0 or 7) for the `cron`
/// crate (1-7, Sunday = 1). Names pass through.
fn translate_weekday(field: &str) -> String {
    field
        .split(',')
        .map(translate_weekday_item)
        .collect::<Vec<_>>()
        .join(",")
}

fn translate_weekday_item(item: &str) -> String {
    let (base, step) = match item.split_once('/') {
        Some((base, step)) => (base, Some(step)),
        None => (item, None),
    };
    let suffix = step.map(|s| format!("/{s}")).unwrap_or_default();

    if base == "*" || base == "?" {
        return format!("{base}{suffix}");
    }

    if let Some((lo, hi)) = base.split_once('-') {
        let (Ok(lo), Ok(hi)) = (lo.parse::<u32>(), hi.parse::<u32>()) else {
            return item.to_string();
        };
        if hi == 7 && lo > 0 && lo < 7 {
            // Sunday wraps around to the front of the cron crate's week.
            let lo = lo + 1;
            let sunday = match step.and_then(|s| s.parse::<u32>().ok()) {
                Some(step) if step > 0 => (7 + 1 - lo) % step == 0,
                Some(_) => false,
                None => true,
            };
            let wrapped = if sunday { ",1" } else { "" };
            return format!("{lo}-7{suffix}{wrapped}");
        }
        let hi = if hi == 7 {
            7
        } else {
            hi + 1
        };
        return format!("{}-{hi}{suffix}", shift_weekday(lo));
    }

    match base.parse::<u32>() {
        Ok(n) => format!("{}{suffix}", shift_weekday(n)),
        Err(_) => item.to_string(),
    }
}

fn shift_weekday(n: u32) -> u32 {
    if n == 7 {
        1
    } else {
        n + 1
    }
}

/// Human-readable frequency, e.g. "every 5 minutes" or "daily at 03:00".
#[must_use]
pub fn describe(expr: &str) -> String {
    if !is_valid(expr) {
        return format!("invalid schedule ({})", expr.trim());
    }
    let fields: Vec<&str> = expr.split_whitespace().collect();
    let [minute, hour, dom, month, dow] = [fields[0], fields[1], fields[2], fields[3], fields[4]];
    let any = |f: &str| f == "*" || f == "?";

    if any(dom) && any(month) && any(dow) {
        if any(minute) && any(hour) {
            return "every minute".into();
        }
        if any(hour) {
            if let Some(n) = every_n(minute) {
                return plural(n, "minute");
            }
            if let Ok(m) = minute.parse::<u32>() {
                return format!("hourly at minute {m}");
            }
        }
        if let (Ok(m), Some(n)) = (minute.parse::<u32>(), every_n(hour)) {
            return format!("{} at minute {m}", plural(n, "hour"));
        }
    }

    let Some(times) = clock_times(minute, hour) else {
        return format!("cron {}", fields.join(" "));
    };

    match (any(dom), any(month), any(dow)) {
        (true, true, true) => format!("daily at {times}"),
        (true, true, false) => match weekday_names(dow) {
            Some(days) => format!("weekly on {days} at {times}"),
            None => format!("cron {}", fields.join(" ")),
        },
        (false, true, true) => format!("monthly on day {dom} at {times}"),
        _ => format!("cron {}", fields.join(" ")),
    }
}

fn every_n(field: &str) -> Option<u32> {
    field
        .strip_prefix("*/")
        .and_then(|n| n.parse::<u32>().ok())
        .filter(|n| *n > 0)
}

fn plural(n: u32, unit: &str) -> String {
    if n == 1 {
        format!("every {unit}")
    } else {
        format!("every {n} {unit}s")
    }
}

/// "03:00" or "03:00, 15:00" for numeric minute and hour lists.
fn clock_times(minute: &str, hour: &str) -> Option<String> {
    let m = minute.parse::<u32>().ok()?;
    let hours = hour
        .split(',')
        .map(|h| h.parse::<u32>().ok())
        .collect::<Option<Vec<_>>>()?;
    Some(
        hours
            .iter()
            .map(|h| format!("{h:02}:{m:02}"))
            .collect::<Vec<_>>()
            .join(", "),
    )
}

fn weekday_names(field: &str) -> Option<String> {
    let mut names = Vec::new();
    for item in field.split(',') {
        if let Some((lo, hi)) = item.split_once('-') {
            let lo = weekday_name(lo)?;
            let hi = weekday_name(hi)?;
            names.push(format!("{lo} to {hi}"));
        } else {
            names.push(weekday_name(item)?.to_string());
        }
    }
    Some(names.join(", "))
}

fn weekday_name(item: &str) -> Option<&'static str> {
    if let Ok(n) = item.parse::<usize>() {
        return WEEKDAYS.get(n % 7).copied();
    }
    let lower = item.to_ascii_lowercase();
    WEEKDAYS
        .iter()
        .find(|d| d.to_ascii_lowercase().starts_with(&lower) && lower.len() >= 3)
        .copied()
}

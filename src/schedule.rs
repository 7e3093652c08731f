// src/schedule.rs
//! Weekly schedule windows and due-time arithmetic.
//!
//! A window is `(weekday, start HH:MM, duration)` in the schedule's timezone.
//! Windows may run past midnight; the spill-over covers the next day.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Datelike, Duration, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DayWindow {
    #[serde(default)]
    pub enabled: bool,
    /// Local start time, `HH:MM`.
    #[serde(default = "midnight")]
    pub start_time: String,
    #[serde(default = "whole_day")]
    pub duration_minutes: u32,
}

fn midnight() -> String {
    "00:00".to_string()
}

fn whole_day() -> u32 {
    24 * 60
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WeekSchedule {
    #[serde(default = "yes")]
    pub enabled: bool,
    #[serde(default = "utc_name")]
    pub timezone: String,
    /// Keys are weekday names (`monday`, `tue`, ...).
    #[serde(default)]
    pub days: BTreeMap<String, DayWindow>,
}

fn yes() -> bool {
    true
}

fn utc_name() -> String {
    "UTC".to_string()
}

impl WeekSchedule {
    pub fn tz(&self) -> Result<Tz> {
        self.timezone
            .parse::<Tz>()
            .map_err(|e| anyhow!("invalid timezone '{}': {e}", self.timezone))
    }

    fn window_for(&self, day: Weekday) -> Result<Option<&DayWindow>> {
        for (name, w) in &self.days {
            let wd: Weekday = name
                .trim()
                .parse()
                .map_err(|_| anyhow!("invalid weekday '{name}'"))?;
            if wd == day {
                return Ok(Some(w));
            }
        }
        Ok(None)
    }

    /// Whether `now` falls inside an enabled window. A disabled schedule
    /// imposes no restriction.
    pub fn contains(&self, now: DateTime<Utc>) -> Result<bool> {
        if !self.enabled {
            return Ok(true);
        }
        let tz = self.tz()?;
        let local = now.with_timezone(&tz);
        let today = local.date_naive();

        // Yesterday first: a late window may still be open after midnight.
        for back in [1i64, 0] {
            let day = today - Duration::days(back);
            let Some(win) = self.window_for(day.weekday())? else {
                continue;
            };
            if !win.enabled || win.duration_minutes == 0 {
                continue;
            }
            let start = parse_hhmm(&win.start_time)?;
            let Some(start_local) = tz.from_local_datetime(&day.and_time(start)).earliest() else {
                // Start time falls into a DST gap.
                continue;
            };
            let end_local = start_local + Duration::minutes(i64::from(win.duration_minutes));
            if start_local <= local && local < end_local {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

pub fn parse_hhmm(s: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M").with_context(|| format!("invalid start time '{s}'"))
}

/// Seconds past the due time, or `None` when not yet due / outside the window.
///
/// Never-checked watches are due immediately and rank as overdue by one
/// full interval.
pub fn overdue_secs(
    now: DateTime<Utc>,
    last_checked: Option<DateTime<Utc>>,
    interval_secs: u64,
    jitter_secs: u64,
    schedule: Option<&WeekSchedule>,
) -> Result<Option<i64>> {
    if interval_secs == 0 {
        return Err(anyhow!("interval must be positive"));
    }
    if let Some(s) = schedule {
        if !s.contains(now)? {
            return Ok(None);
        }
    }
    let interval = i64::try_from(interval_secs).unwrap_or(i64::MAX / 2);
    let overdue = match last_checked {
        None => interval,
        Some(last) => {
            let due = last + Duration::seconds(interval) + Duration::seconds(jitter_secs as i64);
            let late = now - due;
            if late < Duration::zero() {
                return Ok(None);
            }
            late.num_seconds()
        }
    };
    Ok((overdue >= 0).then_some(overdue))
}

/// "3 minutes ago" style text for status payloads.
pub fn humanize_since(then: Option<DateTime<Utc>>, now: DateTime<Utc>) -> String {
    let Some(t) = then else {
        return "Not yet".to_string();
    };
    let secs = (now - t).num_seconds().max(0);
    let (n, unit) = match secs {
        0..=9 => return "Just now".to_string(),
        10..=59 => (secs, "second"),
        60..=3599 => (secs / 60, "minute"),
        3600..=86_399 => (secs / 3600, "hour"),
        _ => (secs / 86_400, "day"),
    };
    if n == 1 {
        format!("1 {unit} ago")
    } else {
        format!("{n} {unit}s ago")
    }
}

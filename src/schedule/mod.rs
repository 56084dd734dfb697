use chrono::{DateTime, Datelike, Days, Local, NaiveDate, Timelike};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Schedule validation errors
#[derive(Error, Debug)]
pub enum ScheduleError {
    #[error("invalid time of day '{0}', expected HH:MM")]
    BadTime(String),

    #[error("invalid weekday {0}, expected 0 (Sun) through 6 (Sat)")]
    BadDay(u8),

    #[error("window start {start} must be before end {end} on the same day")]
    InvertedWindow { start: String, end: String },

    #[error("window has no weekdays")]
    EmptyDays,
}

/// Result type for schedule operations
pub type ScheduleResult<T> = Result<T, ScheduleError>;

/// A recurring weekday + time-of-day interval during which a subject
/// should be permitted.
///
/// Days use 0 = Sunday through 6 = Saturday. Times are "HH:MM" local time
/// and a window never crosses midnight; an overnight span has to be entered
/// as two same-day windows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub days: Vec<u8>,
    pub start: String,
    pub end: String,
}

/// Per-subject recurring window configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub enabled: bool,
    #[serde(default)]
    pub windows: Vec<Window>,
}

/// Evaluator output for one subject at one instant
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduleStatus {
    pub enabled: bool,
    pub active: bool,
    pub current_window_end: Option<DateTime<Local>>,
    pub next_window_start: Option<DateTime<Local>>,
    pub next_window_end: Option<DateTime<Local>>,
}

impl ScheduleStatus {
    fn inert(enabled: bool) -> Self {
        Self {
            enabled,
            active: false,
            current_window_end: None,
            next_window_start: None,
            next_window_end: None,
        }
    }
}

/// Parse "HH:MM" into minutes since midnight.
pub fn parse_hhmm(raw: &str) -> Option<u32> {
    let (h, m) = raw.split_once(':')?;
    let h: u32 = h.parse().ok()?;
    let m: u32 = m.parse().ok()?;
    if h > 23 || m > 59 {
        return None;
    }
    Some(h * 60 + m)
}

/// Validate a schedule configuration before it is saved.
pub fn validate(cfg: &ScheduleConfig) -> ScheduleResult<()> {
    for window in &cfg.windows {
        if window.days.is_empty() {
            return Err(ScheduleError::EmptyDays);
        }
        for day in &window.days {
            if *day > 6 {
                return Err(ScheduleError::BadDay(*day));
            }
        }
        let start =
            parse_hhmm(&window.start).ok_or_else(|| ScheduleError::BadTime(window.start.clone()))?;
        let end =
            parse_hhmm(&window.end).ok_or_else(|| ScheduleError::BadTime(window.end.clone()))?;
        if start >= end {
            return Err(ScheduleError::InvertedWindow {
                start: window.start.clone(),
                end: window.end.clone(),
            });
        }
    }
    Ok(())
}

/// Attach a minutes-since-midnight time of day to a local date.
fn at_minutes(date: NaiveDate, minutes: u32) -> Option<DateTime<Local>> {
    date.and_hms_opt(minutes / 60, minutes % 60, 0)?
        .and_local_timezone(Local)
        .earliest()
}

/// Evaluate a subject's recurring windows at the given instant.
///
/// Pure function, no side effects; safe to call at any frequency. Windows
/// that fail to parse are ignored here since `validate` rejects them at
/// save time.
pub fn evaluate(cfg: &ScheduleConfig, now: DateTime<Local>) -> ScheduleStatus {
    if !cfg.enabled || cfg.windows.is_empty() {
        return ScheduleStatus::inert(false);
    }

    let windows: Vec<(&[u8], u32, u32)> = cfg
        .windows
        .iter()
        .filter_map(|w| {
            let start = parse_hhmm(&w.start)?;
            let end = parse_hhmm(&w.end)?;
            if start >= end {
                return None;
            }
            Some((w.days.as_slice(), start, end))
        })
        .collect();

    let today = now.date_naive();
    let weekday = now.weekday().num_days_from_sunday() as u8;
    let now_min = now.hour() * 60 + now.minute();

    // Windows may overlap; when more than one covers the current instant
    // the latest end wins.
    let mut current_end: Option<u32> = None;
    for (days, start, end) in &windows {
        if !days.contains(&weekday) {
            continue;
        }
        if *start <= now_min && now_min < *end {
            current_end = Some(current_end.map_or(*end, |prev| prev.max(*end)));
        }
    }

    if let Some(end_min) = current_end {
        return ScheduleStatus {
            enabled: true,
            active: true,
            current_window_end: at_minutes(today, end_min),
            next_window_start: None,
            next_window_end: None,
        };
    }

    // Not inside a window: scan forward day by day, starting with the rest
    // of today, for the earliest upcoming start within a week.
    for offset in 0..=7u64 {
        let date = match today.checked_add_days(Days::new(offset)) {
            Some(d) => d,
            None => break,
        };
        let day = date.weekday().num_days_from_sunday() as u8;

        let mut best: Option<(u32, u32)> = None;
        for (days, start, end) in &windows {
            if !days.contains(&day) {
                continue;
            }
            if offset == 0 && *start <= now_min {
                continue;
            }
            best = match best {
                None => Some((*start, *end)),
                Some((bs, be)) if *start < bs || (*start == bs && *end > be) => {
                    Some((*start, *end))
                }
                other => other,
            };
        }

        if let Some((start, end)) = best {
            return ScheduleStatus {
                enabled: true,
                active: false,
                current_window_end: None,
                next_window_start: at_minutes(date, start),
                next_window_end: at_minutes(date, end),
            };
        }
    }

    ScheduleStatus {
        enabled: true,
        active: false,
        current_window_end: None,
        next_window_start: None,
        next_window_end: None,
    }
}

// src/quiet.rs

//! Maintenance windows during which failures are captured but not reported.
//!
//! A window is written `start:duration`, where `start` is a 5-field cron
//! expression and `duration` a humantime duration. Several windows are joined
//! with further colons: `0 3 * * *:30m:0 * * * 0:1h`.

use crate::error::GuardError;
use chrono::{DateTime, Local, TimeZone};
use croner::Cron;
use std::fmt;
use std::time::Duration;

pub struct QuietWindow {
    expression: String,
    schedule: Cron,
    duration: chrono::Duration,
}

impl fmt::Debug for QuietWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuietWindow")
            .field("start", &self.expression)
            .field("duration", &self.duration)
            .finish()
    }
}

impl QuietWindow {
    pub fn new(expression: &str, duration: Duration) -> Result<Self, GuardError> {
        let expression = expression.trim();
        if expression.split_whitespace().count() != 5 {
            return Err(GuardError::Config(format!(
                "quiet-times start '{expression}' must have 5 cron fields"
            )));
        }
        let schedule = Cron::new(expression).parse().map_err(|e| {
            GuardError::Config(format!("unable to parse cron time '{expression}': {e}"))
        })?;
        let duration = chrono::Duration::from_std(duration)
            .map_err(|e| GuardError::Config(format!("quiet-times duration out of range: {e}")))?;
        Ok(Self {
            expression: expression.to_string(),
            schedule,
            duration,
        })
    }

    /// Parses the colon separated `start:duration[:start:duration...]` list.
    /// An empty string yields no windows.
    pub fn parse_list(spec: &str) -> Result<Vec<Self>, GuardError> {
        if spec.trim().is_empty() {
            return Ok(Vec::new());
        }
        let parts: Vec<&str> = spec.split(':').collect();
        if parts.len() % 2 != 0 {
            return Err(GuardError::Config(
                "invalid quiet-times format, expected start:duration pairs".to_string(),
            ));
        }
        parts
            .chunks(2)
            .map(|pair| {
                let duration = humantime::parse_duration(pair[1].trim()).map_err(|e| {
                    GuardError::Config(format!("unable to parse duration '{}': {e}", pair[1]))
                })?;
                Self::new(pair[0], duration)
            })
            .collect()
    }

    /// True when `now` lies strictly inside `[start, start + duration)`, where
    /// `start` is the latest occurrence of the cron expression that could
    /// still cover `now`. Zero-width windows never match.
    pub fn contains<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> bool {
        if self.duration <= chrono::Duration::zero() {
            return false;
        }
        let from = now.clone() - self.duration;
        match self.schedule.find_next_occurrence(&from, false) {
            Ok(start) => {
                let end = start.clone() + self.duration;
                start < *now && *now < end
            }
            Err(_) => false,
        }
    }
}

/// Whether the current local time falls in any of `windows`.
pub fn is_quiet(windows: &[QuietWindow]) -> bool {
    let now = Local::now();
    windows.iter().any(|w| w.contains(&now))
}

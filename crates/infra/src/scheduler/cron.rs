//! Cron expression parsing.
//!
//! Accepts standard 5-field expressions (minute resolution) as well as the
//! 6/7-field form with a leading seconds column understood by the `cron`
//! crate. The 5-field form keeps the usual day-of-week numbering (0-7,
//! Sunday as 0 or 7); the 6/7-field form uses the crate's own (1-7 from
//! Sunday).

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};

use super::ScheduleError;

#[derive(Clone)]
pub struct CronSchedule {
    expression: String,
    schedule: cron::Schedule,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self, ScheduleError> {
        let trimmed = expression.trim();
        let invalid = |reason: String| ScheduleError::InvalidCron {
            expression: expression.to_string(),
            reason,
        };
        let fields: Vec<&str> = trimmed.split_whitespace().collect();
        let normalized = match fields.as_slice() {
            [minute, hour, dom, month, dow] => {
                let dow = day_of_week_names(dow).map_err(invalid)?;
                format!("0 {minute} {hour} {dom} {month} {dow}")
            }
            fields if matches!(fields.len(), 6 | 7) => trimmed.to_string(),
            fields => return Err(invalid(format!("expected 5, 6 or 7 fields, got {}", fields.len()))),
        };
        let schedule = cron::Schedule::from_str(&normalized).map_err(|e| ScheduleError::InvalidCron {
            expression: expression.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            expression: trimmed.to_string(),
            schedule,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// First fire time strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }

    /// Fire times in `(after, until]`, oldest first, at most `limit`.
    pub fn fires_between(&self, after: DateTime<Utc>, until: DateTime<Utc>, limit: usize) -> Vec<DateTime<Utc>> {
        self.schedule
            .after(&after)
            .take_while(|t| *t <= until)
            .take(limit)
            .collect()
    }
}

const DAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// Rewrite a standard day-of-week field into day names. Named days pass
/// through untouched.
fn day_of_week_names(field: &str) -> Result<String, String> {
    if field == "*" || field == "?" {
        return Ok(field.to_string());
    }
    let day = |s: &str| {
        s.parse::<usize>()
            .ok()
            .filter(|d| *d <= 7)
            .ok_or_else(|| format!("invalid day of week `{s}`"))
    };

    let mut names: Vec<String> = Vec::new();
    for part in field.split(',') {
        if part.chars().any(|c| c.is_ascii_alphabetic()) {
            names.push(part.to_string());
            continue;
        }
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step = step
                    .parse::<usize>()
                    .ok()
                    .filter(|s| *s > 0)
                    .ok_or_else(|| format!("invalid step in `{part}`"))?;
                (range, Some(step))
            }
            None => (part, None),
        };
        let (start, end) = match range.split_once('-') {
            _ if range == "*" => (0, 6),
            Some((a, b)) => (day(a)?, day(b)?),
            None if step.is_some() => (day(range)?, 6),
            None => {
                let d = day(range)?;
                (d, d)
            }
        };
        if start > end {
            return Err(format!("day-of-week range `{part}` runs backwards"));
        }
        for d in (start..=end).step_by(step.unwrap_or(1)) {
            let name = DAY_NAMES[d % 7];
            if !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
        }
    }
    Ok(names.join(","))
}

impl fmt::Debug for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CronSchedule").field(&self.expression).finish()
    }
}

impl FromStr for CronSchedule {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, h, m, 0).unwrap()
    }

    #[test]
    fn five_field_expressions_fire_on_the_minute() {
        let cron = CronSchedule::parse("*/5 * * * *").unwrap();
        assert_eq!(cron.next_after(at(10, 2)), Some(at(10, 5)));
        assert_eq!(cron.next_after(at(10, 5)), Some(at(10, 10)));
    }

    #[test]
    fn window_is_open_closed() {
        let cron = CronSchedule::parse("*/5 * * * *").unwrap();
        let fires = cron.fires_between(at(10, 0), at(10, 15), 100);
        assert_eq!(fires, vec![at(10, 5), at(10, 10), at(10, 15)]);
        assert_eq!(cron.fires_between(at(10, 0), at(10, 15), 2).len(), 2);
    }

    #[test]
    fn seconds_form_is_accepted() {
        let cron = CronSchedule::parse("30 * * * * *").unwrap();
        assert_eq!(
            cron.next_after(at(10, 0)),
            Some(Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 30).unwrap())
        );
    }

    #[test]
    fn rejects_malformed_expressions() {
        assert!(matches!(
            CronSchedule::parse("* *"),
            Err(ScheduleError::InvalidCron { .. })
        ));
        assert!(CronSchedule::parse("61 * * * *").is_err());
    }

    fn day(d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, d, h, 0, 0).unwrap()
    }

    #[test]
    fn five_field_day_of_week_counts_from_sunday_zero() {
        // 2024-03-01 is a Friday.
        let weekdays = CronSchedule::parse("0 9 * * 1-5").unwrap();
        assert_eq!(weekdays.next_after(at(10, 0)), Some(day(4, 9)));

        for sunday in ["0 0 * * 0", "0 0 * * 7", "0 0 * * SUN"] {
            let cron = CronSchedule::parse(sunday).unwrap();
            assert_eq!(cron.next_after(at(10, 0)), Some(day(3, 0)), "{sunday}");
        }

        let weekend = CronSchedule::parse("0 0 * * 5-7").unwrap();
        assert_eq!(
            weekend.fires_between(at(0, 0), day(8, 0), 10),
            vec![day(2, 0), day(3, 0), day(8, 0)]
        );

        let every_other = CronSchedule::parse("0 0 * * */2").unwrap();
        assert_eq!(every_other.next_after(at(10, 0)), Some(day(2, 0)));
        assert_eq!(every_other.next_after(day(2, 0)), Some(day(3, 0)));
    }

    #[test]
    fn rejects_out_of_range_days() {
        assert!(CronSchedule::parse("0 0 * * 8").is_err());
        assert!(CronSchedule::parse("0 0 * * 5-1").is_err());
        assert!(CronSchedule::parse("0 0 * * 1/0").is_err());
    }
}

// Copyright 2024 RisingWave Labs
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Hand-rolled five-field cron engine (SPEC_FULL.md §4.6/§9): no `cron` crate,
//! only `chrono`/`chrono-tz` for converting a configured IANA zone into
//! wall-clock fields. Grounded on the cron semantics described in
//! `original_source/src/symphony/node/runner_exec.py`'s `auto_restart` handling
//! (the source delegates to a library; this port specifies the grammar
//! directly per SPEC_FULL.md §4.6).

use std::collections::BTreeSet;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike};
use chrono_tz::Tz;

use crate::error::{CronError, CronResult};

/// Scan horizon: a little over two years of minutes. A cron expression that
/// cannot match within this horizon (e.g. `31 * * 2 *`, day 31 in February) is
/// rejected rather than looped over forever.
const MAX_SCAN_MINUTES: i64 = 2 * 366 * 24 * 60;

#[derive(Debug, Clone)]
struct Field {
    values: BTreeSet<u32>,
    is_wildcard: bool,
}

impl Field {
    fn matches(&self, v: u32) -> bool {
        self.values.contains(&v)
    }
}

fn parse_field(raw: &str, min: u32, max: u32, name: &'static str) -> CronResult<Field> {
    let is_wildcard = raw == "*";
    let mut values = BTreeSet::new();
    for part in raw.split(',') {
        values.extend(parse_part(part, min, max, name)?);
    }
    if values.is_empty() {
        return Err(CronError::InvalidField { field: name, value: raw.to_string() });
    }
    for v in &values {
        if *v < min || *v > max {
            return Err(CronError::InvalidField { field: name, value: raw.to_string() });
        }
    }
    Ok(Field { values, is_wildcard })
}

fn parse_part(part: &str, min: u32, max: u32, name: &'static str) -> CronResult<Vec<u32>> {
    let invalid = || CronError::InvalidField { field: name, value: part.to_string() };

    if let Some((base, step)) = part.split_once('/') {
        let step: u32 = step.parse().map_err(|_| invalid())?;
        if step == 0 {
            return Err(invalid());
        }
        let (start, end) = if base == "*" {
            (min, max)
        } else if let Some((a, b)) = base.split_once('-') {
            let a: u32 = a.parse().map_err(|_| invalid())?;
            let b: u32 = b.parse().map_err(|_| invalid())?;
            if a > b {
                return Err(invalid());
            }
            (a, b)
        } else {
            let a: u32 = base.parse().map_err(|_| invalid())?;
            (a, max)
        };
        return Ok((start..=end).step_by(step as usize).collect());
    }

    if let Some((a, b)) = part.split_once('-') {
        let a: u32 = a.parse().map_err(|_| invalid())?;
        let b: u32 = b.parse().map_err(|_| invalid())?;
        if a > b {
            return Err(invalid());
        }
        return Ok((a..=b).collect());
    }

    if part == "*" {
        return Ok((min..=max).collect());
    }

    let v: u32 = part.parse().map_err(|_| invalid())?;
    Ok(vec![v])
}

/// Normalizes day-of-week value 7 (Sunday, per the spec's 0-7 convention) to 0.
fn normalize_dow(v: u32) -> u32 {
    if v == 7 {
        0
    } else {
        v
    }
}

#[derive(Debug, Clone)]
pub struct CronSchedule {
    minute: Field,
    hour: Field,
    dom: Field,
    month: Field,
    dow: Field,
}

impl FromStr for CronSchedule {
    type Err = CronError;

    fn from_str(expr: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronError::WrongFieldCount(fields.len()));
        }
        let minute = parse_field(fields[0], 0, 59, "minute")?;
        let hour = parse_field(fields[1], 0, 23, "hour")?;
        let dom = parse_field(fields[2], 1, 31, "day-of-month")?;
        let month = parse_field(fields[3], 1, 12, "month")?;
        let mut dow = parse_field(fields[4], 0, 7, "day-of-week")?;
        dow.values = dow.values.into_iter().map(normalize_dow).collect();
        Ok(Self { minute, hour, dom, month, dow })
    }
}

impl CronSchedule {
    /// Day-of-month and day-of-week combine with cron's classical OR rule
    /// (SPEC_FULL.md §4.6): both wildcards match anything; exactly one
    /// wildcard requires the other field; neither wildcard matches on either.
    fn day_matches(&self, day_of_month: u32, day_of_week: u32) -> bool {
        match (self.dom.is_wildcard, self.dow.is_wildcard) {
            (true, true) => true,
            (false, true) => self.dom.matches(day_of_month),
            (true, false) => self.dow.matches(day_of_week),
            (false, false) => self.dom.matches(day_of_month) || self.dow.matches(day_of_week),
        }
    }

    fn matches(&self, dt: &DateTime<Tz>) -> bool {
        self.minute.matches(dt.minute())
            && self.hour.matches(dt.hour())
            && self.month.matches(dt.month())
            && self.day_matches(dt.day(), dt.weekday().num_days_from_sunday())
    }

    /// Finds the first whole-minute instant strictly after `after` that
    /// matches, within the scan horizon.
    pub fn next_after(&self, after: DateTime<Tz>) -> CronResult<DateTime<Tz>> {
        let tz = after.timezone();
        let start_naive = (after.naive_local() + Duration::minutes(1))
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(after.naive_local());
        let mut candidate = match tz.from_local_datetime(&start_naive).single() {
            Some(dt) => dt,
            None => tz.from_utc_datetime(&start_naive.and_utc().naive_utc()),
        };
        for _ in 0..MAX_SCAN_MINUTES {
            if self.matches(&candidate) {
                return Ok(candidate);
            }
            candidate += Duration::minutes(1);
        }
        Err(CronError::HorizonExceeded)
    }
}

pub fn parse_timezone(name: &str) -> CronResult<Tz> {
    name.parse::<Tz>().map_err(|_| CronError::UnknownTimezone(name.to_string()))
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    fn tz() -> Tz {
        parse_timezone("America/Los_Angeles").unwrap()
    }

    #[test]
    fn rejects_wrong_field_count() {
        assert_eq!("0 3 * *".parse::<CronSchedule>().unwrap_err(), CronError::WrongFieldCount(4));
    }

    #[test]
    fn daily_3am_from_259() {
        let sched: CronSchedule = "0 3 * * *".parse().unwrap();
        let start = tz()
            .from_local_datetime(&NaiveDate::from_ymd_opt(2026, 1, 10).unwrap().and_hms_opt(2, 59, 0).unwrap())
            .unwrap();
        let next = sched.next_after(start).unwrap();
        assert_eq!(next.hour(), 3);
        assert_eq!(next.minute(), 0);
        assert_eq!((next - start).num_seconds(), 60);
    }

    #[test]
    fn dom_or_dow_matches_either() {
        // 15th of the month OR any Monday at 09:00.
        let sched: CronSchedule = "0 9 15 * 1".parse().unwrap();
        let monday = NaiveDate::from_ymd_opt(2026, 1, 5).unwrap(); // a Monday
        assert!(monday.weekday().num_days_from_sunday() == 1);
        let start = tz().from_local_datetime(&monday.and_hms_opt(8, 0, 0).unwrap()).unwrap();
        let next = sched.next_after(start).unwrap();
        assert_eq!(next.day(), 5);
        assert_eq!(next.hour(), 9);
    }

    #[test]
    fn impossible_schedule_exceeds_horizon() {
        let sched: CronSchedule = "0 0 31 2 *".parse().unwrap();
        let start = tz().from_local_datetime(&NaiveDate::from_ymd_opt(2026, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap()).unwrap();
        assert!(matches!(sched.next_after(start), Err(CronError::HorizonExceeded)));
    }

    #[test]
    fn step_field_parses() {
        let sched: CronSchedule = "*/15 * * * *".parse().unwrap();
        assert_eq!(sched.minute.values, BTreeSet::from([0, 15, 30, 45]));
    }
}

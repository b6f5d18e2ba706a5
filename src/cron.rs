//! Five-field cron expressions: minute, hour, day-of-month, month, weekday.
//!
//! Each field supports `*`, single values, inclusive ranges `a-b`, steps
//! `*/s` and `a-b/s`, and comma lists. Parsing yields one bitmask per field;
//! a match is a simple AND of bit tests, so the per-minute scan in the
//! supervisor stays trivial.

use crate::error::VelosError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CronExpr {
    minutes: u64,  // bits 0..=59
    hours: u32,    // bits 0..=23
    days: u32,     // bits 1..=31
    months: u16,   // bits 1..=12
    weekdays: u8,  // bits 0..=6, Sunday = 0
}

impl CronExpr {
    pub fn parse(expr: &str) -> Result<Self, VelosError> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(VelosError::InvalidCron(format!(
                "expected 5 fields, got {}",
                fields.len()
            )));
        }
        Ok(Self {
            minutes: parse_field(fields[0], 0, 59)?,
            hours: parse_field(fields[1], 0, 23)? as u32,
            days: parse_field(fields[2], 1, 31)? as u32,
            months: parse_field(fields[3], 1, 12)? as u16,
            weekdays: parse_field(fields[4], 0, 6)? as u8,
        })
    }

    /// True iff every field bit is set. Out-of-range inputs never match.
    pub fn matches(&self, minute: u32, hour: u32, day: u32, month: u32, weekday: u32) -> bool {
        minute <= 59
            && hour <= 23
            && (1..=31).contains(&day)
            && (1..=12).contains(&month)
            && weekday <= 6
            && self.minutes & (1 << minute) != 0
            && self.hours & (1 << hour) != 0
            && self.days & (1 << day) != 0
            && self.months & (1 << month) != 0
            && self.weekdays & (1 << weekday) != 0
    }
}

/// Parse one field into a bitmask over `min..=max`.
fn parse_field(spec: &str, min: u32, max: u32) -> Result<u64, VelosError> {
    let mut mask: u64 = 0;
    for part in spec.split(',') {
        if part.is_empty() {
            return Err(VelosError::InvalidCron(format!("empty list item in {spec:?}")));
        }
        let (range, step) = match part.split_once('/') {
            Some((r, s)) => {
                let step: u32 = s
                    .parse()
                    .map_err(|_| VelosError::InvalidCron(format!("bad step in {part:?}")))?;
                if step == 0 {
                    return Err(VelosError::InvalidCron(format!("zero step in {part:?}")));
                }
                (r, step)
            }
            None => (part, 1),
        };

        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            (parse_value(a, min, max)?, parse_value(b, min, max)?)
        } else {
            let v = parse_value(range, min, max)?;
            (v, v)
        };
        if lo > hi {
            return Err(VelosError::InvalidCron(format!("inverted range in {part:?}")));
        }

        let mut v = lo;
        while v <= hi {
            mask |= 1 << v;
            v += step;
        }
    }
    Ok(mask)
}

fn parse_value(s: &str, min: u32, max: u32) -> Result<u32, VelosError> {
    let v: u32 = s
        .parse()
        .map_err(|_| VelosError::InvalidCron(format!("bad value {s:?}")))?;
    if v < min || v > max {
        return Err(VelosError::InvalidCron(format!(
            "value {v} out of range {min}-{max}"
        )));
    }
    Ok(v)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_matches_everything_in_range() {
        let c = CronExpr::parse("* * * * *").unwrap();
        for minute in [0, 30, 59] {
            for hour in [0, 12, 23] {
                for day in [1, 15, 31] {
                    for month in [1, 6, 12] {
                        for weekday in [0, 3, 6] {
                            assert!(c.matches(minute, hour, day, month, weekday));
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn single_values() {
        let c = CronExpr::parse("30 4 1 1 0").unwrap();
        assert!(c.matches(30, 4, 1, 1, 0));
        assert!(!c.matches(31, 4, 1, 1, 0));
        assert!(!c.matches(30, 5, 1, 1, 0));
        assert!(!c.matches(30, 4, 2, 1, 0));
    }

    #[test]
    fn ranges_and_steps() {
        let c = CronExpr::parse("0-10/5 */6 * * 1-5").unwrap();
        assert!(c.matches(0, 0, 1, 1, 1));
        assert!(c.matches(5, 6, 1, 1, 5));
        assert!(c.matches(10, 18, 1, 1, 3));
        assert!(!c.matches(3, 0, 1, 1, 1)); // minute not on step
        assert!(!c.matches(0, 5, 1, 1, 1)); // hour not on step
        assert!(!c.matches(0, 0, 1, 1, 0)); // Sunday excluded
    }

    #[test]
    fn comma_lists() {
        let c = CronExpr::parse("1,15,45 0,12 * * *").unwrap();
        assert!(c.matches(15, 12, 1, 1, 0));
        assert!(c.matches(45, 0, 28, 12, 6));
        assert!(!c.matches(30, 12, 1, 1, 0));
    }

    #[test]
    fn rejects_malformed_expressions() {
        assert!(CronExpr::parse("* * * *").is_err());
        assert!(CronExpr::parse("* * * * * *").is_err());
        assert!(CronExpr::parse("60 * * * *").is_err());
        assert!(CronExpr::parse("* 24 * * *").is_err());
        assert!(CronExpr::parse("* * 0 * *").is_err());
        assert!(CronExpr::parse("* * * 13 *").is_err());
        assert!(CronExpr::parse("* * * * 7").is_err());
        assert!(CronExpr::parse("*/0 * * * *").is_err());
        assert!(CronExpr::parse("5-1 * * * *").is_err());
        assert!(CronExpr::parse("a * * * *").is_err());
        assert!(CronExpr::parse("1,,2 * * * *").is_err());
    }

    #[test]
    fn out_of_range_match_inputs_are_false() {
        let c = CronExpr::parse("* * * * *").unwrap();
        assert!(!c.matches(60, 0, 1, 1, 0));
        assert!(!c.matches(0, 24, 1, 1, 0));
        assert!(!c.matches(0, 0, 0, 1, 0));
        assert!(!c.matches(0, 0, 32, 1, 0));
        assert!(!c.matches(0, 0, 1, 0, 0));
        assert!(!c.matches(0, 0, 1, 13, 0));
        assert!(!c.matches(0, 0, 1, 1, 7));
    }
}

//! Extended 5-field cron expression parsing and evaluation. Each field compiles to
//! a bitset so `matches` and `next_run_time` are constant-time per minute checked,
//! rather than re-parsing the expression on every comparison.

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike};
use chrono_tz::Tz;
use std::fmt;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CronError {
    #[error("invalid cron expression: expected 5 fields, got {0}")]
    WrongFieldCount(usize),
    #[error("invalid field {field}: {value}")]
    InvalidField { field: &'static str, value: String },
    #[error("no matching time found within one year")]
    Unreachable,
}

impl core_common::error::Classify for CronError {
    fn kind(&self) -> core_common::error::ErrorKind {
        match self {
            CronError::Unreachable => core_common::error::ErrorKind::Fatal,
            _ => core_common::error::ErrorKind::IllegalState,
        }
    }
}

/// A parsed field, represented as the bitset of values it allows (bit N set = value N
/// permitted). Out-of-range values from the raw expression are silently discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Field(u64);

impl Field {
    fn allows(&self, value: u32) -> bool {
        value < 64 && (self.0 & (1 << value)) != 0
    }

    fn parse(raw: &str, min: u32, max: u32, field_name: &'static str) -> Result<Self, CronError> {
        let mut bits: u64 = 0;
        for part in raw.split(',') {
            let part = part.trim();
            if part.is_empty() {
                return Err(CronError::InvalidField {
                    field: field_name,
                    value: raw.to_string(),
                });
            }
            let (range_part, step) = match part.split_once('/') {
                Some((r, s)) => {
                    let step: u32 = s.parse().map_err(|_| CronError::InvalidField {
                        field: field_name,
                        value: raw.to_string(),
                    })?;
                    if step == 0 {
                        return Err(CronError::InvalidField {
                            field: field_name,
                            value: raw.to_string(),
                        });
                    }
                    (r, step)
                }
                None => (part, 1),
            };

            let (lo, hi) = if range_part == "*" {
                (min, max)
            } else if let Some((a, b)) = range_part.split_once('-') {
                let lo: u32 = a.parse().map_err(|_| CronError::InvalidField {
                    field: field_name,
                    value: raw.to_string(),
                })?;
                let hi: u32 = b.parse().map_err(|_| CronError::InvalidField {
                    field: field_name,
                    value: raw.to_string(),
                })?;
                (lo, hi)
            } else {
                let v: u32 = range_part.parse().map_err(|_| CronError::InvalidField {
                    field: field_name,
                    value: raw.to_string(),
                })?;
                (v, v)
            };

            let mut v = lo;
            while v <= hi {
                if v >= min && v <= max {
                    bits |= 1 << v;
                }
                v += step;
            }
        }
        Ok(Field(bits))
    }
}

/// A fully parsed 5-field expression: minute, hour, day-of-month, month, day-of-week.
/// Day-of-month and day-of-week are conjunctive (both must match), matching this
/// explicit instruction not to switch to the disjunctive "vixie cron" variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    raw: String,
    minute: Field,
    hour: Field,
    day_of_month: Field,
    month: Field,
    day_of_week: Field,
}

impl fmt::Display for CronExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

impl CronExpr {
    pub fn parse(expr: &str) -> Result<Self, CronError> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronError::WrongFieldCount(fields.len()));
        }
        Ok(CronExpr {
            raw: expr.trim().split_whitespace().collect::<Vec<_>>().join(" "),
            minute: Field::parse(fields[0], 0, 59, "minute")?,
            hour: Field::parse(fields[1], 0, 23, "hour")?,
            day_of_month: Field::parse(fields[2], 1, 31, "day_of_month")?,
            month: Field::parse(fields[3], 1, 12, "month")?,
            day_of_week: Field::parse(fields[4], 0, 6, "day_of_week")?,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Whether `instant`, read at minute granularity in `tz`, satisfies all five
    /// fields.
    pub fn matches(&self, instant: DateTime<chrono::Utc>, tz: Tz) -> bool {
        let local = instant.with_timezone(&tz);
        self.minute.allows(local.minute())
            && self.hour.allows(local.hour())
            && self.day_of_month.allows(local.day())
            && self.month.allows(local.month())
            && self.day_of_week.allows(local.weekday().num_days_from_sunday())
    }

    /// The smallest minute-aligned instant strictly greater than `after` that matches,
    /// searching at most one year of minutes before giving up with `Unreachable`.
    pub fn next_run_time(
        &self,
        after: DateTime<chrono::Utc>,
        tz: Tz,
    ) -> Result<DateTime<chrono::Utc>, CronError> {
        let local_after = after.with_timezone(&tz);
        let mut candidate = (local_after + Duration::minutes(1))
            .with_second(0)
            .and_then(|d| d.with_nanosecond(0))
            .ok_or(CronError::Unreachable)?;

        const MAX_MINUTES: i64 = 366 * 24 * 60;
        for _ in 0..MAX_MINUTES {
            let utc_candidate = candidate.with_timezone(&chrono::Utc);
            if self.matches(utc_candidate, tz) {
                return Ok(utc_candidate);
            }
            candidate += Duration::minutes(1);
        }
        Err(CronError::Unreachable)
    }
}

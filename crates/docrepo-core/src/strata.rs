//! Time-stratified retention policy.
//!
//! A [`Strata`] ladder describes how aggressively historical records are folded
//! together as they age. The ladder is walked in the order the caller declared
//! it and the last tier that applies wins; the policy never sorts tiers.
//!
//! ```
//! use docrepo_core::strata::{get_strata_at, Granularity, Strata};
//! use chrono::{Duration, Utc};
//!
//! // Daily detail for a month, monthly aggregates after that.
//! let ladder = vec![
//!     Strata::new(Granularity::Day),
//!     Strata::after(Granularity::Month, Granularity::Month),
//! ];
//! let now = Utc::now();
//! let tier = get_strata_at(&ladder, now - Duration::days(40), now).unwrap();
//! assert_eq!(tier.compress_per, Granularity::Month);
//! ```

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Approximate month length used for age bucketing.
pub const MONTH_DAYS: i64 = 31;
/// Approximate year length used for age bucketing.
pub const YEAR_DAYS: i64 = 365;

/// Discrete bucket of elapsed time, ordered from finest to coarsest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    None,
    Minute,
    Hour,
    Day,
    Month,
    Year,
}

impl Granularity {
    /// Returns the canonical lowercase name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Minute => "minute",
            Self::Hour => "hour",
            Self::Day => "day",
            Self::Month => "month",
            Self::Year => "year",
        }
    }

    /// Start of the period of this granularity that contains `timestamp`.
    ///
    /// Months and years truncate on the calendar; `None` returns the input.
    #[must_use]
    pub fn truncate(&self, timestamp: DateTime<Utc>) -> DateTime<Utc> {
        let midnight = |year: i32, month: u32, day: u32| {
            Utc.with_ymd_and_hms(year, month, day, 0, 0, 0)
                .single()
                .unwrap_or(timestamp)
        };

        match self {
            Self::None => timestamp,
            Self::Minute => timestamp
                .with_nanosecond(0)
                .and_then(|t| t.with_second(0))
                .unwrap_or(timestamp),
            Self::Hour => timestamp
                .with_nanosecond(0)
                .and_then(|t| t.with_second(0))
                .and_then(|t| t.with_minute(0))
                .unwrap_or(timestamp),
            Self::Day => midnight(timestamp.year(), timestamp.month(), timestamp.day()),
            Self::Month => midnight(timestamp.year(), timestamp.month(), 1),
            Self::Year => midnight(timestamp.year(), 1, 1),
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One retention tier of a compression ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Strata {
    /// Granularity records are folded to once this tier applies.
    pub compress_per: Granularity,
    /// Minimum record age for the tier to apply; `None` applies unconditionally.
    #[serde(default)]
    pub compress_after: Option<Granularity>,
}

impl Strata {
    /// Unconditional tier.
    #[must_use]
    pub const fn new(compress_per: Granularity) -> Self {
        Self {
            compress_per,
            compress_after: None,
        }
    }

    /// Tier that applies once records are at least `compress_after` old.
    #[must_use]
    pub const fn after(compress_per: Granularity, compress_after: Granularity) -> Self {
        Self {
            compress_per,
            compress_after: Some(compress_after),
        }
    }

    /// Whether this tier applies to a record of the given age.
    #[must_use]
    pub fn applies_to(&self, age: Granularity) -> bool {
        self.compress_after.map_or(true, |threshold| age >= threshold)
    }
}

/// Buckets the time elapsed since `timestamp` against the current UTC time.
#[must_use]
pub fn get_age(timestamp: DateTime<Utc>) -> Granularity {
    get_age_at(timestamp, Utc::now())
}

/// Buckets the time elapsed between `timestamp` and `now`.
///
/// Boundaries are inclusive-lower: exactly one hour old is `Hour`. Months and
/// years use fixed 31 and 365 day lengths. Timestamps in the future are `None`.
#[must_use]
pub fn get_age_at(timestamp: DateTime<Utc>, now: DateTime<Utc>) -> Granularity {
    let elapsed = now.signed_duration_since(timestamp);

    if elapsed < Duration::minutes(1) {
        Granularity::None
    } else if elapsed < Duration::hours(1) {
        Granularity::Minute
    } else if elapsed < Duration::days(1) {
        Granularity::Hour
    } else if elapsed < Duration::days(MONTH_DAYS) {
        Granularity::Day
    } else if elapsed < Duration::days(YEAR_DAYS) {
        Granularity::Month
    } else {
        Granularity::Year
    }
}

/// Selects the active tier for a record stamped `timestamp`, against now.
#[must_use]
pub fn get_strata(stratas: &[Strata], timestamp: DateTime<Utc>) -> Option<Strata> {
    get_strata_at(stratas, timestamp, Utc::now())
}

/// Selects the active tier for a record stamped `timestamp`.
///
/// The whole ladder is walked in declaration order and the last applicable
/// tier wins. A tier that does not apply is skipped, so an unconditional tier
/// still matches when it follows a thresholded one. Nothing is selected when
/// no tier applies.
#[must_use]
pub fn get_strata_at(
    stratas: &[Strata],
    timestamp: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Option<Strata> {
    let age = get_age_at(timestamp, now);
    stratas
        .iter()
        .filter(|strata| strata.applies_to(age))
        .last()
        .copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ago(now: DateTime<Utc>, days: i64, hours: i64, minutes: i64) -> DateTime<Utc> {
        now - Duration::days(days) - Duration::hours(hours) - Duration::minutes(minutes)
    }

    #[test]
    fn test_age_boundaries() {
        let now = Utc::now();
        let cases = [
            (ago(now, 0, 0, 0), Granularity::None),
            (now - Duration::seconds(59), Granularity::None),
            (ago(now, 0, 0, 1), Granularity::Minute),
            (ago(now, 0, 0, 59), Granularity::Minute),
            (ago(now, 0, 1, 0), Granularity::Hour),
            (ago(now, 0, 23, 59), Granularity::Hour),
            (ago(now, 1, 0, 0), Granularity::Day),
            (ago(now, 30, 23, 59), Granularity::Day),
            (ago(now, 31, 0, 0), Granularity::Month),
            (ago(now, 364, 23, 59), Granularity::Month),
            (ago(now, 365, 0, 0), Granularity::Year),
            (ago(now, 5000, 0, 0), Granularity::Year),
        ];

        for (timestamp, expected) in cases {
            assert_eq!(get_age_at(timestamp, now), expected, "age of {timestamp}");
        }
    }

    #[test]
    fn test_future_timestamp_is_fresh() {
        let now = Utc::now();
        assert_eq!(get_age_at(now + Duration::days(3), now), Granularity::None);
    }

    #[test]
    fn test_granularity_ladder_order() {
        assert!(Granularity::None < Granularity::Minute);
        assert!(Granularity::Minute < Granularity::Hour);
        assert!(Granularity::Hour < Granularity::Day);
        assert!(Granularity::Day < Granularity::Month);
        assert!(Granularity::Month < Granularity::Year);
    }

    #[test]
    fn test_truncate() {
        let ts = Utc.with_ymd_and_hms(2024, 7, 19, 13, 47, 12).unwrap();
        assert_eq!(Granularity::None.truncate(ts), ts);
        assert_eq!(
            Granularity::Minute.truncate(ts),
            Utc.with_ymd_and_hms(2024, 7, 19, 13, 47, 0).unwrap()
        );
        assert_eq!(
            Granularity::Hour.truncate(ts),
            Utc.with_ymd_and_hms(2024, 7, 19, 13, 0, 0).unwrap()
        );
        assert_eq!(
            Granularity::Day.truncate(ts),
            Utc.with_ymd_and_hms(2024, 7, 19, 0, 0, 0).unwrap()
        );
        assert_eq!(
            Granularity::Month.truncate(ts),
            Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap()
        );
        assert_eq!(
            Granularity::Year.truncate(ts),
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_applies_to() {
        assert!(Strata::new(Granularity::Day).applies_to(Granularity::None));
        let monthly = Strata::after(Granularity::Month, Granularity::Month);
        assert!(!monthly.applies_to(Granularity::Day));
        assert!(monthly.applies_to(Granularity::Month));
        assert!(monthly.applies_to(Granularity::Year));
    }

    #[test]
    fn test_strata_deserializes_without_threshold() {
        let strata: Strata = serde_json::from_str(r#"{"compress_per":"hour"}"#).unwrap();
        assert_eq!(strata, Strata::new(Granularity::Hour));
    }
}

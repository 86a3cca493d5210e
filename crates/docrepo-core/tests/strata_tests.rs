//! Retention ladder behaviour at the documented age boundaries.

use chrono::{DateTime, Duration, TimeZone, Utc};
use docrepo_core::strata::{get_age_at, get_strata, get_strata_at, Granularity, Strata};
use proptest::prelude::*;

fn fixed_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap()
}

/// Parses `d.hh:mm:ss` ages the way the boundary tables are written.
fn age(spec: &str) -> Duration {
    let (days, clock) = spec.split_once('.').unwrap_or(("0", spec));
    let mut parts = clock.split(':').map(|p| p.parse::<i64>().unwrap());
    let (h, m, s) = (
        parts.next().unwrap(),
        parts.next().unwrap(),
        parts.next().unwrap(),
    );
    Duration::days(days.parse().unwrap())
        + Duration::hours(h)
        + Duration::minutes(m)
        + Duration::seconds(s)
}

#[test]
fn empty_ladder_selects_nothing() {
    let now = fixed_now();
    for spec in ["0:00:00", "1.0:00:00", "400.0:00:00"] {
        assert_eq!(get_strata_at(&[], now - age(spec), now), None);
    }
    assert_eq!(get_strata(&[], Utc::now()), None);
}

#[test]
fn unconditional_tier_always_matches() {
    let now = fixed_now();
    let ladder = [Strata::new(Granularity::Month)];
    for spec in ["0:00:00", "0:01:00", "1.0:00:00", "31.0:00:00", "365.0:00:00"] {
        assert_eq!(
            get_strata_at(&ladder, now - age(spec), now),
            Some(Strata::new(Granularity::Month)),
            "age {spec}"
        );
    }
}

#[test]
fn thresholded_tier_waits_for_age() {
    let now = fixed_now();
    let tier = Strata::after(Granularity::Month, Granularity::Month);
    let ladder = [tier];

    for spec in ["0:00:00", "0:00:59", "0:59:00", "1.0:00:00", "30.23:59:59"] {
        assert_eq!(get_strata_at(&ladder, now - age(spec), now), None, "age {spec}");
    }
    for spec in ["31.0:00:00", "365.0:00:00"] {
        assert_eq!(get_strata_at(&ladder, now - age(spec), now), Some(tier), "age {spec}");
    }
}

#[test]
fn two_level_ladder_climbs_by_age() {
    let now = fixed_now();
    let daily = Strata::new(Granularity::Day);
    let monthly = Strata::after(Granularity::Month, Granularity::Month);
    let ladder = [daily, monthly];

    for spec in ["0:00:00", "0:30:00", "12:00:00", "1.0:00:00"] {
        assert_eq!(get_strata_at(&ladder, now - age(spec), now), Some(daily), "age {spec}");
    }
    for spec in ["31.0:00:00", "200.0:00:00", "365.0:00:00"] {
        assert_eq!(get_strata_at(&ladder, now - age(spec), now), Some(monthly), "age {spec}");
    }
}

#[test]
fn declaration_order_is_respected() {
    let now = fixed_now();
    let monthly = Strata::after(Granularity::Month, Granularity::Month);
    let daily = Strata::new(Granularity::Day);

    // The last applicable tier wins, so the later unconditional tier shadows
    // the monthly one at every age.
    let ladder = [monthly, daily];
    for spec in ["0:00:00", "2:00:00", "1.0:00:00", "40.0:00:00", "400.0:00:00"] {
        assert_eq!(get_strata_at(&ladder, now - age(spec), now), Some(daily), "age {spec}");
    }
}

#[test]
fn unconditional_tier_after_thresholded_one_still_matches() {
    let now = fixed_now();
    let hourly = Strata::after(Granularity::Hour, Granularity::Day);
    let monthly = Strata::after(Granularity::Month, Granularity::Month);
    let daily = Strata::new(Granularity::Day);
    let ladder = [hourly, monthly, daily];

    assert_eq!(get_strata_at(&ladder, now - Duration::hours(2), now), Some(daily));
    assert_eq!(get_strata_at(&ladder, now - Duration::days(40), now), Some(daily));

    // A thresholded tier that does not apply is skipped, not a stop.
    let ladder = [hourly, monthly, Strata::after(Granularity::Year, Granularity::Day)];
    assert_eq!(get_strata_at(&ladder, now - Duration::hours(2), now), None);
    assert_eq!(
        get_strata_at(&ladder, now - Duration::days(2), now),
        Some(Strata::after(Granularity::Year, Granularity::Day))
    );
    assert_eq!(
        get_strata_at(&[monthly, hourly], now - Duration::days(2), now),
        Some(hourly)
    );
}

#[test]
fn age_boundaries_are_inclusive_lower() {
    let now = fixed_now();
    let table = [
        ("0:00:59", Granularity::None),
        ("0:01:00", Granularity::Minute),
        ("0:59:59", Granularity::Minute),
        ("1:00:00", Granularity::Hour),
        ("23:59:59", Granularity::Hour),
        ("1.0:00:00", Granularity::Day),
        ("30.23:59:59", Granularity::Day),
        ("31.0:00:00", Granularity::Month),
        ("364.23:59:59", Granularity::Month),
        ("365.0:00:00", Granularity::Year),
    ];
    for (spec, expected) in table {
        assert_eq!(get_age_at(now - age(spec), now), expected, "age {spec}");
    }
}

proptest! {
    #[test]
    fn age_is_monotonic_in_elapsed_time(a in 0i64..1_000_000_000, b in 0i64..1_000_000_000) {
        let now = fixed_now();
        let (short, long) = if a <= b { (a, b) } else { (b, a) };
        let younger = get_age_at(now - Duration::seconds(short), now);
        let older = get_age_at(now - Duration::seconds(long), now);
        prop_assert!(younger <= older);
    }

    #[test]
    fn selection_is_the_last_applicable_tier(
        thresholds in proptest::collection::vec(proptest::option::of(0usize..6), 0..6),
        secs in 0i64..100_000_000,
    ) {
        const LEVELS: [Granularity; 6] = [
            Granularity::None,
            Granularity::Minute,
            Granularity::Hour,
            Granularity::Day,
            Granularity::Month,
            Granularity::Year,
        ];
        let now = fixed_now();
        let ladder: Vec<Strata> = thresholds
            .iter()
            .enumerate()
            .map(|(i, threshold)| Strata {
                compress_per: LEVELS[i % LEVELS.len()],
                compress_after: threshold.map(|t| LEVELS[t]),
            })
            .collect();
        let timestamp = now - Duration::seconds(secs);
        let age = get_age_at(timestamp, now);
        let expected = ladder.iter().rev().find(|s| s.applies_to(age)).copied();
        prop_assert_eq!(get_strata_at(&ladder, timestamp, now), expected);
    }

    #[test]
    fn future_timestamps_have_no_age(secs in 1i64..1_000_000_000) {
        let now = fixed_now();
        prop_assert_eq!(get_age_at(now + Duration::seconds(secs), now), Granularity::None);
    }
}

//! Property tests for alignment and feature invariants.
//!
//! Uses proptest to verify:
//! 1. No look-ahead — values published after the cutoff never reach the row
//! 2. Revision resolution — the latest qualifying publication wins
//! 3. Feature idempotence — rebuilding from the same history gives the same vector

use chrono::{Duration, NaiveDateTime};
use proptest::prelude::*;
use qforecast_core::domain::{FiscalQuarter, RawObservation};
use qforecast_core::{
    align_quarter, align_ticker, build_features, AlignmentPolicy, FeatureDef, FeatureSet,
    ObservationSnapshot, SeriesKind, SeriesSpec,
};

// ── Strategies (proptest) ────────────────────────────────────────────

fn base() -> NaiveDateTime {
    "2022Q1".parse::<FiscalQuarter>().unwrap().start_instant()
}

/// (timestamp offset days, publication delay days, value)
fn arb_observation() -> impl Strategy<Value = (i64, i64, f64)> {
    (0i64..730, 0i64..200, -1000.0..1000.0_f64)
}

fn to_obs(series: &str, (t, delay, v): (i64, i64, f64)) -> RawObservation {
    let timestamp = base() + Duration::days(t);
    RawObservation {
        source: "prop".into(),
        series_id: series.into(),
        timestamp,
        value: v,
        publication_timestamp: timestamp + Duration::days(delay),
    }
}

fn spec() -> Vec<SeriesSpec> {
    vec![SeriesSpec::new("x", "x", SeriesKind::Periodic)]
}

fn arb_quarter() -> impl Strategy<Value = FiscalQuarter> {
    (0i32..8).prop_map(|i| "2022Q1".parse::<FiscalQuarter>().unwrap().offset(i))
}

// ── 1. No look-ahead ─────────────────────────────────────────────────

proptest! {
    /// The aligned value, when present, comes from an observation published at
    /// or before the cutoff and observed no later than quarter end.
    #[test]
    fn aligned_value_was_knowable(
        raw in prop::collection::vec(arb_observation(), 1..40),
        quarter in arb_quarter(),
        lag in 0u32..60,
    ) {
        let observations: Vec<RawObservation> = raw.into_iter().map(|o| to_obs("x", o)).collect();
        let snapshot = ObservationSnapshot::from_observations(observations.clone());
        let policy = AlignmentPolicy { issue_lag_days: lag };
        let cutoff = policy.cutoff(quarter);

        let row = align_quarter(&snapshot, "T", quarter, &spec(), &policy).unwrap();
        match row.get("x") {
            Some(v) => {
                let witness = observations.iter().any(|o| {
                    o.value == v
                        && o.publication_timestamp <= cutoff
                        && o.timestamp <= quarter.end_instant()
                });
                prop_assert!(witness);
            }
            None => {
                let any_qualifying = observations.iter().any(|o| {
                    o.publication_timestamp <= cutoff && o.timestamp <= quarter.end_instant()
                });
                prop_assert!(!any_qualifying);
            }
        }
    }

    /// Adding observations published after the cutoff never changes the row.
    #[test]
    fn late_publications_are_invisible(
        raw in prop::collection::vec(arb_observation(), 1..30),
        late in prop::collection::vec((0i64..730, -1000.0..1000.0_f64), 1..10),
        quarter in arb_quarter(),
    ) {
        let policy = AlignmentPolicy::default();
        let cutoff = policy.cutoff(quarter);
        let observations: Vec<RawObservation> = raw.into_iter().map(|o| to_obs("x", o)).collect();
        let before = ObservationSnapshot::from_observations(observations.clone());

        let mut extended = observations;
        for (t, v) in late {
            let timestamp = base() + Duration::days(t);
            let published = timestamp.max(cutoff) + Duration::seconds(1);
            extended.push(RawObservation {
                source: "late".into(),
                series_id: "x".into(),
                timestamp,
                value: v,
                publication_timestamp: published,
            });
        }
        let after = ObservationSnapshot::from_observations(extended);

        let a = align_quarter(&before, "T", quarter, &spec(), &policy).unwrap();
        let b = align_quarter(&after, "T", quarter, &spec(), &policy).unwrap();
        prop_assert_eq!(a, b);
    }
}

// ── 2. Revision resolution ───────────────────────────────────────────

proptest! {
    /// With several publications of one timestamp, the latest one at or before
    /// the cutoff is used.
    #[test]
    fn latest_qualifying_revision_wins(delays in prop::collection::btree_set(0i64..300, 1..8)) {
        let quarter: FiscalQuarter = "2023Q2".parse().unwrap();
        let policy = AlignmentPolicy::default();
        let cutoff = policy.cutoff(quarter);
        let timestamp = quarter.start_instant();

        let observations: Vec<RawObservation> = delays
            .iter()
            .map(|&d| RawObservation {
                source: "rev".into(),
                series_id: "x".into(),
                timestamp,
                value: d as f64,
                publication_timestamp: timestamp + Duration::days(d),
            })
            .collect();
        let snapshot = ObservationSnapshot::from_observations(observations.clone());
        let row = align_quarter(&snapshot, "T", quarter, &spec(), &policy).unwrap();

        let expected = observations
            .iter()
            .filter(|o| o.publication_timestamp <= cutoff)
            .map(|o| o.value)
            .last();
        prop_assert_eq!(row.get("x"), expected);
    }
}

// ── 3. Feature idempotence ───────────────────────────────────────────

proptest! {
    #[test]
    fn feature_rebuild_is_idempotent(raw in prop::collection::vec(arb_observation(), 1..40)) {
        let observations: Vec<RawObservation> = raw
            .into_iter()
            .map(|(t, d, v)| to_obs("x", (t, d, v.abs() + 1.0)))
            .collect();
        let snapshot = ObservationSnapshot::from_observations(observations);
        let quarters = FiscalQuarter::range("2022Q1".parse().unwrap(), "2023Q4".parse().unwrap());
        let history = align_ticker(&snapshot, "T", &quarters, &spec(), &AlignmentPolicy::default());
        let set = FeatureSet::new(
            "prop",
            vec![
                FeatureDef::Level { name: "x".into(), slot: "x".into(), lag: 0 },
                FeatureDef::PctChange { name: "dx".into(), slot: "x".into(), periods: 1 },
                FeatureDef::Volatility { name: "vol".into(), slot: "x".into(), window: 3 },
            ],
        )
        .unwrap();

        for quarter in history.quarters() {
            let a = build_features(&history, quarter, &set).unwrap();
            let b = build_features(&history, quarter, &set).unwrap();
            prop_assert_eq!(a, b);
        }
    }
}

//! Property tests for the stacker and the evaluation metrics.

use std::collections::BTreeMap;

use proptest::prelude::*;

use qforecast_core::domain::{ModelVersion, QuarterKey};
use qforecast_core::model::ModelFamily;
use qforecast_runner::metrics::{directional_accuracy, mape};
use qforecast_runner::{BlendPolicy, MemberRef, OofRow, ScoredRow, Stacker};

const FAMILIES: [ModelFamily; 3] = [
    ModelFamily::TreeEnsemble,
    ModelFamily::Sequence,
    ModelFamily::Attention,
];

fn members(n: usize) -> Vec<MemberRef> {
    FAMILIES[..n]
        .iter()
        .map(|f| MemberRef {
            family: *f,
            version: ModelVersion(format!("{f}-v1")),
        })
        .collect()
}

fn arb_rows(n_members: usize) -> impl Strategy<Value = Vec<OofRow>> {
    prop::collection::vec(
        (
            50.0..150.0_f64,
            -0.2..0.2_f64,
            prop::collection::vec(-0.2..0.2_f64, n_members),
        ),
        0..30,
    )
    .prop_map(move |rows| {
        rows.into_iter()
            .enumerate()
            .map(|(i, (previous, actual_ret, member_rets))| OofRow {
                key: QuarterKey::new(format!("T{i}"), "2020Q1".parse().unwrap()),
                previous_actual: previous,
                actual: previous * (1.0 + actual_ret),
                members: FAMILIES[..n_members]
                    .iter()
                    .zip(member_rets)
                    .map(|(f, r)| (*f, previous * (1.0 + r)))
                    .collect::<BTreeMap<_, _>>(),
            })
            .collect()
    })
}

// ── 1. Linear blends ────────────────────────────────────────────────

proptest! {
    #[test]
    fn linear_weights_sum_to_one(
        (n, rows) in (2usize..=3).prop_flat_map(|n| (Just(n), arb_rows(n))),
        non_negative in any::<bool>(),
    ) {
        let policy = BlendPolicy::Linear { non_negative, ridge: 0.0 };
        let weights = Stacker::fit(&policy, members(n), &rows).unwrap();
        let w = weights.weights().unwrap();
        prop_assert_eq!(w.len(), n);
        let total: f64 = w.values().sum();
        prop_assert!((total - 1.0).abs() < 1e-6, "weights sum to {}", total);
        if non_negative {
            prop_assert!(w.values().all(|v| *v >= -1e-9));
        }
    }

    #[test]
    fn ensemble_version_is_deterministic(rows in arb_rows(2)) {
        let policy = BlendPolicy::default();
        let a = Stacker::fit(&policy, members(2), &rows).unwrap();
        let b = Stacker::fit(&policy, members(2), &rows).unwrap();
        prop_assert_eq!(a.version, b.version);
    }
}

// ── 2. Metric denominators ──────────────────────────────────────────

fn arb_scored() -> impl Strategy<Value = Vec<ScoredRow>> {
    prop::collection::vec(
        (
            1.0..200.0_f64,
            prop_oneof![Just(0.0), 1.0..200.0_f64],
            prop::option::of(1.0..200.0_f64),
        ),
        0..40,
    )
    .prop_map(|rows| {
        rows.into_iter()
            .map(|(predicted, actual, previous_actual)| ScoredRow {
                key: QuarterKey::new("7203.T", "2023Q1".parse().unwrap()),
                predicted,
                actual,
                previous_actual,
            })
            .collect()
    })
}

proptest! {
    #[test]
    fn mape_skips_zero_actuals(rows in arb_scored()) {
        let (value, count) = mape(&rows);
        prop_assert_eq!(count, rows.iter().filter(|r| r.actual != 0.0).count());
        prop_assert_eq!(value.is_some(), count > 0);
        if let Some(v) = value {
            prop_assert!(v >= 0.0);
        }
    }

    #[test]
    fn direction_counts_rows_with_previous_actual(rows in arb_scored()) {
        let (value, count) = directional_accuracy(&rows);
        prop_assert_eq!(count, rows.iter().filter(|r| r.previous_actual.is_some()).count());
        if let Some(v) = value {
            prop_assert!((0.0..=1.0).contains(&v));
        }
    }
}

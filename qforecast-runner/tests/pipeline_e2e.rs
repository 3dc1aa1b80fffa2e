//! End-to-end retraining runs on synthetic prices: promotion, blocked
//! promotion with the prior release still serving, and rollback.

use chrono::NaiveDateTime;
use qforecast_core::domain::FiscalQuarter;
use qforecast_runner::synthetic::synthetic_snapshot;
use qforecast_runner::{Pipeline, PipelineConfig, PromotionDecision, StoreError, Subject};

const CONFIG: &str = r#"
first_quarter = "2018Q1"

[[universe]]
symbol = "7203.T"
sector = "Automobiles"
market = "TSE"

[[universe]]
symbol = "6758.T"
sector = "Electronics"
market = "TSE"

[[series]]
name = "close"
series_id = "price:{ticker}"
required = true
kind = { type = "daily" }

[features]
label = "e2e-v1"

[[features.defs]]
kind = "level"
name = "px"
slot = "close"
lag = 0

[[features.defs]]
kind = "pct_change"
name = "ret1"
slot = "close"
periods = 1

[[features.defs]]
kind = "moving_average_ratio"
name = "ma2"
slot = "close"
window = 2

[[models]]
family = "tree_ensemble"
n_estimators = 20
max_depth = 2

[[models]]
family = "sequence"
hidden_size = 8
sequence_length = 2

[walk_forward]
max_folds = 4

[promotion]
max_mape = 0.5
min_directional_accuracy = 0.0
min_samples = 2
"#;

fn config() -> PipelineConfig {
    PipelineConfig::from_toml(CONFIG).unwrap()
}

fn strict_config() -> PipelineConfig {
    PipelineConfig::from_toml(&CONFIG.replace("max_mape = 0.5", "max_mape = 0.000001")).unwrap()
}

fn at(s: &str) -> NaiveDateTime {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
}

fn q(s: &str) -> FiscalQuarter {
    s.parse().unwrap()
}

#[test]
fn retraining_promotes_and_serves_next_quarter() {
    let dir = tempfile::tempdir().unwrap();
    let config = config();
    let pipeline = Pipeline::open(config.clone(), dir.path()).unwrap();
    let snapshot = synthetic_snapshot(&config, 20);
    let now = at("2023-01-15 00:00:00");

    let summary = pipeline.run_retraining(&snapshot, now).unwrap();
    assert_eq!(summary.folds, 4);
    assert_eq!(summary.members.len(), 2);
    assert!(summary.failures.is_empty());
    let release = match &summary.decision {
        PromotionDecision::Promoted { release } => release.clone(),
        other => panic!("expected promotion, got {other:?}"),
    };
    assert_eq!(release.version, summary.ensemble);

    // One forecast per ticker, for the quarter after the last closed one.
    assert_eq!(summary.predictions.len(), 2);
    for p in &summary.predictions {
        assert_eq!(p.key.quarter(), q("2023Q1"));
        assert_eq!(p.ensemble_version, release.version);
        assert!(p.interval.lower <= p.point_estimate && p.point_estimate <= p.interval.upper);
        assert_eq!(p.members.len(), 2);
    }

    let served = pipeline.store().latest("7203.T", now).unwrap();
    assert_eq!(served.prediction.key.quarter(), q("2023Q1"));
    assert!(!served.stale);
    let later = pipeline.store().latest("7203.T", at("2023-04-02 00:00:00")).unwrap();
    assert!(later.stale);

    let reports = pipeline.reports().read_all().unwrap();
    assert!(reports
        .iter()
        .any(|r| r.subject == Subject::Ensemble && r.is_aggregate()));
    let promotions = pipeline.promotions().unwrap();
    assert_eq!(promotions.len(), 1);
    assert!(promotions[0].passed);
}

#[test]
fn blocked_candidate_leaves_prior_release_serving() {
    let dir = tempfile::tempdir().unwrap();
    let lenient = config();
    let first = Pipeline::open(lenient.clone(), dir.path())
        .unwrap()
        .run_retraining(&synthetic_snapshot(&lenient, 20), at("2023-01-15 00:00:00"))
        .unwrap();
    let PromotionDecision::Promoted { release } = first.decision else {
        panic!("first run should promote");
    };

    let strict = Pipeline::open(strict_config(), dir.path()).unwrap();
    let now = at("2023-07-15 00:00:00");
    let second = strict
        .run_retraining(&synthetic_snapshot(&lenient, 22), now)
        .unwrap();
    match &second.decision {
        PromotionDecision::Blocked {
            candidate,
            reasons,
            serving,
        } => {
            assert_ne!(candidate, &release.version);
            assert!(!reasons.is_empty());
            assert_eq!(serving.as_ref(), Some(&release.version));
        }
        other => panic!("expected blocked promotion, got {other:?}"),
    }
    assert_eq!(
        strict.store().current_release().map(|r| r.version),
        Some(release.version.clone())
    );

    // The prior release forecasts the new latest quarter.
    assert_eq!(second.predictions.len(), 2);
    let served = strict.store().latest("6758.T", now).unwrap();
    assert_eq!(served.prediction.ensemble_version, release.version);
    assert_eq!(served.prediction.key.quarter(), q("2023Q3"));

    let promotions = strict.promotions().unwrap();
    assert_eq!(promotions.len(), 2);
    assert!(!promotions[1].passed);
}

#[test]
fn rollback_restores_previous_release() {
    let dir = tempfile::tempdir().unwrap();
    let config = config();
    let pipeline = Pipeline::open(config.clone(), dir.path()).unwrap();
    assert!(matches!(
        pipeline.store().rollback(at("2023-01-01 00:00:00")),
        Err(StoreError::NoPreviousRelease)
    ));

    let first = pipeline
        .run_retraining(&synthetic_snapshot(&config, 20), at("2023-01-15 00:00:00"))
        .unwrap();
    let second = pipeline
        .run_retraining(&synthetic_snapshot(&config, 22), at("2023-07-15 00:00:00"))
        .unwrap();
    assert!(matches!(second.decision, PromotionDecision::Promoted { .. }));
    assert_ne!(first.ensemble, second.ensemble);

    let now = at("2023-07-20 00:00:00");
    let restored = pipeline.store().rollback(now).unwrap();
    assert_eq!(restored.version, first.ensemble);

    let served = pipeline.store().latest("7203.T", now).unwrap();
    assert_eq!(served.prediction.ensemble_version, first.ensemble);
    assert!(served.stale);

    // The rollback survives a restart.
    let reopened = Pipeline::open(config, dir.path()).unwrap();
    assert_eq!(
        reopened.store().current_release().map(|r| r.version),
        Some(first.ensemble)
    );
}

#[test]
fn evaluate_records_reports_without_promoting() {
    let dir = tempfile::tempdir().unwrap();
    let config = config();
    let pipeline = Pipeline::open(config.clone(), dir.path()).unwrap();
    let summary = pipeline
        .evaluate(&synthetic_snapshot(&config, 20), at("2023-01-15 00:00:00"))
        .unwrap();
    assert!(summary.gate.is_ok());
    assert!(summary.outcome.aggregate(Subject::Ensemble).is_some());
    assert!(pipeline.store().current_release().is_none());
    assert_eq!(
        pipeline.reports().read_all().unwrap().len(),
        summary.outcome.all_reports().len()
    );
}

#[test]
fn nothing_closed_yet_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let config = config();
    let pipeline = Pipeline::open(config.clone(), dir.path()).unwrap();
    assert!(pipeline
        .run_retraining(&synthetic_snapshot(&config, 4), at("2018-02-01 00:00:00"))
        .is_err());
}

//! Evaluation reports — per-fold and aggregate accuracy for one subject
//! (a base-model family or the ensemble), persisted as JSONL.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use qforecast_core::domain::FiscalQuarter;
use qforecast_core::model::{ModelFamily, TrainingWindow};

use crate::journal::Journal;
use crate::metrics::{ForecastMetrics, ScoredRow};

/// What was evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "family", rename_all = "snake_case")]
pub enum Subject {
    Model(ModelFamily),
    Ensemble,
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Model(family) => write!(f, "{family}"),
            Self::Ensemble => f.write_str("ensemble"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum ReportScope {
    Fold { index: usize },
    Aggregate { folds: usize },
}

/// Train/test quarters a report covers. Test quarters are forecast origins; the
/// quarters actually scored are the ones after them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FoldWindow {
    /// `None` on aggregate reports.
    pub train: Option<TrainingWindow>,
    pub test_first: FiscalQuarter,
    pub test_last: FiscalQuarter,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub subject: Subject,
    /// Model or ensemble version evaluated (a digest of fold versions on
    /// aggregates).
    pub version: String,
    #[serde(flatten)]
    pub scope: ReportScope,
    pub window: FoldWindow,
    pub mape: Option<f64>,
    pub directional_accuracy: Option<f64>,
    pub sample_count: usize,
    pub mape_count: usize,
    pub directional_count: usize,
    pub residual_band: Option<f64>,
    pub generated_at: NaiveDateTime,
}

impl EvaluationReport {
    pub fn for_fold(
        subject: Subject,
        version: impl Into<String>,
        index: usize,
        window: FoldWindow,
        rows: &[ScoredRow],
        generated_at: NaiveDateTime,
    ) -> Self {
        let m = ForecastMetrics::compute(rows);
        Self {
            subject,
            version: version.into(),
            scope: ReportScope::Fold { index },
            window,
            mape: m.mape,
            directional_accuracy: m.directional_accuracy,
            sample_count: m.sample_count,
            mape_count: m.mape_count,
            directional_count: m.directional_count,
            residual_band: m.residual_band,
            generated_at,
        }
    }

    /// Sample-weighted roll-up of fold reports for one subject. Each metric is
    /// weighted by the rows that defined it. `None` when `folds` is empty.
    pub fn aggregate(folds: &[EvaluationReport], generated_at: NaiveDateTime) -> Option<Self> {
        let first = folds.first()?;
        let last = folds.last()?;

        let weighted = |value: fn(&EvaluationReport) -> Option<f64>, weight: fn(&EvaluationReport) -> usize| {
            let (sum, n) = folds
                .iter()
                .filter_map(|r| value(r).map(|v| (v * weight(r) as f64, weight(r))))
                .fold((0.0, 0usize), |(s, n), (v, w)| (s + v, n + w));
            (n > 0).then(|| sum / n as f64)
        };

        let versions: Vec<&str> = folds.iter().map(|r| r.version.as_str()).collect();
        Some(Self {
            subject: first.subject,
            version: blake3::hash(versions.join(",").as_bytes()).to_hex()[..16].to_string(),
            scope: ReportScope::Aggregate { folds: folds.len() },
            window: FoldWindow {
                train: None,
                test_first: first.window.test_first,
                test_last: last.window.test_last,
            },
            mape: weighted(|r| r.mape, |r| r.mape_count),
            directional_accuracy: weighted(|r| r.directional_accuracy, |r| r.directional_count),
            sample_count: folds.iter().map(|r| r.sample_count).sum(),
            mape_count: folds.iter().map(|r| r.mape_count).sum(),
            directional_count: folds.iter().map(|r| r.directional_count).sum(),
            residual_band: weighted(|r| r.residual_band, |r| r.sample_count),
            generated_at,
        })
    }

    pub fn is_aggregate(&self) -> bool {
        matches!(self.scope, ReportScope::Aggregate { .. })
    }
}

impl fmt::Display for EvaluationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pct = |v: Option<f64>| v.map_or("n/a".to_string(), |v| format!("{:.2}%", v * 100.0));
        let scope = match self.scope {
            ReportScope::Fold { index } => format!("fold {index}"),
            ReportScope::Aggregate { folds } => format!("{folds} folds"),
        };
        write!(
            f,
            "{:<14} {:<10} {}..={}  MAPE {:>7}  DA {:>7}  n={}",
            self.subject.to_string(),
            scope,
            self.window.test_first,
            self.window.test_last,
            pct(self.mape),
            pct(self.directional_accuracy),
            self.sample_count
        )
    }
}

// ─── Persistence ─────────────────────────────────────────────────────

/// Append-only report history.
#[derive(Debug, Clone)]
pub struct ReportLog {
    journal: Journal<EvaluationReport>,
}

impl ReportLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            journal: Journal::new(path),
        }
    }

    pub fn path(&self) -> &Path {
        self.journal.path()
    }

    pub fn append_all(&self, reports: &[EvaluationReport]) -> io::Result<()> {
        self.journal.append_all(reports)
    }

    pub fn read_all(&self) -> io::Result<Vec<EvaluationReport>> {
        self.journal.read_all()
    }

    /// Most recent aggregate report for `subject`.
    pub fn latest_aggregate(&self, subject: Subject) -> io::Result<Option<EvaluationReport>> {
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|r| r.subject == subject && r.is_aggregate())
            .max_by_key(|r| r.generated_at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qforecast_core::domain::QuarterKey;

    fn q(s: &str) -> FiscalQuarter {
        s.parse().unwrap()
    }

    fn row(predicted: f64, actual: f64) -> ScoredRow {
        ScoredRow {
            key: QuarterKey::new("7203.T", q("2023Q1")),
            predicted,
            actual,
            previous_actual: Some(95.0),
        }
    }

    fn window(first: &str, last: &str) -> FoldWindow {
        FoldWindow {
            train: Some(TrainingWindow::new(q("2015Q1"), q(first).prev())),
            test_first: q(first),
            test_last: q(last),
        }
    }

    #[test]
    fn fold_report_scenario() {
        let rows = vec![row(102.0, 100.0), row(103.0, 105.0), row(100.0, 98.0)];
        let report = EvaluationReport::for_fold(
            Subject::Ensemble,
            "e1",
            0,
            window("2023Q1", "2023Q1"),
            &rows,
            NaiveDateTime::default(),
        );
        assert!((report.mape.unwrap() - 0.019604).abs() < 1e-5);
        assert_eq!(report.directional_count, 3);
        // Every move is up from 95 and every prediction is above 95.
        assert_eq!(report.directional_accuracy, Some(1.0));
    }

    #[test]
    fn aggregate_is_sample_weighted() {
        let a = EvaluationReport::for_fold(
            Subject::Model(ModelFamily::TreeEnsemble),
            "m1",
            0,
            window("2022Q1", "2022Q1"),
            &[row(110.0, 100.0)],
            NaiveDateTime::default(),
        );
        let b = EvaluationReport::for_fold(
            Subject::Model(ModelFamily::TreeEnsemble),
            "m2",
            1,
            window("2022Q2", "2022Q2"),
            &[row(100.0, 100.0), row(100.0, 100.0), row(100.0, 100.0)],
            NaiveDateTime::default(),
        );
        let agg = EvaluationReport::aggregate(&[a, b], NaiveDateTime::default()).unwrap();
        assert_eq!(agg.sample_count, 4);
        assert!((agg.mape.unwrap() - 0.025).abs() < 1e-12);
        assert_eq!(agg.scope, ReportScope::Aggregate { folds: 2 });
        assert_eq!(agg.window.test_first, q("2022Q1"));
        assert_eq!(agg.window.test_last, q("2022Q2"));
        assert!(EvaluationReport::aggregate(&[], NaiveDateTime::default()).is_none());
    }

    #[test]
    fn report_log_returns_latest_aggregate() {
        let dir = tempfile::tempdir().unwrap();
        let log = ReportLog::new(dir.path().join("reports.jsonl"));
        let fold = EvaluationReport::for_fold(
            Subject::Ensemble,
            "e1",
            0,
            window("2022Q1", "2022Q1"),
            &[row(101.0, 100.0)],
            NaiveDateTime::default(),
        );
        let agg = EvaluationReport::aggregate(std::slice::from_ref(&fold), NaiveDateTime::default())
            .unwrap();
        log.append_all(&[fold, agg.clone()]).unwrap();
        assert_eq!(log.latest_aggregate(Subject::Ensemble).unwrap(), Some(agg));
        assert_eq!(
            log.latest_aggregate(Subject::Model(ModelFamily::Sequence)).unwrap(),
            None
        );
    }
}

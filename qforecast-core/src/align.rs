//! Series Aligner — point-in-time resampling onto the quarterly grid.
//!
//! For each (ticker, quarter) the aligner looks at the snapshot *as it was known at
//! the quarter's decision cutoff*: an observation qualifies only when it was
//! published at or before the cutoff and observed no later than the quarter end.
//! Revisions of the same timestamp resolve to the latest qualifying publication.
//!
//! Missing slots stay `None`. Nothing is forward-filled, zeroed or interpolated
//! here; the only explicit fallback (zero policy events) lives in the feature layer.

use std::collections::BTreeMap;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::domain::{FiscalQuarter, QuarterKey, RawObservation};
use crate::log::ObservationSnapshot;

/// Placeholder substituted with the ticker symbol in per-ticker series ids.
pub const TICKER_PLACEHOLDER: &str = "{ticker}";

/// Suffix of the event-count slot derived from a policy-event series.
pub const EVENT_COUNT_SUFFIX: &str = "_events";

// ─── Series specifications ───────────────────────────────────────────

/// How daily series (prices) collapse to one quarterly value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DailyAggregation {
    /// Last qualifying observation at or before quarter end.
    #[default]
    QuarterEndClose,
    /// Mean of qualifying observations inside the quarter.
    QuarterAverage,
}

/// Frequency class of a series, which decides its aggregation rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SeriesKind {
    Daily {
        #[serde(default)]
        aggregation: DailyAggregation,
    },
    /// Monthly/quarterly releases (fundamentals, macro): most recent qualifying value.
    Periodic,
    /// Irregular announcements: most recent state plus an in-quarter event count.
    PolicyEvent,
}

/// One input series as it appears on the aligned grid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesSpec {
    /// Slot name on the aligned row.
    pub name: String,
    /// Series id in the observation log; may contain `{ticker}`.
    pub series_id: String,
    pub kind: SeriesKind,
    /// Required series raise `DataGap` when they have no history before the cutoff.
    #[serde(default)]
    pub required: bool,
}

impl SeriesSpec {
    pub fn new(name: &str, series_id: &str, kind: SeriesKind) -> Self {
        Self {
            name: name.to_string(),
            series_id: series_id.to_string(),
            kind,
            required: false,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Concrete series id for a ticker.
    pub fn resolve(&self, ticker: &str) -> String {
        self.series_id.replace(TICKER_PLACEHOLDER, ticker)
    }

    /// Slot names this spec contributes to an aligned row.
    pub fn slot_names(&self) -> Vec<String> {
        match self.kind {
            SeriesKind::PolicyEvent => vec![
                self.name.clone(),
                format!("{}{}", self.name, EVENT_COUNT_SUFFIX),
            ],
            _ => vec![self.name.clone()],
        }
    }
}

/// Cutoff policy shared by every row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlignmentPolicy {
    /// Days after quarter end at which the forecast is issued.
    #[serde(default)]
    pub issue_lag_days: u32,
}

impl AlignmentPolicy {
    pub fn cutoff(&self, quarter: FiscalQuarter) -> NaiveDateTime {
        quarter.decision_cutoff(self.issue_lag_days)
    }
}

// ─── Errors ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AlignError {
    #[error("data gap: required series '{series_id}' has no history for {ticker} {quarter} before cutoff {cutoff}")]
    DataGap {
        series_id: String,
        ticker: String,
        quarter: FiscalQuarter,
        cutoff: NaiveDateTime,
    },

    #[error("slot '{0}' is produced by more than one series spec")]
    DuplicateSlot(String),
}

// ─── Aligned output ──────────────────────────────────────────────────

/// One (ticker, quarter) row of aligned values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignedRow {
    pub key: QuarterKey,
    pub quarter: FiscalQuarter,
    pub cutoff: NaiveDateTime,
    pub values: BTreeMap<String, Option<f64>>,
}

impl AlignedRow {
    /// Value of a slot; `None` when missing or unknown.
    pub fn get(&self, slot: &str) -> Option<f64> {
        self.values.get(slot).copied().flatten()
    }

    pub fn missing_slots(&self) -> impl Iterator<Item = &str> {
        self.values
            .iter()
            .filter(|(_, v)| v.is_none())
            .map(|(k, _)| k.as_str())
    }
}

/// Aligned rows of one ticker, ascending by quarter, plus the quarters that failed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlignedHistory {
    pub ticker: String,
    pub rows: Vec<AlignedRow>,
    #[serde(skip)]
    pub gaps: Vec<AlignError>,
}

impl AlignedHistory {
    pub fn row(&self, quarter: FiscalQuarter) -> Option<&AlignedRow> {
        self.rows
            .binary_search_by(|r| r.quarter.cmp(&quarter))
            .ok()
            .map(|i| &self.rows[i])
    }

    /// Rows with quarter ≤ `quarter`.
    pub fn rows_through(&self, quarter: FiscalQuarter) -> &[AlignedRow] {
        let end = self.rows.partition_point(|r| r.quarter <= quarter);
        &self.rows[..end]
    }

    pub fn quarters(&self) -> impl Iterator<Item = FiscalQuarter> + '_ {
        self.rows.iter().map(|r| r.quarter)
    }
}

/// Reject spec sets where two series write the same slot.
pub fn validate_specs(specs: &[SeriesSpec]) -> Result<(), AlignError> {
    let mut seen = std::collections::BTreeSet::new();
    for slot in specs.iter().flat_map(|s| s.slot_names()) {
        if !seen.insert(slot.clone()) {
            return Err(AlignError::DuplicateSlot(slot));
        }
    }
    Ok(())
}

// ─── Alignment ───────────────────────────────────────────────────────

/// Observations of a series knowable at `cutoff` and observed by `quarter_end`,
/// one per timestamp (latest qualifying publication), oldest first.
fn qualifying<'a>(
    rows: &'a [RawObservation],
    cutoff: NaiveDateTime,
    quarter_end: NaiveDateTime,
) -> Vec<&'a RawObservation> {
    let mut out: Vec<&RawObservation> = Vec::new();
    for r in rows {
        if r.timestamp > quarter_end {
            break;
        }
        if !r.known_at(cutoff) {
            continue;
        }
        // Rows are sorted by (timestamp, publication): a later qualifying
        // publication of the same timestamp replaces the earlier one.
        match out.last_mut() {
            Some(last) if last.timestamp == r.timestamp => *last = r,
            _ => out.push(r),
        }
    }
    out
}

/// Align one (ticker, quarter) row.
pub fn align_quarter(
    snapshot: &ObservationSnapshot,
    ticker: &str,
    quarter: FiscalQuarter,
    specs: &[SeriesSpec],
    policy: &AlignmentPolicy,
) -> Result<AlignedRow, AlignError> {
    let cutoff = policy.cutoff(quarter);
    let quarter_start = quarter.start_instant();
    let quarter_end = quarter.end_instant();
    let mut values = BTreeMap::new();

    for spec in specs {
        let series_id = spec.resolve(ticker);
        let obs = qualifying(snapshot.series(&series_id), cutoff, quarter_end);

        if obs.is_empty() && spec.required {
            return Err(AlignError::DataGap {
                series_id,
                ticker: ticker.to_string(),
                quarter,
                cutoff,
            });
        }

        let in_quarter: Vec<&RawObservation> = obs
            .iter()
            .copied()
            .filter(|o| o.timestamp >= quarter_start)
            .collect();

        match spec.kind {
            SeriesKind::Daily {
                aggregation: DailyAggregation::QuarterAverage,
            } => {
                let n = in_quarter.len();
                let sum: f64 = in_quarter.iter().map(|o| o.value).sum();
                values.insert(spec.name.clone(), (n > 0).then(|| sum / n as f64));
            }
            SeriesKind::Daily { .. } | SeriesKind::Periodic => {
                values.insert(spec.name.clone(), obs.last().map(|o| o.value));
            }
            SeriesKind::PolicyEvent => {
                values.insert(spec.name.clone(), obs.last().map(|o| o.value));
                // A series with no history at all leaves the count missing; the
                // feature layer decides whether that means zero.
                let count = (!obs.is_empty()).then(|| in_quarter.len() as f64);
                values.insert(format!("{}{}", spec.name, EVENT_COUNT_SUFFIX), count);
            }
        }
    }

    Ok(AlignedRow {
        key: QuarterKey::new(ticker, quarter),
        quarter,
        cutoff,
        values,
    })
}

/// Align every quarter in `quarters` for one ticker. A `DataGap` affects only its
/// own quarter; it is logged and recorded in `gaps`.
pub fn align_ticker(
    snapshot: &ObservationSnapshot,
    ticker: &str,
    quarters: &[FiscalQuarter],
    specs: &[SeriesSpec],
    policy: &AlignmentPolicy,
) -> AlignedHistory {
    let mut history = AlignedHistory {
        ticker: ticker.to_string(),
        ..Default::default()
    };
    let mut sorted = quarters.to_vec();
    sorted.sort();
    sorted.dedup();

    for quarter in sorted {
        match align_quarter(snapshot, ticker, quarter, specs, policy) {
            Ok(row) => history.rows.push(row),
            Err(e) => {
                warn!(ticker, %quarter, error = %e, "quarter not aligned");
                history.gaps.push(e);
            }
        }
    }
    debug!(
        ticker,
        rows = history.rows.len(),
        gaps = history.gaps.len(),
        "ticker aligned"
    );
    history
}

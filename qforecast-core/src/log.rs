//! Append-only observation log and immutable snapshots.
//!
//! The log is the single source of raw truth: observations are validated against
//! the adapter contract, deduplicated, and never mutated or removed. Every pipeline
//! run works from an `ObservationSnapshot`, a cheap copy-on-write view that later
//! ingestion cannot change.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::domain::{DatasetHash, IncomingObservation, ObservationError, RawObservation};

type SeriesMap = BTreeMap<String, Vec<RawObservation>>;

// ─── Ingest report ───────────────────────────────────────────────────

/// Per-source tallies for one ingest call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceTally {
    pub accepted: usize,
    pub rejected: usize,
    pub duplicate: usize,
}

/// Outcome of one `ingest` call.
#[derive(Debug, Clone, Default)]
pub struct IngestReport {
    pub sources: BTreeMap<String, SourceTally>,
    pub rejections: Vec<ObservationError>,
    /// Newly appended observations, in arrival order.
    pub appended: Vec<RawObservation>,
}

impl IngestReport {
    pub fn accepted(&self) -> usize {
        self.sources.values().map(|t| t.accepted).sum()
    }

    pub fn rejected(&self) -> usize {
        self.sources.values().map(|t| t.rejected).sum()
    }

    pub fn duplicates(&self) -> usize {
        self.sources.values().map(|t| t.duplicate).sum()
    }
}

// ─── Log ─────────────────────────────────────────────────────────────

/// Identity of a stored observation: a revision is a new publication of the same
/// (source, series, timestamp).
type ObservationId = (String, String, NaiveDateTime, NaiveDateTime);

/// Append-only store of validated observations, indexed by series id.
#[derive(Debug, Default)]
pub struct ObservationLog {
    series: Arc<SeriesMap>,
    seen: HashSet<ObservationId>,
    len: usize,
}

impl ObservationLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and append a batch. Contract violations are dropped and logged;
    /// the rest of the batch is still ingested.
    pub fn ingest<I>(&mut self, batch: I) -> IngestReport
    where
        I: IntoIterator<Item = IncomingObservation>,
    {
        let mut report = IngestReport::default();
        let series = Arc::make_mut(&mut self.series);

        for incoming in batch {
            let source = incoming.source.clone();
            match incoming.validate() {
                Ok(obs) => {
                    let tally = report.sources.entry(source).or_default();
                    let id = (
                        obs.source.clone(),
                        obs.series_id.clone(),
                        obs.timestamp,
                        obs.publication_timestamp,
                    );
                    if !self.seen.insert(id) {
                        tally.duplicate += 1;
                        debug!(series_id = %obs.series_id, timestamp = %obs.timestamp, "duplicate observation ignored");
                        continue;
                    }
                    tally.accepted += 1;
                    let rows = series.entry(obs.series_id.clone()).or_default();
                    let at = rows.partition_point(|r| {
                        (r.timestamp, r.publication_timestamp)
                            <= (obs.timestamp, obs.publication_timestamp)
                    });
                    rows.insert(at, obs.clone());
                    report.appended.push(obs);
                    self.len += 1;
                }
                Err(e) => {
                    warn!(source = %source, error = %e, "malformed observation dropped");
                    report.sources.entry(source).or_default().rejected += 1;
                    report.rejections.push(e);
                }
            }
        }

        report
    }

    /// Immutable view of everything ingested so far.
    pub fn snapshot(&self) -> ObservationSnapshot {
        ObservationSnapshot {
            series: Arc::clone(&self.series),
            len: self.len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

// ─── Snapshot ────────────────────────────────────────────────────────

/// Frozen view of the observation log. Per-series rows are sorted by
/// (timestamp, publication_timestamp).
#[derive(Debug, Clone, Default)]
pub struct ObservationSnapshot {
    series: Arc<SeriesMap>,
    len: usize,
}

impl ObservationSnapshot {
    /// Build a snapshot directly from already-validated observations.
    pub fn from_observations(observations: impl IntoIterator<Item = RawObservation>) -> Self {
        let mut log = ObservationLog::new();
        log.ingest(observations.into_iter().map(IncomingObservation::from));
        log.snapshot()
    }

    /// All observations of a series, oldest first. Empty when the series is unknown.
    pub fn series(&self, series_id: &str) -> &[RawObservation] {
        self.series
            .get(series_id)
            .map(|rows| rows.as_slice())
            .unwrap_or(&[])
    }

    pub fn series_ids(&self) -> impl Iterator<Item = &str> {
        self.series.keys().map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Latest publication timestamp in the snapshot.
    pub fn latest_publication(&self) -> Option<NaiveDateTime> {
        self.series
            .values()
            .flat_map(|rows| rows.iter().map(|r| r.publication_timestamp))
            .max()
    }

    /// Content hash over every observation, in canonical (series, time) order.
    pub fn dataset_hash(&self) -> DatasetHash {
        let mut hasher = blake3::Hasher::new();
        for (series_id, rows) in self.series.iter() {
            hasher.update(series_id.as_bytes());
            hasher.update(&[0]);
            for r in rows {
                hasher.update(r.source.as_bytes());
                hasher.update(&r.timestamp.and_utc().timestamp().to_le_bytes());
                hasher.update(&r.publication_timestamp.and_utc().timestamp().to_le_bytes());
                hasher.update(&r.value.to_bits().to_le_bytes());
            }
        }
        DatasetHash(hasher.finalize().to_hex().to_string())
    }
}

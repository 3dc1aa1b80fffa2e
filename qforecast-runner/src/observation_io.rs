//! Observation input and the persisted observation log.
//!
//! Adapters hand over CSV files with the columns
//! `source,series_id,timestamp,value,publication_timestamp`. Timestamps are
//! `YYYY-MM-DD HH:MM:SS`, `YYYY-MM-DDTHH:MM:SS` or a bare date. A bare
//! publication date means "knowable by the end of that day". An empty
//! publication column is passed through as missing and rejected by the adapter
//! contract check.
//!
//! Accepted observations are appended to a JSONL journal; opening the store
//! replays the journal through the same contract check.

use std::io::Read;
use std::path::{Path, PathBuf};

use chrono::{NaiveDate, NaiveDateTime};
use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

use qforecast_core::domain::quarter::end_of_day;
use qforecast_core::domain::{IncomingObservation, RawObservation};
use qforecast_core::{IngestReport, ObservationLog};

use crate::journal::Journal;

#[derive(Debug, Error)]
pub enum ObservationIoError {
    #[error("observation I/O at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("observation CSV: {0}")]
    Csv(#[from] csv::Error),
}

// ─── CSV input ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CsvRow {
    source: String,
    series_id: String,
    timestamp: String,
    value: String,
    #[serde(default)]
    publication_timestamp: String,
}

/// Parsed CSV batch. Lines that cannot be parsed at all are reported in
/// `skipped` and never reach the log.
#[derive(Debug, Default)]
pub struct CsvBatch {
    pub rows: Vec<IncomingObservation>,
    pub skipped: Vec<String>,
}

/// Parse `YYYY-MM-DD[ T]HH:MM:SS`, or a bare date resolved with `on_date`.
fn parse_instant(raw: &str, on_date: fn(NaiveDate) -> NaiveDateTime) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .or_else(|| NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok().map(on_date))
}

fn start_of_day(date: NaiveDate) -> NaiveDateTime {
    date.and_time(chrono::NaiveTime::default())
}

impl CsvRow {
    fn into_incoming(self) -> Result<IncomingObservation, String> {
        let timestamp = parse_instant(&self.timestamp, start_of_day)
            .ok_or_else(|| format!("bad timestamp '{}'", self.timestamp))?;
        let value: f64 = self
            .value
            .trim()
            .parse()
            .map_err(|_| format!("bad value '{}'", self.value))?;
        let publication_timestamp = if self.publication_timestamp.trim().is_empty() {
            None
        } else {
            Some(
                parse_instant(&self.publication_timestamp, end_of_day).ok_or_else(|| {
                    format!("bad publication timestamp '{}'", self.publication_timestamp)
                })?,
            )
        };
        Ok(IncomingObservation {
            source: self.source,
            series_id: self.series_id,
            timestamp,
            value,
            publication_timestamp,
        })
    }
}

/// Read an adapter CSV (with header row).
pub fn read_csv<R: Read>(reader: R) -> Result<CsvBatch, ObservationIoError> {
    let mut rdr = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
    rdr.headers()?;
    let mut batch = CsvBatch::default();
    for (n, record) in rdr.deserialize::<CsvRow>().enumerate() {
        let line = n + 2;
        let parsed = record
            .map_err(|e| e.to_string())
            .and_then(CsvRow::into_incoming);
        match parsed {
            Ok(row) => batch.rows.push(row),
            Err(reason) => {
                warn!(line, %reason, "unparseable CSV row skipped");
                batch.skipped.push(format!("line {line}: {reason}"));
            }
        }
    }
    Ok(batch)
}

pub fn read_csv_file(path: &Path) -> Result<CsvBatch, ObservationIoError> {
    let file = std::fs::File::open(path).map_err(|source| ObservationIoError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    read_csv(file)
}

// ─── Persisted log ───────────────────────────────────────────────────

/// JSONL-backed observation log.
#[derive(Debug, Clone)]
pub struct ObservationStore {
    journal: Journal<RawObservation>,
}

impl ObservationStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            journal: Journal::new(path),
        }
    }

    pub fn path(&self) -> &Path {
        self.journal.path()
    }

    /// Rebuild the in-memory log from the journal.
    pub fn load(&self) -> Result<ObservationLog, ObservationIoError> {
        let stored = self.journal.read_all().map_err(|source| ObservationIoError::Io {
            path: self.journal.path().to_path_buf(),
            source,
        })?;
        let mut log = ObservationLog::new();
        let report = log.ingest(stored.into_iter().map(IncomingObservation::from));
        if report.rejected() > 0 {
            warn!(rejected = report.rejected(), "journal rows failed the contract check on replay");
        }
        info!(observations = log.len(), path = %self.journal.path().display(), "observation log loaded");
        Ok(log)
    }

    /// Ingest a batch into `log` and persist every newly accepted observation.
    pub fn ingest<I>(&self, log: &mut ObservationLog, batch: I) -> Result<IngestReport, ObservationIoError>
    where
        I: IntoIterator<Item = IncomingObservation>,
    {
        let report = log.ingest(batch);
        self.journal
            .append_all(&report.appended)
            .map_err(|source| ObservationIoError::Io {
                path: self.journal.path().to_path_buf(),
                source,
            })?;
        for (source, tally) in &report.sources {
            info!(
                source = %source,
                accepted = tally.accepted,
                rejected = tally.rejected,
                duplicate = tally.duplicate,
                "ingest"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CSV: &str = "\
source,series_id,timestamp,value,publication_timestamp
market,price:7203.T,2024-03-29,2850.5,2024-03-29
stats,macro:jp_cpi,2024-03-01,106.2,2024-04-19 08:30:00
stats,macro:jp_cpi,2024-04-01,106.4,
market,price:7203.T,not-a-date,1.0,2024-01-01
";

    #[test]
    fn csv_rows_parse_and_bad_lines_are_skipped() {
        let batch = read_csv(CSV.as_bytes()).unwrap();
        assert_eq!(batch.rows.len(), 3);
        assert_eq!(batch.skipped.len(), 1);
        assert!(batch.skipped[0].starts_with("line 5"));

        let price = &batch.rows[0];
        assert_eq!(price.timestamp.to_string(), "2024-03-29 00:00:00");
        assert_eq!(
            price.publication_timestamp.map(|t| t.to_string()),
            Some("2024-03-29 23:59:59".to_string())
        );
        assert_eq!(batch.rows[2].publication_timestamp, None);
    }

    #[test]
    fn ingest_persists_only_accepted_rows() {
        let dir = tempfile::tempdir().unwrap();
        let store = ObservationStore::new(dir.path().join("observations.jsonl"));
        let mut log = store.load().unwrap();
        assert!(log.is_empty());

        let batch = read_csv(CSV.as_bytes()).unwrap();
        let report = store.ingest(&mut log, batch.rows.clone()).unwrap();
        assert_eq!(report.accepted(), 2);
        assert_eq!(report.rejected(), 1);

        // Re-ingesting the same rows only yields duplicates.
        let again = store.ingest(&mut log, batch.rows).unwrap();
        assert_eq!(again.accepted(), 0);
        assert_eq!(again.duplicates(), 2);

        let reloaded = store.load().unwrap();
        assert_eq!(reloaded.len(), 2);
        assert_eq!(
            reloaded.snapshot().dataset_hash(),
            log.snapshot().dataset_hash()
        );
    }
}

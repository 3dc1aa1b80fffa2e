//! Raw observations and the ingestion adapter contract.
//!
//! Adapters deliver `IncomingObservation`s. The core accepts only rows that carry a
//! true publication timestamp (`publication_timestamp >= timestamp`) and a finite
//! value; everything else is rejected with `ObservationError`.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single observed value of a series, with the instant it became knowable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawObservation {
    pub source: String,
    pub series_id: String,
    pub timestamp: NaiveDateTime,
    pub value: f64,
    pub publication_timestamp: NaiveDateTime,
}

impl RawObservation {
    /// Whether the value was knowable at `cutoff`.
    pub fn known_at(&self, cutoff: NaiveDateTime) -> bool {
        self.publication_timestamp <= cutoff
    }
}

/// Adapter-facing shape: identical to `RawObservation` except that the
/// publication timestamp may be absent (and then gets rejected).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncomingObservation {
    pub source: String,
    pub series_id: String,
    pub timestamp: NaiveDateTime,
    pub value: f64,
    pub publication_timestamp: Option<NaiveDateTime>,
}

/// Adapter contract violations. The offending row is dropped; ingestion continues.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ObservationError {
    #[error("{adapter}/{series_id} @ {timestamp}: missing publication timestamp")]
    MissingPublicationTimestamp {
        adapter: String,
        series_id: String,
        timestamp: NaiveDateTime,
    },

    #[error("{adapter}/{series_id} @ {timestamp}: published at {published} before the observation time")]
    PublishedBeforeObserved {
        adapter: String,
        series_id: String,
        timestamp: NaiveDateTime,
        published: NaiveDateTime,
    },

    #[error("{adapter}/{series_id} @ {timestamp}: non-finite value")]
    NonFiniteValue {
        adapter: String,
        series_id: String,
        timestamp: NaiveDateTime,
    },

    #[error("observation from '{adapter}' has an empty series id")]
    EmptySeriesId { adapter: String },
}

impl ObservationError {
    /// The adapter (source) the rejected row came from.
    pub fn source_name(&self) -> &str {
        match self {
            Self::MissingPublicationTimestamp { adapter, .. }
            | Self::PublishedBeforeObserved { adapter, .. }
            | Self::NonFiniteValue { adapter, .. }
            | Self::EmptySeriesId { adapter } => adapter,
        }
    }
}

impl IncomingObservation {
    /// Enforce the adapter contract.
    pub fn validate(self) -> Result<RawObservation, ObservationError> {
        if self.series_id.trim().is_empty() {
            return Err(ObservationError::EmptySeriesId {
                adapter: self.source,
            });
        }
        let Some(published) = self.publication_timestamp else {
            return Err(ObservationError::MissingPublicationTimestamp {
                adapter: self.source,
                series_id: self.series_id,
                timestamp: self.timestamp,
            });
        };
        if published < self.timestamp {
            return Err(ObservationError::PublishedBeforeObserved {
                adapter: self.source,
                series_id: self.series_id,
                timestamp: self.timestamp,
                published,
            });
        }
        if !self.value.is_finite() {
            return Err(ObservationError::NonFiniteValue {
                adapter: self.source,
                series_id: self.series_id,
                timestamp: self.timestamp,
            });
        }
        Ok(RawObservation {
            source: self.source,
            series_id: self.series_id,
            timestamp: self.timestamp,
            value: self.value,
            publication_timestamp: published,
        })
    }
}

impl From<RawObservation> for IncomingObservation {
    fn from(obs: RawObservation) -> Self {
        Self {
            source: obs.source,
            series_id: obs.series_id,
            timestamp: obs.timestamp,
            value: obs.value,
            publication_timestamp: Some(obs.publication_timestamp),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn ts(y: i32, m: u32, d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    fn incoming(published: Option<NaiveDateTime>, value: f64) -> IncomingObservation {
        IncomingObservation {
            source: "estat".into(),
            series_id: "gdp".into(),
            timestamp: ts(2023, 3, 31),
            value,
            publication_timestamp: published,
        }
    }

    #[test]
    fn valid_observation_passes() {
        let obs = incoming(Some(ts(2023, 5, 15)), 1.2).validate().unwrap();
        assert_eq!(obs.publication_timestamp, ts(2023, 5, 15));
        assert!(obs.known_at(ts(2023, 6, 30)));
        assert!(!obs.known_at(ts(2023, 5, 14)));
    }

    #[test]
    fn missing_publication_rejected() {
        let err = incoming(None, 1.2).validate().unwrap_err();
        assert!(matches!(
            err,
            ObservationError::MissingPublicationTimestamp { .. }
        ));
        assert_eq!(err.source_name(), "estat");
    }

    #[test]
    fn publication_before_timestamp_rejected() {
        let err = incoming(Some(ts(2023, 1, 1)), 1.2).validate().unwrap_err();
        assert!(matches!(err, ObservationError::PublishedBeforeObserved { .. }));
    }

    #[test]
    fn nan_rejected() {
        let err = incoming(Some(ts(2023, 5, 15)), f64::NAN)
            .validate()
            .unwrap_err();
        assert!(matches!(err, ObservationError::NonFiniteValue { .. }));
    }
}

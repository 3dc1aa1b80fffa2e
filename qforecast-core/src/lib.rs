//! qforecast core — point-in-time data model, alignment, features and model families.
//!
//! This crate contains the leakage-sensitive half of the forecasting pipeline:
//! - Domain types (tickers, fiscal quarters, QuarterKey, observations, predictions)
//! - Append-only observation log with the adapter contract check
//! - Series Aligner (publication-time cutoffs, no look-ahead)
//! - Feature Builder (pure, versioned transforms)
//! - Base forecaster families (tree ensemble, sequence, attention) and the
//!   immutable `ModelArtifact`

pub mod align;
pub mod domain;
pub mod features;
pub mod log;
pub mod model;

pub use align::{
    align_quarter, align_ticker, AlignError, AlignedHistory, AlignedRow, AlignmentPolicy,
    DailyAggregation, SeriesKind, SeriesSpec,
};
pub use features::{build_features, FeatureDef, FeatureError, FeatureSet, FeatureVector};
pub use log::{IngestReport, ObservationLog, ObservationSnapshot};

//! Domain types for the quarterly forecasting pipeline

pub mod ids;
pub mod observation;
pub mod prediction;
pub mod quarter;
pub mod ticker;

pub use ids::{DatasetHash, EnsembleVersion, FeatureSetVersion, ModelVersion};
pub use observation::{IncomingObservation, ObservationError, RawObservation};
pub use prediction::{Interval, MemberEstimate, Prediction};
pub use quarter::{FiscalQuarter, QuarterError, QuarterKey};
pub use ticker::{Ticker, Universe, UniverseError};

/// Series identifier alias
pub type SeriesId = String;

//! Shared fixtures for unit tests.

use qforecast_core::domain::FiscalQuarter;

use crate::config::PipelineConfig;
use crate::dataset::{build_dataset, Dataset};
pub use crate::synthetic::synthetic_snapshot;

const SAMPLE: &str = r#"
first_quarter = "2018Q1"

[[universe]]
symbol = "AAA"
sector = "Automobiles"
market = "TSE"

[[universe]]
symbol = "BBB"
sector = "Electronics"
market = "TSE"

[[series]]
name = "close"
series_id = "price:{ticker}"
required = true
kind = { type = "daily" }

[features]
label = "test-v1"

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
"#;

pub fn sample_config() -> PipelineConfig {
    match PipelineConfig::from_toml(SAMPLE) {
        Ok(config) => config,
        Err(e) => panic!("sample config invalid: {e}"),
    }
}

/// Dataset over `quarters` quarters of synthetic prices.
pub fn synthetic_dataset(config: &PipelineConfig, quarters: usize) -> Dataset {
    let snapshot = synthetic_snapshot(config, quarters);
    let set = match config.feature_set() {
        Ok(set) => set,
        Err(e) => panic!("sample feature set invalid: {e}"),
    };
    let range: Vec<FiscalQuarter> = FiscalQuarter::range(
        config.first_quarter,
        config.first_quarter.offset(quarters as i32 - 1),
    );
    build_dataset(&snapshot, config, &set, &range)
}

//! Tickers and the forecasting universe.
//!
//! A ticker is created once and referenced everywhere else by symbol; the
//! universe refuses duplicate registrations.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// A listed equity in the forecasting universe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    #[serde(default)]
    pub sector: String,
    #[serde(default)]
    pub market: String,
}

impl Ticker {
    pub fn new(
        symbol: impl Into<String>,
        sector: impl Into<String>,
        market: impl Into<String>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            sector: sector.into(),
            market: market.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UniverseError {
    #[error("ticker '{0}' registered twice")]
    Duplicate(String),
    #[error("ticker symbol must not be empty")]
    EmptySymbol,
}

/// The set of tickers the pipeline forecasts, keyed by symbol.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Universe {
    tickers: BTreeMap<String, Ticker>,
}

impl Universe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_tickers(tickers: impl IntoIterator<Item = Ticker>) -> Result<Self, UniverseError> {
        let mut universe = Self::new();
        for ticker in tickers {
            universe.register(ticker)?;
        }
        Ok(universe)
    }

    /// Register a ticker. Re-registering an existing symbol is an error.
    pub fn register(&mut self, ticker: Ticker) -> Result<(), UniverseError> {
        if ticker.symbol.trim().is_empty() {
            return Err(UniverseError::EmptySymbol);
        }
        if self.tickers.contains_key(&ticker.symbol) {
            return Err(UniverseError::Duplicate(ticker.symbol));
        }
        self.tickers.insert(ticker.symbol.clone(), ticker);
        Ok(())
    }

    pub fn get(&self, symbol: &str) -> Option<&Ticker> {
        self.tickers.get(symbol)
    }

    /// All symbols, sorted.
    pub fn symbols(&self) -> Vec<&str> {
        self.tickers.keys().map(|s| s.as_str()).collect()
    }

    /// Symbols belonging to a sector.
    pub fn sector_symbols(&self, sector: &str) -> Vec<&str> {
        self.tickers
            .values()
            .filter(|t| t.sector == sector)
            .map(|t| t.symbol.as_str())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tickers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tickers.is_empty()
    }
}

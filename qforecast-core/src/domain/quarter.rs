//! Quarterly grid: fiscal quarters, decision cutoffs, and the canonical QuarterKey.
//!
//! Quarters follow the calendar grid (Q1 ends March 31). A `QuarterKey` joins every
//! derived entity: aligned rows, feature vectors, predictions.

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

const MIN_YEAR: i32 = 1900;
const MAX_YEAR: i32 = 2200;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuarterError {
    #[error("quarter must be in 1..=4, got {0}")]
    InvalidQuarter(u8),
    #[error("year {0} outside supported range {MIN_YEAR}..={MAX_YEAR}")]
    YearOutOfRange(i32),
    #[error("cannot parse quarter '{0}' (expected e.g. 2023Q2)")]
    Parse(String),
}

/// A fiscal quarter on the shared quarterly grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FiscalQuarter {
    year: i32,
    quarter: u8,
}

impl FiscalQuarter {
    pub fn new(year: i32, quarter: u8) -> Result<Self, QuarterError> {
        if !(1..=4).contains(&quarter) {
            return Err(QuarterError::InvalidQuarter(quarter));
        }
        if !(MIN_YEAR..=MAX_YEAR).contains(&year) {
            return Err(QuarterError::YearOutOfRange(year));
        }
        Ok(Self { year, quarter })
    }

    /// The quarter containing `date`.
    pub fn containing(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            quarter: (date.month0() / 3 + 1) as u8,
        }
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn quarter(&self) -> u8 {
        self.quarter
    }

    /// First calendar day of the quarter.
    pub fn start(&self) -> NaiveDate {
        ymd(self.year, u32::from(self.quarter - 1) * 3 + 1, 1)
    }

    /// Last calendar day of the quarter.
    pub fn end(&self) -> NaiveDate {
        match self.quarter {
            1 => ymd(self.year, 3, 31),
            2 => ymd(self.year, 6, 30),
            3 => ymd(self.year, 9, 30),
            _ => ymd(self.year, 12, 31),
        }
    }

    /// Last instant of the quarter (quarter end, 23:59:59).
    pub fn end_instant(&self) -> NaiveDateTime {
        end_of_day(self.end())
    }

    /// First instant of the quarter.
    pub fn start_instant(&self) -> NaiveDateTime {
        self.start().and_time(NaiveTime::default())
    }

    /// Decision cutoff: the prediction-issue time for rows of this quarter.
    pub fn decision_cutoff(&self, issue_lag_days: u32) -> NaiveDateTime {
        self.end_instant() + Duration::days(i64::from(issue_lag_days))
    }

    pub fn next(&self) -> Self {
        self.offset(1)
    }

    pub fn prev(&self) -> Self {
        self.offset(-1)
    }

    /// Shift by `n` quarters (negative = earlier).
    pub fn offset(&self, n: i32) -> Self {
        let index = self.year * 4 + i32::from(self.quarter - 1) + n;
        Self {
            year: index.div_euclid(4),
            quarter: (index.rem_euclid(4) + 1) as u8,
        }
    }

    /// Number of quarters from `self` to `other` (positive when `other` is later).
    pub fn quarters_until(&self, other: FiscalQuarter) -> i32 {
        (other.year * 4 + i32::from(other.quarter)) - (self.year * 4 + i32::from(self.quarter))
    }

    /// Inclusive range of quarters; empty when `last < first`.
    pub fn range(first: FiscalQuarter, last: FiscalQuarter) -> Vec<FiscalQuarter> {
        let n = first.quarters_until(last);
        if n < 0 {
            return Vec::new();
        }
        (0..=n).map(|i| first.offset(i)).collect()
    }
}

impl fmt::Display for FiscalQuarter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}Q{}", self.year, self.quarter)
    }
}

impl FromStr for FiscalQuarter {
    type Err = QuarterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        let (year, quarter) = upper
            .split_once('Q')
            .ok_or_else(|| QuarterError::Parse(s.to_string()))?;
        let year: i32 = year.parse().map_err(|_| QuarterError::Parse(s.to_string()))?;
        let quarter: u8 = quarter
            .parse()
            .map_err(|_| QuarterError::Parse(s.to_string()))?;
        Self::new(year, quarter)
    }
}

impl TryFrom<String> for FiscalQuarter {
    type Error = QuarterError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<FiscalQuarter> for String {
    fn from(q: FiscalQuarter) -> Self {
        q.to_string()
    }
}

/// Canonical join key: (ticker, fiscal quarter end).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QuarterKey {
    pub ticker: String,
    pub quarter_end: NaiveDate,
}

impl QuarterKey {
    pub fn new(ticker: impl Into<String>, quarter: FiscalQuarter) -> Self {
        Self {
            ticker: ticker.into(),
            quarter_end: quarter.end(),
        }
    }

    pub fn quarter(&self) -> FiscalQuarter {
        FiscalQuarter::containing(self.quarter_end)
    }
}

impl fmt::Display for QuarterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.ticker, self.quarter())
    }
}

/// Month/day combinations passed here are always valid and years are range-checked
/// in `FiscalQuarter::new`.
fn ymd(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).unwrap_or(NaiveDate::MIN)
}

pub fn end_of_day(date: NaiveDate) -> NaiveDateTime {
    date.and_hms_opt(23, 59, 59)
        .unwrap_or_else(|| date.and_time(NaiveTime::default()))
}

//! Price rows on both sides of the staging CSV.

use super::Ticker;
use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};

/// One provider bar, stamped in the exchange's UTC offset.
///
/// Keeping the offset lets the staging CSV show the same local timestamp the
/// provider reports (`2024-01-02 00:00:00-05:00`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceBar {
    pub timestamp: DateTime<FixedOffset>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub dividends: f64,
    pub stock_splits: f64,
}

/// One staging-table row. `(ticker, dt)` is the unique key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceRecord {
    pub ticker: Ticker,
    pub dt: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub dividends: f64,
    pub stock_splits: f64,
}

impl PriceRecord {
    pub fn key(&self) -> (String, DateTime<Utc>) {
        (self.ticker.as_str().to_string(), self.dt)
    }
}

//! Price provider trait and structured error types.
//!
//! The PriceProvider trait abstracts over the market-data source so the
//! fetch step can run against Yahoo Finance in production and a scripted
//! provider in tests.

use crate::domain::{DownloadWindow, PriceBar, Ticker};
use async_trait::async_trait;
use thiserror::Error;

/// Structured error types for provider calls.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("rate limited by provider (retry after {retry_after_secs}s)")]
    RateLimited { retry_after_secs: u64 },

    #[error("authentication required: {0}")]
    AuthenticationRequired(String),

    #[error("HTTP {status} for {ticker}")]
    Http { ticker: String, status: u16 },

    #[error("response format changed: {0}")]
    ResponseFormatChanged(String),

    #[error("failed to build HTTP client: {0}")]
    Client(String),
}

/// Price history for one ticker, oldest bar first. May be empty.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceSeries {
    pub ticker: Ticker,
    pub bars: Vec<PriceBar>,
}

impl PriceSeries {
    pub fn empty(ticker: Ticker) -> Self {
        Self {
            ticker,
            bars: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }
}

/// A source of historical price series.
///
/// An unknown symbol or a window with no trading activity is an empty series,
/// not an error. Errors are reserved for the provider being unreachable or
/// answering in a shape we cannot read.
#[async_trait]
pub trait PriceProvider: Send + Sync {
    /// Human-readable name of this provider.
    fn name(&self) -> &str;

    /// Fetch the price history of `ticker` over `window`.
    async fn history(
        &self,
        ticker: &Ticker,
        window: &DownloadWindow,
    ) -> Result<PriceSeries, DataError>;
}

//! Fetch step: download each ticker's history and stage it as CSV.

use crate::artifact::{self, ArtifactError};
use crate::data::{DataError, PriceProvider};
use crate::domain::{DownloadWindow, Ticker};
use crate::staging::StagingDir;
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("tickers '{first}' and '{second}' would both be staged as {stem}.csv")]
    DuplicateFileStem {
        first: Ticker,
        second: Ticker,
        stem: String,
    },

    #[error("provider {provider} failed for {ticker}: {source}")]
    Provider {
        provider: String,
        ticker: Ticker,
        #[source]
        source: DataError,
    },

    #[error(transparent)]
    Artifact(#[from] ArtifactError),
}

/// Outcome of a fetch step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchReport {
    /// Tickers with a non-empty series, in input order. Handed to the load step.
    pub succeeded: Vec<Ticker>,
    /// Tickers whose series came back empty.
    pub skipped: Vec<Ticker>,
    /// One CSV artifact per succeeded ticker.
    pub artifacts: Vec<PathBuf>,
    pub rows_written: usize,
}

/// Downloads one series per ticker and writes the non-empty ones to staging.
pub struct Fetcher<'a> {
    provider: &'a dyn PriceProvider,
    staging: &'a StagingDir,
    delimiter: u8,
}

impl<'a> Fetcher<'a> {
    pub fn new(provider: &'a dyn PriceProvider, staging: &'a StagingDir, delimiter: u8) -> Self {
        Self {
            provider,
            staging,
            delimiter,
        }
    }

    /// Fetch every ticker in order.
    ///
    /// An empty series is skipped and logged. A provider error aborts the
    /// whole step; files already written for earlier tickers stay in place.
    pub async fn fetch(
        &self,
        tickers: &[Ticker],
        window: &DownloadWindow,
    ) -> Result<FetchReport, FetchError> {
        check_distinct_stems(tickers)?;

        let total = tickers.len();
        let mut report = FetchReport::default();

        for (i, ticker) in tickers.iter().enumerate() {
            info!(%ticker, %window, "[{}/{}] fetching", i + 1, total);

            let series = self
                .provider
                .history(ticker, window)
                .await
                .map_err(|source| FetchError::Provider {
                    provider: self.provider.name().to_string(),
                    ticker: ticker.clone(),
                    source,
                })?;

            if series.is_empty() {
                warn!(%ticker, "no rows returned, skipping");
                report.skipped.push(ticker.clone());
                continue;
            }

            let path = self.staging.csv_path(ticker);
            let rows = artifact::write_series(&path, &series, self.delimiter)?;
            info!(%ticker, rows, path = %path.display(), "staged");

            report.rows_written += rows;
            report.succeeded.push(ticker.clone());
            report.artifacts.push(path);
        }

        info!(
            succeeded = report.succeeded.len(),
            skipped = report.skipped.len(),
            "fetch complete"
        );
        Ok(report)
    }
}

/// Two tickers that sanitize to the same file name would overwrite each other.
fn check_distinct_stems(tickers: &[Ticker]) -> Result<(), FetchError> {
    let mut seen: HashMap<String, &Ticker> = HashMap::new();
    for ticker in tickers {
        let stem = ticker.file_stem();
        if let Some(first) = seen.get(&stem) {
            if *first != ticker {
                return Err(FetchError::DuplicateFileStem {
                    first: (*first).clone(),
                    second: ticker.clone(),
                    stem,
                });
            }
        }
        seen.insert(stem, ticker);
    }
    Ok(())
}

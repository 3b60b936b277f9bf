//! Load step: parse staged CSVs and insert them into the staging table.

use crate::artifact::{self, ArtifactError};
use crate::domain::{PriceRecord, Ticker};
use crate::staging::StagingDir;
use crate::store::{StagingStore, StoreConnector, StoreError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

/// Where transaction boundaries fall during a load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitPolicy {
    /// One transaction per ticker, committed before the next ticker starts.
    #[default]
    PerTicker,
    /// Every ticker inside a single transaction.
    AllOrNothing,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickerLoad {
    pub ticker: Ticker,
    pub rows_read: usize,
    pub rows_inserted: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub per_ticker: Vec<TickerLoad>,
}

impl LoadReport {
    pub fn rows_read(&self) -> usize {
        self.per_ticker.iter().map(|t| t.rows_read).sum()
    }

    pub fn rows_inserted(&self) -> u64 {
        self.per_ticker.iter().map(|t| t.rows_inserted).sum()
    }
}

pub struct Loader<'a> {
    staging: &'a StagingDir,
    delimiter: u8,
    policy: CommitPolicy,
}

impl<'a> Loader<'a> {
    pub fn new(staging: &'a StagingDir, delimiter: u8, policy: CommitPolicy) -> Self {
        Self {
            staging,
            delimiter,
            policy,
        }
    }

    /// Open a connection, load `tickers`, and close the connection again.
    ///
    /// On failure any open transaction is rolled back before closing; the
    /// original error is returned.
    pub async fn run(
        &self,
        connector: &dyn StoreConnector,
        tickers: &[Ticker],
    ) -> Result<LoadReport, LoadError> {
        info!(store = %connector.describe(), tickers = tickers.len(), "connecting");
        let mut store = connector.connect().await?;

        match self.load(store.as_mut(), tickers).await {
            Ok(report) => {
                store.close().await?;
                Ok(report)
            }
            Err(e) => {
                if let Err(rb) = store.rollback().await {
                    warn!(error = %rb, "rollback after failed load");
                }
                if let Err(ce) = store.close().await {
                    warn!(error = %ce, "close after failed load");
                }
                Err(e)
            }
        }
    }

    /// Load `tickers` through an already open connection.
    pub async fn load(
        &self,
        store: &mut dyn StagingStore,
        tickers: &[Ticker],
    ) -> Result<LoadReport, LoadError> {
        let report = match self.policy {
            CommitPolicy::PerTicker => self.load_per_ticker(store, tickers).await?,
            CommitPolicy::AllOrNothing => self.load_all_or_nothing(store, tickers).await?,
        };
        info!(
            tickers = report.per_ticker.len(),
            rows_read = report.rows_read(),
            rows_inserted = report.rows_inserted(),
            policy = ?self.policy,
            "load complete"
        );
        Ok(report)
    }

    fn read(&self, ticker: &Ticker) -> Result<Vec<PriceRecord>, ArtifactError> {
        artifact::read_records(&self.staging.csv_path(ticker), ticker, self.delimiter)
    }

    async fn load_per_ticker(
        &self,
        store: &mut dyn StagingStore,
        tickers: &[Ticker],
    ) -> Result<LoadReport, LoadError> {
        let mut report = LoadReport::default();
        for ticker in tickers {
            let records = self.read(ticker)?;

            store.begin().await?;
            let inserted = store.insert_ignore(&records).await?;
            store.commit().await?;

            info!(%ticker, rows = records.len(), inserted, "committed");
            report.per_ticker.push(TickerLoad {
                ticker: ticker.clone(),
                rows_read: records.len(),
                rows_inserted: inserted,
            });
        }
        Ok(report)
    }

    async fn load_all_or_nothing(
        &self,
        store: &mut dyn StagingStore,
        tickers: &[Ticker],
    ) -> Result<LoadReport, LoadError> {
        let batches = tickers
            .iter()
            .map(|t| self.read(t).map(|records| (t, records)))
            .collect::<Result<Vec<_>, _>>()?;

        let mut report = LoadReport::default();
        store.begin().await?;
        for (ticker, records) in batches {
            let inserted = store.insert_ignore(&records).await?;
            info!(%ticker, rows = records.len(), inserted, "inserted");
            report.per_ticker.push(TickerLoad {
                ticker: ticker.clone(),
                rows_read: records.len(),
                rows_inserted: inserted,
            });
        }
        store.commit().await?;
        Ok(report)
    }
}

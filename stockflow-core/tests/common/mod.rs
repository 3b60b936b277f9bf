//! Shared fixtures for the pipeline integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{FixedOffset, TimeZone};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use stockflow_core::data::{DataError, PriceProvider, PriceSeries};
use stockflow_core::domain::{DownloadWindow, PriceBar, Ticker};
use stockflow_core::store::{MemoryStagingStore, StagingStore, StoreConnector, StoreError};
use stockflow_core::PipelineConfig;

pub fn ticker(symbol: &str) -> Ticker {
    Ticker::new(symbol).unwrap()
}

/// `n` consecutive daily bars from 2024-01-02, stamped at New York midnight.
pub fn daily_bars(n: u32, base: f64) -> Vec<PriceBar> {
    let ny = FixedOffset::west_opt(5 * 3600).unwrap();
    (0..n)
        .map(|i| {
            let px = base + f64::from(i);
            PriceBar {
                timestamp: ny.with_ymd_and_hms(2024, 1, 2 + i, 0, 0, 0).unwrap(),
                open: px,
                high: px + 1.5,
                low: px - 1.5,
                close: px + 0.5,
                volume: 1_000_000.0 + f64::from(i),
                dividends: 0.0,
                stock_splits: 0.0,
            }
        })
        .collect()
}

/// Config pointing at `staging` with no merge script and no retries.
pub fn config_for(staging: &Path, tickers: &[&str]) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.tickers = tickers.iter().map(|s| ticker(s)).collect();
    config.staging.dir = staging.to_path_buf();
    config.run.retry_delay_secs = 0;
    config
}

/// Canned responses per symbol. Unknown symbols get an empty series.
#[derive(Default)]
pub struct ScriptedProvider {
    series: HashMap<String, Vec<PriceBar>>,
    failing: HashMap<String, String>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_series(mut self, symbol: &str, bars: Vec<PriceBar>) -> Self {
        self.series.insert(symbol.to_string(), bars);
        self
    }

    pub fn failing_for(mut self, symbol: &str, reason: &str) -> Self {
        self.failing.insert(symbol.to_string(), reason.to_string());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl PriceProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn history(
        &self,
        ticker: &Ticker,
        _window: &DownloadWindow,
    ) -> Result<PriceSeries, DataError> {
        self.calls.lock().unwrap().push(ticker.as_str().to_string());

        if let Some(reason) = self.failing.get(ticker.as_str()) {
            return Err(DataError::NetworkUnreachable(reason.clone()));
        }
        Ok(PriceSeries {
            ticker: ticker.clone(),
            bars: self.series.get(ticker.as_str()).cloned().unwrap_or_default(),
        })
    }
}

/// Connector over a memory table that refuses the first `fail_connects`
/// connections and rejects any insert containing `poison_ticker`.
pub struct FlakyConnector {
    pub table: MemoryStagingStore,
    fail_connects: AtomicUsize,
    poison_ticker: Option<String>,
}

impl FlakyConnector {
    pub fn new(table: MemoryStagingStore) -> Self {
        Self {
            table,
            fail_connects: AtomicUsize::new(0),
            poison_ticker: None,
        }
    }

    pub fn refusing_connects(self, n: usize) -> Self {
        self.fail_connects.store(n, Ordering::SeqCst);
        self
    }

    pub fn poisoning(mut self, symbol: &str) -> Self {
        self.poison_ticker = Some(symbol.to_string());
        self
    }
}

#[async_trait]
impl StoreConnector for FlakyConnector {
    fn describe(&self) -> String {
        "flaky in-memory table".to_string()
    }

    async fn connect(&self) -> Result<Box<dyn StagingStore>, StoreError> {
        let remaining = self.fail_connects.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_connects.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Rejected("connection refused".into()));
        }
        Ok(Box::new(PoisonedStore {
            inner: self.table.connect().await?,
            poison_ticker: self.poison_ticker.clone(),
        }))
    }
}

struct PoisonedStore {
    inner: Box<dyn StagingStore>,
    poison_ticker: Option<String>,
}

#[async_trait]
impl StagingStore for PoisonedStore {
    async fn begin(&mut self) -> Result<(), StoreError> {
        self.inner.begin().await
    }

    async fn insert_ignore(
        &mut self,
        records: &[stockflow_core::domain::PriceRecord],
    ) -> Result<u64, StoreError> {
        if let Some(poison) = &self.poison_ticker {
            if records.iter().any(|r| r.ticker.as_str() == poison) {
                return Err(StoreError::Rejected(format!("insert failed for {poison}")));
            }
        }
        self.inner.insert_ignore(records).await
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        self.inner.commit().await
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        self.inner.rollback().await
    }

    async fn execute_script(&mut self, sql: &str) -> Result<(), StoreError> {
        self.inner.execute_script(sql).await
    }

    async fn close(&mut self) -> Result<(), StoreError> {
        self.inner.close().await
    }
}

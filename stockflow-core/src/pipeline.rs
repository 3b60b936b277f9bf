//! The run orchestrator: preflight, then Fetch → Load → Merge → Archive.
//!
//! Every step is also exposed on its own so the binary can run them one
//! at a time (a scheduler may call `fetch` and `load` as separate tasks).

use crate::archive::{ArchiveError, ArchiveReport, Archiver};
use crate::config::{ConfigError, PipelineConfig, RunSettings};
use crate::data::PriceProvider;
use crate::domain::Ticker;
use crate::fetch::{FetchError, FetchReport, Fetcher};
use crate::load::{LoadError, LoadReport, Loader};
use crate::merge::{MergeError, MergeReport, Merger};
use crate::staging::{StagingDir, StagingError};
use crate::store::{PgConnector, StoreConnector, StoreError};
use chrono::{DateTime, Utc};
use std::fmt;
use std::future::Future;
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Fetch,
    Load,
    Merge,
    Archive,
}

impl Step {
    pub fn as_str(self) -> &'static str {
        match self {
            Step::Fetch => "fetch",
            Step::Load => "load",
            Step::Merge => "merge",
            Step::Archive => "archive",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("preflight failed: {0}")]
    Preflight(#[from] StagingError),

    #[error("database setup failed: {0}")]
    Store(#[from] StoreError),

    #[error("fetch step failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("load step failed: {0}")]
    Load(#[from] LoadError),

    #[error("merge step failed: {0}")]
    Merge(#[from] MergeError),

    #[error("archive step failed: {0}")]
    Archive(#[from] ArchiveError),
}

impl PipelineError {
    /// The step that failed, if the failure happened inside one.
    pub fn step(&self) -> Option<Step> {
        match self {
            PipelineError::Fetch(_) => Some(Step::Fetch),
            PipelineError::Load(_) => Some(Step::Load),
            PipelineError::Merge(_) => Some(Step::Merge),
            PipelineError::Archive(_) => Some(Step::Archive),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub fetch: FetchReport,
    pub load: LoadReport,
    pub merge: MergeReport,
    pub archive: ArchiveReport,
}

pub struct Pipeline {
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Validate the configuration and check the staging directory, before
    /// any network or database call.
    pub fn preflight(&self) -> Result<StagingDir, PipelineError> {
        self.config.validate()?;
        let staging =
            StagingDir::prepare(&self.config.staging.dir, self.config.staging.create_missing)?;
        info!(dir = %staging.root().display(), "staging directory ready");
        Ok(staging)
    }

    /// A connector for the configured Postgres profile.
    pub fn pg_connector(&self) -> Result<PgConnector, PipelineError> {
        let profile = self.config.connection_profile()?.clone();
        let db = &self.config.database;
        Ok(PgConnector::new(profile, db.table.clone(), db.create_table)?)
    }

    pub async fn fetch(
        &self,
        provider: &dyn PriceProvider,
        staging: &StagingDir,
    ) -> Result<FetchReport, PipelineError> {
        let fetcher = Fetcher::new(provider, staging, self.config.staging.delimiter_byte());
        let tickers = &self.config.tickers;
        let window = &self.config.window;

        let report = with_retries(Step::Fetch, &self.config.run, || {
            fetcher.fetch(tickers, window)
        })
        .instrument(info_span!("fetch", provider = provider.name()))
        .await?;
        Ok(report)
    }

    pub async fn load(
        &self,
        connector: &dyn StoreConnector,
        staging: &StagingDir,
        tickers: &[Ticker],
    ) -> Result<LoadReport, PipelineError> {
        let loader = Loader::new(
            staging,
            self.config.staging.delimiter_byte(),
            self.config.database.commit_policy,
        );

        let report = with_retries(Step::Load, &self.config.run, || loader.run(connector, tickers))
            .instrument(info_span!("load", table = %self.config.database.table))
            .await?;
        Ok(report)
    }

    pub async fn merge(
        &self,
        connector: &dyn StoreConnector,
        run_start: DateTime<Utc>,
    ) -> Result<MergeReport, PipelineError> {
        let merge = &self.config.merge;
        let merger = Merger::new(
            merge.script.as_deref(),
            &merge.params,
            &self.config.database.table,
        );

        let report = with_retries(Step::Merge, &self.config.run, || {
            merger.run(connector, run_start)
        })
        .instrument(info_span!("merge"))
        .await?;
        Ok(report)
    }

    pub async fn archive(
        &self,
        staging: &StagingDir,
        now: DateTime<Utc>,
    ) -> Result<ArchiveReport, PipelineError> {
        let archiver = Archiver::new(staging, self.config.archive.scope);

        let report = with_retries(Step::Archive, &self.config.run, || {
            std::future::ready(archiver.archive_at(now))
        })
        .instrument(info_span!("archive", scope = self.config.archive.scope.as_str()))
        .await?;
        Ok(report)
    }

    /// Run every step in order. The first failing step ends the run.
    pub async fn run(
        &self,
        provider: &dyn PriceProvider,
        connector: &dyn StoreConnector,
        now: DateTime<Utc>,
    ) -> Result<RunReport, PipelineError> {
        let span = info_span!("run", started_at = %now.format("%Y-%m-%dT%H:%M:%SZ"));
        async {
            let staging = self.preflight()?;

            let fetch = self.fetch(provider, &staging).await?;
            let load = self.load(connector, &staging, &fetch.succeeded).await?;
            let merge = self.merge(connector, now).await?;
            let archive = self.archive(&staging, now).await?;

            info!(
                tickers = fetch.succeeded.len(),
                rows_inserted = load.rows_inserted(),
                merged = !merge.skipped(),
                bundle = %archive.path.display(),
                "run complete"
            );
            Ok::<_, PipelineError>(RunReport {
                started_at: now,
                fetch,
                load,
                merge,
                archive,
            })
        }
        .instrument(span)
        .await
    }
}

/// Run `op`, retrying the whole step up to `settings.retries` more times.
async fn with_retries<T, E, F, Fut>(step: Step, settings: &RunSettings, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    let mut attempt = 0;
    loop {
        info!(%step, attempt = attempt + 1, "step started");
        match op().await {
            Ok(value) => {
                info!(%step, "step finished");
                return Ok(value);
            }
            Err(e) if attempt < settings.retries => {
                attempt += 1;
                warn!(
                    %step,
                    error = %e,
                    retry = attempt,
                    of = settings.retries,
                    delay_secs = settings.retry_delay_secs,
                    "step failed, retrying"
                );
                tokio::time::sleep(settings.retry_delay()).await;
            }
            Err(e) => return Err(e),
        }
    }
}

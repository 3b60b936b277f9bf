//! stockflow CLI: run the daily price pipeline, or any one step of it.
//!
//! Commands:
//! - `run`: preflight, fetch, load, merge and archive in one go
//! - `fetch`: download and stage CSVs, print the tickers that had data
//! - `load`: insert staged CSVs for the given tickers
//! - `merge`: run the configured merge script
//! - `archive`: bundle staged CSVs into a timestamped zip
//! - `config`: print the resolved configuration

mod logging;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use stockflow_core::archive::ArchiveScope;
use stockflow_core::config::TriggerConf;
use stockflow_core::data::YahooProvider;
use stockflow_core::domain::{parse_tickers, Interval, Period};
use stockflow_core::store::{MemoryStagingStore, StoreConnector};
use stockflow_core::{Pipeline, PipelineConfig};
use tracing::info;

#[derive(Parser)]
#[command(
    name = "stockflow",
    version,
    about = "stockflow: daily stock price ingestion pipeline"
)]
struct Cli {
    /// Path to the TOML config file. Missing file means built-in defaults.
    #[arg(long, global = true, default_value = "stockflow.toml")]
    config: PathBuf,

    /// More log output (-v debug, -vv trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct TriggerArgs {
    /// Trigger payload as JSON, e.g. '{"period":"5d","interval":"1h"}'.
    #[arg(long)]
    conf: Option<String>,

    /// Lookback period (e.g. 3d, 1mo, ytd, max). Overrides --conf.
    #[arg(long)]
    period: Option<Period>,

    /// Bar interval (e.g. 1d, 1h, 5m). Overrides --conf.
    #[arg(long)]
    interval: Option<Interval>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every step: fetch, load, merge, archive.
    Run {
        #[command(flatten)]
        trigger: TriggerArgs,

        /// Load into an in-memory table instead of the database; skips merge.
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    /// Download history and stage one CSV per ticker. Prints the tickers with data as JSON.
    Fetch {
        #[command(flatten)]
        trigger: TriggerArgs,
    },
    /// Insert staged CSVs into the staging table.
    Load {
        /// Tickers to load (normally the list printed by `fetch`).
        #[arg(long, required = true, num_args = 1..)]
        tickers: Vec<String>,

        /// Parse and load into an in-memory table instead of the database.
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    /// Run the configured merge script.
    Merge,
    /// Bundle staged CSVs into <staging>/archive/<timestamp>.zip.
    Archive {
        /// Which directory to scan. Defaults to the config's archive.scope.
        #[arg(long, value_enum)]
        scope: Option<ScopeArg>,
    },
    /// Print the resolved configuration with passwords masked.
    Config,
}

#[derive(Clone, Copy, ValueEnum)]
enum ScopeArg {
    #[value(name = "staging")]
    Staging,
    #[value(name = "archive_dir")]
    ArchiveDir,
}

impl From<ScopeArg> for ArchiveScope {
    fn from(arg: ScopeArg) -> Self {
        match arg {
            ScopeArg::Staging => ArchiveScope::Staging,
            ScopeArg::ArchiveDir => ArchiveScope::ArchiveDir,
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose)?;

    let mut config = resolve_config(&cli.config)?;

    match cli.command {
        Commands::Run { trigger, dry_run } => {
            apply_trigger(&mut config, trigger)?;
            run_pipeline(config, dry_run).await
        }
        Commands::Fetch { trigger } => {
            apply_trigger(&mut config, trigger)?;
            run_fetch(config).await
        }
        Commands::Load { tickers, dry_run } => run_load(config, &tickers, dry_run).await,
        Commands::Merge => run_merge(config).await,
        Commands::Archive { scope } => {
            if let Some(scope) = scope {
                config.archive.scope = scope.into();
            }
            run_archive(config).await
        }
        Commands::Config => {
            let text = toml::to_string_pretty(&config.redacted())
                .context("failed to render configuration")?;
            print!("{text}");
            Ok(())
        }
    }
}

/// Defaults, then the TOML file, then environment overrides.
fn resolve_config(path: &Path) -> Result<PipelineConfig> {
    let mut config = PipelineConfig::load_or_default(path)
        .with_context(|| format!("failed to load config from {}", path.display()))?;
    config
        .apply_env(utf8_vars(std::env::vars_os()))
        .context("invalid environment override")?;
    Ok(config)
}

/// Environment entries whose name and value are both valid UTF-8.
fn utf8_vars(
    vars: impl IntoIterator<Item = (OsString, OsString)>,
) -> impl Iterator<Item = (String, String)> {
    vars.into_iter()
        .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
}

fn apply_trigger(config: &mut PipelineConfig, trigger: TriggerArgs) -> Result<()> {
    if let Some(payload) = trigger.conf {
        let conf = TriggerConf::from_json(&payload).context("invalid --conf payload")?;
        config.apply_trigger(conf);
    }
    config.apply_trigger(TriggerConf {
        period: trigger.period,
        interval: trigger.interval,
        tickers: None,
    });
    Ok(())
}

async fn run_pipeline(mut config: PipelineConfig, dry_run: bool) -> Result<()> {
    if dry_run {
        config.merge.script = None;
    }
    let pipeline = Pipeline::new(config);
    let provider = YahooProvider::new().context("failed to build HTTP client")?;
    let now = Utc::now();

    let report = if dry_run {
        let memory = MemoryStagingStore::new();
        let report = pipeline.run(&provider, &memory, now).await?;
        info!(rows = memory.len(), "dry run: rows held in memory");
        report
    } else {
        let connector = pipeline.pg_connector()?;
        pipeline.run(&provider, &connector, now).await?
    };

    println!(
        "Run complete: {} ticker(s) staged, {} skipped, {} row(s) inserted, archive {}",
        report.fetch.succeeded.len(),
        report.fetch.skipped.len(),
        report.load.rows_inserted(),
        report.archive.path.display()
    );
    Ok(())
}

async fn run_fetch(config: PipelineConfig) -> Result<()> {
    let pipeline = Pipeline::new(config);
    let staging = pipeline.preflight()?;
    let provider = YahooProvider::new().context("failed to build HTTP client")?;

    let report = pipeline.fetch(&provider, &staging).await?;
    let symbols: Vec<&str> = report.succeeded.iter().map(|t| t.as_str()).collect();
    println!("{}", serde_json::to_string(&symbols)?);
    Ok(())
}

async fn run_load(config: PipelineConfig, tickers: &[String], dry_run: bool) -> Result<()> {
    let tickers = parse_tickers(tickers).context("invalid --tickers")?;
    let pipeline = Pipeline::new(config);
    let staging = pipeline.preflight()?;

    let memory;
    let pg;
    let connector: &dyn StoreConnector = if dry_run {
        memory = MemoryStagingStore::new();
        &memory
    } else {
        pg = pipeline.pg_connector()?;
        &pg
    };

    let report = pipeline.load(connector, &staging, &tickers).await?;
    for t in &report.per_ticker {
        println!(
            "{:<10} read {:>6}  inserted {:>6}",
            t.ticker.as_str(),
            t.rows_read,
            t.rows_inserted
        );
    }
    Ok(())
}

async fn run_merge(config: PipelineConfig) -> Result<()> {
    if config.merge.script.is_none() {
        println!("No merge script configured; nothing to do");
        return Ok(());
    }
    let pipeline = Pipeline::new(config);
    pipeline.config().validate()?;
    let connector = pipeline.pg_connector()?;

    let report = pipeline.merge(&connector, Utc::now()).await?;
    if let Some(path) = report.script {
        println!("Merged with {}", path.display());
    }
    Ok(())
}

async fn run_archive(config: PipelineConfig) -> Result<()> {
    let pipeline = Pipeline::new(config);
    let staging = pipeline.preflight()?;

    let report = pipeline.archive(&staging, Utc::now()).await?;
    println!(
        "Archived {} file(s) to {}",
        report.files.len(),
        report.path.display()
    );
    Ok(())
}

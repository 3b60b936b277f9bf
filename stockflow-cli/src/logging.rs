//! Tracing subscriber setup.

use anyhow::{anyhow, Result};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_FILTER: &str = "info,stockflow=info";
const FORMAT_ENV: &str = "STOCKFLOW_LOG_FORMAT";

/// Install the global subscriber.
///
/// `RUST_LOG` wins when set and no `-v` was given. `-v` raises stockflow's
/// own events to debug, `-vv` turns everything up to trace.
/// `STOCKFLOW_LOG_FORMAT=json` switches to one JSON object per event.
pub fn init(verbose: u8) -> Result<()> {
    let env_filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)),
        1 => EnvFilter::new("info,stockflow=debug"),
        _ => EnvFilter::new("trace"),
    };

    let json = std::env::var(FORMAT_ENV)
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = if json {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_writer(std::io::stderr),
            )
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .try_init()
    };

    result.map_err(|e| anyhow!("failed to install tracing subscriber: {e}"))
}

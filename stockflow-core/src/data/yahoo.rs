//! Yahoo Finance price provider.
//!
//! Fetches OHLCV bars plus dividend and split events from Yahoo's v8 chart
//! API using the provider's own `range`/`interval` notation, so a download
//! window maps one-to-one onto a single request.
//!
//! Yahoo Finance has no official API and is subject to unannounced format
//! changes; anything we cannot read surfaces as `ResponseFormatChanged`.

use super::provider::{DataError, PriceProvider, PriceSeries};
use crate::domain::{DownloadWindow, PriceBar, Ticker};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime, TimeDelta, TimeZone};
use chrono_tz::Tz;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_BASE_URL: &str = "https://query2.finance.yahoo.com";

/// Yahoo Finance v8 chart API response.
#[derive(Debug, Deserialize)]
struct ChartResponse {
    chart: ChartResult,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    result: Option<Vec<ChartData>>,
    error: Option<ChartError>,
}

#[derive(Debug, Deserialize)]
struct ChartError {
    code: String,
    description: String,
}

#[derive(Debug, Deserialize)]
struct ChartData {
    #[serde(default)]
    meta: ChartMeta,
    timestamp: Option<Vec<i64>>,
    indicators: Indicators,
    #[serde(default)]
    events: Option<Events>,
}

#[derive(Debug, Default, Deserialize)]
struct ChartMeta {
    /// Exchange offset from UTC in seconds at request time, not per bar.
    #[serde(default)]
    gmtoffset: i32,
    /// IANA zone of the exchange, e.g. `America/New_York`.
    #[serde(default, rename = "exchangeTimezoneName")]
    exchange_timezone_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Indicators {
    quote: Vec<QuoteData>,
}

#[derive(Debug, Deserialize)]
struct QuoteData {
    #[serde(default)]
    open: Vec<Option<f64>>,
    #[serde(default)]
    high: Vec<Option<f64>>,
    #[serde(default)]
    low: Vec<Option<f64>>,
    #[serde(default)]
    close: Vec<Option<f64>>,
    #[serde(default)]
    volume: Vec<Option<f64>>,
}

#[derive(Debug, Default, Deserialize)]
struct Events {
    #[serde(default)]
    dividends: HashMap<String, DividendEvent>,
    #[serde(default)]
    splits: HashMap<String, SplitEvent>,
}

#[derive(Debug, Deserialize)]
struct DividendEvent {
    amount: f64,
    date: i64,
}

#[derive(Debug, Deserialize)]
struct SplitEvent {
    numerator: f64,
    denominator: f64,
    date: i64,
}

/// Yahoo Finance price provider.
pub struct YahooProvider {
    client: reqwest::Client,
    base_url: String,
}

impl YahooProvider {
    pub fn new() -> Result<Self, DataError> {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    /// Point the provider at another host (a proxy or a local stub).
    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self, DataError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent("Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36")
            .build()
            .map_err(|e| DataError::Client(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// Build the chart API URL for a symbol and download window.
    fn chart_url(&self, ticker: &Ticker, window: &DownloadWindow) -> String {
        format!(
            "{}/v8/finance/chart/{}?range={}&interval={}&events=div%2Csplits&includePrePost=false",
            self.base_url,
            urlencoding::encode(ticker.as_str()),
            window.period,
            window.interval
        )
    }
}

#[async_trait]
impl PriceProvider for YahooProvider {
    fn name(&self) -> &str {
        "yahoo_finance"
    }

    async fn history(
        &self,
        ticker: &Ticker,
        window: &DownloadWindow,
    ) -> Result<PriceSeries, DataError> {
        let url = self.chart_url(ticker, window);
        debug!(%ticker, %url, "requesting chart");

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| DataError::NetworkUnreachable(e.to_string()))?;
        let status = resp.status();

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(60);
            return Err(DataError::RateLimited { retry_after_secs });
        }

        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(DataError::AuthenticationRequired(
                "Yahoo Finance requires authentication".into(),
            ));
        }

        let body = resp
            .text()
            .await
            .map_err(|e| DataError::NetworkUnreachable(e.to_string()))?;

        // Unknown symbols come back as 404 with a chart error body.
        match serde_json::from_str::<ChartResponse>(&body) {
            Ok(chart) if status.is_success() || status == reqwest::StatusCode::NOT_FOUND => {
                parse_response(ticker, window, chart)
            }
            Ok(_) => Err(DataError::Http {
                ticker: ticker.to_string(),
                status: status.as_u16(),
            }),
            Err(e) if status.is_success() => Err(DataError::ResponseFormatChanged(format!(
                "failed to parse response for {ticker}: {e}"
            ))),
            Err(_) => Err(DataError::Http {
                ticker: ticker.to_string(),
                status: status.as_u16(),
            }),
        }
    }
}

/// Parse the chart API response into a price series.
fn parse_response(
    ticker: &Ticker,
    window: &DownloadWindow,
    resp: ChartResponse,
) -> Result<PriceSeries, DataError> {
    if let Some(err) = resp.chart.error {
        if err.code == "Not Found" {
            return Ok(PriceSeries::empty(ticker.clone()));
        }
        return Err(DataError::ResponseFormatChanged(format!(
            "{}: {}",
            err.code, err.description
        )));
    }

    let Some(data) = resp.chart.result.and_then(|r| r.into_iter().next()) else {
        return Ok(PriceSeries::empty(ticker.clone()));
    };

    // No timestamps: the window had no trading sessions.
    let Some(timestamps) = data.timestamp else {
        return Ok(PriceSeries::empty(ticker.clone()));
    };

    let clock = ExchangeClock::from_meta(&data.meta)?;

    let quote = data
        .indicators
        .quote
        .into_iter()
        .next()
        .ok_or_else(|| DataError::ResponseFormatChanged("no quote data".into()))?;

    let events = data.events.unwrap_or_default();
    let mut dividends = events_by_local_date(
        events.dividends.values().map(|d| (d.date, d.amount)),
        &clock,
    );
    let mut splits = events_by_local_date(
        events
            .splits
            .values()
            .filter(|s| s.denominator != 0.0)
            .map(|s| (s.date, s.numerator / s.denominator)),
        &clock,
    );

    let mut bars = Vec::with_capacity(timestamps.len());

    for (i, &ts) in timestamps.iter().enumerate() {
        let stamp = clock.local(ts)?;

        let open = quote.open.get(i).copied().flatten();
        let high = quote.high.get(i).copied().flatten();
        let low = quote.low.get(i).copied().flatten();
        let close = quote.close.get(i).copied().flatten();
        let volume = quote.volume.get(i).copied().flatten();

        // Holidays and halted sessions come back with null prices. A row with
        // any price missing would fail the load step, so it never reaches the CSV.
        let (Some(open), Some(high), Some(low), Some(close)) = (open, high, low, close) else {
            debug!(%ticker, ts, "skipping bar with missing prices");
            continue;
        };

        let date = stamp.date_naive();
        let timestamp = if window.interval.is_intraday() {
            stamp
        } else {
            clock.midnight(date)?
        };

        bars.push(PriceBar {
            timestamp,
            open,
            high,
            low,
            close,
            volume: volume.unwrap_or(0.0),
            // An event lands on the first bar of its session date only.
            dividends: dividends.remove(&date).unwrap_or(0.0),
            stock_splits: splits.remove(&date).unwrap_or(0.0),
        });
    }

    Ok(PriceSeries {
        ticker: ticker.clone(),
        bars,
    })
}

/// Exchange-local time for bar and event timestamps.
///
/// Sessions are dated in the named exchange zone so each bar gets the offset
/// in force on its own date. `gmtoffset` is only used when no zone is given.
#[derive(Debug, Clone, Copy)]
enum ExchangeClock {
    Zone(Tz),
    Fixed(FixedOffset),
}

impl ExchangeClock {
    fn from_meta(meta: &ChartMeta) -> Result<Self, DataError> {
        if let Some(name) = meta.exchange_timezone_name.as_deref() {
            match name.parse::<Tz>() {
                Ok(tz) => return Ok(Self::Zone(tz)),
                Err(_) => debug!(zone = name, "unknown exchange time zone, using gmtoffset"),
            }
        }
        FixedOffset::east_opt(meta.gmtoffset)
            .map(Self::Fixed)
            .ok_or_else(|| {
                DataError::ResponseFormatChanged(format!("invalid gmtoffset: {}", meta.gmtoffset))
            })
    }

    fn local(&self, ts: i64) -> Result<DateTime<FixedOffset>, DataError> {
        let stamp = match self {
            Self::Zone(tz) => tz.timestamp_opt(ts, 0).single().map(|dt| dt.fixed_offset()),
            Self::Fixed(offset) => offset.timestamp_opt(ts, 0).single(),
        };
        stamp.ok_or_else(|| DataError::ResponseFormatChanged(format!("invalid timestamp: {ts}")))
    }

    /// Start of `date` in exchange time. Where midnight falls in a DST gap
    /// the session starts at the first valid instant an hour later.
    fn midnight(&self, date: NaiveDate) -> Result<DateTime<FixedOffset>, DataError> {
        let naive = date.and_time(NaiveTime::MIN);
        let stamp = match self {
            Self::Zone(tz) => tz
                .from_local_datetime(&naive)
                .earliest()
                .or_else(|| tz.from_local_datetime(&(naive + TimeDelta::hours(1))).earliest())
                .map(|dt| dt.fixed_offset()),
            Self::Fixed(offset) => offset.from_local_datetime(&naive).single(),
        };
        stamp.ok_or_else(|| DataError::ResponseFormatChanged(format!("invalid session date: {date}")))
    }
}

fn events_by_local_date(
    events: impl Iterator<Item = (i64, f64)>,
    clock: &ExchangeClock,
) -> HashMap<NaiveDate, f64> {
    events
        .filter_map(|(ts, value)| clock.local(ts).ok().map(|dt| (dt.date_naive(), value)))
        .collect()
}

//! Yahoo Finance batch provider.
//!
//! Fetches daily bars from Yahoo's v8 chart API, one request per symbol, and
//! assembles them into a [`BatchResponse`]. Handles retries with exponential
//! backoff, the circuit breaker, and per-symbol response validation.
//!
//! Yahoo Finance has no official API and is subject to unannounced format
//! changes, so a payload that decodes but has the wrong shape is reported per
//! symbol as malformed rather than failing the whole batch.

use super::circuit_breaker::CircuitBreaker;
use super::config::ProviderConfig;
use super::provider::{BatchProvider, BatchResponse, DataError, RawBar};
use chrono::NaiveDate;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

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
    meta: Option<ChartMeta>,
    timestamp: Option<Vec<i64>>,
    indicators: Indicators,
}

#[derive(Debug, Deserialize)]
struct ChartMeta {
    gmtoffset: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct Indicators {
    #[serde(default)]
    quote: Vec<QuoteData>,
    adjclose: Option<Vec<AdjCloseData>>,
}

// Yahoo answers a window without sessions with `"quote": [{}]`.
#[derive(Debug, Default, Deserialize)]
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
    volume: Vec<Option<u64>>,
}

#[derive(Debug, Deserialize)]
struct AdjCloseData {
    #[serde(default)]
    adjclose: Vec<Option<f64>>,
}

/// Per-symbol result of one chart request.
#[derive(Debug, PartialEq)]
enum SymbolFetch {
    Bars(Vec<RawBar>),
    NotFound,
    Malformed(String),
}

pub struct YahooProvider {
    client: reqwest::blocking::Client,
    circuit_breaker: Arc<CircuitBreaker>,
    base_url: String,
    max_retries: u32,
    base_delay: Duration,
    request_delay: Duration,
}

impl YahooProvider {
    pub fn new(
        config: &ProviderConfig,
        circuit_breaker: Arc<CircuitBreaker>,
    ) -> Result<Self, DataError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(config.timeout())
            .user_agent(config.user_agent.as_str())
            .build()
            .map_err(|e| DataError::Other(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            circuit_breaker,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            max_retries: config.max_retries,
            base_delay: config.base_delay(),
            request_delay: config.request_delay(),
        })
    }

    /// Chart API URL; `period2` is the last second of `end` so the window is inclusive.
    fn chart_url(&self, symbol: &str, start: NaiveDate, end: NaiveDate) -> String {
        let start_ts = start.and_time(chrono::NaiveTime::MIN).and_utc().timestamp();
        let end_ts = end
            .and_hms_opt(23, 59, 59)
            .map(|dt| dt.and_utc().timestamp())
            .unwrap_or(start_ts);
        format!(
            "{}/v8/finance/chart/{symbol}\
             ?period1={start_ts}&period2={end_ts}&interval=1d\
             &includeAdjustedClose=true&events=div%2Csplit",
            self.base_url
        )
    }

    /// Turn a decoded chart payload into bars for one symbol.
    fn parse_chart(resp: ChartResponse) -> SymbolFetch {
        let results = match (resp.chart.result, resp.chart.error) {
            (Some(results), _) => results,
            (None, Some(err)) if err.code == "Not Found" => return SymbolFetch::NotFound,
            (None, Some(err)) => {
                return SymbolFetch::Malformed(format!("{}: {}", err.code, err.description))
            }
            (None, None) => {
                return SymbolFetch::Malformed("empty result with no error".into())
            }
        };

        let Some(data) = results.into_iter().next() else {
            return SymbolFetch::NotFound;
        };

        // No timestamps: nothing traded in the window.
        let timestamps = match data.timestamp {
            Some(ts) if !ts.is_empty() => ts,
            _ => return SymbolFetch::NotFound,
        };

        let Some(quote) = data.indicators.quote.into_iter().next() else {
            return SymbolFetch::Malformed("no quote data".into());
        };

        let adj_closes = data
            .indicators
            .adjclose
            .and_then(|v| v.into_iter().next())
            .map(|a| a.adjclose);

        let n = timestamps.len();
        let columns = [
            ("open", quote.open.len()),
            ("high", quote.high.len()),
            ("low", quote.low.len()),
            ("close", quote.close.len()),
            ("volume", quote.volume.len()),
        ];
        for (name, len) in columns {
            if len != n {
                return SymbolFetch::Malformed(format!(
                    "{name} column has {len} values for {n} timestamps"
                ));
            }
        }
        if let Some(adj) = &adj_closes {
            if adj.len() != n {
                return SymbolFetch::Malformed(format!(
                    "adjclose column has {} values for {n} timestamps",
                    adj.len()
                ));
            }
        }

        let offset = data.meta.and_then(|m| m.gmtoffset).unwrap_or(0);
        let mut bars = Vec::with_capacity(n);

        for (i, &ts) in timestamps.iter().enumerate() {
            let Some(date) = chrono::DateTime::from_timestamp(ts + offset, 0)
                .map(|dt| dt.naive_utc().date())
            else {
                return SymbolFetch::Malformed(format!("invalid timestamp: {ts}"));
            };

            bars.push(RawBar {
                date,
                open: quote.open[i],
                high: quote.high[i],
                low: quote.low[i],
                close: quote.close[i],
                adj_close: adj_closes.as_ref().and_then(|v| v[i]),
                volume: quote.volume[i],
            });
        }

        SymbolFetch::Bars(bars)
    }

    fn breaker_open(&self) -> DataError {
        DataError::CircuitBreakerTripped {
            retry_in_secs: self.circuit_breaker.remaining_cooldown().as_secs(),
        }
    }

    /// Execute a single chart request with retry and circuit breaker logic.
    fn fetch_with_retry(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<SymbolFetch, DataError> {
        let url = self.chart_url(symbol, start, end);
        let mut last_error = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = self.base_delay * 2u32.pow(attempt - 1);
                tracing::debug!(symbol, attempt, delay_ms = delay.as_millis() as u64, "retrying");
                std::thread::sleep(delay);
            }

            if !self.circuit_breaker.is_allowed() {
                return Err(self.breaker_open());
            }

            let resp = match self.client.get(&url).send() {
                Ok(resp) => resp,
                Err(e) if e.is_timeout() => {
                    last_error = Some(DataError::Timeout(format!("{symbol}: {e}")));
                    continue;
                }
                Err(e) if e.is_connect() => {
                    last_error = Some(DataError::NetworkUnreachable(e.to_string()));
                    continue;
                }
                Err(e) => return Err(DataError::NetworkUnreachable(e.to_string())),
            };

            let status = resp.status();

            if status == reqwest::StatusCode::FORBIDDEN {
                self.circuit_breaker.trip();
                return Err(self.breaker_open());
            }

            if status == reqwest::StatusCode::NOT_FOUND {
                return Ok(SymbolFetch::NotFound);
            }

            if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                self.circuit_breaker.record_failure();
                let retry_after = resp
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(60);
                last_error = Some(DataError::RateLimited {
                    retry_after_secs: retry_after,
                });
                continue;
            }

            if status == reqwest::StatusCode::UNAUTHORIZED {
                return Err(DataError::AuthenticationRequired(
                    "Yahoo Finance requires authentication".into(),
                ));
            }

            if !status.is_success() {
                self.circuit_breaker.record_failure();
                last_error = Some(DataError::Other(format!("HTTP {status} for {symbol}")));
                continue;
            }

            let chart: ChartResponse = match resp.json() {
                Ok(chart) => chart,
                Err(e) if e.is_timeout() => {
                    last_error = Some(DataError::Timeout(format!("{symbol}: {e}")));
                    continue;
                }
                Err(e) => {
                    return Err(DataError::ResponseFormatChanged(format!(
                        "failed to decode response for {symbol}: {e}"
                    )))
                }
            };

            self.circuit_breaker.record_success();
            return Ok(Self::parse_chart(chart));
        }

        Err(last_error.unwrap_or_else(|| DataError::Other("max retries exceeded".into())))
    }
}

impl BatchProvider for YahooProvider {
    fn name(&self) -> &str {
        "yahoo_finance"
    }

    fn fetch_batch(
        &self,
        symbols: &[String],
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<BatchResponse, DataError> {
        let mut batch = BatchResponse::new();

        for (i, symbol) in symbols.iter().enumerate() {
            if i > 0 && !self.request_delay.is_zero() {
                std::thread::sleep(self.request_delay);
            }

            match self.fetch_with_retry(symbol, start, end)? {
                SymbolFetch::Bars(bars) => {
                    tracing::debug!(symbol = %symbol, bars = bars.len(), "fetched");
                    batch.insert_bars(symbol.clone(), bars);
                }
                SymbolFetch::NotFound => {
                    tracing::debug!(symbol = %symbol, "no data in window");
                }
                SymbolFetch::Malformed(reason) => {
                    tracing::warn!(symbol = %symbol, %reason, "malformed chart payload");
                    batch.insert_malformed(symbol.clone(), reason);
                }
            }
        }

        Ok(batch)
    }

    fn is_available(&self) -> bool {
        self.circuit_breaker.is_allowed()
    }
}

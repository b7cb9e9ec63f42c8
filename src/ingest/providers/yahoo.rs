use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{FailureCause, SourceFailure};
use crate::ingest::providers::http;
use crate::ingest::rate_limit::RateLimiter;
use crate::ingest::types::{metric, FetchParams, FinancialSnapshot, MetricValue, SourceAdapter};

pub const NAME: &str = "yahoo_finance";
const CHART_URL: &str = "https://query1.finance.yahoo.com/v8/finance/chart";

#[derive(Debug, Deserialize)]
struct ChartResponse {
    chart: Chart,
}

#[derive(Debug, Deserialize)]
struct Chart {
    result: Option<Vec<ChartResult>>,
    error: Option<ChartError>,
}

#[derive(Debug, Deserialize)]
struct ChartError {
    code: Option<String>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    meta: Meta,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Meta {
    currency: Option<String>,
    regular_market_price: Option<f64>,
    chart_previous_close: Option<f64>,
    regular_market_day_high: Option<f64>,
    regular_market_day_low: Option<f64>,
    regular_market_volume: Option<f64>,
    fifty_two_week_high: Option<f64>,
    fifty_two_week_low: Option<f64>,
}

/// Keyless provider; the key slot exists only so config stays uniform.
pub struct YahooProvider {
    mode: Mode,
    limiter: RateLimiter,
}

enum Mode {
    Fixture(String),
    Http { client: reqwest::Client },
}

impl YahooProvider {
    pub fn from_fixture(body: &str) -> Self {
        Self {
            mode: Mode::Fixture(body.to_string()),
            limiter: RateLimiter::per_minute(u32::MAX),
        }
    }

    pub fn new(requests_per_minute: u32) -> Result<Self, reqwest::Error> {
        Ok(Self {
            mode: Mode::Http {
                client: http::build_client()?,
            },
            limiter: RateLimiter::per_minute(requests_per_minute),
        })
    }

    fn parse(subject: &str, body: &str) -> Result<FinancialSnapshot, SourceFailure> {
        let raw = http::parse_json(NAME, body)?;
        let resp: ChartResponse = serde_json::from_value(raw.clone()).map_err(|e| {
            SourceFailure::new(NAME, FailureCause::InvalidResponse, format!("chart shape: {e}"))
        })?;

        if let Some(err) = resp.chart.error {
            return Err(SourceFailure::new(
                NAME,
                FailureCause::InvalidResponse,
                format!(
                    "{}: {}",
                    err.code.unwrap_or_default(),
                    err.description.unwrap_or_default()
                ),
            ));
        }

        let meta = resp
            .chart
            .result
            .and_then(|mut r| if r.is_empty() { None } else { Some(r.remove(0)) })
            .map(|r| r.meta)
            .ok_or_else(|| {
                SourceFailure::new(
                    NAME,
                    FailureCause::InvalidResponse,
                    format!("empty chart result for {subject}"),
                )
            })?;

        let mut metrics = BTreeMap::new();
        for (name, v) in [
            (metric::PRICE, meta.regular_market_price),
            (metric::PREVIOUS_CLOSE, meta.chart_previous_close),
            (metric::HIGH, meta.regular_market_day_high),
            (metric::LOW, meta.regular_market_day_low),
            (metric::VOLUME, meta.regular_market_volume),
            (metric::FIFTY_TWO_WEEK_HIGH, meta.fifty_two_week_high),
            (metric::FIFTY_TWO_WEEK_LOW, meta.fifty_two_week_low),
        ] {
            if let Some(v) = v {
                metrics.insert(name.to_string(), MetricValue::Number(v));
            }
        }
        if let Some(ccy) = meta.currency {
            metrics.insert(metric::CURRENCY.to_string(), MetricValue::Text(ccy));
        }

        Ok(FinancialSnapshot::new(subject, NAME, metrics).with_raw(raw))
    }
}

#[async_trait]
impl SourceAdapter for YahooProvider {
    async fn fetch(
        &self,
        subject: &str,
        params: &FetchParams,
    ) -> Result<FinancialSnapshot, SourceFailure> {
        match &self.mode {
            Mode::Fixture(body) => Self::parse(subject, body),
            Mode::Http { client } => {
                let url = format!("{CHART_URL}/{subject}");
                let body = http::get_text(
                    NAME,
                    client,
                    &self.limiter,
                    &url,
                    &[("interval", "1d"), ("range", "1d")],
                    params,
                )
                .await?;
                Self::parse(subject, &body)
            }
        }
    }

    fn name(&self) -> &str {
        NAME
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn parses_chart_meta() {
        let p = YahooProvider::from_fixture(
            r#"{"chart":{"result":[{"meta":{"currency":"USD","symbol":"AAPL","regularMarketPrice":150.5,"chartPreviousClose":148.0,"regularMarketDayHigh":151.0,"regularMarketDayLow":147.9,"regularMarketVolume":51000000}}],"error":null}}"#,
        );
        let snap = p.fetch("AAPL", &FetchParams::default()).await.unwrap();
        assert_eq!(snap.metric(metric::PRICE), Some(&MetricValue::Number(150.5)));
        assert_eq!(
            snap.metric(metric::CURRENCY),
            Some(&MetricValue::Text("USD".into()))
        );
        assert!(snap.metric(metric::FIFTY_TWO_WEEK_HIGH).is_none());
    }

    #[tokio::test]
    async fn chart_error_is_invalid_response() {
        let p = YahooProvider::from_fixture(
            r#"{"chart":{"result":null,"error":{"code":"Not Found","description":"No data found, symbol may be delisted"}}}"#,
        );
        let err = p.fetch("ZZZZ", &FetchParams::default()).await.unwrap_err();
        assert_eq!(err.cause, FailureCause::InvalidResponse);
        assert!(err.message.contains("delisted"));
    }

    #[tokio::test]
    async fn garbage_body_is_invalid_response() {
        let p = YahooProvider::from_fixture("<html>oops</html>");
        let err = p.fetch("AAPL", &FetchParams::default()).await.unwrap_err();
        assert_eq!(err.cause, FailureCause::InvalidResponse);
    }
}

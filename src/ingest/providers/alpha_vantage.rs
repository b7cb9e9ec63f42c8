use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{FailureCause, SourceFailure};
use crate::ingest::providers::http;
use crate::ingest::rate_limit::RateLimiter;
use crate::ingest::types::{metric, FetchParams, FinancialSnapshot, MetricValue, SourceAdapter};

pub const NAME: &str = "alpha_vantage";
const QUERY_URL: &str = "https://www.alphavantage.co/query";

/// Alpha Vantage answers 200 for throttling and bad symbols; the body says which.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "Global Quote")]
    global_quote: Option<BTreeMap<String, String>>,
    #[serde(rename = "Note")]
    note: Option<String>,
    #[serde(rename = "Information")]
    information: Option<String>,
    #[serde(rename = "Error Message")]
    error_message: Option<String>,
}

pub struct AlphaVantageProvider {
    mode: Mode,
    limiter: RateLimiter,
}

enum Mode {
    Fixture(String),
    Http {
        client: reqwest::Client,
        api_key: Option<String>,
    },
}

impl AlphaVantageProvider {
    pub fn from_fixture(body: &str) -> Self {
        Self {
            mode: Mode::Fixture(body.to_string()),
            limiter: RateLimiter::per_minute(u32::MAX),
        }
    }

    pub fn new(api_key: Option<String>, requests_per_minute: u32) -> Result<Self, reqwest::Error> {
        Ok(Self {
            mode: Mode::Http {
                client: http::build_client()?,
                api_key,
            },
            limiter: RateLimiter::per_minute(requests_per_minute),
        })
    }

    fn parse(subject: &str, body: &str) -> Result<FinancialSnapshot, SourceFailure> {
        let raw = http::parse_json(NAME, body)?;
        let env: Envelope = serde_json::from_value(raw.clone()).map_err(|e| {
            SourceFailure::new(NAME, FailureCause::InvalidResponse, format!("envelope: {e}"))
        })?;

        if let Some(msg) = env.note.or(env.information) {
            // Free tier: 5 req/min, 25 req/day. The note does not say which one was hit.
            let mut f = SourceFailure::rate_limited(NAME, 60);
            f.message = msg;
            return Err(f);
        }
        if let Some(msg) = env.error_message {
            return Err(SourceFailure::new(NAME, FailureCause::InvalidResponse, msg));
        }

        let quote = env.global_quote.unwrap_or_default();
        if quote.is_empty() {
            return Err(SourceFailure::new(
                NAME,
                FailureCause::InvalidResponse,
                format!("empty Global Quote for {subject}"),
            ));
        }

        let mut metrics = BTreeMap::new();
        for (field, name) in [
            ("02. open", metric::OPEN),
            ("03. high", metric::HIGH),
            ("04. low", metric::LOW),
            ("05. price", metric::PRICE),
            ("06. volume", metric::VOLUME),
            ("08. previous close", metric::PREVIOUS_CLOSE),
            ("09. change", metric::CHANGE),
            ("10. change percent", metric::CHANGE_PERCENT),
        ] {
            if let Some(v) = quote.get(field).and_then(|s| parse_number(s)) {
                metrics.insert(name.to_string(), MetricValue::Number(v));
            }
        }
        if let Some(day) = quote.get("07. latest trading day") {
            metrics.insert(
                metric::LATEST_TRADING_DAY.to_string(),
                MetricValue::Text(day.clone()),
            );
        }

        Ok(FinancialSnapshot::new(subject, NAME, metrics).with_raw(raw))
    }
}

/// "1.5800%" → 1.58, "150.2500" → 150.25
fn parse_number(s: &str) -> Option<f64> {
    s.trim()
        .trim_end_matches('%')
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
}

#[async_trait]
impl SourceAdapter for AlphaVantageProvider {
    async fn fetch(
        &self,
        subject: &str,
        params: &FetchParams,
    ) -> Result<FinancialSnapshot, SourceFailure> {
        match &self.mode {
            Mode::Fixture(body) => Self::parse(subject, body),
            Mode::Http { client, api_key } => {
                let key = http::require_key(NAME, api_key.as_deref())?;
                let body = http::get_text(
                    NAME,
                    client,
                    &self.limiter,
                    QUERY_URL,
                    &[
                        ("function", "GLOBAL_QUOTE"),
                        ("symbol", subject),
                        ("apikey", key),
                    ],
                    params,
                )
                .await?;
                let parsed = Self::parse(subject, &body);
                if let Err(f) = &parsed {
                    if let Some(secs) = f.retry_after_secs {
                        self.limiter
                            .cool_down(std::time::Duration::from_secs(secs))
                            .await;
                    }
                }
                parsed
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

    const QUOTE: &str = r#"{
        "Global Quote": {
            "01. symbol": "IBM",
            "02. open": "149.0000",
            "03. high": "152.0000",
            "04. low": "148.5000",
            "05. price": "151.0000",
            "06. volume": "45678900",
            "07. latest trading day": "2024-01-02",
            "08. previous close": "148.6600",
            "09. change": "2.3400",
            "10. change percent": "1.5800%"
        }
    }"#;

    #[tokio::test]
    async fn nan_and_inf_strings_are_not_metrics() {
        let body = QUOTE
            .replace(r#""02. open": "149.0000""#, r#""02. open": "NaN""#)
            .replace(r#""03. high": "152.0000""#, r#""03. high": "inf""#);
        let snap = AlphaVantageProvider::from_fixture(&body)
            .fetch("IBM", &FetchParams::default())
            .await
            .unwrap();
        assert_eq!(snap.metric(metric::OPEN), None);
        assert_eq!(snap.metric(metric::HIGH), None);
        assert_eq!(snap.metric(metric::PRICE), Some(&MetricValue::Number(151.0)));
    }

    #[tokio::test]
    async fn parses_string_encoded_quote() {
        let p = AlphaVantageProvider::from_fixture(QUOTE);
        let snap = p.fetch("IBM", &FetchParams::default()).await.unwrap();
        assert_eq!(snap.metric(metric::PRICE), Some(&MetricValue::Number(151.0)));
        assert_eq!(
            snap.metric(metric::CHANGE_PERCENT),
            Some(&MetricValue::Number(1.58))
        );
        assert_eq!(
            snap.metric(metric::LATEST_TRADING_DAY),
            Some(&MetricValue::Text("2024-01-02".into()))
        );
    }

    #[tokio::test]
    async fn note_body_means_rate_limited() {
        let p = AlphaVantageProvider::from_fixture(
            r#"{"Note":"Thank you for using Alpha Vantage! Our standard API call frequency is 5 calls per minute."}"#,
        );
        let err = p.fetch("IBM", &FetchParams::default()).await.unwrap_err();
        assert_eq!(err.cause, FailureCause::RateLimited);
        assert_eq!(err.retry_after_secs, Some(60));
    }

    #[tokio::test]
    async fn error_message_and_empty_quote_are_invalid() {
        let p = AlphaVantageProvider::from_fixture(r#"{"Error Message":"Invalid API call."}"#);
        let err = p.fetch("IBM", &FetchParams::default()).await.unwrap_err();
        assert_eq!(err.cause, FailureCause::InvalidResponse);

        let p = AlphaVantageProvider::from_fixture(r#"{"Global Quote":{}}"#);
        let err = p.fetch("NOPE", &FetchParams::default()).await.unwrap_err();
        assert_eq!(err.cause, FailureCause::InvalidResponse);
    }
}

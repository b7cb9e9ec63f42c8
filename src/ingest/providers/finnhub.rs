use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{FailureCause, SourceFailure};
use crate::ingest::providers::http;
use crate::ingest::rate_limit::RateLimiter;
use crate::ingest::types::{metric, FetchParams, FinancialSnapshot, MetricValue, SourceAdapter};

pub const NAME: &str = "finnhub";
const QUOTE_URL: &str = "https://finnhub.io/api/v1/quote";

/// `/quote` body. Unknown symbols come back as all zeros.
#[derive(Debug, Deserialize)]
struct Quote {
    c: Option<f64>,
    d: Option<f64>,
    dp: Option<f64>,
    h: Option<f64>,
    l: Option<f64>,
    o: Option<f64>,
    pc: Option<f64>,
    t: Option<i64>,
}

pub struct FinnhubProvider {
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

impl FinnhubProvider {
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
        let q: Quote = serde_json::from_value(raw.clone()).map_err(|e| {
            SourceFailure::new(NAME, FailureCause::InvalidResponse, format!("quote shape: {e}"))
        })?;

        if q.c.unwrap_or(0.0) == 0.0 && q.t.unwrap_or(0) == 0 {
            return Err(SourceFailure::new(
                NAME,
                FailureCause::InvalidResponse,
                format!("no quote for {subject}"),
            ));
        }

        let mut metrics = BTreeMap::new();
        for (name, v) in [
            (metric::PRICE, q.c),
            (metric::CHANGE, q.d),
            (metric::CHANGE_PERCENT, q.dp),
            (metric::HIGH, q.h),
            (metric::LOW, q.l),
            (metric::OPEN, q.o),
            (metric::PREVIOUS_CLOSE, q.pc),
        ] {
            if let Some(v) = v {
                metrics.insert(name.to_string(), MetricValue::Number(v));
            }
        }

        Ok(FinancialSnapshot::new(subject, NAME, metrics).with_raw(raw))
    }
}

#[async_trait]
impl SourceAdapter for FinnhubProvider {
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
                    QUOTE_URL,
                    &[("symbol", subject), ("token", key)],
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

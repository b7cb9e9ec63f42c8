//! Shared HTTP plumbing for provider adapters: one client per adapter and a
//! single place that turns transport/status problems into `FailureCause`s.

use std::time::Duration;

use reqwest::header::{CACHE_CONTROL, RETRY_AFTER};
use reqwest::{Response, StatusCode};

use crate::error::{FailureCause, SourceFailure};
use crate::ingest::rate_limit::RateLimiter;
use crate::ingest::types::FetchParams;

/// Default wait when a 429 carries no usable Retry-After.
const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

pub(crate) fn build_client() -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .user_agent(concat!("firs/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(Duration::from_secs(4))
        .build()
}

/// GET `url` honoring the caller's timeout and cache-bypass flag, then read the body.
pub(crate) async fn get_text(
    source: &str,
    client: &reqwest::Client,
    limiter: &RateLimiter,
    url: &str,
    query: &[(&str, &str)],
    params: &FetchParams,
) -> Result<String, SourceFailure> {
    limiter
        .acquire(params.timeout / 2)
        .await
        .map_err(|retry_after| SourceFailure::rate_limited(source, retry_after))?;

    let mut req = client.get(url).query(query).timeout(params.timeout);
    if params.bypass_cache {
        req = req.header(CACHE_CONTROL, "no-cache");
    }

    let resp = req.send().await.map_err(|e| map_transport(source, e))?;
    let resp = check_status(source, limiter, resp).await?;
    resp.text().await.map_err(|e| map_transport(source, e))
}

async fn check_status(
    source: &str,
    limiter: &RateLimiter,
    resp: Response,
) -> Result<Response, SourceFailure> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = resp
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(DEFAULT_RETRY_AFTER_SECS);
        limiter.cool_down(Duration::from_secs(retry_after)).await;
        tracing::warn!(source, retry_after, "provider rate limited");
        return Err(SourceFailure::rate_limited(source, retry_after));
    }

    Err(SourceFailure::new(
        source,
        cause_for_status(status),
        format!("HTTP {status}"),
    ))
}

pub(crate) fn cause_for_status(status: StatusCode) -> FailureCause {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => FailureCause::Auth,
        StatusCode::TOO_MANY_REQUESTS => FailureCause::RateLimited,
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => FailureCause::Timeout,
        s if s.is_server_error() => FailureCause::Network,
        _ => FailureCause::InvalidResponse,
    }
}

fn map_transport(source: &str, e: reqwest::Error) -> SourceFailure {
    let cause = if e.is_timeout() {
        FailureCause::Timeout
    } else if e.is_decode() || e.is_body() {
        FailureCause::InvalidResponse
    } else {
        FailureCause::Network
    };
    SourceFailure::new(source, cause, e.to_string())
}

/// Parse a JSON body, mapping syntax errors to `InvalidResponse`.
pub(crate) fn parse_json(source: &str, body: &str) -> Result<serde_json::Value, SourceFailure> {
    serde_json::from_str(body).map_err(|e| {
        SourceFailure::new(
            source,
            FailureCause::InvalidResponse,
            format!("malformed JSON: {e}"),
        )
    })
}

/// Treat a missing key as an auth failure before any network I/O happens.
pub(crate) fn require_key<'a>(
    source: &str,
    api_key: Option<&'a str>,
) -> Result<&'a str, SourceFailure> {
    match api_key.map(str::trim) {
        Some(k) if !k.is_empty() => Ok(k),
        _ => Err(SourceFailure::new(
            source,
            FailureCause::Auth,
            "no API key configured",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_covers_taxonomy() {
        assert_eq!(cause_for_status(StatusCode::UNAUTHORIZED), FailureCause::Auth);
        assert_eq!(cause_for_status(StatusCode::FORBIDDEN), FailureCause::Auth);
        assert_eq!(
            cause_for_status(StatusCode::TOO_MANY_REQUESTS),
            FailureCause::RateLimited
        );
        assert_eq!(
            cause_for_status(StatusCode::GATEWAY_TIMEOUT),
            FailureCause::Timeout
        );
        assert_eq!(
            cause_for_status(StatusCode::BAD_GATEWAY),
            FailureCause::Network
        );
        assert_eq!(
            cause_for_status(StatusCode::NOT_FOUND),
            FailureCause::InvalidResponse
        );
    }

    #[test]
    fn missing_key_is_auth_failure() {
        let err = require_key("finnhub", Some("  ")).unwrap_err();
        assert_eq!(err.cause, FailureCause::Auth);
        assert_eq!(require_key("finnhub", Some("k")).unwrap(), "k");
    }
}

// tests/providers.rs
//
// Built-in providers in fixture mode, run through the orchestrator the way the
// coordinator does, plus registry resolution from config.

use std::sync::Arc;
use std::time::Duration;

use firs::error::FailureCause;
use firs::ingest::config::default_sources;
use firs::ingest::providers::{AlphaVantageProvider, FinnhubProvider, YahooProvider};
use firs::ingest::types::{metric, MetricValue};
use firs::ingest::{FetchOrchestrator, SourceConfig, SourceRegistry, SourceSet};

const AV_THROTTLED: &str = r#"{"Note":"Thank you for using Alpha Vantage! Our standard API rate limit is 25 requests per day."}"#;
const YAHOO_CHART: &str = r#"{"chart":{"result":[{"meta":{"currency":"USD","symbol":"AAPL","regularMarketPrice":150.5,"chartPreviousClose":148.0}}],"error":null}}"#;
const FINNHUB_QUOTE: &str = r#"{"c":150.25,"d":2.25,"dp":1.52,"h":152.0,"l":148.5,"o":149.0,"pc":148.0,"t":1704067200}"#;

#[tokio::test]
async fn throttled_primary_falls_through_to_next_sources() {
    let sources = SourceSet::new()
        .with(AlphaVantageProvider::from_fixture(AV_THROTTLED))
        .with(YahooProvider::from_fixture(YAHOO_CHART))
        .with(FinnhubProvider::from_fixture(FINNHUB_QUOTE));
    let r = FetchOrchestrator::new(3)
        .aggregate("AAPL", &sources, Duration::from_secs(2))
        .await;

    let av = r.outcome("alpha_vantage").and_then(|o| o.failure()).unwrap();
    assert_eq!(av.cause, FailureCause::RateLimited);
    assert!(av.retry_after_secs.is_some());

    assert_eq!(r.metric(metric::PRICE), Some(&MetricValue::Number(150.5)));
    assert_eq!(r.provenance[metric::PRICE], "yahoo_finance");
    // Only finnhub reports the day's open.
    assert_eq!(r.metric(metric::OPEN), Some(&MetricValue::Number(149.0)));
    assert_eq!(r.provenance[metric::OPEN], "finnhub");
    assert_eq!(r.metric(metric::CURRENCY), Some(&MetricValue::Text("USD".into())));
}

#[tokio::test]
async fn mock_registry_follows_config_order_and_flags() {
    let mut configs = default_sources();
    configs[1].enabled = false;
    configs.push(SourceConfig::new("no_such_provider"));

    let reg = SourceRegistry::from_configs(&configs, true).unwrap();
    let all = reg.resolve();
    assert_eq!(all.names(), ["alpha_vantage", "finnhub", "no_such_provider"]);

    let only = reg.resolve_only(&["FINNHUB", "yahoo_finance"]);
    assert_eq!(only.names(), ["finnhub"]);

    let r = FetchOrchestrator::new(4)
        .aggregate("MSFT", &all, Duration::from_secs(1))
        .await;
    assert!(r.is_partial());
    assert!(r.outcome("no_such_provider").is_some_and(|o| !o.is_success()));
}

#[tokio::test]
async fn live_registry_skips_unknown_names() {
    let configs = vec![SourceConfig::new("finnhub"), SourceConfig::new("bloomberg")];
    let reg = SourceRegistry::from_configs(&configs, false).unwrap();
    assert_eq!(reg.resolve().names(), ["finnhub"]);
    assert_eq!(reg.configured().count(), 1);

    let mut manual = SourceRegistry::new();
    manual.register(
        SourceConfig::new("yahoo_finance"),
        Arc::new(YahooProvider::from_fixture(YAHOO_CHART)),
    );
    let r = FetchOrchestrator::new(1)
        .aggregate("AAPL", &manual.resolve(), Duration::from_secs(1))
        .await;
    assert!(!r.all_failed());
}

// tests/coordinator.rs
//
// Storage Coordinator end to end over in-memory tiers and scripted sources.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use firs::analyze::{MockAnalyzer, ReportAnalyzer};
use firs::error::{AnalysisError, FailureCause, SourceFailure, StorageError};
use firs::ingest::providers::FixtureAdapter;
use firs::ingest::types::{metric, FetchParams, FinancialSnapshot, MetricValue, SourceAdapter};
use firs::ingest::{FetchOrchestrator, SourceConfig, SourceRegistry, SourceSet};
use firs::storage::backend::MemoryBackend;
use firs::storage::{
    CacheTier, CoordinatorSettings, EphemeralStore, LocalVectorStore, Origin, Similarity,
    StorageCoordinator,
};

const DIM: usize = 16;

fn settings() -> CoordinatorSettings {
    CoordinatorSettings {
        per_source_timeout: Duration::from_millis(200),
        analysis_timeout: Duration::from_millis(500),
        ..CoordinatorSettings::default()
    }
}

fn registry(adapters: Vec<FixtureAdapter>) -> SourceRegistry {
    let mut reg = SourceRegistry::new();
    for a in adapters {
        let name = firs::ingest::types::SourceAdapter::name(&a).to_string();
        reg.register(SourceConfig::new(name), Arc::new(a));
    }
    reg
}

fn quote(name: &str, price: f64) -> FixtureAdapter {
    FixtureAdapter::ok(name, [(metric::PRICE, price), (metric::PREVIOUS_CLOSE, price - 1.0)])
}

async fn coordinator(adapters: Vec<FixtureAdapter>) -> StorageCoordinator {
    StorageCoordinator::in_memory(registry(adapters), DIM, settings())
        .await
        .unwrap()
}

#[tokio::test]
async fn second_read_is_served_from_cache() {
    let a = quote("alpha", 10.0);
    let calls = a.call_counter();
    let c = coordinator(vec![a, FixtureAdapter::failing("beta", FailureCause::Network)]).await;

    let first = c.get_or_fetch("aapl", false).await.unwrap();
    assert_eq!(first.origin, Origin::Fresh);
    assert_eq!(first.aggregate.subject, "AAPL");
    assert!(first.aggregate.is_partial());

    let second = c.get_or_fetch("AAPL", false).await.unwrap();
    assert_eq!(second.origin, Origin::Cache);
    assert_eq!(second.aggregate.merged, first.aggregate.merged);
    assert_eq!(second.aggregate.outcomes.len(), 2);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn force_refresh_refetches_and_overwrites() {
    let a = quote("alpha", 10.0);
    let calls = a.call_counter();
    let c = coordinator(vec![a]).await;

    c.get_or_fetch("MSFT", false).await.unwrap();
    let forced = c.get_or_fetch("MSFT", true).await.unwrap();
    assert_eq!(forced.origin, Origin::Fresh);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let after = c.get_or_fetch("MSFT", false).await.unwrap();
    assert_eq!(after.origin, Origin::Cache);
    assert_eq!(after.aggregate.fetched_at, forced.aggregate.fetched_at);
}

#[tokio::test(start_paused = true)]
async fn every_source_failing_is_no_data_and_not_cached() {
    let c = coordinator(vec![
        FixtureAdapter::failing("alpha", FailureCause::Auth),
        FixtureAdapter::hanging("beta"),
    ])
    .await;

    let err = c.get_or_fetch("TSLA", false).await.unwrap_err();
    match &err {
        StorageError::NoDataAvailable { subject, failures } => {
            assert_eq!(subject, "TSLA");
            let causes: Vec<_> = failures.iter().map(|f| f.cause).collect();
            assert_eq!(causes, [FailureCause::Auth, FailureCause::Timeout]);
        }
        other => panic!("expected NoDataAvailable, got {other:?}"),
    }
    assert!(err.is_no_data());
    assert_eq!(c.stats().await.unwrap().cache_entries, 0);
}

/// Quote source that can be switched to answering `RateLimited`.
struct Switchable {
    price: f64,
    down: Arc<AtomicBool>,
}

#[async_trait]
impl SourceAdapter for Switchable {
    async fn fetch(
        &self,
        subject: &str,
        _params: &FetchParams,
    ) -> Result<FinancialSnapshot, SourceFailure> {
        if self.down.load(Ordering::SeqCst) {
            return Err(SourceFailure::rate_limited("alpha", 30));
        }
        let mut m = BTreeMap::new();
        m.insert(metric::PRICE.to_string(), MetricValue::Number(self.price));
        Ok(FinancialSnapshot::new(subject, "alpha", m))
    }

    fn name(&self) -> &str {
        "alpha"
    }
}

#[tokio::test]
async fn failed_forced_refresh_falls_back_to_live_entry() {
    let down = Arc::new(AtomicBool::new(false));
    let mut reg = SourceRegistry::new();
    reg.register(
        SourceConfig::new("alpha"),
        Arc::new(Switchable {
            price: 42.0,
            down: down.clone(),
        }),
    );
    let c = StorageCoordinator::in_memory(reg, DIM, settings()).await.unwrap();

    let first = c.get_or_fetch("IBM", false).await.unwrap();
    down.store(true, Ordering::SeqCst);
    let forced = c.get_or_fetch("IBM", true).await.unwrap();
    assert_eq!(forced.origin, Origin::Cache);
    assert_eq!(forced.aggregate.merged, first.aggregate.merged);
    assert_eq!(
        forced.aggregate.metric(metric::PRICE),
        Some(&MetricValue::Number(42.0))
    );

    // Nothing cached for another subject, so the same failure is an error there.
    let err = c.get_or_fetch("GE", true).await.unwrap_err();
    assert!(matches!(err, StorageError::NoDataAvailable { .. }));
}

#[tokio::test]
async fn subset_aggregate_is_not_served_to_the_configured_set() {
    let a = quote("alpha", 10.0);
    let alpha_calls = a.call_counter();
    let c = coordinator(vec![a, quote("beta", 20.0)]).await;

    let only_beta = SourceSet::new().with(quote("beta", 20.0));
    let partial = c.get_or_fetch_from("IBM", false, &only_beta).await.unwrap();
    assert_eq!(partial.aggregate.outcomes.len(), 1);
    assert_eq!(alpha_calls.load(Ordering::SeqCst), 0);

    let full = c.get_or_fetch("IBM", false).await.unwrap();
    assert_eq!(full.origin, Origin::Fresh);
    assert_eq!(full.aggregate.outcomes.len(), 2);
    assert_eq!(
        full.aggregate.metric(metric::PRICE),
        Some(&MetricValue::Number(10.0))
    );
    assert_eq!(alpha_calls.load(Ordering::SeqCst), 1);

    let again = c.get_or_fetch_from("IBM", false, &only_beta).await.unwrap();
    assert_eq!(again.origin, Origin::Cache);
    assert_eq!(again.aggregate.outcomes.len(), 1);

    // The configured set passed explicitly shares the plain snapshot entry.
    let same_names = SourceSet::new()
        .with(quote("alpha", 99.0))
        .with(quote("beta", 99.0));
    let configured = c.get_or_fetch_from("IBM", false, &same_names).await.unwrap();
    assert_eq!(configured.origin, Origin::Cache);
    assert_eq!(configured.aggregate.merged, full.aggregate.merged);
}

#[tokio::test]
async fn non_finite_metric_is_dropped_and_cache_reads_back() {
    let c = coordinator(vec![FixtureAdapter::ok(
        "alpha",
        [(metric::PRICE, 1.0), ("pe_ratio", f64::NAN), (metric::HIGH, f64::INFINITY)],
    )])
    .await;

    let first = c.get_or_fetch("AAPL", false).await.unwrap();
    assert_eq!(first.origin, Origin::Fresh);
    assert_eq!(first.aggregate.metric("pe_ratio"), None);

    let second = c.get_or_fetch("AAPL", false).await.unwrap();
    assert_eq!(second.origin, Origin::Cache);
    assert_eq!(second.aggregate.merged, first.aggregate.merged);
    assert_eq!(
        second.aggregate.metric(metric::PRICE),
        Some(&MetricValue::Number(1.0))
    );
}

#[tokio::test]
async fn backend_outage_is_not_reported_as_no_data() {
    let backend = Arc::new(MemoryBackend::new());
    let s = settings();
    let c = StorageCoordinator::new(
        registry(vec![quote("alpha", 1.0)]),
        FetchOrchestrator::new(4),
        CacheTier::new(backend.clone(), s.cache_ttl),
        EphemeralStore::new(MemoryBackend::shared(), s.ephemeral_ttl),
        Arc::new(
            LocalVectorStore::open(MemoryBackend::shared(), DIM, Similarity::Cosine)
                .await
                .unwrap(),
        ),
        s,
    );
    backend.set_offline(true);
    let err = c.get_or_fetch("AAPL", false).await.unwrap_err();
    assert!(err.is_backend(), "{err:?}");
    assert!(!err.is_no_data());
}

#[tokio::test]
async fn invalid_subject_is_rejected_before_fetching() {
    let a = quote("alpha", 1.0);
    let calls = a.call_counter();
    let c = coordinator(vec![a]).await;
    for bad in ["", "  ", "AAPL; DROP", "../etc", "TOOLONGTICKER1"] {
        let err = c.get_or_fetch(bad, false).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidSubject(_)), "{bad:?} -> {err:?}");
    }
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn raw_payloads_go_to_the_ephemeral_store() {
    let raw = json!({"c": 10.0, "pc": 9.0});
    let c = coordinator(vec![quote("alpha", 10.0).with_raw(raw.clone())]).await;

    let first = c.get_or_fetch("AAPL", false).await.unwrap();
    assert_eq!(first.raw_artifacts.len(), 1);
    let stored: serde_json::Value = c.ephemeral().load_json(&first.raw_artifacts[0]).await.unwrap();
    assert_eq!(stored, raw);
    let artifact = c.ephemeral().load(&first.raw_artifacts[0]).await.unwrap();
    assert_eq!(artifact.key, "raw/AAPL/alpha");

    let cached = c.get_or_fetch("AAPL", false).await.unwrap();
    assert!(cached.raw_artifacts.is_empty());
}

#[tokio::test]
async fn compile_report_indexes_and_caches() {
    let c = coordinator(vec![
        quote("alpha", 10.0),
        FixtureAdapter::failing("beta", FailureCause::Network),
    ])
    .await;
    let analyzer = MockAnalyzer::new(DIM);

    let (report, origin) = c.compile_report("nvda", false, &analyzer).await.unwrap();
    assert_eq!(origin, Origin::Fresh);
    assert_eq!(report.subject, "NVDA");
    assert_eq!(report.analyzer, "mock");
    assert_eq!(report.sources, ["alpha"]);
    assert!(report.partial);
    assert!(report.report_text.contains("beta"));

    let doc = c.fetch_document(&report.document_id).await.unwrap();
    assert_eq!(doc.payload, report.report_text);
    assert_eq!(doc.metadata.subject, "NVDA");
    assert!(c.ephemeral().load(&report.draft_artifact).await.is_ok());

    let query = analyzer.embed(&report.report_text).await.unwrap();
    let hits = c.semantic_search(&query, 3).await.unwrap();
    assert_eq!(hits[0].document.id, report.document_id);

    let (again, origin) = c.compile_report("NVDA", false, &analyzer).await.unwrap();
    assert_eq!(origin, Origin::Cache);
    assert_eq!(again.document_id, report.document_id);
    assert_eq!(c.vectors().len().await.unwrap(), 1);
    assert_eq!(c.cached_report("NVDA").await.unwrap(), Some(report.clone()));

    let (forced, origin) = c.compile_report("NVDA", true, &analyzer).await.unwrap();
    assert_eq!(origin, Origin::Fresh);
    assert_ne!(forced.document_id, report.document_id);
    assert_eq!(c.vectors().len().await.unwrap(), 2);
}

#[tokio::test]
async fn identical_data_is_analyzed_once() {
    let c = coordinator(vec![quote("alpha", 10.0), quote("beta", 11.0)]).await;
    let analyzer = MockAnalyzer::new(DIM);

    let (first, _) = c.compile_report("AMD", false, &analyzer).await.unwrap();
    assert_eq!(analyzer.calls(), 1);

    // Refetched data is unchanged, so the prompt is the same.
    let (forced, origin) = c.compile_report("AMD", true, &analyzer).await.unwrap();
    assert_eq!(origin, Origin::Fresh);
    assert_eq!(analyzer.calls(), 1);
    assert_eq!(forced.report_text, first.report_text);

    c.compile_report("INTC", false, &analyzer).await.unwrap();
    assert_eq!(analyzer.calls(), 2);
}

#[tokio::test]
async fn persist_report_checks_dimension() {
    let c = coordinator(vec![]).await;
    let err = c
        .persist_report("AAPL", "text", vec![0.0; DIM + 1])
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::EmbeddingDimensionMismatch { .. }));

    let id = c.persist_report("AAPL", "text", vec![1.0; DIM]).await.unwrap();
    let hits = c
        .semantic_search_filtered(&vec![1.0; DIM], 5, Some("MSFT"))
        .await
        .unwrap();
    assert!(hits.is_empty());
    assert_eq!(c.delete_subject("aapl").await.unwrap(), 1);
    assert!(!c.delete_document(&id).await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn slow_analysis_times_out_and_persists_nothing() {
    let c = coordinator(vec![quote("alpha", 10.0)]).await;
    let analyzer = MockAnalyzer::new(DIM).with_delay(Duration::from_secs(5));

    let err = c.compile_report("AAPL", false, &analyzer).await.unwrap_err();
    assert!(
        matches!(err, StorageError::Analysis(AnalysisError::Timeout { timeout_ms: 500 })),
        "{err:?}"
    );
    assert_eq!(c.vectors().len().await.unwrap(), 0);
    assert!(c.cached_report("AAPL").await.unwrap().is_none());
    // The snapshot fetched on the way is still cached.
    assert_eq!(c.get_or_fetch("AAPL", false).await.unwrap().origin, Origin::Cache);
}

#[tokio::test(start_paused = true)]
async fn cleanup_and_stats() {
    let s = CoordinatorSettings {
        cache_ttl: Duration::from_secs(10),
        ephemeral_ttl: Duration::from_secs(10),
        ..settings()
    };
    let c = StorageCoordinator::in_memory(
        registry(vec![quote("alpha", 1.0).with_raw(json!({"p": 1}))]),
        DIM,
        s,
    )
    .await
    .unwrap();

    c.get_or_fetch("AAPL", false).await.unwrap();
    let stats = c.stats().await.unwrap();
    assert_eq!(stats.cache_entries, 1);
    assert_eq!(stats.ephemeral_artifacts, 1);
    assert_eq!(stats.cache_medium, "memory");

    assert_eq!(c.cleanup_expired().await.unwrap().cache_purged, 0);
    tokio::time::advance(Duration::from_secs(11)).await;
    let report = c.teardown().await.unwrap();
    assert_eq!(report.cache_purged, 1);
    assert_eq!(report.ephemeral_purged, 1);
    assert_eq!(c.stats().await.unwrap().cache_entries, 0);

    let calls_before = c.get_or_fetch("AAPL", false).await.unwrap();
    assert_eq!(calls_before.origin, Origin::Fresh);
    assert!(c.invalidate("AAPL").await.unwrap());
    assert_eq!(c.clear_cache().await.unwrap(), 0);
}

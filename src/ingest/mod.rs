// src/ingest/mod.rs
//! Fetch Orchestrator: one concurrent fetch per enabled source, each bounded by
//! its own timeout, then a priority-ordered merge.

pub mod config;
pub mod providers;
pub mod rate_limit;
pub mod types;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::{counter, describe_counter, describe_histogram, histogram};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::error::{FailureCause, SourceFailure};
pub use crate::ingest::config::{EnabledSource, SourceConfig, SourceRegistry, SourceSet};
use crate::ingest::types::{FetchParams, FinancialSnapshot, MetricValue};

/// One-time metrics registration (so series show up on /metrics).
fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!(
            "firs_source_fetch_total",
            "Source fetches by source and outcome (success or failure cause)."
        );
        describe_histogram!("firs_source_fetch_ms", "Per-source fetch time in milliseconds.");
        describe_counter!("firs_aggregate_total", "Aggregate calls by result kind.");
    });
}

/// What one invoked source produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SourceOutcome {
    Success(FinancialSnapshot),
    Failure(SourceFailure),
}

impl SourceOutcome {
    pub fn source(&self) -> &str {
        match self {
            SourceOutcome::Success(s) => &s.source,
            SourceOutcome::Failure(f) => &f.source_name,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, SourceOutcome::Success(_))
    }

    pub fn snapshot(&self) -> Option<&FinancialSnapshot> {
        match self {
            SourceOutcome::Success(s) => Some(s),
            SourceOutcome::Failure(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&SourceFailure> {
        match self {
            SourceOutcome::Failure(f) => Some(f),
            SourceOutcome::Success(_) => None,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            SourceOutcome::Success(_) => "success",
            SourceOutcome::Failure(f) => f.cause.as_str(),
        }
    }
}

/// Merged view across sources for one subject.
///
/// `outcomes` holds exactly one entry per invoked source, in priority order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateResult {
    pub subject: String,
    pub outcomes: Vec<SourceOutcome>,
    pub merged: BTreeMap<String, MetricValue>,
    /// metric name -> source that supplied it
    pub provenance: BTreeMap<String, String>,
    pub fetched_at: DateTime<Utc>,
}

impl AggregateResult {
    pub fn from_outcomes(subject: impl Into<String>, outcomes: Vec<SourceOutcome>) -> Self {
        let (merged, provenance) = merge(&outcomes);
        Self {
            subject: subject.into(),
            outcomes,
            merged,
            provenance,
            fetched_at: Utc::now(),
        }
    }

    /// No source produced a usable snapshot.
    pub fn all_failed(&self) -> bool {
        !self
            .outcomes
            .iter()
            .any(|o| o.snapshot().is_some_and(|s| s.valid))
    }

    /// Some data, but at least one source failed.
    pub fn is_partial(&self) -> bool {
        !self.all_failed() && self.outcomes.iter().any(|o| !o.is_success())
    }

    pub fn outcome(&self, source: &str) -> Option<&SourceOutcome> {
        self.outcomes.iter().find(|o| o.source() == source)
    }

    pub fn failures(&self) -> impl Iterator<Item = &SourceFailure> {
        self.outcomes.iter().filter_map(SourceOutcome::failure)
    }

    pub fn metric(&self, name: &str) -> Option<&MetricValue> {
        self.merged.get(name)
    }
}

/// Fill each metric from the first source, in priority order, that reports it validly.
/// Metrics nobody reports are left out.
pub fn merge(
    outcomes: &[SourceOutcome],
) -> (BTreeMap<String, MetricValue>, BTreeMap<String, String>) {
    let mut merged = BTreeMap::new();
    let mut provenance = BTreeMap::new();
    for snap in outcomes.iter().filter_map(SourceOutcome::snapshot) {
        if !snap.valid {
            continue;
        }
        for (name, value) in &snap.metrics {
            if value.is_valid() && !merged.contains_key(name) {
                merged.insert(name.clone(), value.clone());
                provenance.insert(name.clone(), snap.source.clone());
            }
        }
    }
    (merged, provenance)
}

/// Runs source fetches under a shared in-flight budget.
#[derive(Debug, Clone)]
pub struct FetchOrchestrator {
    permits: Arc<Semaphore>,
}

impl FetchOrchestrator {
    /// `max_in_flight` bounds concurrent adapter calls across all aggregates sharing this orchestrator.
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_in_flight.max(1))),
        }
    }

    pub async fn aggregate(
        &self,
        subject: &str,
        sources: &SourceSet,
        per_source_timeout: Duration,
    ) -> AggregateResult {
        self.run(subject, sources, per_source_timeout, false).await
    }

    /// Same as `aggregate`, but adapters are told to skip any source-level cache.
    pub async fn aggregate_fresh(
        &self,
        subject: &str,
        sources: &SourceSet,
        per_source_timeout: Duration,
    ) -> AggregateResult {
        self.run(subject, sources, per_source_timeout, true).await
    }

    async fn run(
        &self,
        subject: &str,
        sources: &SourceSet,
        per_source_timeout: Duration,
        bypass_cache: bool,
    ) -> AggregateResult {
        ensure_metrics_described();
        let started = Instant::now();

        let mut tasks = JoinSet::new();
        for (idx, src) in sources.iter().enumerate() {
            let adapter = src.adapter.clone();
            let name = src.name.clone();
            let subject = subject.to_string();
            let permits = self.permits.clone();
            // The budget wait counts against the source's own timeout.
            let limit = src
                .timeout
                .map_or(per_source_timeout, |t| t.min(per_source_timeout));

            tasks.spawn(async move {
                let t0 = Instant::now();
                let params = FetchParams {
                    timeout: limit,
                    bypass_cache,
                };
                let res = tokio::time::timeout(limit, async {
                    let _permit = permits.acquire_owned().await.ok();
                    adapter.fetch(&subject, &params).await
                })
                .await;

                let outcome = match res {
                    Ok(Ok(snap)) => SourceOutcome::Success(snap),
                    Ok(Err(failure)) => SourceOutcome::Failure(failure),
                    Err(_) => {
                        SourceOutcome::Failure(SourceFailure::timeout(&name, limit.as_millis()))
                    }
                };
                let elapsed = t0.elapsed();
                counter!("firs_source_fetch_total", "source" => name.clone(), "outcome" => outcome.label())
                    .increment(1);
                histogram!("firs_source_fetch_ms", "source" => name.clone())
                    .record(elapsed.as_secs_f64() * 1000.0);
                if let SourceOutcome::Failure(f) = &outcome {
                    tracing::warn!(
                        subject = %subject,
                        source = %name,
                        cause = %f.cause,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "source fetch failed: {}",
                        f.message
                    );
                } else {
                    tracing::debug!(subject = %subject, source = %name, elapsed_ms = elapsed.as_millis() as u64, "source fetch ok");
                }
                (idx, outcome)
            });
        }

        // Completion order here; priority order restored below.
        let mut slots: Vec<Option<SourceOutcome>> = (0..sources.len()).map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((idx, outcome)) => slots[idx] = Some(outcome),
                Err(e) => tracing::error!(subject, error = %e, "source task aborted"),
            }
        }

        let outcomes: Vec<SourceOutcome> = slots
            .into_iter()
            .zip(sources.iter())
            .map(|(slot, src)| {
                slot.unwrap_or_else(|| {
                    SourceOutcome::Failure(SourceFailure::new(
                        &src.name,
                        FailureCause::InvalidResponse,
                        "adapter panicked",
                    ))
                })
            })
            .collect();

        let result = AggregateResult::from_outcomes(subject, outcomes);
        let kind = if result.all_failed() {
            "all_failed"
        } else if result.is_partial() {
            "partial"
        } else {
            "complete"
        };
        counter!("firs_aggregate_total", "result" => kind).increment(1);
        tracing::info!(
            subject,
            sources = sources.len(),
            failed = result.failures().count(),
            metrics = result.merged.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            result = kind,
            "aggregate done"
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::types::metric;

    fn snap(source: &str, price: f64) -> SourceOutcome {
        let mut m = BTreeMap::new();
        m.insert(metric::PRICE.to_string(), MetricValue::Number(price));
        SourceOutcome::Success(FinancialSnapshot::new("AAPL", source, m))
    }

    #[test]
    fn merge_prefers_priority_and_skips_invalid() {
        let mut nan = BTreeMap::new();
        nan.insert(metric::PRICE.to_string(), MetricValue::Number(f64::NAN));
        nan.insert(metric::VOLUME.to_string(), MetricValue::Number(10.0));
        let outcomes = vec![
            SourceOutcome::Success(FinancialSnapshot::new("AAPL", "a", nan)),
            snap("b", 151.0),
            snap("c", 152.0),
        ];
        let (merged, prov) = merge(&outcomes);
        assert_eq!(merged[metric::PRICE], MetricValue::Number(151.0));
        assert_eq!(prov[metric::PRICE], "b");
        assert_eq!(prov[metric::VOLUME], "a");
    }

    #[test]
    fn invalidated_snapshot_contributes_nothing() {
        let stale = match snap("a", 1.0) {
            SourceOutcome::Success(s) => SourceOutcome::Success(s.invalidated()),
            other => other,
        };
        let r = AggregateResult::from_outcomes("AAPL", vec![stale]);
        assert!(r.merged.is_empty());
        assert!(r.all_failed());
    }

    #[test]
    fn outcome_serializes_with_status_tag() {
        let f = SourceOutcome::Failure(SourceFailure::timeout("b", 100));
        let v = serde_json::to_value(&f).unwrap();
        assert_eq!(v["status"], "failure");
        assert_eq!(v["cause"], "timeout");
    }
}

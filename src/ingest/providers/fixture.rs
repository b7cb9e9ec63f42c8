//! Scripted adapter used by tests and by `FIRS_TEST_MODE=mock`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{FailureCause, SourceFailure};
use crate::ingest::types::{FetchParams, FinancialSnapshot, MetricValue, SourceAdapter};

#[derive(Debug, Clone)]
enum Script {
    Ok(BTreeMap<String, MetricValue>),
    Fail(FailureCause),
    Hang,
}

/// Adapter that answers from a script instead of a provider.
///
/// `delay` is applied before the scripted answer, so a fixture can be made
/// to lose a race or trip a timeout. `calls()` counts every `fetch`.
#[derive(Debug, Clone)]
pub struct FixtureAdapter {
    name: String,
    script: Script,
    delay: Duration,
    raw: Option<serde_json::Value>,
    calls: Arc<AtomicUsize>,
}

impl FixtureAdapter {
    pub fn ok<I, K, V>(name: impl Into<String>, metrics: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<MetricValue>,
    {
        let metrics = metrics
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self::with_script(name, Script::Ok(metrics))
    }

    pub fn failing(name: impl Into<String>, cause: FailureCause) -> Self {
        Self::with_script(name, Script::Fail(cause))
    }

    /// Never answers; only a caller-side timeout ends the call.
    pub fn hanging(name: impl Into<String>) -> Self {
        Self::with_script(name, Script::Hang)
    }

    fn with_script(name: impl Into<String>, script: Script) -> Self {
        Self {
            name: name.into(),
            script,
            delay: Duration::ZERO,
            raw: None,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_raw(mut self, raw: serde_json::Value) -> Self {
        self.raw = Some(raw);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Shared handle to the call counter, usable after the adapter is moved into a registry.
    pub fn call_counter(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

#[async_trait]
impl SourceAdapter for FixtureAdapter {
    async fn fetch(
        &self,
        subject: &str,
        _params: &FetchParams,
    ) -> Result<FinancialSnapshot, SourceFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match &self.script {
            Script::Ok(metrics) => {
                let snap = FinancialSnapshot::new(subject, &self.name, metrics.clone());
                Ok(match &self.raw {
                    Some(raw) => snap.with_raw(raw.clone()),
                    None => snap,
                })
            }
            Script::Fail(cause) => Err(SourceFailure::new(
                &self.name,
                *cause,
                format!("scripted {cause}"),
            )),
            Script::Hang => std::future::pending().await,
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Deterministic stand-in quotes for the three built-in provider names.
pub fn mock_for(name: &str) -> FixtureAdapter {
    use crate::ingest::types::metric;
    match name {
        super::finnhub::NAME => FixtureAdapter::ok(
            name,
            [
                (metric::PRICE, 150.25),
                (metric::CHANGE, 2.25),
                (metric::CHANGE_PERCENT, 1.52),
                (metric::PREVIOUS_CLOSE, 148.0),
            ],
        ),
        super::alpha_vantage::NAME => FixtureAdapter::ok(
            name,
            [
                (metric::PRICE, 150.30),
                (metric::OPEN, 149.0),
                (metric::HIGH, 152.0),
                (metric::LOW, 148.5),
                (metric::VOLUME, 45_678_900.0),
            ],
        ),
        super::yahoo::NAME => FixtureAdapter::ok(
            name,
            [
                (metric::PRICE, 150.20),
                (metric::FIFTY_TWO_WEEK_HIGH, 199.62),
                (metric::FIFTY_TWO_WEEK_LOW, 124.17),
            ],
        ),
        other => FixtureAdapter::failing(other, FailureCause::InvalidResponse),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_outcomes_and_counter() {
        let ok = FixtureAdapter::ok("a", [("price", 1.0)]);
        let bad = FixtureAdapter::failing("b", FailureCause::Auth);
        let p = FetchParams::default();

        assert!(ok.fetch("X", &p).await.unwrap().valid);
        assert_eq!(bad.fetch("X", &p).await.unwrap_err().cause, FailureCause::Auth);
        ok.fetch("X", &p).await.unwrap();
        assert_eq!(ok.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_never_resolves() {
        let h = FixtureAdapter::hanging("slow");
        let r = tokio::time::timeout(Duration::from_secs(5), h.fetch("X", &FetchParams::default()))
            .await;
        assert!(r.is_err());
    }
}

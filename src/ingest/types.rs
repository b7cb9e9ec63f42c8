// src/ingest/types.rs
use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SourceFailure;

/// A single metric value as reported by a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Number(f64),
    Text(String),
}

impl MetricValue {
    /// Non-finite numbers and blank strings are not usable metric values.
    pub fn is_valid(&self) -> bool {
        match self {
            MetricValue::Number(n) => n.is_finite(),
            MetricValue::Text(s) => !s.trim().is_empty(),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetricValue::Number(n) => Some(*n),
            MetricValue::Text(_) => None,
        }
    }
}

impl From<f64> for MetricValue {
    fn from(v: f64) -> Self {
        MetricValue::Number(v)
    }
}

impl From<&str> for MetricValue {
    fn from(v: &str) -> Self {
        MetricValue::Text(v.to_string())
    }
}

impl std::fmt::Display for MetricValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetricValue::Number(n) => write!(f, "{n}"),
            MetricValue::Text(s) => f.write_str(s),
        }
    }
}

/// Per-subject, per-source record. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinancialSnapshot {
    pub subject: String,
    pub source: String,
    pub fetched_at: DateTime<Utc>,
    pub metrics: BTreeMap<String, MetricValue>,
    pub valid: bool,
    /// Raw provider payload, kept for the ephemeral tier. Never part of the cached aggregate.
    #[serde(default, skip_serializing)]
    pub raw: Option<serde_json::Value>,
}

impl FinancialSnapshot {
    /// Unusable values (NaN, infinities, blank text) are dropped here, so every
    /// stored snapshot round-trips through JSON.
    pub fn new(
        subject: impl Into<String>,
        source: impl Into<String>,
        mut metrics: BTreeMap<String, MetricValue>,
    ) -> Self {
        metrics.retain(|_, v| v.is_valid());
        let valid = !metrics.is_empty();
        Self {
            subject: subject.into(),
            source: source.into(),
            fetched_at: Utc::now(),
            metrics,
            valid,
            raw: None,
        }
    }

    pub fn with_raw(mut self, raw: serde_json::Value) -> Self {
        self.raw = Some(raw);
        self
    }

    /// Mark the whole snapshot unusable for merging (e.g. provider flagged the data as stale).
    pub fn invalidated(mut self) -> Self {
        self.valid = false;
        self
    }

    pub fn metric(&self, name: &str) -> Option<&MetricValue> {
        self.metrics.get(name)
    }
}

/// Upper-cased ticker if `raw` looks like one: 1-10 ASCII letters, optionally
/// followed by a `.` or `-` share-class suffix of 1-4 letters or digits ("BRK.B", "RDS-A").
pub fn normalize_subject(raw: &str) -> Option<String> {
    let s = raw.trim();
    let (head, tail) = match s.find(['.', '-']) {
        Some(i) => (&s[..i], Some(&s[i + 1..])),
        None => (s, None),
    };
    let head_ok = (1..=10).contains(&head.len()) && head.bytes().all(|b| b.is_ascii_alphabetic());
    let tail_ok = tail.map_or(true, |t| {
        (1..=4).contains(&t.len()) && t.bytes().all(|b| b.is_ascii_alphanumeric())
    });
    (head_ok && tail_ok).then(|| s.to_ascii_uppercase())
}

/// Per-call parameters handed to every adapter.
#[derive(Debug, Clone)]
pub struct FetchParams {
    /// Upper bound the adapter must honor for its own I/O.
    pub timeout: Duration,
    /// Skip any provider-side or adapter-side cached response.
    pub bypass_cache: bool,
}

impl Default for FetchParams {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            bypass_cache: false,
        }
    }
}

/// One provider integration. All failures come back as `SourceFailure`, never as panics.
#[async_trait::async_trait]
pub trait SourceAdapter: Send + Sync {
    async fn fetch(
        &self,
        subject: &str,
        params: &FetchParams,
    ) -> Result<FinancialSnapshot, SourceFailure>;

    fn name(&self) -> &str;
}

/// Canonical metric names shared by all adapters so the merge can line them up.
pub mod metric {
    pub const PRICE: &str = "price";
    pub const OPEN: &str = "open";
    pub const HIGH: &str = "high";
    pub const LOW: &str = "low";
    pub const PREVIOUS_CLOSE: &str = "previous_close";
    pub const CHANGE: &str = "change";
    pub const CHANGE_PERCENT: &str = "change_percent";
    pub const VOLUME: &str = "volume";
    pub const CURRENCY: &str = "currency";
    pub const FIFTY_TWO_WEEK_HIGH: &str = "fifty_two_week_high";
    pub const FIFTY_TWO_WEEK_LOW: &str = "fifty_two_week_low";
    pub const LATEST_TRADING_DAY: &str = "latest_trading_day";
}

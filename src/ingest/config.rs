// src/ingest/config.rs
//! Source configuration and the per-request capability set handed to `aggregate`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::ingest::providers::{
    self, alpha_vantage, finnhub, fixture, yahoo, AlphaVantageProvider, FinnhubProvider,
    YahooProvider,
};
use crate::ingest::types::SourceAdapter;

fn default_true() -> bool {
    true
}
fn default_rpm() -> u32 {
    60
}

/// One provider entry. Position in the configured list is its merge priority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// `"ENV"` means: read from the provider's env var (e.g. FINNHUB_API_KEY).
    #[serde(default)]
    pub api_key: Option<String>,
    /// Adapter-level timeout; the orchestrator uses the smaller of this and its own.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default = "default_rpm")]
    pub requests_per_minute: u32,
}

impl SourceConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            api_key: Some("ENV".into()),
            timeout_ms: None,
            requests_per_minute: default_rpm(),
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Resolve `"ENV"` (case-insensitive) or a missing key from the provider's env var.
    pub fn resolved_api_key(&self) -> Option<String> {
        let from_env = || {
            providers::api_key_env(&self.name)
                .and_then(|var| std::env::var(var).ok())
                .filter(|k| !k.trim().is_empty())
        };
        match self.api_key.as_deref().map(str::trim) {
            Some(k) if k.eq_ignore_ascii_case("env") => from_env(),
            Some("") | None => from_env(),
            Some(k) => Some(k.to_string()),
        }
    }
}

/// Built-in priority order: Alpha Vantage, Yahoo Finance, Finnhub.
pub fn default_sources() -> Vec<SourceConfig> {
    vec![
        SourceConfig::new(alpha_vantage::NAME),
        SourceConfig {
            api_key: None,
            ..SourceConfig::new(yahoo::NAME)
        },
        SourceConfig::new(finnhub::NAME),
    ]
}

/// An adapter that made it into a request's capability set.
#[derive(Clone)]
pub struct EnabledSource {
    pub name: String,
    pub adapter: Arc<dyn SourceAdapter>,
    pub timeout: Option<Duration>,
}

impl std::fmt::Debug for EnabledSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnabledSource")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Immutable, priority-ordered set of sources for one request.
#[derive(Debug, Clone, Default)]
pub struct SourceSet {
    sources: Vec<EnabledSource>,
}

impl SourceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append at the lowest priority so far.
    pub fn with(mut self, adapter: impl SourceAdapter + 'static) -> Self {
        self.push(Arc::new(adapter), None);
        self
    }

    pub fn push(&mut self, adapter: Arc<dyn SourceAdapter>, timeout: Option<Duration>) {
        self.sources.push(EnabledSource {
            name: adapter.name().to_string(),
            adapter,
            timeout,
        });
    }

    pub fn iter(&self) -> impl Iterator<Item = &EnabledSource> {
        self.sources.iter()
    }

    pub fn names(&self) -> Vec<&str> {
        self.sources.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

struct Registered {
    config: SourceConfig,
    adapter: Arc<dyn SourceAdapter>,
}

/// Adapters built once at startup from a configuration snapshot.
#[derive(Default)]
pub struct SourceRegistry {
    entries: Vec<Registered>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the built-in HTTP providers, or deterministic fixtures when `mock` is set.
    /// Unknown provider names are skipped with a warning.
    pub fn from_configs(configs: &[SourceConfig], mock: bool) -> Result<Self> {
        let mut reg = Self::new();
        for cfg in configs {
            let adapter: Arc<dyn SourceAdapter> = if mock {
                Arc::new(fixture::mock_for(&cfg.name))
            } else {
                let rpm = cfg.requests_per_minute;
                match cfg.name.as_str() {
                    finnhub::NAME => Arc::new(
                        FinnhubProvider::new(cfg.resolved_api_key(), rpm)
                            .context("building finnhub client")?,
                    ),
                    alpha_vantage::NAME => Arc::new(
                        AlphaVantageProvider::new(cfg.resolved_api_key(), rpm)
                            .context("building alpha_vantage client")?,
                    ),
                    yahoo::NAME => Arc::new(
                        YahooProvider::new(rpm).context("building yahoo_finance client")?,
                    ),
                    other => {
                        tracing::warn!(source = other, "unknown source in config, skipping");
                        continue;
                    }
                }
            };
            reg.register(cfg.clone(), adapter);
        }
        Ok(reg)
    }

    pub fn register(&mut self, config: SourceConfig, adapter: Arc<dyn SourceAdapter>) {
        self.entries.push(Registered { config, adapter });
    }

    /// All enabled sources, in configured priority order.
    pub fn resolve(&self) -> SourceSet {
        self.resolve_where(|_| true)
    }

    /// Enabled sources whose name is in `names`; priority order is still the configured one.
    pub fn resolve_only(&self, names: &[&str]) -> SourceSet {
        self.resolve_where(|n| names.iter().any(|x| x.eq_ignore_ascii_case(n)))
    }

    fn resolve_where(&self, keep: impl Fn(&str) -> bool) -> SourceSet {
        let mut set = SourceSet::new();
        for e in &self.entries {
            if e.config.enabled && keep(&e.config.name) {
                set.push(e.adapter.clone(), e.config.timeout());
            }
        }
        set
    }

    pub fn configured(&self) -> impl Iterator<Item = &SourceConfig> {
        self.entries.iter().map(|e| &e.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureCause;
    use crate::ingest::providers::FixtureAdapter;

    #[serial_test::serial]
    #[test]
    fn env_key_resolution() {
        std::env::set_var("FINNHUB_API_KEY", "from-env");
        let mut c = SourceConfig::new(finnhub::NAME);
        assert_eq!(c.resolved_api_key().as_deref(), Some("from-env"));
        c.api_key = Some("literal".into());
        assert_eq!(c.resolved_api_key().as_deref(), Some("literal"));
        std::env::remove_var("FINNHUB_API_KEY");
        c.api_key = Some("env".into());
        assert_eq!(c.resolved_api_key(), None);
    }

    #[test]
    fn resolve_keeps_priority_and_skips_disabled() {
        let mut reg = SourceRegistry::new();
        for (name, enabled) in [("a", true), ("b", false), ("c", true)] {
            let cfg = SourceConfig {
                enabled,
                ..SourceConfig::new(name)
            };
            reg.register(cfg, Arc::new(FixtureAdapter::failing(name, FailureCause::Network)));
        }
        assert_eq!(reg.resolve().names(), vec!["a", "c"]);
        assert_eq!(reg.resolve_only(&["c", "b"]).names(), vec!["c"]);
    }

    #[test]
    fn mock_registry_uses_fixtures() {
        let reg = SourceRegistry::from_configs(&default_sources(), true).unwrap();
        assert_eq!(
            reg.resolve().names(),
            vec![alpha_vantage::NAME, yahoo::NAME, finnhub::NAME]
        );
    }
}

// src/config/mod.rs
//! Application configuration.
//!
//! Lookup order:
//! 1) $FIRS_CONFIG_PATH
//! 2) config/firs.toml
//! 3) config/firs.json
//! 4) built-in defaults
//!
//! Env overrides are applied on top of whichever source won.

pub mod ai;

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::config::ai::AiConfig;
use crate::ingest::config::{default_sources, SourceConfig};
use crate::storage::vector::Similarity;

const ENV_PATH: &str = "FIRS_CONFIG_PATH";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub per_source_timeout_ms: u64,
    pub max_in_flight: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            per_source_timeout_ms: 10_000,
            max_in_flight: 10,
        }
    }
}

/// A TTL'd tier. No `dir` means process-lifetime memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierConfig {
    pub ttl_secs: u64,
    pub dir: Option<PathBuf>,
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 600,
            dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorConfig {
    pub dimension: usize,
    pub metric: Similarity,
    pub dir: Option<PathBuf>,
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            dimension: 768,
            metric: Similarity::Cosine,
            dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Order is merge priority.
    pub sources: Vec<SourceConfig>,
    pub fetch: FetchConfig,
    pub cache: TierConfig,
    /// TTL for compiled reports in the Cache Tier; defaults to `cache.ttl_secs`.
    pub report_ttl_secs: Option<u64>,
    pub ephemeral: TierConfig,
    pub vector: VectorConfig,
    pub ai: AiConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            sources: default_sources(),
            fetch: FetchConfig::default(),
            cache: TierConfig::default(),
            report_ttl_secs: None,
            ephemeral: TierConfig::default(),
            vector: VectorConfig::default(),
            ai: AiConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load from an explicit path. Supports TOML or JSON formats.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let mut cfg = parse(&content, &ext)
            .with_context(|| format!("parsing config {}", path.display()))?;
        cfg.apply_env();
        Ok(cfg)
    }

    /// Load using env var + fallbacks (see module docs). Also reads `.env` if present.
    pub fn load_default() -> Result<Self> {
        let _ = dotenvy::dotenv();
        if let Ok(p) = std::env::var(ENV_PATH) {
            let pb = PathBuf::from(p);
            if pb.exists() {
                return Self::load_from(&pb);
            } else {
                return Err(anyhow!("FIRS_CONFIG_PATH points to non-existent path"));
            }
        }
        for candidate in ["config/firs.toml", "config/firs.json"] {
            let p = PathBuf::from(candidate);
            if p.exists() {
                return Self::load_from(&p);
            }
        }
        let mut cfg = Self::default();
        cfg.apply_env();
        Ok(cfg)
    }

    fn apply_env(&mut self) {
        fn env_num<T: std::str::FromStr>(name: &str) -> Option<T> {
            let v = std::env::var(name).ok()?;
            match v.trim().parse() {
                Ok(n) => Some(n),
                Err(_) => {
                    tracing::warn!(var = name, value = %v, "ignoring unparsable env override");
                    None
                }
            }
        }
        if let Some(v) = env_num("FIRS_CACHE_TTL_SECS") {
            self.cache.ttl_secs = v;
        }
        if let Some(v) = env_num("FIRS_EPHEMERAL_TTL_SECS") {
            self.ephemeral.ttl_secs = v;
        }
        if let Some(v) = env_num("FIRS_PER_SOURCE_TIMEOUT_MS") {
            self.fetch.per_source_timeout_ms = v;
        }
        if let Some(v) = env_num::<usize>("FIRS_MAX_IN_FLIGHT") {
            self.fetch.max_in_flight = v.max(1);
        }
        self.ai.normalize();
    }

    pub fn per_source_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch.per_source_timeout_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.ttl_secs)
    }

    pub fn report_ttl(&self) -> Duration {
        Duration::from_secs(self.report_ttl_secs.unwrap_or(self.cache.ttl_secs))
    }

    pub fn ephemeral_ttl(&self) -> Duration {
        Duration::from_secs(self.ephemeral.ttl_secs)
    }
}

/// True when adapters and the analyzer should be swapped for deterministic fixtures.
pub fn test_mode() -> bool {
    std::env::var("FIRS_TEST_MODE")
        .map(|v| v == "mock")
        .unwrap_or(false)
}

fn parse(s: &str, hint_ext: &str) -> Result<AppConfig> {
    match hint_ext {
        "toml" => Ok(toml::from_str(s)?),
        "json" => Ok(serde_json::from_str(s)?),
        _ => {
            // No usable extension: JSON first (stricter), then TOML.
            if let Ok(v) = serde_json::from_str(s) {
                return Ok(v);
            }
            toml::from_str(s).map_err(|e| anyhow!("unsupported config format: {e}"))
        }
    }
}

// src/config/ai.rs
use serde::{Deserialize, Serialize};
use std::env;

fn default_provider() -> String {
    "openai".into()
}
fn default_api_key() -> String {
    "ENV".into()
}
fn default_model() -> String {
    "gpt-4o-mini".into()
}
fn default_embedding_model() -> String {
    "text-embedding-3-small".into()
}
fn default_timeout_ms() -> u64 {
    30_000
}
fn default_max_report_chars() -> usize {
    4_000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Only "openai" is wired up (case-insensitive).
    #[serde(default = "default_provider")]
    pub provider: String,
    /// "ENV" means: read from OPENAI_API_KEY
    #[serde(default = "default_api_key")]
    pub api_key: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    /// Bound on one `analyze` call, report and embedding together.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_report_chars")]
    pub max_report_chars: usize,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: default_provider(),
            api_key: default_api_key(),
            model: default_model(),
            embedding_model: default_embedding_model(),
            timeout_ms: default_timeout_ms(),
            max_report_chars: default_max_report_chars(),
        }
    }
}

impl AiConfig {
    pub fn normalize(&mut self) {
        self.provider = self.provider.trim().to_lowercase();
        if self.timeout_ms == 0 {
            self.timeout_ms = default_timeout_ms();
        }
        if self.max_report_chars == 0 {
            self.max_report_chars = default_max_report_chars();
        }
    }

    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.timeout_ms)
    }

    /// Resolve api key if "ENV"
    pub fn resolved_api_key(&self) -> anyhow::Result<String> {
        if !self.api_key.trim().eq_ignore_ascii_case("env") {
            return Ok(self.api_key.trim().to_string());
        }
        match self.provider.as_str() {
            "openai" => env::var("OPENAI_API_KEY")
                .map_err(|_| anyhow::anyhow!("Missing OPENAI_API_KEY env var")),
            other => anyhow::bail!("Unsupported provider in config: {other}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_gets_defaults() {
        let mut cfg: AiConfig =
            serde_json::from_str(r#"{"enabled":true,"provider":" OpenAI ","timeout_ms":0}"#).unwrap();
        cfg.normalize();
        assert!(cfg.enabled);
        assert_eq!(cfg.provider, "openai");
        assert_eq!(cfg.timeout_ms, 30_000);
        assert_eq!(cfg.embedding_model, "text-embedding-3-small");
    }

    #[test]
    fn literal_key_is_used_as_is() {
        let cfg = AiConfig {
            api_key: " sk-test ".into(),
            ..AiConfig::default()
        };
        assert_eq!(cfg.resolved_api_key().unwrap(), "sk-test");
    }
}

//! AI analysis boundary: turns an aggregate into report text plus an embedding.
//! The storage core only sees the `ReportAnalyzer` trait.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::ai::AiConfig;
use crate::error::AnalysisError;
use crate::ingest::AggregateResult;

/// Output of one analysis run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    pub report_text: String,
    pub embedding: Vec<f32>,
}

#[async_trait]
pub trait ReportAnalyzer: Send + Sync {
    async fn analyze(&self, aggregate: &AggregateResult) -> Result<Analysis, AnalysisError>;

    /// Embed free text with the same model used for reports (for semantic search queries).
    async fn embed(&self, text: &str) -> Result<Vec<f32>, AnalysisError>;

    /// Provider name for diagnostics/headers.
    fn provider_name(&self) -> &'static str;
}

pub type DynAnalyzer = Arc<dyn ReportAnalyzer>;

fn mock_mode() -> bool {
    ["FIRS_TEST_MODE", "AI_TEST_MODE"]
        .iter()
        .any(|v| std::env::var(v).map(|v| v == "mock").unwrap_or(false))
}

/// Factory: build an analyzer according to config and environment variables.
///
/// * If `FIRS_TEST_MODE=mock` or `AI_TEST_MODE=mock`, returns the deterministic mock.
/// * Else if `config.enabled==false`, returns a disabled analyzer.
/// * Else builds the real provider (OpenAI).
pub fn build_analyzer(config: &AiConfig, dimension: usize) -> DynAnalyzer {
    if mock_mode() {
        return Arc::new(MockAnalyzer::new(dimension));
    }
    if !config.enabled {
        return Arc::new(DisabledAnalyzer);
    }
    match config.provider.as_str() {
        "openai" => match OpenAiAnalyzer::new(config, dimension) {
            Ok(a) => Arc::new(a),
            Err(e) => {
                tracing::warn!(error = %e, "AI enabled but provider could not be built; analysis disabled");
                Arc::new(DisabledAnalyzer)
            }
        },
        other => {
            tracing::warn!(provider = other, "unsupported AI provider; analysis disabled");
            Arc::new(DisabledAnalyzer)
        }
    }
}

/// Used when AI is disabled; every call fails with `Disabled`.
pub struct DisabledAnalyzer;

#[async_trait]
impl ReportAnalyzer for DisabledAnalyzer {
    async fn analyze(&self, _aggregate: &AggregateResult) -> Result<Analysis, AnalysisError> {
        Err(AnalysisError::Disabled)
    }

    async fn embed(&self, _text: &str) -> Result<Vec<f32>, AnalysisError> {
        Err(AnalysisError::Disabled)
    }

    fn provider_name(&self) -> &'static str {
        "disabled"
    }
}

/// Deterministic analyzer for tests/local runs: templated report, hash-derived embedding.
#[derive(Debug, Clone)]
pub struct MockAnalyzer {
    dimension: usize,
    delay: Duration,
    calls: Arc<AtomicUsize>,
}

impl MockAnalyzer {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            delay: Duration::ZERO,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Number of `analyze` calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReportAnalyzer for MockAnalyzer {
    async fn analyze(&self, aggregate: &AggregateResult) -> Result<Analysis, AnalysisError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let report_text = render_summary(aggregate);
        let embedding = hash_embedding(&report_text, self.dimension);
        Ok(Analysis {
            report_text,
            embedding,
        })
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, AnalysisError> {
        Ok(hash_embedding(text, self.dimension))
    }

    fn provider_name(&self) -> &'static str {
        "mock"
    }
}

/// OpenAI provider (Chat Completions for the report, Embeddings for the vector).
pub struct OpenAiAnalyzer {
    http: reqwest::Client,
    api_key: String,
    model: String,
    embedding_model: String,
    dimension: usize,
    max_report_chars: usize,
}

impl OpenAiAnalyzer {
    pub fn new(config: &AiConfig, dimension: usize) -> anyhow::Result<Self> {
        let api_key = config.resolved_api_key()?;
        if api_key.is_empty() {
            anyhow::bail!("empty OpenAI API key");
        }
        let http = reqwest::Client::builder()
            .user_agent(concat!("firs/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(4))
            .timeout(config.timeout())
            .build()?;
        Ok(Self {
            http,
            api_key,
            model: config.model.clone(),
            embedding_model: config.embedding_model.clone(),
            dimension,
            max_report_chars: config.max_report_chars,
        })
    }

    async fn post<B: Serialize, R: for<'de> Deserialize<'de>>(
        &self,
        url: &str,
        body: &B,
    ) -> Result<R, AnalysisError> {
        let resp = self
            .http
            .post(url)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| AnalysisError::Provider(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(AnalysisError::Provider(format!("HTTP {status}")));
        }
        resp.json()
            .await
            .map_err(|e| AnalysisError::InvalidResponse(e.to_string()))
    }
}

#[derive(Serialize)]
struct Msg<'a> {
    role: &'a str,
    content: &'a str,
}
#[derive(Serialize)]
struct ChatReq<'a> {
    model: &'a str,
    messages: Vec<Msg<'a>>,
    temperature: f32,
    max_tokens: u32,
}
#[derive(Deserialize)]
struct ChatResp {
    choices: Vec<Choice>,
}
#[derive(Deserialize)]
struct Choice {
    message: ChoiceMsg,
}
#[derive(Deserialize)]
struct ChoiceMsg {
    content: String,
}
#[derive(Serialize)]
struct EmbedReq<'a> {
    model: &'a str,
    input: &'a str,
    dimensions: usize,
}
#[derive(Deserialize)]
struct EmbedResp {
    data: Vec<EmbedData>,
}
#[derive(Deserialize)]
struct EmbedData {
    embedding: Vec<f32>,
}

#[async_trait]
impl ReportAnalyzer for OpenAiAnalyzer {
    async fn analyze(&self, aggregate: &AggregateResult) -> Result<Analysis, AnalysisError> {
        let sys = "You are a financial research assistant. Write a concise, factual report on the \
                   subject using only the metrics given. Plain text, no markdown tables, no advice.";
        let user = render_summary(aggregate);
        let req = ChatReq {
            model: &self.model,
            messages: vec![
                Msg {
                    role: "system",
                    content: sys,
                },
                Msg {
                    role: "user",
                    content: &user,
                },
            ],
            temperature: 0.2,
            max_tokens: 700,
        };
        let body: ChatResp = self
            .post("https://api.openai.com/v1/chat/completions", &req)
            .await?;
        let content = body
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .unwrap_or("");
        let report_text = sanitize_report(content, self.max_report_chars);
        if report_text.is_empty() {
            return Err(AnalysisError::InvalidResponse("empty report".into()));
        }
        let embedding = self.embed(&report_text).await?;
        Ok(Analysis {
            report_text,
            embedding,
        })
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, AnalysisError> {
        let req = EmbedReq {
            model: &self.embedding_model,
            input: text,
            dimensions: self.dimension,
        };
        let body: EmbedResp = self.post("https://api.openai.com/v1/embeddings", &req).await?;
        let embedding = body
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| AnalysisError::InvalidResponse("no embedding returned".into()))?;
        if embedding.len() != self.dimension {
            return Err(AnalysisError::InvalidResponse(format!(
                "embedding has {} dimensions, expected {}",
                embedding.len(),
                self.dimension
            )));
        }
        Ok(embedding)
    }

    fn provider_name(&self) -> &'static str {
        "openai"
    }
}

/// Plain-text rendering of the merged view; the mock's report and the prompt body.
pub fn render_summary(aggregate: &AggregateResult) -> String {
    let mut out = format!("Financial snapshot for {}\n", aggregate.subject);
    for (name, value) in &aggregate.merged {
        let source = aggregate
            .provenance
            .get(name)
            .map(String::as_str)
            .unwrap_or("?");
        let _ = writeln!(out, "- {name}: {value} ({source})");
    }
    let failed: Vec<&str> = aggregate
        .failures()
        .map(|f| f.source_name.as_str())
        .collect();
    if !failed.is_empty() {
        let _ = writeln!(out, "Unavailable sources: {}", failed.join(", "));
    }
    out
}

/// Unit-length pseudo-embedding derived from SHA-256 of the text. Same text, same vector.
pub fn hash_embedding(text: &str, dimension: usize) -> Vec<f32> {
    let mut v = Vec::with_capacity(dimension);
    let mut block = 0u32;
    while v.len() < dimension {
        let mut h = Sha256::new();
        h.update(block.to_le_bytes());
        h.update(text.as_bytes());
        for chunk in h.finalize().chunks_exact(2) {
            if v.len() == dimension {
                break;
            }
            let raw = u16::from_le_bytes([chunk[0], chunk[1]]);
            v.push(f32::from(raw) / f32::from(u16::MAX) * 2.0 - 1.0);
        }
        block += 1;
    }
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v.iter_mut().for_each(|x| *x /= norm);
    }
    v
}

/// ASCII-only, control characters dropped (newlines kept), runs of spaces
/// collapsed, at most `max_chars` characters.
pub fn sanitize_report(input: &str, max_chars: usize) -> String {
    let mut out = String::with_capacity(input.len().min(max_chars));
    let mut prev_space = false;
    for ch in input.chars() {
        let c = match ch {
            '\n' => '\n',
            '\r' | '\t' => ' ',
            c if c.is_ascii() && !c.is_ascii_control() => c,
            _ => ' ',
        };
        if c == ' ' {
            if !prev_space && !out.is_empty() {
                out.push(' ');
            }
            prev_space = true;
        } else {
            out.push(c);
            prev_space = false;
        }
        if out.len() >= max_chars {
            break;
        }
    }
    out.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::types::{FinancialSnapshot, MetricValue};
    use crate::ingest::SourceOutcome;
    use std::collections::BTreeMap;

    fn aggregate() -> AggregateResult {
        let mut m = BTreeMap::new();
        m.insert("price".to_string(), MetricValue::Number(150.0));
        AggregateResult::from_outcomes(
            "AAPL",
            vec![SourceOutcome::Success(FinancialSnapshot::new("AAPL", "finnhub", m))],
        )
    }

    #[test]
    fn hash_embedding_is_deterministic_and_unit_length() {
        let a = hash_embedding("hello", 768);
        let b = hash_embedding("hello", 768);
        assert_eq!(a, b);
        assert_eq!(a.len(), 768);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
        assert_ne!(a, hash_embedding("hello!", 768));
    }

    #[test]
    fn sanitize_keeps_lines_and_caps_length() {
        let s = sanitize_report("Line one\t\tx\u{1F600}\nLine two", 1000);
        assert_eq!(s, "Line one x \nLine two");
        assert_eq!(sanitize_report(&"a".repeat(50), 10).len(), 10);
    }

    #[tokio::test]
    async fn mock_and_disabled() {
        let mock = MockAnalyzer::new(8);
        let out = mock.analyze(&aggregate()).await.unwrap();
        assert!(out.report_text.contains("price: 150 (finnhub)"));
        assert_eq!(out.embedding.len(), 8);

        let off = DisabledAnalyzer;
        assert!(matches!(
            off.analyze(&aggregate()).await,
            Err(AnalysisError::Disabled)
        ));
    }
}

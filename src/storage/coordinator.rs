//! Storage Coordinator: the one entry point that decides which tier answers a
//! request and which tiers get written afterwards.
//!
//! Built once at startup and passed around by reference (`Arc`); `teardown`
//! purges expired entries at shutdown.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::analyze::ai_adapter::render_summary;
use crate::analyze::{Analysis, ReportAnalyzer};
use crate::config::{self, AppConfig};
use crate::error::{AnalysisError, StorageError, StorageResult};
use crate::ingest::types::normalize_subject;
use crate::ingest::{AggregateResult, FetchOrchestrator, SourceRegistry, SourceSet};
use crate::storage::backend::{open_backend, MemoryBackend};
use crate::storage::cache::{CacheKey, CacheLookup, CacheTier, Origin, QueryShape};
use crate::storage::ephemeral::{ArtifactId, EphemeralStore};
use crate::storage::vector::{
    DocumentId, DocumentMetadata, IndexedDocument, LocalVectorStore, NewDocument, Similarity,
    VectorStore,
};

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub per_source_timeout: Duration,
    pub cache_ttl: Duration,
    pub report_ttl: Duration,
    pub ephemeral_ttl: Duration,
    pub analysis_timeout: Duration,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            per_source_timeout: Duration::from_secs(10),
            cache_ttl: Duration::from_secs(600),
            report_ttl: Duration::from_secs(600),
            ephemeral_ttl: Duration::from_secs(600),
            analysis_timeout: Duration::from_secs(30),
        }
    }
}

impl CoordinatorSettings {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            per_source_timeout: cfg.per_source_timeout(),
            cache_ttl: cfg.cache_ttl(),
            report_ttl: cfg.report_ttl(),
            ephemeral_ttl: cfg.ephemeral_ttl(),
            analysis_timeout: cfg.ai.timeout(),
        }
    }
}

/// Answer of `get_or_fetch`.
#[derive(Debug, Clone)]
pub struct Retrieved {
    pub aggregate: AggregateResult,
    pub origin: Origin,
    /// Raw provider payloads written to the Ephemeral Store by this call.
    pub raw_artifacts: Vec<ArtifactId>,
}

/// What `compile_report` caches under the `report` query shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledReport {
    pub subject: String,
    pub document_id: DocumentId,
    pub report_text: String,
    pub generated_at: DateTime<Utc>,
    pub analyzer: String,
    /// Sources that contributed data.
    pub sources: Vec<String>,
    pub partial: bool,
    pub draft_artifact: ArtifactId,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SemanticMatch {
    pub score: f32,
    pub document: IndexedDocument,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub cache_purged: usize,
    pub ephemeral_purged: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StorageStats {
    pub cache_entries: usize,
    pub ephemeral_artifacts: usize,
    pub vector_documents: usize,
    pub cache_medium: String,
    pub ephemeral_medium: String,
    pub vector_medium: String,
}

#[derive(Serialize)]
struct ReportDraft<'a> {
    subject: &'a str,
    analyzer: &'a str,
    report_text: &'a str,
    aggregate: &'a AggregateResult,
}

pub struct StorageCoordinator {
    registry: SourceRegistry,
    orchestrator: FetchOrchestrator,
    cache: CacheTier,
    ephemeral: EphemeralStore,
    vectors: Arc<dyn VectorStore>,
    settings: CoordinatorSettings,
}

impl StorageCoordinator {
    pub fn new(
        registry: SourceRegistry,
        orchestrator: FetchOrchestrator,
        cache: CacheTier,
        ephemeral: EphemeralStore,
        vectors: Arc<dyn VectorStore>,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            registry,
            orchestrator,
            cache,
            ephemeral,
            vectors,
            settings,
        }
    }

    /// All tiers in memory. Meant for tests and throwaway runs.
    pub async fn in_memory(
        registry: SourceRegistry,
        dimension: usize,
        settings: CoordinatorSettings,
    ) -> StorageResult<Self> {
        let vectors =
            LocalVectorStore::open(MemoryBackend::shared(), dimension, Similarity::Cosine).await?;
        Ok(Self::new(
            registry,
            FetchOrchestrator::new(10),
            CacheTier::new(MemoryBackend::shared(), settings.cache_ttl),
            EphemeralStore::new(MemoryBackend::shared(), settings.ephemeral_ttl),
            Arc::new(vectors),
            settings,
        ))
    }

    /// Build every tier from config and log where each one keeps its data.
    pub async fn from_config(cfg: &AppConfig) -> anyhow::Result<Self> {
        let registry = SourceRegistry::from_configs(&cfg.sources, config::test_mode())?;

        let cache_backend = open_backend(cfg.cache.dir.as_deref())
            .await
            .context("opening cache backend")?;
        let ephemeral_backend = open_backend(cfg.ephemeral.dir.as_deref())
            .await
            .context("opening ephemeral backend")?;
        let vector_backend = open_backend(cfg.vector.dir.as_deref())
            .await
            .context("opening vector backend")?;

        let cache = CacheTier::new(cache_backend, cfg.cache_ttl());
        let ephemeral = EphemeralStore::new(ephemeral_backend, cfg.ephemeral_ttl());
        let vectors = LocalVectorStore::open(vector_backend, cfg.vector.dimension, cfg.vector.metric)
            .await
            .context("opening vector collection")?;

        for (tier, medium) in [
            ("cache", cache.medium()),
            ("ephemeral", ephemeral.medium()),
            ("vector", vectors.medium()),
        ] {
            let durable = medium != "memory";
            tracing::info!(tier, medium = %medium, survives_restart = durable, "storage tier ready");
        }
        let enabled = registry.resolve();
        tracing::info!(sources = ?enabled.names(), max_in_flight = cfg.fetch.max_in_flight, "sources resolved");

        Ok(Self::new(
            registry,
            FetchOrchestrator::new(cfg.fetch.max_in_flight),
            cache,
            ephemeral,
            Arc::new(vectors),
            CoordinatorSettings::from_config(cfg),
        ))
    }

    pub fn settings(&self) -> &CoordinatorSettings {
        &self.settings
    }

    pub fn cache(&self) -> &CacheTier {
        &self.cache
    }

    pub fn ephemeral(&self) -> &EphemeralStore {
        &self.ephemeral
    }

    pub fn vectors(&self) -> &Arc<dyn VectorStore> {
        &self.vectors
    }

    fn subject(raw: &str) -> StorageResult<String> {
        normalize_subject(raw).ok_or_else(|| StorageError::InvalidSubject(raw.to_string()))
    }

    /// Cached aggregate when one is live, else a fresh one written back to the cache.
    ///
    /// `force_refresh` skips the cache read and source-level caches but still writes back.
    /// If every source fails, the caller gets `NoDataAvailable` unless a live entry exists
    /// to fall back on.
    pub async fn get_or_fetch(&self, subject: &str, force_refresh: bool) -> StorageResult<Retrieved> {
        let sources = self.registry.resolve();
        self.fetch_keyed(subject, force_refresh, &sources, QueryShape::Snapshot)
            .await
    }

    /// `get_or_fetch` against an explicit capability set.
    ///
    /// A set other than the configured one is cached under its own key, so its
    /// aggregate is never served to callers of a different set.
    pub async fn get_or_fetch_from(
        &self,
        subject: &str,
        force_refresh: bool,
        sources: &SourceSet,
    ) -> StorageResult<Retrieved> {
        let shape = self.snapshot_shape(sources);
        self.fetch_keyed(subject, force_refresh, sources, shape).await
    }

    fn snapshot_shape(&self, sources: &SourceSet) -> QueryShape {
        let configured = self.registry.resolve();
        let names = sources.names();
        if names == configured.names() {
            QueryShape::Snapshot
        } else {
            QueryShape::Custom(format!("snapshot:{}", names.join(",")))
        }
    }

    async fn fetch_keyed(
        &self,
        subject: &str,
        force_refresh: bool,
        sources: &SourceSet,
        shape: QueryShape,
    ) -> StorageResult<Retrieved> {
        let subject = Self::subject(subject)?;
        let key = CacheKey::new(&subject, &shape);
        let ttl = self.settings.cache_ttl;
        let timeout = self.settings.per_source_timeout;

        let subj = subject.as_str();

        let (aggregate, origin) = if force_refresh {
            self.cache
                .refresh_with(&key, ttl, move |current: Option<AggregateResult>| async move {
                    let fresh = self.orchestrator.aggregate_fresh(subj, sources, timeout).await;
                    if !fresh.all_failed() {
                        return Ok((fresh, true));
                    }
                    match current {
                        Some(prev) => {
                            tracing::warn!(
                                subject = subj,
                                "forced refresh failed on every source; serving cached entry"
                            );
                            Ok((prev, false))
                        }
                        None => Err(no_data(&fresh)),
                    }
                })
                .await?
        } else {
            self.cache
                .get_or_compute(&key, ttl, move || async move {
                    let fresh = self.orchestrator.aggregate(subj, sources, timeout).await;
                    if fresh.all_failed() {
                        Err(no_data(&fresh))
                    } else {
                        Ok(fresh)
                    }
                })
                .await?
        };

        let raw_artifacts = if origin == Origin::Fresh {
            self.capture_raw(&aggregate).await?
        } else {
            Vec::new()
        };
        tracing::info!(
            subject = %subject,
            origin = ?origin,
            partial = aggregate.is_partial(),
            raw = raw_artifacts.len(),
            "get_or_fetch"
        );
        Ok(Retrieved {
            aggregate,
            origin,
            raw_artifacts,
        })
    }

    async fn capture_raw(&self, aggregate: &AggregateResult) -> StorageResult<Vec<ArtifactId>> {
        let mut ids = Vec::new();
        for snap in aggregate.outcomes.iter().filter_map(|o| o.snapshot()) {
            if let Some(raw) = &snap.raw {
                let key = format!("raw/{}/{}", aggregate.subject, snap.source);
                ids.push(
                    self.ephemeral
                        .store_json(&key, raw, self.settings.ephemeral_ttl)
                        .await?,
                );
            }
        }
        Ok(ids)
    }

    /// Index a finished report. The embedding must match the collection's dimension.
    pub async fn persist_report(
        &self,
        subject: &str,
        report_text: &str,
        embedding: Vec<f32>,
    ) -> StorageResult<DocumentId> {
        let subject = Self::subject(subject)?;
        let doc = NewDocument {
            payload: report_text.to_string(),
            metadata: DocumentMetadata::for_subject(&subject),
        };
        let id = self.vectors.index(doc, embedding).await?;
        tracing::info!(subject = %subject, document = %id, "report persisted");
        Ok(id)
    }

    pub async fn semantic_search(
        &self,
        query_embedding: &[f32],
        top_k: usize,
    ) -> StorageResult<Vec<SemanticMatch>> {
        self.semantic_search_filtered(query_embedding, top_k, None).await
    }

    /// Matches with their documents, best first. Documents deleted mid-search are skipped.
    pub async fn semantic_search_filtered(
        &self,
        query_embedding: &[f32],
        top_k: usize,
        subject: Option<&str>,
    ) -> StorageResult<Vec<SemanticMatch>> {
        let subject = subject.map(Self::subject).transpose()?;
        let hits = self
            .vectors
            .search_filtered(query_embedding, top_k, subject.as_deref())
            .await?;
        let mut out = Vec::with_capacity(hits.len());
        for hit in hits {
            match self.vectors.fetch(&hit.id).await {
                Ok(document) => out.push(SemanticMatch {
                    score: hit.score,
                    document,
                }),
                Err(StorageError::DocumentNotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    /// Fetch, analyze, keep the draft, index it, cache the result.
    /// A cached report is returned as-is unless `force_refresh`.
    pub async fn compile_report(
        &self,
        subject: &str,
        force_refresh: bool,
        analyzer: &dyn ReportAnalyzer,
    ) -> StorageResult<(CompiledReport, Origin)> {
        let subject = Self::subject(subject)?;
        let key = CacheKey::new(&subject, &QueryShape::Report);
        let ttl = self.settings.report_ttl;
        let subj = subject.as_str();
        if force_refresh {
            self.cache
                .refresh_with(&key, ttl, move |_: Option<CompiledReport>| async move {
                    Ok((self.build_report(subj, true, analyzer).await?, true))
                })
                .await
        } else {
            self.cache
                .get_or_compute(&key, ttl, move || self.build_report(subj, false, analyzer))
                .await
        }
    }

    async fn build_report(
        &self,
        subject: &str,
        force_refresh: bool,
        analyzer: &dyn ReportAnalyzer,
    ) -> StorageResult<CompiledReport> {
        let retrieved = self.get_or_fetch(subject, force_refresh).await?;
        let aggregate = &retrieved.aggregate;

        let analysis = self.analyze_cached(subject, aggregate, analyzer).await?;

        let draft = ReportDraft {
            subject,
            analyzer: analyzer.provider_name(),
            report_text: &analysis.report_text,
            aggregate,
        };
        let draft_artifact = self
            .ephemeral
            .store_json(&format!("draft/{subject}"), &draft, self.settings.ephemeral_ttl)
            .await?;

        let document_id = self
            .persist_report(subject, &analysis.report_text, analysis.embedding)
            .await?;

        Ok(CompiledReport {
            subject: subject.to_string(),
            document_id,
            report_text: analysis.report_text,
            generated_at: Utc::now(),
            analyzer: analyzer.provider_name().to_string(),
            sources: aggregate
                .outcomes
                .iter()
                .filter_map(|o| o.snapshot())
                .filter(|s| s.valid)
                .map(|s| s.source.clone())
                .collect(),
            partial: aggregate.is_partial(),
            draft_artifact,
        })
    }

    /// Analyzer output cached by a hash of the rendered prompt, so identical data is
    /// analyzed once per report TTL even across forced refreshes.
    async fn analyze_cached(
        &self,
        subject: &str,
        aggregate: &AggregateResult,
        analyzer: &dyn ReportAnalyzer,
    ) -> StorageResult<Analysis> {
        let prompt = render_summary(aggregate);
        let digest = Sha256::digest(prompt.as_bytes());
        let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
        let shape = QueryShape::Custom(format!("analysis:{}:{hex}", analyzer.provider_name()));
        let key = CacheKey::new(subject, &shape);
        let timeout = self.settings.analysis_timeout;

        let (analysis, origin) = self
            .cache
            .get_or_compute(&key, self.settings.report_ttl, move || async move {
                let out = tokio::time::timeout(timeout, analyzer.analyze(aggregate))
                    .await
                    .map_err(|_| AnalysisError::Timeout {
                        timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    })??;
                Ok::<_, StorageError>(out)
            })
            .await?;
        tracing::debug!(subject, origin = ?origin, analyzer = analyzer.provider_name(), "analysis");
        Ok(analysis)
    }

    pub async fn cached_report(&self, subject: &str) -> StorageResult<Option<CompiledReport>> {
        let subject = Self::subject(subject)?;
        let key = CacheKey::new(&subject, &QueryShape::Report);
        Ok(match self.cache.get(&key).await? {
            CacheLookup::Hit(r) => Some(r),
            CacheLookup::Miss => None,
        })
    }

    pub async fn fetch_document(&self, id: &DocumentId) -> StorageResult<IndexedDocument> {
        self.vectors.fetch(id).await
    }

    pub async fn delete_document(&self, id: &DocumentId) -> StorageResult<bool> {
        self.vectors.delete(id).await
    }

    pub async fn delete_subject(&self, subject: &str) -> StorageResult<usize> {
        let subject = Self::subject(subject)?;
        self.vectors.delete_subject(&subject).await
    }

    /// Drop the cached snapshot and report for one subject.
    pub async fn invalidate(&self, subject: &str) -> StorageResult<bool> {
        let subject = Self::subject(subject)?;
        let a = self
            .cache
            .invalidate(&CacheKey::new(&subject, &QueryShape::Snapshot))
            .await?;
        let b = self
            .cache
            .invalidate(&CacheKey::new(&subject, &QueryShape::Report))
            .await?;
        Ok(a || b)
    }

    pub async fn cleanup_expired(&self) -> StorageResult<CleanupReport> {
        let cache_purged = self.cache.purge_expired().await?;
        let ephemeral_purged = self.ephemeral.purge_expired().await?;
        Ok(CleanupReport {
            cache_purged,
            ephemeral_purged,
        })
    }

    pub async fn clear_cache(&self) -> StorageResult<usize> {
        let removed = self.cache.clear().await?;
        tracing::info!(removed, "cache cleared");
        Ok(removed)
    }

    pub async fn stats(&self) -> StorageResult<StorageStats> {
        Ok(StorageStats {
            cache_entries: self.cache.entry_count().await?,
            ephemeral_artifacts: self.ephemeral.artifact_count().await?,
            vector_documents: self.vectors.len().await?,
            cache_medium: self.cache.medium(),
            ephemeral_medium: self.ephemeral.medium(),
            vector_medium: self.vectors.medium(),
        })
    }

    /// Shutdown hook: purge what has expired. Durable tiers keep their live entries.
    pub async fn teardown(&self) -> StorageResult<CleanupReport> {
        let report = self.cleanup_expired().await?;
        tracing::info!(
            cache_purged = report.cache_purged,
            ephemeral_purged = report.ephemeral_purged,
            "storage coordinator torn down"
        );
        Ok(report)
    }
}

fn no_data(aggregate: &AggregateResult) -> StorageError {
    StorageError::NoDataAvailable {
        subject: aggregate.subject.clone(),
        failures: aggregate.failures().cloned().collect(),
    }
}

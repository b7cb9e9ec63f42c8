//! Vector Store: documents indexed by a precomputed embedding.
//!
//! `LocalVectorStore` keeps the whole collection in memory and persists every
//! document through a `KvBackend`, so a file backend makes it durable. Search
//! is exhaustive, which is fine for the report volumes this serves.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::{describe_gauge, gauge};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{StorageError, StorageResult};
use crate::storage::backend::DynBackend;
use crate::storage::record::{schema, Record};

const META_KEY: &str = "vec.collection";
const DOC_PREFIX: &str = "vec.doc.";

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_gauge!("firs_vector_documents", "Documents in the vector collection.");
    });
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(Uuid);

impl DocumentId {
    fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    fn storage_key(&self) -> String {
        format!("{DOC_PREFIX}{}", self.0.simple())
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DocumentId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Scoring function. Higher score always means more similar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Similarity {
    #[default]
    Cosine,
    Dot,
    /// Scored as `1 / (1 + distance)`.
    Euclidean,
}

impl Similarity {
    pub fn score(&self, a: &[f32], b: &[f32]) -> f32 {
        let s = match self {
            Similarity::Cosine => {
                let (dot, na, nb) = a
                    .iter()
                    .zip(b)
                    .fold((0.0f32, 0.0f32, 0.0f32), |(d, x, y), (p, q)| {
                        (d + p * q, x + p * p, y + q * q)
                    });
                if na == 0.0 || nb == 0.0 {
                    0.0
                } else {
                    dot / (na.sqrt() * nb.sqrt())
                }
            }
            Similarity::Dot => a.iter().zip(b).map(|(p, q)| p * q).sum(),
            Similarity::Euclidean => {
                let d = a
                    .iter()
                    .zip(b)
                    .map(|(p, q)| (p - q) * (p - q))
                    .sum::<f32>()
                    .sqrt();
                1.0 / (1.0 + d)
            }
        };
        if s.is_nan() {
            f32::MIN
        } else {
            s
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub subject: String,
    pub generated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

impl DocumentMetadata {
    pub fn for_subject(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            generated_at: Utc::now(),
            extra: BTreeMap::new(),
        }
    }
}

/// A document before it has an id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewDocument {
    pub payload: String,
    pub metadata: DocumentMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexedDocument {
    pub id: DocumentId,
    pub embedding: Vec<f32>,
    pub payload: String,
    pub metadata: DocumentMetadata,
    /// Insertion sequence; breaks score ties.
    #[serde(default)]
    pub seq: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SearchMatch {
    pub id: DocumentId,
    pub score: f32,
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Atomic: on success the document is visible to `search`/`fetch`, on error it is not.
    async fn index(&self, document: NewDocument, embedding: Vec<f32>) -> StorageResult<DocumentId>;

    /// Best `top_k` matches, score descending, ties in insertion order.
    async fn search(&self, query: &[f32], top_k: usize) -> StorageResult<Vec<SearchMatch>> {
        self.search_filtered(query, top_k, None).await
    }

    /// Like `search`, restricted to one subject when `subject` is set.
    async fn search_filtered(
        &self,
        query: &[f32],
        top_k: usize,
        subject: Option<&str>,
    ) -> StorageResult<Vec<SearchMatch>>;

    async fn fetch(&self, id: &DocumentId) -> StorageResult<IndexedDocument>;

    /// Returns whether the document existed.
    async fn delete(&self, id: &DocumentId) -> StorageResult<bool>;

    async fn delete_subject(&self, subject: &str) -> StorageResult<usize>;

    async fn len(&self) -> StorageResult<usize>;

    fn dimension(&self) -> usize;

    /// Where the collection lives, for logs and stats.
    fn medium(&self) -> String;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CollectionMeta {
    dimension: usize,
    similarity: Similarity,
}

#[derive(Default)]
struct Collection {
    docs: BTreeMap<DocumentId, IndexedDocument>,
    next_seq: u64,
}

pub struct LocalVectorStore {
    backend: DynBackend,
    dimension: usize,
    similarity: Similarity,
    inner: RwLock<Collection>,
}

impl LocalVectorStore {
    /// Open (or create) the collection stored in `backend`.
    ///
    /// An existing collection keeps its dimension and metric; asking for another one is an error.
    pub async fn open(
        backend: DynBackend,
        dimension: usize,
        similarity: Similarity,
    ) -> StorageResult<Self> {
        ensure_metrics_described();
        let meta = match backend.read(META_KEY).await? {
            Some(bytes) => {
                let rec: Record<CollectionMeta> = Record::decode(schema::VECTOR_COLLECTION, &bytes)?;
                if rec.body.dimension != dimension {
                    return Err(StorageError::EmbeddingDimensionMismatch {
                        expected: rec.body.dimension,
                        actual: dimension,
                    });
                }
                if rec.body.similarity != similarity {
                    return Err(StorageError::SimilarityMismatch {
                        stored: rec.body.similarity,
                        requested: similarity,
                    });
                }
                rec.body
            }
            None => {
                let meta = CollectionMeta {
                    dimension,
                    similarity,
                };
                let rec = Record::new(schema::VECTOR_COLLECTION, &meta, None);
                backend.write(META_KEY, &rec.encode()?).await?;
                meta
            }
        };

        let mut coll = Collection::default();
        for key in backend.keys().await? {
            if !key.starts_with(DOC_PREFIX) {
                continue;
            }
            let Some(bytes) = backend.read(&key).await? else {
                continue;
            };
            let rec: Record<IndexedDocument> = Record::decode(schema::INDEXED_DOCUMENT, &bytes)?;
            let doc = rec.body;
            coll.next_seq = coll.next_seq.max(doc.seq + 1);
            coll.docs.insert(doc.id, doc);
        }
        gauge!("firs_vector_documents").set(coll.docs.len() as f64);
        tracing::info!(
            medium = %backend.describe(),
            dimension = meta.dimension,
            documents = coll.docs.len(),
            "vector collection opened"
        );

        Ok(Self {
            backend,
            dimension: meta.dimension,
            similarity: meta.similarity,
            inner: RwLock::new(coll),
        })
    }

    pub fn similarity(&self) -> Similarity {
        self.similarity
    }

    fn check_dimension(&self, v: &[f32]) -> StorageResult<()> {
        if v.len() == self.dimension {
            Ok(())
        } else {
            Err(StorageError::EmbeddingDimensionMismatch {
                expected: self.dimension,
                actual: v.len(),
            })
        }
    }
}

#[async_trait]
impl VectorStore for LocalVectorStore {
    async fn index(&self, document: NewDocument, embedding: Vec<f32>) -> StorageResult<DocumentId> {
        self.check_dimension(&embedding)?;
        let mut coll = self.inner.write().await;
        let doc = IndexedDocument {
            id: DocumentId::generate(),
            embedding,
            payload: document.payload,
            metadata: document.metadata,
            seq: coll.next_seq,
        };
        let rec = Record::new(schema::INDEXED_DOCUMENT, &doc, None);
        // Persist first; memory only changes once the backend accepted it.
        self.backend.write(&doc.id.storage_key(), &rec.encode()?).await?;
        let id = doc.id;
        coll.next_seq += 1;
        tracing::debug!(document = %id, subject = %doc.metadata.subject, "document indexed");
        coll.docs.insert(id, doc);
        gauge!("firs_vector_documents").set(coll.docs.len() as f64);
        Ok(id)
    }

    async fn search_filtered(
        &self,
        query: &[f32],
        top_k: usize,
        subject: Option<&str>,
    ) -> StorageResult<Vec<SearchMatch>> {
        let coll = self.inner.read().await;
        if coll.docs.is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }
        self.check_dimension(query)?;

        let mut scored: Vec<(f32, u64, DocumentId)> = coll
            .docs
            .values()
            .filter(|d| subject.map_or(true, |s| d.metadata.subject.eq_ignore_ascii_case(s)))
            .map(|d| (self.similarity.score(query, &d.embedding), d.seq, d.id))
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));
        scored.truncate(top_k);
        Ok(scored
            .into_iter()
            .map(|(score, _, id)| SearchMatch { id, score })
            .collect())
    }

    async fn fetch(&self, id: &DocumentId) -> StorageResult<IndexedDocument> {
        self.inner
            .read()
            .await
            .docs
            .get(id)
            .cloned()
            .ok_or(StorageError::DocumentNotFound(*id))
    }

    async fn delete(&self, id: &DocumentId) -> StorageResult<bool> {
        let mut coll = self.inner.write().await;
        if !coll.docs.contains_key(id) {
            return Ok(false);
        }
        self.backend.remove(&id.storage_key()).await?;
        coll.docs.remove(id);
        gauge!("firs_vector_documents").set(coll.docs.len() as f64);
        Ok(true)
    }

    async fn delete_subject(&self, subject: &str) -> StorageResult<usize> {
        let mut coll = self.inner.write().await;
        let ids: Vec<DocumentId> = coll
            .docs
            .values()
            .filter(|d| d.metadata.subject.eq_ignore_ascii_case(subject))
            .map(|d| d.id)
            .collect();
        for id in &ids {
            self.backend.remove(&id.storage_key()).await?;
            coll.docs.remove(id);
        }
        gauge!("firs_vector_documents").set(coll.docs.len() as f64);
        tracing::info!(subject, removed = ids.len(), "documents deleted for subject");
        Ok(ids.len())
    }

    async fn len(&self) -> StorageResult<usize> {
        Ok(self.inner.read().await.docs.len())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn medium(&self) -> String {
        self.backend.describe()
    }
}

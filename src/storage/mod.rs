//! Storage tiers and the coordinator in front of them.
//!
//! | tier | medium | lifetime |
//! |---|---|---|
//! | Cache Tier | `MemoryBackend` or `FileBackend` | per-entry TTL |
//! | Ephemeral Store | `MemoryBackend` or `FileBackend` | per-artifact TTL, tombstone after purge |
//! | Vector Store | `LocalVectorStore` over either backend | until deleted |
//!
//! With a memory backend a tier lives as long as the process; with a file
//! backend it survives restarts (TTLs still apply, measured from `created_at`).

pub mod backend;
pub mod cache;
pub mod coordinator;
pub mod ephemeral;
pub mod record;
pub mod vector;

pub use backend::{FileBackend, KvBackend, MemoryBackend};
pub use cache::{CacheKey, CacheLookup, CacheTier, Origin, QueryShape};
pub use coordinator::{
    CleanupReport, CompiledReport, CoordinatorSettings, Retrieved, SemanticMatch, StorageCoordinator,
    StorageStats,
};
pub use ephemeral::{Artifact, ArtifactId, EphemeralStore};
pub use vector::{
    DocumentId, DocumentMetadata, IndexedDocument, LocalVectorStore, NewDocument, SearchMatch,
    Similarity, VectorStore,
};

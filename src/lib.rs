// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod analyze;
pub mod api;
pub mod config;
pub mod error;
pub mod ingest;
pub mod metrics;
pub mod storage;

use std::sync::Arc;

pub use crate::api::{router, AppState};
pub use crate::error::{SourceFailure, StorageError};
pub use crate::storage::StorageCoordinator;

use crate::analyze::build_analyzer;
use crate::config::AppConfig;

/// Build the full application from config: tiers, sources, analyzer, router.
///
/// Returns the coordinator too so the caller can run `teardown` on shutdown.
pub async fn build_app(cfg: &AppConfig) -> anyhow::Result<(axum::Router, Arc<StorageCoordinator>)> {
    let coordinator = Arc::new(StorageCoordinator::from_config(cfg).await?);
    let analyzer = build_analyzer(&cfg.ai, cfg.vector.dimension);
    tracing::info!(
        analyzer = analyzer.provider_name(),
        dimension = cfg.vector.dimension,
        "analyzer ready"
    );
    let app = router(AppState::new(coordinator.clone(), analyzer));
    Ok((app, coordinator))
}

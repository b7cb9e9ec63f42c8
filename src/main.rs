//! Financial data service: binary entrypoint.
//! Loads config, builds the storage tiers and serves the Axum router on Shuttle.

use firs::config::AppConfig;
use shuttle_axum::ShuttleAxum;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Logs go through `RUST_LOG` (default `firs=info,warn`).
/// `FIRS_LOG_JSON=1` switches to JSON lines.
fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("firs=info,warn"));
    let json = std::env::var("FIRS_LOG_JSON").is_ok_and(|v| v == "1");

    let registry = tracing_subscriber::registry().with(filter);
    // The runtime may already have installed a subscriber; keep it if so.
    let _ = if json {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer().compact()).try_init()
    };
}

#[shuttle_runtime::main]
async fn axum() -> ShuttleAxum {
    // Load .env in local/dev; no-op in prod environments.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cfg = AppConfig::load_default()?;
    let (router, coordinator) = firs::build_app(&cfg).await?;

    // Purge expired entries on Ctrl-C; durable tiers keep their live data.
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            if let Err(e) = coordinator.teardown().await {
                tracing::warn!(error = %e, "teardown failed");
            }
        }
    });

    Ok(router.into())
}

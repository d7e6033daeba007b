//! qhub server binary entry point.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use qhub::config::{HubConfig, IdempotencyKeyMode};
use qhub::hub::QuantumHub;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use qhub_server::{create_router, AppState};

const DEFAULT_BIND: &str = "127.0.0.1:8000";

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "qhub=info,qhub_server=info,tower_http=info".into());
    let json = std::env::var("QHUB_LOG_JSON").is_ok_and(|v| v == "1" || v == "true");

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Loads `QHUB_CONFIG` if set, then applies the other `QHUB_*` overrides.
fn load_config() -> anyhow::Result<HubConfig> {
    let idempotency = std::env::var("QHUB_IDEMPOTENCY")
        .ok()
        .map(|mode| {
            mode.parse::<IdempotencyKeyMode>()
                .map_err(|e| anyhow::anyhow!("Invalid QHUB_IDEMPOTENCY '{mode}': {e}"))
        })
        .transpose()?;

    let mut config = match std::env::var("QHUB_CONFIG") {
        Ok(path) => HubConfig::from_json_file(&path)
            .with_context(|| format!("Failed to load config from {path}"))?,
        Err(_) => {
            let mode = idempotency.context(
                "QHUB_IDEMPOTENCY (exact_bytes | semantic) is required when QHUB_CONFIG is not set",
            )?;
            HubConfig::new(PathBuf::from("./projects"), mode)
        }
    };

    if let Some(mode) = idempotency {
        config.pipeline.idempotency_key_mode = mode;
    }
    if let Ok(dir) = std::env::var("QHUB_WORKSPACE_DIR") {
        config.workspace_root = PathBuf::from(dir);
    }
    if let Ok(host) = std::env::var("QHUB_IDE_HOST") {
        config.session.ide_host = host;
    }
    if let Ok(port) = std::env::var("QHUB_IDE_PORT") {
        config.session.ide_port = port
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid QHUB_IDE_PORT '{port}': {e}"))?;
    }
    if let Ok(tokens) = std::env::var("QHUB_AUTH_TOKENS") {
        config.auth_tokens.extend(
            tokens
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(String::from),
        );
    }
    Ok(config)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let bind = std::env::var("QHUB_BIND").unwrap_or_else(|_| DEFAULT_BIND.to_string());
    let bind_addr: SocketAddr = bind
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid QHUB_BIND address '{bind}': {e}"))?;

    let config = load_config()?;
    tokio::fs::create_dir_all(&config.workspace_root)
        .await
        .with_context(|| format!("Failed to create {}", config.workspace_root.display()))?;
    if config.auth_tokens.is_empty() {
        tracing::warn!("No auth tokens configured; every request will be rejected");
    }

    let hub = Arc::new(QuantumHub::from_config(config).await?);
    let app = create_router(Arc::new(AppState::new(hub.clone())));

    tracing::info!("Starting qhub server at http://{}", bind_addr);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    hub.shutdown().await;
    Ok(())
}

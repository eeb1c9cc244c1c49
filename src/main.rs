//! # GhostWire server entrypoint
//!
//! Boots tracing, loads configuration, opens the Row Store (running migrations),
//! restores or warm-rebuilds the ANN Index, wires the Embedder/Generator gateways and
//! the RAG Orchestrator into an `axum` HTTP server, and serves until a shutdown signal
//! arrives — snapshotting the ANN Index before exiting.

use anyhow::{Context, Result};
use ghostwire::ann::AnnIndex;
use ghostwire::config::{self, GhostWireConfig, LogFormat};
use ghostwire::embedder::EmbedderGateway;
use ghostwire::generator::GeneratorGateway;
use ghostwire::http::{self, state::AppState};
use ghostwire::rag::RagOrchestrator;
use ghostwire::store::{self, DbPool};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let runtime = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
    runtime.block_on(run())
}

/// Path of the config file: `GHOSTWIRE_CONFIG_PATH` if set, else `config.yaml` in the
/// current working directory.
fn determine_config_path() -> PathBuf {
    env::var("GHOSTWIRE_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config.yaml"))
}

/// Path of the ANN Index's on-disk snapshot, derived from the configured database
/// path (sibling file, same stem, `.ann` extension).
fn ann_snapshot_path(config: &GhostWireConfig) -> PathBuf {
    let mut path = PathBuf::from(&config.db_path);
    path.set_extension("ann");
    path
}

fn initialize_tracing(config: &GhostWireConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    match config.log_format {
        LogFormat::Json => subscriber.json().init(),
        LogFormat::Plain => subscriber.init(),
    }
}

async fn run() -> Result<()> {
    let config_path = determine_config_path();
    let config = config::load_config(
        config_path
            .to_str()
            .context("config path is not valid UTF-8")?,
    )
    .map_err(|e| anyhow::anyhow!("failed to load config at {}: {e}", config_path.display()))?;

    initialize_tracing(&config);
    info!(host = %config.host, port = config.port, db_path = %config.db_path, "starting ghostwire");

    let pool: DbPool =
        store::establish_pool(&config.db_path).context("failed to open row store")?;

    let ann = Arc::new(AnnIndex::new(config.dim));
    let snapshot_path = ann_snapshot_path(&config);
    match ann.restore(&snapshot_path) {
        Ok(()) => info!(path = %snapshot_path.display(), size = ann.size(), "restored ann index from snapshot"),
        Err(e) => {
            warn!(error = %e, "no usable ann snapshot, warm-rebuilding from row store");
            let mut conn = pool
                .get()
                .context("failed to get a row store connection for warm rebuild")?;
            let rows = store::all_embeddings(&mut conn)
                .context("failed to scan row store for warm rebuild")?;
            let total_rows = rows.len();
            let entries: Vec<(i32, Vec<f32>)> = rows
                .into_iter()
                .filter_map(|(id, blob)| store::decode_embedding(&blob).map(|v| (id, v)))
                .filter(|(id, v)| {
                    let matches = v.len() == config.dim;
                    if !matches {
                        warn!(id, found_dim = v.len(), expected_dim = config.dim, "skipping dimension-mismatched row during ann warm rebuild");
                    }
                    matches
                })
                .collect();
            let count = entries.len();
            if count < total_rows {
                warn!(skipped = total_rows - count, total = total_rows, "some rows were skipped during ann warm rebuild due to dimension mismatch");
            }
            ann.warm_rebuild(entries)
                .context("failed to warm-rebuild ann index")?;
            info!(size = count, "warm-rebuilt ann index from row store");
        }
    }

    let embedder_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .context("failed to build embedder http client")?;
    let embedder = Arc::new(EmbedderGateway::new(
        embedder_client,
        config.local_gen_url.clone(),
        config.embed_models.clone(),
        config.dim,
    ));
    // Generation is long-running by nature (token-by-token streaming) and is
    // deliberately left without a client-wide timeout.
    let generator_client = reqwest::Client::new();
    let generator = Arc::new(GeneratorGateway::new(
        generator_client,
        config.local_gen_url.clone(),
        config.remote_gen_url.clone(),
        config.default_model.clone(),
    ));

    let orchestrator = Arc::new(RagOrchestrator::new(
        pool,
        ann.clone(),
        embedder,
        generator,
        config.clone(),
    ));

    let app = http::build_router(AppState::new(orchestrator));

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    if let Err(e) = ann.snapshot(&snapshot_path) {
        warn!(error = %e, "failed to snapshot ann index on shutdown");
    } else {
        info!(path = %snapshot_path.display(), "snapshotted ann index on shutdown");
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install sigterm handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

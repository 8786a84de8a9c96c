use crate::config::Config;
use crate::finalize::Finalizer;
use crate::streaming;
use anyhow::{Context, Result};
use axum::{
    http::{header, Method, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use reelforge_upload::{
    start_reaper_task, ChunkIngestor, ChunkStore, FsChunkStore, MergeEngine, UploadRegistry,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

mod error;
pub mod routes_upload;

pub use error::AppError;

/// Shared application context
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<Config>,
    /// In-flight upload sessions
    pub registry: UploadRegistry,
    /// Scratch storage for chunk blobs
    pub store: Arc<dyn ChunkStore>,
    pub ingestor: ChunkIngestor,
    pub merger: MergeEngine,
    /// Conversion and publishing after a merge
    pub finalizer: Arc<Finalizer>,
}

impl AppContext {
    /// Wire the upload engine from configuration. Touches no files.
    pub fn new(config: Config) -> Self {
        let registry = UploadRegistry::new(config.upload.idle_timeout());
        let store: Arc<dyn ChunkStore> = Arc::new(FsChunkStore::new(
            &config.storage.chunk_dir,
            config.upload.max_chunk_bytes,
            config.storage.fsync,
        ));
        let ingestor = ChunkIngestor::new(
            registry.clone(),
            store.clone(),
            config.upload.max_total_chunks,
        );
        let merger = MergeEngine::new(
            registry.clone(),
            store.clone(),
            &config.storage.artifact_dir,
            config.storage.fsync,
        );
        let finalizer = Arc::new(Finalizer::from_config(&config));

        Self {
            config: Arc::new(config),
            registry,
            store,
            ingestor,
            merger,
            finalizer,
        }
    }

    /// Replace the conversion/publishing collaborators.
    pub fn with_finalizer(mut self, finalizer: Finalizer) -> Self {
        self.finalizer = Arc::new(finalizer);
        self
    }

    /// Create storage directories and clear what a previous run left behind.
    ///
    /// Upload progress is not persisted, so partial chunk sets and interrupted
    /// merges from before a restart are discarded; clients start over from
    /// chunk 0.
    pub async fn prepare_storage(&self) -> Result<()> {
        let chunk_dir = &self.config.storage.chunk_dir;
        let purged = FsChunkStore::new(chunk_dir, self.config.upload.max_chunk_bytes, false)
            .purge_stale()
            .await
            .with_context(|| format!("Failed to prepare chunk directory {:?}", chunk_dir))?;

        let recovered = self.merger.recover().await.with_context(|| {
            format!(
                "Failed to prepare artifact directory {:?}",
                self.merger.artifact_dir()
            )
        })?;

        tracing::debug!(purged, recovered, "Storage ready");
        Ok(())
    }
}

/// Create the Axum router with all routes
pub fn create_router(ctx: AppContext) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE, header::RANGE])
        .expose_headers([
            header::CONTENT_RANGE,
            header::ACCEPT_RANGES,
            header::CONTENT_LENGTH,
        ]);

    Router::new()
        // Health check
        .route("/health", get(health_check))
        .nest(
            "/api",
            routes_upload::upload_routes(ctx.config.upload.max_chunk_bytes),
        )
        .nest(crate::finalize::PLAYBACK_PREFIX, streaming::play_router())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

async fn health_check() -> impl IntoResponse {
    StatusCode::OK
}

/// Start the HTTP server
pub async fn start_server(config: Config) -> Result<()> {
    start_server_with_context(AppContext::new(config)).await
}

/// Start the HTTP server around a prepared context
pub async fn start_server_with_context(ctx: AppContext) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", ctx.config.server.host, ctx.config.server.port)
        .parse()
        .context("Invalid server address")?;

    ctx.prepare_storage().await?;

    let reaper = start_reaper_task(
        ctx.registry.clone(),
        ctx.store.clone(),
        ctx.config.upload.reap_interval(),
    );

    let app = create_router(ctx);

    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    reaper.abort();
    tracing::info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => {}
            Err(e) => {
                tracing::error!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}

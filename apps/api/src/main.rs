mod admission;
mod config;
mod db;
mod errors;
mod generation;
mod grid;
mod models;
mod orchestrator;
mod profile;
mod queue;
mod quota;
mod routes;
mod state;
mod store;

use anyhow::Result;
use aws_config::Region;
use aws_sdk_s3::config::Credentials;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::admission::AdmissionController;
use crate::config::{Config, S3Config};
use crate::db::{create_pool, ensure_schema};
use crate::generation::client::GenerationClient;
use crate::generation::gemini::GeminiClient;
use crate::generation::images::{ImageStore, MemoryImageStore, S3ImageStore};
use crate::grid::GridRegistry;
use crate::orchestrator::{EngineSettings, LogPresenter, Orchestrator, Presenter, WebhookPresenter};
use crate::profile::UserProfiles;
use crate::quota::{DayBoundary, QuotaLedger};
use crate::routes::build_router;
use crate::state::AppState;
use crate::store::{GridStore, MemoryStore, PgStore, QuotaStore, ReferenceStore, SettingsStore};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (fails fast on missing or invalid env vars)
    let config = Config::from_env()?;

    // Initialize structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!(
                "{}={}",
                env!("CARGO_PKG_NAME").replace('-', "_"),
                &config.rust_log
            ))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Gridsmith API v{}", env!("CARGO_PKG_VERSION"));

    // Persistence: PostgreSQL when configured, otherwise process memory
    let stores = match &config.database_url {
        Some(url) => {
            let pool = create_pool(url).await?;
            ensure_schema(&pool).await?;
            Stores::from_shared(Arc::new(PgStore::new(pool)))
        }
        None => {
            warn!("DATABASE_URL not set; quota, grids and profiles will not survive a restart");
            Stores::from_shared(Arc::new(MemoryStore::new()))
        }
    };

    // Candidate images: S3 / MinIO when configured
    let images: Arc<dyn ImageStore> = match &config.s3 {
        Some(s3) => {
            let client = build_s3_client(s3).await;
            info!("S3 image store initialized (bucket: {})", s3.bucket);
            Arc::new(S3ImageStore::new(client, s3.bucket.clone()))
        }
        None => {
            warn!("S3 not configured; candidate images are kept in memory");
            Arc::new(MemoryImageStore::new())
        }
    };

    // One limiter for the dispatch loop and every extra provider request
    let admission = Arc::new(AdmissionController::new(config.rate_limit_per_minute));

    let client: Arc<dyn GenerationClient> = Arc::new(
        GeminiClient::new(
            config.google_api_key.clone(),
            config.gemini_model.clone(),
            config.gemini_base_url.clone(),
            images.clone(),
        )?
        .with_admission(admission.clone()),
    );
    info!("Generation client initialized (model: {})", config.gemini_model);

    let presenter: Arc<dyn Presenter> = match &config.presentation_webhook_url {
        Some(url) => {
            info!("Presenting results to {url}");
            Arc::new(WebhookPresenter::new(url.clone())?)
        }
        None => Arc::new(LogPresenter),
    };

    let quota = Arc::new(QuotaLedger::new(
        config.daily_limit,
        DayBoundary::new(config.quota_reset_offset_minutes),
        stores.quota,
    ));
    let grids = Arc::new(GridRegistry::new(config.grid_retention, stores.grids, images));
    let profiles = Arc::new(UserProfiles::new(
        config.gemini_model.clone(),
        stores.settings,
        stores.references,
    ));

    let shutdown = CancellationToken::new();
    let (orchestrator, tasks) = Orchestrator::start(
        EngineSettings::from(&config),
        admission,
        quota,
        grids,
        client,
        presenter,
        shutdown.clone(),
    );

    let state = AppState {
        orchestrator,
        profiles,
        config: config.clone(),
    };

    // Build router
    let app = build_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    info!("Listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    // Queued jobs are expired and their quota released before we exit.
    shutdown.cancel();
    for task in tasks {
        if let Err(e) = task.await {
            warn!("Background task ended abnormally: {e}");
        }
    }
    info!("Shutdown complete");

    Ok(())
}

/// One backend seen through each store seam.
struct Stores {
    quota: Arc<dyn QuotaStore>,
    grids: Arc<dyn GridStore>,
    settings: Arc<dyn SettingsStore>,
    references: Arc<dyn ReferenceStore>,
}

impl Stores {
    fn from_shared<S>(store: Arc<S>) -> Self
    where
        S: QuotaStore + GridStore + SettingsStore + ReferenceStore + 'static,
    {
        Self {
            quota: store.clone(),
            grids: store.clone(),
            settings: store.clone(),
            references: store,
        }
    }
}

async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C: {e}");
        return shutdown.cancelled().await;
    }
    info!("Shutdown requested");
    shutdown.cancel();
}

/// Constructs an S3 client configured for MinIO (local) or AWS (production).
async fn build_s3_client(config: &S3Config) -> aws_sdk_s3::Client {
    let credentials = Credentials::new(
        &config.access_key_id,
        &config.secret_access_key,
        None,
        None,
        "gridsmith-static",
    );

    let s3_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(Region::new("us-east-1"))
        .credentials_provider(credentials)
        .endpoint_url(&config.endpoint)
        .load()
        .await;

    aws_sdk_s3::Client::new(&s3_config)
}

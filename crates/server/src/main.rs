mod analysis;
mod api;
mod config;
mod pipeline;
mod range;
mod state;
mod storage;
mod utils;
mod waveform;

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tokio::sync::Semaphore;
use tower_http::request_id::{MakeRequestUuid, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use catalog::{AssetCatalog, MemoryCatalog, RedbCatalog};

use api::{api_router, stream};
use config::{config_path_from_env, load_or_create_config, resolve_path, StoreKind};
use pipeline::ActiveRuns;
use state::AppState;
use storage::RemoteStorage;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config_path = config_path_from_env();
    let (config, created) = load_or_create_config(&config_path)?;
    if created {
        info!("Created default config at {:?}", config_path);
    } else {
        info!("Loaded config from {:?}", config_path);
    }

    let store_kind = StoreKind::parse(&config.store)
        .ok_or_else(|| format!("unknown store kind: {}", config.store))?;

    let data_dir = resolve_path(&config_path, &config.data_dir);
    let audio_dir = data_dir.join("audio");
    let image_dir = data_dir.join("images");
    std::fs::create_dir_all(&audio_dir)?;
    std::fs::create_dir_all(&image_dir)?;

    let catalog: Arc<dyn AssetCatalog> = match store_kind {
        StoreKind::Redb => {
            let index_path = resolve_path(&config_path, &config.index_path);
            info!("Opening catalog at {:?}", index_path);
            Arc::new(RedbCatalog::open(&index_path)?)
        }
        StoreKind::Memory => {
            warn!("Using the in-memory catalog; assets will not survive a restart");
            Arc::new(MemoryCatalog::new())
        }
    };

    let storage = RemoteStorage::new(&config)?;
    if config.storage_enabled {
        info!("Remote storage enabled at {}", config.storage_endpoint);
    }

    let port = config.port;
    let jobs = Arc::new(Semaphore::new(config.max_concurrent_jobs));
    let state = AppState {
        catalog,
        config: Arc::new(config),
        config_path,
        audio_dir,
        image_dir,
        storage,
        runs: ActiveRuns::new(),
        jobs,
    };

    let local_files = Router::new()
        .route("/media/:file_name", get(stream::serve_media))
        .route("/covers/:file_name", get(stream::serve_cover))
        .with_state(state.clone());
    let app = Router::new()
        .nest("/api/v1", api_router(state.clone()))
        .merge(local_files)
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(TraceLayer::new_for_http());

    let bind_addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("Listening on {}", bind_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(err) => {
                warn!("Failed to install terminate signal handler: {}", err);
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = term.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for ctrl-c: {}", err);
        }
    }

    info!("Shutdown signal received.");
}

mod access;
mod api;
mod auth;
mod config;
mod engine;
mod error;
mod jobs;
mod spotify;
mod state;
mod upstream;
mod utils;

#[cfg(test)]
mod testing;

use std::collections::HashMap;
use std::sync::Arc;

use api::api_router;
use auth::AuthStore;
use axum::Router;
use config::{config_path_from_env, load_or_create_config, resolve_path};
use engine::{Engine, EngineSettings};
use library::{FsObjectStore, LibraryStore};
use parking_lot::Mutex;
use spotify::SpotifyClient;
use state::AppState;
use tower_http::request_id::{MakeRequestUuid, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

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
    if config.spotify.client_id.trim().is_empty() {
        warn!("spotify.client_id is not set; sign-in will fail until it is configured.");
    }

    let data_path = resolve_path(&config_path, &config.data_path);
    let db = LibraryStore::open_db(&data_path)?;
    let store = LibraryStore::new(db);
    store.init_tables()?;
    let auth = AuthStore::new(store.database(), config.session_ttl());
    auth.init_tables()?;

    let snapshot_root = resolve_path(&config_path, &config.snapshot_root);
    let objects = Arc::new(FsObjectStore::new(snapshot_root.clone())?);
    info!("Storing snapshot payloads under {:?}", snapshot_root);

    let upstream = Arc::new(SpotifyClient::new(config.spotify.clone())?);
    let engine = Engine::new(
        store.clone(),
        objects,
        upstream,
        EngineSettings {
            track_cache_ttl: config.track_cache_ttl(),
            pull_timeout: config.pull_timeout(),
        },
    );

    if config.scheduler.enabled {
        jobs::spawn_scheduler(engine.clone(), &config.scheduler);
    } else {
        info!("Built-in scheduler disabled; use the job endpoints to run snapshots and sweeps.");
    }

    let bind_addr = format!("0.0.0.0:{}", config.port);
    let state = AppState {
        config: Arc::new(config),
        auth,
        store,
        engine,
        oauth_states: Arc::new(Mutex::new(HashMap::new())),
    };

    let app = Router::new()
        .nest("/api/v1", api_router(state))
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(TraceLayer::new_for_http());

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

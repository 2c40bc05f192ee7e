//! w2x-server – entry point.
//!
//! Startup order:
//! 1. Parse process configuration from environment variables.
//! 2. Initialise structured tracing (JSON or human-readable).
//! 3. Load the settings file and prepare the cache / temp directories.
//! 4. Open the SQLite database and run pending migrations.
//! 5. Resume tasks left unfinished by a previous run.
//! 6. Watch for settings reloads (SIGHUP).
//! 7. Build the Axum router and serve until SIGINT / SIGTERM.

mod config;
mod error;
mod middleware;
mod routes;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{info, warn};
use w2x_core::{CacheLayout, ConfigProvider, Coordinator, Settings, SharedConfig, SqliteStore, TokioProcessExecutor};

use crate::config::Config;
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Configuration ───────────────────────────────────────────────────────
    let cfg = Config::from_env();

    // ── 2. Tracing ─────────────────────────────────────────────────────────────
    let env_filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => match cfg.log_level.parse::<tracing_subscriber::EnvFilter>() {
            Ok(f) => f,
            Err(e) => {
                eprintln!(
                    "WARN: W2X_LOG='{}' is not a valid tracing filter ({}); \
                     falling back to 'info'",
                    cfg.log_level, e
                );
                tracing_subscriber::EnvFilter::new("info")
            }
        },
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true);

    if cfg.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!(version = env!("CARGO_PKG_VERSION"), "w2x-server starting");

    // ── 3. Settings and filesystem layout ──────────────────────────────────────
    let settings = Settings::load(&cfg.settings_path)?;
    if settings.upscaler.path.is_none() {
        warn!("upscaler.path is not set; every task will fail until it is configured");
    }
    let shared = Arc::new(SharedConfig::new(settings));
    let layout = CacheLayout::from_settings(&shared.settings().cache);
    layout.init().await?;
    info!(
        settings = %cfg.settings_path.display(),
        cache_dir = %layout.cache_root().display(),
        temp_dir = %layout.temp_root().display(),
        "settings loaded"
    );

    // ── 4. Database ────────────────────────────────────────────────────────────
    let store = SqliteStore::connect(&cfg.database_url).await?;
    info!(database_url = %cfg.database_url, "database ready");

    // ── 5. Coordinator and crash recovery ──────────────────────────────────────
    let coordinator = Coordinator::new(
        store,
        shared.clone(),
        Arc::new(TokioProcessExecutor),
        layout,
    );
    let resumed = coordinator.resume_pending_tasks().await?;
    info!(resumed, "task recovery complete");

    let state = Arc::new(AppState {
        config: Arc::new(cfg.clone()),
        settings: shared,
        coordinator,
    });

    // ── 6. Settings reload ─────────────────────────────────────────────────────
    spawn_reload_watcher(Arc::clone(&state));
    #[cfg(unix)]
    spawn_sighup_reloader(Arc::clone(&state));

    // ── 7. HTTP server with graceful shutdown ──────────────────────────────────
    let app = routes::build(Arc::clone(&state));
    let addr: SocketAddr = cfg.bind_address.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("w2x-server stopped");
    Ok(())
}

/// Re-apply the scheduler's concurrency limit whenever settings change.
fn spawn_reload_watcher(state: Arc<AppState>) {
    let mut rx = state.settings.subscribe();
    tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let concurrency = rx.borrow_and_update().scheduler.effective_concurrency();
            state.coordinator.scheduler().refresh();
            info!(concurrency, "settings reloaded");
        }
    });
}

/// Re-read the settings file on every SIGHUP. A file that fails to parse
/// leaves the current settings in place.
#[cfg(unix)]
fn spawn_sighup_reloader(state: Arc<AppState>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangups = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "failed to install SIGHUP handler; settings reload disabled");
            return;
        }
    };
    tokio::spawn(async move {
        while hangups.recv().await.is_some() {
            match Settings::load(&state.config.settings_path) {
                Ok(settings) => state.settings.replace(settings),
                Err(e) => warn!(error = %e, "settings reload failed; keeping previous settings"),
            }
        }
    });
}

/// Returns a future that resolves when SIGINT (Ctrl-C) or SIGTERM is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install CTRL+C signal handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => warn!(error = %e, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received; starting graceful shutdown");
}

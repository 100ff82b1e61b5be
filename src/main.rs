/*****************************************************************************************
 *
 *  chore-sync – Realtime Sync Layer for the Family Chore Tracker
 *  --------------------------------------------------------------
 *
 *  VERSION: change-feed channels + reconnect/backoff + status publisher
 *
 *****************************************************************************************/

mod app;
mod config;
mod errors;
mod routes;
mod services;
mod state;

use std::path::PathBuf;
use std::sync::Arc;

use axum::serve;
use tokio::net::TcpListener;

use tracing::level_filters::LevelFilter;
use tracing_subscriber::FmtSubscriber;

use crate::config::AppConfig;
use crate::services::realtime::RealtimeContext;
use crate::services::router::RestOwnershipLookup;
use crate::services::transport::HttpTransport;
use crate::state::app::AppState;

#[tokio::main]
async fn main() {
    //
    // ────────────────────────────────────────────────────────
    //  Locate config.json (EXE folder or project root)
    // ────────────────────────────────────────────────────────
    //
    let exe_path = std::env::current_exe().expect("Cannot get executable path");
    let exe_dir = exe_path.parent().expect("Cannot get executable directory");

    let mut config_path: PathBuf = exe_dir.join("config.json");

    if !config_path.exists() {
        let fallback = exe_dir.join("..").join("config.json");
        if fallback.exists() {
            config_path = fallback;
        } else {
            panic!(
                "config.json not found in:\n  {}\n  {}\nCopy config.json to one of these paths.",
                exe_dir.join("config.json").display(),
                fallback.display()
            );
        }
    }

    //
    // ────────────────────────────────────────────────────────
    //  Load configuration
    // ────────────────────────────────────────────────────────
    //
    let cfg = match AppConfig::load_from_file(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => panic!("{} ({})", e, config_path.display()),
    };

    //
    // ────────────────────────────────────────────────────────
    //  Configure logging
    // ────────────────────────────────────────────────────────
    //
    let level = match cfg.log_level.to_lowercase().as_str() {
        "trace" => LevelFilter::TRACE,
        "debug" => LevelFilter::DEBUG,
        "info" => LevelFilter::INFO,
        "warn" => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        _ => LevelFilter::INFO,
    };

    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();

    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set tracing subscriber");

    tracing::info!("Loaded config.json from {}", config_path.display());
    tracing::info!("Starting chore-sync…");
    tracing::info!("Loaded configuration: {:?}", cfg);

    //
    // ────────────────────────────────────────────────────────
    //  Realtime context: transport, ownership lookups, publisher
    // ────────────────────────────────────────────────────────
    //
    let http = reqwest::Client::new();
    let transport = Arc::new(HttpTransport::new(http.clone(), &cfg.realtime));
    let lookup = Arc::new(RestOwnershipLookup::new(http.clone(), &cfg.realtime));
    let realtime = RealtimeContext::create(&cfg.realtime, transport, lookup);

    //
    // ────────────────────────────────────────────────────────
    //  Log connection status transitions
    // ────────────────────────────────────────────────────────
    //
    {
        let mut status_rx = realtime.watch_status();
        tokio::spawn(async move {
            let mut last = status_rx.borrow().connection_status;
            while status_rx.changed().await.is_ok() {
                let snapshot = status_rx.borrow_and_update().clone();
                if snapshot.connection_status != last {
                    tracing::info!(
                        "Realtime status {} -> {} ({} subscriptions, healthy={})",
                        last,
                        snapshot.connection_status,
                        snapshot.active_subscriptions,
                        snapshot.is_healthy
                    );
                    last = snapshot.connection_status;
                }
            }
        });
    }

    //
    // ────────────────────────────────────────────────────────
    //  Build Axum app (realtime + feed + system routes)
    // ────────────────────────────────────────────────────────
    //
    let state = AppState::new(cfg.clone(), realtime.clone(), http);
    let app = app::build_app(state);

    //
    // ────────────────────────────────────────────────────────
    //  Bind server and start listening
    // ────────────────────────────────────────────────────────
    //
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], cfg.port));
    let listener = TcpListener::bind(addr)
        .await
        .expect("Failed to bind address");

    tracing::info!("Listening on http://{}", addr);

    serve(listener, app)
        .with_graceful_shutdown(shutdown(realtime))
        .await
        .expect("Server error");
}

//
// ─────────────────────────────────────────────────────────────
//  Graceful shutdown handler
// ─────────────────────────────────────────────────────────────
//
async fn shutdown(realtime: Arc<RealtimeContext>) {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to listen for shutdown signal");

    tracing::warn!("CTRL+C received, closing realtime channels…");
    realtime.dispose_all();
    tracing::info!("All channels closed. Goodbye.");
}

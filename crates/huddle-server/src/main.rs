mod config;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    extract::{ConnectInfo, State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use huddle_api::{AppState, AppStateInner};
use huddle_db::Database;
use huddle_gateway::{Dispatcher, GatewayContext, handle_connection};
use huddle_usage::{LimitChecker, SqliteUsageStore, UsageStore};

use crate::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "huddle=debug,tower_http=debug".into()),
        )
        .init();

    let config = Config::from_env()?;

    // Init database
    let db = Arc::new(Database::open(&config.db_path)?);
    info!("Database ready at {}", config.db_path.display());

    // Shared state
    let dispatcher = Dispatcher::new();
    let usage_store: Arc<dyn UsageStore> = Arc::new(SqliteUsageStore::new(db.clone()));
    let app_state: AppState = Arc::new(AppStateInner {
        db: db.clone(),
        dispatcher: dispatcher.clone(),
        limits: LimitChecker::new(usage_store.clone()),
        jwt_secret: config.jwt_secret.clone(),
        settings: config.rooms,
        ai: None,
    });

    let gateway = GatewayContext {
        dispatcher,
        db,
        jwt_secret: Arc::from(config.jwt_secret.as_str()),
    };

    tokio::spawn(usage_cleanup_loop(usage_store, config.cleanup_interval));

    let ws_route = Router::new()
        .route("/gateway", get(ws_upgrade))
        .with_state(gateway);

    let app = huddle_api::router(app_state)
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    info!("Huddle server listening on {}", config.addr);

    let listener = tokio::net::TcpListener::bind(config.addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Huddle server stopped");
    Ok(())
}

async fn ws_upgrade(
    State(ctx): State<GatewayContext>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, ctx, Some(addr.ip())))
}

/// Drop usage windows that can no longer affect a limit check.
async fn usage_cleanup_loop(store: Arc<dyn UsageStore>, every: std::time::Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        match store.cleanup_old().await {
            Ok(0) => {}
            Ok(n) => info!("Cleaned up {} stale usage counters", n),
            Err(e) => warn!("Usage cleanup failed: {}", e),
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => tokio::select! {
                _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
                _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
            },
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                ctrl_c.await.ok();
                info!("Received Ctrl+C, shutting down...");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
}

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use axum::{
    Router,
    extract::{Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use accord_api::AppStateInner;
use accord_core::{Engine, EngineConfig, run_reconcile_loop};
use accord_gateway::Dispatcher;
use accord_gateway::connection::{self, SnapshotSource};

/// Secrets that ship in sample configs and must never reach production.
const PLACEHOLDER_SECRETS: [&str; 3] = ["", "changeme", "dev-secret-change-me"];

#[derive(Clone)]
struct GatewayState {
    dispatcher: Dispatcher,
    snapshots: Arc<dyn SnapshotSource>,
    jwt_secret: String,
}

#[derive(Debug, Deserialize)]
struct GatewayQuery {
    token: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "accord=debug,accord_core=debug,accord_api=debug,accord_gateway=debug,tower_http=debug".into()),
        )
        .init();

    // Config
    let jwt_secret = std::env::var("ACCORD_JWT_SECRET").context("ACCORD_JWT_SECRET must be set")?;
    if PLACEHOLDER_SECRETS.contains(&jwt_secret.trim()) {
        bail!("ACCORD_JWT_SECRET is a placeholder; set a real secret");
    }
    let webhook_secret = std::env::var("ACCORD_WEBHOOK_SECRET").ok().filter(|s| !s.trim().is_empty());
    if webhook_secret.is_none() {
        warn!("ACCORD_WEBHOOK_SECRET not set, account provisioning is disabled");
    }
    let db_path = std::env::var("ACCORD_DB_PATH").unwrap_or_else(|_| "accord.db".into());
    let host = std::env::var("ACCORD_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = std::env::var("ACCORD_PORT")
        .unwrap_or_else(|_| "3000".into())
        .parse()
        .context("ACCORD_PORT must be a port number")?;
    let config = EngineConfig::from_env()?;

    let db = accord_db::Database::open(&PathBuf::from(&db_path))?;

    let dispatcher = Dispatcher::new();
    let reconcile_interval = config.reconcile_interval;
    let engine = Engine::new(Arc::new(db), dispatcher.clone(), config);

    tokio::spawn(run_reconcile_loop(engine.clone(), reconcile_interval));

    let gateway = GatewayState {
        dispatcher,
        snapshots: Arc::new(engine.clone()),
        jwt_secret: jwt_secret.clone(),
    };

    let api = accord_api::router(Arc::new(AppStateInner {
        engine,
        jwt_secret,
        webhook_secret,
    }));

    let ws_route = Router::new()
        .route("/gateway", get(ws_upgrade))
        .with_state(gateway);

    let app = Router::new()
        .merge(api)
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("Accord server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// A `?token=` is checked before the upgrade; without one the client must
/// identify in its first frame.
async fn ws_upgrade(
    State(state): State<GatewayState>,
    Query(query): Query<GatewayQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(token) = query.token else {
        return ws
            .on_upgrade(move |socket| {
                connection::handle_connection(socket, state.dispatcher, state.snapshots, state.jwt_secret)
            })
            .into_response();
    };

    let Some((account_id, username)) = connection::decode_token(&token, &state.jwt_secret) else {
        return StatusCode::UNAUTHORIZED.into_response();
    };

    ws.on_upgrade(move |socket| {
        connection::handle_connection_authenticated(
            socket,
            state.dispatcher,
            state.snapshots,
            account_id,
            username,
        )
    })
    .into_response()
}

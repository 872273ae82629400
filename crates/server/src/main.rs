use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::{
    extract::{ws::rejection::WebSocketUpgradeRejection, Query, State, WebSocketUpgrade},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use server_api::{ApiContext, JwtGatekeeper, LocalBlobStore};
use shared::error::{ApiError, ErrorCode};
use storage::Storage;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod app_state;
mod config;
mod ws;

use app_state::AppState;
use config::{load_settings, prepare_database_url};

#[derive(Debug, Deserialize)]
struct WsQuery {
    token: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    service: String,
    status: String,
    online_identities: usize,
    online_connections: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url)
        .await
        .map_err(|error| {
            error!(
                %database_url,
                %error,
                "failed to open SQLite database; verify parent directory exists and permissions are correct"
            );
            error
        })?
        .with_call_timeout(settings.store_timeout());

    let blobs = LocalBlobStore::new(settings.blob_dir.clone());
    tokio::fs::create_dir_all(blobs.root())
        .await
        .with_context(|| format!("failed to create blob directory '{}'", blobs.root().display()))?;

    let api = ApiContext::new(Arc::new(storage.clone()), Arc::new(blobs))
        .await
        .context("failed to initialize coordinator")?
        .with_history_limits(settings.group_history_limit, settings.private_history_limit);

    let state = AppState {
        api,
        gatekeeper: Arc::new(JwtGatekeeper::new(&settings.jwt_secret)),
        storage: storage.clone(),
    };
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings
        .server_bind
        .parse()
        .with_context(|| format!("invalid bind address '{}'", settings.server_bind))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, blob_dir = %settings.blob_dir.display(), "server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    storage.close().await;
    info!("server stopped");
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(status))
        .route("/healthz", get(healthz))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

async fn healthz(
    State(state): State<Arc<AppState>>,
) -> Result<&'static str, (StatusCode, Json<ApiError>)> {
    state.storage.health_check().await.map_err(|error| {
        warn!(%error, "health check failed");
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ApiError::new(ErrorCode::Storage, "storage unavailable")),
        )
    })?;
    Ok("ok")
}

async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let counts = state.api.presence_counts().await;
    Json(StatusResponse {
        service: env!("CARGO_PKG_NAME").to_string(),
        status: "running".to_string(),
        online_identities: counts.identities,
        online_connections: counts.connections,
    })
}

/// Authenticates before upgrading; a rejected credential never reaches the
/// presence registry.
async fn ws_handler(
    State(state): State<Arc<AppState>>,
    Query(q): Query<WsQuery>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let credential = q.token.or_else(|| {
        headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    });

    let identity = match state.gatekeeper.authenticate(credential.as_deref()) {
        Ok(identity) => identity,
        Err(error) => {
            warn!(%error, "websocket connection rejected");
            return (StatusCode::UNAUTHORIZED, Json(ApiError::from(error))).into_response();
        }
    };

    match ws {
        Ok(ws) => ws
            .on_upgrade(move |socket| ws::serve_connection(state, socket, identity))
            .into_response(),
        Err(rejection) => rejection.into_response(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            error!(%error, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                error!(%error, "failed to listen for SIGTERM");
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
    info!("shutdown signal received");
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;

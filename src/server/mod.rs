//! Server entry
//!
//! One listener serves the duplex client WebSocket and the
//! worker-orchestration HTTP API. Background tasks run the session expiry
//! supervisor and the worker supervision probe.

pub mod connection;

use anyhow::{Context, Result};
use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::Config;
use crate::services::Services;
use crate::session::SessionManager;
use crate::worker::{api as worker_api, runtime::DockerCli, MeetingOrchestrator};

/// Shared server state for the WebSocket route
#[derive(Clone)]
pub struct ServerState {
    pub config: Arc<Config>,
    pub sessions: Arc<SessionManager>,
}

/// Start the bridge server.
pub async fn start(config: Config) -> Result<()> {
    let services = Services::from_config(&config);
    let sessions = SessionManager::new(&config, services);
    tokio::spawn(sessions.clone().run_expiry_supervisor());

    let runtime = Arc::new(DockerCli::new(config.worker.socket.clone()));
    let orchestrator = MeetingOrchestrator::new(runtime, config.worker.clone());
    if let Err(e) = orchestrator.reconcile().await {
        warn!("Worker reconciliation failed: {:#}", e);
    }
    tokio::spawn(orchestrator.clone().run_supervisor());

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("Invalid listen address")?;
    let tls = match (&config.server.tls_cert, &config.server.tls_key) {
        (Some(cert), Some(key)) => Some((cert.clone(), key.clone())),
        _ => None,
    };

    let token = Arc::new(config.auth.token.clone());
    let state = ServerState { config: Arc::new(config), sessions };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let worker_routes = worker_api::router(orchestrator)
        .layer(middleware::from_fn_with_state(token, bearer_guard));

    let app = Router::new()
        .route("/ws", get(connection::ws_handler))
        .with_state(state)
        .merge(worker_routes)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    info!("Listening on {} (tls={})", addr, tls.is_some());

    if let Some((cert_path, key_path)) = tls {
        let cert = tokio::fs::read(&cert_path)
            .await
            .context("Failed to read certificate file")?;
        let key = tokio::fs::read(&key_path).await.context("Failed to read key file")?;
        let rustls = axum_server::tls_rustls::RustlsConfig::from_pem(cert, key).await?;
        axum_server::bind_rustls(addr, rustls)
            .serve(app.into_make_service())
            .await?;
        return Ok(());
    }

    axum::serve(tokio::net::TcpListener::bind(addr).await?, app).await?;
    Ok(())
}

/// Shared-token gate on mutating orchestration endpoints. GETs stay open
/// for dashboards and health probes; an empty configured token disables
/// the gate.
async fn bearer_guard(
    State(token): State<Arc<String>>,
    request: Request,
    next: Next,
) -> Response {
    if token.is_empty() || request.method() == Method::GET {
        return next.run(request).await;
    }

    let presented = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "));

    match presented {
        Some(t) if t == token.as_str() => next.run(request).await,
        _ => StatusCode::UNAUTHORIZED.into_response(),
    }
}

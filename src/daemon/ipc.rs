//! Localhost HTTP RPC surface.
//!
//! Routes:
//! - `GET  /health` — liveness, uptime and per-service state; never
//!   requires auth.
//! - `GET  /skills` — loaded skill manifests.
//! - `POST /rpc/{skill}/{method}` — JSON body `{args?, kwargs?}`.
//! - `POST /stop` — schedule graceful shutdown.
//!
//! When a bearer token is configured, everything except `/health`
//! requires `Authorization: Bearer <token>`.  RPC handlers run under a
//! per-call timeout; expiry returns 504 `HANDLER_TIMEOUT`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{Path, State},
    http::{Request, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::daemon::ServiceRegistry;
use crate::errors::FrameworkError;
use crate::runtime::RuntimeContext;
use crate::skills::MethodArgs;

/// Default per-call RPC timeout.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared state injected into handlers.
#[derive(Clone)]
pub struct IpcState {
    pub runtime: Arc<RuntimeContext>,
    pub api_token: Option<String>,
    pub started: std::time::Instant,
    /// Fresh per daemon start; lets clients detect a restart.
    pub instance_id: String,
    pub stop: CancellationToken,
    pub services: Arc<ServiceRegistry>,
    pub rpc_timeout: Duration,
}

impl IpcState {
    pub fn new(runtime: Arc<RuntimeContext>, stop: CancellationToken) -> Self {
        Self {
            api_token: runtime.config.api_token.clone(),
            runtime,
            started: std::time::Instant::now(),
            instance_id: uuid::Uuid::new_v4().to_string(),
            stop,
            services: Arc::new(ServiceRegistry::new()),
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
        }
    }
}

/// Handle to the running server.
pub struct IpcServer {
    pub addr: SocketAddr,
    pub handle: JoinHandle<()>,
}

/// Bind and serve. The caller owns shutdown via the handle.
pub async fn start(state: IpcState, addr: SocketAddr) -> std::io::Result<IpcServer> {
    if state.api_token.is_some() {
        info!("IPC authentication enabled");
    } else {
        warn!("IPC authentication disabled (no API token configured)");
    }

    let protected = Router::new()
        .route("/skills", get(skills_handler))
        .route("/rpc/:skill/:method", post(rpc_handler))
        .route("/stop", post(stop_handler))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    let app = Router::new()
        .route("/health", get(health_handler))
        .merge(protected)
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("ipc server error: {e}");
        }
    });

    info!(%bound_addr, "ipc server listening");
    Ok(IpcServer {
        addr: bound_addr,
        handle,
    })
}

async fn auth_middleware(
    State(state): State<IpcState>,
    req: Request<Body>,
    next: middleware::Next,
) -> Response {
    let Some(ref expected) = state.api_token else {
        return next.run(req).await;
    };

    let provided = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "));

    match provided {
        Some(token) if token == expected => next.run(req).await,
        Some(_) => (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({"error": "invalid token"})),
        )
            .into_response(),
        None => (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({"error": "missing Authorization header"})),
        )
            .into_response(),
    }
}

async fn health_handler(State(state): State<IpcState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_sec": state.started.elapsed().as_secs(),
        "instance_id": state.instance_id,
        "agent": state.runtime.agent_code,
        "services": state.services.health_snapshot(),
    }))
}

async fn skills_handler(State(state): State<IpcState>) -> impl IntoResponse {
    let skills: Vec<serde_json::Value> = state
        .runtime
        .registry
        .iter()
        .map(|p| {
            serde_json::json!({
                "name": p.manifest.name,
                "version": p.manifest.version,
                "description": p.manifest.description,
                "requires": p.manifest.requires,
            })
        })
        .collect();
    Json(serde_json::json!({ "skills": skills }))
}

async fn rpc_handler(
    State(state): State<IpcState>,
    Path((skill, method)): Path<(String, String)>,
    body: Option<Json<MethodArgs>>,
) -> Response {
    let args = body.map(|Json(a)| a).unwrap_or_default();
    let runtime = state.runtime.clone();
    let timeout_secs = state.rpc_timeout.as_secs();

    // Skill methods are synchronous and may block on the store up to the
    // busy timeout; keep them off the async workers.
    let call = tokio::task::spawn_blocking(move || runtime.invoke(&skill, &method, &args));

    let outcome = match tokio::time::timeout(state.rpc_timeout, call).await {
        Err(_) => Err(FrameworkError::HandlerTimeout { timeout_secs }),
        Ok(Err(join_err)) => Err(FrameworkError::Internal(format!(
            "rpc handler panicked: {join_err}"
        ))),
        Ok(Ok(result)) => result,
    };

    match outcome {
        Ok(value) => Json(serde_json::json!({ "result": value })).into_response(),
        Err(e) => error_response(e),
    }
}

async fn stop_handler(State(state): State<IpcState>) -> impl IntoResponse {
    info!("stop requested over IPC");
    state.stop.cancel();
    Json(serde_json::json!({ "status": "stopping" }))
}

/// Map a framework error to its HTTP status and sanitized body.
fn error_response(err: FrameworkError) -> Response {
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        error!(kind = err.kind(), "rpc handler error: {err}");
    }
    (status, Json(err.to_body())).into_response()
}

use std::sync::Arc;
use std::time::Instant;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, Uri, header};
use axum::response::sse::{KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use futures::StreamExt;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::backend::{HttpProxy, SseRelay, build_http_client};
use crate::config::secrets::redacted_config;
use crate::config::types::{GatewaySettings, Transport, TransportKind};
use crate::error::GatewayError;
use crate::metrics::Metrics;
use crate::registry::{BackendRegistry, BackendSnapshot};
use crate::status::BackendStatus;
use crate::supervisor::ProcessSupervisor;

/// Largest request body accepted for forwarding.
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub registry: BackendRegistry,
    pub supervisor: ProcessSupervisor,
    pub client: reqwest::Client,
    pub settings: Arc<GatewaySettings>,
    pub metrics: Arc<Metrics>,
    /// Cancelled on shutdown; ends open event streams so the server can drain.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(registry: BackendRegistry, settings: GatewaySettings) -> anyhow::Result<Self> {
        Ok(Self {
            supervisor: ProcessSupervisor::new(registry.clone()),
            registry,
            client: build_http_client()?,
            settings: Arc::new(settings),
            metrics: Arc::new(Metrics::new()?),
            shutdown: CancellationToken::new(),
        })
    }

    async fn resolve(&self, id: &str) -> Result<BackendSnapshot, GatewayError> {
        match self.registry.get(id).await {
            Ok(snapshot) => Ok(snapshot),
            Err(_) => Err(GatewayError::UnknownBackend {
                id: id.to_string(),
                available_endpoints: self.available_endpoints().await,
            }),
        }
    }

    async fn available_endpoints(&self) -> Vec<String> {
        self.registry
            .ids()
            .await
            .iter()
            .map(|id| self.settings.endpoint(id))
            .collect()
    }

    fn endpoints(&self, snapshot: &BackendSnapshot) -> Value {
        let base = self.settings.endpoint(snapshot.id());
        let mut endpoints = json!({
            "http": base,
            "start": format!("{base}/start"),
            "stop": format!("{base}/stop"),
        });
        if snapshot.kind() != TransportKind::Process {
            endpoints["sse"] = json!(format!("{base}/sse"));
        }
        endpoints
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = cors_layer(&state.settings.cors_origin);

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .route("/mcp", get(list_backends))
        .route("/mcp/{id}", get(backend_detail).post(forward_request))
        .route("/mcp/{id}/sse", get(sse_stream))
        .route("/mcp/{id}/start", post(start_backend))
        .route("/mcp/{id}/stop", post(stop_backend))
        // Sub-paths of HTTP proxy backends are matched in the fallback, and so
        // are other methods on the routes above.
        .fallback(fallback)
        .method_not_allowed_fallback(fallback)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// `"*"` allows any origin; otherwise a comma-separated list of exact origins.
pub fn cors_layer(origin: &str) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origin.trim() == "*" {
        return layer.allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = origin
        .split(',')
        .map(str::trim)
        .filter(|o| !o.is_empty())
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %o, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(origins))
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let servers: Vec<Value> = state
        .registry
        .list()
        .await
        .iter()
        .map(|s| {
            json!({
                "id": s.id(),
                "status": s.status,
                "type": s.kind(),
                "uptime": s.uptime_secs,
            })
        })
        .collect();

    Json(json!({
        "status": "ok",
        "timestamp": Utc::now().to_rfc3339(),
        "servers": servers,
    }))
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    state
        .metrics
        .observe_backends(&state.registry.list().await);
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        state.metrics.gather_text(),
    )
        .into_response()
}

async fn list_backends(State(state): State<AppState>) -> Json<Value> {
    let snapshots = state.registry.list().await;
    let servers: Vec<Value> = snapshots
        .iter()
        .map(|s| {
            json!({
                "id": s.id(),
                "type": s.kind(),
                "status": s.status,
                "uptime": s.uptime_secs,
                "endpoints": state.endpoints(s),
            })
        })
        .collect();

    Json(json!({
        "servers": servers,
        "total": snapshots.len(),
    }))
}

async fn backend_detail(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, GatewayError> {
    let snapshot = state.resolve(&id).await?;
    Ok(Json(json!({
        "id": snapshot.id(),
        "type": snapshot.kind(),
        "status": snapshot.status,
        "uptime": snapshot.uptime_secs,
        "started_at": snapshot.started_at.to_rfc3339(),
        "pid": snapshot.pid,
        "endpoints": state.endpoints(&snapshot),
        "config": redacted_config(&snapshot.config),
    })))
}

/// `POST /mcp/{id}`: one request/response exchange with the backend.
async fn forward_request(
    State(state): State<AppState>,
    Path(id): Path<String>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, GatewayError> {
    let snapshot = state.resolve(&id).await?;
    let started = Instant::now();

    let result = match &snapshot.config.transport {
        Transport::Process(_) => call_process(&state, &snapshot, &body).await,
        Transport::HttpProxy(config) => {
            ensure_running(&snapshot)?;
            HttpProxy::new(&state.client, &id, config)
                .forward(Method::POST, "", uri.query(), &headers, body)
                .await
                .map_err(|e| GatewayError::from_backend(&id, e))
        }
        Transport::SseRelay(config) => {
            ensure_running(&snapshot)?;
            SseRelay::new(&state.client, &id, config)
                .request(body)
                .await
                .map(|reply| Json(reply).into_response())
                .map_err(|e| GatewayError::from_backend(&id, e))
        }
    };

    record(&state, &id, started, &result);
    result
}

async fn call_process(
    state: &AppState,
    snapshot: &BackendSnapshot,
    body: &[u8],
) -> Result<Response, GatewayError> {
    let id = snapshot.id();
    let message: Value =
        serde_json::from_slice(body).map_err(|e| GatewayError::InvalidBody(e.to_string()))?;

    let Some(process) = state.registry.process(id).await else {
        return Err(GatewayError::BackendNotRunning {
            id: id.to_string(),
            status: snapshot.status,
        });
    };

    let reply = process
        .call(&message)
        .await
        .map_err(|e| GatewayError::from_backend(id, e))?;
    Ok(Json(reply).into_response())
}

/// `GET /mcp/{id}/sse`: live event stream from the backend.
async fn sse_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
    uri: Uri,
    headers: HeaderMap,
) -> Result<Response, GatewayError> {
    let snapshot = state.resolve(&id).await?;

    match &snapshot.config.transport {
        Transport::SseRelay(config) => {
            ensure_running(&snapshot)?;
            let events = SseRelay::new(&state.client, &id, config)
                .events()
                .await
                .map_err(|e| GatewayError::from_backend(&id, e))?;
            let shutdown = state.shutdown.clone().cancelled_owned();
            Ok(Sse::new(events.take_until(shutdown))
                .keep_alive(KeepAlive::default())
                .into_response())
        }
        Transport::HttpProxy(config) => {
            ensure_running(&snapshot)?;
            HttpProxy::new(&state.client, &id, config)
                .forward(Method::GET, "sse", uri.query(), &headers, Bytes::new())
                .await
                .map_err(|e| GatewayError::from_backend(&id, e))
        }
        Transport::Process(_) => Err(GatewayError::UnsupportedTransport {
            id,
            kind: TransportKind::Process.as_str(),
            operation: "event streams",
        }),
    }
}

async fn start_backend(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, GatewayError> {
    let snapshot = state.resolve(&id).await?;

    let status = match snapshot.kind() {
        TransportKind::Process => state.supervisor.start(&id).await?,
        TransportKind::HttpProxy | TransportKind::SseRelay => {
            if snapshot.status != BackendStatus::Running {
                state.registry.mark_started(&id).await;
                state.registry.set_status(&id, BackendStatus::Running).await;
            }
            BackendStatus::Running
        }
    };

    Ok(accepted(&id, status, "start requested"))
}

async fn stop_backend(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, GatewayError> {
    let snapshot = state.resolve(&id).await?;

    let status = match snapshot.kind() {
        TransportKind::Process => state.supervisor.stop(&id).await?,
        TransportKind::HttpProxy | TransportKind::SseRelay => {
            state.registry.set_status(&id, BackendStatus::Stopped).await;
            BackendStatus::Stopped
        }
    };

    Ok(accepted(&id, status, "stop requested"))
}

/// Proxies `/mcp/{id}` and `/mcp/{id}/{rest}` for HTTP proxy backends under any
/// method; everything else is a 404 listing the known endpoints.
async fn fallback(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, GatewayError> {
    if let Some((id, rest)) = uri
        .path()
        .strip_prefix("/mcp/")
        .filter(|p| !p.is_empty())
        .map(|p| p.split_once('/').unwrap_or((p, "")))
    {
        if let Ok(snapshot) = state.registry.get(id).await {
            if let Transport::HttpProxy(config) = &snapshot.config.transport {
                ensure_running(&snapshot)?;
                let started = Instant::now();
                let result = HttpProxy::new(&state.client, id, config)
                    .forward(method, rest, uri.query(), &headers, body)
                    .await
                    .map_err(|e| GatewayError::from_backend(id, e));
                record(&state, id, started, &result);
                return result;
            }
        }
    }

    Err(GatewayError::RouteNotFound {
        path: uri.path().to_string(),
        available_endpoints: state.available_endpoints().await,
    })
}

fn ensure_running(snapshot: &BackendSnapshot) -> Result<(), GatewayError> {
    if snapshot.status == BackendStatus::Running {
        Ok(())
    } else {
        Err(GatewayError::BackendNotRunning {
            id: snapshot.id().to_string(),
            status: snapshot.status,
        })
    }
}

fn accepted(id: &str, status: BackendStatus, message: &str) -> Response {
    (
        StatusCode::ACCEPTED,
        Json(json!({
            "id": id,
            "status": status,
            "message": message,
        })),
    )
        .into_response()
}

fn record(state: &AppState, id: &str, started: Instant, result: &Result<Response, GatewayError>) {
    let outcome = match result {
        Ok(response) if response.status().is_success() => "success".to_string(),
        Ok(response) => response.status().as_u16().to_string(),
        Err(e) => e.status_code().as_u16().to_string(),
    };
    state
        .metrics
        .record_request(id, &outcome, started.elapsed().as_secs_f64());
}

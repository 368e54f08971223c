//! HTTP surface of the collector.
//!
//! Ingestion:
//! - `POST /v1/save`: newline-delimited JSON stream of [`SaveRequest`]s,
//!   one description followed by measurements
//!
//! Queries:
//! - `GET /api/v1/services`
//! - `GET /api/v1/services/:service/instances`
//! - `GET /api/v1/services/:service/instances/:instance/sessions`
//! - `GET /api/v1/services/:service/instances/:instance/sessions/:id/metrics`
//! - `GET /api/v1/services/:service/instances/:instance/sessions/:id/subscribe` (SSE)
//! - `GET /health`

use super::Collector;
use crate::core::{
    HeapwatchError, InstanceDescription, Result, SessionDescription, SessionInfo, SessionMetrics,
};
use crate::protocol::{SaveProtocol, SaveRequest};
use axum::{
    body::{Body, Bytes},
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use bytes::BytesMut;
use futures::{Stream, StreamExt};
use serde::Serialize;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

#[derive(Clone)]
struct AppState {
    collector: Arc<Collector>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    code: u16,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    uptime_seconds: u64,
    resident_sessions: usize,
}

/// Outcome of one ingestion stream.
#[derive(Debug, Serialize)]
pub struct SaveResponse {
    pub session: Option<SessionDescription>,
    pub measurements: u64,
}

/// Error mapped onto an HTTP status.
pub struct ApiError(HeapwatchError);

impl From<HeapwatchError> for ApiError {
    fn from(err: HeapwatchError) -> Self {
        ApiError(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            HeapwatchError::Protocol(_)
            | HeapwatchError::Serialization(_)
            | HeapwatchError::Codec(_)
            | HeapwatchError::InvalidDescription(_) => StatusCode::BAD_REQUEST,
            HeapwatchError::NotFound(_) => StatusCode::NOT_FOUND,
            HeapwatchError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("Request failed ({}): {}", self.0.category(), self.0);
        } else {
            tracing::debug!("Request rejected ({}): {}", self.0.category(), self.0);
        }
        let body = Json(ErrorResponse {
            error: self.0.to_string(),
            code: status.as_u16(),
        });
        (status, body).into_response()
    }
}

/// Create the router serving ingestion and queries.
pub fn create_router(collector: Arc<Collector>) -> Router {
    let enable_cors = collector.config().server.enable_cors;
    let session_path = "/api/v1/services/:service/instances/:instance/sessions/:session_id";

    let router = Router::new()
        .route("/health", get(health))
        .route("/v1/save", post(save))
        .route("/api/v1/services", get(list_services))
        .route("/api/v1/services/:service/instances", get(list_instances))
        .route(
            "/api/v1/services/:service/instances/:instance/sessions",
            get(list_sessions),
        )
        .route(&format!("{session_path}/metrics"), get(session_metrics))
        .route(&format!("{session_path}/subscribe"), get(subscribe))
        .with_state(AppState { collector });

    let router = router.layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()));
    if enable_cors {
        router.layer(CorsLayer::permissive())
    } else {
        router
    }
}

/// Serve until `shutdown` resolves, then drain open connections.
pub async fn serve<F>(collector: Arc<Collector>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let server = &collector.config().server;
    let addr = SocketAddr::new(server.listen_address, server.port);
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        HeapwatchError::Io(std::io::Error::new(
            std::io::ErrorKind::AddrInUse,
            format!("Failed to bind to {}: {}", addr, e),
        ))
    })?;

    tracing::info!("Collector listening on http://{}", addr);
    axum::serve(listener, create_router(collector))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// GET /health
async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let status = if state.collector.is_shutting_down() {
        "stopping"
    } else {
        "healthy"
    };
    Json(HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.collector.uptime().as_secs(),
        resident_sessions: state.collector.metrics().resident_count(),
    })
}

/// POST /v1/save
async fn save(State(state): State<AppState>, body: Body) -> std::result::Result<Json<SaveResponse>, ApiError> {
    let ctx = state.collector.request_context();
    let mut protocol = state.collector.save_protocol();

    let max_line = state.collector.config().server.max_line_bytes;
    let ingested = ingest(&mut protocol, body.into_data_stream(), &ctx, max_line).await;
    let closed = protocol.close().await;

    let measurements = match (ingested, closed) {
        (Ok(measurements), closed) => {
            closed?;
            measurements
        }
        (Err(e), Err(close_err)) => {
            tracing::error!("Failed to close session after rejected save: {}", close_err);
            return Err(e.into());
        }
        (Err(e), Ok(())) => return Err(e.into()),
    };
    Ok(Json(SaveResponse {
        session: protocol.session().cloned(),
        measurements,
    }))
}

/// Splits the body into lines of at most `max_line` bytes and feeds each one
/// to the protocol.
async fn ingest<S>(protocol: &mut SaveProtocol, body: S, ctx: &CancellationToken, max_line: usize) -> Result<u64>
where
    S: Stream<Item = std::result::Result<Bytes, axum::Error>>,
{
    let mut body = std::pin::pin!(body);
    let mut pending = BytesMut::new();
    // Bytes of `pending` already known to hold no newline.
    let mut scanned = 0;

    loop {
        let chunk = tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(HeapwatchError::Cancelled),
            chunk = body.next() => chunk,
        };

        match chunk {
            Some(Ok(bytes)) => {
                pending.extend_from_slice(&bytes);
                while let Some(pos) = pending[scanned..].iter().position(|&b| b == b'\n') {
                    let line = pending.split_to(scanned + pos + 1);
                    scanned = 0;
                    check_line_length(line.len() - 1, max_line)?;
                    handle_line(protocol, &line).await?;
                }
                scanned = pending.len();
                check_line_length(pending.len(), max_line)?;
            }
            Some(Err(e)) => return Err(HeapwatchError::Io(std::io::Error::other(e))),
            None => break,
        }
    }

    if !pending.is_empty() {
        handle_line(protocol, &pending).await?;
    }
    Ok(protocol.measurement_count())
}

fn check_line_length(len: usize, max_line: usize) -> Result<()> {
    if len > max_line {
        return Err(HeapwatchError::codec(format!(
            "request line longer than {max_line} bytes"
        )));
    }
    Ok(())
}

async fn handle_line(protocol: &mut SaveProtocol, line: &[u8]) -> Result<()> {
    if line.iter().all(u8::is_ascii_whitespace) {
        return Ok(());
    }
    let request: SaveRequest = serde_json::from_slice(line)?;
    protocol.handle(request).await
}

/// GET /api/v1/services
async fn list_services(State(state): State<AppState>) -> std::result::Result<Json<Vec<String>>, ApiError> {
    Ok(Json(state.collector.metadata().get_services().await?))
}

/// GET /api/v1/services/:service/instances
async fn list_instances(
    State(state): State<AppState>,
    Path(service): Path<String>,
) -> std::result::Result<Json<Vec<InstanceDescription>>, ApiError> {
    Ok(Json(state.collector.metadata().get_instances(&service).await?))
}

/// GET /api/v1/services/:service/instances/:instance/sessions
async fn list_sessions(
    State(state): State<AppState>,
    Path((service, instance)): Path<(String, String)>,
) -> std::result::Result<Json<Vec<SessionInfo>>, ApiError> {
    let instance = InstanceDescription::new(service, instance)?;
    Ok(Json(state.collector.metadata().get_sessions(&instance).await?))
}

/// GET .../sessions/:session_id/metrics
async fn session_metrics(
    State(state): State<AppState>,
    Path((service, instance, session_id)): Path<(String, String, i64)>,
) -> std::result::Result<Json<SessionMetrics>, ApiError> {
    let session = SessionDescription::new(InstanceDescription::new(service, instance)?, session_id);
    let ctx = state.collector.request_context();
    let metrics = state.collector.metrics().get_session_metrics(&ctx, &session).await?;
    Ok(Json(metrics.sanitized()))
}

/// GET .../sessions/:session_id/subscribe
async fn subscribe(
    State(state): State<AppState>,
    Path((service, instance, session_id)): Path<(String, String, i64)>,
) -> std::result::Result<Sse<impl Stream<Item = std::result::Result<Event, axum::Error>>>, ApiError> {
    let session = SessionDescription::new(InstanceDescription::new(service, instance)?, session_id);
    state.collector.metadata().get_session_metadata(&session).await?;

    let subscription = state
        .collector
        .metrics()
        .subscribe(state.collector.request_context(), &session);
    tracing::debug!("Subscription {} streaming metrics of {}", subscription.id(), session);

    let updates = subscription
        .into_stream()
        .map(|metrics| Event::default().event("metrics").json_data(metrics.sanitized()));
    Ok(Sse::new(updates).keep_alive(KeepAlive::default()))
}

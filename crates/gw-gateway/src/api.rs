//! HTTP surface for the publish gateway
//!
//! - `POST /topics/:topic` publishes the raw request body
//! - `GET /health`, `GET /stats`, `GET /metrics`
//! - `PUT /admin/brokers`, `POST /admin/brokers/rebuild`

use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use std::task::{Context, Poll};
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    serve::IncomingStream,
    Extension, Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower::Service;
use tracing::{info, error};

use gw_common::GatewayStats;
use crate::error::GatewayError;
use crate::server::{PubServer, PublishReceipt, PublishRequest};
use crate::tag::{self, TagMap};
use crate::tracker::{ConnectionGuard, ConnectionTracker};

/// Header carrying `k=v;k2=v2` message tags
pub const TAG_HEADER: &str = "x-gw-tag";

#[derive(Clone)]
pub struct AppState {
    pub server: Arc<PubServer>,
    pub prometheus: Option<PrometheusHandle>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PublishParams {
    pub key: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct BrokerListRequest {
    pub brokers: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BrokerListResponse {
    pub changed: bool,
    pub version: u64,
    pub brokers: Vec<String>,
    pub pending: Option<Vec<String>>,
}

/// Gateway error rendered as an HTTP response
pub struct ApiError(pub GatewayError);

impl From<GatewayError> for ApiError {
    fn from(e: GatewayError) -> Self {
        Self(e)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            GatewayError::Throttled { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::PoolExhausted(_)
            | GatewayError::PoolClosed
            | GatewayError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::MessageTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::InvalidRequest(_) | GatewayError::MalformedEnvelope(_) => StatusCode::BAD_REQUEST,
            GatewayError::FactoryError { .. } | GatewayError::BrokerWriteError(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: self.0.code().to_string(),
            message: self.0.to_string(),
        };
        (self.status(), Json(body)).into_response()
    }
}

pub fn create_router(server: Arc<PubServer>, prometheus: Option<PrometheusHandle>) -> Router {
    let body_limit = server.config().max_pub_size;
    let state = AppState { server, prometheus };

    Router::new()
        .route("/topics/:topic", post(publish_handler))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        .route("/admin/brokers", put(refresh_brokers_handler))
        .route("/admin/brokers/rebuild", post(rebuild_brokers_handler))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

async fn publish_handler(
    State(state): State<AppState>,
    Path(topic): Path<String>,
    Query(params): Query<PublishParams>,
    conn: Option<Extension<Arc<ConnectionGuard>>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<PublishReceipt>), ApiError> {
    let mut request = PublishRequest {
        topic,
        key: params.key,
        tags: TagMap::new(),
        body: body.to_vec(),
        client: conn.map(|Extension(guard)| guard.remote_addr().to_string()),
    };

    if let Some(value) = headers.get(TAG_HEADER) {
        match parse_tags(value) {
            Ok(tags) => request.tags = tags,
            Err(e) => return Err(state.server.reject(&request, e).into()),
        }
    }

    let receipt = state.server.publish(request).await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

/// A bad tag header is a client error, not a broken envelope
fn parse_tags(value: &HeaderValue) -> Result<TagMap, GatewayError> {
    let raw = value
        .to_str()
        .map_err(|_| GatewayError::InvalidRequest(format!("{} is not valid text", TAG_HEADER)))?;
    tag::parse_tag_header(raw).map_err(|e| GatewayError::InvalidRequest(format!("invalid {} header: {}", TAG_HEADER, e)))
}

async fn health_handler(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let (status, code) = if state.server.is_running() && !state.server.brokers().is_closed() {
        ("UP", StatusCode::OK)
    } else {
        ("DOWN", StatusCode::SERVICE_UNAVAILABLE)
    };
    (
        code,
        Json(HealthResponse {
            status: status.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }),
    )
}

async fn stats_handler(State(state): State<AppState>) -> Json<GatewayStats> {
    Json(state.server.stats())
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.prometheus {
        Some(handle) => handle.render().into_response(),
        None => (StatusCode::NOT_FOUND, "metrics disabled").into_response(),
    }
}

async fn refresh_brokers_handler(
    State(state): State<AppState>,
    Json(req): Json<BrokerListRequest>,
) -> Result<Json<BrokerListResponse>, ApiError> {
    if req.brokers.is_empty() {
        return Err(GatewayError::InvalidRequest("broker list is empty".to_string()).into());
    }
    let brokers = state.server.brokers();
    let changed = brokers.refresh_broker_list(req.brokers);
    Ok(Json(BrokerListResponse {
        changed,
        version: brokers.version(),
        brokers: brokers.broker_list(),
        pending: brokers.pending_broker_list(),
    }))
}

async fn rebuild_brokers_handler(State(state): State<AppState>) -> Result<Json<BrokerListResponse>, ApiError> {
    let brokers = state.server.brokers();
    let version = brokers.rebuild()?;
    Ok(Json(BrokerListResponse {
        changed: true,
        version,
        brokers: brokers.broker_list(),
        pending: None,
    }))
}

/// Make-service that tracks every accepted connection.
///
/// The guard is shared by the connection's router; the connection counts
/// as closed once hyper drops it. Connections over the client cap get a
/// router that answers 503 and asks the client to close.
#[derive(Clone)]
pub struct TrackedConnections {
    app: Router,
    tracker: Arc<ConnectionTracker>,
}

impl TrackedConnections {
    pub fn new(app: Router, tracker: Arc<ConnectionTracker>) -> Self {
        Self { app, tracker }
    }
}

impl<'a> Service<IncomingStream<'a>> for TrackedConnections {
    type Response = Router;
    type Error = Infallible;
    type Future = std::future::Ready<Result<Router, Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, stream: IncomingStream<'a>) -> Self::Future {
        let app = match self.tracker.try_accept(stream.remote_addr()) {
            Some(guard) => self.app.clone().layer(Extension(Arc::new(guard))),
            None => Router::new().fallback(too_many_clients),
        };
        std::future::ready(Ok(app))
    }
}

async fn too_many_clients() -> Response {
    let body = ErrorResponse {
        error: "too_many_clients".to_string(),
        message: "too many concurrent publish clients".to_string(),
    };
    (StatusCode::SERVICE_UNAVAILABLE, [(header::CONNECTION, "close")], Json(body)).into_response()
}

/// Serve `app` on `listener` until `shutdown` resolves
pub async fn serve<S>(listener: TcpListener, app: Router, tracker: Arc<ConnectionTracker>, shutdown: S) -> std::io::Result<()>
where
    S: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    info!(addr = %addr, "Publish listener started");

    let result = axum::serve(listener, TrackedConnections::new(app, tracker))
        .with_graceful_shutdown(shutdown)
        .await;

    if let Err(e) = &result {
        error!(addr = %addr, error = %e, "Publish listener failed");
    }
    result
}

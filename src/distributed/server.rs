//! HTTP surface of a node
//!
//! Direct key access plus the `/propagate` endpoint peers push mutations to.
//! Store calls block on the store lock, so every handler runs them through
//! `spawn_blocking`.

use super::{Mutation, PropagateRequest};
use crate::KvError;
use crate::config::ServerConfig;
use crate::core::{Key, Metadata, Payload, Value, ValueType};
use crate::metrics::{AtomicCounters, CounterSnapshot, Metrics};
use crate::store::{Store, StoreStats};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Request, State};
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderName, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{Instrument, Span, debug, error, info, warn};

/// Error answered by a handler, rendered as `{"error": message}`
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized,
    Forbidden(String),
    NotFound(String),
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<KvError> for ApiError {
    fn from(e: KvError) -> Self {
        match e {
            KvError::Validation(_) | KvError::Serialization(_) => Self::BadRequest(e.to_string()),
            KvError::KeyNotFound(_) => Self::NotFound(e.to_string()),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::BadRequest(format!("Invalid request: {}", rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match self {
            Self::Unauthorized => "Unauthorized".to_string(),
            Self::BadRequest(msg)
            | Self::Forbidden(msg)
            | Self::NotFound(msg)
            | Self::Internal(msg) => msg,
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

/// Body of `POST {prefix}/key`
#[derive(Debug, Clone, Deserialize)]
pub struct SetRequest {
    pub key: String,
    pub value: serde_json::Value,
    #[serde(default)]
    pub ttl: Option<u64>,
    #[serde(default)]
    pub metadata: Option<Metadata>,
    /// Envelope type tag, `StringValue` when absent
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

impl SetRequest {
    fn into_entry(self) -> Result<(Key, Value), ApiError> {
        let tag = self.kind.as_deref().unwrap_or(ValueType::StringValue.as_str());
        let kind = ValueType::parse(tag)
            .ok_or_else(|| ApiError::BadRequest(format!("Invalid value type: {tag}")))?;
        let payload = Payload::from_wire(kind, &self.value)?;
        let value = Value::new(payload)
            .with_ttl(self.ttl)
            .with_metadata(self.metadata.unwrap_or_default());
        Ok((Key::parse(&self.key), value))
    }
}

#[derive(Serialize)]
struct StatsResponse {
    node_id: String,
    uptime: f64,
    #[serde(flatten)]
    counters: CounterSnapshot,
    store: StoreStats,
}

/// State shared by every handler
pub struct ServerState {
    pub store: Arc<Store>,
    pub node_id: String,
    pub counters: AtomicCounters,
    auth_token: Option<String>,
    allow_propagation: bool,
    source_header: HeaderName,
    metrics: Option<Arc<Metrics>>,
    started: Instant,
}

impl ServerState {
    pub fn uptime(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    fn authorize(&self, headers: &HeaderMap) -> Result<(), ApiError> {
        let Some(expected) = &self.auth_token else {
            return Ok(());
        };
        let presented = headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));

        match presented {
            Some(token) if constant_time_eq(token.as_bytes(), expected.as_bytes()) => Ok(()),
            _ => {
                self.counters.inc_unauthorized();
                if let Some(metrics) = &self.metrics {
                    metrics.http_unauthorized.inc();
                }
                Err(ApiError::Unauthorized)
            }
        }
    }

    /// Whether the loop-guard header names this node
    fn is_own_propagation(&self, headers: &HeaderMap) -> bool {
        headers
            .get(&self.source_header)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|source| source == self.node_id)
    }

    fn failure(&self, e: KvError) -> ApiError {
        let err = ApiError::from(e);
        if let ApiError::Internal(msg) = &err {
            self.counters.inc_errors();
            error!("Store error: {}", msg);
        }
        err
    }

    /// Run a store call on the blocking pool
    async fn with_store<T, F>(self: &Arc<Self>, f: F) -> Result<T, ApiError>
    where
        F: FnOnce(&Store) -> crate::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.store);
        let span = Span::current();
        let result = tokio::task::spawn_blocking(move || span.in_scope(|| f(&store)))
            .await
            .map_err(|e| {
                self.counters.inc_errors();
                ApiError::Internal(format!("Store task failed: {e}"))
            })?;
        result.map_err(|e| self.failure(e))
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// HTTP server for one node
pub struct DistributedServer {
    listen_addr: String,
    api_prefix: String,
    log_requests: bool,
    state: Arc<ServerState>,
    cancel_token: CancellationToken,
    span: Span,
}

impl DistributedServer {
    pub fn new(
        config: &ServerConfig,
        node_id: impl Into<String>,
        store: Arc<Store>,
        cancel_token: CancellationToken,
    ) -> crate::Result<Self> {
        let node_id = node_id.into();
        let source_header = HeaderName::try_from(config.propagation_source_header.as_str())
            .map_err(|e| {
                KvError::Config(format!(
                    "Invalid propagation source header {:?}: {e}",
                    config.propagation_source_header
                ))
            })?;

        let span = tracing::info_span!("distributed_server", node_id = %node_id);
        Ok(Self {
            listen_addr: config.listen_addr.clone(),
            api_prefix: config.api_prefix.trim_end_matches('/').to_string(),
            log_requests: config.log_requests,
            state: Arc::new(ServerState {
                store,
                node_id,
                counters: AtomicCounters::new(),
                auth_token: config.auth_token.clone().filter(|t| !t.is_empty()),
                allow_propagation: config.allow_propagation,
                source_header,
                metrics: None,
                started: Instant::now(),
            }),
            cancel_token,
            span,
        })
    }

    /// Record HTTP metrics and expose them on `{prefix}/metrics`
    ///
    /// Must be called before the server starts handling requests.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        if let Some(state) = Arc::get_mut(&mut self.state) {
            state.metrics = Some(metrics);
        } else {
            warn!("Server state already shared, metrics not attached");
        }
        self
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn state(&self) -> &Arc<ServerState> {
        &self.state
    }

    pub fn router(&self) -> Router {
        let mut api = Router::new()
            .route("/key", post(set_key))
            .route("/key/{key}", get(get_key).delete(delete_key))
            .route("/propagate", post(propagate))
            .route("/health", get(health))
            .route("/stats", get(stats));
        if self.state.metrics.is_some() {
            api = api.route("/metrics", get(prometheus_metrics));
        }

        let api = api
            .layer(middleware::from_fn_with_state(Arc::clone(&self.state), track))
            .with_state(Arc::clone(&self.state));

        let app = if self.api_prefix.is_empty() {
            api
        } else {
            Router::new().nest(&self.api_prefix, api)
        };

        if self.log_requests {
            app.layer(TraceLayer::new_for_http())
        } else {
            app
        }
    }

    /// Bind `listen_addr` and serve until the cancellation token fires
    pub async fn run(&self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(&self.listen_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until the cancellation token fires
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        let span = self.span.clone();
        async {
            let addr = listener.local_addr()?;
            info!(%addr, prefix = %self.api_prefix, "HTTP server listening");

            axum::serve(listener, self.router())
                .with_graceful_shutdown(self.cancel_token.clone().cancelled_owned())
                .await?;

            info!("HTTP server stopped");
            Ok(())
        }
        .instrument(span)
        .await
    }
}

async fn track(State(state): State<Arc<ServerState>>, request: Request, next: Next) -> Response {
    let start = Instant::now();
    state.counters.inc_requests();
    let response = next.run(request).await;
    if let Some(metrics) = &state.metrics {
        metrics.http_requests.inc();
        if response.status().is_server_error() {
            metrics.http_errors.inc();
        }
        metrics.request_latency.observe(start.elapsed().as_secs_f64());
    }
    response
}

async fn get_key(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Path(key): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.counters.inc_gets();
    state.authorize(&headers)?;

    let key = Key::parse(&key);
    let envelope = state
        .with_store(move |store| {
            store
                .get_value(key, false)?
                .map(|value| value.to_structured())
                .transpose()
        })
        .await?;

    envelope
        .map(Json)
        .ok_or_else(|| ApiError::NotFound("Key not found".to_string()))
}

async fn set_key(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    body: Result<Json<SetRequest>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.counters.inc_sets();
    state.authorize(&headers)?;

    let Json(request) = body?;
    let (key, value) = request.into_entry()?;
    state
        .with_store(move |store| store.set_value(key, value))
        .await?;
    Ok(Json(json!({ "success": true })))
}

async fn delete_key(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Path(key): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.counters.inc_deletes();
    state.authorize(&headers)?;

    let key = Key::parse(&key);
    if state.with_store(move |store| store.delete(key)).await? {
        Ok(Json(json!({ "success": true })))
    } else {
        Err(ApiError::NotFound("Key not found".to_string()))
    }
}

async fn propagate(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    body: Result<Json<PropagateRequest>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.counters.inc_propagations_received();
    state.authorize(&headers)?;

    if !state.allow_propagation {
        return Err(ApiError::Forbidden("Propagation not allowed".to_string()));
    }

    if state.is_own_propagation(&headers) {
        state.counters.inc_propagations_skipped();
        debug!("Skipping propagation from self");
        return Ok(Json(json!({ "success": true, "skipped": true })));
    }

    let Json(request) = body?;
    let mutation = Mutation::from_request(&request)?;
    debug!(operation = ?mutation.operation(), "Received propagation");
    state
        .with_store(move |store| store.apply(mutation))
        .await?;
    Ok(Json(json!({ "success": true })))
}

async fn health(State(state): State<Arc<ServerState>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "node_id": state.node_id,
        "uptime": state.uptime(),
    }))
}

async fn stats(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
) -> Result<Json<StatsResponse>, ApiError> {
    state.authorize(&headers)?;
    let store = state.with_store(Store::stats).await?;
    Ok(Json(StatsResponse {
        node_id: state.node_id.clone(),
        uptime: state.uptime(),
        counters: state.counters.snapshot(),
        store,
    }))
}

async fn prometheus_metrics(State(state): State<Arc<ServerState>>) -> Response {
    match &state.metrics {
        Some(metrics) => (
            [(CONTENT_TYPE, "text/plain; version=0.0.4")],
            metrics.gather(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use pattern_memory_api::{
    ApiQueryRequest, CacheLookup, ConsultStoreRequest, LearnOutcome, LearnRequest, PatternMemory,
    PutRequest, ResolveOutcome, StoredConsultation, API_CONTRACT_VERSION,
};
use pattern_memory_core::{
    CacheRequest, HistoricalMatch, PatternId, PatternRecord, PendingClarification, QueryOutcome,
    Resolution,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing_subscriber::EnvFilter;
use ulid::Ulid;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");

#[derive(Debug, Clone)]
struct ServiceState {
    memory: Arc<PatternMemory>,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    service_contract_version: &'static str,
    error: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ResolveRequest {
    pending_id: String,
    resolution: Resolution,
    #[serde(default, with = "time::serde::rfc3339::option")]
    resolved_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Deserialize)]
struct CacheLookupRequest {
    source: String,
    request: CacheRequest,
    #[serde(default, with = "time::serde::rfc3339::option")]
    as_of: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Deserialize)]
struct HistoryRequest {
    text: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    as_of: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize)]
struct HistoryResponse {
    count: usize,
    matches: Vec<HistoricalMatch>,
}

#[derive(Debug, Clone, Serialize)]
struct GetResponse {
    found: bool,
    record: Option<PatternRecord>,
}

#[derive(Debug, Clone, Serialize)]
struct PendingResponse {
    count: usize,
    pending: Vec<PendingClarification>,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Parser)]
#[command(name = "pattern-memory-service")]
#[command(about = "Local HTTP service for Pattern Memory")]
struct Args {
    #[arg(long, default_value = "./pattern_memory")]
    root: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = StatusCode::BAD_REQUEST;
        (status, Json(self)).into_response()
    }
}

impl ServiceState {
    fn error(message: impl Into<String>) -> ServiceError {
        ServiceError { service_contract_version: SERVICE_CONTRACT_VERSION, error: message.into() }
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .route("/v1/pattern/learn", post(pattern_learn))
        .route("/v1/pattern/resolve", post(pattern_resolve))
        .route("/v1/pattern/put", post(pattern_put))
        .route("/v1/pattern/:id", get(pattern_get))
        .route("/v1/pending", get(pending_list))
        .route("/v1/query", post(query_run))
        .route("/v1/cache/lookup", post(cache_lookup))
        .route("/v1/cache/store", post(cache_store))
        .route("/v1/cache/history", post(cache_history))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    let memory = PatternMemory::open(&args.root)?;
    let state = ServiceState { memory: Arc::new(memory) };

    tracing::info!(bind = %args.bind, root = %args.root.display(), "pattern memory service listening");
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn pattern_learn(
    State(state): State<ServiceState>,
    Json(request): Json<LearnRequest>,
) -> Result<Json<ServiceEnvelope<LearnOutcome>>, ServiceError> {
    let outcome =
        state.memory.learn(request).map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(outcome)))
}

async fn pattern_resolve(
    State(state): State<ServiceState>,
    Json(request): Json<ResolveRequest>,
) -> Result<Json<ServiceEnvelope<ResolveOutcome>>, ServiceError> {
    let outcome = state
        .memory
        .resolve(&request.pending_id, request.resolution, request.resolved_at)
        .map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(outcome)))
}

async fn pattern_put(
    State(state): State<ServiceState>,
    Json(request): Json<PutRequest>,
) -> Result<Json<ServiceEnvelope<PatternRecord>>, ServiceError> {
    let record = state.memory.put(request).map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(record)))
}

async fn pattern_get(
    State(state): State<ServiceState>,
    Path(id): Path<String>,
) -> Result<Json<ServiceEnvelope<GetResponse>>, ServiceError> {
    let parsed = Ulid::from_string(&id)
        .map_err(|err| ServiceState::error(format!("invalid ULID `{id}`: {err}")))?;
    let record = state
        .memory
        .get(PatternId(parsed))
        .map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(GetResponse { found: record.is_some(), record })))
}

async fn pending_list(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<PendingResponse>>, ServiceError> {
    let pending =
        state.memory.list_pending().map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(PendingResponse { count: pending.len(), pending })))
}

async fn query_run(
    State(state): State<ServiceState>,
    Json(request): Json<ApiQueryRequest>,
) -> Result<Json<ServiceEnvelope<QueryOutcome>>, ServiceError> {
    let outcome =
        state.memory.query(request).map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(outcome)))
}

async fn cache_lookup(
    State(state): State<ServiceState>,
    Json(request): Json<CacheLookupRequest>,
) -> Result<Json<ServiceEnvelope<CacheLookup>>, ServiceError> {
    let lookup = state
        .memory
        .consult_lookup(&request.source, &request.request, request.as_of)
        .map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(lookup)))
}

async fn cache_store(
    State(state): State<ServiceState>,
    Json(request): Json<ConsultStoreRequest>,
) -> Result<Json<ServiceEnvelope<StoredConsultation>>, ServiceError> {
    let stored =
        state.memory.consult_store(request).map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(stored)))
}

async fn cache_history(
    State(state): State<ServiceState>,
    Json(request): Json<HistoryRequest>,
) -> Result<Json<ServiceEnvelope<HistoryResponse>>, ServiceError> {
    let matches = state
        .memory
        .history_search(&request.text, request.as_of)
        .map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(HistoryResponse { count: matches.len(), matches })))
}

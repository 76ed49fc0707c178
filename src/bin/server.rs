//! air4-memory server
//!
//! HTTP API for the memory system.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use air4_memory::{
    completion::{CompletionService, OllamaClient},
    config::Config,
    context::ContextBuilder,
    embedding::provider_from_config,
    error::Error,
    memory::{MemoryManager, Metadata, MetadataFilter, SessionKey},
    message::{Role, Turn},
    profile::{ProfilePatch, ProfileStore, UserProfile},
    records::{FactStore, RecordOwner},
    retrieval::{DiversityMetric, Retriever, ScoredBlock, SearchOptions},
    storage::{
        open_vector_store, RecordFilter, SqliteStorage, StoredRecord, StoredSummary,
        StoredTriple, VectorStore,
    },
    summarizer::{Summarizer, SummaryRecord},
};

/// Application state shared across handlers
struct AppState {
    config: Config,
    store: Arc<dyn VectorStore>,
    memory: Arc<MemoryManager>,
    retriever: Arc<Retriever>,
    context: ContextBuilder,
    summarizer: Summarizer,
    records: FactStore,
    profiles: ProfileStore,
}

type SharedState = Arc<AppState>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;
    tracing::info!("Starting air4-memory server on port {}", config.server_port);
    tracing::info!("Data directory: {:?}", config.data_dir);
    config.ensure_dirs()?;

    // Initialize components
    let embedder = provider_from_config(&config)?;
    let store = open_vector_store(&config, embedder).await?;
    tracing::info!("Vector store backend: {}", store.backend());

    let completion: Option<Arc<dyn CompletionService>> = match OllamaClient::from_config(&config)? {
        Some(client) => {
            tracing::info!("Completion model: {}", client.model());
            Some(Arc::new(client))
        }
        None => {
            tracing::info!("No completion service configured; HyDE and summaries fall back");
            None
        }
    };

    let sqlite = Arc::new(SqliteStorage::new(&config)?);
    let records = FactStore::new(sqlite.clone());
    let profiles = ProfileStore::new(sqlite.clone());
    let memory = Arc::new(MemoryManager::new(store.clone(), &config)?);
    let retriever = Arc::new(Retriever::new(store.clone(), completion.clone(), &config));
    let context = ContextBuilder::new(retriever.clone(), memory.clone(), &config)
        .with_summary_store(sqlite)
        .with_profiles(profiles.clone());
    let summarizer = Summarizer::new(completion, records.clone(), config.completion_timeout);

    let state = Arc::new(AppState {
        config: config.clone(),
        store,
        memory,
        retriever,
        context,
        summarizer,
        records,
        profiles,
    });

    // Build router
    let app = Router::new()
        // Health check
        .route("/health", get(health))
        // Long-term memory
        .route("/ingest", post(ingest))
        .route("/search", post(search))
        .route("/context", post(build_context))
        // Short-term memory and summaries
        .route("/turns", get(get_turns).post(push_turn))
        .route("/summarize", post(summarize))
        .route("/summaries/:user_id", get(recent_summaries))
        .route("/summaries/:user_id/:session_id", get(get_summary))
        // Facts and todos
        .route("/facts", get(list_facts).post(add_fact))
        .route("/facts/:hash", delete(delete_fact))
        .route("/todos", get(list_todos).post(add_todo))
        .route("/todos/:hash/done", post(set_todo_done))
        .route("/todos/:hash", delete(delete_todo))
        .route("/triples", get(list_triples))
        // Profiles
        .route(
            "/profiles/:user_id",
            get(get_profile).patch(patch_profile).put(put_profile),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .with_state(state);

    let port = config.server_port;
    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    tracing::info!("Server listening on http://127.0.0.1:{}", port);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Map a library error to a status code, logging it
fn error_status(e: Error) -> StatusCode {
    let status = match &e {
        Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        e if e.is_dependency_failure() => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    tracing::warn!(error = %e, %status, "request failed");
    status
}

// === Handlers ===

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    backend: &'static str,
    entries: Option<usize>,
}

async fn health(State(state): State<SharedState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        backend: state.store.backend(),
        entries: state.store.len().await.ok(),
    })
}

// --- Memory handlers ---

#[derive(Debug, Deserialize)]
struct IngestRequest {
    text: String,
    #[serde(default)]
    metadata: Metadata,
    /// Stable document key; re-ingesting under the same key adds nothing
    key: Option<String>,
}

#[derive(Debug, Serialize)]
struct IngestResponse {
    ids: Vec<String>,
}

async fn ingest(
    State(state): State<SharedState>,
    Json(req): Json<IngestRequest>,
) -> Result<Json<IngestResponse>, StatusCode> {
    let ids = match req.key.as_deref() {
        Some(key) => state.memory.ingest_keyed(&req.text, req.metadata, key).await,
        None => state.memory.ingest(&req.text, req.metadata).await,
    }
    .map_err(error_status)?;

    Ok(Json(IngestResponse { ids }))
}

#[derive(Debug, Deserialize)]
struct SearchRequest {
    query: String,
    k: Option<usize>,
    mmr_lambda: Option<f32>,
    use_hyde: Option<bool>,
    metadata_filter: Option<MetadataFilter>,
    score_threshold: Option<f32>,
    candidate_multiplier: Option<u32>,
    diversity: Option<DiversityMetric>,
}

async fn search(
    State(state): State<SharedState>,
    Json(req): Json<SearchRequest>,
) -> Json<Vec<ScoredBlock>> {
    let options = SearchOptions {
        mmr_lambda: req.mmr_lambda,
        use_hyde: req.use_hyde.unwrap_or(state.config.use_hyde),
        metadata_filter: req.metadata_filter,
        candidate_multiplier: req
            .candidate_multiplier
            .unwrap_or(state.config.candidate_multiplier),
        score_threshold: req.score_threshold,
        diversity: req.diversity.unwrap_or_default(),
    };
    let k = req.k.unwrap_or(state.config.default_k);

    Json(state.retriever.search(&req.query, k, &options).await)
}

// --- Context handlers ---

#[derive(Debug, Deserialize)]
struct ContextRequest {
    query: String,
    k: Option<usize>,
    max_tokens: Option<u32>,
    metadata_filter: Option<MetadataFilter>,
}

#[derive(Debug, Serialize)]
struct ContextResponse {
    blocks: Vec<ScoredBlock>,
    sources: Vec<String>,
    prompt: String,
    total_tokens: u32,
}

async fn build_context(
    State(state): State<SharedState>,
    Json(req): Json<ContextRequest>,
) -> Json<ContextResponse> {
    let k = req.k.unwrap_or(state.config.default_k);
    let context = state
        .context
        .build(&req.query, k, req.max_tokens, req.metadata_filter)
        .await;

    Json(ContextResponse {
        sources: context.sources_for_display(),
        prompt: context.format_for_prompt(),
        total_tokens: context.total_tokens,
        blocks: context.blocks,
    })
}

// --- Turn handlers ---

#[derive(Debug, Deserialize)]
struct PushTurnRequest {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct TurnsResponse {
    turns: Vec<Turn>,
    context: String,
    summary: String,
}

async fn push_turn(
    State(state): State<SharedState>,
    Json(req): Json<PushTurnRequest>,
) -> Result<StatusCode, StatusCode> {
    let role: Role = req.role.parse().map_err(error_status)?;
    state.memory.push_turn(role, req.content);
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct TurnsQuery {
    user_id: Option<String>,
    session_id: Option<String>,
}

async fn get_turns(
    State(state): State<SharedState>,
    Query(query): Query<TurnsQuery>,
) -> Json<TurnsResponse> {
    let session = match (query.user_id, query.session_id) {
        (Some(user_id), Some(session_id)) => Some(SessionKey::new(user_id, session_id)),
        _ => None,
    };

    Json(TurnsResponse {
        turns: state.memory.turns(),
        context: state.memory.short_context(),
        summary: state.memory.short_summary(session.as_ref()),
    })
}

// --- Summary handlers ---

#[derive(Debug, Deserialize)]
struct SummarizeRequest {
    user_id: String,
    session_id: String,
    user_turn: String,
    assistant_turn: String,
}

async fn summarize(
    State(state): State<SharedState>,
    Json(req): Json<SummarizeRequest>,
) -> Result<Json<SummaryRecord>, StatusCode> {
    let record = state
        .summarizer
        .summarize(&req.user_id, &req.session_id, &req.user_turn, &req.assistant_turn)
        .await
        .map_err(error_status)?;

    let session = SessionKey::new(req.user_id, req.session_id);
    state.memory.record_summary(&session, &record);
    Ok(Json(record))
}

async fn get_summary(
    State(state): State<SharedState>,
    Path((user_id, session_id)): Path<(String, String)>,
) -> Result<Json<SummaryRecord>, StatusCode> {
    state
        .records
        .storage()
        .get_summary(&user_id, &session_id)
        .map_err(error_status)?
        .map(Json)
        .ok_or_else(|| {
            error_status(Error::not_found(format!(
                "no summary for {user_id}/{session_id}"
            )))
        })
}

#[derive(Debug, Deserialize)]
struct LimitQuery {
    limit: Option<usize>,
}

async fn recent_summaries(
    State(state): State<SharedState>,
    Path(user_id): Path<String>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Vec<StoredSummary>>, StatusCode> {
    state
        .records
        .storage()
        .recent_summaries(&user_id, query.limit.unwrap_or(3))
        .map(Json)
        .map_err(error_status)
}

// --- Fact and todo handlers ---

#[derive(Debug, Deserialize)]
struct AddRecordRequest {
    text: String,
    #[serde(default)]
    tags: Vec<String>,
    user_id: Option<String>,
    session_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct AddRecordResponse {
    inserted: bool,
    hash: String,
}

#[derive(Debug, Deserialize)]
struct SetDoneRequest {
    #[serde(default = "default_done")]
    done: bool,
}

fn default_done() -> bool {
    true
}

async fn list_facts(
    State(state): State<SharedState>,
    Query(filter): Query<RecordFilter>,
) -> Result<Json<Vec<StoredRecord>>, StatusCode> {
    state.records.list_facts(&filter).map(Json).map_err(error_status)
}

async fn add_fact(
    State(state): State<SharedState>,
    Json(req): Json<AddRecordRequest>,
) -> Result<Json<AddRecordResponse>, StatusCode> {
    let owner = RecordOwner {
        user_id: req.user_id,
        session_id: req.session_id,
    };
    let hash = state.records.hash_for(&req.text, &owner);
    let inserted = state
        .records
        .add_fact(&req.text, &req.tags, &owner)
        .map_err(error_status)?;

    Ok(Json(AddRecordResponse { inserted, hash }))
}

async fn delete_fact(
    State(state): State<SharedState>,
    Path(hash): Path<String>,
) -> Result<StatusCode, StatusCode> {
    match state.records.delete_fact(&hash).map_err(error_status)? {
        true => Ok(StatusCode::NO_CONTENT),
        false => Err(missing_record(&hash)),
    }
}

async fn list_todos(
    State(state): State<SharedState>,
    Query(filter): Query<RecordFilter>,
) -> Result<Json<Vec<StoredRecord>>, StatusCode> {
    state.records.list_todos(&filter).map(Json).map_err(error_status)
}

async fn add_todo(
    State(state): State<SharedState>,
    Json(req): Json<AddRecordRequest>,
) -> Result<Json<AddRecordResponse>, StatusCode> {
    let owner = RecordOwner {
        user_id: req.user_id,
        session_id: req.session_id,
    };
    let hash = state.records.hash_for(&req.text, &owner);
    let inserted = state
        .records
        .add_todo(&req.text, &req.tags, &owner)
        .map_err(error_status)?;

    Ok(Json(AddRecordResponse { inserted, hash }))
}

async fn set_todo_done(
    State(state): State<SharedState>,
    Path(hash): Path<String>,
    Json(req): Json<SetDoneRequest>,
) -> Result<StatusCode, StatusCode> {
    match state
        .records
        .set_todo_done(&hash, req.done)
        .map_err(error_status)?
    {
        true => Ok(StatusCode::NO_CONTENT),
        false => Err(missing_record(&hash)),
    }
}

async fn delete_todo(
    State(state): State<SharedState>,
    Path(hash): Path<String>,
) -> Result<StatusCode, StatusCode> {
    match state.records.delete_todo(&hash).map_err(error_status)? {
        true => Ok(StatusCode::NO_CONTENT),
        false => Err(missing_record(&hash)),
    }
}

fn missing_record(hash: &str) -> StatusCode {
    error_status(Error::not_found(format!("no record with hash {hash}")))
}

#[derive(Debug, Deserialize)]
struct TriplesQuery {
    user_id: String,
    subject: Option<String>,
    limit: Option<usize>,
}

async fn list_triples(
    State(state): State<SharedState>,
    Query(query): Query<TriplesQuery>,
) -> Result<Json<Vec<StoredTriple>>, StatusCode> {
    // Facts are extracted with the user as their own subject
    let subject = query.subject.as_deref().unwrap_or(&query.user_id);
    state
        .records
        .facts_for_subject(&query.user_id, subject, query.limit.unwrap_or(20))
        .map(Json)
        .map_err(error_status)
}

// --- Profile handlers ---

async fn get_profile(
    State(state): State<SharedState>,
    Path(user_id): Path<String>,
) -> Result<Json<UserProfile>, StatusCode> {
    state.profiles.get(&user_id).map(Json).map_err(error_status)
}

async fn patch_profile(
    State(state): State<SharedState>,
    Path(user_id): Path<String>,
    Json(patch): Json<ProfilePatch>,
) -> Result<Json<UserProfile>, StatusCode> {
    state
        .profiles
        .patch(&user_id, patch)
        .map(Json)
        .map_err(error_status)
}

async fn put_profile(
    State(state): State<SharedState>,
    Path(user_id): Path<String>,
    Json(mut profile): Json<UserProfile>,
) -> Result<Json<UserProfile>, StatusCode> {
    // The path decides whose profile this is
    profile.user_id = user_id;
    state.profiles.put(profile).map(Json).map_err(error_status)
}

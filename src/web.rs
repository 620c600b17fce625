use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::signal;

use crate::analysis::AnalysisSummary;
use crate::codebase::Snippet;
use crate::engine::{Engine, EngineError, ErrorClass, DEFAULT_TOP_K};
use crate::extract::ImpactAnalysis;
use crate::index::Removal;
use crate::record::Record;

#[derive(Clone)]
struct SharedState {
    engine: Arc<Engine>,
}

pub fn router(engine: Arc<Engine>) -> Router {
    let shared_state = Arc::new(SharedState { engine });

    Router::new()
        .route("/", get(health))
        .route("/api/enrich_repo", post(enrich_repo))
        .route("/api/delete_repo", post(delete_repo))
        .route("/api/find_solution_candidates", post(find_solution_candidates))
        .route("/api/armory/size", get(armory_size))
        .route("/api/armory/rebuild", post(armory_rebuild))
        .route("/api/analyse", post(analyse))
        .route("/api/impact_analysis", post(impact_analysis))
        .route("/api/query_codebase", post(query_codebase))
        .route("/api/get_ollama_models", get(get_ollama_models))
        .route("/api/set_llm_model", post(set_llm_model))
        .layer(
            tower_http::trace::TraceLayer::new_for_http()
                .make_span_with(tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO))
                .on_response(tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO)),
        )
        .with_state(shared_state)
}

async fn start_app(engine: Arc<Engine>, listen: String) -> anyhow::Result<()> {
    let app = router(engine);

    let listener = tokio::net::TcpListener::bind(&listen).await?;
    log::info!("listening on {listen}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    log::info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            log::error!("failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                log::error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => log::warn!("received Ctrl+C, shutting down"),
        _ = terminate => log::warn!("received SIGTERM, shutting down"),
    }
}

/// Serve until a shutdown signal arrives. The caller keeps its own handle
/// on the engine so the engine is dropped outside the runtime.
pub fn start_daemon(engine: Arc<Engine>, listen: &str) -> anyhow::Result<()> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(start_app(engine, listen.to_string()))
}

#[derive(Debug)]
struct HttpError(EngineError);

impl IntoResponse for HttpError {
    fn into_response(self) -> axum::response::Response {
        let status = match self.0.class() {
            ErrorClass::Invalid => StatusCode::BAD_REQUEST,
            ErrorClass::NotFound => StatusCode::NOT_FOUND,
            ErrorClass::Conflict => {
                log::error!("{self:?}");
                StatusCode::CONFLICT
            }
            ErrorClass::Internal => {
                log::error!("{self:?}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({"error": self.0.to_string()}))).into_response()
    }
}

impl<E> From<E> for HttpError
where
    E: Into<EngineError>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

/// Run a blocking engine call off the async workers.
async fn blocking<T, F>(state: &SharedState, f: F) -> Result<T, HttpError>
where
    F: FnOnce(&Engine) -> Result<T, EngineError> + Send + 'static,
    T: Send + 'static,
{
    let engine = state.engine.clone();
    tokio::task::spawn_blocking(move || f(&engine))
        .await
        .map_err(|e| EngineError::Other(anyhow::anyhow!("worker task failed: {e}")))?
        .map_err(HttpError)
}

fn require(value: Option<String>, field: &str) -> Result<String, HttpError> {
    match value.map(|v| v.trim().to_string()) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(HttpError(EngineError::Validation(format!(
            "Missing '{field}' in request body"
        )))),
    }
}

async fn health() -> Json<Value> {
    Json(json!({"status": "ok", "message": "armory is running"}))
}

#[derive(Debug, Deserialize)]
struct RepoRequest {
    url: Option<String>,
}

async fn enrich_repo(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<RepoRequest>,
) -> Result<Json<Record>, HttpError> {
    log::debug!("payload: {payload:?}");
    let url = require(payload.url, "url")?;
    blocking(&state, move |engine| engine.enrich(&url)).await.map(Json)
}

async fn delete_repo(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<RepoRequest>,
) -> Result<Json<Removal>, HttpError> {
    let url = require(payload.url, "url")?;
    let removal = blocking(&state, {
        let url = url.clone();
        move |engine| engine.delete(&url)
    })
    .await?;

    match removal {
        Removal::NotFound => Err(HttpError(EngineError::NotFound(url))),
        removed => Ok(Json(removed)),
    }
}

#[derive(Debug, Deserialize)]
struct CandidatesRequest {
    goal: Option<String>,
    top_k: Option<usize>,
}

#[derive(Debug, Serialize)]
struct Candidate {
    repo_name: String,
    url: String,
    score: f32,
    degraded: bool,
}

async fn find_solution_candidates(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<CandidatesRequest>,
) -> Result<Json<Vec<Candidate>>, HttpError> {
    log::debug!("payload: {payload:?}");
    let goal = require(payload.goal, "goal")?;
    let k = payload.top_k.unwrap_or(DEFAULT_TOP_K);

    let hits = blocking(&state, move |engine| engine.search(&goal, k)).await?;
    Ok(Json(
        hits.into_iter()
            .map(|hit| Candidate {
                repo_name: hit.metadata.repo_name,
                url: hit.metadata.url,
                score: hit.score,
                degraded: hit.metadata.degraded,
            })
            .collect(),
    ))
}

async fn armory_size(State(state): State<Arc<SharedState>>) -> Result<Json<Value>, HttpError> {
    let (size, index) = blocking(&state, |engine| Ok((engine.index_size()?, engine.index_state()))).await?;
    Ok(Json(json!({ "size": size, "index": index })))
}

async fn armory_rebuild(State(state): State<Arc<SharedState>>) -> Result<Json<Value>, HttpError> {
    let entries = blocking(&state, |engine| engine.rebuild()).await?;
    Ok(Json(json!({ "entries": entries })))
}

#[derive(Debug, Deserialize)]
struct AnalyseRequest {
    file: Option<String>,
    project: Option<String>,
}

async fn analyse(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<AnalyseRequest>,
) -> Result<Json<AnalysisSummary>, HttpError> {
    let file = PathBuf::from(require(payload.file, "file")?);
    let project = payload.project.filter(|p| !p.trim().is_empty()).map(PathBuf::from);

    blocking(&state, move |engine| match project {
        Some(root) => engine.analyse_in(&root, &file),
        None => engine.analyse(&file),
    })
    .await
    .map(Json)
}

#[derive(Debug, Deserialize)]
struct ImpactRequest {
    url: Option<String>,
    goal: Option<String>,
    #[serde(default)]
    project_structure: Value,
}

async fn impact_analysis(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<ImpactRequest>,
) -> Result<Json<ImpactAnalysis>, HttpError> {
    let url = require(payload.url, "url")?;
    let goal = require(payload.goal, "goal")?;
    let structure = payload.project_structure;

    blocking(&state, move |engine| engine.impact(&url, &goal, &structure))
        .await
        .map(Json)
}

#[derive(Debug, Deserialize)]
struct CodebaseRequest {
    project_path: Option<String>,
    query: Option<String>,
    top_k: Option<usize>,
    #[serde(default)]
    reindex: bool,
}

async fn query_codebase(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<CodebaseRequest>,
) -> Result<Json<Vec<Snippet>>, HttpError> {
    log::debug!("payload: {payload:?}");
    let project = PathBuf::from(require(payload.project_path, "project_path")?);
    let query = require(payload.query, "query")?;
    if project.is_relative() {
        return Err(HttpError(EngineError::Validation(format!(
            "project_path must be absolute, got {}",
            project.display()
        ))));
    }
    let k = payload.top_k.unwrap_or(DEFAULT_TOP_K);
    let reindex = payload.reindex;

    blocking(&state, move |engine| {
        if reindex {
            engine.reindex_codebase(&project)?;
        }
        engine.search_codebase(&project, &query, k)
    })
    .await
    .map(Json)
}

async fn get_ollama_models(State(state): State<Arc<SharedState>>) -> Result<Json<Vec<String>>, HttpError> {
    blocking(&state, |engine| engine.list_models()).await.map(Json)
}

#[derive(Debug, Deserialize)]
struct SetModelRequest {
    model_name: Option<String>,
}

async fn set_llm_model(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<SetModelRequest>,
) -> Result<Json<Value>, HttpError> {
    let model = require(payload.model_name, "model_name")?;
    let message = blocking(&state, move |engine| engine.set_model(&model)).await?;
    Ok(Json(json!({ "message": message })))
}

use anyhow::Result;
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use recollex::{
    DocId, Document, Durability, HashingEncoder, IndexConfig, IndexStats, Input, QueryOptions, Recollex,
    SearchHit, SparseVector, TieBreak,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

const MAX_K: usize = 100;

#[derive(Deserialize)]
pub struct SearchParams {
    pub q: String,
    #[serde(default = "default_k")]
    pub k: usize,
    #[serde(default)]
    pub recency: bool,
}
fn default_k() -> usize { 10 }

#[derive(Deserialize)]
pub struct VectorSearch {
    pub ids: Vec<u32>,
    pub weights: Vec<f32>,
    #[serde(default = "default_k")]
    pub k: usize,
    #[serde(default)]
    pub tie_break: TieBreak,
}

#[derive(Serialize)]
pub struct SearchResponse {
    pub took_s: f64,
    pub total_hits: usize,
    pub results: Vec<SearchHit>,
}

#[derive(Deserialize)]
pub struct BatchDoc {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub ids: Option<Vec<u32>>,
    #[serde(default)]
    pub weights: Option<Vec<f32>>,
    #[serde(default)]
    pub payload: Option<String>,
}

#[derive(Clone)]
pub struct AppState {
    pub index: Arc<Recollex>,
    pub admin_token: Option<String>,
}

/// Library errors mapped onto HTTP statuses.
pub struct ApiError(StatusCode, String);

impl From<recollex::Error> for ApiError {
    fn from(e: recollex::Error) -> Self {
        use recollex::Error::*;
        let status = match &e {
            Validation(_) | DimensionMismatch { .. } | EmptyQueryVector | InvalidArgument(_) | EncoderMissing => {
                StatusCode::BAD_REQUEST
            }
            IndexClosed => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError(status, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(serde_json::json!({ "error": self.1 }))).into_response()
    }
}

/// Open the index at `index_dir` and build the router around it.
///
/// Text search uses the hashing encoder with `dims` buckets unless the index was
/// built with a different dimensionality, in which case only vector search works.
pub fn build_app(index_dir: &str, dims: usize) -> Result<Router> {
    let index = Recollex::open_with(index_dir, IndexConfig::default().with_durability(Durability::Sync))?;
    let index = match index.dims() {
        Some(d) if d != dims => {
            tracing::warn!(index_dims = d, dims, "text search disabled: dims differ");
            index
        }
        _ => index.with_encoder(HashingEncoder::new(dims)?)?,
    };
    let admin_token = std::env::var("ADMIN_TOKEN").ok();

    // CORS: read CORS_ALLOW_ORIGIN (comma-separated) or allow Any by default
    let cors = match std::env::var("CORS_ALLOW_ORIGIN") {
        Ok(val) => {
            let origins: Vec<_> = val.split(',').filter_map(|s| s.trim().parse().ok()).collect();
            if origins.is_empty() {
                CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any)
            } else {
                CorsLayer::new().allow_origin(AllowOrigin::list(origins)).allow_methods(Any).allow_headers(Any)
            }
        }
        Err(_) => CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any),
    };

    Ok(router(AppState { index: Arc::new(index), admin_token }).layer(cors))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/stats", get(stats_handler))
        .route("/search", get(search_handler).post(vector_search_handler))
        .route("/doc/:doc_id", get(doc_handler))
        .route("/index/batch", post(index_batch))
        .route("/index/commit", post(index_commit))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

pub async fn search_handler(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<Json<SearchResponse>, ApiError> {
    let tie_break = if params.recency { TieBreak::Recency } else { TieBreak::DocIdAsc };
    let opts = QueryOptions::top(params.k.clamp(1, MAX_K)).tie_break(tie_break);
    run_search(&state, params.q.into(), opts).await
}

pub async fn vector_search_handler(
    State(state): State<AppState>,
    Json(body): Json<VectorSearch>,
) -> Result<Json<SearchResponse>, ApiError> {
    let Some(dims) = state.index.dims() else {
        // nothing has been indexed yet
        return Ok(Json(SearchResponse { took_s: 0.0, total_hits: 0, results: Vec::new() }));
    };
    let vector = SparseVector::new(dims, &body.ids, &body.weights)?;
    let opts = QueryOptions::top(body.k.clamp(1, MAX_K)).tie_break(body.tie_break);
    run_search(&state, vector.into(), opts).await
}

async fn run_search(
    state: &AppState,
    input: Input<'static>,
    opts: QueryOptions,
) -> Result<Json<SearchResponse>, ApiError> {
    let start = std::time::Instant::now();
    let index = state.index.clone();
    let results = blocking(move || match index.query_with(input, &opts) {
        Ok(hits) => Ok(hits),
        // nothing left after encoding, e.g. a query made only of stopwords
        Err(recollex::Error::EmptyQueryVector) => Ok(Vec::new()),
        Err(e) => Err(e),
    })
    .await?;
    let elapsed = start.elapsed();
    Ok(Json(SearchResponse { took_s: elapsed.as_secs_f64(), total_hits: results.len(), results }))
}

pub async fn doc_handler(State(state): State<AppState>, Path(doc_id): Path<DocId>) -> Result<Json<Document>, ApiError> {
    match state.index.get(doc_id)? {
        Some(doc) => Ok(Json(doc)),
        None => Err(ApiError(StatusCode::NOT_FOUND, format!("document {doc_id} not found"))),
    }
}

pub async fn stats_handler(State(state): State<AppState>) -> Result<Json<IndexStats>, ApiError> {
    Ok(Json(state.index.stats()?))
}

// --- Admin endpoints ---
async fn index_batch(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(docs): Json<Vec<BatchDoc>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    authorize(&state, &headers)?;
    let index = state.index.clone();
    let ids = blocking(move || {
        let dims = index.dims();
        let mut items: Vec<(Input<'static>, Option<String>)> = Vec::with_capacity(docs.len());
        for doc in docs {
            let input: Input = match (doc.ids, doc.weights, doc.text) {
                (Some(ids), Some(weights), _) => {
                    let dims = dims.ok_or_else(|| recollex::Error::InvalidArgument("index dims unknown".into()))?;
                    SparseVector::new(dims, &ids, &weights)?.into()
                }
                (None, None, Some(text)) => text.into(),
                _ => return Err(recollex::Error::InvalidArgument("need `text` or `ids` + `weights`".into())),
            };
            items.push((input, doc.payload));
        }
        index.add_many(items)
    })
    .await?;
    tracing::info!(added = ids.len(), "batch indexed");
    Ok(Json(serde_json::json!({ "added": ids })))
}

async fn index_commit(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<serde_json::Value>, ApiError> {
    authorize(&state, &headers)?;
    let index = state.index.clone();
    blocking(move || index.flush()).await?;
    Ok(Json(serde_json::json!({ "committed": true })))
}

async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> recollex::Result<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(res) => Ok(res?),
        Err(e) => Err(ApiError(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
    }
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let required = match &state.admin_token {
        Some(t) => t,
        None => return Err(ApiError(StatusCode::UNAUTHORIZED, "ADMIN_TOKEN not set".into())),
    };
    let provided = headers.get("X-ADMIN-TOKEN").and_then(|v| v.to_str().ok()).unwrap_or("");
    if provided == required {
        Ok(())
    } else {
        Err(ApiError(StatusCode::UNAUTHORIZED, "invalid admin token".into()))
    }
}

use crate::search::{SearchMode, SearchPlanner};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

pub struct ApiState {
    pub planner: SearchPlanner,
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
struct SearchParams {
    #[serde(default)]
    q: String,
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
}

type ApiError = (StatusCode, Json<serde_json::Value>);

fn bad_request(message: &str) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "error": message })),
    )
}

async fn search_handler(
    State(state): State<Arc<ApiState>>,
    Query(params): Query<SearchParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let query = params.q.trim().to_string();
    if query.is_empty() {
        return Err(bad_request("q is required"));
    }
    let mode_str = params.mode.as_deref().unwrap_or("hybrid");
    let Some(mode) = SearchMode::parse(mode_str) else {
        return Err(bad_request("mode must be keyword, hybrid, or semantic"));
    };
    let limit = params.limit.unwrap_or(10).clamp(1, 50);

    let start = Instant::now();
    let (results, _latency_ms) = state
        .planner
        .search(&query, mode, limit)
        .await
        .map_err(|err| {
            error!("search failed: {err:#}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": err.to_string() })),
            )
        })?;
    let duration_ms = (start.elapsed().as_secs_f64() * 10_000.0).round() / 10.0;

    Ok(Json(serde_json::json!({
        "query": query,
        "mode": mode.as_str(),
        "count": results.len(),
        "duration_ms": duration_ms,
        "results": results,
    })))
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/search", get(search_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the search API until interrupted.
pub async fn run_api_server(state: Arc<ApiState>, port: u16) -> anyhow::Result<()> {
    let app = router(state);
    let bind_addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("Search API listening on http://{bind_addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

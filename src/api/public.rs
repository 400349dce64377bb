// Public viewer API - latest posts, keyword search, and scanner stats.

use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;

use crate::error::Result;
use crate::index::{self, VideoWithCreator};
use crate::models::{Creator, IngestionStats};
use crate::scanner;
use crate::AppState;

const DEFAULT_PAGE_SIZE: i64 = 20;
const MAX_PAGE_SIZE: i64 = 100;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/latest", get(latest))
        .route("/search", get(search))
        .route("/creators/:id", get(get_creator))
        .route("/stats", get(stats))
}

#[derive(Debug, Deserialize)]
pub struct LatestQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// GET /api/latest?limit&offset - newest posts for the public viewer; the
/// offset doubles as the opaque cursor.
async fn latest(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LatestQuery>,
) -> Result<Json<Vec<VideoWithCreator>>> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_PAGE_SIZE);
    let offset = query.offset.unwrap_or(0).max(0);
    let videos = index::latest_videos(&state.pool, limit, offset).await?;
    Ok(Json(videos))
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub q: String,
    pub limit: Option<i64>,
}

/// GET /api/search?q&limit - ranked keyword search
async fn search(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<Vec<VideoWithCreator>>> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_PAGE_SIZE);
    let videos = index::keyword_search(&state.pool, &query.q, limit).await?;
    Ok(Json(videos))
}

/// GET /api/creators/:id - creator profile for the public viewer
async fn get_creator(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Creator>> {
    let creator = index::get_creator(&state.pool, &id).await?;
    Ok(Json(creator))
}

#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    pub scanner_enabled: bool,
    #[serde(flatten)]
    pub ingestion: IngestionStats,
}

/// GET /api/stats - current ingestion counters
async fn stats(State(state): State<Arc<AppState>>) -> Result<Json<StatsResponse>> {
    let ingestion = scanner::get_stats(&state.pool).await?;
    Ok(Json(StatsResponse {
        scanner_enabled: state.config.scanner.enabled,
        ingestion,
    }))
}

// Playlists API - import/export, reorder, block edits.

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::Result;
use crate::models::{Block, Playlist};
use crate::services::playlists;
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/import", post(import_playlist))
        .route("/:id", get(get_playlist))
        .route("/:id/export", get(export_playlist))
        .route("/blocks/reorder", put(reorder_blocks))
        .route("/blocks/:id", put(update_block).delete(delete_block))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportBody {
    pub display_id: String,
    pub playlist_name: String,
    /// Inline block definitions...
    #[serde(default)]
    pub blocks: Vec<playlists::NewBlock>,
    /// ...or raw CSV contents in the export shape.
    #[serde(default)]
    pub csv: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistDto {
    pub id: String,
    pub display_code: String,
    pub name: String,
    pub is_active: bool,
    pub loop_count: i64,
    pub total_blocks: i64,
    pub total_videos: i64,
    pub blocks: Vec<Block>,
}

async fn playlist_dto(state: &AppState, playlist: Playlist) -> Result<PlaylistDto> {
    let blocks = playlists::get_blocks(&state.pool, &playlist.id).await?;
    Ok(PlaylistDto {
        id: playlist.id,
        display_code: playlist.display_code,
        name: playlist.name,
        is_active: playlist.is_active,
        loop_count: playlist.loop_count,
        total_blocks: blocks.len() as i64,
        total_videos: blocks.iter().map(|b| b.video_count).sum(),
        blocks,
    })
}

/// POST /playlists/import - create a playlist from inline blocks or CSV;
/// it becomes the display's active playlist.
async fn import_playlist(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ImportBody>,
) -> Result<(StatusCode, Json<PlaylistDto>)> {
    let playlist = match body.csv {
        Some(ref csv) => {
            playlists::import_csv(
                &state.pool,
                &body.display_id,
                &body.playlist_name,
                csv.as_bytes(),
            )
            .await?
        }
        None => {
            playlists::create_playlist(
                &state.pool,
                &body.display_id,
                &body.playlist_name,
                &body.blocks,
            )
            .await?
        }
    };

    let dto = playlist_dto(&state, playlist).await?;
    Ok((StatusCode::CREATED, Json(dto)))
}

/// GET /playlists/:id
async fn get_playlist(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<PlaylistDto>> {
    let playlist = playlists::get_playlist(&state.pool, &id).await?;
    let dto = playlist_dto(&state, playlist).await?;
    Ok(Json(dto))
}

/// GET /playlists/:id/export - CSV in the import shape
async fn export_playlist(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let csv = playlists::export_csv(&state.pool, &id).await?;
    Ok((
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8"),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=\"playlist.csv\"",
            ),
        ],
        csv,
    ))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReorderBody {
    pub playlist_id: String,
    pub block_orders: Vec<BlockOrder>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockOrder {
    pub block_id: String,
    pub order: i64,
}

/// PUT /playlists/blocks/reorder - atomic dense reorder
async fn reorder_blocks(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ReorderBody>,
) -> Result<StatusCode> {
    let orders: Vec<(String, i64)> = body
        .block_orders
        .into_iter()
        .map(|o| (o.block_id, o.order))
        .collect();
    playlists::reorder_blocks(&state.pool, &body.playlist_id, &orders).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// PUT /playlists/blocks/:id - patch a block (content edits require idle)
async fn update_block(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(update): Json<playlists::BlockUpdate>,
) -> Result<Json<Block>> {
    let block = playlists::update_block(&state.pool, &id, &update).await?;
    Ok(Json(block))
}

/// DELETE /playlists/blocks/:id - remove and renumber
async fn delete_block(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    playlists::delete_block(&state.pool, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// Displays API - create/list/delete displays, enqueue commands, reset.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::hub::CommandDelivery;
use crate::models::Display;
use crate::services::{displays, playback::DisplayCommand, playlists, timeline};
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_displays).post(create_display))
        .route("/:code", get(get_display).delete(delete_display))
        .route("/:code/commands", post(send_command))
        .route("/:code/reset", post(reset_display))
        .route("/:code/stats", get(display_stats))
}

#[derive(Debug, Deserialize)]
pub struct CreateDisplayBody {
    pub name: String,
    pub code: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayDto {
    pub code: String,
    pub name: String,
    pub playback_state: String,
    pub current_playlist_id: Option<String>,
    pub current_video_id: Option<String>,
    pub timeline_position: i64,
    pub muted: bool,
    pub is_online: bool,
    pub owner_token: String,
    pub created_at: String,
}

impl DisplayDto {
    fn from_display(display: Display) -> Self {
        let is_online = displays::is_online(&display);
        Self {
            code: display.code,
            name: display.name,
            playback_state: display.playback_state,
            current_playlist_id: display.current_playlist_id,
            current_video_id: display.current_video_id,
            timeline_position: display.timeline_position,
            muted: display.muted,
            is_online,
            owner_token: display.owner_token,
            created_at: display.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResponse {
    pub status: CommandDelivery,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<crate::services::playback::StateDelta>,
}

/// POST /displays - create a display with an admin-chosen code
async fn create_display(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateDisplayBody>,
) -> Result<(StatusCode, Json<DisplayDto>)> {
    let display = displays::create_display(&state.pool, &body.code, &body.name).await?;
    Ok((StatusCode::CREATED, Json(DisplayDto::from_display(display))))
}

/// GET /displays - all displays with derived liveness
async fn list_displays(State(state): State<Arc<AppState>>) -> Result<Json<Vec<DisplayDto>>> {
    let all = displays::list_displays(&state.pool).await?;
    Ok(Json(all.into_iter().map(DisplayDto::from_display).collect()))
}

/// GET /displays/:code
async fn get_display(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
) -> Result<Json<DisplayDto>> {
    let display = displays::get_display(&state.pool, &code).await?;
    Ok(Json(DisplayDto::from_display(display)))
}

/// DELETE /displays/:code - hard delete; playlists and timeline cascade
async fn delete_display(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
) -> Result<StatusCode> {
    displays::delete_display(&state.pool, &code).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /displays/:code/commands - apply a command and forward it to the
/// display session. A display past the staleness window drops the command.
async fn send_command(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
    Json(command): Json<DisplayCommand>,
) -> Result<Json<CommandResponse>> {
    let display = displays::get_display(&state.pool, &code).await?;
    let fresh = displays::is_online(&display);

    if !fresh {
        state
            .hub
            .broadcast_command_status(&code, CommandDelivery::Undelivered, None)
            .await;
        return Ok(Json(CommandResponse {
            status: CommandDelivery::Undelivered,
            state: None,
        }));
    }

    match state.playback.apply_command(&code, &command).await {
        Ok(delta) => {
            let status = state.hub.deliver_command(&code, &command, true).await;
            state.hub.broadcast(&delta).await;
            state.hub.broadcast_command_status(&code, status, None).await;
            Ok(Json(CommandResponse {
                status,
                state: Some(delta),
            }))
        }
        Err(e) => {
            state
                .hub
                .broadcast_command_status(&code, CommandDelivery::Failed, Some(e.to_string()))
                .await;
            Err(e)
        }
    }
}

/// POST /displays/:code/reset - clear timeline and position (idle only)
async fn reset_display(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
) -> Result<StatusCode> {
    timeline::reset_timeline(&state.pool, &code).await?;
    let delta = state.playback.snapshot(&code, None).await?;
    state.hub.broadcast(&delta).await;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayStats {
    pub code: String,
    pub playlist_name: Option<String>,
    pub loop_count: i64,
    pub total_blocks: i64,
    pub total_videos: i64,
    pub videos_played: i64,
    pub recent_history: Vec<crate::models::VideoHistoryRow>,
}

/// GET /displays/:code/stats - dashboard summary for one display
async fn display_stats(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
) -> Result<Json<DisplayStats>> {
    let display = displays::get_display(&state.pool, &code).await?;
    let playlist = playlists::get_active_playlist(&state.pool, &code).await?;

    let (playlist_name, loop_count, total_blocks, total_videos) = match &playlist {
        Some(playlist) => {
            let blocks = playlists::get_blocks(&state.pool, &playlist.id).await?;
            (
                Some(playlist.name.clone()),
                playlist.loop_count,
                blocks.len() as i64,
                blocks.iter().map(|b| b.video_count).sum(),
            )
        }
        None => (None, 0, 0, 0),
    };

    let (videos_played,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM video_history WHERE display_code = ?")
            .bind(&code)
            .fetch_one(&state.pool)
            .await
            .map_err(Error::from)?;

    let recent_history = sqlx::query_as::<_, crate::models::VideoHistoryRow>(
        "SELECT * FROM video_history WHERE display_code = ? ORDER BY id DESC LIMIT 10",
    )
    .bind(&code)
    .fetch_all(&state.pool)
    .await
    .map_err(Error::from)?;

    Ok(Json(DisplayStats {
        code: display.code,
        playlist_name,
        loop_count,
        total_blocks,
        total_videos,
        videos_played,
        recent_history,
    }))
}

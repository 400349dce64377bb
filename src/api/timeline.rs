// Timeline API - the queued-video window and progress for one display.

use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::Result;
use crate::models::Video;
use crate::services::{displays, playback::BlockProgress, playlists, timeline};
use crate::AppState;

/// Queued entries returned per request.
const QUEUE_WINDOW: i64 = 50;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/:code", get(get_timeline))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineResponse {
    pub progress: TimelineProgress,
    pub queued_videos: Vec<QueuedVideo>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineProgress {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_block: Option<BlockProgress>,
    pub overall: OverallProgress,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OverallProgress {
    pub current_position: i64,
    pub total_in_current_loop: i64,
    pub loop_count: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedVideo {
    pub timeline_position: i64,
    pub block_id: String,
    pub block_position: i64,
    pub video_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// GET /timeline/:code
async fn get_timeline(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
) -> Result<Json<TimelineResponse>> {
    let display = displays::get_display(&state.pool, &code).await?;
    let playlist = playlists::get_active_playlist(&state.pool, &code).await?;

    let Some(playlist) = playlist else {
        return Ok(Json(TimelineResponse {
            progress: TimelineProgress {
                current_block: None,
                overall: OverallProgress {
                    current_position: display.timeline_position,
                    total_in_current_loop: 0,
                    loop_count: 0,
                },
            },
            queued_videos: Vec::new(),
        }));
    };

    let snapshot = state.playback.snapshot(&code, None).await?;

    let entries = timeline::queued_entries(
        &state.pool,
        &code,
        &playlist.id,
        display.timeline_position,
        QUEUE_WINDOW,
    )
    .await?;

    let videos = batch_get_videos(
        &state.pool,
        &entries.iter().map(|e| e.video_id.as_str()).collect::<Vec<_>>(),
    )
    .await;

    let queued_videos = entries
        .into_iter()
        .map(|entry| {
            let video = videos.get(&entry.video_id);
            QueuedVideo {
                timeline_position: entry.timeline_position,
                block_id: entry.block_id,
                block_position: entry.block_position,
                video_id: entry.video_id,
                media_url: video.map(|v| v.media_url.clone()),
                thumbnail_url: video.and_then(|v| v.thumbnail_url.clone()),
                description: video.map(|v| v.description.clone()),
            }
        })
        .collect();

    let (total_in_loop,): (i64,) = sqlx::query_as(
        r#"
        SELECT COUNT(*) FROM timeline_entries
        WHERE display_code = ? AND playlist_id = ? AND status != 'skipped'
          AND loop_iteration = ?
        "#,
    )
    .bind(&code)
    .bind(&playlist.id)
    .bind(playlist.loop_count)
    .fetch_one(&state.pool)
    .await
    .map_err(crate::error::Error::from)?;

    Ok(Json(TimelineResponse {
        progress: TimelineProgress {
            current_block: snapshot.current_block,
            overall: OverallProgress {
                current_position: display.timeline_position,
                total_in_current_loop: total_in_loop,
                loop_count: playlist.loop_count,
            },
        },
        queued_videos,
    }))
}

async fn batch_get_videos(pool: &sqlx::SqlitePool, video_ids: &[&str]) -> HashMap<String, Video> {
    if video_ids.is_empty() {
        return HashMap::new();
    }

    let placeholders: Vec<&str> = video_ids.iter().map(|_| "?").collect();
    let query = format!(
        "SELECT * FROM videos WHERE id IN ({})",
        placeholders.join(",")
    );

    let mut query_builder = sqlx::query_as::<_, Video>(&query);
    for id in video_ids {
        query_builder = query_builder.bind(*id);
    }

    query_builder
        .fetch_all(pool)
        .await
        .unwrap_or_default()
        .into_iter()
        .map(|video| (video.id.clone(), video))
        .collect()
}

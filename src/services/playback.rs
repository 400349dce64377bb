// Playback State Machine - per-display play/pause/stop state, position
// advancement, and command application. All mutations for one display are
// serialized behind a per-display lock.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::models::{Display, EntryStatus, PlaybackState, TimelineEntry};
use crate::services::{displays, playlists, timeline};

/// Imperative command carried from an admin to a display.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum DisplayCommand {
    Play,
    Pause,
    Stop,
    Next,
    SetMuted { muted: bool },
}

/// Current video details carried in state broadcasts.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentVideo {
    pub id: String,
    pub media_url: String,
    pub thumbnail_url: Option<String>,
    pub format: crate::models::VideoFormat,
}

/// Progress through the current block, using the 0-based slot formula.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockProgress {
    pub id: String,
    pub search_term: String,
    pub current_video: i64,
    pub total_videos: i64,
    pub progress: f64,
}

/// State broadcast to admins watching a display. Video progress is merged
/// from heartbeats and never persisted.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateDelta {
    pub code: String,
    pub playback_state: String,
    pub muted: bool,
    pub timeline_position: i64,
    pub is_online: bool,
    pub loop_count: i64,
    pub playlist_id: Option<String>,
    pub playlist_empty: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_video: Option<CurrentVideo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_block: Option<BlockProgress>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_progress: Option<f64>,
}

/// Per-display serialized state machine over the shared store.
pub struct PlaybackService {
    pool: SqlitePool,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl PlaybackService {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn lock_for(&self, code: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(code.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Apply an admin command to the state machine.
    pub async fn apply_command(&self, code: &str, command: &DisplayCommand) -> Result<StateDelta> {
        match command {
            DisplayCommand::Play => self.play(code).await,
            DisplayCommand::Pause => self.pause(code).await,
            DisplayCommand::Stop => self.stop(code).await,
            DisplayCommand::Next => self.next(code).await,
            DisplayCommand::SetMuted { muted } => self.set_muted(code, *muted).await,
        }
    }

    /// idle -> playing (requires a queued entry); paused -> playing.
    pub async fn play(&self, code: &str) -> Result<StateDelta> {
        let lock = self.lock_for(code).await;
        let _guard = lock.lock().await;

        let display = displays::get_display(&self.pool, code).await?;
        match display.state() {
            PlaybackState::Playing => self.snapshot(code, None).await,
            PlaybackState::Paused => {
                sqlx::query("UPDATE displays SET playback_state = 'playing' WHERE code = ?")
                    .bind(code)
                    .execute(&self.pool)
                    .await?;
                self.snapshot(code, None).await
            }
            PlaybackState::Idle => {
                let playlist = playlists::get_active_playlist(&self.pool, code)
                    .await?
                    .ok_or_else(|| {
                        Error::Conflict(format!("display {} has no active playlist", code))
                    })?;

                let mut entry = timeline::next_queued(
                    &self.pool,
                    code,
                    &playlist.id,
                    display.timeline_position,
                )
                .await?;
                if entry.is_none() {
                    timeline::materialize(&self.pool, code).await?;
                    let display = displays::get_display(&self.pool, code).await?;
                    entry = timeline::next_queued(
                        &self.pool,
                        code,
                        &playlist.id,
                        display.timeline_position,
                    )
                    .await?;
                }
                let entry = entry.ok_or_else(|| {
                    Error::Conflict(format!("display {} has no queued videos", code))
                })?;

                sqlx::query(
                    r#"
                    UPDATE displays SET
                        playback_state = 'playing',
                        current_playlist_id = ?,
                        current_video_id = ?,
                        current_block_id = ?,
                        timeline_position = ?
                    WHERE code = ?
                    "#,
                )
                .bind(&playlist.id)
                .bind(&entry.video_id)
                .bind(&entry.block_id)
                .bind(entry.timeline_position)
                .bind(code)
                .execute(&self.pool)
                .await?;

                self.snapshot(code, None).await
            }
        }
    }

    /// playing -> paused. Pausing a non-playing display is a no-op.
    pub async fn pause(&self, code: &str) -> Result<StateDelta> {
        let lock = self.lock_for(code).await;
        let _guard = lock.lock().await;

        let display = displays::get_display(&self.pool, code).await?;
        if display.state() == PlaybackState::Playing {
            sqlx::query("UPDATE displays SET playback_state = 'paused' WHERE code = ?")
                .bind(code)
                .execute(&self.pool)
                .await?;
        }
        self.snapshot(code, None).await
    }

    /// any -> idle; clears the timeline.
    pub async fn stop(&self, code: &str) -> Result<StateDelta> {
        let lock = self.lock_for(code).await;
        let _guard = lock.lock().await;

        displays::get_display(&self.pool, code).await?;
        sqlx::query(
            r#"
            UPDATE displays SET
                playback_state = 'idle',
                current_video_id = NULL,
                current_block_id = NULL
            WHERE code = ?
            "#,
        )
        .bind(code)
        .execute(&self.pool)
        .await?;

        timeline::reset_timeline(&self.pool, code).await?;
        self.snapshot(code, None).await
    }

    /// Idempotent mute toggle.
    pub async fn set_muted(&self, code: &str, muted: bool) -> Result<StateDelta> {
        let lock = self.lock_for(code).await;
        let _guard = lock.lock().await;

        let result = sqlx::query("UPDATE displays SET muted = ? WHERE code = ?")
            .bind(muted)
            .bind(code)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("display {}", code)));
        }
        self.snapshot(code, None).await
    }

    /// The display reported its current video finished: mark it played,
    /// advance, and resolve the next video (refilling as needed).
    pub async fn video_ended(&self, code: &str) -> Result<StateDelta> {
        let lock = self.lock_for(code).await;
        let _guard = lock.lock().await;

        let disp = displays::get_display(&self.pool, code).await?;
        if disp.state() != PlaybackState::Playing {
            tracing::debug!(
                "videoEnded for display {} ignored in state {}",
                code,
                disp.playback_state
            );
            return self.snapshot(code, None).await;
        }
        let Some(playlist) = playlists::get_active_playlist(&self.pool, code).await? else {
            return self.finish_empty(code).await;
        };

        if let Some(entry) = timeline::entry_at(
            &self.pool,
            code,
            &playlist.id,
            disp.timeline_position,
        )
        .await?
        .filter(|e| e.status == "queued")
        {
            self.mark_played(&entry).await?;
        }

        sqlx::query("UPDATE displays SET timeline_position = timeline_position + 1 WHERE code = ?")
            .bind(code)
            .execute(&self.pool)
            .await?;

        self.advance(code, &playlist.id, PlaybackState::Playing).await
    }

    /// Skip the current video without playback-completion semantics. Works
    /// from any state; the entry is marked skipped, not played.
    pub async fn next(&self, code: &str) -> Result<StateDelta> {
        let lock = self.lock_for(code).await;
        let _guard = lock.lock().await;

        let display = displays::get_display(&self.pool, code).await?;
        let Some(playlist) = playlists::get_active_playlist(&self.pool, code).await? else {
            return self.snapshot(code, None).await;
        };

        if let Some(entry) = timeline::entry_at(
            &self.pool,
            code,
            &playlist.id,
            display.timeline_position,
        )
        .await?
        .filter(|e| e.status == "queued")
        {
            // Later entries shift down, so the position already points at
            // the following video.
            timeline::mark_skipped(&self.pool, &entry).await?;
        }

        if display.state() == PlaybackState::Idle {
            return self.snapshot(code, None).await;
        }
        self.advance(code, &playlist.id, display.state()).await
    }

    /// Heartbeat from the display client; refreshes liveness and merges the
    /// reported video progress into the broadcast state only.
    pub async fn heartbeat(&self, code: &str, video_progress: Option<f64>) -> Result<StateDelta> {
        displays::record_ping(&self.pool, code).await?;
        self.snapshot(code, video_progress.map(|p| p.clamp(0.0, 1.0)))
            .await
    }

    async fn mark_played(&self, entry: &TimelineEntry) -> Result<()> {
        let block = playlists::get_block(&self.pool, &entry.block_id).await?;

        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE timeline_entries SET status = ? WHERE id = ?")
            .bind(EntryStatus::Played.as_str())
            .bind(&entry.id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO video_history (display_code, block_id, video_id, played_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&entry.display_code)
        .bind(&entry.block_id)
        .bind(&entry.video_id)
        .bind(displays::timestamp_now())
        .execute(&mut *tx)
        .await?;

        // times_played ticks when the block's last slot of the loop plays
        let at_loop_boundary = entry.block_position == block.video_count - 1;
        sqlx::query(
            r#"
            UPDATE blocks SET
                last_played_at = ?,
                times_played = times_played + ?
            WHERE id = ?
            "#,
        )
        .bind(displays::timestamp_now())
        .bind(if at_loop_boundary { 1 } else { 0 })
        .bind(&entry.block_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Resolve the entry at the display's position, refilling and
    /// materializing as needed; transitions to idle when nothing remains.
    async fn advance(
        &self,
        code: &str,
        playlist_id: &str,
        state: PlaybackState,
    ) -> Result<StateDelta> {
        if let Err(e) = timeline::refill_if_low(&self.pool, code).await {
            tracing::warn!("Refill failed for display {}: {}", code, e);
        }

        // Refill or recovery may have shifted the position; re-read it.
        let display = displays::get_display(&self.pool, code).await?;
        let mut entry =
            timeline::next_queued(&self.pool, code, playlist_id, display.timeline_position)
                .await?;

        if entry.is_none() {
            match timeline::materialize(&self.pool, code).await {
                Ok(_) => {}
                Err(e) => tracing::warn!("Materialize failed for display {}: {}", code, e),
            }
            let display = displays::get_display(&self.pool, code).await?;
            entry =
                timeline::next_queued(&self.pool, code, playlist_id, display.timeline_position)
                    .await?;
        }

        match entry {
            Some(entry) => {
                sqlx::query(
                    r#"
                    UPDATE displays SET
                        playback_state = ?,
                        current_video_id = ?,
                        current_block_id = ?,
                        timeline_position = ?
                    WHERE code = ?
                    "#,
                )
                .bind(state.as_str())
                .bind(&entry.video_id)
                .bind(&entry.block_id)
                .bind(entry.timeline_position)
                .bind(code)
                .execute(&self.pool)
                .await?;
                self.snapshot(code, None).await
            }
            None => self.finish_empty(code).await,
        }
    }

    /// The playlist ran dry: transition to idle and flag the broadcast.
    async fn finish_empty(&self, code: &str) -> Result<StateDelta> {
        sqlx::query(
            r#"
            UPDATE displays SET
                playback_state = 'idle',
                current_video_id = NULL,
                current_block_id = NULL
            WHERE code = ?
            "#,
        )
        .bind(code)
        .execute(&self.pool)
        .await?;

        tracing::info!("Playlist empty for display {}", code);
        let mut delta = self.snapshot(code, None).await?;
        delta.playlist_empty = true;
        Ok(delta)
    }

    /// Build the broadcast state for a display, optionally merging a
    /// heartbeat's video-progress fraction.
    pub async fn snapshot(&self, code: &str, video_progress: Option<f64>) -> Result<StateDelta> {
        let display = displays::get_display(&self.pool, code).await?;
        let playlist = playlists::get_active_playlist(&self.pool, code).await?;

        let current_video = match display.current_video_id.as_deref() {
            Some(video_id) => match crate::index::get_video(&self.pool, video_id).await {
                Ok(video) => Some(CurrentVideo {
                    format: video.video_format(),
                    id: video.id,
                    media_url: video.media_url,
                    thumbnail_url: video.thumbnail_url,
                }),
                Err(_) => None,
            },
            None => None,
        };

        let current_block = match (&display.current_block_id, &display.current_video_id) {
            (Some(block_id), Some(video_id)) => {
                self.block_progress(&display, block_id, video_id, video_progress)
                    .await?
            }
            _ => None,
        };

        Ok(StateDelta {
            code: display.code.clone(),
            playback_state: display.playback_state.clone(),
            muted: display.muted,
            timeline_position: display.timeline_position,
            is_online: displays::is_online(&display),
            loop_count: playlist.as_ref().map(|p| p.loop_count).unwrap_or(0),
            playlist_id: playlist.map(|p| p.id),
            playlist_empty: false,
            current_video,
            current_block,
            video_progress,
        })
    }

    async fn block_progress(
        &self,
        display: &Display,
        block_id: &str,
        video_id: &str,
        video_progress: Option<f64>,
    ) -> Result<Option<BlockProgress>> {
        let Ok(block) = playlists::get_block(&self.pool, block_id).await else {
            return Ok(None);
        };

        let entry: Option<(i64,)> = sqlx::query_as(
            r#"
            SELECT block_position FROM timeline_entries
            WHERE display_code = ? AND block_id = ? AND video_id = ?
            "#,
        )
        .bind(&display.code)
        .bind(block_id)
        .bind(video_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some((block_position,)) = entry else {
            return Ok(None);
        };

        let fraction = video_progress.unwrap_or(0.0);
        let progress = if block.video_count > 0 {
            ((block_position as f64) + fraction) / (block.video_count as f64)
        } else {
            0.0
        };

        Ok(Some(BlockProgress {
            id: block.id,
            search_term: block.search_term,
            current_video: block_position + 1,
            total_videos: block.video_count,
            progress: progress.clamp(0.0, 1.0),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use crate::index;
    use crate::index::test_support::{creator, video};
    use crate::models::{BlockFormat, FetchMode};
    use crate::services::playlists::NewBlock;

    async fn setup() -> (PlaybackService, SqlitePool) {
        let pool = test_pool().await;
        index::upsert_creator(&pool, &creator("c1")).await.unwrap();
        index::insert_video(&pool, &video("v1", "c1", "cats at home", 1920, 1080))
            .await
            .unwrap();
        index::insert_video(&pool, &video("v2", "c1", "more cats", 1920, 1080))
            .await
            .unwrap();
        index::insert_video(&pool, &video("v3", "c1", "sleepy cats", 1920, 1080))
            .await
            .unwrap();
        index::insert_video(&pool, &video("v4", "c1", "tall cats", 720, 1280))
            .await
            .unwrap();

        displays::create_display(&pool, "ABC123", "Lobby").await.unwrap();
        playlists::create_playlist(
            &pool,
            "ABC123",
            "p",
            &[NewBlock {
                search_term: "cats".to_string(),
                video_count: 2,
                format: BlockFormat::Wide,
                fetch_mode: FetchMode::Newest,
            }],
        )
        .await
        .unwrap();

        (PlaybackService::new(pool.clone()), pool)
    }

    #[tokio::test]
    async fn test_play_materializes_and_starts() {
        let (svc, pool) = setup().await;

        let delta = svc.play("ABC123").await.unwrap();
        assert_eq!(delta.playback_state, "playing");
        assert_eq!(delta.timeline_position, 0);
        let current = delta.current_video.expect("current video set");
        assert_ne!(current.id, "v4");

        let display = displays::get_display(&pool, "ABC123").await.unwrap();
        assert!(display.current_playlist_id.is_some());
    }

    #[tokio::test]
    async fn test_play_without_playlist_is_conflict() {
        let pool = test_pool().await;
        displays::create_display(&pool, "XYZ789", "Bare").await.unwrap();
        let svc = PlaybackService::new(pool);
        assert!(matches!(
            svc.play("XYZ789").await.unwrap_err(),
            Error::Conflict(_)
        ));
    }

    #[tokio::test]
    async fn test_video_ended_advances_and_recovers() {
        let (svc, pool) = setup().await;
        svc.play("ABC123").await.unwrap();

        // First videoEnded: position 0 -> 1, still playing
        let delta = svc.video_ended("ABC123").await.unwrap();
        assert_eq!(delta.playback_state, "playing");
        assert_eq!(delta.timeline_position, 1);

        let (played,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM timeline_entries WHERE status = 'played'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(played, 1);

        // Second videoEnded exhausts the quota; recovery clears history and
        // the playlist refills, so playback continues
        let delta = svc.video_ended("ABC123").await.unwrap();
        assert_eq!(delta.playback_state, "playing");
        assert!(!delta.playlist_empty);
        assert!(delta.current_video.is_some());
        assert_eq!(delta.loop_count, 1);

        let (history,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM video_history")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(history, 0, "recovery clears history");
    }

    #[tokio::test]
    async fn test_pause_resume() {
        let (svc, _pool) = setup().await;
        svc.play("ABC123").await.unwrap();

        let delta = svc.pause("ABC123").await.unwrap();
        assert_eq!(delta.playback_state, "paused");
        assert!(delta.current_video.is_some());

        // Pausing again is a no-op
        let delta = svc.pause("ABC123").await.unwrap();
        assert_eq!(delta.playback_state, "paused");

        let delta = svc.play("ABC123").await.unwrap();
        assert_eq!(delta.playback_state, "playing");
    }

    #[tokio::test]
    async fn test_stop_resets_timeline() {
        let (svc, pool) = setup().await;
        svc.play("ABC123").await.unwrap();
        svc.video_ended("ABC123").await.unwrap();

        let delta = svc.stop("ABC123").await.unwrap();
        assert_eq!(delta.playback_state, "idle");
        assert!(delta.current_video.is_none());
        assert_eq!(delta.timeline_position, 0);

        let (entries,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM timeline_entries")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(entries, 0);
        let (history,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM video_history")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(history, 0);
    }

    #[tokio::test]
    async fn test_next_marks_skipped_not_played() {
        let (svc, pool) = setup().await;
        svc.play("ABC123").await.unwrap();

        let delta = svc.next("ABC123").await.unwrap();
        assert_eq!(delta.playback_state, "playing");

        let (skipped,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM timeline_entries WHERE status = 'skipped'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(skipped, 1);

        // Skipping never writes history
        let (history,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM video_history")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(history, 0);
    }

    #[tokio::test]
    async fn test_set_muted_idempotent() {
        let (svc, _pool) = setup().await;

        let a = svc.set_muted("ABC123", true).await.unwrap();
        let b = svc.set_muted("ABC123", true).await.unwrap();
        assert!(a.muted);
        assert!(b.muted);
        assert_eq!(a.playback_state, b.playback_state);

        let c = svc.set_muted("ABC123", false).await.unwrap();
        assert!(!c.muted);
    }

    #[tokio::test]
    async fn test_video_ended_ignored_when_not_playing() {
        let (svc, _pool) = setup().await;
        let delta = svc.video_ended("ABC123").await.unwrap();
        assert_eq!(delta.playback_state, "idle");
        assert_eq!(delta.timeline_position, 0);
    }

    #[tokio::test]
    async fn test_heartbeat_merges_progress() {
        let (svc, pool) = setup().await;
        svc.play("ABC123").await.unwrap();

        let delta = svc.heartbeat("ABC123", Some(0.5)).await.unwrap();
        assert!(delta.is_online);
        assert_eq!(delta.video_progress, Some(0.5));
        let block = delta.current_block.expect("block progress");
        // First slot of a 2-video block at half progress
        assert!((block.progress - 0.25).abs() < 1e-9);
        assert_eq!(block.current_video, 1);
        assert_eq!(block.total_videos, 2);

        // Progress is never persisted
        let display = displays::get_display(&pool, "ABC123").await.unwrap();
        assert_eq!(display.timeline_position, 0);
    }

    #[tokio::test]
    async fn test_command_serde_shape() {
        let cmd: DisplayCommand =
            serde_json::from_str(r#"{"type":"setMuted","payload":{"muted":true}}"#).unwrap();
        assert_eq!(cmd, DisplayCommand::SetMuted { muted: true });

        let cmd: DisplayCommand = serde_json::from_str(r#"{"type":"play"}"#).unwrap();
        assert_eq!(cmd, DisplayCommand::Play);
    }
}

// Timeline Manager - materializes an active playlist into an ordered,
// deduplicated, format-compliant sequence of timeline entries and keeps the
// queue populated ahead of the display's position.

use std::collections::HashSet;

use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::index;
use crate::models::{Block, Display, EntryStatus, PlaybackState, Playlist, TimelineEntry};
use crate::services::displays;
use crate::services::playlists;

/// Extra candidates requested beyond the needed slot count, so a few
/// conflicting rows do not force a second query.
const CANDIDATE_BUFFER: i64 = 5;

/// Refill when fewer queued entries than this remain ahead of the position
/// (capped by the playlist's total video count).
const LOW_WATERMARK: i64 = 8;

pub fn low_watermark(total_videos: i64) -> i64 {
    LOW_WATERMARK.min(total_videos)
}

/// Materialize the display's active playlist: fill every block's quota for
/// the current loop, recovering exhausted search-term groups as needed.
/// Returns the number of entries inserted.
pub async fn materialize(pool: &SqlitePool, display_code: &str) -> Result<usize> {
    let display = displays::get_display(pool, display_code).await?;
    let Some(playlist) = playlists::get_active_playlist(pool, display_code).await? else {
        return Ok(0);
    };
    let blocks = playlists::get_blocks(pool, &playlist.id).await?;
    if blocks.is_empty() {
        return Ok(0);
    }

    let mut loop_iter = playlist.loop_count;
    let mut inserted = fill_pass(pool, &display, &playlist, &blocks, loop_iter).await?;

    // When every block has consumed its quota for this loop and nothing is
    // queued ahead, the playlist wraps into its next full pass.
    if inserted == 0
        && queued_ahead(pool, display_code, &playlist.id).await? == 0
        && all_quotas_filled(pool, &blocks, loop_iter).await?
    {
        loop_iter += 1;
        sqlx::query("UPDATE playlists SET loop_count = ? WHERE id = ?")
            .bind(loop_iter)
            .bind(&playlist.id)
            .execute(pool)
            .await?;
        tracing::debug!(
            "Playlist {} wrapped to loop {}",
            playlist.id,
            loop_iter
        );
        inserted = fill_pass(pool, &display, &playlist, &blocks, loop_iter).await?;
    }

    Ok(inserted)
}

/// Materialize only when the queue ahead of the position has drained below
/// the low watermark. Returns the number of entries inserted (0 if skipped).
pub async fn refill_if_low(pool: &SqlitePool, display_code: &str) -> Result<usize> {
    let Some(playlist) = playlists::get_active_playlist(pool, display_code).await? else {
        return Ok(0);
    };
    let blocks = playlists::get_blocks(pool, &playlist.id).await?;
    let total_videos: i64 = blocks.iter().map(|b| b.video_count).sum();

    let ahead = queued_ahead(pool, display_code, &playlist.id).await?;
    if ahead < low_watermark(total_videos) {
        materialize(pool, display_code).await
    } else {
        Ok(0)
    }
}

/// Number of queued entries at or past the display's position.
pub async fn queued_ahead(pool: &SqlitePool, display_code: &str, playlist_id: &str) -> Result<i64> {
    let (count,): (i64,) = sqlx::query_as(
        r#"
        SELECT COUNT(*) FROM timeline_entries t
        JOIN displays d ON d.code = t.display_code
        WHERE t.display_code = ? AND t.playlist_id = ?
          AND t.status = 'queued' AND t.timeline_position >= d.timeline_position
        "#,
    )
    .bind(display_code)
    .bind(playlist_id)
    .fetch_one(pool)
    .await?;
    Ok(count)
}

/// The entry at an exact timeline position, if any.
pub async fn entry_at(
    pool: &SqlitePool,
    display_code: &str,
    playlist_id: &str,
    position: i64,
) -> Result<Option<TimelineEntry>> {
    let entry = sqlx::query_as::<_, TimelineEntry>(
        r#"
        SELECT * FROM timeline_entries
        WHERE display_code = ? AND playlist_id = ? AND timeline_position = ?
          AND status != 'skipped'
        "#,
    )
    .bind(display_code)
    .bind(playlist_id)
    .bind(position)
    .fetch_optional(pool)
    .await?;
    Ok(entry)
}

/// First queued entry at or past a position.
pub async fn next_queued(
    pool: &SqlitePool,
    display_code: &str,
    playlist_id: &str,
    position: i64,
) -> Result<Option<TimelineEntry>> {
    let entry = sqlx::query_as::<_, TimelineEntry>(
        r#"
        SELECT * FROM timeline_entries
        WHERE display_code = ? AND playlist_id = ? AND status = 'queued'
          AND timeline_position >= ?
        ORDER BY timeline_position ASC
        LIMIT 1
        "#,
    )
    .bind(display_code)
    .bind(playlist_id)
    .bind(position)
    .fetch_optional(pool)
    .await?;
    Ok(entry)
}

/// Queued entries from a position onward, in order.
pub async fn queued_entries(
    pool: &SqlitePool,
    display_code: &str,
    playlist_id: &str,
    position: i64,
    limit: i64,
) -> Result<Vec<TimelineEntry>> {
    let entries = sqlx::query_as::<_, TimelineEntry>(
        r#"
        SELECT * FROM timeline_entries
        WHERE display_code = ? AND playlist_id = ? AND status = 'queued'
          AND timeline_position >= ?
        ORDER BY timeline_position ASC
        LIMIT ?
        "#,
    )
    .bind(display_code)
    .bind(playlist_id)
    .bind(position)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(entries)
}

/// Clear the display's timeline: all entries and history for the active
/// playlist, block counters, and the display's position. The playback state
/// machine must be idle.
pub async fn reset_timeline(pool: &SqlitePool, display_code: &str) -> Result<()> {
    let display = displays::get_display(pool, display_code).await?;
    if display.state() != PlaybackState::Idle {
        return Err(Error::Conflict(format!(
            "display {} must be idle to reset, is {}",
            display_code, display.playback_state
        )));
    }

    let Some(playlist) = playlists::get_active_playlist(pool, display_code).await? else {
        return Ok(());
    };

    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM timeline_entries WHERE display_code = ? AND playlist_id = ?")
        .bind(display_code)
        .bind(&playlist.id)
        .execute(&mut *tx)
        .await?;
    sqlx::query(
        r#"
        DELETE FROM video_history
        WHERE display_code = ?
          AND block_id IN (SELECT id FROM blocks WHERE playlist_id = ?)
        "#,
    )
    .bind(display_code)
    .bind(&playlist.id)
    .execute(&mut *tx)
    .await?;
    sqlx::query(
        "UPDATE blocks SET times_played = 0, last_played_at = NULL WHERE playlist_id = ?",
    )
    .bind(&playlist.id)
    .execute(&mut *tx)
    .await?;
    sqlx::query("UPDATE playlists SET loop_count = 0 WHERE id = ?")
        .bind(&playlist.id)
        .execute(&mut *tx)
        .await?;
    sqlx::query(
        r#"
        UPDATE displays SET
            timeline_position = 0,
            current_video_id = NULL,
            current_block_id = NULL,
            current_playlist_id = NULL
        WHERE code = ?
        "#,
    )
    .bind(display_code)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;

    tracing::info!("Timeline reset for display {}", display_code);
    Ok(())
}

/// Mark the entry skipped and close the gap: later queued entries shift down
/// one position so live positions stay dense, and the display's position
/// keeps pointing at the next video.
pub async fn mark_skipped(pool: &SqlitePool, entry: &TimelineEntry) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query("UPDATE timeline_entries SET status = ? WHERE id = ?")
        .bind(EntryStatus::Skipped.as_str())
        .bind(&entry.id)
        .execute(&mut *tx)
        .await?;
    sqlx::query(
        r#"
        UPDATE timeline_entries SET timeline_position = timeline_position - 1
        WHERE display_code = ? AND playlist_id = ? AND status != 'skipped'
          AND timeline_position > ?
        "#,
    )
    .bind(&entry.display_code)
    .bind(&entry.playlist_id)
    .bind(entry.timeline_position)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(())
}

/// Remove a block's entries before the block row itself is deleted, keeping
/// live positions dense and the display position consistent.
pub async fn remove_block_entries(pool: &SqlitePool, block: &Block) -> Result<()> {
    let playlist = playlists::get_playlist(pool, &block.playlist_id).await?;
    let display = displays::get_display(pool, &playlist.display_code).await?;

    let mut tx = pool.begin().await?;
    delete_and_compact(&mut tx, &display, &playlist.id, &[block.id.clone()]).await?;
    tx.commit().await?;
    Ok(())
}

// ============================================================================
// Fill pass
// ============================================================================

async fn fill_pass(
    pool: &SqlitePool,
    display: &Display,
    playlist: &Playlist,
    blocks: &[Block],
    loop_iter: i64,
) -> Result<usize> {
    // Dedup across blocks: every video already bound anywhere in this
    // display's playlist is off limits.
    let mut seen = all_timeline_video_ids(pool, &display.code, &playlist.id).await?;
    let mut inserted_total = 0usize;

    for block in blocks {
        let mut needed = block.video_count - quota_used(pool, &block.id, loop_iter).await?;
        if needed <= 0 {
            continue;
        }

        let mut attempted_recovery = false;
        loop {
            let exclude = exclusion_set(pool, &display.code, block, &seen).await?;
            let candidates = index::search_videos(
                pool,
                &block.search_term,
                needed + CANDIDATE_BUFFER,
                block.mode(),
                block.block_format(),
                &exclude,
            )
            .await?;

            if (candidates.len() as i64) < needed && !attempted_recovery {
                attempted_recovery = true;
                if recover_exhausted(pool, &display.code, playlist, blocks, &block.search_term)
                    .await?
                {
                    // Recovery dropped entries; recompute everything derived
                    // from them before retrying.
                    seen = all_timeline_video_ids(pool, &display.code, &playlist.id).await?;
                    needed = block.video_count - quota_used(pool, &block.id, loop_iter).await?;
                    if needed <= 0 {
                        break;
                    }
                    continue;
                }
            }

            let take = (needed.min(candidates.len() as i64)) as usize;
            if take > 0 {
                let ids: Vec<&str> = candidates[..take].iter().map(|v| v.id.as_str()).collect();
                insert_entries(pool, display, playlist, block, loop_iter, &ids).await?;
                for id in &ids {
                    seen.insert((*id).to_string());
                }
                inserted_total += take;
            }
            break;
        }
    }

    Ok(inserted_total)
}

/// Entries counted against a block's quota for one loop iteration,
/// regardless of status.
async fn quota_used(pool: &SqlitePool, block_id: &str, loop_iter: i64) -> Result<i64> {
    let (count,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM timeline_entries WHERE block_id = ? AND loop_iteration = ?",
    )
    .bind(block_id)
    .bind(loop_iter)
    .fetch_one(pool)
    .await?;
    Ok(count)
}

async fn all_quotas_filled(pool: &SqlitePool, blocks: &[Block], loop_iter: i64) -> Result<bool> {
    for block in blocks {
        if quota_used(pool, &block.id, loop_iter).await? < block.video_count {
            return Ok(false);
        }
    }
    Ok(true)
}

async fn all_timeline_video_ids(
    pool: &SqlitePool,
    display_code: &str,
    playlist_id: &str,
) -> Result<HashSet<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT video_id FROM timeline_entries WHERE display_code = ? AND playlist_id = ?",
    )
    .bind(display_code)
    .bind(playlist_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// E ∪ Q ∪ G for one block: played history, queued entries, and everything
/// already bound in the playlist.
async fn exclusion_set(
    pool: &SqlitePool,
    display_code: &str,
    block: &Block,
    seen: &HashSet<String>,
) -> Result<Vec<String>> {
    let mut exclude: HashSet<String> = seen.clone();

    let history: Vec<(String,)> = sqlx::query_as(
        "SELECT video_id FROM video_history WHERE display_code = ? AND block_id = ?",
    )
    .bind(display_code)
    .bind(&block.id)
    .fetch_all(pool)
    .await?;
    exclude.extend(history.into_iter().map(|(id,)| id));

    Ok(exclude.into_iter().collect())
}

async fn insert_entries(
    pool: &SqlitePool,
    display: &Display,
    playlist: &Playlist,
    block: &Block,
    loop_iter: i64,
    video_ids: &[&str],
) -> Result<()> {
    let mut tx = pool.begin().await.map_err(|e| Error::MaterializeFailed {
        block_id: block.id.clone(),
        reason: e.to_string(),
    })?;

    let result: Result<()> = async {
        let (max_pos,): (i64,) = sqlx::query_as(
            r#"
            SELECT COALESCE(MAX(timeline_position), -1) FROM timeline_entries
            WHERE display_code = ? AND playlist_id = ? AND status != 'skipped'
            "#,
        )
        .bind(&display.code)
        .bind(&playlist.id)
        .fetch_one(&mut *tx)
        .await?;

        let (max_block_pos,): (i64,) = sqlx::query_as(
            r#"
            SELECT COALESCE(MAX(block_position), -1) FROM timeline_entries
            WHERE block_id = ? AND loop_iteration = ?
            "#,
        )
        .bind(&block.id)
        .bind(loop_iter)
        .fetch_one(&mut *tx)
        .await?;

        let mut position = max_pos + 1;
        let mut block_position = max_block_pos + 1;
        for video_id in video_ids {
            sqlx::query(
                r#"
                INSERT INTO timeline_entries (
                    id, display_code, playlist_id, block_id, video_id,
                    timeline_position, status, block_position, loop_iteration
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(Uuid::new_v4().to_string())
            .bind(&display.code)
            .bind(&playlist.id)
            .bind(&block.id)
            .bind(video_id)
            .bind(position)
            .bind(EntryStatus::Queued.as_str())
            .bind(block_position)
            .bind(loop_iter)
            .execute(&mut *tx)
            .await?;
            position += 1;
            block_position += 1;
        }
        Ok(())
    }
    .await;

    match result {
        Ok(()) => {
            tx.commit().await.map_err(|e| Error::MaterializeFailed {
                block_id: block.id.clone(),
                reason: e.to_string(),
            })?;
            Ok(())
        }
        Err(e) => {
            // The transaction rolls back on drop; nothing from this block
            // is persisted.
            Err(Error::MaterializeFailed {
                block_id: block.id.clone(),
                reason: e.to_string(),
            })
        }
    }
}

// ============================================================================
// Exhaustion recovery
// ============================================================================

/// When every video matching a search term has been used by the blocks
/// sharing that term, clear their history and entries so the playlist can
/// loop. Scope is the search-term group, not the single block.
async fn recover_exhausted(
    pool: &SqlitePool,
    display_code: &str,
    playlist: &Playlist,
    blocks: &[Block],
    search_term: &str,
) -> Result<bool> {
    let group: Vec<&Block> = blocks
        .iter()
        .filter(|b| b.search_term == search_term)
        .collect();
    let group_ids: Vec<String> = group.iter().map(|b| b.id.clone()).collect();

    let total_needed: i64 = group.iter().map(|b| b.video_count).sum();

    let placeholders = vec!["?"; group_ids.len()].join(",");
    let history_sql = format!(
        "SELECT COUNT(*) FROM video_history WHERE display_code = ? AND block_id IN ({})",
        placeholders
    );
    let mut query = sqlx::query_as::<_, (i64,)>(&history_sql).bind(display_code);
    for id in &group_ids {
        query = query.bind(id);
    }
    let (history_count,) = query.fetch_one(pool).await?;

    let queued_sql = format!(
        "SELECT COUNT(*) FROM timeline_entries WHERE display_code = ? AND status = 'queued' AND block_id IN ({})",
        placeholders
    );
    let mut query = sqlx::query_as::<_, (i64,)>(&queued_sql).bind(display_code);
    for id in &group_ids {
        query = query.bind(id);
    }
    let (queued_count,) = query.fetch_one(pool).await?;

    if history_count + queued_count < total_needed {
        return Ok(false);
    }

    let display = displays::get_display(pool, display_code).await?;

    let mut tx = pool.begin().await?;

    let delete_history_sql = format!(
        "DELETE FROM video_history WHERE display_code = ? AND block_id IN ({})",
        placeholders
    );
    let mut query = sqlx::query(&delete_history_sql).bind(display_code);
    for id in &group_ids {
        query = query.bind(id);
    }
    query.execute(&mut *tx).await?;

    delete_and_compact(&mut tx, &display, &playlist.id, &group_ids).await?;

    tx.commit().await?;

    tracing::info!(
        "Exhaustion recovery for display {} term '{}' ({} blocks)",
        display_code,
        search_term,
        group.len()
    );
    Ok(true)
}

/// Delete all entries belonging to the given blocks, renumber the remaining
/// live entries dense from 0, and shift the display's position down by the
/// number of deleted predecessors.
async fn delete_and_compact(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    display: &Display,
    playlist_id: &str,
    block_ids: &[String],
) -> Result<()> {
    if block_ids.is_empty() {
        return Ok(());
    }
    let placeholders = vec!["?"; block_ids.len()].join(",");

    let before_sql = format!(
        r#"
        SELECT COUNT(*) FROM timeline_entries
        WHERE display_code = ? AND playlist_id = ? AND status != 'skipped'
          AND timeline_position < ? AND block_id IN ({})
        "#,
        placeholders
    );
    let mut query = sqlx::query_as::<_, (i64,)>(&before_sql)
        .bind(&display.code)
        .bind(playlist_id)
        .bind(display.timeline_position);
    for id in block_ids {
        query = query.bind(id);
    }
    let (deleted_before,) = query.fetch_one(&mut **tx).await?;

    let delete_sql = format!(
        "DELETE FROM timeline_entries WHERE display_code = ? AND playlist_id = ? AND block_id IN ({})",
        placeholders
    );
    let mut query = sqlx::query(&delete_sql)
        .bind(&display.code)
        .bind(playlist_id);
    for id in block_ids {
        query = query.bind(id);
    }
    query.execute(&mut **tx).await?;

    // Renumber survivors dense from 0, preserving order.
    let survivors: Vec<(String, i64)> = sqlx::query_as(
        r#"
        SELECT id, timeline_position FROM timeline_entries
        WHERE display_code = ? AND playlist_id = ? AND status != 'skipped'
        ORDER BY timeline_position ASC
        "#,
    )
    .bind(&display.code)
    .bind(playlist_id)
    .fetch_all(&mut **tx)
    .await?;

    for (new_pos, (id, old_pos)) in survivors.iter().enumerate() {
        if *old_pos != new_pos as i64 {
            sqlx::query("UPDATE timeline_entries SET timeline_position = ? WHERE id = ?")
                .bind(new_pos as i64)
                .bind(id)
                .execute(&mut **tx)
                .await?;
        }
    }

    let new_position = (display.timeline_position - deleted_before).max(0);
    sqlx::query("UPDATE displays SET timeline_position = ? WHERE code = ?")
        .bind(new_position)
        .bind(&display.code)
        .execute(&mut **tx)
        .await?;

    Ok(())
}

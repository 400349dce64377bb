// Playlist Store - CRUD on playlists and blocks, CSV import/export,
// atomic reorder. At most one playlist is active per display.

use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{Block, BlockFormat, FetchMode, PlaybackState, Playlist};

/// Block fields supplied on playlist creation or CSV import.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct NewBlock {
    pub search_term: String,
    pub video_count: i64,
    pub format: BlockFormat,
    #[serde(default = "default_fetch_mode")]
    pub fetch_mode: FetchMode,
}

fn default_fetch_mode() -> FetchMode {
    FetchMode::Newest
}

/// Patchable block fields. Search term, count, and format may only change
/// while the owning display is idle.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct BlockUpdate {
    pub search_term: Option<String>,
    pub video_count: Option<i64>,
    pub format: Option<BlockFormat>,
    pub fetch_mode: Option<FetchMode>,
}

/// Create a playlist with its blocks in one transaction. The new playlist
/// becomes the display's active playlist; all others are deactivated.
pub async fn create_playlist(
    pool: &SqlitePool,
    display_code: &str,
    name: &str,
    blocks: &[NewBlock],
) -> Result<Playlist> {
    if blocks.is_empty() {
        return Err(Error::BadInput("playlist needs at least one block".to_string()));
    }
    for block in blocks {
        if block.video_count <= 0 {
            return Err(Error::BadInput(format!(
                "video_count must be positive, got {}",
                block.video_count
            )));
        }
    }

    let display_exists: Option<(String,)> =
        sqlx::query_as("SELECT code FROM displays WHERE code = ?")
            .bind(display_code)
            .fetch_optional(pool)
            .await?;
    if display_exists.is_none() {
        return Err(Error::NotFound(format!("display {}", display_code)));
    }

    let playlist_id = Uuid::new_v4().to_string();
    let mut tx = pool.begin().await?;

    sqlx::query("UPDATE playlists SET is_active = 0 WHERE display_code = ?")
        .bind(display_code)
        .execute(&mut *tx)
        .await?;

    sqlx::query(
        "INSERT INTO playlists (id, display_code, name, is_active) VALUES (?, ?, ?, 1)",
    )
    .bind(&playlist_id)
    .bind(display_code)
    .bind(name)
    .execute(&mut *tx)
    .await?;

    for (order, block) in blocks.iter().enumerate() {
        sqlx::query(
            r#"
            INSERT INTO blocks (id, playlist_id, block_order, search_term, video_count, format, fetch_mode)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&playlist_id)
        .bind(order as i64)
        .bind(block.search_term.trim())
        .bind(block.video_count)
        .bind(block.format.as_str())
        .bind(block.fetch_mode.as_str())
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;

    get_playlist(pool, &playlist_id).await
}

pub async fn get_playlist(pool: &SqlitePool, playlist_id: &str) -> Result<Playlist> {
    sqlx::query_as::<_, Playlist>("SELECT * FROM playlists WHERE id = ?")
        .bind(playlist_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| Error::NotFound(format!("playlist {}", playlist_id)))
}

pub async fn get_active_playlist(
    pool: &SqlitePool,
    display_code: &str,
) -> Result<Option<Playlist>> {
    let playlist = sqlx::query_as::<_, Playlist>(
        "SELECT * FROM playlists WHERE display_code = ? AND is_active = 1",
    )
    .bind(display_code)
    .fetch_optional(pool)
    .await?;
    Ok(playlist)
}

/// Blocks of a playlist in block_order.
pub async fn get_blocks(pool: &SqlitePool, playlist_id: &str) -> Result<Vec<Block>> {
    let blocks = sqlx::query_as::<_, Block>(
        "SELECT * FROM blocks WHERE playlist_id = ? ORDER BY block_order ASC",
    )
    .bind(playlist_id)
    .fetch_all(pool)
    .await?;
    Ok(blocks)
}

pub async fn get_block(pool: &SqlitePool, block_id: &str) -> Result<Block> {
    sqlx::query_as::<_, Block>("SELECT * FROM blocks WHERE id = ?")
        .bind(block_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| Error::NotFound(format!("block {}", block_id)))
}

/// Atomically apply a new block ordering. Rejects orderings that are not a
/// dense 0..N-1 permutation over exactly the playlist's blocks. Queued
/// timeline entries are invalidated so the next refill rebuilds them.
pub async fn reorder_blocks(
    pool: &SqlitePool,
    playlist_id: &str,
    orders: &[(String, i64)],
) -> Result<()> {
    let blocks = get_blocks(pool, playlist_id).await?;
    if blocks.is_empty() {
        return Err(Error::NotFound(format!("playlist {}", playlist_id)));
    }

    if orders.len() != blocks.len() {
        return Err(Error::InvariantViolation(format!(
            "expected {} block orders, got {}",
            blocks.len(),
            orders.len()
        )));
    }

    let mut seen = vec![false; orders.len()];
    for (block_id, order) in orders {
        if !blocks.iter().any(|b| b.id == *block_id) {
            return Err(Error::InvariantViolation(format!(
                "block {} does not belong to playlist {}",
                block_id, playlist_id
            )));
        }
        let idx = usize::try_from(*order)
            .ok()
            .filter(|i| *i < seen.len())
            .ok_or_else(|| {
                Error::InvariantViolation(format!("order {} out of range", order))
            })?;
        if seen[idx] {
            return Err(Error::InvariantViolation(format!("duplicate order {}", order)));
        }
        seen[idx] = true;
    }

    let playlist = get_playlist(pool, playlist_id).await?;

    let mut tx = pool.begin().await?;
    for (block_id, order) in orders {
        sqlx::query("UPDATE blocks SET block_order = ? WHERE id = ? AND playlist_id = ?")
            .bind(order)
            .bind(block_id)
            .bind(playlist_id)
            .execute(&mut *tx)
            .await?;
    }
    // Queued entries were built for the old order; drop them. Played entries
    // stay, so positions remain dense from 0.
    sqlx::query(
        "DELETE FROM timeline_entries WHERE playlist_id = ? AND status = 'queued'",
    )
    .bind(playlist_id)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;

    tracing::debug!(
        "Reordered {} blocks of playlist {} ({})",
        orders.len(),
        playlist_id,
        playlist.name
    );
    Ok(())
}

/// Patch a block. Content-affecting fields require the owning display to be
/// idle; system counters are maintained elsewhere.
pub async fn update_block(pool: &SqlitePool, block_id: &str, update: &BlockUpdate) -> Result<Block> {
    let block = get_block(pool, block_id).await?;

    let changes_content = update.search_term.is_some()
        || update.video_count.is_some()
        || update.format.is_some();
    if changes_content {
        let state = display_state_for_playlist(pool, &block.playlist_id).await?;
        if state != PlaybackState::Idle {
            return Err(Error::Conflict(format!(
                "cannot edit block content while display is {}",
                state.as_str()
            )));
        }
    }

    if let Some(count) = update.video_count {
        if count <= 0 {
            return Err(Error::BadInput(format!(
                "video_count must be positive, got {}",
                count
            )));
        }
    }

    sqlx::query(
        r#"
        UPDATE blocks SET
            search_term = COALESCE(?, search_term),
            video_count = COALESCE(?, video_count),
            format = COALESCE(?, format),
            fetch_mode = COALESCE(?, fetch_mode)
        WHERE id = ?
        "#,
    )
    .bind(update.search_term.as_deref().map(str::trim))
    .bind(update.video_count)
    .bind(update.format.map(|f| f.as_str()))
    .bind(update.fetch_mode.map(|m| m.as_str()))
    .bind(block_id)
    .execute(pool)
    .await?;

    get_block(pool, block_id).await
}

/// Delete a block and renumber the remaining blocks to stay dense. The
/// block's timeline entries are removed first so live positions stay dense.
pub async fn delete_block(pool: &SqlitePool, block_id: &str) -> Result<()> {
    let block = get_block(pool, block_id).await?;

    crate::services::timeline::remove_block_entries(pool, &block).await?;

    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM blocks WHERE id = ?")
        .bind(block_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query(
        "UPDATE blocks SET block_order = block_order - 1 WHERE playlist_id = ? AND block_order > ?",
    )
    .bind(&block.playlist_id)
    .bind(block.block_order)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;

    Ok(())
}

async fn display_state_for_playlist(
    pool: &SqlitePool,
    playlist_id: &str,
) -> Result<PlaybackState> {
    let row: Option<(String,)> = sqlx::query_as(
        r#"
        SELECT d.playback_state
        FROM displays d
        JOIN playlists p ON p.display_code = d.code
        WHERE p.id = ?
        "#,
    )
    .bind(playlist_id)
    .fetch_optional(pool)
    .await?;

    let (state,) =
        row.ok_or_else(|| Error::NotFound(format!("display for playlist {}", playlist_id)))?;
    Ok(PlaybackState::parse(&state))
}

// ============================================================================
// CSV import/export
// ============================================================================

const CSV_HEADER_TERM: &str = "search term";
const CSV_HEADER_COUNT: &str = "video count";
const CSV_HEADER_FORMAT: &str = "format";

/// Parse CSV bytes into blocks. Columns `Search Term`, `Video Count`, and
/// `Format` are required; row order becomes block_order.
pub fn parse_blocks_csv(bytes: &[u8]) -> Result<Vec<NewBlock>> {
    let text = std::str::from_utf8(bytes)
        .map_err(|_| Error::MalformedCsv("file is not valid UTF-8".to_string()))?;

    let mut rows = parse_csv_rows(text)?;
    if rows.is_empty() {
        return Err(Error::MalformedCsv("missing header row".to_string()));
    }

    let header = rows.remove(0);
    let find_column = |name: &str| {
        header
            .iter()
            .position(|h| h.trim().eq_ignore_ascii_case(name))
    };
    let term_col = find_column(CSV_HEADER_TERM)
        .ok_or_else(|| Error::MalformedCsv("missing 'Search Term' column".to_string()))?;
    let count_col = find_column(CSV_HEADER_COUNT)
        .ok_or_else(|| Error::MalformedCsv("missing 'Video Count' column".to_string()))?;
    let format_col = find_column(CSV_HEADER_FORMAT)
        .ok_or_else(|| Error::MalformedCsv("missing 'Format' column".to_string()))?;

    let mut blocks = Vec::new();
    for (line_no, row) in rows.iter().enumerate() {
        // Trailing blank line tolerance
        if row.iter().all(|f| f.trim().is_empty()) {
            continue;
        }
        let needed = term_col.max(count_col).max(format_col) + 1;
        if row.len() < needed {
            return Err(Error::MalformedCsv(format!(
                "row {} has {} fields, expected at least {}",
                line_no + 2,
                row.len(),
                needed
            )));
        }

        let video_count: i64 = row[count_col].trim().parse().map_err(|_| {
            Error::MalformedCsv(format!(
                "row {}: invalid video count '{}'",
                line_no + 2,
                row[count_col]
            ))
        })?;
        if video_count <= 0 {
            return Err(Error::MalformedCsv(format!(
                "row {}: video count must be positive",
                line_no + 2
            )));
        }

        let format = BlockFormat::parse(&row[format_col]).ok_or_else(|| {
            Error::MalformedCsv(format!(
                "row {}: unknown format '{}'",
                line_no + 2,
                row[format_col]
            ))
        })?;

        blocks.push(NewBlock {
            search_term: row[term_col].trim().to_string(),
            video_count,
            format,
            fetch_mode: FetchMode::Newest,
        });
    }

    if blocks.is_empty() {
        return Err(Error::MalformedCsv("no data rows".to_string()));
    }

    Ok(blocks)
}

/// Render a playlist's blocks as CSV in the import shape.
pub async fn export_csv(pool: &SqlitePool, playlist_id: &str) -> Result<String> {
    // Ensure the playlist exists before producing an empty sheet
    get_playlist(pool, playlist_id).await?;
    let blocks = get_blocks(pool, playlist_id).await?;

    let mut out = String::from("Search Term,Video Count,Format\r\n");
    for block in &blocks {
        out.push_str(&csv_field(&block.search_term));
        out.push(',');
        out.push_str(&block.video_count.to_string());
        out.push(',');
        out.push_str(block.block_format().as_str());
        out.push_str("\r\n");
    }
    Ok(out)
}

/// Import CSV as a new active playlist for the display.
pub async fn import_csv(
    pool: &SqlitePool,
    display_code: &str,
    playlist_name: &str,
    bytes: &[u8],
) -> Result<Playlist> {
    let blocks = parse_blocks_csv(bytes)?;
    create_playlist(pool, display_code, playlist_name, &blocks).await
}

/// Quote a CSV field if it contains a delimiter, quote, or newline.
fn csv_field(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') || value.contains('\r') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// Minimal RFC 4180 row parser: handles quoted fields, doubled quotes, and
/// both CRLF and LF terminators.
fn parse_csv_rows(text: &str) -> Result<Vec<Vec<String>>> {
    let mut rows = Vec::new();
    let mut row = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' => {
                    if chars.peek() == Some(&'"') {
                        chars.next();
                        field.push('"');
                    } else {
                        in_quotes = false;
                    }
                }
                _ => field.push(c),
            }
            continue;
        }
        match c {
            '"' => {
                if field.is_empty() {
                    in_quotes = true;
                } else {
                    return Err(Error::MalformedCsv(
                        "quote inside unquoted field".to_string(),
                    ));
                }
            }
            ',' => {
                row.push(std::mem::take(&mut field));
            }
            '\r' => {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
                row.push(std::mem::take(&mut field));
                rows.push(std::mem::take(&mut row));
            }
            '\n' => {
                row.push(std::mem::take(&mut field));
                rows.push(std::mem::take(&mut row));
            }
            _ => field.push(c),
        }
    }

    if in_quotes {
        return Err(Error::MalformedCsv("unterminated quoted field".to_string()));
    }
    if !field.is_empty() || !row.is_empty() {
        row.push(field);
        rows.push(row);
    }

    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;

    async fn seed_display(pool: &SqlitePool, code: &str) {
        sqlx::query("INSERT INTO displays (code, name, owner_token) VALUES (?, ?, ?)")
            .bind(code)
            .bind("Test Display")
            .bind("token")
            .execute(pool)
            .await
            .unwrap();
    }

    fn block(term: &str, count: i64, format: BlockFormat) -> NewBlock {
        NewBlock {
            search_term: term.to_string(),
            video_count: count,
            format,
            fetch_mode: FetchMode::Newest,
        }
    }

    #[tokio::test]
    async fn test_create_playlist_single_active() {
        let pool = test_pool().await;
        seed_display(&pool, "ABC123").await;

        let first = create_playlist(&pool, "ABC123", "first", &[block("cats", 2, BlockFormat::Wide)])
            .await
            .unwrap();
        assert!(first.is_active);

        let second =
            create_playlist(&pool, "ABC123", "second", &[block("dogs", 1, BlockFormat::Mixed)])
                .await
                .unwrap();
        assert!(second.is_active);

        let first_again = get_playlist(&pool, &first.id).await.unwrap();
        assert!(!first_again.is_active);

        let active = get_active_playlist(&pool, "ABC123").await.unwrap().unwrap();
        assert_eq!(active.id, second.id);
    }

    #[tokio::test]
    async fn test_create_playlist_rejects_bad_input() {
        let pool = test_pool().await;
        seed_display(&pool, "ABC123").await;

        let err = create_playlist(&pool, "ABC123", "empty", &[]).await.unwrap_err();
        assert!(matches!(err, Error::BadInput(_)));

        let err = create_playlist(&pool, "ABC123", "zero", &[block("x", 0, BlockFormat::Mixed)])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BadInput(_)));

        let err = create_playlist(&pool, "NOPE99", "x", &[block("x", 1, BlockFormat::Mixed)])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_reorder_blocks_dense_validation() {
        let pool = test_pool().await;
        seed_display(&pool, "ABC123").await;
        let playlist = create_playlist(
            &pool,
            "ABC123",
            "p",
            &[
                block("a", 1, BlockFormat::Mixed),
                block("b", 1, BlockFormat::Mixed),
                block("c", 1, BlockFormat::Mixed),
            ],
        )
        .await
        .unwrap();
        let blocks = get_blocks(&pool, &playlist.id).await.unwrap();
        let (a, b, c) = (&blocks[0], &blocks[1], &blocks[2]);

        // [A,B,C] -> [C,A,B]
        reorder_blocks(
            &pool,
            &playlist.id,
            &[(c.id.clone(), 0), (a.id.clone(), 1), (b.id.clone(), 2)],
        )
        .await
        .unwrap();

        let reordered = get_blocks(&pool, &playlist.id).await.unwrap();
        let terms: Vec<&str> = reordered.iter().map(|b| b.search_term.as_str()).collect();
        assert_eq!(terms, vec!["c", "a", "b"]);
        let orders: Vec<i64> = reordered.iter().map(|b| b.block_order).collect();
        assert_eq!(orders, vec![0, 1, 2]);

        // Non-dense order rejected
        let err = reorder_blocks(
            &pool,
            &playlist.id,
            &[(a.id.clone(), 0), (b.id.clone(), 0), (c.id.clone(), 2)],
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::InvariantViolation(_)));

        // Incomplete order rejected
        let err = reorder_blocks(&pool, &playlist.id, &[(a.id.clone(), 0)])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvariantViolation(_)));
    }

    #[tokio::test]
    async fn test_update_block_requires_idle_for_content() {
        let pool = test_pool().await;
        seed_display(&pool, "ABC123").await;
        let playlist =
            create_playlist(&pool, "ABC123", "p", &[block("cats", 2, BlockFormat::Wide)])
                .await
                .unwrap();
        let blocks = get_blocks(&pool, &playlist.id).await.unwrap();

        sqlx::query("UPDATE displays SET playback_state = 'playing' WHERE code = 'ABC123'")
            .execute(&pool)
            .await
            .unwrap();

        let err = update_block(
            &pool,
            &blocks[0].id,
            &BlockUpdate {
                search_term: Some("dogs".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        // fetch_mode is not content-affecting
        let updated = update_block(
            &pool,
            &blocks[0].id,
            &BlockUpdate {
                fetch_mode: Some(FetchMode::Random),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(updated.fetch_mode, "random");

        sqlx::query("UPDATE displays SET playback_state = 'idle' WHERE code = 'ABC123'")
            .execute(&pool)
            .await
            .unwrap();
        let updated = update_block(
            &pool,
            &blocks[0].id,
            &BlockUpdate {
                search_term: Some("dogs".to_string()),
                video_count: Some(3),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(updated.search_term, "dogs");
        assert_eq!(updated.video_count, 3);
    }

    #[tokio::test]
    async fn test_delete_block_renumbers() {
        let pool = test_pool().await;
        seed_display(&pool, "ABC123").await;
        let playlist = create_playlist(
            &pool,
            "ABC123",
            "p",
            &[
                block("a", 1, BlockFormat::Mixed),
                block("b", 1, BlockFormat::Mixed),
                block("c", 1, BlockFormat::Mixed),
            ],
        )
        .await
        .unwrap();
        let blocks = get_blocks(&pool, &playlist.id).await.unwrap();

        delete_block(&pool, &blocks[1].id).await.unwrap();

        let remaining = get_blocks(&pool, &playlist.id).await.unwrap();
        let terms: Vec<&str> = remaining.iter().map(|b| b.search_term.as_str()).collect();
        assert_eq!(terms, vec!["a", "c"]);
        let orders: Vec<i64> = remaining.iter().map(|b| b.block_order).collect();
        assert_eq!(orders, vec![0, 1]);
    }

    #[test]
    fn test_csv_field_quoting() {
        assert_eq!(csv_field("plain"), "plain");
        assert_eq!(csv_field("a,b"), "\"a,b\"");
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    #[test]
    fn test_parse_blocks_csv_rejects_malformed() {
        assert!(matches!(
            parse_blocks_csv(b"Search Term,Video Count\ncats,2"),
            Err(Error::MalformedCsv(_))
        ));
        assert!(matches!(
            parse_blocks_csv(b"Search Term,Video Count,Format\n"),
            Err(Error::MalformedCsv(_))
        ));
        assert!(matches!(
            parse_blocks_csv(b"Search Term,Video Count,Format\ncats,two,wide\n"),
            Err(Error::MalformedCsv(_))
        ));
        assert!(matches!(
            parse_blocks_csv(b"Search Term,Video Count,Format\ncats,2,circular\n"),
            Err(Error::MalformedCsv(_))
        ));
    }

    #[tokio::test]
    async fn test_csv_round_trip_with_commas() {
        let pool = test_pool().await;
        seed_display(&pool, "ABC123").await;
        let playlist = create_playlist(
            &pool,
            "ABC123",
            "p",
            &[
                block("cats, but fluffy", 2, BlockFormat::Wide),
                block("dogs -puppy", 3, BlockFormat::Tall),
                block("say \"cheese\"", 1, BlockFormat::Mixed),
                block("plain", 4, BlockFormat::Mixed),
            ],
        )
        .await
        .unwrap();

        let csv = export_csv(&pool, &playlist.id).await.unwrap();
        let imported = import_csv(&pool, "ABC123", "reimported", csv.as_bytes())
            .await
            .unwrap();

        let original = get_blocks(&pool, &playlist.id).await.unwrap();
        let round_tripped = get_blocks(&pool, &imported.id).await.unwrap();
        assert_eq!(original.len(), round_tripped.len());
        for (a, b) in original.iter().zip(round_tripped.iter()) {
            assert_eq!(a.search_term, b.search_term);
            assert_eq!(a.video_count, b.video_count);
            assert_eq!(a.format, b.format);
            assert_eq!(a.block_order, b.block_order);
        }
    }
}

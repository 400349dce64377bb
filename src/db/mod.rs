use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::Duration;

/// Open the SQLite pool with the standard connection options.
pub async fn connect(database_url: &str) -> Result<SqlitePool> {
    let connect_options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        // WAL mode for better concurrent read/write performance
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        // NORMAL sync is safe with WAL and much faster
        .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
        .page_size(8192)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(5))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .test_before_acquire(true)
        // Configure PRAGMAs on EVERY new connection via after_connect hook
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                use sqlx::Executor;
                // Cache size: -32000 = 32MB (negative = KB)
                conn.execute("PRAGMA cache_size = -32000").await?;
                // Memory-mapped I/O: 64MB
                conn.execute("PRAGMA mmap_size = 67108864").await?;
                conn.execute("PRAGMA temp_store = MEMORY").await?;
                Ok(())
            })
        })
        .connect_with(connect_options)
        .await
        .context("Failed to open SQLite database")?;

    tracing::info!("SQLite configured: WAL mode, 32MB cache, 64MB mmap (per connection)");

    Ok(pool)
}

pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS creators (
            id TEXT PRIMARY KEY,
            username TEXT NOT NULL,
            profile_url TEXT,
            follower_count INTEGER,
            post_count INTEGER,
            verified INTEGER NOT NULL DEFAULT 0,
            first_seen_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        );

        CREATE TABLE IF NOT EXISTS videos (
            id TEXT PRIMARY KEY,
            creator_id TEXT NOT NULL REFERENCES creators(id),
            description TEXT NOT NULL DEFAULT '',
            posted_at INTEGER NOT NULL,
            permalink TEXT,
            media_url TEXT NOT NULL,
            media_url_md TEXT,
            thumbnail_url TEXT,
            gif_url TEXT,
            width INTEGER,
            height INTEGER,
            like_count INTEGER,
            view_count INTEGER,
            format TEXT NOT NULL DEFAULT 'unknown',
            indexed_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        );

        CREATE TABLE IF NOT EXISTS displays (
            code TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            playback_state TEXT NOT NULL DEFAULT 'idle',
            current_playlist_id TEXT,
            current_video_id TEXT,
            current_block_id TEXT,
            timeline_position INTEGER NOT NULL DEFAULT 0,
            muted INTEGER NOT NULL DEFAULT 0,
            owner_token TEXT NOT NULL,
            last_ping TEXT,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        );

        CREATE TABLE IF NOT EXISTS playlists (
            id TEXT PRIMARY KEY,
            display_code TEXT NOT NULL REFERENCES displays(code) ON DELETE CASCADE,
            name TEXT NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 0,
            loop_count INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        );

        CREATE TABLE IF NOT EXISTS blocks (
            id TEXT PRIMARY KEY,
            playlist_id TEXT NOT NULL REFERENCES playlists(id) ON DELETE CASCADE,
            block_order INTEGER NOT NULL,
            search_term TEXT NOT NULL,
            video_count INTEGER NOT NULL,
            format TEXT NOT NULL DEFAULT 'mixed',
            fetch_mode TEXT NOT NULL DEFAULT 'newest',
            times_played INTEGER NOT NULL DEFAULT 0,
            last_played_at TEXT
        );

        CREATE TABLE IF NOT EXISTS timeline_entries (
            id TEXT PRIMARY KEY,
            display_code TEXT NOT NULL REFERENCES displays(code) ON DELETE CASCADE,
            playlist_id TEXT NOT NULL REFERENCES playlists(id) ON DELETE CASCADE,
            block_id TEXT NOT NULL REFERENCES blocks(id) ON DELETE CASCADE,
            video_id TEXT NOT NULL REFERENCES videos(id),
            timeline_position INTEGER NOT NULL,
            status TEXT NOT NULL DEFAULT 'queued',
            block_position INTEGER NOT NULL DEFAULT 0,
            loop_iteration INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            UNIQUE(display_code, playlist_id, video_id)
        );

        -- Append-only playback completion log, used for exhaustion tests
        CREATE TABLE IF NOT EXISTS video_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            display_code TEXT NOT NULL REFERENCES displays(code) ON DELETE CASCADE,
            block_id TEXT NOT NULL REFERENCES blocks(id) ON DELETE CASCADE,
            video_id TEXT NOT NULL,
            played_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        );

        -- Single-row scanner counters (id is always 1)
        CREATE TABLE IF NOT EXISTS ingestion_stats (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            total_scanned INTEGER NOT NULL DEFAULT 0,
            total_new INTEGER NOT NULL DEFAULT 0,
            total_duplicates INTEGER NOT NULL DEFAULT 0,
            total_errors INTEGER NOT NULL DEFAULT 0,
            poll_interval_ms INTEGER NOT NULL DEFAULT 0,
            avg_throughput REAL NOT NULL DEFAULT 0,
            avg_unique_per_sec REAL NOT NULL DEFAULT 0,
            avg_overlap REAL NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        );

        -- Full-text search virtual table for the public keyword search
        -- FTS5 in external-content mode over video descriptions
        CREATE VIRTUAL TABLE IF NOT EXISTS videos_fts USING fts5(
            description,
            content='videos',
            content_rowid='rowid'
        );
        "#,
    )
    .execute(pool)
    .await?;

    create_indexes(pool).await?;

    Ok(())
}

/// Create all database indexes for optimal query performance
async fn create_indexes(pool: &SqlitePool) -> Result<()> {
    let indexes = [
        // Recency queries for the scanner and newest-first block fills
        "CREATE INDEX IF NOT EXISTS idx_videos_posted_at ON videos(posted_at DESC, id)",
        // Format-filtered candidate queries
        "CREATE INDEX IF NOT EXISTS idx_videos_format ON videos(format)",
        "CREATE INDEX IF NOT EXISTS idx_videos_creator ON videos(creator_id)",
        // Timeline walks by display/playlist in position order
        "CREATE INDEX IF NOT EXISTS idx_timeline_display_playlist_pos ON timeline_entries(display_code, playlist_id, timeline_position)",
        "CREATE INDEX IF NOT EXISTS idx_timeline_block ON timeline_entries(block_id, loop_iteration)",
        "CREATE INDEX IF NOT EXISTS idx_timeline_status ON timeline_entries(display_code, playlist_id, status)",
        // Exhaustion checks by display/block
        "CREATE INDEX IF NOT EXISTS idx_video_history_display_block ON video_history(display_code, block_id)",
        // Block ordering within a playlist
        "CREATE INDEX IF NOT EXISTS idx_blocks_playlist_order ON blocks(playlist_id, block_order)",
        // Active playlist lookup per display
        "CREATE INDEX IF NOT EXISTS idx_playlists_display ON playlists(display_code, is_active)",
    ];

    for index_sql in indexes {
        if let Err(e) = sqlx::query(index_sql).execute(pool).await {
            tracing::warn!("Failed to create index: {} - {}", index_sql, e);
        }
    }

    tracing::debug!("Database indexes created/verified");

    Ok(())
}

/// Optimize the database (run periodically or on demand)
pub async fn optimize(pool: &SqlitePool) -> Result<()> {
    sqlx::query("ANALYZE").execute(pool).await?;
    sqlx::query("PRAGMA optimize").execute(pool).await?;
    Ok(())
}

// ============================================================================
// Full-Text Search helpers
// ============================================================================

/// Rebuild the FTS index from scratch (use after bulk inserts)
/// If the FTS table is corrupted, it will be dropped and recreated
pub async fn rebuild_fts_index(pool: &SqlitePool) -> Result<()> {
    tracing::info!("Rebuilding full-text search index...");

    let delete_result = sqlx::query("DELETE FROM videos_fts").execute(pool).await;

    // If delete failed (corrupted table), drop and recreate
    if delete_result.is_err() {
        tracing::warn!("FTS table appears corrupted, recreating...");

        if let Err(e) = sqlx::query("DROP TABLE IF EXISTS videos_fts")
            .execute(pool)
            .await
        {
            tracing::error!("Failed to drop corrupted FTS table: {}", e);
        }

        sqlx::query(
            r#"CREATE VIRTUAL TABLE IF NOT EXISTS videos_fts USING fts5(
                description,
                content='videos',
                content_rowid='rowid'
            )"#,
        )
        .execute(pool)
        .await
        .context("Failed to recreate FTS table")?;

        tracing::info!("FTS table recreated");
    }

    sqlx::query(
        r#"
        INSERT INTO videos_fts(rowid, description)
        SELECT rowid, description FROM videos
        "#,
    )
    .execute(pool)
    .await?;

    tracing::info!("Full-text search index rebuilt");
    Ok(())
}

/// Update the FTS index for a single video (after an individual insert)
pub async fn update_fts_video(pool: &SqlitePool, video_id: &str) -> Result<()> {
    let row: Option<(i64, String)> =
        sqlx::query_as("SELECT rowid, description FROM videos WHERE id = ?")
            .bind(video_id)
            .fetch_optional(pool)
            .await?;

    if let Some((rowid, description)) = row {
        sqlx::query("DELETE FROM videos_fts WHERE rowid = ?")
            .bind(rowid)
            .execute(pool)
            .await?;

        sqlx::query("INSERT INTO videos_fts(rowid, description) VALUES (?, ?)")
            .bind(rowid)
            .bind(&description)
            .execute(pool)
            .await?;
    }

    Ok(())
}

/// Prepare a user query for FTS5
/// Converts "hello world" -> "\"hello\"* OR \"world\"*" for prefix matching
pub fn prepare_fts_query(query: &str) -> String {
    let terms: Vec<String> = query
        .split_whitespace()
        .filter(|s| !s.is_empty() && s.len() >= 2)
        .map(|s| {
            // Escape special FTS5 characters and add prefix matching
            let escaped = s.replace(['"', '\'', '*'], "").replace('-', " ");
            format!("\"{}\"*", escaped)
        })
        .collect();

    terms.join(" OR ")
}

/// In-memory pool with the full schema applied, for tests.
#[cfg(test)]
pub async fn test_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite");
    migrate(&pool).await.expect("migrate test db");
    pool
}

// Content Index - durable store of ingested videos and creators with
// keyword search and format-filtered candidate queries.

use sqlx::SqlitePool;

use crate::error::{Error, Result};
use crate::models::{BlockFormat, FetchMode, Video, VideoFormat};

/// Creator fields as seen on an upstream page.
#[derive(Debug, Clone)]
pub struct NewCreator {
    pub id: String,
    pub username: String,
    pub profile_url: Option<String>,
    pub follower_count: Option<i64>,
    pub post_count: Option<i64>,
    pub verified: bool,
}

/// Video fields as seen on an upstream page.
#[derive(Debug, Clone)]
pub struct NewVideo {
    pub id: String,
    pub creator_id: String,
    pub description: String,
    pub posted_at: i64,
    pub permalink: Option<String>,
    pub media_url: String,
    pub media_url_md: Option<String>,
    pub thumbnail_url: Option<String>,
    pub gif_url: Option<String>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub like_count: Option<i64>,
    pub view_count: Option<i64>,
}

/// Outcome of ingesting one upstream item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Inserted,
    Duplicate,
}

/// Upsert a creator by id: created on first sighting, counters refreshed on
/// every re-sighting.
pub async fn upsert_creator(pool: &SqlitePool, creator: &NewCreator) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO creators (id, username, profile_url, follower_count, post_count, verified)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            username = excluded.username,
            profile_url = excluded.profile_url,
            follower_count = excluded.follower_count,
            post_count = excluded.post_count,
            verified = excluded.verified,
            updated_at = CURRENT_TIMESTAMP
        "#,
    )
    .bind(&creator.id)
    .bind(&creator.username)
    .bind(&creator.profile_url)
    .bind(creator.follower_count)
    .bind(creator.post_count)
    .bind(creator.verified)
    .execute(pool)
    .await?;

    Ok(())
}

/// Insert a video. Fails with `Duplicate` if the id already exists; the
/// existing row keeps everything except refreshed engagement counters.
pub async fn insert_video(pool: &SqlitePool, video: &NewVideo) -> Result<()> {
    let format = VideoFormat::from_dims(video.width, video.height);

    let result = sqlx::query(
        r#"
        INSERT OR IGNORE INTO videos (
            id, creator_id, description, posted_at, permalink,
            media_url, media_url_md, thumbnail_url, gif_url,
            width, height, like_count, view_count, format
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&video.id)
    .bind(&video.creator_id)
    .bind(&video.description)
    .bind(video.posted_at)
    .bind(&video.permalink)
    .bind(&video.media_url)
    .bind(&video.media_url_md)
    .bind(&video.thumbnail_url)
    .bind(&video.gif_url)
    .bind(video.width)
    .bind(video.height)
    .bind(video.like_count)
    .bind(video.view_count)
    .bind(format.as_str())
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        sqlx::query("UPDATE videos SET like_count = ?, view_count = ? WHERE id = ?")
            .bind(video.like_count)
            .bind(video.view_count)
            .bind(&video.id)
            .execute(pool)
            .await?;
        return Err(Error::Duplicate(video.id.clone()));
    }

    if let Err(e) = crate::db::update_fts_video(pool, &video.id).await {
        tracing::warn!("Failed to update FTS for video {}: {}", video.id, e);
    }

    Ok(())
}

/// Upsert the creator then insert the video, reporting whether the video was
/// new. Duplicates are an expected outcome, not an error.
pub async fn ingest_item(
    pool: &SqlitePool,
    creator: &NewCreator,
    video: &NewVideo,
) -> Result<IngestOutcome> {
    upsert_creator(pool, creator).await?;
    match insert_video(pool, video).await {
        Ok(()) => Ok(IngestOutcome::Inserted),
        Err(Error::Duplicate(_)) => Ok(IngestOutcome::Duplicate),
        Err(e) => Err(e),
    }
}

/// Split a search term into positive and negative tokens. Tokens prefixed
/// with `-` are negative; a bare `-` is ignored.
pub fn split_search_term(term: &str) -> (Vec<String>, Vec<String>) {
    let mut positive = Vec::new();
    let mut negative = Vec::new();
    for token in term.split_whitespace() {
        if let Some(stripped) = token.strip_prefix('-') {
            if !stripped.is_empty() {
                negative.push(stripped.to_string());
            }
        } else {
            positive.push(token.to_string());
        }
    }
    (positive, negative)
}

/// Escape LIKE wildcards so a token matches literally.
fn like_pattern(token: &str) -> String {
    let escaped = token
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{}%", escaped)
}

/// Candidate query for block materialization.
///
/// A video matches iff its description contains all positive tokens as
/// case-insensitive substrings and none of the negative tokens; an empty term
/// matches everything. `newest` orders by posted_at descending with id as the
/// tie-break; `random` is reproducible within the single statement only.
pub async fn search_videos(
    pool: &SqlitePool,
    term: &str,
    limit: i64,
    sort: FetchMode,
    format: BlockFormat,
    exclude_ids: &[String],
) -> Result<Vec<Video>> {
    let (positive, negative) = split_search_term(term);

    let mut sql = String::from("SELECT * FROM videos WHERE 1 = 1");
    for _ in &positive {
        sql.push_str(" AND description LIKE ? ESCAPE '\\'");
    }
    for _ in &negative {
        sql.push_str(" AND description NOT LIKE ? ESCAPE '\\'");
    }
    match format {
        BlockFormat::Mixed => {}
        BlockFormat::Wide => sql.push_str(" AND format = 'wide'"),
        BlockFormat::Tall => sql.push_str(" AND format = 'tall'"),
    }
    if !exclude_ids.is_empty() {
        let placeholders = vec!["?"; exclude_ids.len()].join(",");
        sql.push_str(&format!(" AND id NOT IN ({})", placeholders));
    }
    match sort {
        FetchMode::Newest => sql.push_str(" ORDER BY posted_at DESC, id ASC"),
        FetchMode::Random => sql.push_str(" ORDER BY RANDOM()"),
    }
    sql.push_str(" LIMIT ?");

    let mut query = sqlx::query_as::<_, Video>(&sql);
    for token in &positive {
        query = query.bind(like_pattern(token));
    }
    for token in &negative {
        query = query.bind(like_pattern(token));
    }
    for id in exclude_ids {
        query = query.bind(id);
    }
    query = query.bind(limit);

    query
        .fetch_all(pool)
        .await
        .map_err(|e| Error::IndexUnavailable(e.to_string()))
}

/// Count of indexed videos matching a term and format, used by the timeline
/// manager to decide exhaustion.
pub async fn count_by_term(pool: &SqlitePool, term: &str, format: BlockFormat) -> Result<i64> {
    let (positive, negative) = split_search_term(term);

    let mut sql = String::from("SELECT COUNT(*) FROM videos WHERE 1 = 1");
    for _ in &positive {
        sql.push_str(" AND description LIKE ? ESCAPE '\\'");
    }
    for _ in &negative {
        sql.push_str(" AND description NOT LIKE ? ESCAPE '\\'");
    }
    match format {
        BlockFormat::Mixed => {}
        BlockFormat::Wide => sql.push_str(" AND format = 'wide'"),
        BlockFormat::Tall => sql.push_str(" AND format = 'tall'"),
    }

    let mut query = sqlx::query_as::<_, (i64,)>(&sql);
    for token in positive.iter().chain(negative.iter()) {
        query = query.bind(like_pattern(token));
    }

    let (count,) = query
        .fetch_one(pool)
        .await
        .map_err(|e| Error::IndexUnavailable(e.to_string()))?;
    Ok(count)
}

pub async fn get_creator(pool: &SqlitePool, id: &str) -> Result<crate::models::Creator> {
    sqlx::query_as::<_, crate::models::Creator>("SELECT * FROM creators WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| Error::NotFound(format!("creator {}", id)))
}

pub async fn get_video(pool: &SqlitePool, id: &str) -> Result<Video> {
    sqlx::query_as::<_, Video>("SELECT * FROM videos WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| Error::NotFound(format!("video {}", id)))
}

/// A video joined with its creator's username, for the public viewer.
#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct VideoWithCreator {
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub video: Video,
    pub creator_username: String,
}

/// Newest-first page for the public viewer.
pub async fn latest_videos(
    pool: &SqlitePool,
    limit: i64,
    offset: i64,
) -> Result<Vec<VideoWithCreator>> {
    let rows = sqlx::query_as::<_, VideoWithCreator>(
        r#"
        SELECT v.*, c.username AS creator_username
        FROM videos v
        JOIN creators c ON c.id = v.creator_id
        ORDER BY v.posted_at DESC, v.id ASC
        LIMIT ? OFFSET ?
        "#,
    )
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await
    .map_err(|e| Error::IndexUnavailable(e.to_string()))?;
    Ok(rows)
}

/// Ranked keyword search for the public viewer: FTS5 with BM25 ranking,
/// falling back to plain substring matching when the FTS query is degenerate.
pub async fn keyword_search(
    pool: &SqlitePool,
    query: &str,
    limit: i64,
) -> Result<Vec<VideoWithCreator>> {
    let fts_query = crate::db::prepare_fts_query(query);

    if !fts_query.is_empty() {
        let result = sqlx::query_as::<_, VideoWithCreator>(
            r#"
            SELECT v.*, c.username AS creator_username
            FROM videos v
            JOIN videos_fts f ON v.rowid = f.rowid
            JOIN creators c ON c.id = v.creator_id
            WHERE videos_fts MATCH ?
            ORDER BY bm25(videos_fts)
            LIMIT ?
            "#,
        )
        .bind(&fts_query)
        .bind(limit)
        .fetch_all(pool)
        .await;

        match result {
            Ok(rows) => return Ok(rows),
            Err(e) => tracing::debug!("FTS query failed, falling back to LIKE: {}", e),
        }
    }

    let rows = sqlx::query_as::<_, VideoWithCreator>(
        r#"
        SELECT v.*, c.username AS creator_username
        FROM videos v
        JOIN creators c ON c.id = v.creator_id
        WHERE v.description LIKE ? ESCAPE '\'
        ORDER BY v.posted_at DESC, v.id ASC
        LIMIT ?
        "#,
    )
    .bind(like_pattern(query.trim()))
    .bind(limit)
    .fetch_all(pool)
    .await
    .map_err(|e| Error::IndexUnavailable(e.to_string()))?;
    Ok(rows)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn creator(id: &str) -> NewCreator {
        NewCreator {
            id: id.to_string(),
            username: format!("user_{}", id),
            profile_url: None,
            follower_count: Some(10),
            post_count: Some(5),
            verified: false,
        }
    }

    pub fn video(id: &str, creator_id: &str, description: &str, w: i64, h: i64) -> NewVideo {
        NewVideo {
            id: id.to_string(),
            creator_id: creator_id.to_string(),
            description: description.to_string(),
            posted_at: 1_700_000_000,
            permalink: None,
            media_url: format!("https://cdn.test/{}.mp4", id),
            media_url_md: None,
            thumbnail_url: None,
            gif_url: None,
            width: Some(w),
            height: Some(h),
            like_count: Some(0),
            view_count: Some(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{creator, video};
    use super::*;
    use crate::db::test_pool;

    #[test]
    fn test_split_search_term() {
        let (pos, neg) = split_search_term("cats -dogs  kitten -");
        assert_eq!(pos, vec!["cats", "kitten"]);
        assert_eq!(neg, vec!["dogs"]);

        let (pos, neg) = split_search_term("");
        assert!(pos.is_empty());
        assert!(neg.is_empty());
    }

    #[test]
    fn test_like_pattern_escapes_wildcards() {
        assert_eq!(like_pattern("50%"), "%50\\%%");
        assert_eq!(like_pattern("a_b"), "%a\\_b%");
    }

    #[tokio::test]
    async fn test_upsert_creator_refreshes_counters() {
        let pool = test_pool().await;
        upsert_creator(&pool, &creator("c1")).await.unwrap();

        let mut updated = creator("c1");
        updated.follower_count = Some(99);
        updated.verified = true;
        upsert_creator(&pool, &updated).await.unwrap();

        let row = get_creator(&pool, "c1").await.unwrap();
        assert_eq!(row.follower_count, Some(99));
        assert!(row.verified);

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM creators")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_insert_video_duplicate() {
        let pool = test_pool().await;
        upsert_creator(&pool, &creator("c1")).await.unwrap();

        insert_video(&pool, &video("v1", "c1", "a cat", 1920, 1080))
            .await
            .unwrap();
        let err = insert_video(&pool, &video("v1", "c1", "a cat", 1920, 1080))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Duplicate(_)));

        let outcome = ingest_item(&pool, &creator("c1"), &video("v1", "c1", "a cat", 1920, 1080))
            .await
            .unwrap();
        assert_eq!(outcome, IngestOutcome::Duplicate);
    }

    #[tokio::test]
    async fn test_search_positive_and_negative_tokens() {
        let pool = test_pool().await;
        upsert_creator(&pool, &creator("c1")).await.unwrap();
        for (id, desc) in [
            ("v1", "orange cat sleeping"),
            ("v2", "black dog and cat playing"),
            ("v3", "CAT compilation"),
            ("v4", "just a dog"),
        ] {
            insert_video(&pool, &video(id, "c1", desc, 1920, 1080))
                .await
                .unwrap();
        }

        let hits = search_videos(&pool, "cat -dog", 10, FetchMode::Newest, BlockFormat::Mixed, &[])
            .await
            .unwrap();
        let ids: Vec<&str> = hits.iter().map(|v| v.id.as_str()).collect();
        assert_eq!(ids, vec!["v1", "v3"]);

        // Empty term matches all
        let all = search_videos(&pool, "", 10, FetchMode::Newest, BlockFormat::Mixed, &[])
            .await
            .unwrap();
        assert_eq!(all.len(), 4);
    }

    #[tokio::test]
    async fn test_search_format_filter_and_exclude() {
        let pool = test_pool().await;
        upsert_creator(&pool, &creator("c1")).await.unwrap();
        insert_video(&pool, &video("w1", "c1", "cat", 1920, 1080)).await.unwrap();
        insert_video(&pool, &video("w2", "c1", "cat", 1280, 720)).await.unwrap();
        insert_video(&pool, &video("t1", "c1", "cat", 720, 1280)).await.unwrap();
        // Unknown dims are excluded from strict filters
        let mut nodims = video("u1", "c1", "cat", 0, 0);
        nodims.width = None;
        nodims.height = None;
        insert_video(&pool, &nodims).await.unwrap();

        let wide = search_videos(&pool, "cat", 10, FetchMode::Newest, BlockFormat::Wide, &[])
            .await
            .unwrap();
        assert_eq!(wide.len(), 2);
        assert!(wide.iter().all(|v| v.format == "wide"));

        let excluded = search_videos(
            &pool,
            "cat",
            10,
            FetchMode::Newest,
            BlockFormat::Wide,
            &["w1".to_string()],
        )
        .await
        .unwrap();
        assert_eq!(excluded.len(), 1);
        assert_eq!(excluded[0].id, "w2");

        let mixed = search_videos(&pool, "cat", 10, FetchMode::Newest, BlockFormat::Mixed, &[])
            .await
            .unwrap();
        assert_eq!(mixed.len(), 4);
    }

    #[tokio::test]
    async fn test_newest_ties_break_by_id() {
        let pool = test_pool().await;
        upsert_creator(&pool, &creator("c1")).await.unwrap();
        // Same posted_at for all three
        for id in ["b", "a", "c"] {
            insert_video(&pool, &video(id, "c1", "cat", 1920, 1080))
                .await
                .unwrap();
        }
        let hits = search_videos(&pool, "cat", 10, FetchMode::Newest, BlockFormat::Mixed, &[])
            .await
            .unwrap();
        let ids: Vec<&str> = hits.iter().map(|v| v.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_count_by_term() {
        let pool = test_pool().await;
        upsert_creator(&pool, &creator("c1")).await.unwrap();
        insert_video(&pool, &video("v1", "c1", "cat video", 1920, 1080)).await.unwrap();
        insert_video(&pool, &video("v2", "c1", "cat clip", 720, 1280)).await.unwrap();
        insert_video(&pool, &video("v3", "c1", "dog clip", 1920, 1080)).await.unwrap();

        assert_eq!(count_by_term(&pool, "cat", BlockFormat::Mixed).await.unwrap(), 2);
        assert_eq!(count_by_term(&pool, "cat", BlockFormat::Wide).await.unwrap(), 1);
        assert_eq!(count_by_term(&pool, "", BlockFormat::Mixed).await.unwrap(), 3);
        assert_eq!(count_by_term(&pool, "cat -clip", BlockFormat::Mixed).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_latest_and_keyword_search() {
        let pool = test_pool().await;
        upsert_creator(&pool, &creator("c1")).await.unwrap();
        let mut v = video("v1", "c1", "sunset timelapse over the bay", 1920, 1080);
        v.posted_at = 100;
        insert_video(&pool, &v).await.unwrap();
        let mut v = video("v2", "c1", "morning sunrise", 1920, 1080);
        v.posted_at = 200;
        insert_video(&pool, &v).await.unwrap();

        let latest = latest_videos(&pool, 10, 0).await.unwrap();
        assert_eq!(latest[0].video.id, "v2");
        assert_eq!(latest[0].creator_username, "user_c1");

        let hits = keyword_search(&pool, "sunset", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].video.id, "v1");
    }
}

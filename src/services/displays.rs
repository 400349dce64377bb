// Display registry - creation, lookup, deletion, and liveness derivation.

use chrono::NaiveDateTime;
use regex::Regex;
use sqlx::SqlitePool;
use std::sync::LazyLock;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::Display;

/// Seconds without a heartbeat after which a display counts as offline.
pub const OFFLINE_AFTER_SECS: i64 = 10;

static CODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z0-9]{6}$").expect("valid display code regex"));

pub fn timestamp_now() -> String {
    chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Validate the 6-character uppercase alphanumeric display code.
pub fn validate_code(code: &str) -> Result<()> {
    if CODE_RE.is_match(code) {
        Ok(())
    } else {
        Err(Error::BadInput(format!(
            "display code must be 6 uppercase alphanumeric characters, got '{}'",
            code
        )))
    }
}

pub async fn create_display(pool: &SqlitePool, code: &str, name: &str) -> Result<Display> {
    validate_code(code)?;

    let owner_token = Uuid::new_v4().to_string();
    let result = sqlx::query(
        "INSERT OR IGNORE INTO displays (code, name, owner_token) VALUES (?, ?, ?)",
    )
    .bind(code)
    .bind(name)
    .bind(&owner_token)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(Error::Conflict(format!("display code {} already exists", code)));
    }

    get_display(pool, code).await
}

pub async fn get_display(pool: &SqlitePool, code: &str) -> Result<Display> {
    sqlx::query_as::<_, Display>("SELECT * FROM displays WHERE code = ?")
        .bind(code)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| Error::NotFound(format!("display {}", code)))
}

pub async fn list_displays(pool: &SqlitePool) -> Result<Vec<Display>> {
    let displays =
        sqlx::query_as::<_, Display>("SELECT * FROM displays ORDER BY created_at ASC")
            .fetch_all(pool)
            .await?;
    Ok(displays)
}

/// Hard-delete a display; playlists, blocks, timeline entries, and history
/// cascade with it.
pub async fn delete_display(pool: &SqlitePool, code: &str) -> Result<()> {
    let result = sqlx::query("DELETE FROM displays WHERE code = ?")
        .bind(code)
        .execute(pool)
        .await?;
    if result.rows_affected() == 0 {
        return Err(Error::NotFound(format!("display {}", code)));
    }
    Ok(())
}

pub async fn record_ping(pool: &SqlitePool, code: &str) -> Result<()> {
    let result = sqlx::query("UPDATE displays SET last_ping = ? WHERE code = ?")
        .bind(timestamp_now())
        .bind(code)
        .execute(pool)
        .await?;
    if result.rows_affected() == 0 {
        return Err(Error::NotFound(format!("display {}", code)));
    }
    Ok(())
}

/// Liveness is inferred from heartbeat recency.
pub fn is_online(display: &Display) -> bool {
    let Some(ref last_ping) = display.last_ping else {
        return false;
    };
    let Ok(pinged) = NaiveDateTime::parse_from_str(last_ping, "%Y-%m-%d %H:%M:%S") else {
        return false;
    };
    let age = chrono::Utc::now().naive_utc() - pinged;
    age.num_seconds() <= OFFLINE_AFTER_SECS
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;

    #[tokio::test]
    async fn test_create_display_validates_code() {
        let pool = test_pool().await;

        assert!(matches!(
            create_display(&pool, "abc123", "x").await.unwrap_err(),
            Error::BadInput(_)
        ));
        assert!(matches!(
            create_display(&pool, "ABC12", "x").await.unwrap_err(),
            Error::BadInput(_)
        ));

        let display = create_display(&pool, "ABC123", "Lobby").await.unwrap();
        assert_eq!(display.code, "ABC123");
        assert_eq!(display.playback_state, "idle");
        assert!(!display.owner_token.is_empty());

        // Duplicate code is a conflict
        assert!(matches!(
            create_display(&pool, "ABC123", "Other").await.unwrap_err(),
            Error::Conflict(_)
        ));
    }

    #[tokio::test]
    async fn test_delete_display_cascades() {
        let pool = test_pool().await;
        create_display(&pool, "ABC123", "Lobby").await.unwrap();
        crate::services::playlists::create_playlist(
            &pool,
            "ABC123",
            "p",
            &[crate::services::playlists::NewBlock {
                search_term: "cats".to_string(),
                video_count: 1,
                format: crate::models::BlockFormat::Mixed,
                fetch_mode: crate::models::FetchMode::Newest,
            }],
        )
        .await
        .unwrap();

        delete_display(&pool, "ABC123").await.unwrap();

        let (playlists,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM playlists")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(playlists, 0);

        assert!(matches!(
            delete_display(&pool, "ABC123").await.unwrap_err(),
            Error::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_liveness_from_ping() {
        let pool = test_pool().await;
        let display = create_display(&pool, "ABC123", "Lobby").await.unwrap();
        assert!(!is_online(&display));

        record_ping(&pool, "ABC123").await.unwrap();
        let display = get_display(&pool, "ABC123").await.unwrap();
        assert!(is_online(&display));

        // A ping older than the window counts as offline
        let stale = (chrono::Utc::now() - chrono::Duration::seconds(OFFLINE_AFTER_SECS + 5))
            .format("%Y-%m-%d %H:%M:%S")
            .to_string();
        sqlx::query("UPDATE displays SET last_ping = ? WHERE code = 'ABC123'")
            .bind(&stale)
            .execute(&pool)
            .await
            .unwrap();
        let display = get_display(&pool, "ABC123").await.unwrap();
        assert!(!is_online(&display));
    }
}

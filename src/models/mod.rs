use serde::{Deserialize, Serialize};

/// Derived aspect-ratio class of a video, computed from its pixel dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoFormat {
    Wide,
    Tall,
    Square,
    Unknown,
}

impl VideoFormat {
    pub fn from_dims(width: Option<i64>, height: Option<i64>) -> Self {
        match (width, height) {
            (Some(w), Some(h)) if w > 0 && h > 0 => {
                if w > h {
                    VideoFormat::Wide
                } else if h > w {
                    VideoFormat::Tall
                } else {
                    VideoFormat::Square
                }
            }
            _ => VideoFormat::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VideoFormat::Wide => "wide",
            VideoFormat::Tall => "tall",
            VideoFormat::Square => "square",
            VideoFormat::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "wide" => VideoFormat::Wide,
            "tall" => VideoFormat::Tall,
            "square" => VideoFormat::Square,
            _ => VideoFormat::Unknown,
        }
    }
}

/// Format constraint on a block. `Mixed` accepts any video format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockFormat {
    Mixed,
    Wide,
    Tall,
}

impl BlockFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockFormat::Mixed => "mixed",
            BlockFormat::Wide => "wide",
            BlockFormat::Tall => "tall",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "mixed" => Some(BlockFormat::Mixed),
            "wide" => Some(BlockFormat::Wide),
            "tall" => Some(BlockFormat::Tall),
            _ => None,
        }
    }

    /// Strict for wide/tall; mixed is a pass-through.
    pub fn accepts(&self, format: VideoFormat) -> bool {
        match self {
            BlockFormat::Mixed => true,
            BlockFormat::Wide => format == VideoFormat::Wide,
            BlockFormat::Tall => format == VideoFormat::Tall,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchMode {
    Newest,
    Random,
}

impl FetchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchMode::Newest => "newest",
            FetchMode::Random => "random",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "newest" => Some(FetchMode::Newest),
            "random" => Some(FetchMode::Random),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    Idle,
    Playing,
    Paused,
}

impl PlaybackState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlaybackState::Idle => "idle",
            PlaybackState::Playing => "playing",
            PlaybackState::Paused => "paused",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "playing" => PlaybackState::Playing,
            "paused" => PlaybackState::Paused,
            _ => PlaybackState::Idle,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Queued,
    Played,
    Skipped,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Queued => "queued",
            EntryStatus::Played => "played",
            EntryStatus::Skipped => "skipped",
        }
    }
}

/// Upstream user identity. Created on first sighting, updated on re-sighting.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Creator {
    pub id: String,
    pub username: String,
    pub profile_url: Option<String>,
    pub follower_count: Option<i64>,
    pub post_count: Option<i64>,
    pub verified: bool,
    pub first_seen_at: String,
    pub updated_at: String,
}

/// One indexed upstream post. Immutable after insert except refreshed counters.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Video {
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
    pub format: String,
    pub indexed_at: String,
}

impl Video {
    pub fn video_format(&self) -> VideoFormat {
        VideoFormat::parse(&self.format)
    }
}

/// A remote playback endpoint identified by a 6-char uppercase code.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Display {
    pub code: String,
    pub name: String,
    pub playback_state: String,
    pub current_playlist_id: Option<String>,
    pub current_video_id: Option<String>,
    pub current_block_id: Option<String>,
    pub timeline_position: i64,
    pub muted: bool,
    pub owner_token: String,
    pub last_ping: Option<String>,
    pub created_at: String,
}

impl Display {
    pub fn state(&self) -> PlaybackState {
        PlaybackState::parse(&self.playback_state)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Playlist {
    pub id: String,
    pub display_code: String,
    pub name: String,
    pub is_active: bool,
    pub loop_count: i64,
    pub created_at: String,
}

/// One row of a playlist: a search specification expanding to `video_count`
/// concrete videos.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Block {
    pub id: String,
    pub playlist_id: String,
    pub block_order: i64,
    pub search_term: String,
    pub video_count: i64,
    pub format: String,
    pub fetch_mode: String,
    pub times_played: i64,
    pub last_played_at: Option<String>,
}

impl Block {
    pub fn block_format(&self) -> BlockFormat {
        BlockFormat::parse(&self.format).unwrap_or(BlockFormat::Mixed)
    }

    pub fn mode(&self) -> FetchMode {
        FetchMode::parse(&self.fetch_mode).unwrap_or(FetchMode::Newest)
    }
}

/// A materialized slot binding a video to a display's playlist at an ordinal.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TimelineEntry {
    pub id: String,
    pub display_code: String,
    pub playlist_id: String,
    pub block_id: String,
    pub video_id: String,
    pub timeline_position: i64,
    pub status: String,
    pub block_position: i64,
    pub loop_iteration: i64,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct VideoHistoryRow {
    pub id: i64,
    pub display_code: String,
    pub block_id: String,
    pub video_id: String,
    pub played_at: String,
}

/// Rolling ingestion counters published by the scanner after each cycle.
#[derive(Debug, Clone, Default, Serialize, Deserialize, sqlx::FromRow)]
pub struct IngestionStats {
    pub total_scanned: i64,
    pub total_new: i64,
    pub total_duplicates: i64,
    pub total_errors: i64,
    pub poll_interval_ms: i64,
    pub avg_throughput: f64,
    pub avg_unique_per_sec: f64,
    pub avg_overlap: f64,
    pub updated_at: String,
}

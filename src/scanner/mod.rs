// Ingestion Scanner - continuously pulls the latest upstream page, writes
// new videos to the content index, and tunes its polling interval to hold
// the page-overlap ratio near the target band.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::index;
use crate::models::IngestionStats;
use crate::services::credentials::CredentialStore;
use crate::services::feed::{convert_item, FeedClient};

/// Polling interval bounds under normal operation.
const INTERVAL_MIN_MS: u64 = 6_000;
const INTERVAL_MAX_MS: u64 = 30_000;

/// Error backoff may push the interval up to this cap.
const ERROR_INTERVAL_MAX_MS: u64 = 120_000;

/// Target overlap band: below it the scanner speeds up, above it slows down.
const OVERLAP_LOW: f64 = 0.25;
const OVERLAP_HIGH: f64 = 0.40;

const STEP_DOWN_MS: u64 = 500;
const STEP_UP_MS: u64 = 1_000;

/// A scan exceeding this is cancelled and the lock released.
const SCAN_WATCHDOG: Duration = Duration::from_secs(300);

/// Rolling window of cycle statistics.
const STATS_WINDOW: usize = 6;

/// Transient transport errors are retried this many times within a cycle.
const TRANSIENT_RETRIES: u32 = 3;

/// Consecutive parse/auth failures that force a credential refresh.
const CREDENTIAL_FAILURE_THRESHOLD: u32 = 2;

/// Consecutive errors that clamp the interval and reset the counter.
const ERROR_CLAMP_THRESHOLD: u32 = 10;

#[derive(Debug, Clone, Copy)]
struct CycleStats {
    throughput: f64,
    unique_per_sec: f64,
    overlap: f64,
}

struct ScannerState {
    interval_ms: u64,
    prev_page: HashSet<String>,
    consecutive_errors: u32,
    consecutive_auth_failures: u32,
    last_credential_refresh: Instant,
    window: VecDeque<CycleStats>,
}

/// Result of one successful scan cycle.
#[derive(Debug, Clone, Copy, Default)]
pub struct CycleOutcome {
    pub scanned: u64,
    pub new: u64,
    pub duplicates: u64,
    pub overlap: f64,
}

pub struct Scanner {
    pool: SqlitePool,
    feed: FeedClient,
    credentials: Arc<CredentialStore>,
    page_size: u32,
    refresh_interval: Option<Duration>,
    // One scan in flight at a time; run() and scan_once() share this.
    state: Mutex<ScannerState>,
}

impl Scanner {
    pub fn new(
        pool: SqlitePool,
        feed: FeedClient,
        credentials: Arc<CredentialStore>,
        page_size: u32,
        refresh_interval_hours: u64,
    ) -> Self {
        let refresh_interval = if refresh_interval_hours > 0 {
            Some(Duration::from_secs(refresh_interval_hours * 3600))
        } else {
            None
        };

        Self {
            pool,
            feed,
            credentials,
            page_size,
            refresh_interval,
            state: Mutex::new(ScannerState {
                interval_ms: INTERVAL_MAX_MS,
                prev_page: HashSet::new(),
                consecutive_errors: 0,
                consecutive_auth_failures: 0,
                last_credential_refresh: Instant::now(),
                window: VecDeque::with_capacity(STATS_WINDOW),
            }),
        }
    }

    /// Long-running worker loop. One cycle, then sleep the tuned interval.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!("Ingestion scanner started");

        loop {
            let sleep_ms = {
                let mut state = self.state.lock().await;
                match tokio::time::timeout(SCAN_WATCHDOG, self.scan_cycle(&mut state)).await {
                    Ok(Ok(outcome)) => {
                        if outcome.new > 0 {
                            tracing::info!(
                                "Scan: {} items, {} new, {} duplicates, overlap {:.0}%",
                                outcome.scanned,
                                outcome.new,
                                outcome.duplicates,
                                outcome.overlap * 100.0
                            );
                        }
                        state.interval_ms
                    }
                    Ok(Err(e)) => {
                        tracing::warn!("Scan cycle failed: {}", e);
                        state.interval_ms
                    }
                    Err(_) => {
                        tracing::error!("Scan watchdog fired after {:?}", SCAN_WATCHDOG);
                        self.record_error(&mut state).await;
                        state.interval_ms
                    }
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Ingestion scanner stopping");
                    break;
                }
                _ = tokio::time::sleep(Duration::from_millis(sleep_ms)) => {}
            }
        }
    }

    /// Run exactly one cycle (used by the CLI).
    pub async fn scan_once(&self) -> Result<CycleOutcome> {
        let mut state = self.state.lock().await;
        tokio::time::timeout(SCAN_WATCHDOG, self.scan_cycle(&mut state))
            .await
            .map_err(|_| Error::Transient("scan watchdog fired".to_string()))?
    }

    async fn scan_cycle(&self, state: &mut ScannerState) -> Result<CycleOutcome> {
        let started = Instant::now();

        // Scheduled credential refresh ahead of the request
        if let Some(refresh_interval) = self.refresh_interval {
            if state.last_credential_refresh.elapsed() >= refresh_interval {
                if let Err(e) = self.credentials.refresh().await {
                    tracing::warn!("Scheduled credential refresh failed: {}", e);
                }
                state.last_credential_refresh = Instant::now();
            }
        }

        let page = match self.fetch_with_retries().await {
            Ok(page) => page,
            Err(e) => {
                self.handle_fetch_error(state, &e).await;
                return Err(e);
            }
        };

        state.consecutive_errors = 0;
        state.consecutive_auth_failures = 0;

        let current_ids: HashSet<String> =
            page.items.iter().map(|item| item.post.id.clone()).collect();
        let overlap = overlap_ratio(&current_ids, &state.prev_page);

        let mut outcome = CycleOutcome {
            scanned: page.items.len() as u64,
            overlap,
            ..Default::default()
        };

        for item in &page.items {
            let Some((creator, video)) = convert_item(item) else {
                continue;
            };
            match index::ingest_item(&self.pool, &creator, &video).await {
                Ok(index::IngestOutcome::Inserted) => outcome.new += 1,
                Ok(index::IngestOutcome::Duplicate) => outcome.duplicates += 1,
                Err(e) => {
                    tracing::warn!("Failed to ingest item {}: {}", item.post.id, e);
                    self.bump_error_count().await;
                }
            }
        }

        state.prev_page = current_ids;
        state.interval_ms = adjust_interval(state.interval_ms, overlap);

        let duration = started.elapsed().as_secs_f64().max(0.001);
        push_window(
            &mut state.window,
            CycleStats {
                throughput: outcome.scanned as f64 / duration,
                unique_per_sec: outcome.new as f64 / duration,
                overlap,
            },
        );

        self.publish_stats(state, &outcome).await;

        Ok(outcome)
    }

    async fn fetch_with_retries(&self) -> Result<crate::services::feed::FeedPage> {
        let mut attempt = 0;
        loop {
            match self.feed.fetch_page(self.page_size, None).await {
                Ok(page) => return Ok(page),
                Err(Error::Transient(reason)) if attempt < TRANSIENT_RETRIES => {
                    attempt += 1;
                    let backoff = Duration::from_millis((1_000 * attempt as u64).min(2_000));
                    tracing::debug!(
                        "Transient feed error (attempt {}): {}; retrying in {:?}",
                        attempt,
                        reason,
                        backoff
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn handle_fetch_error(&self, state: &mut ScannerState, error: &Error) {
        // Parse failures and auth rejections both smell like dead credentials
        let credential_looking =
            matches!(error, Error::Credentials(_)) || matches!(error, Error::Upstream(_));
        if credential_looking {
            state.consecutive_auth_failures += 1;
            if state.consecutive_auth_failures >= CREDENTIAL_FAILURE_THRESHOLD {
                if let Err(e) = self.credentials.refresh().await {
                    tracing::warn!("Forced credential refresh failed: {}", e);
                }
                state.last_credential_refresh = Instant::now();
                state.consecutive_auth_failures = 0;
            }
        }

        self.record_error(state).await;
    }

    async fn record_error(&self, state: &mut ScannerState) {
        state.consecutive_errors += 1;
        let (interval_ms, reset) = backoff_interval(state.interval_ms, state.consecutive_errors);
        state.interval_ms = interval_ms;
        if reset {
            state.consecutive_errors = 0;
        }
        self.bump_error_count().await;
    }

    async fn bump_error_count(&self) {
        let result = sqlx::query(
            r#"
            INSERT INTO ingestion_stats (id, total_errors, updated_at)
            VALUES (1, 1, CURRENT_TIMESTAMP)
            ON CONFLICT(id) DO UPDATE SET
                total_errors = total_errors + 1,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .execute(&self.pool)
        .await;
        if let Err(e) = result {
            tracing::warn!("Failed to record scan error: {}", e);
        }
    }

    async fn publish_stats(&self, state: &ScannerState, outcome: &CycleOutcome) {
        let n = state.window.len().max(1) as f64;
        let avg_throughput = state.window.iter().map(|c| c.throughput).sum::<f64>() / n;
        let avg_unique = state.window.iter().map(|c| c.unique_per_sec).sum::<f64>() / n;
        let avg_overlap = state.window.iter().map(|c| c.overlap).sum::<f64>() / n;

        let result = sqlx::query(
            r#"
            INSERT INTO ingestion_stats (
                id, total_scanned, total_new, total_duplicates,
                poll_interval_ms, avg_throughput, avg_unique_per_sec, avg_overlap,
                updated_at
            )
            VALUES (1, ?, ?, ?, ?, ?, ?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(id) DO UPDATE SET
                total_scanned = total_scanned + excluded.total_scanned,
                total_new = total_new + excluded.total_new,
                total_duplicates = total_duplicates + excluded.total_duplicates,
                poll_interval_ms = excluded.poll_interval_ms,
                avg_throughput = excluded.avg_throughput,
                avg_unique_per_sec = excluded.avg_unique_per_sec,
                avg_overlap = excluded.avg_overlap,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(outcome.scanned as i64)
        .bind(outcome.new as i64)
        .bind(outcome.duplicates as i64)
        .bind(state.interval_ms as i64)
        .bind(avg_throughput)
        .bind(avg_unique)
        .bind(avg_overlap)
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            tracing::warn!("Failed to publish ingestion stats: {}", e);
        }
    }
}

/// Current ingestion counters, zeroed when no cycle has run yet.
pub async fn get_stats(pool: &SqlitePool) -> Result<IngestionStats> {
    let stats = sqlx::query_as::<_, IngestionStats>(
        r#"
        SELECT total_scanned, total_new, total_duplicates, total_errors,
               poll_interval_ms, avg_throughput, avg_unique_per_sec, avg_overlap,
               updated_at
        FROM ingestion_stats WHERE id = 1
        "#,
    )
    .fetch_optional(pool)
    .await?;
    Ok(stats.unwrap_or_default())
}

/// Overlap ratio between the current and previous page id sets. Zero for the
/// first page or an empty page.
fn overlap_ratio(current: &HashSet<String>, previous: &HashSet<String>) -> f64 {
    if current.is_empty() || previous.is_empty() {
        return 0.0;
    }
    let shared = current.iter().filter(|id| previous.contains(*id)).count();
    shared as f64 / current.len() as f64
}

/// Tune the polling interval toward the target overlap band, rounding to the
/// nearest 100 ms.
fn adjust_interval(interval_ms: u64, overlap: f64) -> u64 {
    let adjusted = if overlap < OVERLAP_LOW {
        interval_ms.saturating_sub(STEP_DOWN_MS).max(INTERVAL_MIN_MS)
    } else if overlap > OVERLAP_HIGH {
        (interval_ms + STEP_UP_MS).min(INTERVAL_MAX_MS)
    } else {
        interval_ms
    };
    round_to_100ms(adjusted)
}

/// Error backoff: every third consecutive error doubles the interval up to
/// the error cap; at the clamp threshold the interval pins to the cap and
/// the counter resets (the returned flag).
fn backoff_interval(interval_ms: u64, consecutive_errors: u32) -> (u64, bool) {
    if consecutive_errors >= ERROR_CLAMP_THRESHOLD {
        return (ERROR_INTERVAL_MAX_MS, true);
    }
    if consecutive_errors > 0 && consecutive_errors % 3 == 0 {
        return ((interval_ms * 2).min(ERROR_INTERVAL_MAX_MS), false);
    }
    (interval_ms, false)
}

fn round_to_100ms(ms: u64) -> u64 {
    ((ms + 50) / 100) * 100
}

fn push_window(window: &mut VecDeque<CycleStats>, stats: CycleStats) {
    if window.len() == STATS_WINDOW {
        window.pop_front();
    }
    window.push_back(stats);
}

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{routing::get, Router};
use clap::{Parser, Subcommand};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod config;
mod db;
mod error;
mod hub;
mod index;
mod models;
mod scanner;
mod services;

use config::AppConfig;
use hub::Hub;
use services::credentials::CredentialStore;
use services::feed::FeedClient;
use services::playback::PlaybackService;

#[derive(Parser)]
#[command(name = "vidwall", about = "Multi-display video playlist orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the orchestration server (default)
    Serve,
    /// Run exactly one ingestion cycle and print the counts
    ScanOnce,
    /// Stop playback and clear the timeline of a display
    ResetDisplay { code: String },
    /// Print the active playlist of a display as CSV
    ExportPlaylist { code: String },
    /// Import a CSV file as the display's new active playlist
    ImportPlaylist { code: String, file: PathBuf },
}

/// Tracks all background task handles for graceful shutdown
struct BackgroundTasks {
    handles: Vec<(&'static str, JoinHandle<()>)>,
    shutdown: CancellationToken,
}

impl BackgroundTasks {
    fn new() -> Self {
        Self {
            handles: Vec::new(),
            shutdown: CancellationToken::new(),
        }
    }

    fn token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    fn spawn<F>(&mut self, name: &'static str, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(future);
        self.handles.push((name, handle));
    }

    async fn shutdown(self) {
        tracing::info!("Initiating graceful shutdown...");

        self.shutdown.cancel();

        for (name, handle) in self.handles {
            tracing::debug!("Waiting for {} to finish...", name);
            match tokio::time::timeout(Duration::from_secs(10), handle).await {
                Ok(Ok(())) => tracing::debug!("{} finished cleanly", name),
                Ok(Err(e)) => tracing::warn!("{} panicked: {}", name, e),
                Err(_) => tracing::warn!("{} timed out during shutdown", name),
            }
        }

        tracing::info!("All background tasks stopped");
    }
}

pub struct AppState {
    pub pool: sqlx::SqlitePool,
    pub config: AppConfig,
    pub playback: PlaybackService,
    pub hub: Arc<Hub>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vidwall=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load .env file if present
    dotenvy::dotenv().ok();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // Help and version are not argument errors
            if e.use_stderr() {
                eprintln!("{}", e);
                return ExitCode::from(1);
            }
            println!("{}", e);
            return ExitCode::SUCCESS;
        }
    };

    let config = AppConfig::load();

    let result = match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::ScanOnce => scan_once(config).await,
        Command::ResetDisplay { code } => reset_display(config, &code).await,
        Command::ExportPlaylist { code } => export_playlist(config, &code).await,
        Command::ImportPlaylist { code, file } => import_playlist(config, &code, &file).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(2)
        }
    }
}

async fn open_pool(config: &AppConfig) -> Result<sqlx::SqlitePool> {
    config.paths.ensure_dirs().await?;
    let pool = db::connect(&config.database_url()).await?;
    db::migrate(&pool).await?;
    Ok(pool)
}

async fn build_scanner(config: &AppConfig, pool: sqlx::SqlitePool) -> Result<scanner::Scanner> {
    let credentials = Arc::new(
        CredentialStore::open(
            config.credentials_path(),
            config.credentials.refresh_command.clone(),
        )
        .await,
    );
    let feed = FeedClient::new(
        config.scanner.feed_url.clone(),
        config.scanner.user_agent.clone(),
        credentials.clone(),
    )
    .context("failed to build feed client")?;
    Ok(scanner::Scanner::new(
        pool,
        feed,
        credentials,
        config.scanner.page_size,
        config.credentials.refresh_interval_hours,
    ))
}

async fn serve(config: AppConfig) -> Result<()> {
    config.log_config();

    let pool = open_pool(&config).await?;
    let hub = Arc::new(Hub::new());

    let state = Arc::new(AppState {
        pool: pool.clone(),
        config: config.clone(),
        playback: PlaybackService::new(pool.clone()),
        hub: hub.clone(),
    });

    let mut bg_tasks = BackgroundTasks::new();
    let shutdown_token = bg_tasks.token();

    // Rebuild the search index once the server is up
    {
        let fts_pool = pool.clone();
        bg_tasks.spawn("fts-rebuild", async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            if let Err(e) = db::rebuild_fts_index(&fts_pool).await {
                tracing::error!("Failed to rebuild FTS index: {}", e);
            }
        });
    }

    // Ingestion scanner worker
    if config.scanner.enabled {
        let scan = build_scanner(&config, pool.clone()).await?;
        let cancel = shutdown_token.clone();
        bg_tasks.spawn("ingestion-scanner", async move {
            scan.run(cancel).await;
        });
    }

    // Periodic database maintenance
    {
        let maint_pool = pool.clone();
        let cancel = shutdown_token.clone();
        bg_tasks.spawn("db-maintenance", async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(6 * 3600)) => {
                        if let Err(e) = db::optimize(&maint_pool).await {
                            tracing::warn!("Database optimization failed: {}", e);
                        }
                    }
                }
            }
        });
    }

    // Display liveness sweeper
    {
        let sweep_pool = pool.clone();
        let sweep_hub = hub.clone();
        let cancel = shutdown_token.clone();
        bg_tasks.spawn("liveness-sweeper", async move {
            hub::run_liveness_sweeper(sweep_pool, sweep_hub, cancel).await;
        });
    }

    async fn root_handler() -> &'static str {
        "vidwall"
    }

    let app = Router::new()
        .route("/", get(root_handler).head(root_handler))
        .route("/health", get(|| async { "OK" }))
        .merge(api::routes())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr: std::net::SocketAddr = format!("{}:{}", config.bind_address, config.port)
        .parse()
        .context("invalid bind address")?;
    tracing::info!("Starting server on {}", addr);

    let shutdown_signal = async {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    tracing::error!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down..."),
            _ = terminate => tracing::info!("Received SIGTERM, shutting down..."),
        }
    };

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    bg_tasks.shutdown().await;

    tracing::info!("Server shutdown complete");
    Ok(())
}

async fn scan_once(config: AppConfig) -> Result<()> {
    let pool = open_pool(&config).await?;
    let scan = build_scanner(&config, pool).await?;

    let outcome = scan.scan_once().await?;
    println!(
        "scanned={} new={} duplicates={} overlap={:.1}%",
        outcome.scanned,
        outcome.new,
        outcome.duplicates,
        outcome.overlap * 100.0
    );
    Ok(())
}

async fn reset_display(config: AppConfig, code: &str) -> Result<()> {
    let pool = open_pool(&config).await?;
    let playback = PlaybackService::new(pool);

    // Stop transitions to idle and clears the timeline
    let delta = playback.stop(code).await?;
    println!("display {} reset (state: {})", code, delta.playback_state);
    Ok(())
}

async fn export_playlist(config: AppConfig, code: &str) -> Result<()> {
    let pool = open_pool(&config).await?;
    let playlist = services::playlists::get_active_playlist(&pool, code)
        .await?
        .with_context(|| format!("display {} has no active playlist", code))?;
    let csv = services::playlists::export_csv(&pool, &playlist.id).await?;
    print!("{}", csv);
    Ok(())
}

async fn import_playlist(config: AppConfig, code: &str, file: &std::path::Path) -> Result<()> {
    let pool = open_pool(&config).await?;
    let bytes = tokio::fs::read(file)
        .await
        .with_context(|| format!("failed to read {}", file.display()))?;

    let name = file
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("Imported playlist");
    let playlist = services::playlists::import_csv(&pool, code, name, &bytes).await?;
    println!(
        "imported playlist {} ({}) for display {}",
        playlist.id, playlist.name, code
    );
    Ok(())
}

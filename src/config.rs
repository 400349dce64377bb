// Configuration module for vidwall
// Handles XDG-compliant directory paths and TOML configuration file

use serde::Deserialize;
use std::path::PathBuf;

const APP_NAME: &str = "vidwall";
const CONFIG_FILENAME: &str = "config.toml";

/// TOML configuration file structure
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    /// Server configuration
    pub server: ServerConfig,

    /// Directory paths (overrides XDG defaults)
    pub paths: PathsConfig,

    /// Ingestion scanner configuration
    pub scanner: ScannerConfig,

    /// Upstream credential store configuration
    pub credentials: CredentialsConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server port (default: 4700)
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    pub bind_address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 4700,
            bind_address: "0.0.0.0".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Override data directory (database location)
    pub data_dir: Option<PathBuf>,

    /// Override config directory
    pub config_dir: Option<PathBuf>,
}

/// Ingestion scanner configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    /// Enable the background ingestion scanner (default: true)
    pub enabled: bool,

    /// Upstream feed endpoint URL
    pub feed_url: String,

    /// Upstream page size per request (default: 200)
    pub page_size: u32,

    /// User-Agent header sent upstream
    pub user_agent: String,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            feed_url: "https://feed.example.com/api/latest".to_string(),
            page_size: 200,
            user_agent: format!("vidwall/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Upstream credential store configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CredentialsConfig {
    /// Path to the token/cookie store file. Defaults to
    /// credentials.json in the data directory.
    pub store_path: Option<PathBuf>,

    /// Command invoked to refresh the store (out-of-process utility
    /// that rewrites the file). Run with `sh -c`.
    pub refresh_command: Option<String>,

    /// Hours between scheduled credential refreshes (default: 12, 0 disables)
    pub refresh_interval_hours: u64,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            store_path: None,
            refresh_command: None,
            refresh_interval_hours: 12,
        }
    }
}

/// Application paths following XDG Base Directory Specification on Unix
#[derive(Debug, Clone)]
pub struct AppPaths {
    /// Directory for configuration files (config.toml)
    pub config_dir: PathBuf,

    /// Directory for persistent data (database, credential store)
    pub data_dir: PathBuf,
}

impl AppPaths {
    pub fn new(config_overrides: &PathsConfig) -> Self {
        Self {
            config_dir: Self::resolve_config_dir(&config_overrides.config_dir),
            data_dir: Self::resolve_data_dir(&config_overrides.data_dir),
        }
    }

    /// Create application paths using current directory (portable mode)
    pub fn current_dir() -> Self {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self {
            config_dir: cwd.clone(),
            data_dir: cwd,
        }
    }

    fn resolve_config_dir(config_override: &Option<PathBuf>) -> PathBuf {
        if let Ok(path) = std::env::var("VIDWALL_CONFIG_DIR") {
            return PathBuf::from(path);
        }
        if let Some(ref path) = config_override {
            return path.clone();
        }
        if let Some(dir) = dirs::config_dir() {
            return dir.join(APP_NAME);
        }
        std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
    }

    fn resolve_data_dir(config_override: &Option<PathBuf>) -> PathBuf {
        if let Ok(path) = std::env::var("VIDWALL_DATA_DIR") {
            return PathBuf::from(path);
        }
        if let Some(ref path) = config_override {
            return path.clone();
        }
        if let Some(dir) = dirs::data_dir() {
            return dir.join(APP_NAME);
        }
        std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("vidwall.db")
    }

    pub fn database_url(&self) -> String {
        format!("sqlite:{}?mode=rwc", self.database_path().display())
    }

    pub fn credentials_path(&self) -> PathBuf {
        self.data_dir.join("credentials.json")
    }

    pub fn config_file_path(&self) -> PathBuf {
        self.config_dir.join(CONFIG_FILENAME)
    }

    /// Ensure all directories exist
    pub async fn ensure_dirs(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.config_dir).await?;
        tokio::fs::create_dir_all(&self.data_dir).await?;
        Ok(())
    }

    pub fn log_paths(&self) {
        tracing::info!("Configuration directory: {}", self.config_dir.display());
        tracing::info!("Data directory: {}", self.data_dir.display());
        tracing::debug!("Config file: {}", self.config_file_path().display());
        tracing::debug!("Database path: {}", self.database_path().display());
    }
}

impl Default for AppPaths {
    fn default() -> Self {
        Self::new(&PathsConfig::default())
    }
}

/// Application configuration - combines TOML file with environment overrides
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Application paths
    pub paths: AppPaths,

    /// Server port
    pub port: u16,

    /// Bind address
    pub bind_address: String,

    /// Scanner configuration
    pub scanner: ScannerConfig,

    /// Credential store configuration
    pub credentials: CredentialsConfig,
}

impl AppConfig {
    /// Load configuration from TOML file and environment
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables
    /// 2. TOML config file
    /// 3. Default values
    pub fn load() -> Self {
        let portable_mode = std::env::var("VIDWALL_PORTABLE")
            .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
            .unwrap_or(false);

        if portable_mode {
            tracing::info!("Running in portable mode (using current directory)");
            return Self::portable();
        }

        let config_dir = Self::find_config_dir();
        let config_file = Self::load_config_file(&config_dir);
        Self::build(config_file)
    }

    fn portable() -> Self {
        Self {
            paths: AppPaths::current_dir(),
            port: Self::env_port().unwrap_or(4700),
            bind_address: Self::env_bind_address().unwrap_or_else(|| "0.0.0.0".to_string()),
            scanner: Self::scanner_with_env(ScannerConfig::default()),
            credentials: CredentialsConfig::default(),
        }
    }

    fn find_config_dir() -> PathBuf {
        if let Ok(path) = std::env::var("VIDWALL_CONFIG_DIR") {
            return PathBuf::from(path);
        }
        if let Some(dir) = dirs::config_dir() {
            return dir.join(APP_NAME);
        }
        std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
    }

    /// Load and parse the TOML config file
    fn load_config_file(config_dir: &std::path::Path) -> ConfigFile {
        let config_path = config_dir.join(CONFIG_FILENAME);

        if !config_path.exists() {
            tracing::debug!(
                "No config file found at {}, using defaults",
                config_path.display()
            );
            return ConfigFile::default();
        }

        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded configuration from {}", config_path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to parse config file {}: {}. Using defaults.",
                        config_path.display(),
                        e
                    );
                    ConfigFile::default()
                }
            },
            Err(e) => {
                tracing::warn!(
                    "Failed to read config file {}: {}. Using defaults.",
                    config_path.display(),
                    e
                );
                ConfigFile::default()
            }
        }
    }

    fn build(config_file: ConfigFile) -> Self {
        let paths = AppPaths::new(&config_file.paths);
        let port = Self::env_port().unwrap_or(config_file.server.port);
        let bind_address =
            Self::env_bind_address().unwrap_or_else(|| config_file.server.bind_address.clone());

        Self {
            paths,
            port,
            bind_address,
            scanner: Self::scanner_with_env(config_file.scanner),
            credentials: config_file.credentials,
        }
    }

    fn scanner_with_env(mut scanner: ScannerConfig) -> ScannerConfig {
        if let Ok(url) = std::env::var("VIDWALL_FEED_URL") {
            scanner.feed_url = url;
        }
        scanner
    }

    fn env_port() -> Option<u16> {
        std::env::var("VIDWALL_PORT").ok().and_then(|p| p.parse().ok())
    }

    fn env_bind_address() -> Option<String> {
        std::env::var("VIDWALL_BIND_ADDRESS").ok()
    }

    /// Get the database URL, with override from DATABASE_URL env var
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL").unwrap_or_else(|_| self.paths.database_url())
    }

    /// Path to the credential store file
    pub fn credentials_path(&self) -> PathBuf {
        self.credentials
            .store_path
            .clone()
            .unwrap_or_else(|| self.paths.credentials_path())
    }

    /// Log configuration status
    pub fn log_config(&self) {
        self.paths.log_paths();
        tracing::info!("Server listening on {}:{}", self.bind_address, self.port);

        if self.scanner.enabled {
            tracing::info!("Ingestion scanner: ENABLED ({})", self.scanner.feed_url);
        } else {
            tracing::info!("Ingestion scanner: disabled");
        }

        if self.credentials.refresh_command.is_some() {
            tracing::debug!(
                "Credential refresh every {} hours",
                self.credentials.refresh_interval_hours
            );
        } else {
            tracing::debug!("No credential refresh command configured");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_dir_paths() {
        let paths = AppPaths::current_dir();
        assert!(paths.config_dir.is_absolute() || paths.config_dir == PathBuf::from("."));
        assert!(paths.database_path().ends_with("vidwall.db"));
    }

    #[test]
    fn test_database_url_format() {
        let paths = AppPaths::current_dir();
        let url = paths.database_url();
        assert!(url.starts_with("sqlite:"));
        assert!(url.ends_with("?mode=rwc"));
    }

    #[test]
    fn test_default_config_file() {
        let config = ConfigFile::default();
        assert_eq!(config.server.port, 4700);
        assert_eq!(config.server.bind_address, "0.0.0.0");
        assert_eq!(config.scanner.page_size, 200);
        assert!(config.scanner.enabled);
        assert_eq!(config.credentials.refresh_interval_hours, 12);
    }

    #[test]
    fn test_parse_config_toml() {
        let toml_str = r#"
[server]
port = 9000
bind_address = "127.0.0.1"

[scanner]
feed_url = "https://upstream.test/feed"
page_size = 100

[credentials]
refresh_command = "refresh-creds --store /tmp/creds.json"
refresh_interval_hours = 6
"#;
        let config: ConfigFile = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.bind_address, "127.0.0.1");
        assert_eq!(config.scanner.feed_url, "https://upstream.test/feed");
        assert_eq!(config.scanner.page_size, 100);
        assert_eq!(
            config.credentials.refresh_command.as_deref(),
            Some("refresh-creds --store /tmp/creds.json")
        );
        assert_eq!(config.credentials.refresh_interval_hours, 6);
    }

    #[test]
    fn test_partial_config_toml() {
        // Partial configs work (only specify what you need)
        let toml_str = r#"
[scanner]
enabled = false
"#;
        let config: ConfigFile = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.port, 4700); // default
        assert!(!config.scanner.enabled); // from file
    }
}

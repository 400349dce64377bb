// Upstream credential store. The token/cookie file is rewritten by an
// out-of-process refresher utility; we only ever read it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::RwLock;

use crate::error::{Error, Result};

/// How long the external refresher may run before we give up on it.
const REFRESH_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Credentials {
    pub token: String,
    #[serde(default)]
    pub cookies: Option<String>,
}

/// Shared handle to the on-disk credential store.
pub struct CredentialStore {
    path: PathBuf,
    refresh_command: Option<String>,
    current: RwLock<Credentials>,
}

impl CredentialStore {
    /// Open the store, loading the current file contents if present. A
    /// missing file is not an error; the scanner will fail upstream auth
    /// and trigger a refresh.
    pub async fn open(path: PathBuf, refresh_command: Option<String>) -> Self {
        let current = Self::read_file(&path).await.unwrap_or_else(|e| {
            tracing::warn!(
                "Credential store {} not readable ({}); starting empty",
                path.display(),
                e
            );
            Credentials::default()
        });

        Self {
            path,
            refresh_command,
            current: RwLock::new(current),
        }
    }

    async fn read_file(path: &Path) -> Result<Credentials> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| Error::Credentials(format!("read {}: {}", path.display(), e)))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| Error::Credentials(format!("parse {}: {}", path.display(), e)))
    }

    pub async fn token(&self) -> String {
        self.current.read().await.token.clone()
    }

    pub async fn cookies(&self) -> Option<String> {
        self.current.read().await.cookies.clone()
    }

    /// Re-read the store file into memory.
    pub async fn reload(&self) -> Result<()> {
        let fresh = Self::read_file(&self.path).await?;
        *self.current.write().await = fresh;
        tracing::debug!("Credential store reloaded from {}", self.path.display());
        Ok(())
    }

    /// Invoke the external refresher (if configured), then reload the file.
    pub async fn refresh(&self) -> Result<()> {
        if let Some(ref command) = self.refresh_command {
            tracing::info!("Invoking credential refresher");
            let child = tokio::process::Command::new("sh")
                .arg("-c")
                .arg(command)
                .output();

            match tokio::time::timeout(REFRESH_COMMAND_TIMEOUT, child).await {
                Ok(Ok(output)) if output.status.success() => {
                    tracing::info!("Credential refresher finished");
                }
                Ok(Ok(output)) => {
                    return Err(Error::Credentials(format!(
                        "refresher exited with {}: {}",
                        output.status,
                        String::from_utf8_lossy(&output.stderr).trim()
                    )));
                }
                Ok(Err(e)) => {
                    return Err(Error::Credentials(format!("refresher failed to run: {}", e)));
                }
                Err(_) => {
                    return Err(Error::Credentials("refresher timed out".to_string()));
                }
            }
        } else {
            tracing::debug!("No refresh command configured; reloading store file only");
        }

        self.reload().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_missing_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::open(dir.path().join("creds.json"), None).await;
        assert_eq!(store.token().await, "");
        assert!(store.cookies().await.is_none());
    }

    #[tokio::test]
    async fn test_reload_picks_up_rewritten_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("creds.json");

        std::fs::write(&path, r#"{"token":"tok-1","cookies":"cf=abc"}"#).unwrap();
        let store = CredentialStore::open(path.clone(), None).await;
        assert_eq!(store.token().await, "tok-1");
        assert_eq!(store.cookies().await.as_deref(), Some("cf=abc"));

        // Simulate the out-of-process refresher rewriting the file
        std::fs::write(&path, r#"{"token":"tok-2"}"#).unwrap();
        store.reload().await.unwrap();
        assert_eq!(store.token().await, "tok-2");
        assert!(store.cookies().await.is_none());
    }

    #[tokio::test]
    async fn test_refresh_runs_command_then_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("creds.json");
        std::fs::write(&path, r#"{"token":"old"}"#).unwrap();

        let command = format!(
            "printf '{{\"token\":\"fresh\"}}' > {}",
            path.to_str().unwrap()
        );
        let store = CredentialStore::open(path.clone(), Some(command)).await;
        store.refresh().await.unwrap();
        assert_eq!(store.token().await, "fresh");
    }

    #[tokio::test]
    async fn test_refresh_failing_command_is_credentials_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("creds.json");
        std::fs::write(&path, r#"{"token":"old"}"#).unwrap();

        let store = CredentialStore::open(path, Some("exit 3".to_string())).await;
        let err = store.refresh().await.unwrap_err();
        assert!(matches!(err, Error::Credentials(_)));
    }
}

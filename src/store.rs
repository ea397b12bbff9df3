use crate::chat::{SessionCollection, ThemeConfig};
use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const SESSIONS_FILE: &str = "chat_sessions.json";
pub const CONFIG_FILE: &str = "config.json";

/// JSON file persistence for the session collection and the theme config.
///
/// Every save rewrites the whole file. There is no locking; concurrent
/// writers race and the last full write wins.
#[derive(Clone, Debug)]
pub struct Store {
    sessions_path: PathBuf,
    config_path: PathBuf,
}

impl Store {
    /// Create a store that keeps both files inside `data_dir`.
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        let data_dir = data_dir.as_ref();
        Self {
            sessions_path: data_dir.join(SESSIONS_FILE),
            config_path: data_dir.join(CONFIG_FILE),
        }
    }

    pub fn sessions_path(&self) -> &Path {
        &self.sessions_path
    }

    /// Load the session collection. A missing, unreadable or malformed file
    /// yields an empty collection.
    pub async fn load_sessions(&self) -> SessionCollection {
        read_or_default(&self.sessions_path).await
    }

    pub async fn save_sessions(&self, sessions: &SessionCollection) -> Result<()> {
        write_json(&self.sessions_path, sessions)
            .await
            .context("Failed to save chat sessions")
    }

    /// Load the theme config, falling back to the light theme.
    pub async fn load_config(&self) -> ThemeConfig {
        read_or_default(&self.config_path).await
    }

    pub async fn save_config(&self, config: &ThemeConfig) -> Result<()> {
        write_json(&self.config_path, config)
            .await
            .context("Failed to save config")
    }
}

async fn read_or_default<T: DeserializeOwned + Default>(path: &Path) -> T {
    let raw = match tokio::fs::read(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("{} does not exist yet, using defaults", path.display());
            return T::default();
        }
        Err(e) => {
            warn!("Failed to read {}: {}", path.display(), e);
            return T::default();
        }
    };

    match serde_json::from_slice(&raw) {
        Ok(value) => value,
        Err(e) => {
            warn!("Ignoring malformed {}: {}", path.display(), e);
            T::default()
        }
    }
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create data directory")?;
        }
    }

    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
    value.serialize(&mut serializer)?;

    let tmp_path = path.with_extension("json.tmp");
    tokio::fs::write(&tmp_path, &buf)
        .await
        .with_context(|| format!("Failed to write {}", tmp_path.display()))?;
    tokio::fs::rename(&tmp_path, path)
        .await
        .with_context(|| format!("Failed to replace {}", path.display()))?;

    debug!("Wrote {} ({} bytes)", path.display(), buf.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::{ChatSession, Theme, WELCOME_GREETING};
    use tempfile::TempDir;

    #[tokio::test]
    async fn missing_files_yield_defaults() {
        let dir = TempDir::new().unwrap();
        let store = Store::new(dir.path());

        assert!(store.load_sessions().await.is_empty());
        assert_eq!(store.load_config().await.theme, Theme::Light);
    }

    #[tokio::test]
    async fn malformed_files_yield_defaults() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(SESSIONS_FILE), "not json at all").unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), r#"{"theme": "sepia"}"#).unwrap();
        let store = Store::new(dir.path());

        assert!(store.load_sessions().await.is_empty());
        assert_eq!(store.load_config().await.theme, Theme::Light);
    }

    #[tokio::test]
    async fn save_then_load_preserves_sessions_and_order() {
        let dir = TempDir::new().unwrap();
        let store = Store::new(dir.path().join("nested"));

        let mut sessions = SessionCollection::new();
        let first = ChatSession::new(WELCOME_GREETING);
        let second = ChatSession::new(WELCOME_GREETING);
        sessions.insert(first.clone());
        sessions.insert(second.clone());

        store.save_sessions(&sessions).await.unwrap();
        let loaded = store.load_sessions().await;

        assert_eq!(loaded, sessions);
        let ids: Vec<&str> = loaded.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec![first.id.as_str(), second.id.as_str()]);

        let raw = std::fs::read_to_string(store.sessions_path()).unwrap();
        assert!(raw.contains("\n    \""), "expected four-space indentation");
    }

    #[tokio::test]
    async fn config_save_overwrites() {
        let dir = TempDir::new().unwrap();
        let store = Store::new(dir.path());

        store
            .save_config(&ThemeConfig { theme: Theme::Dark })
            .await
            .unwrap();
        assert_eq!(store.load_config().await.theme, Theme::Dark);

        store.save_config(&ThemeConfig::default()).await.unwrap();
        assert_eq!(store.load_config().await.theme, Theme::Light);
    }
}

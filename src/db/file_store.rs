use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::info;

use super::{Announcement, DataSafe, DataSafeError, validate_identifier};

#[derive(Deserialize)]
struct FileDataSafeConfig {
    #[serde(default = "default_path")]
    path: PathBuf,
}

fn default_path() -> PathBuf {
    PathBuf::from("data")
}

/// Stores everything below one directory:
/// `config/<key>/<plugin>` for blobs and `announcements/<key>.json` for the history.
///
/// A single mutex serializes every operation of the instance.
#[derive(Default)]
pub struct FileDataSafe {
    root: Mutex<Option<PathBuf>>,
}

impl FileDataSafe {
    pub fn new() -> Self {
        Self::default()
    }
}

fn config_path(root: &Path, key: &str, plugin: &str) -> PathBuf {
    root.join("config").join(key).join(plugin)
}

fn history_path(root: &Path, key: &str) -> PathBuf {
    root.join("announcements").join(format!("{key}.json"))
}

/// Writes to a sibling temp file and renames it over the target.
async fn write_atomic(path: &Path, data: &[u8]) -> Result<(), DataSafeError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, data).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

async fn read_history(root: &Path, key: &str) -> Result<Vec<Announcement>, DataSafeError> {
    match fs::read(history_path(root, key)).await {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

fn parse_id(id: &str) -> Option<usize> {
    id.parse::<usize>().ok().filter(|n| *n > 0)
}

#[async_trait]
impl DataSafe for FileDataSafe {
    async fn initialise(&self, config: &[u8]) -> Result<(), DataSafeError> {
        let mut root = self.root.lock().await;
        if root.is_some() {
            return Err(DataSafeError::AlreadyInitialised);
        }
        let parsed: FileDataSafeConfig = if config.iter().all(u8::is_ascii_whitespace) {
            FileDataSafeConfig {
                path: default_path(),
            }
        } else {
            serde_json::from_slice(config)
                .map_err(|e| DataSafeError::InvalidConfig(e.to_string()))?
        };
        fs::create_dir_all(parsed.path.join("config")).await?;
        fs::create_dir_all(parsed.path.join("announcements")).await?;
        info!(path = ?parsed.path, "File data safe initialised.");
        *root = Some(parsed.path);
        Ok(())
    }

    async fn get_config(&self, key: &str, plugin: &str) -> Result<Option<Vec<u8>>, DataSafeError> {
        validate_identifier(key)?;
        validate_identifier(plugin)?;
        let root = self.root.lock().await;
        let root = root.as_ref().ok_or(DataSafeError::NotInitialised)?;
        match fs::read(config_path(root, key, plugin)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn set_config(&self, key: &str, plugin: &str, data: &[u8]) -> Result<(), DataSafeError> {
        validate_identifier(key)?;
        validate_identifier(plugin)?;
        let root = self.root.lock().await;
        let root = root.as_ref().ok_or(DataSafeError::NotInitialised)?;
        write_atomic(&config_path(root, key, plugin), data).await
    }

    async fn save_announcement(
        &self,
        key: &str,
        announcement: &Announcement,
    ) -> Result<String, DataSafeError> {
        validate_identifier(key)?;
        let root = self.root.lock().await;
        let root = root.as_ref().ok_or(DataSafeError::NotInitialised)?;
        let mut history = read_history(root, key).await?;
        history.push(announcement.clone());
        let bytes = serde_json::to_vec(&history)?;
        write_atomic(&history_path(root, key), &bytes).await?;
        Ok(history.len().to_string())
    }

    async fn get_announcement(&self, key: &str, id: &str) -> Result<Announcement, DataSafeError> {
        validate_identifier(key)?;
        let root = self.root.lock().await;
        let root = root.as_ref().ok_or(DataSafeError::NotInitialised)?;
        let index = parse_id(id).ok_or_else(|| DataSafeError::NotFound(id.to_string()))?;
        read_history(root, key)
            .await?
            .into_iter()
            .nth(index - 1)
            .ok_or_else(|| DataSafeError::NotFound(id.to_string()))
    }

    async fn get_all_announcements(&self, key: &str) -> Result<Vec<Announcement>, DataSafeError> {
        validate_identifier(key)?;
        let root = self.root.lock().await;
        let root = root.as_ref().ok_or(DataSafeError::NotInitialised)?;
        read_history(root, key).await
    }

    async fn get_announcement_keys(&self, key: &str) -> Result<Vec<String>, DataSafeError> {
        validate_identifier(key)?;
        let root = self.root.lock().await;
        let root = root.as_ref().ok_or(DataSafeError::NotInitialised)?;
        let count = read_history(root, key).await?.len();
        Ok((1..=count).map(|id| id.to_string()).collect())
    }
}

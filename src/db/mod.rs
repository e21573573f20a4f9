use async_trait::async_trait;
use thiserror::Error;

pub mod file_store;
pub mod models;
pub mod sqlite_store;

pub use file_store::FileDataSafe;
pub use models::Announcement;
pub use sqlite_store::SqliteDataSafe;

/// Character reserved by the storage layer; never valid inside a key or plugin name.
pub const RESERVED_CHAR: char = '\u{FDD0}';

#[derive(Error, Debug)]
pub enum DataSafeError {
    #[error("Invalid identifier: {0:?}")]
    InvalidIdentifier(String),
    #[error("Data safe used before initialisation")]
    NotInitialised,
    #[error("Data safe already initialised")]
    AlreadyInitialised,
    #[error("Invalid data safe configuration: {0}")]
    InvalidConfig(String),
    #[error("Announcement not found: {0}")]
    NotFound(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Durable storage for plugin configuration blobs and the per-tenant announcement history.
///
/// Implementations serialize writes for the same tenant themselves; callers may use one
/// instance from any number of tasks.
#[async_trait]
pub trait DataSafe: Send + Sync {
    /// Called once before any other method.
    async fn initialise(&self, config: &[u8]) -> Result<(), DataSafeError>;

    /// Returns `None` if nothing was ever saved for this pair.
    async fn get_config(&self, key: &str, plugin: &str) -> Result<Option<Vec<u8>>, DataSafeError>;

    async fn set_config(&self, key: &str, plugin: &str, data: &[u8]) -> Result<(), DataSafeError>;

    /// Appends to the history and returns an id reflecting arrival order.
    async fn save_announcement(
        &self,
        key: &str,
        announcement: &Announcement,
    ) -> Result<String, DataSafeError>;

    async fn get_announcement(&self, key: &str, id: &str) -> Result<Announcement, DataSafeError>;

    /// Oldest first.
    async fn get_all_announcements(&self, key: &str) -> Result<Vec<Announcement>, DataSafeError>;

    /// Ids in the same order as `get_all_announcements`.
    async fn get_announcement_keys(&self, key: &str) -> Result<Vec<String>, DataSafeError>;
}

/// Rejects names that could escape or collide in a path or row key.
pub fn validate_identifier(identifier: &str) -> Result<(), DataSafeError> {
    let invalid = identifier.is_empty()
        || identifier == "."
        || identifier == ".."
        || identifier
            .chars()
            .any(|c| matches!(c, '/' | '\\' | '\0' | RESERVED_CHAR));
    if invalid {
        return Err(DataSafeError::InvalidIdentifier(identifier.to_string()));
    }
    Ok(())
}

use async_trait::async_trait;
use axum::Router;
use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

use crate::db::{Announcement, DataSafe, DataSafeError};
use crate::services::AppServices;
use crate::services::encryption_service::{EncryptionError, EncryptionService};
use crate::tenant::error_log::ErrorSink;

pub mod bots;
pub mod mailer;
pub mod register_mail;
pub mod rss;
pub mod simple_mail;

use mailer::MailError;

#[derive(Error, Debug)]
pub enum PluginError {
    /// Rejected admin input; the text is shown to the admin.
    #[error("{0}")]
    InvalidInput(String),
    #[error("Storage error: {0}")]
    Storage(#[from] DataSafeError),
    #[error("Encryption error: {0}")]
    Encryption(#[from] EncryptionError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Template error: {0}")]
    Template(#[from] tera::Error),
    #[error("Mail error: {0}")]
    Mail(#[from] MailError),
    #[error("Bot error: {0}")]
    Bot(#[from] bots::BotError),
    #[error("Plugin worker is not running")]
    WorkerGone,
}

/// A delivery or feed backend attached to one tenant.
#[async_trait]
pub trait Plugin: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// HTML fragment for the admin page. Form fields post back with `target=<name>`.
    async fn config_panel(&self) -> Result<String, PluginError>;

    async fn process_config_change(&self, form: HashMap<String, String>) -> Result<(), PluginError>;

    /// Called once per published announcement, on its own task.
    async fn new_announcement(&self, announcement: Announcement, id: String);

    /// Public pages, nested below `/{key}/{name}`.
    fn routes(self: Arc<Self>) -> Option<Router> {
        None
    }
}

/// Everything a factory needs to build a plugin for one tenant.
#[derive(Clone)]
pub struct PluginContext {
    pub key: String,
    pub description: String,
    pub errors: ErrorSink,
    pub store: PluginStore,
    pub services: AppServices,
}

pub type PluginFactory =
    Arc<dyn Fn(PluginContext) -> BoxFuture<'static, Result<Arc<dyn Plugin>, PluginError>> + Send + Sync>;

/// Wraps an async constructor into a `PluginFactory`.
pub fn factory<F, Fut>(f: F) -> PluginFactory
where
    F: Fn(PluginContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Arc<dyn Plugin>, PluginError>> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)))
}

/// Persistence for one plugin's state. Values are serialized to JSON and encrypted as a whole
/// before they reach the data safe, so secrets never need special handling by the plugin.
#[derive(Clone)]
pub struct PluginStore {
    safe: Arc<dyn DataSafe>,
    encryption: Arc<EncryptionService>,
    key: String,
    name: String,
}

impl PluginStore {
    pub fn new(
        safe: Arc<dyn DataSafe>,
        encryption: Arc<EncryptionService>,
        key: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            safe,
            encryption,
            key: key.into(),
            name: name.into(),
        }
    }

    pub fn data_safe(&self) -> &Arc<dyn DataSafe> {
        &self.safe
    }

    /// Missing state yields `T::default()`.
    pub async fn load<T: DeserializeOwned + Default>(&self) -> Result<T, PluginError> {
        match self.safe.get_config(&self.key, &self.name).await? {
            None => Ok(T::default()),
            Some(blob) if blob.is_empty() => Ok(T::default()),
            Some(blob) => {
                let plain = self.encryption.decrypt(&blob)?;
                Ok(serde_json::from_slice(&plain)?)
            }
        }
    }

    pub async fn save<T: Serialize + ?Sized>(&self, value: &T) -> Result<(), PluginError> {
        let plain = serde_json::to_vec(value)?;
        let blob = self.encryption.encrypt(&plain)?;
        self.safe.set_config(&self.key, &self.name, &blob).await?;
        Ok(())
    }
}

/// Reads a form field, treating a missing one as empty.
pub(crate) fn field<'a>(form: &'a HashMap<String, String>, name: &str) -> &'a str {
    form.get(name).map(|s| s.as_str()).unwrap_or("")
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Sample {
        token: String,
        targets: Vec<i64>,
    }

    #[tokio::test]
    async fn test_store_round_trip_is_encrypted() {
        let safe = Arc::new(MemoryDataSafe::default());
        let store = PluginStore::new(safe.clone(), encryption(), "news", "Telegram");

        assert_eq!(store.load::<Sample>().await.unwrap(), Sample::default());

        let value = Sample {
            token: "123:secret".to_string(),
            targets: vec![1, -100],
        };
        store.save(&value).await.unwrap();
        assert_eq!(store.load::<Sample>().await.unwrap(), value);

        let raw = safe.get_config("news", "Telegram").await.unwrap().unwrap();
        assert!(!String::from_utf8_lossy(&raw).contains("secret"));
    }

    #[tokio::test]
    async fn test_store_names_are_separate() {
        let safe = Arc::new(MemoryDataSafe::default());
        let store = PluginStore::new(safe.clone(), encryption(), "news", "RSS");
        store.save(&vec![1, 2, 3]).await.unwrap();
        let other = PluginStore::new(safe, encryption(), "news", "Discord");
        assert_eq!(other.load::<Vec<i32>>().await.unwrap(), Vec::<i32>::new());
        assert_eq!(store.load::<Vec<i32>>().await.unwrap(), vec![1, 2, 3]);
    }
}

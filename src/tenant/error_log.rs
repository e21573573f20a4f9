use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, warn};

use crate::plugins::{PluginError, PluginStore};
use crate::server::counter::ProcessCounter;

/// Storage name of the error log; the `@` prefix can never be a plugin name.
pub const ERROR_LOG_NAME: &str = "@errors";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub time: DateTime<Utc>,
    pub message: String,
}

/// Write-only handle plugins use to surface asynchronous failures to the tenant's error log.
#[derive(Clone, Debug)]
pub struct ErrorSink {
    tx: mpsc::UnboundedSender<String>,
    tenant: Arc<str>,
    source: Arc<str>,
}

impl ErrorSink {
    pub fn channel(tenant: &str) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = Self {
            tx,
            tenant: Arc::from(tenant),
            source: Arc::from(""),
        };
        (sink, rx)
    }

    /// Same channel, messages prefixed with `source`.
    pub fn scoped(&self, source: &str) -> Self {
        Self {
            tx: self.tx.clone(),
            tenant: self.tenant.clone(),
            source: Arc::from(source),
        }
    }

    pub fn report(&self, message: impl Into<String>) {
        let message = message.into();
        let message = if self.source.is_empty() {
            message
        } else {
            format!("{} ({}): {message}", self.source, self.tenant)
        };
        warn!(tenant = %self.tenant, error = %message, "Plugin error reported.");
        if self.tx.send(message).is_err() {
            error!(tenant = %self.tenant, "Error log worker is gone; error dropped.");
        }
    }
}

/// The persisted, operator-clearable error log of one tenant.
pub struct ErrorLog {
    entries: Mutex<Vec<ErrorEntry>>,
    store: PluginStore,
    counter: ProcessCounter,
}

impl ErrorLog {
    pub async fn load(store: PluginStore, counter: ProcessCounter) -> Result<Arc<Self>, PluginError> {
        let entries: Vec<ErrorEntry> = store.load().await?;
        Ok(Arc::new(Self {
            entries: Mutex::new(entries),
            store,
            counter,
        }))
    }

    /// Drains the channel into the log until every sink is dropped.
    pub fn spawn_worker(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<String>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let _guard = self.counter.start();
                self.push(message).await;
            }
        })
    }

    async fn push(&self, message: String) {
        let mut entries = self.entries.lock().await;
        entries.push(ErrorEntry {
            time: Utc::now(),
            message,
        });
        if let Err(e) = self.store.save(&*entries).await {
            error!(error = %e, "Failed to persist error log.");
        }
    }

    pub async fn entries(&self) -> Vec<ErrorEntry> {
        self.entries.lock().await.clone()
    }

    pub async fn clear(&self) -> Result<(), PluginError> {
        let mut entries = self.entries.lock().await;
        entries.clear();
        self.store.save(&*entries).await
    }
}

//! A tenant is one announcement host: its descriptor, its plugins, its login and history.

use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::db::{Announcement, DataSafe, DataSafeError};
use crate::plugins::{Plugin, PluginContext, PluginError, PluginStore};
use crate::registry::Registry;
use crate::services::AppServices;
use crate::services::auth_service::Role;
use crate::services::password_methods::PasswordMethod;

pub mod error_log;

use error_log::{ERROR_LOG_NAME, ErrorEntry, ErrorLog, ErrorSink};

#[derive(Error, Debug)]
pub enum TenantError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("Invalid tenant key {0:?}")]
    InvalidKey(String),
    #[error("Tenant key {0:?} is used more than once")]
    DuplicateKey(String),
    #[error("Plugin {plugin:?} is listed more than once for tenant {key:?}")]
    DuplicatePlugin { key: String, plugin: String },
    #[error("Unknown password method {0:?}")]
    UnknownPasswordMethod(String),
    #[error("Unknown plugin {0:?}")]
    UnknownPlugin(String),
    #[error("Plugin {plugin} of tenant {key} failed to start: {source}")]
    Plugin {
        key: String,
        plugin: String,
        source: PluginError,
    },
    #[error("Failed to load the error log of {key}: {source}")]
    ErrorLog { key: String, source: PluginError },
}

fn default_password_method() -> String {
    "plain".to_string()
}

/// One tenant configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct TenantDescriptor {
    pub key: String,
    #[serde(default)]
    pub short_description: String,
    #[serde(default)]
    pub plugins: Vec<String>,
    #[serde(default)]
    pub password_admin: Vec<String>,
    #[serde(default)]
    pub password_user: Vec<String>,
    #[serde(default = "default_password_method")]
    pub password_method: String,
}

impl TenantDescriptor {
    pub fn from_file(path: &Path) -> Result<Self, TenantError> {
        let raw = std::fs::read_to_string(path).map_err(|source| TenantError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| TenantError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Every `*.json` file of `dir`, in file name order.
    pub fn load_dir(dir: &Path) -> Result<Vec<Self>, TenantError> {
        let read_error = |source| TenantError::Read {
            path: dir.to_path_buf(),
            source,
        };
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir).map_err(read_error)? {
            let path = entry.map_err(read_error)?.path();
            if path.is_file() && path.extension().is_some_and(|e| e == "json") {
                paths.push(path);
            }
        }
        paths.sort();
        paths.iter().map(|p| Self::from_file(p)).collect()
    }
}

/// Keys become URL path segments and storage names.
pub fn is_valid_key(key: &str) -> bool {
    !key.is_empty()
        && !key.starts_with('.')
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '~' | '-'))
}

/// The delivery tasks started by one publish call.
pub struct FanOut {
    /// `None` when the history append failed.
    pub id: Option<String>,
    pub deliveries: Vec<JoinHandle<()>>,
}

impl FanOut {
    pub async fn wait(self) {
        for delivery in self.deliveries {
            if let Err(e) = delivery.await {
                error!(error = %e, "Plugin delivery task failed.");
            }
        }
    }
}

pub struct Tenant {
    pub key: String,
    pub description: String,
    plugins: Vec<Arc<dyn Plugin>>,
    password_admin: Vec<String>,
    password_user: Vec<String>,
    password_method: PasswordMethod,
    safe: Arc<dyn DataSafe>,
    errors: ErrorSink,
    error_log: Arc<ErrorLog>,
    services: AppServices,
}

impl Tenant {
    pub async fn load(
        descriptor: TenantDescriptor,
        registry: &Registry,
        safe: Arc<dyn DataSafe>,
        services: AppServices,
    ) -> Result<Arc<Self>, TenantError> {
        let key = descriptor.key;
        if !is_valid_key(&key) {
            return Err(TenantError::InvalidKey(key));
        }

        let mut seen = HashSet::new();
        for name in &descriptor.plugins {
            if !seen.insert(name.as_str()) {
                return Err(TenantError::DuplicatePlugin {
                    key,
                    plugin: name.clone(),
                });
            }
        }

        let password_method = registry
            .password_method(&descriptor.password_method)
            .ok_or_else(|| TenantError::UnknownPasswordMethod(descriptor.password_method.clone()))?;

        let (errors, error_rx) = ErrorSink::channel(&key);
        let mut plugins = Vec::with_capacity(descriptor.plugins.len());
        for name in &descriptor.plugins {
            let factory = registry
                .get_plugin(name)
                .ok_or_else(|| TenantError::UnknownPlugin(name.clone()))?;
            let ctx = PluginContext {
                key: key.clone(),
                description: descriptor.short_description.clone(),
                errors: errors.scoped(name),
                store: PluginStore::new(safe.clone(), services.encryption.clone(), &key, name),
                services: services.clone(),
            };
            let plugin = factory(ctx).await.map_err(|source| TenantError::Plugin {
                key: key.clone(),
                plugin: name.clone(),
                source,
            })?;
            plugins.push(plugin);
        }

        let log_store = PluginStore::new(safe.clone(), services.encryption.clone(), &key, ERROR_LOG_NAME);
        let error_log = ErrorLog::load(log_store, services.counter.clone())
            .await
            .map_err(|source| TenantError::ErrorLog {
                key: key.clone(),
                source,
            })?;
        error_log.clone().spawn_worker(error_rx);

        info!(tenant = %key, plugins = ?descriptor.plugins, "Tenant loaded.");
        Ok(Arc::new(Self {
            key,
            description: descriptor.short_description,
            plugins,
            password_admin: descriptor.password_admin,
            password_user: descriptor.password_user,
            password_method,
            safe,
            errors,
            error_log,
            services,
        }))
    }

    /// Loads every descriptor, rejecting keys used twice.
    pub async fn load_all(
        descriptors: Vec<TenantDescriptor>,
        registry: &Registry,
        safe: Arc<dyn DataSafe>,
        services: AppServices,
    ) -> Result<Vec<Arc<Self>>, TenantError> {
        let mut keys = HashSet::new();
        let mut tenants = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            if !keys.insert(descriptor.key.clone()) {
                return Err(TenantError::DuplicateKey(descriptor.key));
            }
            tenants.push(Self::load(descriptor, registry, safe.clone(), services.clone()).await?);
        }
        Ok(tenants)
    }

    pub fn plugins(&self) -> &[Arc<dyn Plugin>] {
        &self.plugins
    }

    pub fn plugin(&self, name: &str) -> Option<&Arc<dyn Plugin>> {
        self.plugins.iter().find(|p| p.name() == name)
    }

    pub fn services(&self) -> &AppServices {
        &self.services
    }

    fn matches(&self, password: &str, candidates: &[String]) -> bool {
        candidates.iter().any(|stored| {
            (self.password_method)(password, stored).unwrap_or_else(|e| {
                warn!(tenant = %self.key, error = %e, "Configured password could not be checked.");
                false
            })
        })
    }

    /// User passwords are checked first, so a password listed twice logs in as user.
    pub fn login(&self, password: &str) -> Option<Role> {
        if self.matches(password, &self.password_user) {
            Some(Role::User)
        } else if self.matches(password, &self.password_admin) {
            Some(Role::Admin)
        } else {
            None
        }
    }

    /// Appends to the history, then hands the announcement to every plugin on its own task.
    pub async fn publish(&self, header: &str, message: &str) -> FanOut {
        let announcement = Announcement::new(header, message);
        let id = match self.safe.save_announcement(&self.key, &announcement).await {
            Ok(id) => Some(id),
            Err(e) => {
                self.errors
                    .report(format!("could not save announcement ({header}): {e}"));
                None
            }
        };
        info!(tenant = %self.key, id = ?id, header, "Announcement published.");

        let deliveries = self
            .plugins
            .iter()
            .map(|plugin| {
                let plugin = plugin.clone();
                let announcement = announcement.clone();
                let id = id.clone().unwrap_or_default();
                let guard = self.services.counter.start();
                tokio::spawn(async move {
                    plugin.new_announcement(announcement, id).await;
                    drop(guard);
                })
            })
            .collect();
        FanOut { id, deliveries }
    }

    /// Oldest first, paired with their ids.
    pub async fn history(&self) -> Result<Vec<(String, Announcement)>, DataSafeError> {
        let ids = self.safe.get_announcement_keys(&self.key).await?;
        let announcements = self.safe.get_all_announcements(&self.key).await?;
        Ok(ids.into_iter().zip(announcements).collect())
    }

    pub async fn error_entries(&self) -> Vec<ErrorEntry> {
        self.error_log.entries().await
    }

    pub async fn clear_errors(&self) -> Result<(), PluginError> {
        self.error_log.clear().await
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::plugins::factory;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Records announcements; sleeps first when `delay` is set.
    pub struct Recorder {
        pub name: &'static str,
        pub delay: Duration,
        pub seen: Arc<Mutex<Vec<(String, String)>>>,
    }

    #[async_trait]
    impl Plugin for Recorder {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn config_panel(&self) -> Result<String, PluginError> {
            Ok(format!("<p>{} panel</p>", self.name))
        }

        async fn process_config_change(&self, form: HashMap<String, String>) -> Result<(), PluginError> {
            if form.contains_key("fail") {
                return Err(PluginError::InvalidInput("rejected".to_string()));
            }
            Ok(())
        }

        async fn new_announcement(&self, announcement: Announcement, id: String) {
            tokio::time::sleep(self.delay).await;
            self.seen.lock().unwrap().push((id, announcement.header));
        }

        fn routes(self: Arc<Self>) -> Option<axum::Router> {
            async fn seen(axum::extract::State(recorder): axum::extract::State<Arc<Recorder>>) -> String {
                recorder.seen.lock().unwrap().len().to_string()
            }
            Some(
                axum::Router::new()
                    .route("/seen.txt", axum::routing::get(seen))
                    .with_state(self),
            )
        }
    }

    pub fn register_recorder(
        registry: &Registry,
        name: &'static str,
        delay: Duration,
    ) -> Arc<Mutex<Vec<(String, String)>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let shared = seen.clone();
        registry
            .register_plugin(
                factory(move |_ctx| {
                    let seen = shared.clone();
                    async move {
                        Ok(Arc::new(Recorder { name, delay, seen }) as Arc<dyn Plugin>)
                    }
                }),
                name,
            )
            .unwrap();
        seen
    }

    pub fn descriptor(key: &str, plugins: &[&str]) -> TenantDescriptor {
        TenantDescriptor {
            key: key.to_string(),
            short_description: format!("{key} news"),
            plugins: plugins.iter().map(|p| p.to_string()).collect(),
            password_admin: vec!["admin-pw".to_string(), "shared".to_string()],
            password_user: vec!["user-pw".to_string(), "shared".to_string()],
            password_method: "plain".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::plugins::mailer::testing::MockMailer;
    use crate::plugins::testing::{MemoryDataSafe, services};
    use std::time::Duration;

    fn registry() -> Registry {
        let registry = Registry::new();
        registry
            .register_password_method(crate::services::password_methods::plain, "plain")
            .unwrap();
        registry
    }

    async fn load(registry: &Registry, descriptor: TenantDescriptor) -> Result<Arc<Tenant>, TenantError> {
        Tenant::load(
            descriptor,
            registry,
            Arc::new(MemoryDataSafe::default()),
            services(Arc::new(MockMailer::default())),
        )
        .await
    }

    #[test]
    fn test_key_charset() {
        for key in ["news", "a.b", "x_y~z-1", "UPPER"] {
            assert!(is_valid_key(key), "{key}");
        }
        for key in ["", ".hidden", "a/b", "a#b", "a b", "ä"] {
            assert!(!is_valid_key(key), "{key}");
        }
    }

    #[test]
    fn test_descriptor_defaults() {
        let descriptor: TenantDescriptor = serde_json::from_str(r#"{"key": "news"}"#).unwrap();
        assert_eq!(descriptor.password_method, "plain");
        assert!(descriptor.plugins.is_empty());
    }

    #[test]
    fn test_load_dir_reads_json_files_in_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.json"), r#"{"key": "second"}"#).unwrap();
        std::fs::write(dir.path().join("a.json"), r#"{"key": "first"}"#).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        let keys: Vec<String> = TenantDescriptor::load_dir(dir.path())
            .unwrap()
            .into_iter()
            .map(|d| d.key)
            .collect();
        assert_eq!(keys, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_load_errors() {
        let registry = registry();
        register_recorder(&registry, "Recorder", Duration::ZERO);

        let err = load(&registry, descriptor("bad/key", &[])).await.err().unwrap();
        assert!(matches!(err, TenantError::InvalidKey(_)));

        let err = load(&registry, descriptor("news", &["Recorder", "Recorder"])).await.err().unwrap();
        assert!(matches!(err, TenantError::DuplicatePlugin { .. }));

        let err = load(&registry, descriptor("news", &["Missing"])).await.err().unwrap();
        assert!(matches!(err, TenantError::UnknownPlugin(_)));

        let mut unknown_method = descriptor("news", &[]);
        unknown_method.password_method = "rot13".to_string();
        let err = load(&registry, unknown_method).await.err().unwrap();
        assert!(matches!(err, TenantError::UnknownPasswordMethod(_)));
    }

    #[tokio::test]
    async fn test_duplicate_keys_are_rejected() {
        let registry = registry();
        let result = Tenant::load_all(
            vec![descriptor("news", &[]), descriptor("news", &[])],
            &registry,
            Arc::new(MemoryDataSafe::default()),
            services(Arc::new(MockMailer::default())),
        )
        .await;
        assert!(matches!(result, Err(TenantError::DuplicateKey(_))));
    }

    #[tokio::test]
    async fn test_login_checks_user_before_admin() {
        let registry = registry();
        let tenant = load(&registry, descriptor("news", &[])).await.unwrap();
        assert_eq!(tenant.login("user-pw"), Some(Role::User));
        assert_eq!(tenant.login("admin-pw"), Some(Role::Admin));
        assert_eq!(tenant.login("shared"), Some(Role::User));
        assert_eq!(tenant.login("wrong"), None);
        assert_eq!(tenant.login(""), None);
    }

    #[tokio::test]
    async fn test_publish_appends_and_fans_out() {
        let registry = registry();
        let first = register_recorder(&registry, "First", Duration::ZERO);
        let second = register_recorder(&registry, "Second", Duration::ZERO);
        let tenant = load(&registry, descriptor("news", &["First", "Second"])).await.unwrap();

        let fan_out = tenant.publish("Hello", "World").await;
        assert_eq!(fan_out.id.as_deref(), Some("1"));
        fan_out.wait().await;

        assert_eq!(*first.lock().unwrap(), vec![("1".to_string(), "Hello".to_string())]);
        assert_eq!(*second.lock().unwrap(), vec![("1".to_string(), "Hello".to_string())]);

        let history = tenant.history().await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].0, "1");
        assert_eq!(history[0].1.message, "World");
    }

    #[tokio::test]
    async fn test_storage_failure_still_fans_out() {
        let registry = registry();
        let seen = register_recorder(&registry, "First", Duration::ZERO);
        let safe = Arc::new(MemoryDataSafe::default());
        let tenant = Tenant::load(
            descriptor("news", &["First"]),
            &registry,
            safe.clone(),
            services(Arc::new(MockMailer::default())),
        )
        .await
        .unwrap();

        *safe.fail_writes.lock().unwrap() = true;
        let fan_out = tenant.publish("Hello", "World").await;
        assert!(fan_out.id.is_none());
        fan_out.wait().await;
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_slow_plugin_does_not_block_publish() {
        let registry = registry();
        let slow = register_recorder(&registry, "Slow", Duration::from_millis(300));
        let fast = register_recorder(&registry, "Fast", Duration::ZERO);
        let tenant = load(&registry, descriptor("news", &["Slow", "Fast"])).await.unwrap();

        let started = std::time::Instant::now();
        let fan_out = tenant.publish("Hello", "World").await;
        assert!(started.elapsed() < Duration::from_millis(200));
        assert!(slow.lock().unwrap().is_empty());
        assert_eq!(tenant.services().counter.active(), 2);

        fan_out.wait().await;
        assert_eq!(fast.lock().unwrap().len(), 1);
        assert_eq!(slow.lock().unwrap().len(), 1);
        assert_eq!(tenant.services().counter.active(), 0);
    }
}

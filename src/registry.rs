//! Name lookup for everything a tenant descriptor or the server config can refer to.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;

use crate::db::{DataSafe, FileDataSafe, SqliteDataSafe};
use crate::plugins::bots::{discord, telegram};
use crate::plugins::{PluginFactory, factory, register_mail, rss, simple_mail};
use crate::services::password_methods::{self, PasswordMethod};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistryError {
    #[error("{kind} {name:?} is already registered")]
    AlreadyRegistered { kind: &'static str, name: String },
    #[error("plugin names starting with '@' are reserved: {0:?}")]
    ReservedName(String),
}

/// Plugins, data safes and password methods by name. The first registration of a name wins.
#[derive(Default)]
pub struct Registry {
    plugins: RwLock<HashMap<String, PluginFactory>>,
    data_safes: RwLock<HashMap<String, Arc<dyn DataSafe>>>,
    password_methods: RwLock<HashMap<String, PasswordMethod>>,
}

fn insert<V>(
    map: &RwLock<HashMap<String, V>>,
    kind: &'static str,
    name: &str,
    value: V,
) -> Result<(), RegistryError> {
    let mut map = map.write().unwrap_or_else(|poisoned| poisoned.into_inner());
    if map.contains_key(name) {
        return Err(RegistryError::AlreadyRegistered {
            kind,
            name: name.to_string(),
        });
    }
    map.insert(name.to_string(), value);
    Ok(())
}

fn lookup<V: Clone>(map: &RwLock<HashMap<String, V>>, name: &str) -> Option<V> {
    map.read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .get(name)
        .cloned()
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every plugin, backend and password method shipped with the server.
    pub fn with_builtins() -> Result<Self, RegistryError> {
        let registry = Self::new();
        registry.register_plugin(factory(rss::create), rss::NAME)?;
        registry.register_plugin(factory(simple_mail::create), simple_mail::NAME)?;
        registry.register_plugin(factory(register_mail::create), register_mail::NAME)?;
        registry.register_plugin(factory(telegram::create), telegram::NAME)?;
        registry.register_plugin(factory(discord::create), discord::NAME)?;

        registry.register_data_safe(Arc::new(FileDataSafe::new()), "file")?;
        registry.register_data_safe(Arc::new(SqliteDataSafe::new()), "SQLite")?;

        registry.register_password_method(password_methods::plain, "plain")?;
        registry.register_password_method(password_methods::bcrypt_plain, "bcrypt_plain")?;
        registry.register_password_method(password_methods::bcrypt64, "bcrypt64")?;
        Ok(registry)
    }

    pub fn register_plugin(&self, factory: PluginFactory, name: &str) -> Result<(), RegistryError> {
        if name.starts_with('@') {
            return Err(RegistryError::ReservedName(name.to_string()));
        }
        insert(&self.plugins, "plugin", name, factory)
    }

    pub fn register_data_safe(&self, safe: Arc<dyn DataSafe>, name: &str) -> Result<(), RegistryError> {
        insert(&self.data_safes, "data safe", name, safe)
    }

    pub fn register_password_method(
        &self,
        method: PasswordMethod,
        name: &str,
    ) -> Result<(), RegistryError> {
        insert(&self.password_methods, "password method", name, method)
    }

    pub fn get_plugin(&self, name: &str) -> Option<PluginFactory> {
        lookup(&self.plugins, name)
    }

    pub fn get_data_safe(&self, name: &str) -> Option<Arc<dyn DataSafe>> {
        lookup(&self.data_safes, name)
    }

    pub fn password_method(&self, name: &str) -> Option<PasswordMethod> {
        lookup(&self.password_methods, name)
    }

    pub fn password_method_exists(&self, name: &str) -> bool {
        self.password_method(name).is_some()
    }

    pub fn plugin_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .plugins
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins() {
        let registry = Registry::with_builtins().unwrap();
        assert_eq!(
            registry.plugin_names(),
            vec!["Discord", "RSS", "RegisterMail", "SimpleSendMail", "Telegram"]
        );
        assert!(registry.get_data_safe("file").is_some());
        assert!(registry.get_data_safe("SQLite").is_some());
        assert!(registry.get_data_safe("postgres").is_none());
        assert!(registry.password_method_exists("bcrypt64"));
        assert!(!registry.password_method_exists("md5"));
    }

    #[test]
    fn test_first_registration_wins() {
        let registry = Registry::with_builtins().unwrap();
        fn always(_: &str, _: &str) -> Result<bool, password_methods::PasswordError> {
            Ok(true)
        }
        assert_eq!(
            registry.register_password_method(always, "plain"),
            Err(RegistryError::AlreadyRegistered {
                kind: "password method",
                name: "plain".to_string()
            })
        );
        let plain = registry.password_method("plain").unwrap();
        assert!(!plain("guess", "secret").unwrap());

        assert!(registry.register_plugin(factory(rss::create), "RSS").is_err());
        assert!(registry.register_data_safe(Arc::new(FileDataSafe::new()), "file").is_err());
    }

    #[test]
    fn test_reserved_plugin_names() {
        let registry = Registry::new();
        assert_eq!(
            registry.register_plugin(factory(rss::create), "@errors"),
            Err(RegistryError::ReservedName("@errors".to_string()))
        );
        assert!(registry.get_plugin("@errors").is_none());
    }

    #[test]
    fn test_concurrent_lookups() {
        let registry = Arc::new(Registry::with_builtins().unwrap());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.get_plugin("RSS").is_some())
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap());
        }
    }
}

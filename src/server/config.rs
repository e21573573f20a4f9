use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file at {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse JSON from config file at {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Process-wide settings, read once from a JSON file at startup.
#[derive(Deserialize, Debug, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_language")]
    pub language: String,

    #[serde(default = "default_address")]
    pub address: String,

    #[serde(default)]
    pub log_failed_login: bool,

    #[serde(default = "default_login_minutes")]
    pub login_minutes: i64,

    #[serde(default)]
    pub path_dsgvo: Option<PathBuf>,

    #[serde(default)]
    pub path_impressum: Option<PathBuf>,

    #[serde(default = "default_tenant_config_dir")]
    pub tenant_config_dir: PathBuf,

    #[serde(default = "default_data_safe")]
    pub data_safe: String,

    /// Path of the file handed verbatim to the data safe's initialiser.
    #[serde(default)]
    pub data_safe_config: Option<PathBuf>,

    #[serde(default = "default_encryption_key")]
    pub encryption_key: String,

    /// Secret for signing login cookies. A random one is generated per process when unset,
    /// which logs everybody out on restart.
    #[serde(default)]
    pub login_secret: Option<String>,

    #[serde(default = "default_log_dir")]
    pub log_dir: String,
}

fn default_language() -> String {
    "en".to_string()
}

fn default_address() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_login_minutes() -> i64 {
    60
}

fn default_tenant_config_dir() -> PathBuf {
    PathBuf::from("config")
}

fn default_data_safe() -> String {
    "file".to_string()
}

fn default_log_dir() -> String {
    "logs".to_string()
}

fn default_encryption_key() -> String {
    // This key is for development convenience.
    // It's crucial to override this in production.
    "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            language: default_language(),
            address: default_address(),
            log_failed_login: false,
            login_minutes: default_login_minutes(),
            path_dsgvo: None,
            path_impressum: None,
            tenant_config_dir: default_tenant_config_dir(),
            data_safe: default_data_safe(),
            data_safe_config: None,
            encryption_key: default_encryption_key(),
            login_secret: None,
            log_dir: default_log_dir(),
        }
    }
}

impl ServerConfig {
    /// Loads the configuration. A missing file yields the defaults.
    pub fn load(config_path: &Path) -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();

        if !config_path.exists() {
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(config_path).map_err(|source| ConfigError::Read {
            path: config_path.to_path_buf(),
            source,
        })?;
        let config = Self::from_json(&contents).map_err(|source| ConfigError::Parse {
            path: config_path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(contents: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(contents)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.login_minutes <= 0 {
            return Err(ConfigError::Invalid(
                "login_minutes must be positive".to_string(),
            ));
        }
        if self.address.is_empty() {
            return Err(ConfigError::Invalid("address must not be empty".to_string()));
        }
        Ok(())
    }

    /// Raw bytes handed to `DataSafe::initialise`.
    pub fn data_safe_bytes(&self) -> Result<Vec<u8>, ConfigError> {
        match &self.data_safe_config {
            None => Ok(Vec::new()),
            Some(path) => fs::read(path).map_err(|source| ConfigError::Read {
                path: path.clone(),
                source,
            }),
        }
    }
}

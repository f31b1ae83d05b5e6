use serde::{Deserialize, Serialize};
use sofa_core::ConnectionConfig;
use std::path::PathBuf;

/// Source of a configuration value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigSource {
    Default,
    File,
    Environment,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::Default => write!(f, "default"),
            ConfigSource::File => write!(f, "file"),
            ConfigSource::Environment => write!(f, "environment"),
        }
    }
}

/// A configuration value with its source
#[derive(Debug, Clone, Serialize)]
pub struct ConfigValue<T> {
    pub value: T,
    pub source: ConfigSource,
}

impl<T> ConfigValue<T> {
    pub fn new(value: T, source: ConfigSource) -> Self {
        Self { value, source }
    }
}

/// Application configuration with source tracking
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// CouchDB host, optionally with scheme
    pub host: ConfigValue<String>,
    pub port: ConfigValue<u16>,
    pub username: Option<ConfigValue<String>>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    /// Cache fetched documents in memory
    pub cache: ConfigValue<bool>,
    /// Config file path used (if any)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_file: Option<PathBuf>,
}

/// Internal struct for deserializing config file
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct ConfigFile {
    host: Option<String>,
    port: Option<u16>,
    username: Option<String>,
    password: Option<String>,
    cache: Option<bool>,
}

impl Config {
    /// Load configuration with priority: env vars > config file > defaults
    pub fn load(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let defaults = ConnectionConfig::default();

        // Start with defaults
        let mut host = ConfigValue::new(defaults.host, ConfigSource::Default);
        let mut port = ConfigValue::new(defaults.port, ConfigSource::Default);
        let mut username = None;
        let mut password = None;
        let mut cache = ConfigValue::new(defaults.cache, ConfigSource::Default);
        let mut config_file = None;

        // Try to load from config file
        let path = config_path.unwrap_or_else(Self::default_config_path);
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadError(path.clone(), e))?;
            let file_config: ConfigFile = serde_yaml::from_str(&contents)
                .map_err(|e| ConfigError::ParseError(path.clone(), e))?;

            config_file = Some(path.clone());

            if let Some(value) = file_config.host {
                host = ConfigValue::new(value, ConfigSource::File);
            }
            if let Some(value) = file_config.port {
                port = ConfigValue::new(value, ConfigSource::File);
            }
            if let Some(value) = file_config.username {
                username = Some(ConfigValue::new(value, ConfigSource::File));
            }
            if let Some(value) = file_config.cache {
                cache = ConfigValue::new(value, ConfigSource::File);
            }
            password = file_config.password;
        }

        // Apply environment variable overrides
        if let Ok(value) = std::env::var("SOFA_HOST") {
            host = ConfigValue::new(value, ConfigSource::Environment);
        }
        if let Ok(value) = std::env::var("SOFA_PORT") {
            let parsed = value
                .parse()
                .map_err(|_| ConfigError::InvalidValue("SOFA_PORT".to_string(), value))?;
            port = ConfigValue::new(parsed, ConfigSource::Environment);
        }
        if let Ok(value) = std::env::var("SOFA_USERNAME") {
            username = Some(ConfigValue::new(value, ConfigSource::Environment));
        }
        if let Ok(value) = std::env::var("SOFA_PASSWORD") {
            password = Some(value);
        }

        Ok(Self {
            host,
            port,
            username,
            password,
            cache,
            config_file,
        })
    }

    /// Connection settings for sofa-core
    pub fn connection(&self) -> ConnectionConfig {
        let connection = ConnectionConfig::new(self.host.value.clone(), self.port.value)
            .with_cache(self.cache.value);
        match &self.username {
            Some(username) => connection.with_auth(
                username.value.clone(),
                self.password.clone().unwrap_or_default(),
            ),
            None => connection,
        }
    }

    /// Default config directory (platform-specific):
    /// - Linux: ~/.config/sofa/
    /// - macOS: ~/Library/Application Support/sofa/
    /// - Windows: %APPDATA%/sofa/
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("sofa")
    }

    /// Default config file path (platform-specific config dir + config.yaml)
    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join("config.yaml")
    }
}

#[derive(Debug)]
pub enum ConfigError {
    ReadError(PathBuf, std::io::Error),
    ParseError(PathBuf, serde_yaml::Error),
    InvalidValue(String, String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::ReadError(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::InvalidValue(name, value) => {
                write!(f, "Invalid value '{}' for {}", value, name)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

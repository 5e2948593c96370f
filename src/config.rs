use std::borrow::Cow;
use std::fs;
use std::path::Path;

use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::MapMarkError;

/// Environment variable prefix for overrides, e.g. `MAPMARK_SERVER__PORT`.
const ENV_PREFIX: &str = "MAPMARK_";

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub upload_dir: String,
    pub static_dir: String,
    pub max_file_size: u64,
    pub read_timeout: u64,
    pub write_timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "0.0.0.0".to_owned(),
            port: 0,
            upload_dir: String::new(),
            static_dir: "./static".to_owned(),
            max_file_size: 5 << 20,
            read_timeout: 30,
            write_timeout: 30,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MapConfig {
    pub api_key: String,
    pub static_map_url: String,
}

impl Default for MapConfig {
    fn default() -> Self {
        MapConfig {
            api_key: String::new(),
            static_map_url: "https://restapi.amap.com/v3/staticmap".to_owned(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DatabaseConfig {
    pub path: String,
    pub max_open_conns: u32,
    pub max_idle_conns: u32,
    pub conn_max_lifetime: u64,
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            path: String::new(),
            max_open_conns: 10,
            max_idle_conns: 5,
            conn_max_lifetime: 3600,
            busy_timeout_ms: 5000,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

impl LoggingConfig {
    const LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];
    const DEFAULT_LEVEL: &str = "info";

    /// Log file path, treating an empty string the same as no file.
    pub fn file(&self) -> Option<&str> {
        self.file.as_deref().filter(|f| !f.trim().is_empty())
    }

    fn ensure_valid(&mut self) {
        // An unknown level is not fatal: warn on stderr (the logger isn't
        // running yet) and fall back to the default
        let str_original = self.level.clone();
        self.level = self.level.trim().to_ascii_lowercase();
        if !Self::LOG_LEVELS.contains(&self.level.as_str()) {
            eprintln!(
                "Config error: log level of '{}' is invalid - using default of '{}'",
                str_original,
                Self::DEFAULT_LEVEL
            );
            self.level = Self::DEFAULT_LEVEL.to_owned();
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: Self::DEFAULT_LEVEL.to_owned(),
            file: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Config {
    pub server: ServerConfig,
    pub map: MapConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Loads the configuration from a YAML file.
    ///
    /// `${VAR}` references in the file are expanded from the environment
    /// before parsing, the result is layered over the defaults, and
    /// `MAPMARK_`-prefixed environment variables override both. A missing
    /// file or a missing required key is an error.
    pub fn load(config_path: &Path) -> Result<Self, MapMarkError> {
        let raw = fs::read_to_string(config_path).map_err(|e| {
            MapMarkError::ConfigError(format!(
                "Could not read config file {}: {}",
                config_path.display(),
                e
            ))
        })?;

        let expanded = expand_env_vars(&raw);

        let figment = Figment::from(Serialized::defaults(Config::default()))
            .merge(Yaml::string(&expanded))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        let mut config: Config = figment.extract().map_err(|e| {
            MapMarkError::ConfigError(format!(
                "Could not parse config file {}: {}",
                config_path.display(),
                e
            ))
        })?;

        config.ensure_valid();
        config.validate()?;

        Ok(config)
    }

    fn ensure_valid(&mut self) {
        self.logging.ensure_valid();
    }

    fn validate(&self) -> Result<(), MapMarkError> {
        if self.server.port == 0 {
            return Err(MapMarkError::ConfigError(
                "server.port is required and must be between 1 and 65535".into(),
            ));
        }
        if self.server.upload_dir.trim().is_empty() {
            return Err(MapMarkError::ConfigError(
                "server.upload_dir must not be empty".into(),
            ));
        }
        if self.map.api_key.trim().is_empty() {
            return Err(MapMarkError::ConfigError(
                "map.api_key must not be empty".into(),
            ));
        }
        if self.database.path.trim().is_empty() {
            return Err(MapMarkError::ConfigError(
                "database.path must not be empty".into(),
            ));
        }
        if self.database.max_open_conns == 0 {
            return Err(MapMarkError::ConfigError(
                "database.max_open_conns must be at least 1".into(),
            ));
        }
        if self.database.max_idle_conns > self.database.max_open_conns {
            return Err(MapMarkError::ConfigError(format!(
                "database.max_idle_conns ({}) exceeds database.max_open_conns ({})",
                self.database.max_idle_conns, self.database.max_open_conns
            )));
        }
        if self.server.read_timeout == 0 || self.server.write_timeout == 0 {
            return Err(MapMarkError::ConfigError(
                "server.read_timeout and server.write_timeout must be at least 1 second".into(),
            ));
        }
        if self.server.max_file_size == 0 {
            return Err(MapMarkError::ConfigError(
                "server.max_file_size must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Expands `$VAR` and `${VAR}` from the process environment. Unset variables
/// expand to the empty string.
fn expand_env_vars(content: &str) -> Cow<'_, str> {
    shellexpand::env_with_context_no_errors(content, |var: &str| {
        Some(std::env::var(var).unwrap_or_default())
    })
}

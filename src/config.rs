use std::fs;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use crate::comparator::{SyncPolicy, DEFAULT_SUPPRESSED_KINDS};
use crate::database::{DatabaseOptions, DB_FILENAME};
use crate::outcomes::DEFAULT_FAILURE_REASON_MAX_LEN;

pub static CONFIG: OnceCell<Config> = OnceCell::new();

pub const CONFIG_FILENAME: &str = "config.toml";
pub const ENV_PREFIX: &str = "COURSEPULSE_";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub coursepulse: String,
    pub log_to_stderr: bool,
}

impl LoggingConfig {
    const LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];
    const COURSEPULSE_LEVEL: &str = "info";

    fn default() -> Self {
        LoggingConfig {
            coursepulse: Self::COURSEPULSE_LEVEL.to_string(),
            log_to_stderr: false,
        }
    }

    fn ensure_valid(&mut self) {
        // Trim and lowercase; an unknown level falls back to the default with a message
        let str_original = self.coursepulse.clone();
        self.coursepulse = self.coursepulse.trim().to_ascii_lowercase();
        if !Self::LOG_LEVELS.contains(&self.coursepulse.as_str()) {
            eprintln!(
                "Config error: coursepulse log level of '{}' is invalid - using default of '{}'",
                str_original,
                Self::COURSEPULSE_LEVEL
            );
            self.coursepulse = Self::COURSEPULSE_LEVEL.to_owned();
        }
    }

    /// flexi_logger level string, e.g. `coursepulse=info`.
    pub fn log_spec(&self) -> String {
        format!("coursepulse={}", self.coursepulse)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    /// Overrides `<data dir>/moodle_state.db`.
    pub path: Option<PathBuf>,
    pub busy_timeout_ms: u64,
    pub pool_size: u32,
}

impl DatabaseConfig {
    fn default() -> Self {
        let options = DatabaseOptions::default();
        DatabaseConfig {
            path: None,
            busy_timeout_ms: options.busy_timeout_ms,
            pool_size: options.pool_size,
        }
    }

    fn ensure_valid(&mut self) {
        if self.pool_size == 0 {
            eprintln!("Config error: database pool_size must be at least 1 - using 1");
            self.pool_size = 1;
        }
    }

    pub fn options(&self) -> DatabaseOptions {
        DatabaseOptions {
            busy_timeout_ms: self.busy_timeout_ms,
            pool_size: self.pool_size,
        }
    }

    pub fn resolve_path(&self, data_dir: &Path) -> PathBuf {
        match &self.path {
            Some(path) => path.clone(),
            None => data_dir.join(DB_FILENAME),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    pub suppressed_kinds: Vec<String>,
    pub failure_reason_max_len: usize,
}

impl SyncConfig {
    fn default() -> Self {
        SyncConfig {
            suppressed_kinds: DEFAULT_SUPPRESSED_KINDS
                .iter()
                .map(|k| k.to_string())
                .collect(),
            failure_reason_max_len: DEFAULT_FAILURE_REASON_MAX_LEN,
        }
    }

    fn ensure_valid(&mut self) {
        self.suppressed_kinds = self
            .suppressed_kinds
            .iter()
            .map(|k| k.trim().to_owned())
            .filter(|k| !k.is_empty())
            .collect();
    }

    pub fn policy(&self) -> SyncPolicy {
        SyncPolicy {
            suppressed_kinds: self.suppressed_kinds.clone(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    pub min_consecutive_failures: i64,
    /// External download command, e.g. `curl -sfL -o {saved_to} {url}`.
    pub command: Option<String>,
}

impl RetryConfig {
    fn default() -> Self {
        RetryConfig {
            min_consecutive_failures: 1,
            command: None,
        }
    }

    fn ensure_valid(&mut self) {
        if self.min_consecutive_failures < 1 {
            eprintln!(
                "Config error: min_consecutive_failures of {} is invalid - using 1",
                self.min_consecutive_failures
            );
            self.min_consecutive_failures = 1;
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub logging: LoggingConfig,
    pub database: DatabaseConfig,
    pub sync: SyncConfig,
    pub retry: RetryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            logging: LoggingConfig::default(),
            database: DatabaseConfig::default(),
            sync: SyncConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl Config {
    /// Loads the configuration from `config.toml` in the app's data directory, then applies
    /// `COURSEPULSE_` environment overrides (`COURSEPULSE_DATABASE__POOL_SIZE=2`).
    /// If the file is missing or fails to parse, defaults are used.
    /// Additionally, writes the default config to disk if no file exists.
    pub fn load_config(project_dirs: &ProjectDirs) -> Self {
        Self::load_from_dir(project_dirs.data_local_dir())
    }

    pub fn load_from_dir(data_dir: &Path) -> Self {
        let config_path = data_dir.join(CONFIG_FILENAME);
        let default_config = Config::default();

        // If the config file doesn't exist, write the default configuration to disk.
        if !config_path.exists() {
            if let Err(e) = fs::create_dir_all(data_dir) {
                eprintln!(
                    "Failed to create configuration directory {}: {}",
                    data_dir.display(),
                    e
                );
            }
            match toml::to_string_pretty(&default_config) {
                Ok(toml_string) => {
                    if let Err(e) = fs::write(&config_path, toml_string) {
                        eprintln!(
                            "Failed to write default config to {}: {}",
                            config_path.display(),
                            e
                        );
                    }
                }
                Err(e) => eprintln!("Failed to serialize default config: {}", e),
            }
        }

        let figment = Figment::from(Serialized::defaults(default_config.clone()))
            .merge(Toml::file(&config_path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        // On error, report and fall back to defaults.
        let mut config: Config = figment.extract().unwrap_or_else(|err| {
            eprintln!(
                "Could not load config file {}: {}. Using default configuration.",
                config_path.display(),
                err
            );
            default_config
        });

        config.ensure_valid();

        config
    }

    fn ensure_valid(&mut self) {
        self.logging.ensure_valid();
        self.database.ensure_valid();
        self.sync.ensure_valid();
        self.retry.ensure_valid();
    }
}

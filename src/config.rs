//! Runtime configuration.
//!
//! Resolution order: built-in defaults, then `<home>/config.toml` when it
//! exists, then environment overrides (`STRATA_HOME`, `STRATA_DB`,
//! `STRATA_CACHE`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use strata_core::{ContextResult, Database, DatabaseOptions};

pub const HOME_ENV: &str = "STRATA_HOME";
pub const DB_ENV: &str = "STRATA_DB";
pub const CACHE_ENV: &str = "STRATA_CACHE";

const CONFIG_FILE: &str = "config.toml";
const SESSION_FILE: &str = "current_session.json";
const MAPPING_FILE: &str = "project_mappings.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding the advisory session and mapping files.
    pub home: PathBuf,
    /// SQLite file; the platform data directory when unset.
    pub database: Option<PathBuf>,
    pub pool_size: u32,
    pub acquire_timeout_secs: u64,
    pub cache: CacheConfig,
    /// Stream HIGH/MEDIUM/LOW after the critical slice is returned.
    pub background_tiers: bool,
    pub heartbeat_stale_secs: u64,
    /// Bytes of command output captured by `finalize`.
    pub output_read_limit: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl_secs: u64,
    pub max_entries: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: 3600,
            max_entries: 1024,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            home: default_home(),
            database: None,
            pool_size: 8,
            acquire_timeout_secs: 30,
            cache: CacheConfig::default(),
            background_tiers: true,
            heartbeat_stale_secs: 300,
            output_read_limit: 10 * 1024,
        }
    }
}

fn default_home() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".strata"))
        .unwrap_or_else(|| PathBuf::from(".strata"))
}

impl Config {
    /// Load from the process environment.
    pub fn load() -> Self {
        Self::load_with(|key| std::env::var(key).ok())
    }

    /// Load with an injectable environment lookup.
    pub fn load_with<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let env_home = lookup(HOME_ENV)
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);
        let home = env_home.clone().unwrap_or_else(default_home);

        let mut config = Self::from_file(&home.join(CONFIG_FILE)).unwrap_or_default();

        if let Some(home) = env_home {
            if config.database.is_none() {
                config.database = Some(home.join("context.db"));
            }
            config.home = home;
        }
        if let Some(db) = lookup(DB_ENV).filter(|v| !v.trim().is_empty()) {
            config.database = Some(PathBuf::from(db));
        }
        if let Some(flag) = lookup(CACHE_ENV) {
            if matches!(flag.trim(), "0" | "false" | "off" | "no") {
                config.cache.enabled = false;
            }
        }
        config
    }

    /// Parse a TOML config file. Missing files and parse failures yield
    /// `None`; the latter is logged.
    pub fn from_file(path: &Path) -> Option<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "could not read config file");
                return None;
            }
        };
        match toml::from_str::<Config>(&text) {
            Ok(config) => {
                debug!(path = %path.display(), "config file loaded");
                Some(config)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "invalid config file, using defaults");
                None
            }
        }
    }

    pub fn database_path(&self) -> ContextResult<PathBuf> {
        match &self.database {
            Some(path) => Ok(path.clone()),
            None => Database::default_path(),
        }
    }

    pub fn database_options(&self) -> DatabaseOptions {
        DatabaseOptions {
            pool_size: self.pool_size,
            acquire_timeout: Duration::from_secs(self.acquire_timeout_secs),
        }
    }

    /// Open the configured store and apply the schema.
    pub fn open_database(&self) -> ContextResult<Database> {
        let db = Database::open(&self.database_path()?, &self.database_options())?;
        db.migrate()?;
        Ok(db)
    }

    pub fn session_file(&self) -> PathBuf {
        self.home.join(SESSION_FILE)
    }

    pub fn mapping_file(&self) -> PathBuf {
        self.home.join(MAPPING_FILE)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.ttl_secs)
    }

    pub fn heartbeat_stale(&self) -> Duration {
        Duration::from_secs(self.heartbeat_stale_secs)
    }
}

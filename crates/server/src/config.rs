use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const CONFIG_VERSION: u32 = 2;

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_SESSION_TTL_SECS: u64 = 60 * 60 * 24 * 7;
const DEFAULT_TRACK_CACHE_TTL_SECS: u64 = 60 * 60 * 24 * 7;
const DEFAULT_PULL_TIMEOUT_SECS: u64 = 120;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SpotifyConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub api_base: String,
    pub accounts_base: String,
    pub timeout_secs: u64,
}

impl Default for SpotifyConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            redirect_uri: "http://localhost:3000/api/v1/auth/callback".to_string(),
            api_base: "https://api.spotify.com/v1".to_string(),
            accounts_base: "https://accounts.spotify.com".to_string(),
            timeout_secs: 15,
        }
    }
}

impl SpotifyConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub snapshot_interval_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            snapshot_interval_secs: 60 * 60 * 24,
            sweep_interval_secs: 60 * 60,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub version: u32,
    pub port: u16,
    pub data_path: String,
    pub snapshot_root: String,
    pub session_ttl_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_base_url: Option<String>,
    pub spotify: SpotifyConfig,
    pub track_cache_ttl_secs: u64,
    pub pull_timeout_secs: u64,
    pub scheduler: SchedulerConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            port: DEFAULT_PORT,
            data_path: "trackkeeper.redb".to_string(),
            snapshot_root: "snapshots".to_string(),
            session_ttl_secs: DEFAULT_SESSION_TTL_SECS,
            public_base_url: None,
            spotify: SpotifyConfig::default(),
            track_cache_ttl_secs: DEFAULT_TRACK_CACHE_TTL_SECS,
            pull_timeout_secs: DEFAULT_PULL_TIMEOUT_SECS,
            scheduler: SchedulerConfig::default(),
            job_token: None,
        }
    }
}

impl ServerConfig {
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn track_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.track_cache_ttl_secs)
    }

    pub fn pull_timeout(&self) -> Duration {
        Duration::from_secs(self.pull_timeout_secs)
    }

    /// Fills zero or blank values with defaults and applies environment overrides.
    fn normalize(&mut self) {
        let defaults = ServerConfig::default();
        if self.version < CONFIG_VERSION {
            self.version = CONFIG_VERSION;
        }
        if self.port == 0 {
            self.port = defaults.port;
        }
        if self.data_path.trim().is_empty() {
            self.data_path = defaults.data_path;
        }
        if self.snapshot_root.trim().is_empty() {
            self.snapshot_root = defaults.snapshot_root;
        }
        if self.session_ttl_secs == 0 {
            self.session_ttl_secs = defaults.session_ttl_secs;
        }
        if self.track_cache_ttl_secs == 0 {
            self.track_cache_ttl_secs = defaults.track_cache_ttl_secs;
        }
        if self.pull_timeout_secs == 0 {
            self.pull_timeout_secs = defaults.pull_timeout_secs;
        }
        if self.scheduler.snapshot_interval_secs == 0 {
            self.scheduler.snapshot_interval_secs = defaults.scheduler.snapshot_interval_secs;
        }
        if self.scheduler.sweep_interval_secs == 0 {
            self.scheduler.sweep_interval_secs = defaults.scheduler.sweep_interval_secs;
        }
        if self.spotify.api_base.trim().is_empty() {
            self.spotify.api_base = defaults.spotify.api_base;
        }
        if self.spotify.accounts_base.trim().is_empty() {
            self.spotify.accounts_base = defaults.spotify.accounts_base;
        }
        if self.spotify.redirect_uri.trim().is_empty() {
            if let Some(base) = self.public_base_url.as_deref() {
                self.spotify.redirect_uri =
                    format!("{}/api/v1/auth/callback", base.trim_end_matches('/'));
            }
        }
        if let Some(secret) = env_override("TRACKKEEPER_SPOTIFY_CLIENT_SECRET") {
            self.spotify.client_secret = secret;
        }
        if let Some(token) = env_override("TRACKKEEPER_JOB_TOKEN") {
            self.job_token = Some(token);
        }
        if self
            .job_token
            .as_deref()
            .is_some_and(|token| token.trim().is_empty())
        {
            self.job_token = None;
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Yaml(serde_yaml::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(err) => write!(f, "io error: {}", err),
            ConfigError::Yaml(err) => write!(f, "yaml error: {}", err),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::Io(err)
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        ConfigError::Yaml(err)
    }
}

pub fn config_path_from_env() -> PathBuf {
    match env::var("TRACKKEEPER_CONFIG") {
        Ok(value) if !value.trim().is_empty() => PathBuf::from(value),
        _ => default_config_path(),
    }
}

fn default_config_path() -> PathBuf {
    match env::current_exe() {
        Ok(exe) => exe
            .parent()
            .map(|dir| dir.join("config.yaml"))
            .unwrap_or_else(|| PathBuf::from("config.yaml")),
        Err(_) => PathBuf::from("config.yaml"),
    }
}

fn env_override(name: &str) -> Option<String> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => Some(value.trim().to_string()),
        _ => None,
    }
}

pub fn load_or_create_config(path: &Path) -> Result<(ServerConfig, bool), ConfigError> {
    if path.exists() {
        let contents = fs::read_to_string(path)?;
        let mut config: ServerConfig = serde_yaml::from_str(&contents)?;
        config.normalize();
        return Ok((config, false));
    }

    let config = ServerConfig::default();
    save_config(path, &config)?;
    let mut config = config;
    config.normalize();
    Ok((config, true))
}

pub fn save_config(path: &Path, config: &ServerConfig) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let contents = serde_yaml::to_string(config)?;
    fs::write(path, contents)?;
    Ok(())
}

pub fn resolve_path(config_path: &Path, value: &str) -> PathBuf {
    let raw = PathBuf::from(value);
    if raw.is_absolute() {
        return raw;
    }
    let base = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    base.join(raw)
}

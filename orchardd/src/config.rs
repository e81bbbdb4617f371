use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::sync::conflict::ConflictPolicy;

const DEFAULT_SMALL_FILE_THRESHOLD: u64 = 32 * 1024 * 1024;
const DEFAULT_CHUNK_SIZE: u64 = 8 * 1024 * 1024;
const DEFAULT_CACHE_MAX_BYTES: u64 = 10 * 1024 * 1024 * 1024;
const DEFAULT_WORKER_COUNT_IO: usize = 4;
const DEFAULT_WORKER_COUNT_META: usize = 1;
const DEFAULT_RETRY_BASE_MS: u64 = 500;
const DEFAULT_RETRY_MAX_MS: u64 = 60_000;
const DEFAULT_MAX_RETRIES: i64 = 5;
const DEFAULT_CHUNK_READ_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;
const DEFAULT_CONTROL_PORT: u16 = 7337;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("chunk_size_bytes must be a power of two, got {0}")]
    ChunkSizeNotPowerOfTwo(u64),
    #[error("invalid conflict_policy: {0}")]
    InvalidConflictPolicy(String),
    #[error("home directory is unavailable")]
    MissingHomeDir,
    #[error("access token is not configured (set ORCHARD_TOKEN or access_token)")]
    MissingToken,
}

/// On-disk shape of `~/.config/orchard/config.json`. Everything is optional;
/// absent keys take the documented defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    mount_point: Option<PathBuf>,
    cache_root: Option<PathBuf>,
    db_path: Option<PathBuf>,
    small_file_threshold_bytes: Option<u64>,
    chunk_size_bytes: Option<u64>,
    cache_max_bytes: Option<u64>,
    worker_count_io: Option<usize>,
    worker_count_meta: Option<usize>,
    thumbnailer_denylist: Option<Vec<String>>,
    retry_base_ms: Option<u64>,
    retry_max_ms: Option<u64>,
    max_retries: Option<i64>,
    chunk_read_timeout_ms: Option<u64>,
    conflict_policy: Option<String>,
    api_base_url: Option<String>,
    access_token: Option<String>,
    poll_interval_secs: Option<u64>,
    control_port: Option<u16>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub mount_point: PathBuf,
    pub cache_root: PathBuf,
    pub db_path: PathBuf,
    pub small_file_threshold_bytes: u64,
    pub chunk_size_bytes: u64,
    pub cache_max_bytes: u64,
    pub worker_count_io: usize,
    pub worker_count_meta: usize,
    pub thumbnailer_denylist: Vec<String>,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    pub max_retries: i64,
    pub chunk_read_timeout_ms: u64,
    pub conflict_policy: ConflictPolicy,
    pub api_base_url: Option<String>,
    pub access_token: Option<String>,
    pub poll_interval_secs: u64,
    pub control_port: u16,
}

impl Config {
    /// Loads from `path` if given, else `$ORCHARD_CONFIG`, else the default
    /// location. A missing file yields pure defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(path) => Some(path.to_path_buf()),
            None => match std::env::var("ORCHARD_CONFIG") {
                Ok(value) => Some(PathBuf::from(value)),
                Err(_) => default_config_path(),
            },
        };
        let file = match path {
            Some(path) if path.exists() => {
                let raw = std::fs::read_to_string(&path)?;
                serde_json::from_str::<ConfigFile>(&raw)?
            }
            _ => ConfigFile::default(),
        };
        Self::from_file(file)
    }

    fn from_file(file: ConfigFile) -> Result<Self, ConfigError> {
        let home = dirs::home_dir().ok_or(ConfigError::MissingHomeDir)?;
        let chunk_size_bytes = file.chunk_size_bytes.unwrap_or(DEFAULT_CHUNK_SIZE);
        if !chunk_size_bytes.is_power_of_two() {
            return Err(ConfigError::ChunkSizeNotPowerOfTwo(chunk_size_bytes));
        }
        let conflict_policy = match file.conflict_policy {
            Some(raw) => ConflictPolicy::parse(&raw)
                .ok_or(ConfigError::InvalidConflictPolicy(raw))?,
            None => ConflictPolicy::default(),
        };
        let access_token = std::env::var("ORCHARD_TOKEN").ok().or(file.access_token);

        Ok(Self {
            mount_point: file.mount_point.unwrap_or_else(|| home.join("iCloud")),
            cache_root: file.cache_root.unwrap_or_else(default_cache_root),
            db_path: file.db_path.unwrap_or_else(default_db_path),
            small_file_threshold_bytes: file
                .small_file_threshold_bytes
                .unwrap_or(DEFAULT_SMALL_FILE_THRESHOLD),
            chunk_size_bytes,
            cache_max_bytes: file.cache_max_bytes.unwrap_or(DEFAULT_CACHE_MAX_BYTES),
            worker_count_io: file.worker_count_io.unwrap_or(DEFAULT_WORKER_COUNT_IO).max(1),
            worker_count_meta: file
                .worker_count_meta
                .unwrap_or(DEFAULT_WORKER_COUNT_META)
                .max(1),
            thumbnailer_denylist: file.thumbnailer_denylist.unwrap_or_else(|| {
                vec![
                    "ffmpegthumbnailer".to_string(),
                    "evince-thumbnailer".to_string(),
                    "gdk-pixbuf-thumbnailer".to_string(),
                    "tumbler".to_string(),
                    "tracker-extract".to_string(),
                ]
            }),
            retry_base_ms: file.retry_base_ms.unwrap_or(DEFAULT_RETRY_BASE_MS),
            retry_max_ms: file.retry_max_ms.unwrap_or(DEFAULT_RETRY_MAX_MS),
            max_retries: file.max_retries.unwrap_or(DEFAULT_MAX_RETRIES).max(1),
            chunk_read_timeout_ms: file
                .chunk_read_timeout_ms
                .unwrap_or(DEFAULT_CHUNK_READ_TIMEOUT_MS),
            conflict_policy,
            api_base_url: file.api_base_url,
            access_token,
            poll_interval_secs: file.poll_interval_secs.unwrap_or(DEFAULT_POLL_INTERVAL_SECS),
            control_port: file.control_port.unwrap_or(DEFAULT_CONTROL_PORT),
        })
    }

    pub fn require_token(&self) -> Result<&str, ConfigError> {
        self.access_token.as_deref().ok_or(ConfigError::MissingToken)
    }
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("orchard").join("config.json"))
}

fn default_cache_root() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("orchard")
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("orchard")
        .join("db.sqlite")
}

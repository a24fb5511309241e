use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub const CONFIG_VERSION: u32 = 1;

pub const DEFAULT_PORT: u16 = 3002;
pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 50 * 1024 * 1024;
pub const DEFAULT_WAVEFORM_SAMPLES: usize = 1000;
pub const DEFAULT_MAX_CONCURRENT_JOBS: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreKind {
    Redb,
    Memory,
}

impl StoreKind {
    pub fn parse(value: &str) -> Option<StoreKind> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "redb" => Some(StoreKind::Redb),
            "memory" | "mem" => Some(StoreKind::Memory),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub version: u32,
    pub port: u16,
    pub data_dir: String,
    pub index_path: String,
    pub store: String,
    pub max_upload_bytes: u64,
    pub waveform_samples: usize,
    pub public_base_url: String,
    pub max_concurrent_jobs: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis_seed: Option<u64>,
    pub storage_enabled: bool,
    pub storage_endpoint: String,
    pub storage_api_key: String,
    pub storage_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            port: DEFAULT_PORT,
            data_dir: "uploads".to_string(),
            index_path: "catalog.redb".to_string(),
            store: "redb".to_string(),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            waveform_samples: DEFAULT_WAVEFORM_SAMPLES,
            public_base_url: format!("http://localhost:{}", DEFAULT_PORT),
            max_concurrent_jobs: DEFAULT_MAX_CONCURRENT_JOBS,
            analysis_seed: None,
            storage_enabled: false,
            storage_endpoint: String::new(),
            storage_api_key: String::new(),
            storage_timeout_secs: 30,
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
    match env::var("TONEFALL_CONFIG") {
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

pub fn load_or_create_config(path: &Path) -> Result<(ServerConfig, bool), ConfigError> {
    if path.exists() {
        let contents = fs::read_to_string(path)?;
        let mut config: ServerConfig = serde_yaml::from_str(&contents)?;
        if config.version < CONFIG_VERSION {
            config.version = CONFIG_VERSION;
        }
        sanitize(&mut config);
        return Ok((config, false));
    }

    let config = ServerConfig::default();
    save_config(path, &config)?;
    Ok((config, true))
}

fn sanitize(config: &mut ServerConfig) {
    if config.port == 0 {
        config.port = DEFAULT_PORT;
    }
    if config.data_dir.trim().is_empty() {
        config.data_dir = "uploads".to_string();
    }
    if config.index_path.trim().is_empty() {
        config.index_path = "catalog.redb".to_string();
    }
    if config.max_upload_bytes == 0 {
        config.max_upload_bytes = DEFAULT_MAX_UPLOAD_BYTES;
    }
    if config.waveform_samples == 0 {
        config.waveform_samples = DEFAULT_WAVEFORM_SAMPLES;
    }
    if config.max_concurrent_jobs == 0 {
        config.max_concurrent_jobs = DEFAULT_MAX_CONCURRENT_JOBS;
    }
    if config.public_base_url.trim().is_empty() {
        config.public_base_url = format!("http://localhost:{}", config.port);
    } else {
        while config.public_base_url.ends_with('/') {
            config.public_base_url.pop();
        }
    }
    if config.storage_timeout_secs == 0 {
        config.storage_timeout_secs = 30;
    }
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

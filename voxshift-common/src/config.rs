//! Configuration loading
//!
//! Config file resolution priority:
//! 1. Command-line argument (highest priority)
//! 2. `VOXSHIFT_CONFIG` environment variable
//! 3. `<config_dir>/voxshift/config.toml`
//! 4. Compiled defaults (fallback)
//!
//! After the file is read, `VOXSHIFT_MODEL` and `VOXSHIFT_QUEUE` override the
//! model key and queue backend.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const CONFIG_ENV: &str = "VOXSHIFT_CONFIG";
pub const MODEL_ENV: &str = "VOXSHIFT_MODEL";
pub const QUEUE_ENV: &str = "VOXSHIFT_QUEUE";

/// Top-level settings shared by every voxshift process
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub database: DatabaseSettings,
    pub files: FileSettings,
    pub worker: WorkerSettings,
    pub server: ServerSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub path: PathBuf,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            path: default_data_dir().join("voxshift.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileSettings {
    /// Root of the filesystem blob store
    pub root_dir: PathBuf,
    pub audio: AudioSettings,
}

impl Default for FileSettings {
    fn default() -> Self {
        Self {
            root_dir: default_data_dir().join("blobs"),
            audio: AudioSettings::default(),
        }
    }
}

/// Audio format the model consumes and produces
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioSettings {
    pub sample_rate: u32,
    pub min_sample_rate: u32,
    /// Bytes per sample
    pub sample_width: u16,
    pub num_channels: u16,
    /// Seconds
    pub max_duration: f64,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            min_sample_rate: 8_000,
            sample_width: 2,
            num_channels: 1,
            max_duration: 10.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    pub model_key: String,
    pub model_dir: PathBuf,
    pub model_base_url: String,
    /// Name of the model loader (`passthrough` ships with the binary)
    pub backend: String,
    pub device: Device,
    pub queue_type: QueueKind,
    pub sampling_timesteps: Option<u32>,
    /// Seconds. Carried for the process supervisor, not enforced here.
    pub soft_time_limit: u64,
    /// Carried for the process supervisor, not enforced here.
    pub max_retries: u32,
    pub health_port: Option<u16>,
    pub rabbit: RabbitSettings,
    pub sqs: SqsSettings,
    pub memory: MemoryQueueSettings,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            model_key: "hubert-quantized-20231015".to_string(),
            model_dir: default_data_dir().join("models"),
            model_base_url: "http://localhost:8000/models".to_string(),
            backend: "passthrough".to_string(),
            device: Device::Auto,
            queue_type: QueueKind::Rabbit,
            sampling_timesteps: None,
            soft_time_limit: 30,
            max_retries: 3,
            health_port: None,
            rabbit: RabbitSettings::default(),
            sqs: SqsSettings::default(),
            memory: MemoryQueueSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RabbitSettings {
    pub host: String,
    pub port: u16,
    pub virtual_host: String,
    pub username: String,
    pub password: String,
    pub queue_name: String,
}

impl Default for RabbitSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5672,
            virtual_host: "/".to_string(),
            username: "guest".to_string(),
            password: "guest".to_string(),
            queue_name: "voxshift".to_string(),
        }
    }
}

impl RabbitSettings {
    /// AMQP URI for this broker. The default vhost `/` must be percent-encoded.
    pub fn uri(&self) -> String {
        let vhost = if self.virtual_host == "/" {
            "%2f".to_string()
        } else {
            self.virtual_host.trim_start_matches('/').to_string()
        };
        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.username, self.password, self.host, self.port, vhost
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SqsSettings {
    pub queue_name: String,
    pub region: Option<String>,
    /// Custom endpoint, e.g. a local emulator
    pub endpoint_url: Option<String>,
    pub wait_time_seconds: i32,
}

impl Default for SqsSettings {
    fn default() -> Self {
        Self {
            queue_name: "voxshift".to_string(),
            region: None,
            endpoint_url: None,
            wait_time_seconds: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryQueueSettings {
    pub visibility_timeout_ms: u64,
}

impl Default for MemoryQueueSettings {
    fn default() -> Self {
        Self {
            visibility_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Decoded requests allowed to wait for inference at once
    pub max_loaded_requests: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            max_loaded_requests: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Message broker backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueKind {
    Rabbit,
    Sqs,
    Memory,
    #[serde(alias = "null")]
    Dummy,
}

impl FromStr for QueueKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rabbit" | "rabbitmq" => Ok(Self::Rabbit),
            "sqs" => Ok(Self::Sqs),
            "memory" => Ok(Self::Memory),
            "dummy" | "null" => Ok(Self::Dummy),
            other => Err(Error::Config(format!("Unknown queue type: {}", other))),
        }
    }
}

impl std::fmt::Display for QueueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Rabbit => "rabbit",
            Self::Sqs => "sqs",
            Self::Memory => "memory",
            Self::Dummy => "dummy",
        };
        f.write_str(name)
    }
}

/// Inference device selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    #[default]
    Auto,
    Cpu,
    Cuda,
    Metal,
}

impl Device {
    /// Resolve `Auto` to a concrete device for this host
    pub fn resolve(self) -> Device {
        match self {
            Device::Auto => {
                if cfg!(all(target_os = "macos", target_arch = "aarch64")) {
                    Device::Metal
                } else if cuda_available() {
                    Device::Cuda
                } else {
                    Device::Cpu
                }
            }
            other => other,
        }
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Device::Auto => "auto",
            Device::Cpu => "cpu",
            Device::Cuda => "cuda",
            Device::Metal => "metal",
        };
        f.write_str(name)
    }
}

fn cuda_available() -> bool {
    if let Ok(visible) = std::env::var("CUDA_VISIBLE_DEVICES") {
        let visible = visible.trim();
        if !visible.is_empty() && visible != "-1" {
            return true;
        }
    }
    Path::new("/dev/nvidia0").exists()
}

impl Settings {
    /// Load settings following the resolution order above, then apply env
    /// overrides and validate.
    pub fn load(cli_path: Option<&Path>) -> Result<Self> {
        let mut settings = match resolve_config_file(cli_path)? {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        settings.apply_env_overrides()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("Invalid config: {}", e)))
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(model) = std::env::var(MODEL_ENV) {
            if !model.trim().is_empty() {
                self.worker.model_key = model.trim().to_string();
            }
        }
        if let Ok(queue) = std::env::var(QUEUE_ENV) {
            if !queue.trim().is_empty() {
                self.worker.queue_type = queue.parse()?;
            }
        }
        Ok(())
    }

    /// Reject settings no process can run with
    pub fn validate(&self) -> Result<()> {
        let audio = &self.files.audio;
        if audio.sample_rate == 0 || audio.min_sample_rate == 0 {
            return Err(Error::Config("Sample rates must be non-zero".to_string()));
        }
        if audio.num_channels == 0 {
            return Err(Error::Config("num_channels must be non-zero".to_string()));
        }
        if audio.sample_width != 2 {
            return Err(Error::Config(format!(
                "Unsupported sample_width {} (only 16-bit PCM)",
                audio.sample_width
            )));
        }
        if self.server.max_loaded_requests == 0 {
            return Err(Error::Config(
                "max_loaded_requests must be at least 1".to_string(),
            ));
        }
        if self.worker.model_key.trim().is_empty() {
            return Err(Error::Config("model_key must not be empty".to_string()));
        }

        let queue_name = match self.worker.queue_type {
            QueueKind::Rabbit => Some(&self.worker.rabbit.queue_name),
            QueueKind::Sqs => Some(&self.worker.sqs.queue_name),
            QueueKind::Memory | QueueKind::Dummy => None,
        };
        if let Some(name) = queue_name {
            if name.trim().is_empty() {
                return Err(Error::Config(format!(
                    "Queue name for {} backend must not be empty",
                    self.worker.queue_type
                )));
            }
        }
        Ok(())
    }
}

fn resolve_config_file(cli_path: Option<&Path>) -> Result<Option<PathBuf>> {
    // Explicit paths must exist
    if let Some(path) = cli_path {
        return Ok(Some(path.to_path_buf()));
    }
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        if !path.trim().is_empty() {
            return Ok(Some(PathBuf::from(path)));
        }
    }

    let user_config = dirs::config_dir().map(|d| d.join("voxshift").join("config.toml"));
    Ok(user_config.filter(|p| p.exists()))
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("voxshift"))
        .unwrap_or_else(|| PathBuf::from("./voxshift_data"))
}

//! Configuration module
//!
//! Handles loading and saving test bench configuration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::protocol::DEFAULT_MAX_FRAME_LEN;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Every bounded wait, in milliseconds
    #[serde(default)]
    pub timeouts: TimeoutConfig,

    /// How the peer under test is launched
    #[serde(default)]
    pub process: ProcessConfig,

    #[serde(default)]
    pub limits: LimitsConfig,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Enable verbose logging
    #[serde(default)]
    pub verbose: bool,
    /// Directory holding the executables under test
    #[serde(default = "default_build_dir")]
    pub build_dir: PathBuf,
    /// File name of the peer executable inside `build_dir`
    #[serde(default = "default_peer_executable")]
    pub peer_executable: String,
}

fn default_build_dir() -> PathBuf {
    PathBuf::from("build")
}

fn default_peer_executable() -> String {
    "peer".to_string()
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            verbose: false,
            build_dir: default_build_dir(),
            peer_executable: default_peer_executable(),
        }
    }
}

/// Timeout configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Bound on each wait for bytes while framing a packet
    #[serde(default = "default_frame_wait")]
    pub frame_wait_ms: u64,
    /// Bound on popping a scripted response
    #[serde(default = "default_response_wait")]
    pub response_wait_ms: u64,
    #[serde(default = "default_connect")]
    pub connect_ms: u64,
    /// Mock client stops reading after this much silence
    #[serde(default = "default_client_idle")]
    pub client_idle_ms: u64,
    /// Wall-clock limit for a launched peer
    #[serde(default = "default_process")]
    pub process_ms: u64,
    /// Grace period for a killed peer to exit and flush its output
    #[serde(default = "default_teardown")]
    pub teardown_ms: u64,
    #[serde(default = "default_response_delay")]
    pub response_delay_ms: u64,
    /// How long a freshly launched peer gets to start listening
    #[serde(default = "default_server_ready")]
    pub server_ready_ms: u64,
}

fn default_frame_wait() -> u64 {
    3000
}

fn default_response_wait() -> u64 {
    2000
}

fn default_connect() -> u64 {
    3000
}

fn default_client_idle() -> u64 {
    1000
}

fn default_process() -> u64 {
    5000
}

fn default_teardown() -> u64 {
    1000
}

fn default_response_delay() -> u64 {
    100
}

fn default_server_ready() -> u64 {
    5000
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            frame_wait_ms: default_frame_wait(),
            response_wait_ms: default_response_wait(),
            connect_ms: default_connect(),
            client_idle_ms: default_client_idle(),
            process_ms: default_process(),
            teardown_ms: default_teardown(),
            response_delay_ms: default_response_delay(),
            server_ready_ms: default_server_ready(),
        }
    }
}

impl TimeoutConfig {
    pub fn process(&self) -> Duration {
        Duration::from_millis(self.process_ms)
    }

    pub fn teardown(&self) -> Duration {
        Duration::from_millis(self.teardown_ms)
    }

    pub fn server_ready(&self) -> Duration {
        Duration::from_millis(self.server_ready_ms)
    }
}

/// Process configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessConfig {
    /// Append `--verbose` to the peer's arguments
    #[serde(default = "default_true")]
    pub verbose_flag: bool,
    /// Environment overrides applied on top of the inherited environment
    #[serde(default = "default_env")]
    pub env: BTreeMap<String, String>,
}

fn default_true() -> bool {
    true
}

fn default_env() -> BTreeMap<String, String> {
    let sanitizer = "color=always:print_stacktrace=1".to_string();
    let mut env = BTreeMap::new();
    env.insert("UBSAN_OPTIONS".to_string(), sanitizer.clone());
    env.insert("ASAN_OPTIONS".to_string(), sanitizer);
    env
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            verbose_flag: default_true(),
            env: default_env(),
        }
    }
}

/// Limits configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Largest data frame accepted from the peer, in bytes
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,
}

fn default_max_frame_len() -> usize {
    DEFAULT_MAX_FRAME_LEN
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_frame_len: default_max_frame_len(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from the default location
    pub fn load_default() -> ConfigResult<Self> {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("testbench/config.toml")),
            Some(PathBuf::from("./testbench.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                return Self::load(path);
            }
        }

        // Return default config if no file found
        Ok(Self::default())
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        Ok(())
    }
}

/// Generate a sample configuration file
pub fn generate_sample_config() -> ConfigResult<String> {
    let config = Config {
        general: GeneralConfig {
            verbose: true,
            ..Default::default()
        },
        ..Default::default()
    };

    Ok(toml::to_string_pretty(&config)?)
}

//! Configuration file support for MIP CLI tools

use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Sender configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderConfig {
    /// Raw PCM input file (s16le)
    pub input: String,
    /// RTP destinations
    #[serde(default)]
    pub destinations: Vec<SocketAddr>,
    /// Local bind address
    pub bind: Option<SocketAddr>,
    /// Send RTCP to the RTP port instead of the next port up
    #[serde(default = "default_true")]
    pub rtcp_mux: bool,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_channels")]
    pub channels: u16,
    #[serde(default = "default_payload_type")]
    pub payload_type: u8,
    /// Audio per packet in milliseconds
    #[serde(default = "default_block_ms")]
    pub block_ms: u64,
    #[serde(default = "default_max_payload")]
    pub max_payload_size: usize,
    /// RTCP canonical name
    pub cname: Option<String>,
    /// Restart the input at end of file
    #[serde(default)]
    pub looping: bool,
    /// Statistics interval in seconds
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,
}

/// Receiver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiverConfig {
    /// Raw PCM output file (s16le)
    pub output: String,
    /// Listen address for RTP and multiplexed RTCP
    pub listen: SocketAddr,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_channels")]
    pub channels: u16,
    #[serde(default = "default_payload_type")]
    pub payload_type: u8,
    /// Mixer block length in milliseconds
    #[serde(default = "default_block_ms")]
    pub block_ms: u64,
    /// Starting playout offset in milliseconds
    #[serde(default = "default_initial_offset")]
    pub initial_offset_ms: u64,
    /// Playout offset cap in milliseconds
    #[serde(default = "default_max_offset")]
    pub max_offset_ms: u64,
    #[serde(default = "default_reassembly_window")]
    pub reassembly_window: usize,
    /// Statistics interval in seconds
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_sample_rate() -> u32 {
    8000
}

fn default_channels() -> u16 {
    1
}

fn default_payload_type() -> u8 {
    11
}

fn default_block_ms() -> u64 {
    20
}

fn default_max_payload() -> usize {
    1200
}

fn default_initial_offset() -> u64 {
    50
}

fn default_max_offset() -> u64 {
    1000
}

fn default_reassembly_window() -> usize {
    64
}

fn default_stats_interval() -> u64 {
    1
}

impl Default for SenderConfig {
    fn default() -> Self {
        SenderConfig {
            input: String::new(),
            destinations: Vec::new(),
            bind: None,
            rtcp_mux: true,
            sample_rate: default_sample_rate(),
            channels: default_channels(),
            payload_type: default_payload_type(),
            block_ms: default_block_ms(),
            max_payload_size: default_max_payload(),
            cname: None,
            looping: false,
            stats_interval_secs: default_stats_interval(),
        }
    }
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        ReceiverConfig {
            output: String::new(),
            listen: SocketAddr::from(([0, 0, 0, 0], 5004)),
            sample_rate: default_sample_rate(),
            channels: default_channels(),
            payload_type: default_payload_type(),
            block_ms: default_block_ms(),
            initial_offset_ms: default_initial_offset(),
            max_offset_ms: default_max_offset(),
            reassembly_window: default_reassembly_window(),
            stats_interval_secs: default_stats_interval(),
        }
    }
}

/// Combined configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub sender: Option<SenderConfig>,
    pub receiver: Option<ReceiverConfig>,
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        fs::write(path, self.to_toml()?)?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Example sender and receiver talking over loopback
    pub fn example() -> Self {
        Config {
            sender: Some(SenderConfig {
                input: "input.raw".to_string(),
                destinations: vec![SocketAddr::from(([127, 0, 0, 1], 5004))],
                cname: Some("sender@example".to_string()),
                ..Default::default()
            }),
            receiver: Some(ReceiverConfig {
                output: "output.raw".to_string(),
                ..Default::default()
            }),
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

fn check_audio(sample_rate: u32, channels: u16, block_ms: u64) -> Result<(), ConfigError> {
    if sample_rate == 0 || channels == 0 {
        return Err(ConfigError::Invalid(
            "sample rate and channel count must be positive".to_string(),
        ));
    }
    if block_ms == 0 {
        return Err(ConfigError::Invalid("block length must be positive".to_string()));
    }
    Ok(())
}

fn check_payload_type(payload_type: u8) -> Result<(), ConfigError> {
    if payload_type > 127 {
        return Err(ConfigError::Invalid(format!(
            "payload type {} does not fit in 7 bits",
            payload_type
        )));
    }
    Ok(())
}

impl SenderConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.input.is_empty() {
            return Err(ConfigError::Invalid("no input file".to_string()));
        }
        if self.destinations.is_empty() {
            return Err(ConfigError::Invalid("at least one destination is required".to_string()));
        }
        check_audio(self.sample_rate, self.channels, self.block_ms)?;
        check_payload_type(self.payload_type)
    }

    /// Bind address matching the first destination's family
    pub fn bind_addr(&self) -> SocketAddr {
        if let Some(bind) = self.bind {
            return bind;
        }
        match self.destinations.first() {
            Some(dest) if dest.is_ipv6() => SocketAddr::from(([0u16; 8], 0)),
            Some(dest) if dest.ip().is_loopback() => SocketAddr::from(([127, 0, 0, 1], 0)),
            _ => SocketAddr::from(([0, 0, 0, 0], 0)),
        }
    }

    pub fn block_duration(&self) -> Duration {
        Duration::from_millis(self.block_ms)
    }

    /// Get statistics interval as Duration
    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs.max(1))
    }
}

impl ReceiverConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.output.is_empty() {
            return Err(ConfigError::Invalid("no output file".to_string()));
        }
        check_audio(self.sample_rate, self.channels, self.block_ms)?;
        check_payload_type(self.payload_type)?;
        if self.initial_offset_ms > self.max_offset_ms {
            return Err(ConfigError::Invalid(
                "initial offset exceeds the maximum offset".to_string(),
            ));
        }
        Ok(())
    }

    pub fn block_duration(&self) -> Duration {
        Duration::from_millis(self.block_ms)
    }

    /// Get statistics interval as Duration
    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs.max(1))
    }
}

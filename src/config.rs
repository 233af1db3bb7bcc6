//! Process-level configuration
//!
//! Loaded once by the embedding process (or the CLI) from a TOML file and
//! handed to [`crate::Avpipe::new`]. Every section has defaults, so an empty
//! file is a valid configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{AvpipeError, Result};

/// Session table configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Maximum number of concurrently registered sessions
    pub capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { capacity: 128 }
    }
}

/// I/O adapter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IoConfig {
    /// Size of the AVIO read buffer handed to the demuxer
    pub input_buffer_size: usize,

    /// Initial capacity of in-memory output buffers (doubled on demand)
    pub output_buffer_size: usize,

    /// Report bytes read to the input handler every time this many bytes were consumed
    pub bytes_read_report: u64,

    /// Maximum number of datagrams buffered between the UDP receiver thread and the reader
    pub udp_queue_capacity: usize,

    /// How long a UDP read waits for the next datagram
    pub udp_read_timeout_ms: u64,

    /// Socket-level receive timeout used by the UDP receiver thread
    pub udp_socket_timeout_ms: u64,
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            input_buffer_size: 64 * 1024,
            output_buffer_size: 1024 * 1024,
            bytes_read_report: 64 * 1024 * 1024,
            udp_queue_capacity: 10_000,
            udp_read_timeout_ms: 5_000,
            udp_socket_timeout_ms: 1_000,
        }
    }
}

/// Pump loop tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PumpConfig {
    /// Number of frame durations past the stop boundary for which reordered
    /// video packets are still decoded
    pub reorder_grace_frames: u32,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            reorder_grace_frames: 5,
        }
    }
}

/// File output configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Directory under which per-session output directories are created
    pub root: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("O"),
        }
    }
}

/// Logging section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format ("text" or "json")
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

/// Top-level avpipe configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AvpipeConfig {
    pub session: SessionConfig,
    pub io: IoConfig,
    pub pump: PumpConfig,
    pub output: OutputConfig,
    pub logging: LoggingConfig,
}

impl AvpipeConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        toml::from_str(&contents).map_err(|e| AvpipeError::Config(format!("{}", e)))
    }

    /// Save configuration to a TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| AvpipeError::Config(format!("{}", e)))?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Check values that would otherwise fail deep inside a session
    pub fn validate(&self) -> Result<()> {
        if self.session.capacity == 0 {
            return Err(AvpipeError::Config("session.capacity must be > 0".into()));
        }
        if self.io.input_buffer_size == 0 || self.io.output_buffer_size == 0 {
            return Err(AvpipeError::Config("io buffer sizes must be > 0".into()));
        }
        if self.io.udp_queue_capacity == 0 {
            return Err(AvpipeError::Config(
                "io.udp_queue_capacity must be > 0".into(),
            ));
        }
        Ok(())
    }
}

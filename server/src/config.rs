//! Server configuration.
//!
//! Loaded from a TOML file; every field has a default so the server also
//! runs with no configuration at all.

use serde::Deserialize;
use std::path::Path;

/// Server configuration loaded from a TOML file.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Worker thread configuration.
    #[serde(default)]
    pub workers: WorkersConfig,

    /// Listening address.
    #[serde(default)]
    pub listener: ListenerConfig,

    /// io_uring dimensions, per worker.
    #[serde(default)]
    pub uring: UringConfig,

    /// Logging output configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let raw = std::fs::read_to_string(path)?;
        let config = toml::from_str(&raw)?;
        Ok(config)
    }

    /// Effective worker count: configured, or one per available core.
    pub fn threads(&self) -> usize {
        match self.workers.threads {
            Some(0) | None => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            Some(n) => n,
        }
    }

    pub fn ring_config(&self) -> strandio::RingConfig {
        strandio::RingConfig {
            queue_depth: self.uring.queue_depth,
            recv_buffers: strandio::BufRingConfig {
                ring_entries: self.uring.ring_entries,
                buffer_size: self.uring.ring_buf_size,
                bgid: 1,
            },
        }
    }
}

/// Worker thread configuration.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct WorkersConfig {
    /// Number of worker threads (default: number of CPUs).
    pub threads: Option<usize>,

    /// Pin each worker to the core matching its index.
    #[serde(default)]
    pub pin: bool,
}

/// Listening address configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListenerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

/// Per-worker io_uring dimensions.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UringConfig {
    /// Submission queue depth; the completion queue is 4x this.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: u32,

    /// Buffers in the provided ring (power of two).
    #[serde(default = "default_ring_entries")]
    pub ring_entries: u16,

    /// Size of each receive buffer in bytes.
    #[serde(default = "default_ring_buf_size")]
    pub ring_buf_size: u32,
}

impl Default for UringConfig {
    fn default() -> Self {
        Self {
            queue_depth: default_queue_depth(),
            ring_entries: default_ring_entries(),
            ring_buf_size: default_ring_buf_size(),
        }
    }
}

fn default_queue_depth() -> u32 {
    4096
}

fn default_ring_entries() -> u16 {
    256
}

fn default_ring_buf_size() -> u32 {
    4096
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log level filter when RUST_LOG is not set.
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,

    #[serde(default = "default_true")]
    pub timestamps: bool,

    /// Include the event target (module path) in output.
    #[serde(default)]
    pub target: bool,

    #[serde(default = "default_true")]
    pub thread_names: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            timestamps: true,
            target: false,
            thread_names: true,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

/// The default configuration rendered as TOML, for `--print-config`.
pub fn default_toml() -> &'static str {
    r#"# warden-server configuration

[workers]
# Number of worker threads (default: number of CPUs)
# threads = 8

# Pin each worker to the core matching its index
pin = false

[listener]
host = "0.0.0.0"
port = 8080

[uring]
# Submission queue depth per worker; completion queue is 4x this
queue_depth = 4096

# Provided buffer ring dimensions (entries must be a power of 2)
ring_entries = 256
ring_buf_size = 4096

[logging]
# Log level when RUST_LOG is not set: trace, debug, info, warn, error
level = "info"

# Output format: "pretty", "compact", or "json"
format = "pretty"

timestamps = true
target = false
thread_names = true
"#
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_complete() {
        let config = Config::default();
        assert_eq!(config.listener.host, "0.0.0.0");
        assert_eq!(config.listener.port, 8080);
        assert_eq!(config.uring.queue_depth, 4096);
        assert_eq!(config.uring.ring_entries, 256);
        assert_eq!(config.uring.ring_buf_size, 4096);
        assert!(config.threads() >= 1);
    }

    #[test]
    fn parses_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            [listener]
            port = 9000

            [workers]
            threads = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.listener.port, 9000);
        assert_eq!(config.listener.host, "0.0.0.0");
        assert_eq!(config.threads(), 2);
        assert_eq!(config.uring.queue_depth, 4096);
    }

    #[test]
    fn default_toml_round_trips() {
        let config: Config = toml::from_str(default_toml()).unwrap();
        assert_eq!(config.listener.port, 8080);
        assert_eq!(config.logging.format, LogFormat::Pretty);
    }

    #[test]
    fn rejects_unknown_fields() {
        let result: Result<Config, _> = toml::from_str("[listener]\naddress = \"nope\"\n");
        assert!(result.is_err());
    }
}

//! Agent configuration.
//!
//! Read once at startup from `/etc/helion/agent.toml` (or `--config`),
//! immutable afterwards. Unknown keys are logged at `warn` and otherwise
//! ignored so older agents tolerate newer host-managed config files.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/helion/agent.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Seconds between telemetry reports. Also sets the keepalive cadence
    /// (half this) and the peer stall threshold (three times this).
    pub telemetry_interval_secs: u64,
    /// Hard cap on any single `execute` request, whatever the host asks.
    pub max_exec_timeout_secs: u64,
    /// Largest file chunk or stdin blob accepted in one request.
    pub max_chunk_size: u32,
    /// Largest frame accepted or produced on the wire, header excluded.
    pub max_frame_bytes: u32,
    /// Captured stdout and stderr are each truncated at this many bytes.
    pub max_exec_output_cap: u32,
    pub log_level: LogLevel,
    /// Explicit device path. Unset means auto-detect by port name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_path: Option<PathBuf>,
    /// Port name scanned for under /sys/class/virtio-ports.
    pub virtio_port_name: String,
    pub reconnect_backoff_initial_ms: u64,
    pub reconnect_backoff_max_ms: u64,
    pub outbound_queue_depth: usize,
    /// How long a dying session waits for in-flight handlers to settle.
    pub session_drain_grace_ms: u64,
    /// How long graceful shutdown waits before abandoning handlers.
    pub shutdown_grace_secs: u64,
    /// Bounded device-open attempts during boot before the agent settles
    /// into the indefinite reconnect loop.
    pub boot_open_attempts: usize,
    /// Startup is refused when the configured buffer bounds exceed this.
    pub memory_ceiling_bytes: u64,
    pub exec_concurrency: usize,
    pub file_concurrency: usize,
    /// Where `network_apply` documents land.
    pub network_config_path: PathBuf,
    pub network_apply_command: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            telemetry_interval_secs: 5,
            max_exec_timeout_secs: 300,
            max_chunk_size: 64 * 1024,
            max_frame_bytes: 1024 * 1024,
            max_exec_output_cap: 1024 * 1024,
            log_level: LogLevel::Info,
            device_path: None,
            virtio_port_name: crate::PORT_NAME.to_string(),
            reconnect_backoff_initial_ms: 500,
            reconnect_backoff_max_ms: 30_000,
            outbound_queue_depth: 1024,
            session_drain_grace_ms: 2_000,
            shutdown_grace_secs: 10,
            boot_open_attempts: 5,
            memory_ceiling_bytes: 256 * 1024 * 1024,
            exec_concurrency: 16,
            file_concurrency: 8,
            network_config_path: PathBuf::from("/etc/netplan/90-helion.yaml"),
            network_apply_command: vec!["netplan".into(), "apply".into()],
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl Config {
    /// Load from `path`, or defaults when `path` is `None` and the
    /// standard location does not exist.
    pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
        let (path, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
        };

        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound && !required => {
                let cfg = Config::default();
                cfg.validate()?;
                return Ok(cfg);
            }
            Err(source) => return Err(ConfigError::Read { path, source }),
        };

        let cfg = Self::parse(&text).map_err(|source| ConfigError::Parse { path, source })?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn parse(text: &str) -> Result<Config, toml::de::Error> {
        if let Ok(doc) = toml::from_str::<toml::Table>(text) {
            warn_unknown_keys(&doc);
        }
        toml::from_str(text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.telemetry_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "telemetry_interval_secs must be positive".into(),
            ));
        }
        if self.max_exec_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "max_exec_timeout_secs must be positive".into(),
            ));
        }
        if self.reconnect_backoff_initial_ms == 0 {
            return Err(ConfigError::Invalid(
                "reconnect_backoff_initial_ms must be positive".into(),
            ));
        }
        if self.reconnect_backoff_max_ms < self.reconnect_backoff_initial_ms {
            return Err(ConfigError::Invalid(
                "reconnect_backoff_max_ms must be >= reconnect_backoff_initial_ms".into(),
            ));
        }
        if self.outbound_queue_depth == 0 {
            return Err(ConfigError::Invalid(
                "outbound_queue_depth must be positive".into(),
            ));
        }
        // Leave headroom for the message envelope around a chunk payload.
        const ENVELOPE_SLACK: u32 = 256;
        if self.max_chunk_size == 0 || self.max_chunk_size + ENVELOPE_SLACK > self.max_frame_bytes {
            return Err(ConfigError::Invalid(format!(
                "max_chunk_size must be between 1 and {} (max_frame_bytes minus envelope)",
                self.max_frame_bytes.saturating_sub(ENVELOPE_SLACK)
            )));
        }
        if self.exec_concurrency == 0 || self.file_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "concurrency caps must be positive".into(),
            ));
        }

        let bound = self.buffer_bound_bytes();
        if bound > self.memory_ceiling_bytes {
            return Err(ConfigError::Invalid(format!(
                "configured buffers need {bound} bytes, over the {} byte ceiling",
                self.memory_ceiling_bytes
            )));
        }
        Ok(())
    }

    /// Steady-state bound of the pre-sized buffers: one chunk-sized slot
    /// per outbound queue entry plus both capped capture buffers for every
    /// concurrent execute. Oversized execute responses are transient and
    /// already limited by the capture caps.
    pub fn buffer_bound_bytes(&self) -> u64 {
        let queue = self.outbound_queue_depth as u64 * self.max_chunk_size as u64;
        let exec = self.exec_concurrency as u64 * 2 * self.max_exec_output_cap as u64;
        queue + exec
    }

    pub fn telemetry_interval(&self) -> Duration {
        Duration::from_secs(self.telemetry_interval_secs)
    }

    pub fn max_exec_timeout(&self) -> Duration {
        Duration::from_secs(self.max_exec_timeout_secs)
    }

    pub fn reconnect_backoff_initial(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_initial_ms)
    }

    pub fn reconnect_backoff_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_max_ms)
    }

    pub fn session_drain_grace(&self) -> Duration {
        Duration::from_millis(self.session_drain_grace_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Keepalive ping cadence while the channel is otherwise idle.
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs((self.telemetry_interval_secs / 2).max(1))
    }

    /// Silence from the peer past this long counts as a stall.
    pub fn peer_stall_threshold(&self) -> Duration {
        Duration::from_secs(self.telemetry_interval_secs * 3)
    }
}

fn warn_unknown_keys(doc: &toml::Table) {
    const KNOWN: &[&str] = &[
        "telemetry_interval_secs",
        "max_exec_timeout_secs",
        "max_chunk_size",
        "max_frame_bytes",
        "max_exec_output_cap",
        "log_level",
        "device_path",
        "virtio_port_name",
        "reconnect_backoff_initial_ms",
        "reconnect_backoff_max_ms",
        "outbound_queue_depth",
        "session_drain_grace_ms",
        "shutdown_grace_secs",
        "boot_open_attempts",
        "memory_ceiling_bytes",
        "exec_concurrency",
        "file_concurrency",
        "network_config_path",
        "network_apply_command",
    ];
    for key in doc.keys() {
        if !KNOWN.contains(&key.as_str()) {
            warn!(key, "ignoring unknown configuration key");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn empty_document_yields_defaults() {
        assert_eq!(Config::parse("").unwrap(), Config::default());
    }

    #[test]
    fn toml_round_trip_is_identity() {
        let mut cfg = Config::default();
        cfg.telemetry_interval_secs = 7;
        cfg.device_path = Some(PathBuf::from("/dev/vport1p1"));
        cfg.log_level = LogLevel::Debug;
        let text = toml::to_string(&cfg).unwrap();
        assert_eq!(Config::parse(&text).unwrap(), cfg);
    }

    #[test]
    fn unknown_keys_do_not_fail_parsing() {
        let cfg = Config::parse("shiny_new_option = true\nmax_chunk_size = 4096\n").unwrap();
        assert_eq!(cfg.max_chunk_size, 4096);
    }

    #[test]
    fn chunk_size_may_not_reach_frame_limit() {
        let mut cfg = Config::default();
        cfg.max_chunk_size = cfg.max_frame_bytes;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_interval_is_rejected() {
        let mut cfg = Config::default();
        cfg.telemetry_interval_secs = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn oversized_buffer_plan_is_refused() {
        let mut cfg = Config::default();
        cfg.memory_ceiling_bytes = 1024;
        match cfg.validate() {
            Err(ConfigError::Invalid(msg)) => assert!(msg.contains("ceiling")),
            other => panic!("expected refusal, got {other:?}"),
        }
    }

    #[test]
    fn backoff_ordering_is_enforced() {
        let mut cfg = Config::default();
        cfg.reconnect_backoff_max_ms = 100;
        assert!(cfg.validate().is_err());
    }
}

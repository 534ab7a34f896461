//! Per-operation payload shapes.
//!
//! Every request/response/event payload on the wire is the postcard
//! encoding of one of these types. Payload decoding reads a prefix of the
//! buffer, so a peer appending new trailing fields to a known shape stays
//! compatible with this build.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::message::CodecError;

/// Operation tags as they appear in [`crate::Message::operation`].
pub mod op {
    pub const HELLO: &str = "hello";
    pub const PING: &str = "ping";
    pub const TELEMETRY_REPORT: &str = "telemetry_report";
    pub const EXECUTE: &str = "execute";
    pub const PROGRESS: &str = "progress";
    pub const FILE_READ: &str = "file_read";
    pub const FILE_WRITE: &str = "file_write";
    pub const SHUTDOWN: &str = "shutdown";
    pub const REBOOT: &str = "reboot";
    pub const PASSWORD_RESET: &str = "password_reset";
    pub const NETWORK_APPLY: &str = "network_apply";
    pub const FS_FREEZE: &str = "fs_freeze";
    pub const FS_THAW: &str = "fs_thaw";
    pub const CLIPBOARD_GET: &str = "clipboard_get";
    pub const CLIPBOARD_SET: &str = "clipboard_set";
    pub const DISPLAY_RESIZE: &str = "display_resize";
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    Ok(postcard::to_allocvec(value)?)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    Ok(postcard::from_bytes(bytes)?)
}

/// Sent once per session by each side after the channel opens. The agent
/// never waits for the peer's hello; the host may start issuing requests
/// immediately.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Hello {
    pub protocol_version: u8,
    pub agent_version: String,
    /// Operation tags this agent will dispatch.
    pub capabilities: Vec<String>,
    pub os: OsIdentity,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct OsIdentity {
    /// "unix" or "windows".
    pub family: String,
    pub name: Option<String>,
    pub version: Option<String>,
    pub kernel: Option<String>,
    pub hostname: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ExecuteRequest {
    pub command: String,
    pub args: Vec<String>,
    /// Additive over the guest environment.
    pub env: Vec<(String, String)>,
    /// Absolute path, or unset for the agent's working directory.
    pub cwd: Option<String>,
    /// Fed to the child and then closed. Bounded by `max_chunk_size`.
    pub stdin: Option<Vec<u8>>,
    /// Capped by the agent's `max_exec_timeout`; the handler default
    /// applies when unset.
    pub timeout_ms: Option<u64>,
    /// Unix only.
    pub run_as: Option<String>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ExecuteResponse {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub wall_time_ms: u64,
}

/// Heartbeat emitted once a second while a long `execute` runs.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ExecuteProgress {
    pub stdout_bytes: u64,
    pub stderr_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct FileReadRequest {
    pub path: String,
    pub offset: u64,
    /// Bounded by `max_chunk_size`.
    pub length: u32,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct FileReadResponse {
    pub data: Vec<u8>,
    pub eof: bool,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct FileWriteRequest {
    pub path: String,
    pub offset: u64,
    /// Bounded by `max_chunk_size`.
    pub data: Vec<u8>,
    pub create: bool,
    /// Unix permission bits applied when the file is created.
    pub mode: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct FileWriteResponse {
    pub written: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PowerRequest {
    pub delay_secs: u64,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PasswordResetRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct NetworkApplyRequest {
    /// Platform-specific network configuration document, applied verbatim.
    pub document: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct FreezeRequest {
    /// Empty means every quiescable mount.
    pub mountpoints: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct FreezeResponse {
    pub mountpoints: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ClipboardGetResponse {
    pub data: Vec<u8>,
    pub mime: String,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ClipboardSetRequest {
    pub data: Vec<u8>,
    pub mime: String,
}

#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct DisplayResizeRequest {
    pub width: u32,
    pub height: u32,
    /// 1.0 when the host does not scale.
    pub scale: f32,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TelemetryReport {
    pub cpu_percent: f32,
    pub mem_total: u64,
    pub mem_used: u64,
    pub mem_available: u64,
    pub swap_total: u64,
    pub swap_used: u64,
    pub disks: Vec<DiskUsage>,
    pub interfaces: Vec<InterfaceInfo>,
    /// Absent on platforms without load accounting.
    pub load_avg: Option<LoadAverages>,
    pub process_count: u32,
    pub uptime_secs: u64,
    /// Samples lost to outbound back-pressure since the last delivered
    /// report.
    pub dropped_samples: u64,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct DiskUsage {
    pub mount_point: String,
    pub filesystem: String,
    pub total_bytes: u64,
    pub available_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct InterfaceInfo {
    pub name: String,
    pub addresses: Vec<String>,
    pub mac: String,
    pub link_up: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct LoadAverages {
    pub one: f64,
    pub five: f64,
    pub fifteen: f64,
}

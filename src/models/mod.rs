//! Core data model: fleet configuration, wire frames, status snapshots,
//! and audit records. Snapshots and records are values; once captured
//! they are never mutated.

pub mod status;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use status::{StatusBits, StatusSnapshot};

/// STATUS command code on the wire protocol. No mutation.
pub const CMD_STATUS: u8 = 0;
/// MOVE command code; the argument is the target bucket.
pub const CMD_MOVE: u8 = 1;
/// Highest addressable bucket for a MOVE target.
pub const MAX_MOVE_POSITION: u8 = 9;

/// One configured machine in the fleet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineConfig {
    /// Short stable token, unique within the fleet (`[A-Za-z0-9_-]+`).
    pub id: String,
    pub name: String,
    /// IPv4 dotted quad of the PLC.
    pub ip: String,
    pub port: u16,
    /// Drive an in-process simulator instead of a real device.
    #[serde(default)]
    pub simulator: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Deployment-time READY polarity flag: set when the deployed PLC
    /// reports 0 = ready. The decoded label is canonical either way.
    #[serde(default)]
    pub ready_inverted: bool,
}

/// API section of the fleet configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_port")]
    pub port: u16,
    #[serde(default)]
    pub debug: bool,
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            port: default_api_port(),
            debug: false,
            allowed_origins: default_allowed_origins(),
        }
    }
}

fn default_api_port() -> u16 {
    5000
}

fn default_allowed_origins() -> String {
    "http://localhost,http://127.0.0.1".to_string()
}

/// Logging section of the fleet configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingSettings {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_max_file_size_mb")]
    pub max_file_size_mb: u64,
    #[serde(default = "default_backup_count")]
    pub backup_count: u32,
    #[serde(default = "default_true")]
    pub connection_log_enabled: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_file_size_mb: default_max_file_size_mb(),
            backup_count: default_backup_count(),
            connection_log_enabled: true,
        }
    }
}

fn default_log_level() -> String {
    "INFO".to_string()
}

fn default_max_file_size_mb() -> u64 {
    10
}

fn default_backup_count() -> u32 {
    5
}

fn default_true() -> bool {
    true
}

/// Top-level fleet configuration file shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetConfig {
    #[serde(default)]
    pub api_config: ApiConfig,
    pub plc_machines: Vec<MachineConfig>,
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Legacy single-device configuration file shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyConfig {
    pub ip: String,
    pub port: u16,
    #[serde(default)]
    pub simulator_enabled: bool,
    #[serde(default = "default_api_port")]
    pub api_port: u16,
}

impl Default for LegacyConfig {
    fn default() -> Self {
        Self {
            ip: "192.168.1.50".to_string(),
            port: 3200,
            simulator_enabled: false,
            api_port: default_api_port(),
        }
    }
}

impl LegacyConfig {
    /// Synthesizes a one-element fleet from the legacy file.
    pub fn into_fleet(self) -> FleetConfig {
        FleetConfig {
            api_config: ApiConfig {
                port: self.api_port,
                ..ApiConfig::default()
            },
            plc_machines: vec![MachineConfig {
                id: "machine_1".to_string(),
                name: "Carousel".to_string(),
                ip: self.ip,
                port: self.port,
                simulator: self.simulator_enabled,
                description: None,
                ready_inverted: false,
            }],
            logging: LoggingSettings::default(),
        }
    }
}

/// One row of the list-machines response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineSummary {
    pub id: String,
    pub name: String,
    pub ip: String,
    pub port: u16,
    #[serde(rename = "type")]
    pub kind: String,
    pub status: String,
}

impl MachineSummary {
    pub fn from_config(config: &MachineConfig) -> Self {
        Self {
            id: config.id.clone(),
            name: config.name.clone(),
            ip: config.ip.clone(),
            port: config.port,
            kind: if config.simulator {
                "Simulator".to_string()
            } else {
                "Real PLC".to_string()
            },
            status: "available".to_string(),
        }
    }
}

/// Raw frame read back from a device.
///
/// Byte 0 is the status byte and byte 1 the position; any trailing bytes
/// are captured verbatim for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireResponse {
    pub raw: u8,
    pub position: u8,
    pub extra: Vec<u8>,
}

/// Fleet-level health summary, gathered without contending on any
/// device mutex.
#[derive(Debug, Clone, Serialize)]
pub struct FleetHealth {
    pub machine_count: usize,
    pub machines: BTreeMap<String, bool>,
}

/// Outcome field shared by both audit record kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditOutcome {
    Ok,
    Error,
}

impl AuditOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditOutcome::Ok => "OK",
            AuditOutcome::Error => "ERROR",
        }
    }
}

/// What a client asked the fleet to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientRequestKind {
    StatusReq,
    CommandReq,
    MoveReq,
}

impl ClientRequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientRequestKind::StatusReq => "STATUS_REQ",
            ClientRequestKind::CommandReq => "COMMAND_REQ",
            ClientRequestKind::MoveReq => "MOVE_REQ",
        }
    }
}

/// Append-only record of one client request against the fleet.
#[derive(Debug, Clone, Serialize)]
pub struct ClientConnectionRecord {
    pub kind: ClientRequestKind,
    pub client_addr: String,
    pub machine_id: String,
    pub command: Option<u8>,
    pub argument: Option<u8>,
    pub outcome: AuditOutcome,
    pub error: Option<String>,
    pub ts: DateTime<Utc>,
}

/// Append-only record of one transaction against a device.
#[derive(Debug, Clone, Serialize)]
pub struct OperationRecord {
    pub machine_id: String,
    pub command: u8,
    pub argument: Option<u8>,
    pub status_before: Option<StatusSnapshot>,
    pub status_after: Option<StatusSnapshot>,
    pub outcome: AuditOutcome,
    pub error: Option<String>,
    pub ts: DateTime<Utc>,
}

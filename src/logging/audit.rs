//! Append-only audit trail.
//!
//! Two streams: `client_connections.log` records every client request
//! against the fleet, `operations.log` records every transaction against
//! a device. Both rotate by size, renaming the active file to a
//! timestamped sibling and pruning the oldest rotations.

use std::fmt::Write as _;
use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Local;
use log::warn;

use crate::models::{ClientConnectionRecord, LoggingSettings, OperationRecord, StatusSnapshot};
use crate::utils::error::AppResult;

const CONNECTIONS_LOG: &str = "client_connections.log";
const OPERATIONS_LOG: &str = "operations.log";

/// Thread-safe writer pair for the two audit streams.
#[derive(Debug)]
pub struct AuditTrail {
    connections: Option<Mutex<RotatingLog>>,
    operations: Mutex<RotatingLog>,
}

impl AuditTrail {
    /// Opens the audit streams under `log_dir`, creating it if needed.
    pub fn open(log_dir: impl AsRef<Path>, settings: &LoggingSettings) -> AppResult<Self> {
        let dir = log_dir.as_ref();
        fs::create_dir_all(dir)?;

        let max_bytes = settings.max_file_size_mb.max(1) * 1024 * 1024;
        let backups = settings.backup_count as usize;

        let connections = settings.connection_log_enabled.then(|| {
            Mutex::new(RotatingLog::new(
                dir.join(CONNECTIONS_LOG),
                max_bytes,
                backups,
            ))
        });

        Ok(Self {
            connections,
            operations: Mutex::new(RotatingLog::new(
                dir.join(OPERATIONS_LOG),
                max_bytes,
                backups,
            )),
        })
    }

    /// Appends one client-connection record.
    pub fn record_client(&self, record: &ClientConnectionRecord) {
        let Some(log) = &self.connections else {
            return;
        };

        let mut line = format!(
            "{} | {} | client: {} | machine: {}",
            record.ts.to_rfc3339(),
            record.kind.as_str(),
            record.client_addr,
            record.machine_id,
        );
        if let Some(command) = record.command {
            let _ = write!(line, " | command: {command}");
        }
        if let Some(argument) = record.argument {
            let _ = write!(line, " | argument: {argument}");
        }
        let _ = write!(line, " | outcome: {}", record.outcome.as_str());
        if let Some(error) = &record.error {
            let _ = write!(line, " | error: {error}");
        }

        Self::append(log, &line);
    }

    /// Appends one device-operation record.
    pub fn record_operation(&self, record: &OperationRecord) {
        let mut line = format!(
            "{} | machine: {} | command: {}",
            record.ts.to_rfc3339(),
            record.machine_id,
            record.command,
        );
        if let Some(argument) = record.argument {
            let _ = write!(line, " | argument: {argument}");
        }
        let _ = write!(line, " | outcome: {}", record.outcome.as_str());
        if let Some(error) = &record.error {
            let _ = write!(line, " | error: {error}");
        }
        let _ = write!(
            line,
            " | before: {} | after: {}",
            format_snapshot(&record.status_before),
            format_snapshot(&record.status_after),
        );

        Self::append(&self.operations, &line);
    }

    fn append(log: &Mutex<RotatingLog>, line: &str) {
        let mut guard = log.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Err(e) = guard.append(line) {
            warn!("audit write to {} failed: {e}", guard.path.display());
        }
    }
}

fn format_snapshot(snapshot: &Option<StatusSnapshot>) -> String {
    match snapshot {
        Some(s) => format!("raw={} pos={}", s.raw, s.position),
        None => "n/a".to_string(),
    }
}

/// Size-rotated append-only log file.
#[derive(Debug)]
struct RotatingLog {
    path: PathBuf,
    max_bytes: u64,
    backups: usize,
}

impl RotatingLog {
    fn new(path: PathBuf, max_bytes: u64, backups: usize) -> Self {
        Self {
            path,
            max_bytes,
            backups,
        }
    }

    fn append(&mut self, line: &str) -> std::io::Result<()> {
        self.rotate_if_needed()?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{line}")
    }

    fn rotate_if_needed(&mut self) -> std::io::Result<()> {
        let size = match fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(_) => return Ok(()),
        };
        if size < self.max_bytes {
            return Ok(());
        }

        let stem = self
            .path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("audit");
        let parent = self
            .path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let timestamp = Local::now().format("%Y%m%d_%H%M%S");
        let mut sequence = 1u16;
        let mut rotated = parent.join(format!("{stem}.{timestamp}.{sequence:03}.log"));
        while rotated.exists() {
            sequence += 1;
            rotated = parent.join(format!("{stem}.{timestamp}.{sequence:03}.log"));
        }

        fs::rename(&self.path, &rotated)?;
        self.prune(&parent, stem);
        Ok(())
    }

    fn prune(&self, parent: &Path, stem: &str) {
        let Ok(entries) = fs::read_dir(parent) else {
            return;
        };
        let active = format!("{stem}.log");
        let mut rotated: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.file_name().and_then(|n| n.to_str()).map_or(false, |n| {
                    n != active && n.starts_with(&format!("{stem}.")) && n.ends_with(".log")
                })
            })
            .collect();

        // Rotated names embed the timestamp, so the sort is chronological.
        rotated.sort();
        while rotated.len() > self.backups {
            let oldest = rotated.remove(0);
            if let Err(e) = fs::remove_file(&oldest) {
                warn!("could not remove rotated audit log {}: {e}", oldest.display());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AuditOutcome, ClientRequestKind};
    use chrono::Utc;
    use tempfile::tempdir;

    fn settings() -> LoggingSettings {
        LoggingSettings::default()
    }

    fn client_record() -> ClientConnectionRecord {
        ClientConnectionRecord {
            kind: ClientRequestKind::CommandReq,
            client_addr: "192.168.1.10:51000".to_string(),
            machine_id: "m1".to_string(),
            command: Some(1),
            argument: Some(5),
            outcome: AuditOutcome::Ok,
            error: None,
            ts: Utc::now(),
        }
    }

    #[test]
    fn client_records_are_appended() {
        let dir = tempdir().unwrap();
        let trail = AuditTrail::open(dir.path(), &settings()).unwrap();

        trail.record_client(&client_record());
        trail.record_client(&client_record());

        let contents = fs::read_to_string(dir.path().join(CONNECTIONS_LOG)).unwrap();
        assert_eq!(contents.lines().count(), 2);
        assert!(contents.contains("COMMAND_REQ"));
        assert!(contents.contains("machine: m1"));
        assert!(contents.contains("outcome: OK"));
    }

    #[test]
    fn operation_records_include_before_and_after() {
        let dir = tempdir().unwrap();
        let trail = AuditTrail::open(dir.path(), &settings()).unwrap();

        trail.record_operation(&OperationRecord {
            machine_id: "m1".to_string(),
            command: 1,
            argument: Some(3),
            status_before: Some(StatusSnapshot::capture(2, 1, false)),
            status_after: Some(StatusSnapshot::capture(1, 3, false)),
            outcome: AuditOutcome::Ok,
            error: None,
            ts: Utc::now(),
        });

        let contents = fs::read_to_string(dir.path().join(OPERATIONS_LOG)).unwrap();
        assert!(contents.contains("before: raw=2 pos=1"));
        assert!(contents.contains("after: raw=1 pos=3"));
    }

    #[test]
    fn disabled_connection_log_writes_nothing() {
        let dir = tempdir().unwrap();
        let mut s = settings();
        s.connection_log_enabled = false;
        let trail = AuditTrail::open(dir.path(), &s).unwrap();

        trail.record_client(&client_record());
        assert!(!dir.path().join(CONNECTIONS_LOG).exists());
    }

    #[test]
    fn rotation_renames_and_prunes() {
        let dir = tempdir().unwrap();
        let mut log = RotatingLog::new(dir.path().join("operations.log"), 64, 2);

        for i in 0..40 {
            log.append(&format!("line {i} with some padding to grow the file"))
                .unwrap();
        }

        let rotated = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy() != "operations.log")
            .count();
        assert!(rotated >= 1, "expected at least one rotated file");
        assert!(rotated <= 2, "expected pruning to keep at most 2, got {rotated}");
    }
}

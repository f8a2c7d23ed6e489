//! Fleet configuration store.
//!
//! Loads the fleet file when present, falls back to the legacy
//! single-device file, and rewrites configuration atomically
//! (write-temp + rename) with a timestamped backup of the prior version.
//! The ten most recent backups are kept.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Local;
use log::{info, warn};
use serde::de::DeserializeOwned;

use crate::models::{ApiConfig, FleetConfig, LegacyConfig, LoggingSettings, MachineConfig};
use crate::utils::error::{AppError, AppResult};

const FLEET_FILE: &str = "config_multi_plc.json";
const LEGACY_FILE: &str = "config.json";
const BACKUP_DIR: &str = "config_backups";
const MAX_BACKUPS: usize = 10;

/// Loads, validates, and atomically rewrites the fleet configuration.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    fleet_path: PathBuf,
    legacy_path: PathBuf,
    backup_dir: PathBuf,
}

impl ConfigStore {
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        let base = base_dir.as_ref();
        Self {
            fleet_path: base.join(FLEET_FILE),
            legacy_path: base.join(LEGACY_FILE),
            backup_dir: base.join(BACKUP_DIR),
        }
    }

    /// Directory the configuration lives in; per-device lock files are
    /// anchored next to it.
    pub fn base_dir(&self) -> PathBuf {
        self.fleet_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Loads the fleet configuration.
    ///
    /// Order: fleet file with at least one machine, else a one-element
    /// fleet synthesized from the legacy file, else built-in defaults.
    pub fn load_fleet(&self) -> AppResult<FleetConfig> {
        if self.fleet_path.exists() {
            let fleet: FleetConfig = self.read_json(&self.fleet_path)?;
            if !fleet.plc_machines.is_empty() {
                Self::check_fleet(&fleet)?;
                info!(
                    "fleet configuration loaded: {} machine(s)",
                    fleet.plc_machines.len()
                );
                return Ok(fleet);
            }
            warn!("fleet configuration has no machines, falling back to legacy config");
        }

        let legacy: LegacyConfig = if self.legacy_path.exists() {
            self.read_json(&self.legacy_path)?
        } else {
            info!("no configuration file found, using defaults");
            LegacyConfig::default()
        };
        Ok(legacy.into_fleet())
    }

    /// Saves the fleet configuration: validate, back up the prior file,
    /// write a temp file, rename into place.
    pub fn save_fleet(&self, fleet: &FleetConfig) -> AppResult<()> {
        Self::check_fleet(fleet)?;

        if self.fleet_path.exists() {
            if let Err(e) = self.backup_current() {
                warn!("could not back up configuration before save: {e}");
            }
        }

        let payload = serde_json::to_vec_pretty(fleet)?;
        let tmp_path = self.fleet_path.with_file_name(format!("{FLEET_FILE}.tmp"));
        fs::write(&tmp_path, payload)?;
        fs::rename(&tmp_path, &self.fleet_path)?;

        info!(
            "fleet configuration saved: {} machine(s)",
            fleet.plc_machines.len()
        );
        Ok(())
    }

    /// Adds the machine, or replaces the entry with the same id. Edits
    /// the fleet file directly; the legacy fallback is read-only.
    pub fn upsert_machine(&self, machine: MachineConfig) -> AppResult<FleetConfig> {
        let (ok, message) = Self::validate_machine(&machine);
        if !ok {
            return Err(AppError::bad_request(message));
        }

        let mut fleet = self.load_fleet_file_or_default()?;
        match fleet.plc_machines.iter_mut().find(|m| m.id == machine.id) {
            Some(existing) => *existing = machine,
            None => fleet.plc_machines.push(machine),
        }
        self.save_fleet(&fleet)?;
        Ok(fleet)
    }

    /// Removes the machine with the given id.
    pub fn remove_machine(&self, machine_id: &str) -> AppResult<FleetConfig> {
        let mut fleet = self.load_fleet_file_or_default()?;
        let before = fleet.plc_machines.len();
        fleet.plc_machines.retain(|m| m.id != machine_id);
        if fleet.plc_machines.len() == before {
            return Err(AppError::unknown_machine(machine_id));
        }
        self.save_fleet(&fleet)?;
        Ok(fleet)
    }

    /// Validates one machine entry: id charset, non-empty name, IPv4
    /// dotted quad, port range.
    pub fn validate_machine(machine: &MachineConfig) -> (bool, String) {
        let id = machine.id.trim();
        if id.is_empty() {
            return (false, "machine id must not be empty".to_string());
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return (
                false,
                "machine id may contain only letters, digits, underscores, and dashes".to_string(),
            );
        }
        if machine.name.trim().is_empty() {
            return (false, "machine name must not be empty".to_string());
        }

        let octets: Vec<&str> = machine.ip.split('.').collect();
        if octets.len() != 4
            || octets
                .iter()
                .any(|o| o.is_empty() || !o.bytes().all(|b| b.is_ascii_digit()))
            || octets.iter().any(|o| o.parse::<u16>().map_or(true, |v| v > 255))
        {
            return (false, format!("invalid IPv4 address: {}", machine.ip));
        }

        if machine.port == 0 {
            return (false, "port must be between 1 and 65535".to_string());
        }

        (true, String::new())
    }

    /// The fleet file as stored, or an empty fleet when it does not
    /// exist yet. Used by the edit operations.
    fn load_fleet_file_or_default(&self) -> AppResult<FleetConfig> {
        if self.fleet_path.exists() {
            self.read_json(&self.fleet_path)
        } else {
            Ok(FleetConfig {
                api_config: ApiConfig::default(),
                plc_machines: Vec::new(),
                logging: LoggingSettings::default(),
            })
        }
    }

    fn check_fleet(fleet: &FleetConfig) -> AppResult<()> {
        let mut seen = std::collections::HashSet::new();
        for machine in &fleet.plc_machines {
            let (ok, message) = Self::validate_machine(machine);
            if !ok {
                return Err(AppError::configuration(format!(
                    "machine '{}': {message}",
                    machine.id
                )));
            }
            if !seen.insert(machine.id.as_str()) {
                return Err(AppError::configuration(format!(
                    "duplicate machine id '{}'",
                    machine.id
                )));
            }
        }
        Ok(())
    }

    /// Reads and parses a JSON file, retrying once so that a reader
    /// racing a concurrent rewrite sees either version, never an error.
    fn read_json<T: DeserializeOwned>(&self, path: &Path) -> AppResult<T> {
        match Self::read_json_once(path) {
            Ok(value) => Ok(value),
            Err(first) => {
                warn!(
                    "retrying read of {} after error: {first}",
                    path.display()
                );
                Self::read_json_once(path).map_err(|e| {
                    AppError::configuration(format!("cannot read {}: {e}", path.display()))
                })
            }
        }
    }

    fn read_json_once<T: DeserializeOwned>(path: &Path) -> AppResult<T> {
        let contents = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Copies the current fleet file into the backup directory with a
    /// timestamped name, then prunes old backups.
    fn backup_current(&self) -> AppResult<()> {
        fs::create_dir_all(&self.backup_dir)?;

        let timestamp = Local::now().format("%Y%m%d_%H%M%S");
        let mut backup_path = self
            .backup_dir
            .join(format!("config_multi_plc_backup_{timestamp}.json"));
        let mut sequence = 1u16;
        while backup_path.exists() {
            backup_path = self
                .backup_dir
                .join(format!("config_multi_plc_backup_{timestamp}.{sequence:03}.json"));
            sequence += 1;
        }

        fs::copy(&self.fleet_path, &backup_path)?;
        self.prune_backups()?;
        Ok(())
    }

    fn prune_backups(&self) -> AppResult<()> {
        let mut backups: Vec<PathBuf> = fs::read_dir(&self.backup_dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map_or(false, |n| {
                        n.starts_with("config_multi_plc_backup_") && n.ends_with(".json")
                    })
            })
            .collect();

        // Timestamped names sort chronologically.
        backups.sort();
        while backups.len() > MAX_BACKUPS {
            let oldest = backups.remove(0);
            if let Err(e) = fs::remove_file(&oldest) {
                warn!("could not remove old backup {}: {e}", oldest.display());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ApiConfig, LoggingSettings};
    use tempfile::tempdir;

    fn machine(id: &str) -> MachineConfig {
        MachineConfig {
            id: id.to_string(),
            name: format!("Carousel {id}"),
            ip: "192.168.1.50".to_string(),
            port: 3200,
            simulator: true,
            description: None,
            ready_inverted: false,
        }
    }

    fn fleet(machines: Vec<MachineConfig>) -> FleetConfig {
        FleetConfig {
            api_config: ApiConfig::default(),
            plc_machines: machines,
            logging: LoggingSettings::default(),
        }
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let store = ConfigStore::new(dir.path());

        let original = fleet(vec![machine("m1"), machine("m2")]);
        store.save_fleet(&original).unwrap();

        let loaded = store.load_fleet().unwrap();
        assert_eq!(loaded, original);
    }

    #[test]
    fn load_falls_back_to_legacy_file() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join(LEGACY_FILE),
            r#"{"ip":"10.1.2.3","port":3200,"simulator_enabled":true,"api_port":6000}"#,
        )
        .unwrap();

        let store = ConfigStore::new(dir.path());
        let loaded = store.load_fleet().unwrap();
        assert_eq!(loaded.api_config.port, 6000);
        assert_eq!(loaded.plc_machines.len(), 1);
        assert_eq!(loaded.plc_machines[0].ip, "10.1.2.3");
        assert!(loaded.plc_machines[0].simulator);
    }

    #[test]
    fn load_uses_defaults_when_nothing_exists() {
        let dir = tempdir().unwrap();
        let store = ConfigStore::new(dir.path());
        let loaded = store.load_fleet().unwrap();
        assert_eq!(loaded.plc_machines.len(), 1);
        assert_eq!(loaded.plc_machines[0].ip, "192.168.1.50");
        assert_eq!(loaded.api_config.port, 5000);
    }

    #[test]
    fn save_rejects_duplicate_ids() {
        let dir = tempdir().unwrap();
        let store = ConfigStore::new(dir.path());
        let err = store
            .save_fleet(&fleet(vec![machine("m1"), machine("m1")]))
            .unwrap_err();
        assert!(matches!(err, AppError::Configuration { .. }));
    }

    #[test]
    fn save_keeps_at_most_ten_backups() {
        let dir = tempdir().unwrap();
        let store = ConfigStore::new(dir.path());

        for i in 0..13 {
            let mut m = machine("m1");
            m.port = 3200 + i;
            store.save_fleet(&fleet(vec![m])).unwrap();
        }

        let backups = fs::read_dir(dir.path().join(BACKUP_DIR))
            .unwrap()
            .count();
        assert!(backups <= MAX_BACKUPS, "found {backups} backups");
        // No temp file left behind after the renames.
        assert!(!dir.path().join(format!("{FLEET_FILE}.tmp")).exists());
    }

    #[test]
    fn upsert_replaces_matching_id_and_appends_new() {
        let dir = tempdir().unwrap();
        let store = ConfigStore::new(dir.path());
        store.save_fleet(&fleet(vec![machine("m1")])).unwrap();

        let mut updated = machine("m1");
        updated.name = "Renamed".to_string();
        let after = store.upsert_machine(updated).unwrap();
        assert_eq!(after.plc_machines.len(), 1);
        assert_eq!(after.plc_machines[0].name, "Renamed");

        let after = store.upsert_machine(machine("m2")).unwrap();
        assert_eq!(after.plc_machines.len(), 2);
    }

    #[test]
    fn upsert_on_a_fresh_store_starts_from_an_empty_fleet() {
        let dir = tempdir().unwrap();
        let store = ConfigStore::new(dir.path());

        let after = store.upsert_machine(machine("m7")).unwrap();
        assert_eq!(after.plc_machines.len(), 1);
        assert_eq!(after.plc_machines[0].id, "m7");
    }

    #[test]
    fn remove_unknown_machine_fails() {
        let dir = tempdir().unwrap();
        let store = ConfigStore::new(dir.path());
        store.save_fleet(&fleet(vec![machine("m1")])).unwrap();

        assert!(store.remove_machine("ghost").is_err());
        let after = store.remove_machine("m1").unwrap();
        assert!(after.plc_machines.is_empty());
    }

    #[test]
    fn validation_rules() {
        assert!(ConfigStore::validate_machine(&machine("m1")).0);

        let mut bad = machine("bad id");
        bad.id = "has space".to_string();
        assert!(!ConfigStore::validate_machine(&bad).0);

        let mut bad = machine("m1");
        bad.name = "  ".to_string();
        assert!(!ConfigStore::validate_machine(&bad).0);

        let mut bad = machine("m1");
        bad.ip = "300.1.1.1".to_string();
        assert!(!ConfigStore::validate_machine(&bad).0);

        let mut bad = machine("m1");
        bad.ip = "1.2.3".to_string();
        assert!(!ConfigStore::validate_machine(&bad).0);

        let mut bad = machine("m1");
        bad.port = 0;
        assert!(!ConfigStore::validate_machine(&bad).0);
    }
}

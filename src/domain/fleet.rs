//! The machine registry and its high-level operations.
//!
//! A [`Machine`] owns everything attached to one physical device: the
//! link, the two-tier mutex, the controller, and the most recent
//! snapshot. The [`FleetManager`] holds an immutable id map built once
//! at startup, so lookups never take a lock; all serialization happens
//! per device at its mutex. Requests for different machines proceed in
//! parallel.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;

use chrono::Utc;
use log::{info, warn};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::domain::controller::DeviceController;
use crate::domain::device_link::{DeviceLink, TcpDeviceLink};
use crate::domain::device_mutex::DeviceMutex;
use crate::domain::events::EventBus;
use crate::domain::poller::{self, DEFAULT_POLL_INTERVAL};
use crate::domain::simulator::DeviceSimulator;
use crate::logging::AuditTrail;
use crate::models::{
    AuditOutcome, ClientConnectionRecord, ClientRequestKind, FleetHealth, MachineConfig,
    MachineSummary, StatusSnapshot, CMD_MOVE, MAX_MOVE_POSITION,
};
use crate::utils::error::{AppError, AppResult};

/// Time allowed for background tasks to drain on shutdown.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct FleetOptions {
    pub poll_interval: Duration,
    /// Directory anchoring the cross-process device lock files.
    pub lock_dir: PathBuf,
}

impl Default for FleetOptions {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            lock_dir: std::env::temp_dir(),
        }
    }
}

/// Runtime state for one configured device.
pub struct Machine {
    pub config: MachineConfig,
    pub mutex: DeviceMutex,
    pub link: Arc<tokio::sync::Mutex<Box<dyn DeviceLink>>>,
    pub controller: DeviceController,
    last_snapshot: Arc<RwLock<Option<StatusSnapshot>>>,
    reachable: Arc<AtomicBool>,
}

impl Machine {
    /// Builds the machine with the link its configuration declares.
    pub fn new(config: MachineConfig, audit: Arc<AuditTrail>, lock_dir: &Path) -> Self {
        let link: Box<dyn DeviceLink> = if config.simulator {
            Box::new(DeviceSimulator::new(config.ip.clone(), config.port))
        } else {
            Box::new(TcpDeviceLink::new(config.ip.clone(), config.port))
        };
        Self::with_link(config, link, audit, lock_dir)
    }

    /// Builds the machine around an explicit link implementation.
    pub fn with_link(
        config: MachineConfig,
        link: Box<dyn DeviceLink>,
        audit: Arc<AuditTrail>,
        lock_dir: &Path,
    ) -> Self {
        let link = Arc::new(tokio::sync::Mutex::new(link));
        let last_snapshot = Arc::new(RwLock::new(None));
        let reachable = Arc::new(AtomicBool::new(false));
        let controller = DeviceController::new(
            config.id.clone(),
            config.ready_inverted,
            Arc::clone(&link),
            audit,
            Arc::clone(&last_snapshot),
            Arc::clone(&reachable),
        );

        Self {
            mutex: DeviceMutex::new(DeviceMutex::lock_path_for(lock_dir, &config.id)),
            link,
            controller,
            last_snapshot,
            reachable,
            config,
        }
    }

    pub fn store_snapshot(&self, snapshot: StatusSnapshot) {
        let mut cell = self
            .last_snapshot
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *cell = Some(snapshot);
    }

    /// Most recent snapshot seen by the poller or a controller call.
    pub fn last_snapshot(&self) -> Option<StatusSnapshot> {
        self.last_snapshot
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }
}

/// Registry of configured devices keyed by machine id.
pub struct FleetManager {
    machines: HashMap<String, Arc<Machine>>,
    /// Configuration order; the first entry serves the legacy
    /// single-device endpoints.
    order: Vec<String>,
    bus: EventBus,
    audit: Arc<AuditTrail>,
    options: FleetOptions,
    cancel: CancellationToken,
    pollers: StdMutex<Vec<JoinHandle<()>>>,
}

impl FleetManager {
    pub fn new(
        configs: &[MachineConfig],
        bus: EventBus,
        audit: Arc<AuditTrail>,
        options: FleetOptions,
    ) -> AppResult<Self> {
        if configs.is_empty() {
            return Err(AppError::configuration("no machines configured"));
        }

        let mut machines = HashMap::new();
        let mut order = Vec::new();
        for config in configs {
            if machines.contains_key(&config.id) {
                return Err(AppError::configuration(format!(
                    "duplicate machine id '{}'",
                    config.id
                )));
            }
            info!(
                "machine {} ({}) at {}:{} [{}]",
                config.id,
                config.name,
                config.ip,
                config.port,
                if config.simulator { "simulator" } else { "real" },
            );
            order.push(config.id.clone());
            machines.insert(
                config.id.clone(),
                Arc::new(Machine::new(
                    config.clone(),
                    Arc::clone(&audit),
                    &options.lock_dir,
                )),
            );
        }

        Ok(Self {
            machines,
            order,
            bus,
            audit,
            options,
            cancel: CancellationToken::new(),
            pollers: StdMutex::new(Vec::new()),
        })
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn machine_count(&self) -> usize {
        self.order.len()
    }

    pub fn machine_ids(&self) -> &[String] {
        &self.order
    }

    /// Target for the legacy single-device endpoints.
    pub fn first_machine_id(&self) -> &str {
        &self.order[0]
    }

    pub fn machine(&self, machine_id: &str) -> AppResult<&Arc<Machine>> {
        self.machines
            .get(machine_id)
            .ok_or_else(|| AppError::unknown_machine(machine_id))
    }

    pub fn list_machines(&self) -> Vec<MachineSummary> {
        self.order
            .iter()
            .filter_map(|id| self.machines.get(id))
            .map(|machine| MachineSummary::from_config(&machine.config))
            .collect()
    }

    pub fn machine_info(&self, machine_id: &str) -> AppResult<MachineSummary> {
        Ok(MachineSummary::from_config(&self.machine(machine_id)?.config))
    }

    /// Reads one machine's status on behalf of a client.
    pub async fn get_status(
        &self,
        machine_id: &str,
        client_addr: &str,
    ) -> AppResult<StatusSnapshot> {
        let machine = self.machine(machine_id)?;

        let result = async {
            let _guard = machine.mutex.acquire().await?;
            machine.controller.get_current_status().await
        }
        .await;

        self.audit_client(
            ClientRequestKind::StatusReq,
            client_addr,
            machine_id,
            None,
            None,
            &result,
        );
        result
    }

    /// Sends a validated command to one machine on behalf of a client.
    pub async fn send_command(
        &self,
        machine_id: &str,
        command: u8,
        argument: Option<u8>,
        client_addr: &str,
    ) -> AppResult<StatusSnapshot> {
        let machine = self.machine(machine_id)?;

        let result = async {
            let _guard = machine.mutex.acquire().await?;
            machine.controller.send_command(command, argument).await
        }
        .await;

        self.audit_client(
            ClientRequestKind::CommandReq,
            client_addr,
            machine_id,
            Some(command),
            argument,
            &result,
        );
        result
    }

    /// Moves one machine to a bucket on behalf of a client.
    pub async fn move_to(
        &self,
        machine_id: &str,
        position: u8,
        client_addr: &str,
    ) -> AppResult<StatusSnapshot> {
        let machine = self.machine(machine_id)?;
        if position > MAX_MOVE_POSITION {
            return Err(AppError::bad_command(format!(
                "position must be between 0 and {MAX_MOVE_POSITION}, got {position}"
            )));
        }

        let result = async {
            let _guard = machine.mutex.acquire().await?;
            machine.controller.move_to(position).await
        }
        .await;

        self.audit_client(
            ClientRequestKind::MoveReq,
            client_addr,
            machine_id,
            Some(CMD_MOVE),
            Some(position),
            &result,
        );
        result
    }

    /// Best-effort fleet summary; reads cached reachability flags and
    /// never contends on a device mutex.
    pub fn health(&self) -> FleetHealth {
        FleetHealth {
            machine_count: self.order.len(),
            machines: self
                .order
                .iter()
                .filter_map(|id| self.machines.get(id))
                .map(|machine| (machine.config.id.clone(), machine.reachable()))
                .collect(),
        }
    }

    /// Cached snapshots in configuration order, for the periodic
    /// broadcast. Never touches a device.
    pub fn cached_statuses(&self) -> Vec<(String, Option<StatusSnapshot>)> {
        self.order
            .iter()
            .filter_map(|id| self.machines.get(id))
            .map(|machine| (machine.config.id.clone(), machine.last_snapshot()))
            .collect()
    }

    /// Spawns one status poller per machine.
    pub fn start_pollers(&self) {
        let mut pollers = self
            .pollers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for id in &self.order {
            if let Some(machine) = self.machines.get(id) {
                pollers.push(poller::spawn(
                    Arc::clone(machine),
                    self.bus.clone(),
                    self.options.poll_interval,
                    self.cancel.child_token(),
                ));
            }
        }
    }

    /// Cancels the pollers, waits for them to drain, and closes every
    /// link. Tasks still running past the deadline are abandoned.
    pub async fn shutdown(&self) {
        info!("shutting down fleet manager");
        self.cancel.cancel();

        let handles: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self
                .pollers
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        let drain = futures::future::join_all(handles);
        if tokio::time::timeout(SHUTDOWN_DEADLINE, drain).await.is_err() {
            warn!("pollers did not stop within {SHUTDOWN_DEADLINE:?}, abandoning them");
        }

        for machine in self.machines.values() {
            match machine.link.try_lock() {
                Ok(mut link) => link.close().await,
                Err(_) => warn!(
                    "link for {} still busy at shutdown, leaving it to the OS",
                    machine.config.id
                ),
            }
        }
    }

    fn audit_client(
        &self,
        kind: ClientRequestKind,
        client_addr: &str,
        machine_id: &str,
        command: Option<u8>,
        argument: Option<u8>,
        result: &AppResult<StatusSnapshot>,
    ) {
        let (outcome, error) = match result {
            Ok(_) => (AuditOutcome::Ok, None),
            Err(e) => (AuditOutcome::Error, Some(e.to_string())),
        };
        self.audit.record_client(&ClientConnectionRecord {
            kind,
            client_addr: client_addr.to_string(),
            machine_id: machine_id.to_string(),
            command,
            argument,
            outcome,
            error,
            ts: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LoggingSettings;
    use tempfile::TempDir;

    fn sim_config(id: &str) -> MachineConfig {
        MachineConfig {
            id: id.to_string(),
            name: format!("Carousel {id}"),
            ip: "127.0.0.1".to_string(),
            port: 3200,
            simulator: true,
            description: None,
            ready_inverted: false,
        }
    }

    fn fleet(dir: &TempDir, ids: &[&str]) -> FleetManager {
        let audit = Arc::new(AuditTrail::open(dir.path(), &LoggingSettings::default()).unwrap());
        let configs: Vec<MachineConfig> = ids.iter().map(|id| sim_config(id)).collect();
        FleetManager::new(
            &configs,
            EventBus::default(),
            audit,
            FleetOptions {
                poll_interval: Duration::from_secs(5),
                lock_dir: dir.path().to_path_buf(),
            },
        )
        .unwrap()
    }

    #[test]
    fn rejects_empty_and_duplicate_configurations() {
        let dir = TempDir::new().unwrap();
        let audit = Arc::new(AuditTrail::open(dir.path(), &LoggingSettings::default()).unwrap());

        let empty = FleetManager::new(
            &[],
            EventBus::default(),
            Arc::clone(&audit),
            FleetOptions::default(),
        );
        assert!(empty.is_err());

        let duplicated = FleetManager::new(
            &[sim_config("m1"), sim_config("m1")],
            EventBus::default(),
            audit,
            FleetOptions::default(),
        );
        assert!(duplicated.is_err());
    }

    #[tokio::test]
    async fn lists_machines_in_configuration_order() {
        let dir = TempDir::new().unwrap();
        let fleet = fleet(&dir, &["m2", "m1"]);

        let listed = fleet.list_machines();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, "m2");
        assert_eq!(listed[1].id, "m1");
        assert_eq!(fleet.first_machine_id(), "m2");
    }

    #[tokio::test]
    async fn unknown_machine_is_a_bad_request() {
        let dir = TempDir::new().unwrap();
        let fleet = fleet(&dir, &["m1"]);

        let err = fleet.get_status("ghost", "test").await.unwrap_err();
        assert!(matches!(err, AppError::UnknownMachine { .. }));
        assert_eq!(err.error_code(), "BAD_REQUEST");
    }

    #[tokio::test]
    async fn status_request_is_audited_with_client_address() {
        let dir = TempDir::new().unwrap();
        let fleet = fleet(&dir, &["m1"]);

        fleet
            .get_status("m1", "192.168.1.77:50000")
            .await
            .unwrap();

        let log = std::fs::read_to_string(dir.path().join("client_connections.log")).unwrap();
        assert!(log.contains("STATUS_REQ"));
        assert!(log.contains("client: 192.168.1.77:50000"));
        assert!(log.contains("machine: m1"));
        assert!(log.contains("outcome: OK"));
    }

    #[tokio::test(start_paused = true)]
    async fn held_mutex_makes_requests_busy() {
        let dir = TempDir::new().unwrap();
        let fleet = fleet(&dir, &["m1"]);

        let machine = Arc::clone(fleet.machine("m1").unwrap());
        let _held = machine.mutex.acquire().await.unwrap();

        let err = fleet.get_status("m1", "test").await.unwrap_err();
        assert_eq!(err.error_code(), "PLC_BUSY");
    }

    #[tokio::test(start_paused = true)]
    async fn move_validates_position_before_touching_the_device() {
        let dir = TempDir::new().unwrap();
        let fleet = fleet(&dir, &["m1"]);

        let err = fleet.move_to("m1", 12, "test").await.unwrap_err();
        assert_eq!(err.error_code(), "BAD_COMMAND");

        let moved = fleet.move_to("m1", 4, "test").await.unwrap();
        assert_eq!(moved.position, 4);
    }

    #[tokio::test]
    async fn health_never_blocks_and_counts_machines() {
        let dir = TempDir::new().unwrap();
        let fleet = fleet(&dir, &["m1", "m2"]);

        let machine = Arc::clone(fleet.machine("m1").unwrap());
        let _held = machine.mutex.acquire().await.unwrap();

        let health = fleet.health();
        assert_eq!(health.machine_count, 2);
        assert_eq!(health.machines.len(), 2);
        assert!(!health.machines["m1"]);
    }

    #[tokio::test]
    async fn shutdown_drains_pollers() {
        let dir = TempDir::new().unwrap();
        let fleet = fleet(&dir, &["m1"]);
        fleet.start_pollers();

        tokio::time::timeout(Duration::from_secs(2), fleet.shutdown())
            .await
            .expect("shutdown exceeded its deadline");
    }
}

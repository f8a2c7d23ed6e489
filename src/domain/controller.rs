//! High-level operations on one device.
//!
//! Every operation captures a best-effort status before and after the
//! command, appends an operation record to the audit trail, and returns
//! the decoded snapshot. Failures keep their kind; the controller only
//! adds machine context. It never retries: the link already did, and a
//! retry here would bypass the audit of the first attempt.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use chrono::Utc;
use log::debug;

use crate::domain::device_link::DeviceLink;
use crate::logging::AuditTrail;
use crate::models::{
    AuditOutcome, OperationRecord, StatusSnapshot, CMD_MOVE, CMD_STATUS, MAX_MOVE_POSITION,
};
use crate::utils::error::{AppError, AppResult};

type SharedLink = Arc<tokio::sync::Mutex<Box<dyn DeviceLink>>>;
type SnapshotCell = Arc<RwLock<Option<StatusSnapshot>>>;

pub struct DeviceController {
    machine_id: String,
    ready_inverted: bool,
    link: SharedLink,
    audit: Arc<AuditTrail>,
    last_snapshot: SnapshotCell,
    reachable: Arc<AtomicBool>,
}

impl DeviceController {
    pub fn new(
        machine_id: impl Into<String>,
        ready_inverted: bool,
        link: SharedLink,
        audit: Arc<AuditTrail>,
        last_snapshot: SnapshotCell,
        reachable: Arc<AtomicBool>,
    ) -> Self {
        Self {
            machine_id: machine_id.into(),
            ready_inverted,
            link,
            audit,
            last_snapshot,
            reachable,
        }
    }

    /// Reads the device state with a STATUS exchange.
    pub async fn get_current_status(&self) -> AppResult<StatusSnapshot> {
        self.send_command(CMD_STATUS, None).await
    }

    /// Sends one command and returns the decoded response snapshot.
    pub async fn send_command(
        &self,
        command: u8,
        argument: Option<u8>,
    ) -> AppResult<StatusSnapshot> {
        let mut link = self.link.lock().await;
        let link = link.as_mut();

        // STATUS is its own before/after; anything else gets bracketed
        // by best-effort STATUS reads for the audit record.
        let status_before = if command == CMD_STATUS {
            None
        } else {
            self.peek_status(&mut *link).await
        };

        debug!(
            "[{}] sending command {command}, argument {argument:?}",
            self.machine_id
        );

        match link.transact(command, argument).await {
            Ok(response) => {
                let snapshot =
                    StatusSnapshot::capture(response.raw, response.position, self.ready_inverted);
                if !response.extra.is_empty() {
                    debug!(
                        "[{}] trailing diagnostic bytes: {:?}",
                        self.machine_id, response.extra
                    );
                }

                let status_after = if command == CMD_STATUS {
                    Some(snapshot.clone())
                } else {
                    self.peek_status(&mut *link).await
                };

                self.store(&snapshot);
                self.audit.record_operation(&OperationRecord {
                    machine_id: self.machine_id.clone(),
                    command,
                    argument,
                    status_before,
                    status_after,
                    outcome: AuditOutcome::Ok,
                    error: None,
                    ts: Utc::now(),
                });

                Ok(snapshot)
            }
            Err(e) => {
                self.reachable.store(false, Ordering::SeqCst);
                let e = e.contextualize(format!("machine {}", self.machine_id));
                self.audit.record_operation(&OperationRecord {
                    machine_id: self.machine_id.clone(),
                    command,
                    argument,
                    status_before,
                    status_after: None,
                    outcome: AuditOutcome::Error,
                    error: Some(e.to_string()),
                    ts: Utc::now(),
                });
                Err(e)
            }
        }
    }

    /// Moves the carousel to a bucket in `0..=9`.
    pub async fn move_to(&self, position: u8) -> AppResult<StatusSnapshot> {
        if position > MAX_MOVE_POSITION {
            return Err(AppError::bad_command(format!(
                "position must be between 0 and {MAX_MOVE_POSITION}, got {position}"
            )));
        }
        self.send_command(CMD_MOVE, Some(position)).await
    }

    /// Best-effort STATUS read; absence is not an error.
    async fn peek_status(&self, link: &mut dyn DeviceLink) -> Option<StatusSnapshot> {
        link.transact(CMD_STATUS, None)
            .await
            .ok()
            .map(|r| StatusSnapshot::capture(r.raw, r.position, self.ready_inverted))
    }

    fn store(&self, snapshot: &StatusSnapshot) {
        self.reachable.store(true, Ordering::SeqCst);
        let mut cell = self
            .last_snapshot
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *cell = Some(snapshot.clone());
    }
}

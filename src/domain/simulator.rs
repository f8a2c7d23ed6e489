//! Pin-compatible stand-in for a real carousel PLC.
//!
//! Used for demos and as the in-crate test device. Holds a position and
//! a status byte; a MOVE takes two simulated seconds with the RUN bit
//! raised, and a second MOVE arriving meanwhile is refused busy, the
//! same way the hardware refuses commands mid-cycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use rand::Rng;
use tokio::time::sleep;

use crate::models::{WireResponse, CMD_MOVE, CMD_STATUS, MAX_MOVE_POSITION};
use crate::utils::error::{AppError, AppResult};

const RUN_BIT: u8 = 0b0000_0010;
const READY_BIT: u8 = 0b0000_0001;
/// Alarm, estop, VFD, and positioning-error bits; READY requires all clear.
const FAULT_MASK: u8 = 0b0111_1100;

/// Simulated travel time for one MOVE.
const MOVE_DURATION: Duration = Duration::from_secs(2);

/// Clears the moving flag even when the move future is cancelled
/// mid-sleep.
struct MoveGuard(Arc<AtomicBool>);

impl Drop for MoveGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct DeviceSimulator {
    ip: String,
    port: u16,
    connected: bool,
    position: u8,
    raw: u8,
    moving: Arc<AtomicBool>,
    /// Frame staged by `send`, consumed by `receive`.
    pending: Option<(u8, Option<u8>)>,
}

impl DeviceSimulator {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
            connected: false,
            position: rand::thread_rng().gen_range(0..=MAX_MOVE_POSITION),
            raw: 0,
            moving: Arc::new(AtomicBool::new(false)),
            pending: None,
        }
    }

    fn response(&self) -> WireResponse {
        WireResponse {
            raw: self.raw,
            position: self.position,
            extra: Vec::new(),
        }
    }

    /// Synthesizes a fresh status byte: roughly a 30 % chance of being
    /// mid-movement, READY only when stopped with no fault bits.
    fn generate_status(&mut self) -> u8 {
        let mut rng = rand::thread_rng();
        let mut raw: u8 = rng.gen();

        let running = rng.gen_bool(0.3);
        if running {
            raw |= RUN_BIT;
        } else {
            raw &= !RUN_BIT;
        }
        self.moving.store(running, Ordering::SeqCst);

        if !running && raw & FAULT_MASK == 0 {
            raw |= READY_BIT;
        } else {
            raw &= !READY_BIT;
        }

        self.raw = raw;
        raw
    }

    async fn respond(&mut self, command: u8, argument: Option<u8>) -> AppResult<WireResponse> {
        debug!(
            "simulator {}:{} received command {command}, argument {argument:?}",
            self.ip, self.port
        );

        match command {
            CMD_STATUS => Ok(self.response()),
            CMD_MOVE => {
                if self.moving.load(Ordering::SeqCst) {
                    return Err(AppError::plc_busy("carousel already moving"));
                }
                let target = argument.unwrap_or(0);

                self.moving.store(true, Ordering::SeqCst);
                let _guard = MoveGuard(Arc::clone(&self.moving));
                self.raw |= RUN_BIT;
                info!(
                    "simulator {}:{} moving to bucket {target}",
                    self.ip, self.port
                );
                sleep(MOVE_DURATION).await;

                self.position = target;
                self.raw &= !RUN_BIT;
                Ok(self.response())
            }
            _ => {
                self.generate_status();
                Ok(self.response())
            }
        }
    }

    #[cfg(test)]
    fn force_moving(&self, moving: bool) {
        self.moving.store(moving, Ordering::SeqCst);
    }
}

#[async_trait]
impl super::device_link::DeviceLink for DeviceSimulator {
    async fn connect(&mut self) -> AppResult<()> {
        debug!("simulator {}:{} connected", self.ip, self.port);
        self.connected = true;
        Ok(())
    }

    async fn close(&mut self) {
        debug!("simulator {}:{} closed", self.ip, self.port);
        self.connected = false;
        self.pending = None;
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn send(&mut self, command: u8, argument: Option<u8>) -> AppResult<()> {
        if !self.connected {
            return Err(AppError::plc_conn("no active connection"));
        }
        self.pending = Some((command, argument));
        Ok(())
    }

    async fn receive(&mut self) -> AppResult<WireResponse> {
        let (command, argument) = self
            .pending
            .take()
            .ok_or_else(|| AppError::plc_conn("nothing to receive: no command sent"))?;
        self.respond(command, argument).await
    }

    async fn transact(&mut self, command: u8, argument: Option<u8>) -> AppResult<WireResponse> {
        self.connect().await?;
        self.respond(command, argument).await
    }
}

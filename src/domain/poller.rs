//! Per-machine background status polling.
//!
//! Each machine gets one task that periodically takes the device mutex,
//! reads status, and publishes a snapshot to the event bus only when the
//! state changed. Connection health transitions become bus events; an
//! error never escapes the task. Cancellation is observed at every
//! suspension point, so shutdown is prompt.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::domain::events::{EventBus, PlcEvent};
use crate::domain::fleet::Machine;
use crate::models::{StatusSnapshot, CMD_STATUS};
use crate::utils::error::AppResult;

/// Default pause between poll rounds; deployments may go as low as 1 s.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Consecutive failures before the poller drops its connected
/// assumption and goes through an explicit reconnect cycle.
const MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// Spawns the polling task for one machine.
pub fn spawn(
    machine: Arc<Machine>,
    bus: EventBus,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(run(machine, bus, interval, cancel))
}

async fn run(machine: Arc<Machine>, bus: EventBus, interval: Duration, cancel: CancellationToken) {
    let machine_id = machine.config.id.clone();
    info!("status poller for {machine_id} started (interval {interval:?})");

    let mut last_published: Option<StatusSnapshot> = None;
    let mut consecutive_failures = 0u32;
    let mut connected = false;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        let guard = tokio::select! {
            _ = cancel.cancelled() => break,
            acquired = machine.mutex.acquire() => match acquired {
                Ok(guard) => guard,
                Err(_) => {
                    debug!("poller for {machine_id} found the device busy");
                    bus.publish(PlcEvent::StatusBusy {
                        machine_id: machine_id.clone(),
                    });
                    continue;
                }
            }
        };

        let outcome = tokio::select! {
            _ = cancel.cancelled() => {
                drop(guard);
                break;
            }
            polled = poll_once(&machine, &bus, &machine_id, &mut connected) => polled,
        };
        drop(guard);

        match outcome {
            Ok(snapshot) => {
                consecutive_failures = 0;
                machine.store_snapshot(snapshot.clone());

                let changed = last_published
                    .as_ref()
                    .map_or(true, |previous| !previous.same_state(&snapshot));
                if changed {
                    bus.publish(PlcEvent::StatusUpdate {
                        machine_id: machine_id.clone(),
                        snapshot: snapshot.clone(),
                    });
                    last_published = Some(snapshot);
                }
            }
            Err(e) => {
                consecutive_failures += 1;
                warn!("poll of {machine_id} failed ({consecutive_failures} in a row): {e}");
                bus.publish(PlcEvent::ConnError {
                    machine_id: machine_id.clone(),
                    reason: e.to_string(),
                });
                if consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                    // Force a reconnect cycle, and make sure the first
                    // post-recovery snapshot is published even when it
                    // equals the pre-outage one.
                    connected = false;
                    last_published = None;
                }
            }
        }
    }

    info!("status poller for {machine_id} stopped");
}

/// One poll round under the device mutex.
async fn poll_once(
    machine: &Machine,
    bus: &EventBus,
    machine_id: &str,
    connected: &mut bool,
) -> AppResult<StatusSnapshot> {
    let mut link = machine.link.lock().await;

    if !*connected || !link.is_connected() {
        bus.publish(PlcEvent::Reconnecting {
            machine_id: machine_id.to_string(),
        });
        if let Err(e) = link.connect().await {
            machine.set_reachable(false);
            return Err(e);
        }
        *connected = true;
        bus.publish(PlcEvent::Reconnected {
            machine_id: machine_id.to_string(),
        });
    }

    match link.transact(CMD_STATUS, None).await {
        Ok(response) => {
            machine.set_reachable(true);
            Ok(StatusSnapshot::capture(
                response.raw,
                response.position,
                machine.config.ready_inverted,
            ))
        }
        Err(e) => {
            machine.set_reachable(false);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::device_link::DeviceLink;
    use crate::domain::fleet::Machine;
    use crate::logging::AuditTrail;
    use crate::models::{LoggingSettings, MachineConfig, WireResponse};
    use crate::utils::error::AppError;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;
    use tokio::sync::broadcast::Receiver;

    /// Step fed to the scripted link: a frame to answer, or a failure.
    type Step = Result<(u8, u8), ()>;

    struct ScriptLink {
        steps: Arc<StdMutex<VecDeque<Step>>>,
        connected: bool,
        refuse_connect: bool,
    }

    #[async_trait]
    impl DeviceLink for ScriptLink {
        async fn connect(&mut self) -> crate::AppResult<()> {
            if self.refuse_connect {
                return Err(AppError::plc_conn("connection refused"));
            }
            self.connected = true;
            Ok(())
        }

        async fn close(&mut self) {
            self.connected = false;
        }

        fn is_connected(&self) -> bool {
            self.connected
        }

        async fn send(&mut self, _command: u8, _argument: Option<u8>) -> crate::AppResult<()> {
            Ok(())
        }

        async fn receive(&mut self) -> crate::AppResult<WireResponse> {
            Err(AppError::plc_conn("not scripted"))
        }

        async fn transact(
            &mut self,
            _command: u8,
            _argument: Option<u8>,
        ) -> crate::AppResult<WireResponse> {
            let step = self
                .steps
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(()));
            match step {
                Ok((raw, position)) => Ok(WireResponse {
                    raw,
                    position,
                    extra: Vec::new(),
                }),
                Err(()) => {
                    self.connected = false;
                    Err(AppError::plc_conn("scripted failure"))
                }
            }
        }
    }

    fn config() -> MachineConfig {
        MachineConfig {
            id: "m1".to_string(),
            name: "Main".to_string(),
            ip: "127.0.0.1".to_string(),
            port: 3200,
            simulator: true,
            description: None,
            ready_inverted: false,
        }
    }

    fn scripted_machine(dir: &TempDir, steps: Vec<Step>) -> Arc<Machine> {
        let audit = Arc::new(AuditTrail::open(dir.path(), &LoggingSettings::default()).unwrap());
        let link = ScriptLink {
            steps: Arc::new(StdMutex::new(steps.into())),
            connected: false,
            refuse_connect: false,
        };
        Arc::new(Machine::with_link(
            config(),
            Box::new(link),
            audit,
            dir.path(),
        ))
    }

    async fn drain_until_update(rx: &mut Receiver<PlcEvent>) -> Vec<PlcEvent> {
        let mut seen = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for events")
                .unwrap();
            let is_update = matches!(event, PlcEvent::StatusUpdate { .. });
            seen.push(event);
            if is_update {
                return seen;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn publishes_once_per_state_and_reconnect_events() {
        let dir = TempDir::new().unwrap();
        // Three identical statuses, then a new position.
        let machine = scripted_machine(
            &dir,
            vec![Ok((1, 2)), Ok((1, 2)), Ok((1, 2)), Ok((1, 5))],
        );
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let cancel = CancellationToken::new();

        let handle = spawn(
            Arc::clone(&machine),
            bus.clone(),
            Duration::from_millis(10),
            cancel.clone(),
        );

        // First cycle announces the initial connect, then the update.
        let events = drain_until_update(&mut rx).await;
        assert!(matches!(events[0], PlcEvent::Reconnecting { .. }));
        assert!(matches!(events[1], PlcEvent::Reconnected { .. }));
        match events.last() {
            Some(PlcEvent::StatusUpdate { snapshot, .. }) => assert_eq!(snapshot.position, 2),
            other => panic!("expected status update, got {other:?}"),
        }

        // Identical statuses publish nothing; the next event is the
        // changed position.
        match tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap()
        {
            PlcEvent::StatusUpdate { snapshot, .. } => assert_eq!(snapshot.position, 5),
            other => panic!("expected status update, got {other:?}"),
        }

        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(machine.last_snapshot().unwrap().position, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn outage_emits_conn_errors_then_republishes_after_recovery() {
        let dir = TempDir::new().unwrap();
        // One good round, three failures, then the same state again.
        let machine = scripted_machine(
            &dir,
            vec![Ok((1, 2)), Err(()), Err(()), Err(()), Ok((1, 2))],
        );
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let cancel = CancellationToken::new();

        let handle = spawn(
            Arc::clone(&machine),
            bus.clone(),
            Duration::from_millis(10),
            cancel.clone(),
        );

        drain_until_update(&mut rx).await;

        let mut conn_errors = 0;
        let mut reconnects = 0;
        loop {
            match tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap()
            {
                PlcEvent::ConnError { .. } => conn_errors += 1,
                PlcEvent::Reconnected { .. } => reconnects += 1,
                PlcEvent::Reconnecting { .. } => {}
                PlcEvent::StatusUpdate { snapshot, .. } => {
                    // Same bytes as before the outage, still republished.
                    assert_eq!(snapshot.position, 2);
                    break;
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(conn_errors, 3);
        assert!(reconnects >= 1);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn cancellation_stops_the_task_promptly() {
        let dir = TempDir::new().unwrap();
        let machine = scripted_machine(&dir, vec![Ok((1, 2))]);
        let bus = EventBus::default();
        let cancel = CancellationToken::new();

        let handle = spawn(machine, bus, Duration::from_secs(3600), cancel.clone());
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("poller did not observe cancellation")
            .unwrap();
    }
}

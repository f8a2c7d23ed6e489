//! Real-time event stream.
//!
//! Duplex WebSocket channel: the server pushes bus events and a 2-second
//! `status_broadcast` composed from the pollers' cached snapshots;
//! peers may ping, subscribe, request status, and issue commands. Every
//! message is a self-contained JSON object with an ISO-8601 timestamp.
//! A command echo reaches every other subscriber strictly after the
//! originating peer's `command_result`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::Response;
use chrono::Utc;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::domain::{FleetManager, PlcEvent};
use crate::models::status::{validate_argument, validate_command};
use crate::SERVER_VERSION;

use super::ApiState;

/// Cadence of the process-global status broadcast loop.
const BROADCAST_INTERVAL: Duration = Duration::from_secs(2);

/// What a peer is subscribed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubscriptionTopic {
    StatusUpdates,
    None,
}

impl SubscriptionTopic {
    fn parse(raw: Option<&str>) -> (Self, &'static str) {
        match raw {
            Some("none") => (Self::None, "none"),
            _ => (Self::StatusUpdates, "status_updates"),
        }
    }
}

/// Connected peers, shared between the per-peer tasks and the broadcast
/// loop.
#[derive(Debug, Clone, Default)]
pub struct PeerRegistry {
    inner: Arc<tokio::sync::RwLock<HashMap<Uuid, PeerHandle>>>,
}

#[derive(Debug, Clone)]
struct PeerHandle {
    addr: String,
    tx: mpsc::UnboundedSender<String>,
}

impl PeerRegistry {
    async fn register(&self, id: Uuid, addr: String, tx: mpsc::UnboundedSender<String>) -> usize {
        let mut peers = self.inner.write().await;
        peers.insert(id, PeerHandle { addr, tx });
        peers.len()
    }

    async fn unregister(&self, id: Uuid) -> usize {
        let mut peers = self.inner.write().await;
        peers.remove(&id);
        peers.len()
    }

    pub async fn count(&self) -> usize {
        self.inner.read().await.len()
    }

    /// Queues a payload to every peer, reaping the ones whose channel
    /// is gone.
    async fn broadcast(&self, payload: &str) {
        let dead: Vec<Uuid> = {
            let peers = self.inner.read().await;
            peers
                .iter()
                .filter(|(_, peer)| peer.tx.send(payload.to_string()).is_err())
                .map(|(id, _)| *id)
                .collect()
        };
        if !dead.is_empty() {
            let mut peers = self.inner.write().await;
            for id in dead {
                peers.remove(&id);
            }
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Ping,
    Subscribe {
        #[serde(default)]
        subscription_type: Option<String>,
    },
    GetStatus {
        #[serde(default)]
        machine_id: Option<String>,
    },
    SendCommand {
        #[serde(default)]
        command: Option<i64>,
        #[serde(default)]
        argument: Option<i64>,
        #[serde(default)]
        machine_id: Option<String>,
    },
}

fn timestamp() -> String {
    Utc::now().to_rfc3339()
}

fn error_message(error: impl std::fmt::Display) -> Value {
    json!({
        "type": "error",
        "error": error.to_string(),
        "timestamp": timestamp(),
    })
}

fn welcome_message(fleet: &FleetManager) -> Value {
    let multi = fleet.machine_count() > 1;
    let mut message = json!({
        "type": "welcome",
        "mode": if multi { "multi-plc" } else { "single-plc" },
        "server_info": {
            "version": SERVER_VERSION,
            "capabilities": ["status_updates", "command_execution", "real_time_notifications"],
        },
        "timestamp": timestamp(),
    });
    if multi {
        message["machines"] = json!(fleet.list_machines());
    }
    message
}

/// Composes the periodic broadcast from cached snapshots only; machines
/// that have never been polled appear as an error entry.
fn status_broadcast_message(fleet: &FleetManager) -> Value {
    let mut statuses = serde_json::Map::new();
    for (machine_id, snapshot) in fleet.cached_statuses() {
        let entry = match snapshot {
            Some(snapshot) => snapshot.to_json(),
            None => json!({"error": "status not yet available"}),
        };
        statuses.insert(machine_id, entry);
    }
    json!({
        "type": "status_broadcast",
        "status": Value::Object(statuses),
        "timestamp": timestamp(),
    })
}

/// Translates a bus event into the message for one peer, or `None` when
/// the peer should not receive it.
fn event_message(peer_addr: &str, topic: SubscriptionTopic, event: &PlcEvent) -> Option<Value> {
    match event {
        PlcEvent::StatusUpdate {
            machine_id,
            snapshot,
        } if topic == SubscriptionTopic::StatusUpdates => Some(json!({
            "type": "status_update",
            "machine_id": machine_id,
            "status": snapshot.to_json(),
            "timestamp": timestamp(),
        })),
        PlcEvent::StatusBusy { machine_id } if topic == SubscriptionTopic::StatusUpdates => {
            Some(json!({
                "type": "status_busy",
                "machine_id": machine_id,
                "timestamp": timestamp(),
            }))
        }
        PlcEvent::Reconnecting { machine_id } if topic == SubscriptionTopic::StatusUpdates => {
            Some(json!({
                "type": "reconnecting",
                "machine_id": machine_id,
                "timestamp": timestamp(),
            }))
        }
        PlcEvent::Reconnected { machine_id } if topic == SubscriptionTopic::StatusUpdates => {
            Some(json!({
                "type": "reconnected",
                "machine_id": machine_id,
                "timestamp": timestamp(),
            }))
        }
        PlcEvent::ConnError { machine_id, reason }
            if topic == SubscriptionTopic::StatusUpdates =>
        {
            Some(json!({
                "type": "connection_error",
                "machine_id": machine_id,
                "error": reason,
                "timestamp": timestamp(),
            }))
        }
        // The issuing peer already got its command_result; everyone
        // else learns about the command here.
        PlcEvent::CommandEcho {
            machine_id,
            command,
            argument,
            client_addr,
        } if client_addr.as_str() != peer_addr => Some(json!({
            "type": "command_executed",
            "machine_id": machine_id,
            "command": command,
            "argument": argument,
            "timestamp": timestamp(),
        })),
        _ => None,
    }
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    ws.on_upgrade(move |socket| handle_peer(socket, state, addr))
}

async fn handle_peer(socket: WebSocket, state: ApiState, addr: SocketAddr) {
    let peer_id = Uuid::new_v4();
    let peer_addr = addr.to_string();
    let (mut sink, mut stream) = socket.split();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let total = state.peers.register(peer_id, peer_addr.clone(), tx).await;
    info!("event-stream peer connected: {peer_addr} ({total} total)");

    let mut bus_rx = state.fleet.bus().subscribe();
    let mut topic = SubscriptionTopic::StatusUpdates;

    let welcome = welcome_message(&state.fleet);
    if send_json(&mut sink, &welcome).await.is_ok() {
        loop {
            tokio::select! {
                _ = state.cancel.cancelled() => break,
                incoming = stream.next() => match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match handle_client_message(
                            &mut sink,
                            &state,
                            &peer_addr,
                            &mut topic,
                            text.as_str(),
                        )
                        .await
                        {
                            Ok(()) => {}
                            Err(_) => break,
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!("event-stream peer {peer_addr} transport error: {e}");
                        break;
                    }
                },
                queued = rx.recv() => match queued {
                    Some(payload) => {
                        if sink.send(Message::Text(payload.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                event = bus_rx.recv() => match event {
                    Ok(event) => {
                        if let Some(message) = event_message(&peer_addr, topic, &event) {
                            if send_json(&mut sink, &message).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("event-stream peer {peer_addr} lagged, skipped {skipped} events");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
    }

    let total = state.peers.unregister(peer_id).await;
    info!("event-stream peer disconnected: {peer_addr} ({total} total)");
}

type WsSink = SplitSink<WebSocket, Message>;

async fn send_json(sink: &mut WsSink, message: &Value) -> Result<(), axum::Error> {
    sink.send(Message::Text(message.to_string().into())).await
}

async fn handle_client_message(
    sink: &mut WsSink,
    state: &ApiState,
    peer_addr: &str,
    topic: &mut SubscriptionTopic,
    raw: &str,
) -> Result<(), axum::Error> {
    let parsed: Result<ClientMessage, _> = serde_json::from_str(raw);
    let message = match parsed {
        Ok(message) => message,
        Err(e) => {
            debug!("unparseable message from {peer_addr}: {e}");
            return send_json(sink, &error_message("invalid or unrecognized message")).await;
        }
    };

    match message {
        ClientMessage::Ping => {
            send_json(sink, &json!({"type": "pong", "timestamp": timestamp()})).await
        }
        ClientMessage::Subscribe { subscription_type } => {
            let (parsed, confirmed) = SubscriptionTopic::parse(subscription_type.as_deref());
            *topic = parsed;
            send_json(
                sink,
                &json!({
                    "type": "subscription_confirmed",
                    "subscription_type": confirmed,
                    "timestamp": timestamp(),
                }),
            )
            .await
        }
        ClientMessage::GetStatus { machine_id } => {
            handle_status_request(sink, state, peer_addr, machine_id).await
        }
        ClientMessage::SendCommand {
            command,
            argument,
            machine_id,
        } => handle_command_request(sink, state, peer_addr, command, argument, machine_id).await,
    }
}

async fn handle_status_request(
    sink: &mut WsSink,
    state: &ApiState,
    peer_addr: &str,
    machine_id: Option<String>,
) -> Result<(), axum::Error> {
    match machine_id {
        Some(machine_id) => match state.fleet.get_status(&machine_id, peer_addr).await {
            Ok(snapshot) => {
                send_json(
                    sink,
                    &json!({
                        "type": "machine_status",
                        "machine_id": machine_id,
                        "status": snapshot.to_json(),
                        "timestamp": timestamp(),
                    }),
                )
                .await
            }
            Err(e) => send_json(sink, &error_message(format!("error getting status: {e}"))).await,
        },
        None if state.fleet.machine_count() > 1 => {
            let mut statuses = serde_json::Map::new();
            for machine_id in state.fleet.machine_ids().to_vec() {
                let entry = match state.fleet.get_status(&machine_id, peer_addr).await {
                    Ok(snapshot) => snapshot.to_json(),
                    Err(e) => json!({"error": e.to_string()}),
                };
                statuses.insert(machine_id, entry);
            }
            send_json(
                sink,
                &json!({
                    "type": "all_machines_status",
                    "status": Value::Object(statuses),
                    "timestamp": timestamp(),
                }),
            )
            .await
        }
        None => {
            let machine_id = state.fleet.first_machine_id().to_string();
            match state.fleet.get_status(&machine_id, peer_addr).await {
                Ok(snapshot) => {
                    send_json(
                        sink,
                        &json!({
                            "type": "status",
                            "status": snapshot.to_json(),
                            "timestamp": timestamp(),
                        }),
                    )
                    .await
                }
                Err(e) => {
                    send_json(sink, &error_message(format!("error getting status: {e}"))).await
                }
            }
        }
    }
}

async fn handle_command_request(
    sink: &mut WsSink,
    state: &ApiState,
    peer_addr: &str,
    command: Option<i64>,
    argument: Option<i64>,
    machine_id: Option<String>,
) -> Result<(), axum::Error> {
    let Some(command) = command else {
        return send_json(sink, &error_message("command not specified")).await;
    };
    let command = match validate_command(command) {
        Ok(command) => command,
        Err(e) => return send_json(sink, &error_message(e)).await,
    };
    let argument = match argument.map(validate_argument).transpose() {
        Ok(argument) => argument,
        Err(e) => return send_json(sink, &error_message(e)).await,
    };
    let machine_id =
        machine_id.unwrap_or_else(|| state.fleet.first_machine_id().to_string());

    let result = state
        .fleet
        .send_command(&machine_id, command, argument, peer_addr)
        .await;

    let result_payload = match &result {
        Ok(snapshot) => json!({
            "success": true,
            "data": snapshot.to_json(),
            "error": Value::Null,
            "code": Value::Null,
        }),
        Err(e) => json!({
            "success": false,
            "data": Value::Null,
            "error": e.to_string(),
            "code": e.error_code(),
        }),
    };

    // The caller's reply goes out before the echo is published, so
    // other subscribers observe the echo strictly after it.
    send_json(
        sink,
        &json!({
            "type": "command_result",
            "machine_id": machine_id,
            "command": command,
            "argument": argument,
            "result": result_payload,
            "timestamp": timestamp(),
        }),
    )
    .await?;

    if result.is_ok() {
        state.fleet.bus().publish(PlcEvent::CommandEcho {
            machine_id,
            command,
            argument,
            client_addr: peer_addr.to_string(),
        });
    }

    Ok(())
}

/// Process-global broadcast loop: every 2 seconds, push a best-effort
/// snapshot of every machine to every connected peer.
pub fn spawn_status_broadcast(state: ApiState) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(BROADCAST_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = state.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if state.peers.count().await == 0 {
                continue;
            }
            let payload = status_broadcast_message(&state.fleet).to_string();
            state.peers.broadcast(&payload).await;
        }
        debug!("status broadcast loop stopped");
    })
}

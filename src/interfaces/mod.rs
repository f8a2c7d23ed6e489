//! Transport surfaces: the HTTP command API and the WebSocket event
//! stream. Both are thin projections over the fleet manager and share
//! one state value.

pub mod http;
pub mod ws;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::get;
use axum::Router;
use tokio_util::sync::CancellationToken;

use crate::domain::FleetManager;

#[derive(Clone)]
pub struct ApiState {
    pub fleet: Arc<FleetManager>,
    pub peers: ws::PeerRegistry,
    pub cancel: CancellationToken,
}

impl ApiState {
    pub fn new(fleet: Arc<FleetManager>, cancel: CancellationToken) -> Self {
        Self {
            fleet,
            peers: ws::PeerRegistry::default(),
            cancel,
        }
    }
}

/// Combined router: command API plus the event stream at `/ws`.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .merge(http::routes())
        .route("/ws", get(ws::ws_handler))
        .layer(DefaultBodyLimit::max(http::MAX_BODY_BYTES))
        .with_state(state)
}

/// Event-stream-only router for the standalone server.
pub fn ws_router(state: ApiState) -> Router {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
}

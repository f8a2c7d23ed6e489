//! Library crate for the carousel fleet server.
//!
//! Mediates between warehouse clients and a fleet of vertical carousel
//! storage machines driven by binary-protocol PLCs. The core is the fleet
//! manager and its collaborators (device links, per-device exclusion,
//! status polling, event fan-out); the HTTP command API and the WebSocket
//! event stream are thin projections of it.

pub mod config;
pub mod domain;
pub mod interfaces;
pub mod logging;
pub mod models;
pub mod utils;

pub use utils::error::{AppError, AppResult};

/// Server version reported in welcome messages and health payloads.
pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

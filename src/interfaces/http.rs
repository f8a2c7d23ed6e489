//! HTTP command API.
//!
//! All responses share the envelope
//! `{success, data, error, code, machine_id?}`. Machine-scoped routes
//! take the id as a path parameter; the legacy `/v1/status` and
//! `/v1/command` routes operate on the first configured machine, with
//! `/v1/command` also accepting a machine id in the body.

use std::net::SocketAddr;

use axum::extract::rejection::JsonRejection;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::models::status::{validate_argument, validate_command, validate_move_position};
use crate::utils::error::AppError;

use super::ApiState;

/// Request payload cap; anything larger fails with a 413.
pub const MAX_BODY_BYTES: usize = 2048;

pub fn routes() -> Router<ApiState> {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/machines", get(list_machines))
        .route("/v1/machines/{id}", get(machine_info))
        .route("/v1/machines/{id}/status", get(machine_status))
        .route("/v1/machines/{id}/command", post(machine_command))
        .route("/v1/machines/{id}/move", post(machine_move))
        .route("/v1/status", get(legacy_status))
        .route("/v1/command", post(legacy_command))
}

/// Canonical response envelope.
#[derive(Debug, Serialize)]
pub struct Envelope {
    pub success: bool,
    pub data: Value,
    pub error: Option<String>,
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub machine_id: Option<String>,
}

impl Envelope {
    fn ok(data: Value, machine_id: Option<String>) -> Self {
        Self {
            success: true,
            data,
            error: None,
            code: None,
            machine_id,
        }
    }

    fn failure(error: &AppError, machine_id: Option<String>) -> Self {
        Self {
            success: false,
            data: Value::Null,
            error: Some(error.to_string()),
            code: Some(error.error_code().to_string()),
            machine_id,
        }
    }
}

type ApiResponse = (StatusCode, Json<Envelope>);

fn ok_response(data: Value, machine_id: Option<String>) -> ApiResponse {
    (StatusCode::OK, Json(Envelope::ok(data, machine_id)))
}

fn error_response(error: &AppError, machine_id: Option<String>) -> ApiResponse {
    let status = match error {
        AppError::PlcBusy { .. } => StatusCode::CONFLICT,
        AppError::BadCommand { .. } | AppError::BadRequest { .. } => StatusCode::BAD_REQUEST,
        AppError::UnknownMachine { .. } => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(Envelope::failure(error, machine_id)))
}

/// Maps a body-extraction failure into the envelope, keeping the 413
/// for an oversize payload and normalizing the rest to 400.
fn rejection_response(rejection: JsonRejection, machine_id: Option<String>) -> ApiResponse {
    let status = if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
        StatusCode::PAYLOAD_TOO_LARGE
    } else {
        StatusCode::BAD_REQUEST
    };
    let error = AppError::bad_request(rejection.body_text());
    (status, Json(Envelope::failure(&error, machine_id)))
}

#[derive(Debug, Deserialize)]
struct CommandBody {
    command: Option<i64>,
    argument: Option<i64>,
    machine_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MoveBody {
    position: Option<i64>,
}

async fn health(State(state): State<ApiState>) -> ApiResponse {
    let health = state.fleet.health();
    ok_response(json!(health), None)
}

async fn list_machines(State(state): State<ApiState>) -> ApiResponse {
    ok_response(json!(state.fleet.list_machines()), None)
}

async fn machine_info(State(state): State<ApiState>, Path(id): Path<String>) -> ApiResponse {
    match state.fleet.machine_info(&id) {
        Ok(info) => ok_response(json!(info), Some(id)),
        Err(e) => error_response(&e, Some(id)),
    }
}

async fn machine_status(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> ApiResponse {
    match state.fleet.get_status(&id, &addr.to_string()).await {
        Ok(snapshot) => ok_response(snapshot.to_json(), Some(id)),
        Err(e) => error_response(&e, Some(id)),
    }
}

async fn machine_command(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    payload: Result<Json<CommandBody>, JsonRejection>,
) -> ApiResponse {
    let body = match payload {
        Ok(Json(body)) => body,
        Err(rejection) => return rejection_response(rejection, Some(id)),
    };
    run_command(&state, &id, body, &addr.to_string()).await
}

async fn machine_move(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    payload: Result<Json<MoveBody>, JsonRejection>,
) -> ApiResponse {
    let body = match payload {
        Ok(Json(body)) => body,
        Err(rejection) => return rejection_response(rejection, Some(id)),
    };

    let Some(position) = body.position else {
        return error_response(
            &AppError::bad_request("position not specified"),
            Some(id),
        );
    };
    let position = match validate_move_position(position) {
        Ok(position) => position,
        Err(e) => return error_response(&e, Some(id)),
    };

    match state.fleet.move_to(&id, position, &addr.to_string()).await {
        Ok(snapshot) => ok_response(snapshot.to_json(), Some(id)),
        Err(e) => error_response(&e, Some(id)),
    }
}

/// Legacy single-device status: first configured machine.
async fn legacy_status(
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> ApiResponse {
    let id = state.fleet.first_machine_id().to_string();
    match state.fleet.get_status(&id, &addr.to_string()).await {
        Ok(snapshot) => ok_response(snapshot.to_json(), Some(id)),
        Err(e) => error_response(&e, Some(id)),
    }
}

/// Legacy command: first configured machine unless the body names one.
async fn legacy_command(
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    payload: Result<Json<CommandBody>, JsonRejection>,
) -> ApiResponse {
    let body = match payload {
        Ok(Json(body)) => body,
        Err(rejection) => return rejection_response(rejection, None),
    };
    let id = body
        .machine_id
        .clone()
        .unwrap_or_else(|| state.fleet.first_machine_id().to_string());
    run_command(&state, &id, body, &addr.to_string()).await
}

async fn run_command(
    state: &ApiState,
    machine_id: &str,
    body: CommandBody,
    client_addr: &str,
) -> ApiResponse {
    let Some(command) = body.command else {
        return error_response(
            &AppError::bad_request("command not specified"),
            Some(machine_id.to_string()),
        );
    };
    let command = match validate_command(command) {
        Ok(command) => command,
        Err(e) => return error_response(&e, Some(machine_id.to_string())),
    };
    let argument = match body.argument.map(validate_argument).transpose() {
        Ok(argument) => argument,
        Err(e) => return error_response(&e, Some(machine_id.to_string())),
    };

    match state
        .fleet
        .send_command(machine_id, command, argument, client_addr)
        .await
    {
        Ok(snapshot) => ok_response(snapshot.to_json(), Some(machine_id.to_string())),
        Err(e) => error_response(&e, Some(machine_id.to_string())),
    }
}

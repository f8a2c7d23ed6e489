use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unified error type for the fleet server.
///
/// Every failure that can cross a component boundary is one of these
/// kinds. Transport layers map the kind to a status code via
/// [`AppError::error_code`]; intermediate layers may add context with
/// [`AppError::contextualize`] but never change the kind.
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
pub enum AppError {
    /// Malformed payload or a missing required field.
    #[error("bad request: {message}")]
    BadRequest { message: String },

    /// Machine id not present in the configured fleet.
    #[error("unknown machine '{machine_id}'")]
    UnknownMachine { machine_id: String },

    /// Command or argument outside its declared domain.
    #[error("invalid command: {message}")]
    BadCommand { message: String },

    /// Device mutex deadline exceeded, or the device refused a command
    /// because it is mid-movement.
    #[error("device busy: {message}")]
    PlcBusy { message: String },

    /// Link I/O failed after retry exhaustion.
    #[error("PLC communication error: {message}")]
    PlcConn { message: String },

    /// Configuration file missing, unparsable, or invalid.
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Filesystem error outside the device link.
    #[error("io error: {message} (kind: {kind})")]
    Io { message: String, kind: String },

    /// JSON serialization or deserialization failure.
    #[error("serialization error: {message}")]
    Json { message: String },

    /// Uncaught defect; always paired with an audit record.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl AppError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest {
            message: message.into(),
        }
    }

    pub fn unknown_machine(machine_id: impl Into<String>) -> Self {
        Self::UnknownMachine {
            machine_id: machine_id.into(),
        }
    }

    pub fn bad_command(message: impl Into<String>) -> Self {
        Self::BadCommand {
            message: message.into(),
        }
    }

    pub fn plc_busy(message: impl Into<String>) -> Self {
        Self::PlcBusy {
            message: message.into(),
        }
    }

    pub fn plc_conn(message: impl Into<String>) -> Self {
        Self::PlcConn {
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Stable code for API envelopes and audit lines.
    ///
    /// Kinds without a client-facing meaning collapse to `INTERNAL_ERROR`.
    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::BadRequest { .. } | AppError::UnknownMachine { .. } => "BAD_REQUEST",
            AppError::BadCommand { .. } => "BAD_COMMAND",
            AppError::PlcBusy { .. } => "PLC_BUSY",
            AppError::PlcConn { .. } => "PLC_CONN_ERROR",
            AppError::Configuration { .. }
            | AppError::Io { .. }
            | AppError::Json { .. }
            | AppError::Internal { .. } => "INTERNAL_ERROR",
        }
    }

    /// Prefixes the message with caller context, preserving the kind.
    pub fn contextualize(self, context: impl std::fmt::Display) -> Self {
        match self {
            AppError::BadRequest { message } => AppError::BadRequest {
                message: format!("{context}: {message}"),
            },
            AppError::UnknownMachine { machine_id } => AppError::UnknownMachine { machine_id },
            AppError::BadCommand { message } => AppError::BadCommand {
                message: format!("{context}: {message}"),
            },
            AppError::PlcBusy { message } => AppError::PlcBusy {
                message: format!("{context}: {message}"),
            },
            AppError::PlcConn { message } => AppError::PlcConn {
                message: format!("{context}: {message}"),
            },
            AppError::Configuration { message } => AppError::Configuration {
                message: format!("{context}: {message}"),
            },
            AppError::Io { message, kind } => AppError::Io {
                message: format!("{context}: {message}"),
                kind,
            },
            AppError::Json { message } => AppError::Json {
                message: format!("{context}: {message}"),
            },
            AppError::Internal { message } => AppError::Internal {
                message: format!("{context}: {message}"),
            },
        }
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Io {
            message: err.to_string(),
            kind: format!("{:?}", err.kind()),
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Json {
            message: err.to_string(),
        }
    }
}

/// Result alias used throughout the crate.
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(AppError::bad_request("x").error_code(), "BAD_REQUEST");
        assert_eq!(AppError::unknown_machine("m9").error_code(), "BAD_REQUEST");
        assert_eq!(AppError::bad_command("x").error_code(), "BAD_COMMAND");
        assert_eq!(AppError::plc_busy("x").error_code(), "PLC_BUSY");
        assert_eq!(AppError::plc_conn("x").error_code(), "PLC_CONN_ERROR");
        assert_eq!(AppError::internal("x").error_code(), "INTERNAL_ERROR");
    }

    #[test]
    fn contextualize_preserves_kind() {
        let err = AppError::plc_busy("mutex deadline exceeded").contextualize("machine_1");
        assert_eq!(err.error_code(), "PLC_BUSY");
        assert!(err.to_string().contains("machine_1"));
    }
}

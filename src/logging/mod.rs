//! Logging setup and the append-only audit trail.
//!
//! General diagnostics go through the `log` facade, initialized here
//! with `env_logger` and optionally teed into `carousel_api.log`. The
//! two audit streams (`client_connections.log` and `operations.log`)
//! are a separate facility with their own size-based rotation; see
//! [`audit`].

pub mod audit;

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

pub use audit::AuditTrail;

/// General log file name, kept next to the audit streams.
pub const GENERAL_LOG: &str = "carousel_api.log";

/// Initializes the process-wide logger to stderr only.
pub fn init(level: &str) {
    init_with_file(level, None);
}

/// Initializes the process-wide logger, teeing output into the given
/// file when one is provided.
///
/// `RUST_LOG` still wins when set, so operators can raise verbosity per
/// module without touching configuration files.
pub fn init_with_file(level: &str, log_file: Option<&Path>) {
    let default = match level.to_ascii_lowercase().as_str() {
        "error" => "error",
        "warn" | "warning" => "warn",
        "debug" => "debug",
        "trace" => "trace",
        _ => "info",
    };
    let env = env_logger::Env::default().default_filter_or(default);
    let mut builder = env_logger::Builder::from_env(env);
    builder.format_timestamp_millis();

    if let Some(path) = log_file {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => {
                builder.target(env_logger::Target::Pipe(Box::new(StderrTee { file })));
            }
            Err(e) => eprintln!("cannot open log file {}: {e}", path.display()),
        }
    }

    let _ = builder.try_init();
}

/// Writes every log line to stderr and to the log file.
struct StderrTee {
    file: File,
}

impl Write for StderrTee {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = io::stderr().write_all(buf);
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = io::stderr().flush();
        self.file.flush()
    }
}

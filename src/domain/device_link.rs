//! TCP session to one PLC.
//!
//! The wire protocol is one command byte, optionally followed by one
//! argument byte; the device answers with at least two bytes (status,
//! position). The carousel transiently refuses connections during its
//! own movement cycles, so connect and transact both retry with
//! exponential backoff and jitter; persistent failures surface as
//! `PLC_CONN_ERROR` after the retries are exhausted. No layer above the
//! link retries.

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

use crate::models::WireResponse;
use crate::utils::error::{AppError, AppResult};

/// Connection attempts before `connect` gives up.
pub const CONNECT_ATTEMPTS: u32 = 3;
/// Full send/receive cycles before `transact` gives up.
pub const TRANSACT_ATTEMPTS: u32 = 3;
/// Base of the exponential backoff between attempts.
pub const BACKOFF_BASE: Duration = Duration::from_millis(500);
/// Upper bound of the uniform jitter added to each backoff.
pub const BACKOFF_JITTER_MAX_MS: u64 = 200;
/// Socket read/write deadline.
pub const IO_TIMEOUT: Duration = Duration::from_secs(5);
/// Protocol-mandated pause after a send before attempting a receive.
pub const SETTLE_DELAY: Duration = Duration::from_millis(200);

/// Largest frame the device is known to emit.
const MAX_FRAME: usize = 16;

/// One session to one device, real or simulated.
///
/// Callers may compose `connect`/`close` around a batch of exchanges;
/// `transact` is the usual entry point and owns reconnection.
#[async_trait]
pub trait DeviceLink: Send {
    async fn connect(&mut self) -> AppResult<()>;

    async fn close(&mut self);

    fn is_connected(&self) -> bool;

    /// Frames and writes one command on the open session.
    async fn send(&mut self, command: u8, argument: Option<u8>) -> AppResult<()>;

    /// Reads one response frame from the open session.
    async fn receive(&mut self) -> AppResult<WireResponse>;

    /// One full request/response cycle: connect if needed, send, wait
    /// the protocol settle, receive. Owns the link's retry policy.
    async fn transact(&mut self, command: u8, argument: Option<u8>) -> AppResult<WireResponse>;
}

/// Sleeps `base * 2^(attempt-1)` plus uniform jitter.
pub(crate) async fn backoff(attempt: u32) {
    let exponential = BACKOFF_BASE * 2u32.saturating_pow(attempt.saturating_sub(1));
    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=BACKOFF_JITTER_MAX_MS));
    sleep(exponential + jitter).await;
}

/// TCP implementation of [`DeviceLink`].
pub struct TcpDeviceLink {
    ip: String,
    port: u16,
    stream: Option<TcpStream>,
}

impl TcpDeviceLink {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
            stream: None,
        }
    }

    fn endpoint(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    async fn try_transact(&mut self, command: u8, argument: Option<u8>) -> AppResult<WireResponse> {
        self.connect().await?;
        self.send(command, argument).await?;
        sleep(SETTLE_DELAY).await;
        self.receive().await
    }
}

#[async_trait]
impl DeviceLink for TcpDeviceLink {
    async fn connect(&mut self) -> AppResult<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let mut last_error = String::new();
        for attempt in 1..=CONNECT_ATTEMPTS {
            match timeout(
                IO_TIMEOUT,
                TcpStream::connect((self.ip.as_str(), self.port)),
            )
            .await
            {
                Ok(Ok(stream)) => {
                    debug!("connected to PLC at {}", self.endpoint());
                    self.stream = Some(stream);
                    return Ok(());
                }
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => last_error = "connect timed out".to_string(),
            }
            if attempt < CONNECT_ATTEMPTS {
                warn!(
                    "connect attempt {attempt}/{CONNECT_ATTEMPTS} to {} failed: {last_error}",
                    self.endpoint()
                );
                backoff(attempt).await;
            }
        }

        Err(AppError::plc_conn(format!(
            "cannot connect to {} after {CONNECT_ATTEMPTS} attempts: {last_error}",
            self.endpoint()
        )))
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
            debug!("closed connection to PLC at {}", self.endpoint());
        }
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn send(&mut self, command: u8, argument: Option<u8>) -> AppResult<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| AppError::plc_conn("no active connection"))?;

        let mut frame = vec![command];
        if let Some(argument) = argument {
            frame.push(argument);
        }

        match timeout(IO_TIMEOUT, stream.write_all(&frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(AppError::plc_conn(format!("send failed: {e}"))),
            Err(_) => Err(AppError::plc_conn("send timed out")),
        }
    }

    async fn receive(&mut self) -> AppResult<WireResponse> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| AppError::plc_conn("no active connection"))?;

        let mut buffer = [0u8; MAX_FRAME];
        let read = match timeout(IO_TIMEOUT, stream.read(&mut buffer)).await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(AppError::plc_conn(format!("receive failed: {e}"))),
            Err(_) => return Err(AppError::plc_conn("receive timed out")),
        };

        if read < 2 {
            return Err(AppError::plc_conn(format!(
                "truncated response: {read} byte(s)"
            )));
        }

        Ok(WireResponse {
            raw: buffer[0],
            position: buffer[1],
            extra: buffer[2..read].to_vec(),
        })
    }

    async fn transact(&mut self, command: u8, argument: Option<u8>) -> AppResult<WireResponse> {
        let mut last_error = None;
        for attempt in 1..=TRANSACT_ATTEMPTS {
            match self.try_transact(command, argument).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    warn!(
                        "transaction attempt {attempt}/{TRANSACT_ATTEMPTS} with {} failed: {e}",
                        self.endpoint()
                    );
                    self.close().await;
                    last_error = Some(e);
                    if attempt < TRANSACT_ATTEMPTS {
                        backoff(attempt).await;
                    }
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| AppError::plc_conn("transaction failed"))
            .contextualize(format!("device {}", self.endpoint())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Accepts `sessions` connections, each reading one frame and
    /// answering with `reply`.
    async fn fake_plc(reply: Vec<u8>, sessions: usize) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            for _ in 0..sessions {
                let (mut socket, _) = listener.accept().await.unwrap();
                let reply = reply.clone();
                let mut buffer = [0u8; 4];
                let _ = socket.read(&mut buffer).await;
                let _ = socket.write_all(&reply).await;
            }
        });
        addr
    }

    #[tokio::test]
    async fn transact_round_trips_a_frame() {
        let addr = fake_plc(vec![0b0000_0001, 4, 0xAA, 0xBB], 1).await;
        let mut link = TcpDeviceLink::new(addr.ip().to_string(), addr.port());

        let response = link.transact(0, None).await.unwrap();
        assert_eq!(response.raw, 0b0000_0001);
        assert_eq!(response.position, 4);
        assert_eq!(response.extra, vec![0xAA, 0xBB]);
        assert!(link.is_connected());
    }

    #[tokio::test]
    async fn send_appends_argument_byte() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buffer = [0u8; 4];
            let read = socket.read(&mut buffer).await.unwrap();
            (read, buffer)
        });

        let mut link = TcpDeviceLink::new(addr.ip().to_string(), addr.port());
        link.connect().await.unwrap();
        link.send(1, Some(7)).await.unwrap();
        link.close().await;

        let (read, buffer) = server.await.unwrap();
        assert_eq!(read, 2);
        assert_eq!(&buffer[..2], &[1, 7]);
    }

    #[tokio::test]
    async fn truncated_response_fails_after_retries() {
        // Every session answers with a single byte; the link must retry
        // the full cycle and then report a connection error.
        let addr = fake_plc(vec![0x01], TRANSACT_ATTEMPTS as usize).await;
        let mut link = TcpDeviceLink::new(addr.ip().to_string(), addr.port());

        let err = link.transact(0, None).await.unwrap_err();
        assert_eq!(err.error_code(), "PLC_CONN_ERROR");
        assert!(!link.is_connected());
    }

    #[tokio::test]
    async fn unreachable_device_reports_conn_error() {
        // Bind then drop a listener so the port is known-closed.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut link = TcpDeviceLink::new(addr.ip().to_string(), addr.port());
        let err = link.connect().await.unwrap_err();
        assert_eq!(err.error_code(), "PLC_CONN_ERROR");
        assert!(!link.is_connected());
    }
}

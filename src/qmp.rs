//! QMP client: talks to a running QEMU instance over its monitor socket.
//!
//! Every call connects, negotiates the QMP handshake, issues exactly one
//! command and disconnects, the same connect-per-call shape the agent's
//! own QMP client uses. QEMU tolerates this fine since the monitor socket
//! is cheap to reopen and this sidesteps needing to keep a live connection
//! per domain around across the whole lifecycle.

use std::{
    io,
    path::{Path, PathBuf},
    time::Duration,
};

use qapi::{
    futures::{QapiService, QapiStream, QmpStreamNegotiation, QmpStreamTokio},
    qmp::{self, QmpCommand},
    Command as QapiCommandTrait, ExecuteError,
};
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf},
    net::UnixStream,
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

type QmpReadStreamHalf = QmpStreamTokio<ReadHalf<UnixStream>>;
type QmpWriteStreamHalf = QmpStreamTokio<WriteHalf<UnixStream>>;
type NegotiatedQmpStream = QapiStream<QmpReadStreamHalf, QmpWriteStreamHalf>;
type QmpCommandService = QapiService<QmpWriteStreamHalf>;
type QmpDriverTaskHandle = JoinHandle<()>;

#[derive(Debug, Error)]
pub enum QmpError {
    #[error("connecting to QMP socket at {path}: {source}")]
    Connect { path: String, #[source] source: io::Error },

    #[error("QMP negotiation failed for {path}: {source}")]
    Negotiate { path: String, #[source] source: io::Error },

    #[error("QMP command '{command}' failed: {source}")]
    Execute { command: &'static str, #[source] source: ExecuteError },

    #[error("QMP socket at {0} never became available within the timeout")]
    Timeout(String),

    #[error("waited for QMP socket at {0} but shutdown was requested")]
    Cancelled(String),

    #[error("domain {domain} did not reach running state after cont (status: {status})")]
    NotRunningAfterCont { domain: String, status: String },
}

pub type Result<T> = std::result::Result<T, QmpError>;

pub struct QmpClient {
    sock: std::path::PathBuf,
}

impl QmpClient {
    pub fn new(sock: impl Into<std::path::PathBuf>) -> Self {
        Self { sock: sock.into() }
    }

    async fn connect(&self) -> Result<(QmpCommandService, QmpDriverTaskHandle)> {
        let path_str = self.sock.display().to_string();
        let pre_negotiation: QmpStreamNegotiation<QmpReadStreamHalf, QmpWriteStreamHalf> =
            QmpStreamTokio::open_uds(&self.sock)
                .await
                .map_err(|source| QmpError::Connect { path: path_str.clone(), source })?;

        let negotiated: NegotiatedQmpStream =
            pre_negotiation.negotiate().await.map_err(|source| QmpError::Negotiate { path: path_str, source })?;

        Ok(negotiated.spawn_tokio())
    }

    /// Checks whether the socket currently accepts QMP negotiation, without
    /// issuing any command.
    pub async fn is_available(&self) -> bool {
        match QmpStreamTokio::open_uds(&self.sock).await {
            Ok(stream) => stream.negotiate().await.is_ok(),
            Err(_) => false,
        }
    }

    async fn execute<C>(&self, command: C) -> Result<<C as QapiCommandTrait>::Ok>
    where
        C: QapiCommandTrait + QmpCommand,
    {
        let (service, driver) = self.connect().await?;
        let response =
            service.execute(command).await.map_err(|source| QmpError::Execute { command: C::NAME, source })?;
        drop(service);
        let _ = driver.await;
        Ok(response)
    }

    pub async fn query_status(&self) -> Result<qmp::StatusInfo> {
        self.execute(qmp::query_status {}).await
    }

    pub async fn pause(&self) -> Result<()> {
        self.execute(qmp::stop {}).await
    }

    pub async fn resume(&self) -> Result<()> {
        self.execute(qmp::cont {}).await
    }

    /// Graceful shutdown: asks the guest OS to power down.
    pub async fn shutdown(&self) -> Result<()> {
        self.execute(qmp::system_powerdown {}).await
    }

    /// Forceful shutdown: tells QEMU to exit immediately.
    pub async fn quit(&self) -> Result<()> {
        self.execute(qmp::quit {}).await
    }

    pub async fn set_vnc_password(&self, password: &str) -> Result<()> {
        self.execute(qmp::set_password {
            protocol: "vnc".to_string(),
            password: password.to_string(),
            connected: None,
        })
        .await
    }

    pub async fn query_cpu_count(&self) -> Result<usize> {
        Ok(self.execute(qmp::query_cpus_fast {}).await?.len())
    }
}

/// Connects to a domain's `listener.qmp` socket, completes the bare QMP
/// handshake and then just reads: every asynchronous event QEMU emits on
/// this socket is traced until the socket closes or `cancellation` fires.
/// Spawned once at Start and meant to live for the rest of the domain's
/// lifetime, unlike `QmpClient` which connects fresh per command. QMP is a
/// line-oriented JSON protocol, so this drives the socket directly instead
/// of going through `qapi`'s command/response plumbing, which discards
/// out-of-band events once a connection is handed off to its driver task.
pub fn spawn_event_listener(sock: PathBuf, domain: String, cancellation: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(err) = run_event_listener(&sock, &domain, &cancellation).await {
            debug!("QMP event listener for {domain} at {} exited: {err}", sock.display());
        }
    })
}

async fn run_event_listener(sock: &Path, domain: &str, cancellation: &CancellationToken) -> io::Result<()> {
    let stream = tokio::select! {
        result = UnixStream::connect(sock) => result?,
        _ = cancellation.cancelled() => return Ok(()),
    };
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    // Greeting first, then negotiate capabilities so QEMU starts forwarding
    // events instead of just waiting for a command.
    if lines.next_line().await?.is_none() {
        return Ok(());
    }
    write_half.write_all(b"{\"execute\":\"qmp_capabilities\"}\n").await?;
    lines.next_line().await?;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line? {
                    Some(line) => log_event(domain, &line),
                    None => return Ok(()),
                }
            }
            _ = cancellation.cancelled() => return Ok(()),
        }
    }
}

fn log_event(domain: &str, line: &str) {
    match serde_json::from_str::<serde_json::Value>(line) {
        Ok(value) => {
            if let Some(event) = value.get("event").and_then(|e| e.as_str()) {
                debug!("domain {domain} QMP event: {event}");
            }
        }
        Err(err) => debug!("domain {domain}: malformed line on QMP listener socket: {err}"),
    }
}

/// Polls a QMP socket until it reaches the desired availability, doubling
/// the backoff delay each attempt (starting at one second, capped at one
/// minute), giving up once the cumulative wait exceeds ten seconds. Pass
/// `available = true` to wait for the socket to start answering (used
/// after launching QEMU); `available = false` to wait for it to stop
/// answering (used by cleanup, after asking QEMU to quit). Honors
/// `cancellation` so a shutdown request can interrupt the wait.
pub async fn wait_for_qmp(sock: &Path, available: bool, cancellation: &CancellationToken) -> Result<()> {
    const INITIAL_DELAY: Duration = Duration::from_secs(1);
    const MAX_DELAY: Duration = Duration::from_secs(60);
    const GIVE_UP_AFTER: Duration = Duration::from_secs(10);

    let client = QmpClient::new(sock);
    let mut delay = INITIAL_DELAY;
    let mut waited = Duration::ZERO;

    loop {
        if client.is_available().await == available {
            debug!("QMP socket {} reached available={} after {:?}", sock.display(), available, waited);
            return Ok(());
        }

        if waited > GIVE_UP_AFTER {
            return Err(QmpError::Timeout(sock.display().to_string()));
        }

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancellation.cancelled() => {
                return Err(QmpError::Cancelled(sock.display().to_string()));
            }
        }
        waited += delay;
        delay = (delay * 2).min(MAX_DELAY);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[tokio::test]
    async fn is_available_is_false_for_a_nonexistent_socket() {
        let client = QmpClient::new("/nonexistent/qmp.sock");
        assert!(!client.is_available().await);
    }

    #[tokio::test]
    #[traced_test]
    async fn wait_for_qmp_respects_cancellation() {
        let cancellation = CancellationToken::new();
        cancellation.cancel();
        let result = wait_for_qmp(Path::new("/nonexistent/qmp.sock"), true, &cancellation).await;
        assert!(matches!(result, Err(QmpError::Cancelled(_))));
    }

    #[tokio::test]
    async fn wait_for_qmp_available_false_succeeds_immediately_for_a_nonexistent_socket() {
        let cancellation = CancellationToken::new();
        let result = wait_for_qmp(Path::new("/nonexistent/qmp.sock"), false, &cancellation).await;
        assert!(result.is_ok());
    }
}

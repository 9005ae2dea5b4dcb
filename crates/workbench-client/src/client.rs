//! Worker process supervision and the session handshake.
//!
//! The supervisor owns at most one worker process. Acquisition is memoized:
//! every caller that arrives while a launch is in flight awaits the same
//! shared future and receives the same handle. Handshakes are correlated by
//! UUID through a pending table, so any number of initializations can be in
//! flight against one worker and responses may arrive in any order.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::protocol::{GatewayMessage, Query, SessionOptions, WorkbenchOptions, WorkerMessage};

/// Environment variable carrying the session-socket path to the worker.
///
/// The worker listens on this Unix socket for handed-off connections; each
/// connection starts with one `socket` envelope line followed by raw bytes.
pub const SESSION_SOCK_ENV: &str = "WORKBENCH_SESSION_SOCK";

const EXIT_REAP_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Error)]
pub enum WorkerError {
    /// The process could not start, or exited before announcing readiness.
    /// Recoverable: a later `acquire` retries a fresh launch.
    #[error("worker failed to launch: {detail}")]
    LaunchFailed { detail: String },
    /// The worker died or errored while a session handshake was outstanding.
    #[error("worker rejected the session handshake: {detail}")]
    HandshakeRejected { detail: String },
    /// No matching response arrived within the configured bound.
    #[error("worker did not answer the session handshake in time")]
    HandshakeTimeout,
    /// No usable worker at the point of the call.
    #[error("worker is not running")]
    NotRunning,
}

pub type WorkerWriter = Box<dyn AsyncWrite + Send + Unpin>;
pub type WorkerReader = Box<dyn AsyncRead + Send + Unpin>;

/// I/O and process state produced by a launcher, before the ready handshake.
pub struct LaunchedWorker {
    pub stdin: WorkerWriter,
    pub stdout: WorkerReader,
    pub child: Option<Child>,
    pub session_sock: Option<PathBuf>,
}

/// Seam between the supervisor and the platform: production launches a real
/// process, tests hand in in-memory transports.
pub trait WorkerLauncher: Send + Sync + 'static {
    fn launch(&self) -> BoxFuture<'static, Result<LaunchedWorker, WorkerError>>;
}

/// Launches the configured worker command with piped stdio.
pub struct CommandLauncher {
    program: PathBuf,
    args: Vec<String>,
    session_sock_dir: PathBuf,
}

impl CommandLauncher {
    pub fn new(
        program: impl Into<PathBuf>,
        args: Vec<String>,
        session_sock_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            program: program.into(),
            args,
            session_sock_dir: session_sock_dir.into(),
        }
    }
}

impl WorkerLauncher for CommandLauncher {
    fn launch(&self) -> BoxFuture<'static, Result<LaunchedWorker, WorkerError>> {
        let program = self.program.clone();
        let args = self.args.clone();
        let sock_dir = self.session_sock_dir.clone();

        async move {
            tokio::fs::create_dir_all(&sock_dir)
                .await
                .map_err(|err| WorkerError::LaunchFailed {
                    detail: format!("session socket dir {}: {err}", sock_dir.display()),
                })?;
            let session_sock = sock_dir.join(format!("session-{}.sock", Uuid::new_v4()));

            let mut child = Command::new(&program)
                .args(&args)
                .env(SESSION_SOCK_ENV, &session_sock)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::inherit())
                .kill_on_drop(true)
                .spawn()
                .map_err(|err| WorkerError::LaunchFailed {
                    detail: format!("spawn {}: {err}", program.display()),
                })?;

            let stdin = child.stdin.take().ok_or_else(|| WorkerError::LaunchFailed {
                detail: "worker stdin missing".to_string(),
            })?;
            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| WorkerError::LaunchFailed {
                    detail: "worker stdout missing".to_string(),
                })?;

            Ok(LaunchedWorker {
                stdin: Box::new(stdin),
                stdout: Box::new(stdout),
                child: Some(child),
                session_sock: Some(session_sock),
            })
        }
        .boxed()
    }
}

type PendingHandshake = oneshot::Sender<Result<WorkbenchOptions, WorkerError>>;
type PendingHandshakes = HashMap<Uuid, PendingHandshake>;

type SharedLaunch = Shared<BoxFuture<'static, Result<Arc<WorkerHandle>, WorkerError>>>;

struct Slot {
    generation: u64,
    launch: SharedLaunch,
}

/// Handle to a ready worker. Obtained only through
/// [`WorkerSupervisor::acquire`].
pub struct WorkerHandle {
    stdin: Mutex<WorkerWriter>,
    pending: Arc<Mutex<PendingHandshakes>>,
    child: Arc<Mutex<Option<Child>>>,
    session_sock: Option<PathBuf>,
    closed: Arc<AtomicBool>,
    reader_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    handshake_timeout: Duration,
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("session_sock", &self.session_sock)
            .field("closed", &self.closed)
            .field("handshake_timeout", &self.handshake_timeout)
            .finish_non_exhaustive()
    }
}

impl WorkerHandle {
    async fn launch(
        launcher: Arc<dyn WorkerLauncher>,
        handshake_timeout: Duration,
        slot: Weak<Mutex<Option<Slot>>>,
        generation: u64,
    ) -> Result<Arc<Self>, WorkerError> {
        tracing::debug!(generation, "launching workbench worker");
        let launched = launcher.launch().await?;

        let pending: Arc<Mutex<PendingHandshakes>> = Arc::default();
        let closed = Arc::new(AtomicBool::new(false));
        let child = Arc::new(Mutex::new(launched.child));
        let (ready_tx, ready_rx) = oneshot::channel();

        let reader_task = spawn_reader(ReaderContext {
            stdout: launched.stdout,
            pending: pending.clone(),
            closed: closed.clone(),
            child: child.clone(),
            ready_tx,
            slot,
            generation,
        });

        let handle = Arc::new(Self {
            stdin: Mutex::new(launched.stdin),
            pending,
            child,
            session_sock: launched.session_sock,
            closed,
            reader_task: std::sync::Mutex::new(Some(reader_task)),
            handshake_timeout,
        });

        match ready_rx.await {
            Ok(Ok(())) => {
                tracing::debug!(generation, "workbench worker ready");
                Ok(handle)
            }
            Ok(Err(err)) => {
                handle.shutdown().await;
                Err(err)
            }
            Err(_) => {
                handle.shutdown().await;
                Err(WorkerError::LaunchFailed {
                    detail: "worker reader stopped before readiness".to_string(),
                })
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Runs the correlated init/options exchange for one browser session.
    pub async fn initialize(
        &self,
        options: SessionOptions,
    ) -> Result<WorkbenchOptions, WorkerError> {
        let id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);
        tracing::debug!(%id, "starting session handshake");

        if let Err(err) = self.send(&GatewayMessage::Init { id, options }).await {
            self.pending.lock().await.remove(&id);
            return Err(err);
        }

        match tokio::time::timeout(self.handshake_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(WorkerError::HandshakeRejected {
                detail: "worker connection closed".to_string(),
            }),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(WorkerError::HandshakeTimeout)
            }
        }
    }

    /// Hands an upgraded connection to the worker.
    ///
    /// Writes the `socket` envelope as the first line of a session-socket
    /// connection, then shuttles raw bytes both ways. The worker does all
    /// WebSocket framing; the gateway never touches the stream again.
    pub async fn handoff_socket<S>(&self, query: Query, socket: S) -> Result<(), WorkerError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        if self.is_closed() {
            return Err(WorkerError::NotRunning);
        }
        let path = self.session_sock.as_ref().ok_or(WorkerError::NotRunning)?;

        let mut conn = UnixStream::connect(path).await.map_err(|err| {
            tracing::warn!(error = %err, path = %path.display(), "session socket connect failed");
            WorkerError::NotRunning
        })?;

        let mut payload = serde_json::to_string(&GatewayMessage::Socket { query })
            .map_err(|err| {
                tracing::error!(error = %err, "socket envelope encode failed");
                WorkerError::NotRunning
            })?;
        payload.push('\n');
        conn.write_all(payload.as_bytes()).await.map_err(|err| {
            tracing::warn!(error = %err, "session socket write failed");
            WorkerError::NotRunning
        })?;

        tokio::spawn(async move {
            let mut socket = socket;
            match tokio::io::copy_bidirectional(&mut socket, &mut conn).await {
                Ok((to_worker, from_worker)) => {
                    tracing::debug!(to_worker, from_worker, "session socket closed");
                }
                Err(err) => tracing::debug!(error = %err, "session socket relay ended"),
            }
        });
        Ok(())
    }

    async fn send(&self, message: &GatewayMessage) -> Result<(), WorkerError> {
        if self.is_closed() {
            return Err(WorkerError::NotRunning);
        }
        let payload = serde_json::to_string(message).map_err(|err| {
            tracing::error!(error = %err, "worker message encode failed");
            WorkerError::NotRunning
        })?;

        let mut stdin = self.stdin.lock().await;
        let written: std::io::Result<()> = async {
            stdin.write_all(payload.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await
        }
        .await;
        written.map_err(|err| {
            tracing::warn!(error = %err, "worker write failed");
            WorkerError::NotRunning
        })
    }

    async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let task = self
            .reader_task
            .lock()
            .ok()
            .and_then(|mut guard| guard.take());
        if let Some(task) = task {
            task.abort();
        }
        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(err) = child.kill().await {
                tracing::debug!(error = %err, "worker kill failed");
            }
        }
        let mut pending = self.pending.lock().await;
        for (_, sender) in pending.drain() {
            let _ = sender.send(Err(WorkerError::HandshakeRejected {
                detail: "gateway disposed the worker".to_string(),
            }));
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.reader_task.lock() {
            if let Some(task) = guard.take() {
                task.abort();
            }
        }
    }
}

struct ReaderContext {
    stdout: WorkerReader,
    pending: Arc<Mutex<PendingHandshakes>>,
    closed: Arc<AtomicBool>,
    child: Arc<Mutex<Option<Child>>>,
    ready_tx: oneshot::Sender<Result<(), WorkerError>>,
    slot: Weak<Mutex<Option<Slot>>>,
    generation: u64,
}

fn spawn_reader(ctx: ReaderContext) -> JoinHandle<()> {
    tokio::spawn(async move {
        let ReaderContext {
            stdout,
            pending,
            closed,
            child,
            ready_tx,
            slot,
            generation,
        } = ctx;
        let mut ready_tx = Some(ready_tx);
        let mut lines = BufReader::new(stdout).lines();

        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    let message: WorkerMessage = match serde_json::from_str(trimmed) {
                        Ok(message) => message,
                        Err(err) => {
                            tracing::warn!(error = %err, line = %trimmed, "worker message parse failed");
                            continue;
                        }
                    };
                    match message {
                        WorkerMessage::Ready => {
                            if let Some(tx) = ready_tx.take() {
                                let _ = tx.send(Ok(()));
                            }
                        }
                        WorkerMessage::Options { id, options } => {
                            let mut pending = pending.lock().await;
                            if let Some(sender) = pending.remove(&id) {
                                let _ = sender.send(Ok(options));
                            } else {
                                tracing::warn!(%id, "worker response without pending handshake");
                            }
                        }
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(error = %err, "worker stdout read failed");
                    break;
                }
            }
        }

        closed.store(true, Ordering::SeqCst);
        let detail = exit_detail(&child).await;
        tracing::warn!(generation, detail = %detail, "workbench worker stream closed");

        if let Some(tx) = ready_tx.take() {
            let _ = tx.send(Err(WorkerError::LaunchFailed {
                detail: detail.clone(),
            }));
        }

        let drained: Vec<PendingHandshake> = {
            let mut pending = pending.lock().await;
            pending.drain().map(|(_, sender)| sender).collect()
        };
        for sender in drained {
            let _ = sender.send(Err(WorkerError::HandshakeRejected {
                detail: detail.clone(),
            }));
        }

        if let Some(slot) = slot.upgrade() {
            let mut slot = slot.lock().await;
            if slot
                .as_ref()
                .is_some_and(|current| current.generation == generation)
            {
                *slot = None;
            }
        }
    })
}

async fn exit_detail(child: &Mutex<Option<Child>>) -> String {
    let mut guard = child.lock().await;
    if let Some(child) = guard.as_mut() {
        if let Ok(Ok(status)) = tokio::time::timeout(EXIT_REAP_GRACE, child.wait()).await {
            return format!("worker exited unexpectedly with {status}");
        }
    }
    "worker stream closed unexpectedly".to_string()
}

/// Owns the single worker slot. `acquire` is the only way to reach a
/// [`WorkerHandle`]; `dispose` is the only way to tear one down.
pub struct WorkerSupervisor {
    launcher: Arc<dyn WorkerLauncher>,
    handshake_timeout: Duration,
    slot: Arc<Mutex<Option<Slot>>>,
    generation: AtomicU64,
}

impl WorkerSupervisor {
    pub fn new(launcher: Arc<dyn WorkerLauncher>, handshake_timeout: Duration) -> Self {
        Self {
            launcher,
            handshake_timeout,
            slot: Arc::default(),
            generation: AtomicU64::new(0),
        }
    }

    /// Returns the pending or ready worker, launching one if none exists.
    ///
    /// Callers arriving during the pending window share the in-flight
    /// launch; at most one process is ever being launched at a time.
    pub async fn acquire(&self) -> Result<Arc<WorkerHandle>, WorkerError> {
        // One retry: the memoized handle may belong to a worker that has
        // already exited but whose slot has not been observed yet.
        for _ in 0..2 {
            let (generation, launch) = {
                let mut slot = self.slot.lock().await;
                match slot.as_ref() {
                    Some(current) => (current.generation, current.launch.clone()),
                    None => {
                        let generation = self.generation.fetch_add(1, Ordering::SeqCst);
                        let launch = WorkerHandle::launch(
                            self.launcher.clone(),
                            self.handshake_timeout,
                            Arc::downgrade(&self.slot),
                            generation,
                        )
                        .boxed()
                        .shared();
                        *slot = Some(Slot {
                            generation,
                            launch: launch.clone(),
                        });
                        (generation, launch)
                    }
                }
            };

            match launch.await {
                Ok(handle) => {
                    if handle.is_closed() {
                        self.clear(generation).await;
                        continue;
                    }
                    return Ok(handle);
                }
                Err(err) => {
                    self.clear(generation).await;
                    return Err(err);
                }
            }
        }
        Err(WorkerError::NotRunning)
    }

    /// Terminates the worker (if any) and resets to the absent state.
    ///
    /// Safe to call when no worker exists; in-flight handshakes fail with
    /// `HandshakeRejected`.
    pub async fn dispose(&self) {
        let slot = self.slot.lock().await.take();
        if let Some(current) = slot {
            if let Ok(handle) = current.launch.await {
                handle.shutdown().await;
            }
        }
    }

    async fn clear(&self, generation: u64) {
        let mut slot = self.slot.lock().await;
        if slot
            .as_ref()
            .is_some_and(|current| current.generation == generation)
        {
            *slot = None;
        }
    }
}

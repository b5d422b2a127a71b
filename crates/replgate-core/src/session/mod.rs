//! Sessions: one interpreter process plus the two pumps draining it.
//!
//! A [`SessionHandle`] is the unit of isolation. It owns the child process,
//! its stdin, the stdout/stderr buffers and the lock that serializes code
//! submissions. The handle knows nothing about the completion protocol; the
//! supervisor drives it.

pub mod pump;
pub mod registry;

pub use pump::{spawn_pump, OutputBuffer, OutputLine, StreamKind};
pub use registry::{Reservation, SessionRegistry};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin};
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::errors::GatewayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Created,
    Initializing,
    Ready,
    Executing,
    Idle,
    Terminated,
}

impl SessionState {
    pub fn accepts_code(&self) -> bool {
        matches!(self, SessionState::Ready | SessionState::Idle)
    }
}

/// Snapshot of a session for listings.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub state: SessionState,
    pub pid: Option<u32>,
    pub ephemeral: bool,
    pub created_at: DateTime<Utc>,
}

pub struct SessionHandle {
    id: String,
    ephemeral: bool,
    created_at: DateTime<Utc>,
    pid: Option<u32>,
    child: AsyncMutex<Option<Child>>,
    stdin: AsyncMutex<Option<ChildStdin>>,
    stdout: Arc<OutputBuffer>,
    stderr: Arc<OutputBuffer>,
    notify: Arc<Notify>,
    state: Mutex<SessionState>,
    exec_lock: AsyncMutex<()>,
    pumps: Mutex<Vec<JoinHandle<()>>>,
}

impl SessionHandle {
    /// Take ownership of a freshly spawned child and start both pumps.
    /// The child must have been spawned with all three stdio handles piped.
    pub fn attach(id: &str, ephemeral: bool, mut child: Child) -> Result<Self, GatewayError> {
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (stdin, stdout_pipe, stderr_pipe) = match (stdin, stdout, stderr) {
            (Some(stdin), Some(stdout), Some(stderr)) => (stdin, stdout, stderr),
            _ => {
                return Err(GatewayError::SpawnFailed(format!(
                    "Interpreter for session '{}' was spawned without piped stdio",
                    id
                )))
            }
        };

        let notify = Arc::new(Notify::new());
        let stdout = Arc::new(OutputBuffer::new(StreamKind::Stdout, notify.clone()));
        let stderr = Arc::new(OutputBuffer::new(StreamKind::Stderr, notify.clone()));

        let pumps = vec![
            spawn_pump(id.to_string(), stdout_pipe, stdout.clone()),
            spawn_pump(id.to_string(), stderr_pipe, stderr.clone()),
        ];

        Ok(Self {
            id: id.to_string(),
            ephemeral,
            created_at: Utc::now(),
            pid: child.id(),
            child: AsyncMutex::new(Some(child)),
            stdin: AsyncMutex::new(Some(stdin)),
            stdout,
            stderr,
            notify,
            state: Mutex::new(SessionState::Created),
            exec_lock: AsyncMutex::new(()),
            pumps: Mutex::new(pumps),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_state(&self, state: SessionState) {
        let mut current = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if *current != state {
            log::debug!("Session {} state {:?} -> {:?}", self.id, *current, state);
            *current = state;
        }
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            state: self.state(),
            pid: self.pid,
            ephemeral: self.ephemeral,
            created_at: self.created_at,
        }
    }

    pub fn stdout(&self) -> &OutputBuffer {
        &self.stdout
    }

    pub fn stderr(&self) -> &OutputBuffer {
        &self.stderr
    }

    /// Claim the session for one submission. Fails with `SessionBusy` while
    /// another submission holds it; the claim is released when the returned
    /// guard drops.
    pub fn begin_execution(&self) -> Result<ExecutionGuard<'_>, GatewayError> {
        let lock = self
            .exec_lock
            .try_lock()
            .map_err(|_| GatewayError::SessionBusy(self.id.clone()))?;

        let state = self.state();
        if state == SessionState::Terminated {
            return Err(GatewayError::SessionNotFound(self.id.clone()));
        }
        if !state.accepts_code() {
            return Err(GatewayError::SessionBusy(self.id.clone()));
        }

        self.set_state(SessionState::Executing);
        Ok(ExecutionGuard {
            session: self,
            _lock: lock,
        })
    }

    /// Write `text` plus a newline to the child's stdin and flush.
    pub async fn write_line(&self, text: &str) -> std::io::Result<()> {
        let mut stdin = self.stdin.lock().await;
        let stdin = stdin.as_mut().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "stdin already closed")
        })?;
        stdin.write_all(text.as_bytes()).await?;
        if !text.ends_with('\n') {
            stdin.write_all(b"\n").await?;
        }
        stdin.flush().await
    }

    /// Drain both buffers, stdout first. Ordering between the two streams is
    /// not meaningful.
    pub fn drain_output(&self) -> Vec<OutputLine> {
        let mut lines = self.stdout.drain();
        lines.extend(self.stderr.drain());
        lines
    }

    pub fn clear_output(&self) -> usize {
        self.stdout.clear() + self.stderr.clear()
    }

    /// True once both pumps have seen EOF.
    pub fn streams_closed(&self) -> bool {
        self.stdout.is_closed() && self.stderr.is_closed()
    }

    /// Sleep until a pump pushes a line or `deadline` passes.
    pub async fn wait_for_output(&self, deadline: Instant) {
        let _ = tokio::time::timeout_at(deadline, self.notify.notified()).await;
    }

    /// Non-blocking check whether the child already exited. Reaps it if so;
    /// the exit status stays cached on the child.
    pub async fn has_exited(&self) -> bool {
        let mut child = self.child.lock().await;
        match child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(Some(_))),
            None => true,
        }
    }

    /// Stop the interpreter: best-effort exit statement, close stdin, SIGTERM,
    /// wait up to `grace`, then kill. Safe to call repeatedly.
    pub async fn shutdown(&self, exit_command: Option<&str>, grace: Duration) {
        self.set_state(SessionState::Terminated);

        {
            let mut stdin = self.stdin.lock().await;
            if let Some(mut pipe) = stdin.take() {
                if let Some(command) = exit_command {
                    let line = format!("{}\n", command);
                    if let Err(e) = pipe.write_all(line.as_bytes()).await {
                        log::debug!("Session {}: exit command not delivered: {}", self.id, e);
                    } else {
                        let _ = pipe.flush().await;
                    }
                }
            }
        }

        let mut child_slot = self.child.lock().await;
        if let Some(mut child) = child_slot.take() {
            match child.try_wait() {
                Ok(Some(status)) => {
                    log::debug!("Session {} interpreter already exited: {}", self.id, status);
                }
                _ => {
                    send_terminate(&child);
                    match tokio::time::timeout(grace, child.wait()).await {
                        Ok(Ok(status)) => {
                            log::info!("Session {} interpreter exited: {}", self.id, status);
                        }
                        Ok(Err(e)) => {
                            log::warn!("Session {}: waiting for interpreter failed: {}", self.id, e);
                            let _ = child.kill().await;
                        }
                        Err(_) => {
                            log::warn!(
                                "Session {} interpreter ignored termination for {:?}, killing",
                                self.id,
                                grace
                            );
                            if let Err(e) = child.kill().await {
                                log::error!("Session {}: kill failed: {}", self.id, e);
                            }
                        }
                    }
                }
            }
        }
        drop(child_slot);

        let pumps: Vec<_> = self
            .pumps
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
            .collect();
        for pump in pumps {
            pump.abort();
        }
        self.clear_output();
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        for pump in self
            .pumps
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
        {
            pump.abort();
        }
    }
}

#[cfg(unix)]
fn send_terminate(child: &Child) {
    if let Some(pid) = child.id() {
        // SAFETY: plain syscall on a pid we own and have not reaped yet.
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if rc != 0 {
            log::debug!(
                "SIGTERM to pid {} failed: {}",
                pid,
                std::io::Error::last_os_error()
            );
        }
    }
}

#[cfg(not(unix))]
fn send_terminate(_child: &Child) {}

/// Held for the duration of one submission.
pub struct ExecutionGuard<'a> {
    session: &'a SessionHandle,
    _lock: AsyncMutexGuard<'a, ()>,
}

impl ExecutionGuard<'_> {
    pub fn session(&self) -> &SessionHandle {
        self.session
    }
}

impl Drop for ExecutionGuard<'_> {
    fn drop(&mut self) {
        if self.session.state() == SessionState::Executing {
            self.session.set_state(SessionState::Idle);
        }
    }
}

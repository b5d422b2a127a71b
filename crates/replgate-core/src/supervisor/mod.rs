//! Process supervision: spawning interpreters, waiting for readiness,
//! submitting code with idle-based completion detection, and teardown.

pub mod completion;

pub use completion::{CapturedOutput, CompletionDetector, Verdict};

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::GatewayConfig;
use crate::errors::GatewayError;
use crate::session::{
    ExecutionGuard, SessionHandle, SessionInfo, SessionRegistry, SessionState, StreamKind,
};

/// Upper bound on how long a wait for output goes without checking whether
/// the interpreter is still alive.
const EXIT_POLL: Duration = Duration::from_millis(100);

/// Time given to the pumps to deliver what an exited interpreter wrote.
const EXIT_SETTLE: Duration = Duration::from_millis(50);

/// Owns the registry and every interpreter process behind it.
pub struct ProcessSupervisor {
    config: Arc<GatewayConfig>,
    registry: Arc<SessionRegistry>,
}

impl ProcessSupervisor {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config: Arc::new(config),
            registry: Arc::new(SessionRegistry::new()),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    fn build_command(&self) -> Command {
        let interpreter = &self.config.interpreter;
        let mut cmd = Command::new(&interpreter.program);
        cmd.args(&interpreter.args)
            .env_clear()
            .envs(&interpreter.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &interpreter.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }

    /// Start a named session and wait until its interpreter is ready.
    pub async fn create_session(&self, id: &str) -> Result<Arc<SessionHandle>, GatewayError> {
        self.create(id, false).await
    }

    /// Start a session under a generated `temp_<uuid>` id. The caller is
    /// responsible for terminating it.
    pub async fn create_ephemeral(&self) -> Result<Arc<SessionHandle>, GatewayError> {
        let id = format!("temp_{}", Uuid::new_v4().simple());
        self.create(&id, true).await
    }

    async fn create(&self, id: &str, ephemeral: bool) -> Result<Arc<SessionHandle>, GatewayError> {
        let reservation = self.registry.reserve(id)?;
        let program = &self.config.interpreter.program;

        log::info!("Starting interpreter for session {}: {}", id, program);
        let child = self.build_command().spawn().map_err(|e| {
            log::error!("Failed to spawn '{}' for session {}: {}", program, id, e);
            GatewayError::SpawnFailed(format!("{}: {}", program, e))
        })?;

        let handle = Arc::new(SessionHandle::attach(id, ephemeral, child)?);
        let started = Instant::now();

        match self.initialize(&handle).await {
            Ok(()) => {
                handle.set_state(SessionState::Ready);
                log::info!(
                    "Session {} ready in {:?} (pid {:?})",
                    id,
                    started.elapsed(),
                    handle.pid()
                );
                reservation.commit(handle.clone());
                Ok(handle)
            }
            Err(e) => {
                log::error!("Session {} failed to initialize: {}", id, e);
                handle.shutdown(None, self.config.timing.kill_grace()).await;
                Err(e)
            }
        }
    }

    /// Send the init script and block until the sentinel shows up or, without
    /// a sentinel, until the interpreter has been quiet for `init_idle`.
    async fn initialize(&self, handle: &SessionHandle) -> Result<(), GatewayError> {
        handle.set_state(SessionState::Initializing);

        let timing = &self.config.timing;
        let interpreter = &self.config.interpreter;
        let started = Instant::now();
        let deadline = started + timing.init_timeout();
        let sentinel = interpreter.ready_sentinel.as_deref();
        let mut last_activity = started;
        let mut seen = Vec::new();

        if let Some(script) = &interpreter.init_script {
            if let Err(e) = handle.write_line(script).await {
                log::error!("Session {}: writing init script failed: {}", handle.id(), e);
                return Err(GatewayError::ProcessCrashed {
                    session_id: handle.id().to_string(),
                    partial: seen,
                });
            }
        }

        loop {
            let closed = self.interpreter_gone(handle).await;
            for line in handle.drain_output() {
                if line.text.trim().is_empty() {
                    continue;
                }
                if line.received_at > last_activity {
                    last_activity = line.received_at;
                }
                if let Some(sentinel) = sentinel {
                    if line.kind == StreamKind::Stdout && line.text.contains(sentinel) {
                        handle.clear_output();
                        return Ok(());
                    }
                }
                seen.push(line.text);
            }

            if closed {
                return Err(GatewayError::ProcessCrashed {
                    session_id: handle.id().to_string(),
                    partial: seen,
                });
            }

            let now = Instant::now();
            let quiet_until = last_activity + timing.init_idle();
            if sentinel.is_none() && now >= quiet_until {
                if !seen.is_empty() {
                    log::debug!(
                        "Session {} printed {} lines during startup",
                        handle.id(),
                        seen.len()
                    );
                }
                handle.clear_output();
                return Ok(());
            }
            if now >= deadline {
                return Err(GatewayError::InitializationTimeout {
                    session_id: handle.id().to_string(),
                    waited_secs: timing.init_timeout().as_secs(),
                });
            }

            let wake_at = match sentinel {
                Some(_) => deadline,
                None => quiet_until.min(deadline),
            };
            handle.wait_for_output(wake_at.min(now + EXIT_POLL)).await;
        }
    }

    pub fn get(&self, id: &str) -> Result<Arc<SessionHandle>, GatewayError> {
        self.registry.get(id)
    }

    /// Run `code` in the session named `id`.
    pub async fn submit(&self, id: &str, code: &str) -> Result<CapturedOutput, GatewayError> {
        let handle = self.registry.get(id)?;
        self.submit_to(&handle, code).await
    }

    /// Run `code` in `handle` and wait for the interpreter to go quiet.
    ///
    /// Stderr output turns the result into `ChildStderrOutput`; hitting
    /// `max_wait` yields `SubmissionTimeout` and leaves the process running.
    /// If the interpreter exits the session is removed and torn down.
    pub async fn submit_to(
        &self,
        handle: &Arc<SessionHandle>,
        code: &str,
    ) -> Result<CapturedOutput, GatewayError> {
        let claim = handle.begin_execution()?;
        self.submit_claimed(handle, &claim, code).await
    }

    /// Like [`submit_to`](Self::submit_to), for a caller that already holds
    /// the session's execution claim and keeps it past the submission.
    pub async fn submit_claimed(
        &self,
        handle: &Arc<SessionHandle>,
        claim: &ExecutionGuard<'_>,
        code: &str,
    ) -> Result<CapturedOutput, GatewayError> {
        debug_assert!(std::ptr::eq(claim.session(), handle.as_ref()));
        let marker = self.clear_stale_output(handle).await;

        log::debug!("Session {}: submitting {} bytes", handle.id(), code.len());
        if let Err(e) = handle.write_line(code).await {
            log::error!("Session {}: writing code failed: {}", handle.id(), e);
            self.retire(handle).await;
            return Err(GatewayError::ProcessCrashed {
                session_id: handle.id().to_string(),
                partial: Vec::new(),
            });
        }

        let result = self.collect(handle, marker).await;
        if let Err(GatewayError::ProcessCrashed { .. }) = &result {
            self.retire(handle).await;
        }
        result
    }

    /// Discard output left over from earlier submissions. With a configured
    /// marker command, also flush anything still in flight by waiting for
    /// the marker to come back.
    async fn clear_stale_output(&self, handle: &SessionHandle) -> Option<String> {
        let discarded = handle.clear_output();
        if discarded > 0 {
            log::debug!("Session {}: discarded {} stale lines", handle.id(), discarded);
        }

        let template = self.config.interpreter.marker_command.as_deref()?;
        let marker = format!("__replgate_marker_{}", Uuid::new_v4().simple());
        if let Err(e) = handle.write_line(&template.replace("{marker}", &marker)).await {
            log::warn!("Session {}: marker not delivered: {}", handle.id(), e);
            return Some(marker);
        }

        let deadline = Instant::now() + self.config.timing.marker_timeout();
        loop {
            if handle.stdout().drain().iter().any(|l| l.text.trim() == marker) {
                break;
            }
            if Instant::now() >= deadline || self.interpreter_gone(handle).await {
                log::warn!(
                    "Session {}: marker not echoed within {:?}",
                    handle.id(),
                    self.config.timing.marker_timeout()
                );
                break;
            }
            handle
                .wait_for_output(deadline.min(Instant::now() + EXIT_POLL))
                .await;
        }
        handle.clear_output();
        Some(marker)
    }

    /// True once the interpreter can no longer produce output: both pipes hit
    /// EOF, or the process itself exited. A background child of the
    /// interpreter can keep the pipes open after the interpreter is gone.
    async fn interpreter_gone(&self, handle: &SessionHandle) -> bool {
        if handle.streams_closed() {
            return true;
        }
        if !handle.has_exited().await {
            return false;
        }
        tokio::time::sleep(EXIT_SETTLE).await;
        true
    }

    async fn collect(
        &self,
        handle: &SessionHandle,
        marker: Option<String>,
    ) -> Result<CapturedOutput, GatewayError> {
        let timing = &self.config.timing;
        let mut detector = CompletionDetector::new(timing.idle(), timing.max_wait(), Instant::now())
            .with_dedupe(self.config.interpreter.dedupe_output);
        if let Some(marker) = marker {
            detector = detector.ignoring(marker);
        }

        loop {
            let closed = self.interpreter_gone(handle).await;
            for line in handle.drain_output() {
                detector.observe(line);
            }

            if closed {
                log::error!("Session {}: interpreter exited during execution", handle.id());
                return Err(GatewayError::ProcessCrashed {
                    session_id: handle.id().to_string(),
                    partial: detector.finish().combined(),
                });
            }

            match detector.verdict(Instant::now()) {
                Verdict::Pending { wake_at } => {
                    handle
                        .wait_for_output(wake_at.min(Instant::now() + EXIT_POLL))
                        .await
                }
                Verdict::Completed => return Ok(detector.finish()),
                Verdict::Errored => {
                    let captured = detector.finish();
                    log::info!(
                        "Session {}: execution finished with {} stderr lines",
                        handle.id(),
                        captured.stderr.len()
                    );
                    return Err(GatewayError::ChildStderrOutput {
                        stderr: captured.stderr,
                        stdout: captured.stdout,
                    });
                }
                Verdict::TimedOut => {
                    log::warn!(
                        "Session {}: no completion within {:?}, leaving interpreter running",
                        handle.id(),
                        timing.max_wait()
                    );
                    return Err(GatewayError::SubmissionTimeout {
                        session_id: handle.id().to_string(),
                        waited_secs: timing.max_wait().as_secs(),
                        partial: detector.finish().combined(),
                    });
                }
            }
        }
    }

    async fn retire(&self, handle: &Arc<SessionHandle>) {
        self.registry.remove_if_same(handle.id(), handle);
        handle.shutdown(None, self.config.timing.kill_grace()).await;
    }

    /// Stop a session and forget it. Returns whether the id was live;
    /// unknown ids are not an error.
    pub async fn terminate_session(&self, id: &str) -> bool {
        match self.registry.remove(id) {
            Some(handle) => {
                log::info!("Terminating session {}", id);
                self.stop(&handle).await;
                true
            }
            None => {
                log::debug!("Terminate for unknown session {}", id);
                false
            }
        }
    }

    /// Tear down a handle that is not (or no longer) in the registry.
    pub async fn terminate_handle(&self, handle: &Arc<SessionHandle>) {
        self.registry.remove_if_same(handle.id(), handle);
        self.stop(handle).await;
    }

    async fn stop(&self, handle: &SessionHandle) {
        handle
            .shutdown(
                self.config.interpreter.exit_command.as_deref(),
                self.config.timing.kill_grace(),
            )
            .await;
    }

    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .registry
            .list()
            .into_iter()
            .map(|(_, handle)| handle.info())
            .collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        sessions
    }

    /// Terminate every live session.
    pub async fn shutdown(&self) {
        let sessions = self.registry.drain();
        if sessions.is_empty() {
            return;
        }
        log::info!("Shutting down {} sessions", sessions.len());
        for (_, handle) in sessions {
            self.stop(&handle).await;
        }
    }
}

//! Error taxonomy for session supervision and code execution
//!
//! Every failure the gateway can observe is named here, from request-level
//! conditions (unknown or duplicate session ids) to child-level conditions
//! (timeouts, crashes, diagnostic output). Child-level variants carry whatever
//! output was captured so callers can always show the user what the
//! interpreter printed before things went wrong.

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum GatewayError {
    #[error("Session already exists: {0}")]
    SessionAlreadyExists(String),
    #[error("Session not found: {0}")]
    SessionNotFound(String),
    #[error("Session is busy: {0}")]
    SessionBusy(String),
    #[error("Session '{session_id}' did not become ready within {waited_secs}s")]
    InitializationTimeout { session_id: String, waited_secs: u64 },
    #[error("No completion detected for session '{session_id}' within {waited_secs}s")]
    SubmissionTimeout {
        session_id: String,
        waited_secs: u64,
        partial: Vec<String>,
    },
    #[error("{}", stderr.join("\n"))]
    ChildStderrOutput {
        stderr: Vec<String>,
        stdout: Vec<String>,
    },
    #[error("Interpreter process for session '{session_id}' exited unexpectedly")]
    ProcessCrashed {
        session_id: String,
        partial: Vec<String>,
    },
    #[error("Artifact read failed: {0}")]
    ArtifactReadFailure(String),
    #[error("Package installation failed: {0}")]
    PackageInstallFailed(String),
    #[error("Failed to spawn interpreter: {0}")]
    SpawnFailed(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("I/O error: {0}")]
    IoError(String),
}

impl GatewayError {
    /// Stable snake_case tag, used as `error_type` on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::SessionAlreadyExists(_) => "session_already_exists",
            GatewayError::SessionNotFound(_) => "session_not_found",
            GatewayError::SessionBusy(_) => "session_busy",
            GatewayError::InitializationTimeout { .. } => "initialization_timeout",
            GatewayError::SubmissionTimeout { .. } => "submission_timeout",
            GatewayError::ChildStderrOutput { .. } => "child_stderr_output",
            GatewayError::ProcessCrashed { .. } => "process_crashed",
            GatewayError::ArtifactReadFailure(_) => "artifact_read_failure",
            GatewayError::PackageInstallFailed(_) => "package_install_failed",
            GatewayError::SpawnFailed(_) => "spawn_failed",
            GatewayError::ConfigError(_) => "config_error",
            GatewayError::IoError(_) => "io_error",
        }
    }

    /// Output captured before the failure, if the variant carries any.
    pub fn captured_output(&self) -> &[String] {
        match self {
            GatewayError::SubmissionTimeout { partial, .. }
            | GatewayError::ProcessCrashed { partial, .. } => partial,
            GatewayError::ChildStderrOutput { stdout, .. } => stdout,
            _ => &[],
        }
    }

    /// True for failures caused by the interpreter rather than by the request.
    pub fn is_execution_failure(&self) -> bool {
        matches!(
            self,
            GatewayError::SubmissionTimeout { .. }
                | GatewayError::ChildStderrOutput { .. }
                | GatewayError::ProcessCrashed { .. }
                | GatewayError::PackageInstallFailed(_)
        )
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        GatewayError::IoError(err.to_string())
    }
}

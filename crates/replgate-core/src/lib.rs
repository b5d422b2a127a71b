//! Session-scoped supervision of long-lived interpreter processes.
//!
//! Each session owns one interactive interpreter (a REPL-style child process
//! driven over stdin/stdout/stderr). Code submitted to a session runs in that
//! process, so state defined by one submission is visible to the next while
//! sessions stay fully isolated from each other.
//!
//! # Architecture Overview
//!
//! - **Sessions**: a child process plus two output pumps draining its pipes
//! - **Registry**: the id → session map with atomic creation
//! - **Supervisor**: spawn, readiness, idle-based completion detection, teardown
//! - **Artifacts**: files the code leaves at a per-session path, returned base64-encoded
//! - **Packages**: optional on-demand installation of imported packages
//! - **Filter**: removal of interpreter noise from returned text
//! - **Configuration**: YAML with env-file based variable resolution

pub mod artifacts;
pub mod config;
pub mod errors;
pub mod filter;
pub mod gateway;
pub mod packages;
pub mod session;
pub mod supervisor;

pub use artifacts::{Artifact, ArtifactCollector, ArtifactPayload};
pub use config::*;
pub use errors::GatewayError;
pub use filter::{OutputFilter, PassthroughFilter, ReplNoiseFilter};
pub use gateway::{ExecutionError, ExecutionResult, Gateway};
pub use packages::{CommandInstaller, DependencyInstaller};
pub use session::{SessionHandle, SessionInfo, SessionRegistry, SessionState};
pub use supervisor::{CapturedOutput, ProcessSupervisor};

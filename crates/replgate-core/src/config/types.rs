//! Configuration type definitions for the gateway
//!
//! A configuration names the interpreter to run (program, arguments and the
//! complete environment it sees), the timing constants of the completion
//! protocol, where artifacts are expected, and the optional collaborators
//! (package pre-install, output filtering). Every section except
//! `interpreter` has defaults, so a minimal YAML file only has to say which
//! program to launch.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::errors::GatewayError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerSettings,
    pub interpreter: InterpreterConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub artifacts: ArtifactConfig,
    #[serde(default)]
    pub packages: PackageConfig,
    #[serde(default)]
    pub filter: FilterConfig,
    #[serde(default)]
    pub environment: EnvironmentConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Allowed CORS origins; `None` allows any origin.
    #[serde(default)]
    pub cors_origins: Option<Vec<String>>,
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
}

/// How to launch and talk to the interpreter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterpreterConfig {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// The complete child environment. Nothing from the gateway's own
    /// environment leaks into the child unless listed in `inherit_env`.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Variable names copied from the gateway environment at load time.
    #[serde(default)]
    pub inherit_env: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Statements sent once after spawn (library loading etc.).
    #[serde(default)]
    pub init_script: Option<String>,
    /// A stdout line containing this text marks the session ready. Without
    /// it readiness falls back to `timing.init_idle_ms` of silence.
    #[serde(default)]
    pub ready_sentinel: Option<String>,
    #[serde(default)]
    pub exit_command: Option<String>,
    /// Statement that prints `{marker}`; used to confirm the output buffers
    /// are empty before a submission.
    #[serde(default)]
    pub marker_command: Option<String>,
    /// Wraps submitted code; supports `{code}` and `{artifact_path}`.
    #[serde(default)]
    pub code_template: Option<String>,
    #[serde(default = "default_true")]
    pub dedupe_output: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    #[serde(default = "default_idle_ms")]
    pub idle_ms: u64,
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,
    #[serde(default = "default_init_timeout_ms")]
    pub init_timeout_ms: u64,
    #[serde(default = "default_init_idle_ms")]
    pub init_idle_ms: u64,
    #[serde(default = "default_marker_timeout_ms")]
    pub marker_timeout_ms: u64,
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub dir: Option<PathBuf>,
    #[serde(default = "default_artifact_prefix")]
    pub prefix: String,
    #[serde(default = "default_artifact_extension")]
    pub extension: String,
    #[serde(default = "default_artifact_mime")]
    pub mime: String,
    #[serde(default = "default_artifact_min_size")]
    pub min_size: usize,
    /// Text that must occur in a valid artifact.
    #[serde(default = "default_artifact_marker")]
    pub marker: Option<String>,
    #[serde(default = "default_poll_attempts")]
    pub poll_attempts: u32,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Defaults to the interpreter program.
    #[serde(default)]
    pub install_program: Option<String>,
    /// Arguments for the one-shot installer; `{package}` is substituted.
    #[serde(default = "default_install_args")]
    pub install_args: Vec<String>,
    /// Packages the init script already loads; never installed on demand.
    #[serde(default)]
    pub preloaded: Vec<String>,
    #[serde(default = "default_install_timeout_ms")]
    pub install_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_drop_prefixes")]
    pub drop_prefixes: Vec<String>,
    #[serde(default = "default_drop_substrings")]
    pub drop_substrings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EnvironmentConfig {
    /// `KEY=VALUE` files consulted when resolving `$VAR` references.
    #[serde(default)]
    pub env_files: Vec<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub file: Option<PathBuf>,
}

// Default value functions
fn default_bind_addr() -> String {
    "127.0.0.1:5000".to_string()
}

fn default_max_body_size() -> usize {
    1024 * 1024
}

fn default_true() -> bool {
    true
}

fn default_idle_ms() -> u64 {
    1_000
}

fn default_max_wait_ms() -> u64 {
    15_000
}

fn default_init_timeout_ms() -> u64 {
    60_000
}

fn default_init_idle_ms() -> u64 {
    2_000
}

fn default_marker_timeout_ms() -> u64 {
    1_000
}

fn default_kill_grace_ms() -> u64 {
    3_000
}

fn default_artifact_prefix() -> String {
    "output_".to_string()
}

fn default_artifact_extension() -> String {
    "svg".to_string()
}

fn default_artifact_mime() -> String {
    "image/svg+xml".to_string()
}

fn default_artifact_min_size() -> usize {
    100
}

fn default_artifact_marker() -> Option<String> {
    Some("<svg".to_string())
}

fn default_poll_attempts() -> u32 {
    5
}

fn default_poll_interval_ms() -> u64 {
    200
}

fn default_install_args() -> Vec<String> {
    vec![
        "-e".to_string(),
        "using Pkg; Pkg.add(\"{package}\")".to_string(),
    ]
}

fn default_install_timeout_ms() -> u64 {
    300_000
}

fn default_drop_prefixes() -> Vec<String> {
    vec!["julia>".to_string()]
}

fn default_drop_substrings() -> Vec<String> {
    vec!["DeprecationWarning".to_string(), "WARNING".to_string()]
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            cors_origins: None,
            max_body_size: default_max_body_size(),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            idle_ms: default_idle_ms(),
            max_wait_ms: default_max_wait_ms(),
            init_timeout_ms: default_init_timeout_ms(),
            init_idle_ms: default_init_idle_ms(),
            marker_timeout_ms: default_marker_timeout_ms(),
            kill_grace_ms: default_kill_grace_ms(),
        }
    }
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: None,
            prefix: default_artifact_prefix(),
            extension: default_artifact_extension(),
            mime: default_artifact_mime(),
            min_size: default_artifact_min_size(),
            marker: default_artifact_marker(),
            poll_attempts: default_poll_attempts(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Default for PackageConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            install_program: None,
            install_args: default_install_args(),
            preloaded: Vec::new(),
            install_timeout_ms: default_install_timeout_ms(),
        }
    }
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            drop_prefixes: default_drop_prefixes(),
            drop_substrings: default_drop_substrings(),
        }
    }
}

impl InterpreterConfig {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: HashMap::new(),
            inherit_env: Vec::new(),
            working_dir: None,
            init_script: None,
            ready_sentinel: None,
            exit_command: None,
            marker_command: None,
            code_template: None,
            dedupe_output: true,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_init_script(mut self, script: impl Into<String>) -> Self {
        self.init_script = Some(script.into());
        self
    }

    pub fn with_ready_sentinel(mut self, sentinel: impl Into<String>) -> Self {
        self.ready_sentinel = Some(sentinel.into());
        self
    }

    pub fn with_exit_command(mut self, command: impl Into<String>) -> Self {
        self.exit_command = Some(command.into());
        self
    }

    pub fn with_marker_command(mut self, command: impl Into<String>) -> Self {
        self.marker_command = Some(command.into());
        self
    }

    pub fn with_code_template(mut self, template: impl Into<String>) -> Self {
        self.code_template = Some(template.into());
        self
    }
}

impl TimingConfig {
    pub fn idle(&self) -> Duration {
        Duration::from_millis(self.idle_ms)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }

    pub fn init_idle(&self) -> Duration {
        Duration::from_millis(self.init_idle_ms)
    }

    pub fn marker_timeout(&self) -> Duration {
        Duration::from_millis(self.marker_timeout_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

impl ArtifactConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Configured directory, or `<cache dir>/replgate/artifacts`.
    pub fn resolved_dir(&self) -> PathBuf {
        match &self.dir {
            Some(dir) => dir.clone(),
            None => dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("replgate")
                .join("artifacts"),
        }
    }
}

impl PackageConfig {
    pub fn install_timeout(&self) -> Duration {
        Duration::from_millis(self.install_timeout_ms)
    }
}

impl GatewayConfig {
    /// Configuration with every optional section defaulted.
    pub fn for_interpreter(interpreter: InterpreterConfig) -> Self {
        Self {
            server: ServerSettings::default(),
            interpreter,
            timing: TimingConfig::default(),
            artifacts: ArtifactConfig::default(),
            packages: PackageConfig::default(),
            filter: FilterConfig::default(),
            environment: EnvironmentConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.interpreter.program.trim().is_empty() {
            return Err(GatewayError::ConfigError(
                "interpreter.program cannot be empty".to_string(),
            ));
        }

        if let Some(marker_command) = &self.interpreter.marker_command {
            if !marker_command.contains("{marker}") {
                return Err(GatewayError::ConfigError(
                    "interpreter.marker_command must contain the {marker} placeholder".to_string(),
                ));
            }
        }

        if let Some(template) = &self.interpreter.code_template {
            if !template.contains("{code}") {
                return Err(GatewayError::ConfigError(
                    "interpreter.code_template must contain the {code} placeholder".to_string(),
                ));
            }
        }

        let timing = &self.timing;
        if timing.idle_ms == 0 {
            return Err(GatewayError::ConfigError(
                "timing.idle_ms must be greater than 0".to_string(),
            ));
        }
        if timing.idle_ms >= timing.max_wait_ms {
            return Err(GatewayError::ConfigError(format!(
                "timing.idle_ms ({}) must be smaller than timing.max_wait_ms ({})",
                timing.idle_ms, timing.max_wait_ms
            )));
        }
        if timing.init_idle_ms >= timing.init_timeout_ms {
            return Err(GatewayError::ConfigError(format!(
                "timing.init_idle_ms ({}) must be smaller than timing.init_timeout_ms ({})",
                timing.init_idle_ms, timing.init_timeout_ms
            )));
        }

        if self.artifacts.enabled {
            if self.artifacts.poll_attempts == 0 {
                return Err(GatewayError::ConfigError(
                    "artifacts.poll_attempts must be at least 1".to_string(),
                ));
            }
            if self.artifacts.extension.is_empty() {
                return Err(GatewayError::ConfigError(
                    "artifacts.extension cannot be empty".to_string(),
                ));
            }
        }

        if self.packages.enabled
            && !self.packages.install_args.iter().any(|a| a.contains("{package}"))
        {
            return Err(GatewayError::ConfigError(
                "packages.install_args must reference {package}".to_string(),
            ));
        }

        Ok(())
    }
}

//! The public face of the crate: create, execute, terminate.
//!
//! [`Gateway`] combines the supervisor with the collaborators that surround a
//! submission (package installation, code templating, artifact collection
//! and output filtering) and converts interpreter-level failures into
//! structured results. Request-level failures stay errors.

use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

use crate::artifacts::{Artifact, ArtifactCollector};
use crate::config::GatewayConfig;
use crate::errors::GatewayError;
use crate::filter::{filter_from_config, OutputFilter};
use crate::packages::{CommandInstaller, DependencyInstaller};
use crate::session::{SessionHandle, SessionInfo};
use crate::supervisor::ProcessSupervisor;

/// Failure reported by the interpreter while running a submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionError {
    pub kind: String,
    pub message: String,
}

impl From<&GatewayError> for ExecutionError {
    fn from(err: &GatewayError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub session_id: String,
    /// Filtered stdout lines, in the order they were captured.
    pub text: Vec<String>,
    pub artifact: Option<Artifact>,
    pub error: Option<ExecutionError>,
    /// Packages installed before the code ran.
    pub installed: Vec<String>,
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

pub struct Gateway {
    supervisor: ProcessSupervisor,
    artifacts: Option<ArtifactCollector>,
    installer: Option<Box<dyn DependencyInstaller>>,
    filter: Box<dyn OutputFilter>,
}

impl Gateway {
    /// Validate `config` and build a gateway with the collaborators it enables.
    pub fn from_config(config: GatewayConfig) -> Result<Self, GatewayError> {
        config.validate()?;

        let artifacts = config
            .artifacts
            .enabled
            .then(|| ArtifactCollector::from_config(&config.artifacts));
        let installer: Option<Box<dyn DependencyInstaller>> = if config.packages.enabled {
            Some(Box::new(CommandInstaller::from_config(
                &config.packages,
                &config.interpreter,
            )))
        } else {
            None
        };
        let filter = filter_from_config(&config.filter);

        log::info!(
            "Gateway configured for '{}' (idle {}ms, max wait {}ms)",
            config.interpreter.program,
            config.timing.idle_ms,
            config.timing.max_wait_ms
        );

        Ok(Self {
            supervisor: ProcessSupervisor::new(config),
            artifacts,
            installer,
            filter,
        })
    }

    pub fn with_filter(mut self, filter: Box<dyn OutputFilter>) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_installer(mut self, installer: Box<dyn DependencyInstaller>) -> Self {
        self.installer = Some(installer);
        self
    }

    pub fn config(&self) -> &GatewayConfig {
        self.supervisor.config()
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    pub async fn create_session(&self, id: &str) -> Result<SessionInfo, GatewayError> {
        let handle = self.supervisor.create_session(id).await?;
        Ok(handle.info())
    }

    /// Run `code` in the named session, or in a throwaway session that is
    /// terminated afterwards when `session_id` is `None`.
    pub async fn execute(
        &self,
        session_id: Option<&str>,
        code: &str,
    ) -> Result<ExecutionResult, GatewayError> {
        match session_id {
            Some(id) => {
                let handle = self.supervisor.get(id)?;
                self.run(&handle, code).await
            }
            None => {
                let handle = self.supervisor.create_ephemeral().await?;
                let result = self.run(&handle, code).await;
                self.supervisor.terminate_handle(&handle).await;
                result
            }
        }
    }

    async fn run(
        &self,
        handle: &Arc<SessionHandle>,
        code: &str,
    ) -> Result<ExecutionResult, GatewayError> {
        // Held from package installation through artifact collection.
        let claim = handle.begin_execution()?;
        let session_id = handle.id().to_string();

        let mut installed = Vec::new();
        if let Some(installer) = &self.installer {
            match installer.ensure(code).await {
                Ok(packages) => installed = packages,
                Err(e) => {
                    log::error!("Session {}: {}", session_id, e);
                    return Ok(ExecutionResult {
                        session_id,
                        text: Vec::new(),
                        artifact: None,
                        error: Some(ExecutionError::from(&e)),
                        installed,
                    });
                }
            }
        }

        let artifact_path = match &self.artifacts {
            Some(collector) => match collector.prepare(&session_id).await {
                Ok(path) => Some(path),
                Err(e) => {
                    log::warn!("Session {}: artifacts unavailable: {}", session_id, e);
                    None
                }
            },
            None => None,
        };

        let wrapped = self.render_code(code, artifact_path.as_deref());
        let outcome = self.supervisor.submit_claimed(handle, &claim, &wrapped).await;

        let artifact = match (&self.artifacts, &artifact_path, &outcome) {
            (Some(collector), Some(_), Ok(_))
            | (Some(collector), Some(_), Err(GatewayError::ChildStderrOutput { .. })) => {
                collector.collect(&session_id).await
            }
            _ => None,
        };

        let result = match outcome {
            Ok(captured) => Ok(ExecutionResult {
                session_id,
                text: self.render_text(captured.stdout),
                artifact,
                error: None,
                installed,
            }),
            Err(e) if e.is_execution_failure() => Ok(ExecutionResult {
                text: self.render_text(e.captured_output().to_vec()),
                error: Some(ExecutionError::from(&e)),
                session_id,
                artifact,
                installed,
            }),
            Err(e) => Err(e),
        };
        drop(claim);
        result
    }

    fn render_code(&self, code: &str, artifact_path: Option<&Path>) -> String {
        match &self.config().interpreter.code_template {
            Some(template) => {
                let path = artifact_path
                    .map(|p| p.to_string_lossy().replace('\\', "/"))
                    .unwrap_or_default();
                template
                    .replace("{artifact_path}", &path)
                    .replace("{code}", code)
            }
            None => code.to_string(),
        }
    }

    fn render_text(&self, lines: Vec<String>) -> Vec<String> {
        self.filter.apply(lines)
    }

    /// Returns whether a live session was terminated.
    pub async fn terminate_session(&self, id: &str) -> bool {
        self.supervisor.terminate_session(id).await
    }

    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        self.supervisor.list_sessions()
    }

    pub async fn shutdown(&self) {
        self.supervisor.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InterpreterConfig;
    use crate::filter::PassthroughFilter;

    fn gateway_with_template(template: Option<&str>) -> Gateway {
        let mut interpreter = InterpreterConfig::new("/bin/sh");
        if let Some(template) = template {
            interpreter = interpreter.with_code_template(template);
        }
        let mut config = GatewayConfig::for_interpreter(interpreter);
        config.artifacts.enabled = false;
        Gateway::from_config(config).unwrap()
    }

    #[test]
    fn test_render_code_without_template_is_verbatim() {
        let gateway = gateway_with_template(None);
        assert_eq!(gateway.render_code("echo 1", None), "echo 1");
    }

    #[test]
    fn test_render_code_substitutes_placeholders() {
        let gateway = gateway_with_template(Some("begin\n{code}\nend\nsave(\"{artifact_path}\")"));
        let rendered = gateway.render_code("plot(x)", Some(Path::new("/tmp/out/output_s1.svg")));
        assert_eq!(
            rendered,
            "begin\nplot(x)\nend\nsave(\"/tmp/out/output_s1.svg\")"
        );
    }

    #[test]
    fn test_user_code_is_not_treated_as_template() {
        let gateway = gateway_with_template(Some("{code}; save(\"{artifact_path}\")"));
        let rendered = gateway.render_code("println(\"{artifact_path}\")", Some(Path::new("/a.svg")));
        assert_eq!(rendered, "println(\"{artifact_path}\"); save(\"/a.svg\")");
    }

    #[test]
    fn test_render_text_applies_filter() {
        let gateway = gateway_with_template(None);
        let lines = vec!["julia> x".to_string(), "4".to_string()];
        assert_eq!(gateway.render_text(lines.clone()), vec!["4"]);

        let gateway = gateway.with_filter(Box::new(PassthroughFilter));
        assert_eq!(gateway.render_text(lines), vec!["julia> x", "4"]);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = GatewayConfig::for_interpreter(InterpreterConfig::new("/bin/sh"));
        config.timing.idle_ms = 20_000;
        assert!(matches!(
            Gateway::from_config(config),
            Err(GatewayError::ConfigError(_))
        ));
    }
}

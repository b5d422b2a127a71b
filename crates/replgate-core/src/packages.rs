//! On-demand package installation before code runs.

use async_trait::async_trait;
use regex::Regex;
use std::collections::{BTreeSet, HashMap};
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::process::Command;

use crate::config::{InterpreterConfig, PackageConfig};
use crate::errors::GatewayError;

/// Makes sure whatever `code` imports is available. Returns the packages
/// that were installed.
#[async_trait]
pub trait DependencyInstaller: Send + Sync {
    async fn ensure(&self, code: &str) -> Result<Vec<String>, GatewayError>;
}

fn import_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^\s*(?:using|import)\s+([\w\.]+(?:\s*,\s*[\w\.]+)*)")
            .expect("import pattern is valid")
    })
}

/// Root package names referenced by `using`/`import` lines, minus `preloaded`.
pub fn required_packages(code: &str, preloaded: &[String]) -> Vec<String> {
    let mut required = BTreeSet::new();
    for captures in import_regex().captures_iter(code) {
        for name in captures[1].split(',') {
            let root = name.trim().split('.').next().unwrap_or_default();
            if root.is_empty() || preloaded.iter().any(|p| p == root) {
                continue;
            }
            required.insert(root.to_string());
        }
    }
    required.into_iter().collect()
}

/// Installs packages by running a one-shot child per package.
pub struct CommandInstaller {
    program: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    preloaded: Vec<String>,
    timeout: Duration,
}

impl CommandInstaller {
    pub fn from_config(packages: &PackageConfig, interpreter: &InterpreterConfig) -> Self {
        Self {
            program: packages
                .install_program
                .clone()
                .unwrap_or_else(|| interpreter.program.clone()),
            args: packages.install_args.clone(),
            env: interpreter.env.clone(),
            preloaded: packages.preloaded.clone(),
            timeout: packages.install_timeout(),
        }
    }

    async fn install(&self, package: &str) -> Result<(), String> {
        let args: Vec<String> = self
            .args
            .iter()
            .map(|a| a.replace("{package}", package))
            .collect();

        log::info!("Installing package {} via {}", package, self.program);
        let mut cmd = Command::new(&self.program);
        cmd.args(&args)
            .env_clear()
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(format!("{}: {}", package, e)),
            Err(_) => {
                return Err(format!(
                    "{}: installer did not finish within {:?}",
                    package, self.timeout
                ))
            }
        };

        if output.status.success() {
            log::info!("Package {} installed", package);
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            log::error!("Failed to install {}: {}", package, stderr.trim());
            Err(format!("{}: {}", package, stderr.trim()))
        }
    }
}

#[async_trait]
impl DependencyInstaller for CommandInstaller {
    async fn ensure(&self, code: &str) -> Result<Vec<String>, GatewayError> {
        let packages = required_packages(code, &self.preloaded);
        if packages.is_empty() {
            return Ok(Vec::new());
        }

        let mut failures = Vec::new();
        let mut installed = Vec::new();
        for package in packages {
            match self.install(&package).await {
                Ok(()) => installed.push(package),
                Err(message) => failures.push(message),
            }
        }

        if failures.is_empty() {
            Ok(installed)
        } else {
            Err(GatewayError::PackageInstallFailed(failures.join("\n")))
        }
    }
}

//! Configuration loader for YAML files and environment resolution
//!
//! Loading turns a YAML document into a `GatewayConfig` whose interpreter
//! environment is fully resolved: inherited variables are copied in and `$VAR`
//! references are replaced, so the supervisor never consults the ambient
//! environment when it spawns a child.

use crate::config::types::*;
use crate::errors::GatewayError;
use std::collections::HashMap;
use std::env;
use std::path::Path;
use tokio::fs;

/// Configuration loader with environment resolution
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a YAML file
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<GatewayConfig, GatewayError> {
        let path = path.as_ref();

        let content = fs::read_to_string(path).await.map_err(|e| {
            GatewayError::ConfigError(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        Self::from_str(&content, path.parent()).await
    }

    /// Load configuration from a YAML string. Relative `env_files` and
    /// artifact directories are resolved against `base_dir` when given.
    pub async fn from_str(
        content: &str,
        base_dir: Option<&Path>,
    ) -> Result<GatewayConfig, GatewayError> {
        let mut config: GatewayConfig = serde_yaml::from_str(content).map_err(|e| {
            GatewayError::ConfigError(format!("Failed to parse YAML config: {}", e))
        })?;

        if let Some(base_dir) = base_dir {
            Self::resolve_relative_paths(&mut config, base_dir);
        }

        Self::resolve_environment(&mut config).await?;

        config.validate()?;

        Ok(config)
    }

    fn resolve_relative_paths(config: &mut GatewayConfig, base_dir: &Path) {
        for env_file in &mut config.environment.env_files {
            if env_file.is_relative() {
                *env_file = base_dir.join(&*env_file);
            }
        }
        if let Some(dir) = &mut config.artifacts.dir {
            if dir.is_relative() {
                *dir = base_dir.join(&*dir);
            }
        }
    }

    /// Build the explicit child environment.
    async fn resolve_environment(config: &mut GatewayConfig) -> Result<(), GatewayError> {
        let mut file_vars = HashMap::new();
        for env_file in &config.environment.env_files {
            if env_file.exists() {
                Self::load_env_file(env_file, &mut file_vars).await?;
            } else {
                log::warn!("Env file {} not found, skipping", env_file.display());
            }
        }

        let lookup = |name: &str| -> Option<String> {
            file_vars
                .get(name)
                .cloned()
                .or_else(|| env::var(name).ok())
        };

        let interpreter = &mut config.interpreter;
        for name in &interpreter.inherit_env {
            if interpreter.env.contains_key(name) {
                continue;
            }
            match lookup(name) {
                Some(value) => {
                    interpreter.env.insert(name.clone(), value);
                }
                None => log::warn!("Inherited variable {} is not set", name),
            }
        }

        let mut resolved = HashMap::with_capacity(interpreter.env.len());
        for (key, value) in interpreter.env.iter() {
            resolved.insert(key.clone(), Self::resolve_reference(value, &lookup));
        }
        interpreter.env = resolved;

        Ok(())
    }

    /// `$NAME` and `${NAME}` are replaced when the variable is known;
    /// anything else is kept literally.
    fn resolve_reference(value: &str, lookup: &impl Fn(&str) -> Option<String>) -> String {
        let name = if let Some(inner) = value.strip_prefix("${").and_then(|v| v.strip_suffix('}')) {
            inner
        } else if let Some(inner) = value.strip_prefix('$') {
            inner
        } else {
            return value.to_string();
        };
        lookup(name).unwrap_or_else(|| value.to_string())
    }

    async fn load_env_file(
        path: &Path,
        vars: &mut HashMap<String, String>,
    ) -> Result<(), GatewayError> {
        let content = fs::read_to_string(path).await.map_err(|e| {
            GatewayError::ConfigError(format!(
                "Failed to read env file {}: {}",
                path.display(),
                e
            ))
        })?;

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some((key, value)) = line.split_once('=') {
                let key = key.trim();
                let value = value.trim().trim_matches('"').trim_matches('\'');
                vars.insert(key.to_string(), value.to_string());
            }
        }

        Ok(())
    }
}

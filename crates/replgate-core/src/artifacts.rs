//! Artifact collection.
//!
//! Code run in a session may leave a file at a path derived from the session
//! id. After the submission completes the collector polls for it, checks it,
//! encodes it for transport and deletes it. A missing artifact is normal; a
//! broken one is logged and dropped.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::ArtifactConfig;
use crate::errors::GatewayError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub kind: String,
    pub mime: String,
    pub bytes: Vec<u8>,
}

/// Wire form of an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactPayload {
    #[serde(rename = "type")]
    pub kind: String,
    pub mime: String,
    pub encoding: String,
    pub data: String,
}

impl Artifact {
    pub fn encode(&self) -> String {
        STANDARD.encode(&self.bytes)
    }

    pub fn to_payload(&self) -> ArtifactPayload {
        ArtifactPayload {
            kind: self.kind.clone(),
            mime: self.mime.clone(),
            encoding: "base64".to_string(),
            data: self.encode(),
        }
    }
}

impl ArtifactPayload {
    pub fn decode(&self) -> Result<Vec<u8>, GatewayError> {
        STANDARD
            .decode(&self.data)
            .map_err(|e| GatewayError::ArtifactReadFailure(format!("invalid base64: {}", e)))
    }
}

pub struct ArtifactCollector {
    dir: PathBuf,
    prefix: String,
    extension: String,
    mime: String,
    min_size: usize,
    marker: Option<String>,
    poll_attempts: u32,
    poll_interval: Duration,
}

impl ArtifactCollector {
    pub fn from_config(config: &ArtifactConfig) -> Self {
        Self {
            dir: config.resolved_dir(),
            prefix: config.prefix.clone(),
            extension: config.extension.clone(),
            mime: config.mime.clone(),
            min_size: config.min_size,
            marker: config.marker.clone(),
            poll_attempts: config.poll_attempts.max(1),
            poll_interval: config.poll_interval(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Where the artifact for `session_id` is expected.
    pub fn path_for(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!(
            "{}{}.{}",
            self.prefix,
            sanitize_id(session_id),
            self.extension
        ))
    }

    /// Make sure the directory exists and no stale file from an earlier
    /// submission is lying around.
    pub async fn prepare(&self, session_id: &str) -> Result<PathBuf, GatewayError> {
        tokio::fs::create_dir_all(&self.dir).await.map_err(|e| {
            GatewayError::IoError(format!(
                "Failed to create artifact directory {}: {}",
                self.dir.display(),
                e
            ))
        })?;

        let path = self.path_for(session_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => log::debug!("Removed stale artifact {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("Could not remove stale artifact {}: {}", path.display(), e),
        }
        Ok(path)
    }

    /// Wait for the artifact of `session_id`, validate it and remove it.
    pub async fn collect(&self, session_id: &str) -> Option<Artifact> {
        let path = self.path_for(session_id);

        for attempt in 1..=self.poll_attempts {
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                let result = self.read(&path).await;
                self.discard(&path).await;
                return match result {
                    Ok(artifact) => {
                        log::info!(
                            "Collected artifact for session {} ({} bytes)",
                            session_id,
                            artifact.bytes.len()
                        );
                        Some(artifact)
                    }
                    Err(e) => {
                        log::warn!("Dropping artifact for session {}: {}", session_id, e);
                        None
                    }
                };
            }
            if attempt < self.poll_attempts {
                tokio::time::sleep(self.poll_interval).await;
            }
        }

        log::debug!("No artifact produced for session {}", session_id);
        None
    }

    async fn read(&self, path: &Path) -> Result<Artifact, GatewayError> {
        let bytes = tokio::fs::read(path).await.map_err(|e| {
            GatewayError::ArtifactReadFailure(format!("{}: {}", path.display(), e))
        })?;

        if bytes.len() < self.min_size {
            return Err(GatewayError::ArtifactReadFailure(format!(
                "{} is {} bytes, expected at least {}",
                path.display(),
                bytes.len(),
                self.min_size
            )));
        }

        if let Some(marker) = &self.marker {
            if !contains(&bytes, marker.as_bytes()) {
                return Err(GatewayError::ArtifactReadFailure(format!(
                    "{} does not contain '{}'",
                    path.display(),
                    marker
                )));
            }
        }

        Ok(Artifact {
            kind: self.extension.clone(),
            mime: self.mime.clone(),
            bytes,
        })
    }

    async fn discard(&self, path: &Path) {
        if let Err(e) = tokio::fs::remove_file(path).await {
            log::warn!("Failed to delete artifact {}: {}", path.display(), e);
        }
    }
}

/// Encode an id for use in a file name. ASCII letters, digits and `-` are
/// kept; every other byte, `_` included, becomes `_xx` in lowercase hex, so
/// distinct ids always map to distinct names.
fn sanitize_id(id: &str) -> String {
    let mut encoded = String::with_capacity(id.len());
    for byte in id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' {
            encoded.push(char::from(byte));
        } else {
            encoded.push_str(&format!("_{:02x}", byte));
        }
    }
    encoded
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    needle.is_empty() || haystack.windows(needle.len()).any(|w| w == needle)
}

//! Configuration module for the gateway
//!
//! YAML configuration with serde defaults, env-file based variable
//! resolution and validation of the timing invariants.

pub mod loader;
pub mod types;

pub use loader::*;
pub use types::*;

use crate::errors::GatewayError;
use std::path::Path;

/// Load a configuration from a YAML file
pub async fn load_config<P: AsRef<Path>>(path: P) -> Result<GatewayConfig, GatewayError> {
    ConfigLoader::from_file(path).await
}

//! HTTP front end for the replgate gateway.
//!
//! Exposes session creation, code execution and termination as JSON
//! endpoints. Interpreter-level failures (diagnostics on stderr, timeouts,
//! crashed interpreters) are part of a successful execution response; only
//! request-level problems turn into HTTP error statuses.

pub mod error;

pub use error::{Result, ServerError};

use axum::extract::rejection::JsonRejection;
use axum::extract::{Json as AxumJson, State};
use axum::response::Json;
use axum::routing::{get, post};
use axum::{middleware, Router};
use replgate_core::{ArtifactPayload, Gateway, ServerSettings};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

/// Health check response.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub version: String,
    pub sessions: usize,
}

#[derive(Debug, Default, Deserialize)]
pub struct SessionRequest {
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ExecuteRequest {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Configuration for the HTTP server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Server bind address
    pub bind_addr: SocketAddr,
    /// Enable CORS
    pub enable_cors: bool,
    /// CORS allowed origins (if None, allows any origin)
    pub cors_origins: Option<Vec<String>>,
    /// Maximum request body size in bytes
    pub max_body_size: usize,
    /// Enable request logging
    pub enable_logging: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 5000)),
            enable_cors: true,
            cors_origins: None,
            max_body_size: 1024 * 1024,
            enable_logging: true,
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Server configuration from the `server` section of a gateway config.
    pub fn from_settings(settings: &ServerSettings) -> Result<Self> {
        let mut config = Self::new()
            .with_bind_addr_str(&settings.bind_addr)?
            .with_max_body_size(settings.max_body_size);
        config.cors_origins = settings.cors_origins.clone();
        Ok(config)
    }

    /// Parse and set the bind address from a string.
    pub fn with_bind_addr_str(mut self, addr: &str) -> Result<Self> {
        self.bind_addr = addr
            .parse()
            .map_err(|e| ServerError::config_error(format!("Invalid bind address '{}': {}", addr, e)))?;
        Ok(self)
    }

    pub fn with_cors(mut self, enable: bool) -> Self {
        self.enable_cors = enable;
        self
    }

    pub fn with_max_body_size(mut self, size: usize) -> Self {
        self.max_body_size = size;
        self
    }

    pub fn with_logging(mut self, enable: bool) -> Self {
        self.enable_logging = enable;
        self
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub config: ServerConfig,
}

fn required(value: Option<String>, field: &str) -> Result<String> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| ServerError::missing_field(field))
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: chrono::Utc::now(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        sessions: state.gateway.list_sessions().len(),
    })
}

/// Handler for the /sessions GET endpoint.
async fn sessions_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let sessions = state.gateway.list_sessions();
    Json(json!({
        "count": sessions.len(),
        "sessions": sessions,
        "timestamp": chrono::Utc::now()
    }))
}

/// Handler for the /create_session POST endpoint.
async fn create_session_handler(
    State(state): State<AppState>,
    payload: std::result::Result<AxumJson<SessionRequest>, JsonRejection>,
) -> Result<Json<serde_json::Value>> {
    let AxumJson(request) = payload?;
    let session_id = required(request.session_id, "session_id")?;
    log::info!("Creating session: {}", session_id);

    let info = state.gateway.create_session(&session_id).await?;
    Ok(Json(json!({
        "status": "success",
        "message": "Session created successfully",
        "session_id": info.id,
        "pid": info.pid,
        "timestamp": chrono::Utc::now()
    })))
}

/// Handler for the /execute POST endpoint.
async fn execute_handler(
    State(state): State<AppState>,
    payload: std::result::Result<AxumJson<ExecuteRequest>, JsonRejection>,
) -> Result<Json<serde_json::Value>> {
    let AxumJson(request) = payload?;
    let code = required(request.code, "code")?;
    let session_id = request.session_id.filter(|id| !id.trim().is_empty());

    log::info!(
        "Received code execution request for session: {}",
        session_id.as_deref().unwrap_or("<ephemeral>")
    );
    log::debug!("Code:\n{}", code);

    let result = state.gateway.execute(session_id.as_deref(), &code).await?;
    if let Some(error) = &result.error {
        log::info!("Execution in {} failed: {}", result.session_id, error.kind);
    }

    let images: Vec<ArtifactPayload> = result.artifact.iter().map(|a| a.to_payload()).collect();
    Ok(Json(json!({
        "session_id": result.session_id,
        "text": result.text,
        "images": images,
        "error": result.error.as_ref().map(|e| e.message.clone()),
        "error_type": result.error.as_ref().map(|e| e.kind.clone()),
        "installed_packages": result.installed,
        "timestamp": chrono::Utc::now()
    })))
}

/// Handler for the /terminate_session POST endpoint.
async fn terminate_session_handler(
    State(state): State<AppState>,
    payload: std::result::Result<AxumJson<SessionRequest>, JsonRejection>,
) -> Result<Json<serde_json::Value>> {
    let AxumJson(request) = payload?;
    let session_id = required(request.session_id, "session_id")?;
    log::info!("Terminating session: {}", session_id);

    let existed = state.gateway.terminate_session(&session_id).await;
    let message = if existed {
        "Session terminated successfully"
    } else {
        "Session was not running"
    };
    Ok(Json(json!({
        "status": "success",
        "message": message,
        "session_id": session_id,
        "existed": existed,
        "timestamp": chrono::Utc::now()
    })))
}

pub struct ReplgateServer {
    gateway: Arc<Gateway>,
    config: ServerConfig,
}

impl ReplgateServer {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self {
            gateway,
            config: ServerConfig::default(),
        }
    }

    pub fn with_config(gateway: Arc<Gateway>, config: ServerConfig) -> Self {
        Self { gateway, config }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Build the Axum router with all routes and middleware.
    pub fn build_router(&self) -> Router {
        let state = AppState {
            gateway: self.gateway.clone(),
            config: self.config.clone(),
        };

        let mut router = Router::new()
            .route("/health", get(health_handler))
            .route("/sessions", get(sessions_handler))
            .route("/create_session", post(create_session_handler))
            .route("/execute", post(execute_handler))
            .route("/terminate_session", post(terminate_session_handler))
            .with_state(state);

        if self.config.enable_logging {
            router = router.layer(middleware::from_fn(
                |request: axum::http::Request<axum::body::Body>,
                 next: axum::middleware::Next| async {
                    let request_id = uuid::Uuid::new_v4().to_string();
                    let method = request.method().clone();
                    let uri = request.uri().clone();

                    if uri.path() == "/health" {
                        log::debug!("Request {} {} {}", request_id, method, uri);
                    } else {
                        log::info!("Request {} {} {}", request_id, method, uri);
                    }

                    let start = std::time::Instant::now();
                    let response = next.run(request).await;
                    log::info!(
                        "Response {} {} in {:?}",
                        request_id,
                        response.status(),
                        start.elapsed()
                    );
                    response
                },
            ));
        }

        router = router
            .layer(RequestBodyLimitLayer::new(self.config.max_body_size))
            .layer(TraceLayer::new_for_http());

        if self.config.enable_cors {
            let cors_layer = if let Some(ref origins) = self.config.cors_origins {
                let origins: std::result::Result<Vec<_>, _> =
                    origins.iter().map(|s| s.parse()).collect();
                match origins {
                    Ok(origins) => CorsLayer::new()
                        .allow_origin(origins)
                        .allow_methods(Any)
                        .allow_headers(Any),
                    Err(_) => {
                        log::warn!("Invalid CORS origin configured, allowing any origin");
                        CorsLayer::permissive()
                    }
                }
            } else {
                CorsLayer::permissive()
            };
            router = router.layer(cors_layer);
        }

        router
    }

    /// Serve until `shutdown_signal` resolves, then terminate every session.
    pub async fn serve_with_shutdown<F>(self, shutdown_signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let router = self.build_router();
        let listener = TcpListener::bind(self.config.bind_addr)
            .await
            .map_err(|e| {
                ServerError::config_error(format!(
                    "Failed to bind to {}: {}",
                    self.config.bind_addr, e
                ))
            })?;

        log::info!("replgate server starting on {}", self.config.bind_addr);
        log::info!("Health check: http://{}/health", self.config.bind_addr);

        let served = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| ServerError::internal(format!("Server error: {}", e)));

        self.gateway.shutdown().await;
        log::info!("replgate server shut down gracefully");
        served
    }
}

/// Resolves on Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            log::info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            log::info!("Received SIGTERM, shutting down...");
        },
    }
}

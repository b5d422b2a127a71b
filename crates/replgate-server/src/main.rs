//! replgate server binary
//!
//! Loads a gateway configuration, starts the HTTP front end and terminates
//! every interpreter session when the server shuts down.

use anyhow::Result;
use clap::Parser;
use log::LevelFilter;
use replgate_core::config::ConfigLoader;
use replgate_core::Gateway;
use replgate_server::{shutdown_signal, ReplgateServer, ServerConfig};
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[clap(author, version, about = "replgate - run code in persistent interpreter sessions over HTTP")]
struct Cli {
    #[clap(long, short, default_value = "replgate.yaml", help = "Path to the gateway configuration file")]
    config: PathBuf,

    #[clap(long, help = "Override server.bind_addr from the configuration")]
    bind_addr: Option<String>,

    #[clap(long, short, help = "Log level (error, warn, info, debug, trace)")]
    log_level: Option<String>,

    #[clap(long, help = "Append logs to this file instead of stderr")]
    log_file: Option<PathBuf>,

    #[clap(long, help = "Disable CORS headers")]
    no_cors: bool,

    #[clap(long, help = "Disable per-request logging")]
    no_request_log: bool,
}

fn init_logging(level: &str, file: Option<&PathBuf>) -> Result<()> {
    let log_level_filter = level.parse().unwrap_or(LevelFilter::Info);
    let mut builder = env_logger::Builder::new();
    builder.filter_level(log_level_filter);

    if let Some(path) = file {
        let log_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| anyhow::anyhow!("Failed to open log file {}: {}", path.display(), e))?;
        builder.target(env_logger::Target::Pipe(Box::new(log_file)));
    }

    builder.init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ConfigLoader::from_file(&cli.config).await?;

    let log_level = cli
        .log_level
        .clone()
        .or_else(|| config.logging.level.clone())
        .unwrap_or_else(|| "info".to_string());
    let log_file = cli.log_file.clone().or_else(|| config.logging.file.clone());
    init_logging(&log_level, log_file.as_ref())?;

    log::info!("Configuration loaded from: {}", cli.config.display());

    let mut server_config = ServerConfig::from_settings(&config.server)?
        .with_cors(!cli.no_cors)
        .with_logging(!cli.no_request_log);
    if let Some(bind_addr) = &cli.bind_addr {
        server_config = server_config.with_bind_addr_str(bind_addr)?;
    }

    log::info!("Configuration:");
    log::info!("  Interpreter: {} {:?}", config.interpreter.program, config.interpreter.args);
    log::info!("  Bind address: {}", server_config.bind_addr);
    log::info!(
        "  Idle period: {}ms, max wait: {}ms",
        config.timing.idle_ms,
        config.timing.max_wait_ms
    );
    log::info!("  Artifacts: {}", if config.artifacts.enabled {
        config.artifacts.resolved_dir().display().to_string()
    } else {
        "disabled".to_string()
    });

    let gateway = Arc::new(Gateway::from_config(config)?);
    let server = ReplgateServer::with_config(gateway, server_config);

    server.serve_with_shutdown(shutdown_signal()).await?;

    Ok(())
}

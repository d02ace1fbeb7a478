#![forbid(unsafe_code)]

//! `mcp-bridge` binary: loads configuration, finds a free port, and serves
//! the proxy until ctrl-c or SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use mcp_bridge::port::find_available_port;
use mcp_bridge::server::{self, AppState};
use mcp_bridge::{AppError, GlobalConfig, Result};

#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "mcp-bridge", about = "MCP transport bridge", version, long_about = None)]
struct Cli {
    /// Default agent command offered to clients for stdio sessions.
    command: Option<String>,

    /// Arguments for the default agent command.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,

    /// Extra environment for spawned agents, as KEY=VALUE (repeatable).
    #[arg(short = 'e', long = "env", value_name = "KEY=VALUE")]
    env: Vec<String>,

    /// Optional TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Directory for per-server log files.
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Preferred listen port (overrides `PORT`).
    #[arg(long)]
    port: Option<u16>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!(version = env!("CARGO_PKG_VERSION"), "mcp-bridge bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    let config = load_config(args)?;
    info!(
        host = %config.host,
        preferred_port = config.port,
        default_command = %config.default_command,
        "configuration loaded"
    );

    let port = find_available_port(&config.host, config.port, config.max_port_probes).await?;
    let listener = TcpListener::bind((config.host.as_str(), port))
        .await
        .map_err(|err| AppError::Config(format!("failed to bind {}:{port}: {err}", config.host)))?;

    let state = Arc::new(AppState::new(config)?);
    let ct = CancellationToken::new();

    let mut server_handle = tokio::spawn(server::serve(state, listener, ct.clone()));
    info!(port, "mcp-bridge ready");

    let outcome = tokio::select! {
        () = shutdown_signal() => {
            info!("shutdown signal received");
            ct.cancel();
            server_handle.await
        }
        outcome = &mut server_handle => outcome,
    };

    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            error!(%err, "http server failed");
            return Err(err);
        }
        Err(err) => {
            return Err(AppError::Config(format!("server task panicked: {err}")));
        }
    }

    info!("mcp-bridge shut down");
    Ok(())
}

/// File, then environment, then command line.
fn load_config(args: Cli) -> Result<GlobalConfig> {
    let mut config = match &args.config {
        Some(path) => GlobalConfig::load_from_path(path)?,
        None => GlobalConfig::default(),
    };
    config.apply_env()?;
    config.apply_env_pairs(&args.env)?;

    if let Some(command) = args.command {
        config.default_command = command;
        config.default_args = args.args;
    }
    if let Some(dir) = args.log_dir {
        config.log_dir = dir;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    Ok(config)
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter).with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}

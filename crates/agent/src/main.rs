use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use helion_agent::config::{Config, LogLevel};
use helion_agent::supervisor::{self, FatalError};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Helion in-guest agent: speaks to the hypervisor over the paravirtual
/// serial channel.
#[derive(Parser, Debug)]
#[command(name = "helion-guest-agent", version)]
struct Args {
    /// Configuration file location.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Override the configured log level.
    #[arg(long, value_enum)]
    log_level: Option<LogLevel>,

    /// Serial device path, skipping port auto-detection.
    #[arg(long, value_name = "PATH")]
    device: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let mut cfg = match Config::load(args.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("helion-guest-agent: {err}");
            return ExitCode::from(1);
        }
    };
    if let Some(level) = args.log_level {
        cfg.log_level = level;
    }
    if let Some(device) = args.device {
        cfg.device_path = Some(device);
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cfg.log_level.as_str()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(version = helion_agent::AGENT_VERSION, "helion guest agent");
    match supervisor::run(cfg).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err @ FatalError::DevicePermission(_)) => {
            error!(%err, "cannot open the agent device");
            ExitCode::from(2)
        }
        Err(err) => {
            error!(%err, "initialization failed");
            ExitCode::from(1)
        }
    }
}

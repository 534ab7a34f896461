//! Process-wide lifecycle.
//!
//! Owns startup order (device factory, dispatcher, telemetry, session),
//! signal-driven graceful shutdown, and the boot-time device probe whose
//! outcome decides the process exit code.

use std::sync::Arc;

use helion_shared::PROTOCOL_VERSION;
use helion_shared::ops::Hello;
use tokio_retry::RetryIf;
use tokio_retry::strategy::{ExponentialBackoff, jitter};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{Config, ConfigError};
use crate::device::{self, DeviceError, DeviceFactory, DeviceReader, DeviceWriter};
use crate::dispatch::Dispatcher;
use crate::handler;
use crate::outbound::{OutboundHandle, OutboundSequence};
use crate::session::Session;
use crate::telemetry::{self, TelemetryProducer};

#[derive(Debug, thiserror::Error)]
pub enum FatalError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The device exists but this process will never be allowed to open
    /// it; exit code 2.
    #[error("device permission denied: {0}")]
    DevicePermission(String),
}

pub async fn run(cfg: Config) -> Result<(), FatalError> {
    let cfg = Arc::new(cfg);
    let device = device::platform_factory(&cfg);
    let shutdown = CancellationToken::new();
    spawn_signal_listener(shutdown.clone());
    run_with_device(cfg, device, shutdown).await
}

/// Everything but signal wiring, so tests can inject a device factory and
/// drive shutdown themselves.
pub async fn run_with_device(
    cfg: Arc<Config>,
    device: Arc<dyn DeviceFactory>,
    shutdown: CancellationToken,
) -> Result<(), FatalError> {
    let first_connection = boot_probe(&cfg, device.as_ref()).await?;

    let outbound = OutboundHandle::new();
    let seq = OutboundSequence::new();
    let dispatcher = Arc::new(Dispatcher::new(cfg.clone(), handler::registry()));
    let hello = Hello {
        protocol_version: PROTOCOL_VERSION,
        agent_version: crate::AGENT_VERSION.to_string(),
        capabilities: dispatcher.operations(),
        os: telemetry::os_identity(),
    };
    info!(
        device = %device.describe(),
        capabilities = hello.capabilities.len(),
        "agent starting"
    );

    let telemetry_task = tokio::spawn(
        TelemetryProducer::new(cfg.clone(), outbound.clone(), seq.clone()).run(shutdown.clone()),
    );

    let session = Session::new(cfg, dispatcher, outbound, seq, hello, shutdown.clone());
    session.run_forever(device, first_connection).await;

    // run_forever only returns on shutdown; the session has already
    // drained its handlers under the shutdown grace.
    let _ = telemetry_task.await;
    info!("agent stopped");
    Ok(())
}

/// Bounded open attempts at boot; a successful open is handed to the
/// session as its first connection. A permission error is permanent and
/// fatal; mere absence is not, because the hypervisor may attach the port
/// after we start.
async fn boot_probe(
    cfg: &Config,
    device: &dyn DeviceFactory,
) -> Result<Option<(DeviceReader, DeviceWriter)>, FatalError> {
    let strategy = ExponentialBackoff::from_millis(2)
        .factor((cfg.reconnect_backoff_initial_ms / 2).max(1))
        .max_delay(cfg.reconnect_backoff_max())
        .map(jitter)
        .take(cfg.boot_open_attempts.saturating_sub(1));

    let result = RetryIf::spawn(
        strategy,
        || device.open(),
        |err: &DeviceError| !matches!(err, DeviceError::PermissionDenied(_)),
    )
    .await;

    match result {
        Ok(pair) => Ok(Some(pair)),
        Err(DeviceError::PermissionDenied(msg)) => Err(FatalError::DevicePermission(msg)),
        Err(DeviceError::Unavailable(msg)) => {
            warn!(%msg, "device not reachable during boot; the connect loop keeps trying");
            Ok(None)
        }
    }
}

#[cfg(unix)]
fn spawn_signal_listener(shutdown: CancellationToken) {
    tokio::spawn(async move {
        use tokio::signal::unix::{SignalKind, signal};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(err) => {
                error!(%err, "cannot install SIGTERM handler");
                return;
            }
        };
        let mut int = match signal(SignalKind::interrupt()) {
            Ok(stream) => stream,
            Err(err) => {
                error!(%err, "cannot install SIGINT handler");
                return;
            }
        };

        tokio::select! {
            _ = term.recv() => {}
            _ = int.recv() => {}
        }
        info!("termination signal; draining");
        shutdown.cancel();

        tokio::select! {
            _ = term.recv() => {}
            _ = int.recv() => {}
        }
        warn!("second termination signal; exiting immediately");
        std::process::exit(0);
    });
}

#[cfg(not(unix))]
fn spawn_signal_listener(shutdown: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        info!("termination signal; draining");
        shutdown.cancel();
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("second termination signal; exiting immediately");
            std::process::exit(0);
        }
    });
}

//! Guest shutdown and reboot.
//!
//! The request is acknowledged as soon as it is scheduled; the host learns
//! about the actual power change from the keepalive gap, not from us.

use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use helion_shared::ops::{PowerRequest, op};
use tokio::process::Command;
use tracing::{error, info};

use super::{Handler, HandlerError, RequestContext};

pub struct PowerHandler {
    reboot: bool,
}

impl PowerHandler {
    pub fn shutdown() -> Self {
        PowerHandler { reboot: false }
    }

    pub fn reboot() -> Self {
        PowerHandler { reboot: true }
    }
}

impl Handler for PowerHandler {
    fn operation(&self) -> &'static str {
        if self.reboot { op::REBOOT } else { op::SHUTDOWN }
    }

    fn default_timeout(&self) -> Duration {
        Duration::from_secs(30)
    }

    fn handle(&self, ctx: RequestContext) -> BoxFuture<'static, Result<Vec<u8>, HandlerError>> {
        let reboot = self.reboot;
        async move {
            let req: PowerRequest = ctx.decode()?;
            check_privilege()?;

            let delay = Duration::from_secs(req.delay_secs);
            info!(
                cid = ctx.correlation_id,
                reboot,
                delay_secs = req.delay_secs,
                "power change scheduled"
            );
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let (program, args) = power_command(reboot);
                match Command::new(program).args(args).status().await {
                    Ok(status) if status.success() => {}
                    Ok(status) => error!(%status, program, "power command failed"),
                    Err(err) => error!(%err, program, "power command did not start"),
                }
            });

            Ok(Vec::new())
        }
        .boxed()
    }
}

#[cfg(unix)]
fn check_privilege() -> Result<(), HandlerError> {
    if nix::unistd::Uid::effective().is_root() {
        Ok(())
    } else {
        Err(HandlerError::PermissionDenied(
            "power control requires root".into(),
        ))
    }
}

#[cfg(not(unix))]
fn check_privilege() -> Result<(), HandlerError> {
    Ok(())
}

#[cfg(unix)]
fn power_command(reboot: bool) -> (&'static str, &'static [&'static str]) {
    if reboot {
        ("systemctl", &["reboot"])
    } else {
        ("systemctl", &["poweroff"])
    }
}

#[cfg(not(unix))]
fn power_command(reboot: bool) -> (&'static str, &'static [&'static str]) {
    if reboot {
        ("shutdown", &["/r", "/t", "0"])
    } else {
        ("shutdown", &["/s", "/t", "0"])
    }
}

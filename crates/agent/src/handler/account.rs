//! Guest account maintenance for the host's "reset password" flow.

use std::process::Stdio;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use helion_shared::ops::{PasswordResetRequest, op};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::info;

use super::{Handler, HandlerError, RequestContext};

pub struct PasswordResetHandler;

impl Handler for PasswordResetHandler {
    fn operation(&self) -> &'static str {
        op::PASSWORD_RESET
    }

    fn default_timeout(&self) -> Duration {
        Duration::from_secs(30)
    }

    fn handle(&self, ctx: RequestContext) -> BoxFuture<'static, Result<Vec<u8>, HandlerError>> {
        run(ctx).boxed()
    }
}

async fn run(ctx: RequestContext) -> Result<Vec<u8>, HandlerError> {
    let req: PasswordResetRequest = ctx.decode()?;
    if req.username.is_empty() || req.password.is_empty() {
        return Err(HandlerError::InvalidArgument(
            "username and password must be non-empty".into(),
        ));
    }
    reset(&ctx, &req).await?;
    info!(cid = ctx.correlation_id, user = %req.username, "password reset");
    Ok(Vec::new())
}

#[cfg(unix)]
async fn reset(ctx: &RequestContext, req: &PasswordResetRequest) -> Result<(), HandlerError> {
    nix::unistd::User::from_name(&req.username)
        .map_err(|err| HandlerError::Internal(format!("user lookup: {err}")))?
        .ok_or_else(|| HandlerError::NotFound(format!("no such user: {}", req.username)))?;

    let mut child = Command::new("chpasswd")
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound => {
                HandlerError::Unsupported("chpasswd is not available".into())
            }
            _ => err.into(),
        })?;

    if let Some(mut stdin) = child.stdin.take() {
        // chpasswd splits on the first colon, so passwords may contain one.
        stdin
            .write_all(format!("{}:{}\n", req.username, req.password).as_bytes())
            .await?;
    }

    let output = tokio::select! {
        output = child.wait_with_output() => output?,
        _ = ctx.cancelled() => return Err(ctx.interrupted()),
    };
    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if nix::unistd::Uid::effective().is_root() {
        Err(HandlerError::Internal(format!("chpasswd failed: {stderr}")))
    } else {
        Err(HandlerError::PermissionDenied(format!(
            "chpasswd refused: {stderr}"
        )))
    }
}

#[cfg(not(unix))]
async fn reset(ctx: &RequestContext, req: &PasswordResetRequest) -> Result<(), HandlerError> {
    let output = tokio::select! {
        output = Command::new("net")
            .args(["user", &req.username, &req.password])
            .kill_on_drop(true)
            .output() => output?,
        _ = ctx.cancelled() => return Err(ctx.interrupted()),
    };
    if output.status.success() {
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(HandlerError::Internal(format!("net user failed: {stderr}")))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::handler::testutil::test_ctx;
    use helion_shared::ops;

    #[tokio::test]
    async fn unknown_user_is_not_found() {
        let payload = ops::encode(&PasswordResetRequest {
            username: "helion-no-such-user".into(),
            password: "irrelevant".into(),
        })
        .unwrap();
        let (ctx, _e) = test_ctx(op::PASSWORD_RESET, payload, None);
        assert!(matches!(
            PasswordResetHandler.handle(ctx).await,
            Err(HandlerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn empty_username_is_invalid() {
        let payload = ops::encode(&PasswordResetRequest {
            username: String::new(),
            password: "x".into(),
        })
        .unwrap();
        let (ctx, _e) = test_ctx(op::PASSWORD_RESET, payload, None);
        assert!(matches!(
            PasswordResetHandler.handle(ctx).await,
            Err(HandlerError::InvalidArgument(_))
        ));
    }
}

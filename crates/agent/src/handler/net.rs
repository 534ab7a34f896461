//! Host-pushed network configuration.
//!
//! The document is opaque to the agent: it lands verbatim at the
//! configured drop-in path and the platform apply command makes it live.
//! Validation belongs to the tool, not to us.

use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use helion_shared::ops::{NetworkApplyRequest, op};
use tokio::process::Command;
use tracing::info;

use super::{Handler, HandlerError, RequestContext};

pub struct NetworkApplyHandler;

impl Handler for NetworkApplyHandler {
    fn operation(&self) -> &'static str {
        op::NETWORK_APPLY
    }

    fn default_timeout(&self) -> Duration {
        Duration::from_secs(60)
    }

    fn handle(&self, ctx: RequestContext) -> BoxFuture<'static, Result<Vec<u8>, HandlerError>> {
        run(ctx).boxed()
    }
}

async fn run(ctx: RequestContext) -> Result<Vec<u8>, HandlerError> {
    let req: NetworkApplyRequest = ctx.decode()?;
    if req.document.is_empty() {
        return Err(HandlerError::InvalidArgument(
            "empty network configuration document".into(),
        ));
    }

    let path = ctx.cfg.network_config_path.clone();
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|err| HandlerError::Internal(format!("create {}: {err}", parent.display())))?;
    }
    tokio::fs::write(&path, &req.document)
        .await
        .map_err(|err| HandlerError::Internal(format!("write {}: {err}", path.display())))?;

    let mut command = ctx.cfg.network_apply_command.iter();
    let Some(program) = command.next() else {
        return Err(HandlerError::Internal(
            "no network apply command configured".into(),
        ));
    };

    let output = tokio::select! {
        output = Command::new(program).args(command).kill_on_drop(true).output() => {
            output.map_err(|err| HandlerError::Internal(format!("{program}: {err}")))?
        }
        _ = ctx.cancelled() => return Err(ctx.interrupted()),
    };
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(HandlerError::Internal(format!(
            "{program} exited with {}: {stderr}",
            output.status
        )));
    }

    info!(
        cid = ctx.correlation_id,
        path = %path.display(),
        bytes = req.document.len(),
        "network configuration applied"
    );
    Ok(Vec::new())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::handler::testutil::test_ctx;
    use helion_shared::ops;
    use std::sync::Arc;

    fn ctx_with(document: &[u8], cfg: Config) -> RequestContext {
        let payload = ops::encode(&NetworkApplyRequest {
            document: document.to_vec(),
        })
        .unwrap();
        let (mut ctx, _e) = test_ctx(op::NETWORK_APPLY, payload, None);
        ctx.cfg = Arc::new(cfg);
        ctx
    }

    #[tokio::test]
    async fn writes_document_and_runs_apply() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("net/90-agent.yaml");
        let mut cfg = Config::default();
        cfg.network_config_path = target.clone();
        cfg.network_apply_command = vec!["true".into()];

        NetworkApplyHandler
            .handle(ctx_with(b"version: 2\n", cfg))
            .await
            .unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"version: 2\n");
    }

    #[tokio::test]
    async fn failing_apply_command_is_internal() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = Config::default();
        cfg.network_config_path = dir.path().join("doc");
        cfg.network_apply_command = vec!["false".into()];

        assert!(matches!(
            NetworkApplyHandler.handle(ctx_with(b"cfg", cfg)).await,
            Err(HandlerError::Internal(_))
        ));
    }

    #[tokio::test]
    async fn empty_document_is_invalid() {
        let cfg = Config::default();
        assert!(matches!(
            NetworkApplyHandler.handle(ctx_with(b"", cfg)).await,
            Err(HandlerError::InvalidArgument(_))
        ));
    }
}

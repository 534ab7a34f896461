//! Desktop session integration: clipboard and display resize.
//!
//! These only work when the guest has a graphical session. Headless
//! guests answer `Unavailable`, which the host treats as "no desktop",
//! not as a fault.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use helion_shared::ops::{
    self, ClipboardGetResponse, ClipboardSetRequest, DisplayResizeRequest, op,
};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{Handler, HandlerError, RequestContext};

const X11_SOCKET_DIR: &str = "/tmp/.X11-unix";

pub struct ClipboardGetHandler;

impl Handler for ClipboardGetHandler {
    fn operation(&self) -> &'static str {
        op::CLIPBOARD_GET
    }

    fn default_timeout(&self) -> Duration {
        Duration::from_secs(15)
    }

    fn handle(&self, ctx: RequestContext) -> BoxFuture<'static, Result<Vec<u8>, HandlerError>> {
        clipboard_get(ctx).boxed()
    }
}

pub struct ClipboardSetHandler;

impl Handler for ClipboardSetHandler {
    fn operation(&self) -> &'static str {
        op::CLIPBOARD_SET
    }

    fn default_timeout(&self) -> Duration {
        Duration::from_secs(15)
    }

    fn handle(&self, ctx: RequestContext) -> BoxFuture<'static, Result<Vec<u8>, HandlerError>> {
        clipboard_set(ctx).boxed()
    }
}

pub struct DisplayResizeHandler;

impl Handler for DisplayResizeHandler {
    fn operation(&self) -> &'static str {
        op::DISPLAY_RESIZE
    }

    fn default_timeout(&self) -> Duration {
        Duration::from_secs(15)
    }

    fn handle(&self, ctx: RequestContext) -> BoxFuture<'static, Result<Vec<u8>, HandlerError>> {
        display_resize(ctx).boxed()
    }
}

/// Locate the X display by its socket. `:0` style, no remote displays.
pub(crate) fn detect_display(socket_dir: &Path) -> Result<String, HandlerError> {
    let entries = std::fs::read_dir(socket_dir).map_err(|_| no_session())?;
    for entry in entries.flatten() {
        if let Some(number) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.strip_prefix('X'))
            .and_then(|n| n.parse::<u32>().ok())
        {
            return Ok(format!(":{number}"));
        }
    }
    Err(no_session())
}

fn no_session() -> HandlerError {
    HandlerError::Unavailable("no desktop session".into())
}

async fn clipboard_get(ctx: RequestContext) -> Result<Vec<u8>, HandlerError> {
    let display = detect_display(&PathBuf::from(X11_SOCKET_DIR))?;

    let output = tokio::select! {
        output = Command::new("xclip")
            .args(["-selection", "clipboard", "-o"])
            .env("DISPLAY", &display)
            .kill_on_drop(true)
            .output() => output.map_err(tool_missing)?,
        _ = ctx.cancelled() => return Err(ctx.interrupted()),
    };
    if !output.status.success() {
        // An empty selection is not a fault; xclip just has nothing to say.
        debug!(status = %output.status, "xclip read returned nothing");
        return Ok(ops::encode(&ClipboardGetResponse {
            data: Vec::new(),
            mime: "text/plain".into(),
        })?);
    }

    let mut data = output.stdout;
    let cap = ctx.cfg.max_chunk_size as usize;
    if data.len() > cap {
        warn!(len = data.len(), cap, "clipboard content truncated");
        data.truncate(cap);
    }
    Ok(ops::encode(&ClipboardGetResponse {
        data,
        mime: "text/plain".into(),
    })?)
}

async fn clipboard_set(ctx: RequestContext) -> Result<Vec<u8>, HandlerError> {
    let req: ClipboardSetRequest = ctx.decode()?;
    if req.data.len() > ctx.cfg.max_chunk_size as usize {
        return Err(HandlerError::InvalidArgument(format!(
            "clipboard payload exceeds {} bytes",
            ctx.cfg.max_chunk_size
        )));
    }
    let display = detect_display(&PathBuf::from(X11_SOCKET_DIR))?;

    let mut child = Command::new("xclip")
        .args(["-selection", "clipboard", "-i"])
        .env("DISPLAY", &display)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(tool_missing)?;
    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(&req.data).await?;
    }

    let status = tokio::select! {
        status = child.wait() => status?,
        _ = ctx.cancelled() => return Err(ctx.interrupted()),
    };
    if !status.success() {
        return Err(HandlerError::Unavailable(format!(
            "xclip write failed with {status}"
        )));
    }
    Ok(Vec::new())
}

async fn display_resize(ctx: RequestContext) -> Result<Vec<u8>, HandlerError> {
    let req: DisplayResizeRequest = ctx.decode()?;
    if req.width == 0 || req.height == 0 || !(req.scale > 0.0) {
        return Err(HandlerError::InvalidArgument(
            "width, height and scale must be positive".into(),
        ));
    }
    let display = detect_display(&PathBuf::from(X11_SOCKET_DIR))?;

    let query = Command::new("xrandr")
        .arg("--query")
        .env("DISPLAY", &display)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(tool_missing)?;
    let listing = String::from_utf8_lossy(&query.stdout).into_owned();
    let Some(output_name) = connected_output(&listing) else {
        return Err(HandlerError::Unsupported("no connected display output".into()));
    };

    let mode = format!("{}x{}", req.width, req.height);
    let mut args = vec![
        "--output".to_string(),
        output_name.to_string(),
        "--mode".to_string(),
        mode.clone(),
    ];
    if (req.scale - 1.0).abs() > f32::EPSILON {
        args.push("--scale".into());
        args.push(format!("{0}x{0}", req.scale));
    }

    let result = tokio::select! {
        result = Command::new("xrandr")
            .args(&args)
            .env("DISPLAY", &display)
            .kill_on_drop(true)
            .output() => result.map_err(tool_missing)?,
        _ = ctx.cancelled() => return Err(ctx.interrupted()),
    };
    if !result.status.success() {
        let stderr = String::from_utf8_lossy(&result.stderr).trim().to_string();
        return Err(HandlerError::Unsupported(format!(
            "mode {mode} rejected: {stderr}"
        )));
    }
    Ok(Vec::new())
}

pub(crate) fn connected_output(xrandr_listing: &str) -> Option<&str> {
    xrandr_listing.lines().find_map(|line| {
        let mut words = line.split_whitespace();
        let name = words.next()?;
        (words.next()? == "connected").then_some(name)
    })
}

fn tool_missing(err: std::io::Error) -> HandlerError {
    match err.kind() {
        std::io::ErrorKind::NotFound => {
            HandlerError::Unavailable("desktop tooling not installed".into())
        }
        _ => err.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::testutil::test_ctx;

    #[test]
    fn finds_a_display_socket() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("X0"), b"").unwrap();
        assert_eq!(detect_display(dir.path()).unwrap(), ":0");
    }

    #[test]
    fn no_socket_means_no_session() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            detect_display(dir.path()),
            Err(HandlerError::Unavailable(_))
        ));
    }

    #[test]
    fn parses_the_connected_output() {
        let listing = "\
Screen 0: minimum 320 x 200, current 1920 x 1080, maximum 8192 x 8192
Virtual-1 connected primary 1920x1080+0+0 (normal) 0mm x 0mm
Virtual-2 disconnected (normal)
";
        assert_eq!(connected_output(listing), Some("Virtual-1"));
        assert_eq!(connected_output("nothing here\n"), None);
    }

    #[tokio::test]
    async fn zero_dimensions_are_invalid() {
        let payload = ops::encode(&DisplayResizeRequest {
            width: 0,
            height: 1080,
            scale: 1.0,
        })
        .unwrap();
        let (ctx, _e) = test_ctx(op::DISPLAY_RESIZE, payload, None);
        assert!(matches!(
            DisplayResizeHandler.handle(ctx).await,
            Err(HandlerError::InvalidArgument(_))
        ));
    }
}

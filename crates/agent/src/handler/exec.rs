//! Process execution on behalf of the host.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use helion_shared::ops::{self, ExecuteProgress, ExecuteRequest, ExecuteResponse, op};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, warn};

use super::{Handler, HandlerError, RequestContext};

/// Grace between the soft and the hard kill once a run is over deadline.
const TERM_GRACE: Duration = Duration::from_secs(5);
/// Heartbeat cadence for progress events on long runs.
const PROGRESS_PERIOD: Duration = Duration::from_secs(1);

/// Lifecycle of one run. Logged on every transition; the terminal phase
/// decides the reported status.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Phase {
    Pending,
    Spawned,
    Running,
    Completed,
    TimedOut,
    Cancelled,
    Failed,
}

pub struct ExecuteHandler;

impl Handler for ExecuteHandler {
    fn operation(&self) -> &'static str {
        op::EXECUTE
    }

    fn default_timeout(&self) -> Duration {
        Duration::from_secs(60)
    }

    fn request_timeout(&self, payload: &[u8]) -> Option<Duration> {
        let req: ExecuteRequest = ops::decode(payload).ok()?;
        req.timeout_ms.map(Duration::from_millis)
    }

    fn handle(&self, ctx: RequestContext) -> BoxFuture<'static, Result<Vec<u8>, HandlerError>> {
        run(ctx).boxed()
    }
}

async fn run(ctx: RequestContext) -> Result<Vec<u8>, HandlerError> {
    let req: ExecuteRequest = ctx.decode()?;

    if let Some(stdin) = &req.stdin {
        if stdin.len() > ctx.cfg.max_chunk_size as usize {
            return Err(HandlerError::InvalidArgument(format!(
                "stdin exceeds {} bytes",
                ctx.cfg.max_chunk_size
            )));
        }
    }
    if let Some(cwd) = &req.cwd {
        if !Path::new(cwd).is_absolute() {
            return Err(HandlerError::InvalidArgument("cwd must be absolute".into()));
        }
    }

    let mut phase = Phase::Pending;
    let started = Instant::now();

    let mut cmd = Command::new(&req.command);
    cmd.args(&req.args)
        .envs(req.env.iter().cloned())
        .stdin(if req.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = &req.cwd {
        cmd.current_dir(cwd);
    }
    configure_platform(&mut cmd, req.run_as.as_deref())?;

    let mut child = cmd.spawn().map_err(|err| spawn_error(&req.command, err))?;
    advance(&mut phase, Phase::Spawned, ctx.correlation_id);

    // Feed stdin from its own task so a child that floods stdout before
    // reading stdin cannot deadlock against us.
    if let Some(bytes) = req.stdin {
        if let Some(mut pipe) = child.stdin.take() {
            tokio::spawn(async move {
                let _ = pipe.write_all(&bytes).await;
                // Dropping the pipe closes the child's stdin.
            });
        }
    }

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| HandlerError::Internal("child stdout not piped".into()))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| HandlerError::Internal("child stderr not piped".into()))?;

    let cap = ctx.cfg.max_exec_output_cap as usize;
    let mut out_buf = Vec::new();
    let mut err_buf = Vec::new();
    let mut out_chunk = [0u8; 8192];
    let mut err_chunk = [0u8; 8192];
    let mut stdout_open = true;
    let mut stderr_open = true;

    let mut heartbeat = interval_at(started + PROGRESS_PERIOD, PROGRESS_PERIOD);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);

    advance(&mut phase, Phase::Running, ctx.correlation_id);

    let status = loop {
        tokio::select! {
            read = stdout.read(&mut out_chunk), if stdout_open => match read {
                Ok(0) => stdout_open = false,
                Ok(n) => {
                    out_buf.extend_from_slice(&out_chunk[..n]);
                    if out_buf.len() > cap {
                        advance(&mut phase, Phase::Failed, ctx.correlation_id);
                        terminate(&mut child).await;
                        return Err(HandlerError::ResourceExhausted(format!(
                            "stdout exceeded {cap} bytes"
                        )));
                    }
                }
                Err(err) => {
                    advance(&mut phase, Phase::Failed, ctx.correlation_id);
                    terminate(&mut child).await;
                    return Err(err.into());
                }
            },
            read = stderr.read(&mut err_chunk), if stderr_open => match read {
                Ok(0) => stderr_open = false,
                Ok(n) => {
                    err_buf.extend_from_slice(&err_chunk[..n]);
                    if err_buf.len() > cap {
                        advance(&mut phase, Phase::Failed, ctx.correlation_id);
                        terminate(&mut child).await;
                        return Err(HandlerError::ResourceExhausted(format!(
                            "stderr exceeded {cap} bytes"
                        )));
                    }
                }
                Err(err) => {
                    advance(&mut phase, Phase::Failed, ctx.correlation_id);
                    terminate(&mut child).await;
                    return Err(err.into());
                }
            },
            _ = heartbeat.tick() => {
                let progress = ExecuteProgress {
                    stdout_bytes: out_buf.len() as u64,
                    stderr_bytes: err_buf.len() as u64,
                };
                if let Ok(payload) = ops::encode(&progress) {
                    ctx.events.emit(op::PROGRESS, payload).await;
                }
            }
            _ = ctx.cancelled() => {
                let err = ctx.interrupted();
                let terminal = if matches!(err, HandlerError::Timeout) {
                    Phase::TimedOut
                } else {
                    Phase::Cancelled
                };
                advance(&mut phase, terminal, ctx.correlation_id);
                terminate(&mut child).await;
                return Err(err);
            }
            status = child.wait(), if !stdout_open && !stderr_open => {
                break status?;
            }
        }
    };

    advance(&mut phase, Phase::Completed, ctx.correlation_id);
    let response = ExecuteResponse {
        exit_code: exit_code(&status),
        stdout: out_buf,
        stderr: err_buf,
        wall_time_ms: started.elapsed().as_millis() as u64,
    };
    Ok(ops::encode(&response)?)
}

fn advance(phase: &mut Phase, next: Phase, correlation_id: u64) {
    debug!(cid = correlation_id, from = ?*phase, to = ?next, "execute phase");
    *phase = next;
}

fn spawn_error(command: &str, err: std::io::Error) -> HandlerError {
    match err.kind() {
        std::io::ErrorKind::NotFound => HandlerError::NotFound(format!("no such command: {command}")),
        std::io::ErrorKind::PermissionDenied => {
            HandlerError::PermissionDenied(format!("cannot execute {command}"))
        }
        _ => err.into(),
    }
}

#[cfg(unix)]
fn configure_platform(cmd: &mut Command, run_as: Option<&str>) -> Result<(), HandlerError> {
    // Children get their own session and process group so a timeout can
    // take down the whole tree, not just the direct child.
    unsafe {
        cmd.pre_exec(|| {
            libc::setsid();
            Ok(())
        });
    }
    if let Some(name) = run_as {
        let user = nix::unistd::User::from_name(name)
            .map_err(|err| HandlerError::Internal(format!("user lookup: {err}")))?
            .ok_or_else(|| HandlerError::NotFound(format!("no such user: {name}")))?;
        cmd.uid(user.uid.as_raw()).gid(user.gid.as_raw());
    }
    Ok(())
}

#[cfg(not(unix))]
fn configure_platform(_cmd: &mut Command, run_as: Option<&str>) -> Result<(), HandlerError> {
    if run_as.is_some() {
        return Err(HandlerError::Unsupported(
            "run-as is only supported on Unix guests".into(),
        ));
    }
    Ok(())
}

/// Soft-kill the child's process group, give it [`TERM_GRACE`], then
/// hard-kill. Always reaps.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            let pgid = Pid::from_raw(pid as i32);
            if let Err(err) = killpg(pgid, Signal::SIGTERM) {
                warn!(%pgid, %err, "soft kill failed");
            }
            if tokio::time::timeout(TERM_GRACE, child.wait()).await.is_ok() {
                return;
            }
            let _ = killpg(pgid, Signal::SIGKILL);
        }
        let _ = child.wait().await;
    }
    #[cfg(not(unix))]
    {
        let _ = child.kill().await;
    }
}

#[cfg(unix)]
fn exit_code(status: &std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    // Signal deaths are reported as negative codes, matching the shell
    // convention the host side expects.
    status
        .code()
        .unwrap_or_else(|| -status.signal().unwrap_or(0))
}

#[cfg(not(unix))]
fn exit_code(status: &std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::handler::testutil::{decode_response, test_ctx};

    fn exec_payload(req: &ExecuteRequest) -> Vec<u8> {
        ops::encode(req).unwrap()
    }

    fn simple(command: &str, args: &[&str]) -> ExecuteRequest {
        ExecuteRequest {
            command: command.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn true_exits_zero() {
        let (ctx, _events) = test_ctx(op::EXECUTE, exec_payload(&simple("true", &[])), None);
        let payload = ExecuteHandler.handle(ctx).await.unwrap();
        let resp: ExecuteResponse = decode_response(&payload);
        assert_eq!(resp.exit_code, 0);
        assert!(resp.stdout.is_empty());
        assert!(resp.stderr.is_empty());
    }

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let req = simple("sh", &["-c", "echo out; echo err >&2; exit 3"]);
        let (ctx, _events) = test_ctx(op::EXECUTE, exec_payload(&req), None);
        let resp: ExecuteResponse = decode_response(&ExecuteHandler.handle(ctx).await.unwrap());
        assert_eq!(resp.exit_code, 3);
        assert_eq!(resp.stdout, b"out\n");
        assert_eq!(resp.stderr, b"err\n");
    }

    #[tokio::test]
    async fn stdin_reaches_the_child() {
        let mut req = simple("cat", &[]);
        req.stdin = Some(b"piped bytes".to_vec());
        let (ctx, _events) = test_ctx(op::EXECUTE, exec_payload(&req), None);
        let resp: ExecuteResponse = decode_response(&ExecuteHandler.handle(ctx).await.unwrap());
        assert_eq!(resp.stdout, b"piped bytes");
    }

    #[tokio::test]
    async fn env_is_additive() {
        let mut req = simple("sh", &["-c", "printf '%s' \"$HELION_TEST_MARKER\""]);
        req.env = vec![("HELION_TEST_MARKER".into(), "present".into())];
        let (ctx, _events) = test_ctx(op::EXECUTE, exec_payload(&req), None);
        let resp: ExecuteResponse = decode_response(&ExecuteHandler.handle(ctx).await.unwrap());
        assert_eq!(resp.stdout, b"present");
    }

    #[tokio::test]
    async fn missing_command_is_not_found() {
        let req = simple("/definitely/not/here", &[]);
        let (ctx, _events) = test_ctx(op::EXECUTE, exec_payload(&req), None);
        match ExecuteHandler.handle(ctx).await {
            Err(HandlerError::NotFound(_)) => {}
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn relative_cwd_is_rejected() {
        let mut req = simple("true", &[]);
        req.cwd = Some("relative/dir".into());
        let (ctx, _events) = test_ctx(op::EXECUTE, exec_payload(&req), None);
        assert!(matches!(
            ExecuteHandler.handle(ctx).await,
            Err(HandlerError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn deadline_kills_the_child() {
        let req = simple("sleep", &["30"]);
        let (ctx, _events) = test_ctx(
            op::EXECUTE,
            exec_payload(&req),
            Some(Duration::from_millis(300)),
        );
        let started = std::time::Instant::now();
        match ExecuteHandler.handle(ctx).await {
            Err(HandlerError::Timeout) => {}
            other => panic!("expected Timeout, got {other:?}"),
        }
        // Soft kill suffices for sleep; well inside the 5 s hard grace.
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn output_over_cap_is_resource_exhausted() {
        let mut cfg = crate::config::Config::default();
        cfg.max_exec_output_cap = 1024;
        let req = simple("sh", &["-c", "head -c 65536 /dev/zero"]);
        let (mut ctx, _events) = test_ctx(op::EXECUTE, exec_payload(&req), None);
        ctx.cfg = std::sync::Arc::new(cfg);
        assert!(matches!(
            ExecuteHandler.handle(ctx).await,
            Err(HandlerError::ResourceExhausted(_))
        ));
    }

    #[tokio::test]
    async fn long_runs_emit_progress() {
        let req = simple("sh", &["-c", "echo tick; sleep 2"]);
        let (ctx, mut events) = test_ctx(op::EXECUTE, exec_payload(&req), None);
        let handle = tokio::spawn(ExecuteHandler.handle(ctx));

        let frame = tokio::time::timeout(Duration::from_secs(3), events.recv())
            .await
            .expect("progress within the run")
            .expect("event frame");
        let msg = helion_shared::Message::decode(&frame).unwrap();
        assert_eq!(msg.operation, op::PROGRESS);
        let progress: ExecuteProgress = ops::decode(&msg.payload).unwrap();
        assert_eq!(progress.stdout_bytes, 5);

        handle.await.unwrap().unwrap();
    }
}

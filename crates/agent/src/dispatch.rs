//! Inbound request dispatch.
//!
//! One registry maps operation tags to handler capabilities. Every
//! accepted request runs as its own task and produces exactly one
//! response: on success, on error, on panic, on cancellation, or on
//! abandonment. The dispatch path itself never blocks the read-loop, even
//! with a saturated outbound queue.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use helion_shared::ErrorKind;
use helion_shared::message::{Kind, Message};
use helion_shared::ops::op;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::Config;
use crate::handler::{EventSink, Handler, RequestContext};
use crate::outbound::Frame;

struct Registration {
    handler: Arc<dyn Handler>,
    /// Per-operation concurrency cap; exceeding it answers `Busy`.
    permits: Option<Arc<Semaphore>>,
    /// Freeze and thaw share one slot: at most one quiesce operation runs
    /// at a time, whatever the per-operation caps say.
    serialize: Option<Arc<tokio::sync::Mutex<()>>>,
}

pub struct Dispatcher {
    cfg: Arc<Config>,
    handlers: HashMap<&'static str, Registration>,
    /// In-flight inbound requests by correlation id. The slot is `None`
    /// until the handler task is up; critical sections are map touches
    /// only.
    inflight: Arc<Mutex<HashMap<u64, Option<AbortHandle>>>>,
}

impl Dispatcher {
    pub fn new(cfg: Arc<Config>, handlers: Vec<Arc<dyn Handler>>) -> Self {
        let exec_permits = Arc::new(Semaphore::new(cfg.exec_concurrency));
        let quiesce_slot = Arc::new(tokio::sync::Mutex::new(()));

        let mut map = HashMap::new();
        for handler in handlers {
            let operation = handler.operation();
            let permits = match operation {
                op::EXECUTE => Some(exec_permits.clone()),
                op::FILE_READ | op::FILE_WRITE => {
                    Some(Arc::new(Semaphore::new(cfg.file_concurrency)))
                }
                _ => None,
            };
            let serialize =
                matches!(operation, op::FS_FREEZE | op::FS_THAW).then(|| quiesce_slot.clone());
            map.insert(
                operation,
                Registration {
                    handler,
                    permits,
                    serialize,
                },
            );
        }
        Dispatcher {
            cfg,
            handlers: map,
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Operation tags this agent serves, for the hello capability list.
    pub fn operations(&self) -> Vec<String> {
        let mut ops: Vec<String> = self.handlers.keys().map(|k| k.to_string()).collect();
        ops.sort();
        ops
    }

    pub fn inflight_len(&self) -> usize {
        self.inflight.lock().unwrap().len()
    }

    /// Route one inbound request. Returns as soon as the handler task is
    /// spawned (or the refusal response is queued off-task).
    pub fn dispatch(&self, msg: Message, out: mpsc::Sender<Frame>, requests: &CancellationToken) {
        debug_assert!(matches!(msg.kind, Kind::Request));
        let cid = msg.correlation_id;

        let Some(reg) = self.handlers.get(msg.operation.as_str()) else {
            warn!(cid, operation = %msg.operation, "unsupported operation");
            respond_detached(
                out,
                Message::response_err(
                    cid,
                    msg.operation.clone(),
                    ErrorKind::UnsupportedOperation,
                    "operation not supported by this agent",
                ),
            );
            return;
        };
        let operation = reg.handler.operation();

        // Reserve the correlation id; a duplicate is the peer misbehaving,
        // but only this request is refused for it.
        {
            let mut inflight = self.inflight.lock().unwrap();
            if inflight.contains_key(&cid) {
                drop(inflight);
                warn!(cid, operation, "duplicate in-flight correlation id");
                respond_detached(
                    out,
                    Message::response_err(
                        cid,
                        operation,
                        ErrorKind::ProtocolViolation,
                        "correlation id already in flight",
                    ),
                );
                return;
            }
            inflight.insert(cid, None);
        }

        let permit = match &reg.permits {
            Some(semaphore) => match semaphore.clone().try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    self.inflight.lock().unwrap().remove(&cid);
                    debug!(cid, operation, "concurrency cap reached");
                    respond_detached(
                        out,
                        Message::response_err(
                            cid,
                            operation,
                            ErrorKind::Busy,
                            "too many concurrent requests for this operation",
                        ),
                    );
                    return;
                }
            },
            None => None,
        };

        let requested = reg
            .handler
            .request_timeout(&msg.payload)
            .unwrap_or_else(|| reg.handler.default_timeout());
        let deadline = Instant::now() + requested.min(self.cfg.max_exec_timeout());
        let cancel = requests.child_token();

        let ctx = RequestContext {
            correlation_id: cid,
            operation,
            payload: msg.payload,
            deadline,
            cancel: cancel.clone(),
            events: EventSink::new(out.clone(), cid),
            cfg: self.cfg.clone(),
        };

        let watchdog = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                tokio::time::sleep_until(deadline).await;
                cancel.cancel();
            }
        });

        let handler = reg.handler.clone();
        let serialize = reg.serialize.clone();
        let inflight = self.inflight.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let _quiesce_guard = match &serialize {
                Some(slot) => Some(slot.lock().await),
                None => None,
            };

            let task = tokio::spawn(handler.handle(ctx));
            {
                let mut map = inflight.lock().unwrap();
                if let Some(slot) = map.get_mut(&cid) {
                    *slot = Some(task.abort_handle());
                }
            }

            let response = match task.await {
                Ok(Ok(payload)) => Message::response_ok(cid, operation, payload),
                Ok(Err(err)) => {
                    debug!(cid, operation, kind = %err.kind(), %err, "handler error");
                    Message::response_err(cid, operation, err.kind(), err.to_string())
                }
                Err(join_err) if join_err.is_panic() => {
                    error!(
                        cid,
                        operation,
                        panic = %panic_message(join_err),
                        "handler panicked"
                    );
                    Message::response_err(cid, operation, ErrorKind::Internal, "handler panicked")
                }
                Err(_) => {
                    warn!(cid, operation, "handler abandoned");
                    Message::response_err(cid, operation, ErrorKind::Cancelled, "request abandoned")
                }
            };
            watchdog.abort();

            // The response goes out before the in-flight entry clears, so
            // the id stays reserved until its answer is queued.
            match response.encode() {
                Ok(frame) => {
                    let _ = out.send(frame).await;
                }
                Err(err) => error!(cid, %err, "response encode failed"),
            }
            inflight.lock().unwrap().remove(&cid);
        });
    }

    /// True once the in-flight set is empty; false when `grace` ran out
    /// first.
    pub async fn wait_idle(&self, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        loop {
            if self.inflight.lock().unwrap().is_empty() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Abort handlers that ignored cancellation. Their supervising tasks
    /// still emit the abandonment response and clear the in-flight entry.
    pub fn force_abort(&self) {
        let handles: Vec<AbortHandle> = self
            .inflight
            .lock()
            .unwrap()
            .values()
            .filter_map(|slot| slot.clone())
            .collect();
        for handle in handles {
            handle.abort();
        }
    }
}

/// Queue a refusal without ever blocking the caller; back-pressure is
/// absorbed by a throwaway task.
fn respond_detached(out: mpsc::Sender<Frame>, response: Message) {
    match response.encode() {
        Ok(frame) => {
            tokio::spawn(async move {
                let _ = out.send(frame).await;
            });
        }
        Err(err) => error!(cid = response.correlation_id, %err, "response encode failed"),
    }
}

fn panic_message(join_err: tokio::task::JoinError) -> String {
    let payload = join_err.into_panic();
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "opaque panic payload".to_string()
    }
}

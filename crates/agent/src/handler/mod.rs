//! Privileged operation handlers.
//!
//! A handler is one named capability: it consumes a [`RequestContext`] and
//! eventually yields one response payload or one error, emitting progress
//! events along the way if it has any. Handlers never touch session state;
//! everything they may use arrives through the context.

pub mod account;
pub mod desktop;
pub mod exec;
pub mod file;
pub mod freeze;
pub mod net;
pub mod power;

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use helion_shared::message::Message;
use helion_shared::ops;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::outbound::Frame;

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("malformed payload")]
    Malformed,
    #[error("{0}")]
    InvalidArgument(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    PermissionDenied(String),
    #[error("deadline exceeded")]
    Timeout,
    #[error("{0}")]
    ResourceExhausted(String),
    #[error("{0}")]
    Unsupported(String),
    #[error("{0}")]
    Unavailable(String),
    #[error("cancelled")]
    Cancelled,
    #[error("{0}")]
    Internal(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl HandlerError {
    /// Wire status for this failure.
    pub fn kind(&self) -> helion_shared::ErrorKind {
        use helion_shared::ErrorKind;
        match self {
            HandlerError::Malformed => ErrorKind::Malformed,
            HandlerError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            HandlerError::NotFound(_) => ErrorKind::NotFound,
            HandlerError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            HandlerError::Timeout => ErrorKind::Timeout,
            HandlerError::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            HandlerError::Unsupported(_) => ErrorKind::Unsupported,
            HandlerError::Unavailable(_) => ErrorKind::Unavailable,
            HandlerError::Cancelled => ErrorKind::Cancelled,
            HandlerError::Internal(_) => ErrorKind::Internal,
            HandlerError::Io(err) => match err.kind() {
                std::io::ErrorKind::NotFound => ErrorKind::NotFound,
                std::io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
                std::io::ErrorKind::TimedOut => ErrorKind::Timeout,
                _ => ErrorKind::Internal,
            },
        }
    }
}

impl From<helion_shared::message::CodecError> for HandlerError {
    fn from(_: helion_shared::message::CodecError) -> Self {
        HandlerError::Malformed
    }
}

/// Everything one inbound request is allowed to see.
pub struct RequestContext {
    pub correlation_id: u64,
    pub operation: &'static str,
    pub payload: Vec<u8>,
    /// Wall-clock point past which the request counts as timed out.
    pub deadline: Instant,
    /// Fired on deadline expiry, session drain, or shutdown.
    pub cancel: CancellationToken,
    pub events: EventSink,
    pub cfg: Arc<Config>,
}

impl RequestContext {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        Ok(ops::decode(&self.payload)?)
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    pub fn deadline_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Error to report when the cancel signal interrupted the handler.
    /// The deadline watchdog fires the same signal, so disambiguate by
    /// clock.
    pub fn interrupted(&self) -> HandlerError {
        if self.deadline_expired() {
            HandlerError::Timeout
        } else {
            HandlerError::Cancelled
        }
    }
}

/// Sends progress events carrying this request's correlation id. Holds
/// only a narrow sender capability into the session's outbound queue.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<Frame>,
    correlation_id: u64,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<Frame>, correlation_id: u64) -> Self {
        EventSink { tx, correlation_id }
    }

    /// Enqueue one event, honoring queue back-pressure. Returns false once
    /// the session is gone; handlers may simply stop emitting then.
    pub async fn emit(&self, operation: &str, payload: Vec<u8>) -> bool {
        let Ok(frame) = Message::event(self.correlation_id, operation, payload).encode() else {
            return false;
        };
        self.tx.send(frame).await.is_ok()
    }
}

pub trait Handler: Send + Sync + 'static {
    /// Operation tag this capability serves.
    fn operation(&self) -> &'static str;

    /// Deadline applied when the request does not name its own timeout.
    fn default_timeout(&self) -> Duration {
        Duration::from_secs(30)
    }

    /// Timeout the request itself asks for, for operations whose payload
    /// carries one. The dispatcher still clamps it to `max_exec_timeout`.
    fn request_timeout(&self, _payload: &[u8]) -> Option<Duration> {
        None
    }

    fn handle(&self, ctx: RequestContext) -> BoxFuture<'static, Result<Vec<u8>, HandlerError>>;
}


/// The full production handler set, in registration order.
pub fn registry() -> Vec<Arc<dyn Handler>> {
    vec![
        Arc::new(exec::ExecuteHandler),
        Arc::new(file::FileReadHandler),
        Arc::new(file::FileWriteHandler),
        Arc::new(power::PowerHandler::shutdown()),
        Arc::new(power::PowerHandler::reboot()),
        Arc::new(account::PasswordResetHandler),
        Arc::new(net::NetworkApplyHandler),
        Arc::new(freeze::FsFreezeHandler),
        Arc::new(freeze::FsThawHandler),
        Arc::new(desktop::ClipboardGetHandler),
        Arc::new(desktop::ClipboardSetHandler),
        Arc::new(desktop::DisplayResizeHandler),
    ]
}

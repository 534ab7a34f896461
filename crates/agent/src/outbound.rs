//! Outbound frame plumbing.
//!
//! Serialized messages travel to the device through one bounded queue per
//! session. Handlers push with back-pressure; the telemetry producer must
//! never block, so it goes through [`OutboundHandle::try_send`], which is
//! also a no-op between sessions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

/// A fully encoded message, ready for the length prefix.
pub type Frame = Vec<u8>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueError {
    /// No session is `Ready`; the frame is discarded by design.
    NotReady,
    /// The queue is saturated; the caller decides whether to drop.
    Full,
}

/// Long-lived handle shared by the producers that outlive any single
/// session. The session installs its bounded sender on reaching `Ready`
/// and clears it when draining.
#[derive(Clone, Default)]
pub struct OutboundHandle {
    slot: Arc<Mutex<Option<mpsc::Sender<Frame>>>>,
}

impl OutboundHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(&self, tx: mpsc::Sender<Frame>) {
        *self.slot.lock().unwrap() = Some(tx);
    }

    pub fn clear(&self) {
        *self.slot.lock().unwrap() = None;
    }

    pub fn is_ready(&self) -> bool {
        self.slot.lock().unwrap().is_some()
    }

    /// Non-blocking push for one-way events.
    pub fn try_send(&self, frame: Frame) -> Result<(), EnqueueError> {
        let guard = self.slot.lock().unwrap();
        let Some(tx) = guard.as_ref() else {
            return Err(EnqueueError::NotReady);
        };
        tx.try_send(frame).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => EnqueueError::Full,
            mpsc::error::TrySendError::Closed(_) => EnqueueError::NotReady,
        })
    }

    /// Blocking-push capability for the current session, or `None` between
    /// sessions.
    pub fn sender(&self) -> Option<mpsc::Sender<Frame>> {
        self.slot.lock().unwrap().clone()
    }
}

/// Mints correlation ids for agent-originated messages (hello, ping,
/// telemetry). Lives across sessions so ids never repeat within one
/// process.
#[derive(Clone, Default)]
pub struct OutboundSequence {
    next: Arc<AtomicU64>,
}

impl OutboundSequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn try_send_without_a_session_is_not_ready() {
        let handle = OutboundHandle::new();
        assert_eq!(handle.try_send(vec![1]), Err(EnqueueError::NotReady));
    }

    #[tokio::test]
    async fn try_send_reports_saturation() {
        let handle = OutboundHandle::new();
        let (tx, mut rx) = mpsc::channel(1);
        handle.install(tx);

        handle.try_send(vec![1]).unwrap();
        assert_eq!(handle.try_send(vec![2]), Err(EnqueueError::Full));

        rx.recv().await.unwrap();
        handle.try_send(vec![3]).unwrap();
    }

    #[tokio::test]
    async fn clear_detaches_the_session() {
        let handle = OutboundHandle::new();
        let (tx, _rx) = mpsc::channel(1);
        handle.install(tx);
        assert!(handle.is_ready());
        handle.clear();
        assert_eq!(handle.try_send(vec![1]), Err(EnqueueError::NotReady));
    }

    #[test]
    fn sequence_is_monotonic() {
        let seq = OutboundSequence::new();
        let a = seq.next();
        let b = seq.next();
        assert!(b > a);
    }
}

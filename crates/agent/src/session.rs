//! Session layer: one connected instance of the device and everything in
//! flight on it.
//!
//! The connect loop owns reconnection with doubling backoff. Each
//! connection runs three cooperative loops over the shared device: the
//! read-loop feeds the dispatcher, the write-loop is the single consumer
//! of the outbound queue (which is what serializes frames on the wire),
//! and the keepalive-loop pings an idle channel and watches for a stalled
//! peer. A session that dies takes its in-flight requests with it; the
//! next session starts clean.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use helion_shared::message::{Kind, Message};
use helion_shared::ops::{self, Hello, op};
use helion_shared::wire::{self, WireError};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::Config;
use crate::device::{DeviceError, DeviceFactory, DeviceReader, DeviceWriter};
use crate::dispatch::Dispatcher;
use crate::outbound::{Frame, OutboundHandle, OutboundSequence};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    Disconnected,
    ProtocolViolation,
    Shutdown,
}

/// States of one connection instance. Transitions are monotonic; a fresh
/// connection starts over at `Opening`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Opening,
    Handshaking,
    Ready,
    Draining,
    Closed,
}

enum LoopEnd {
    Disconnected,
    Violation,
    /// The outbound queue closed under the write-loop; only happens at
    /// teardown.
    Quiet,
}

pub struct Session {
    cfg: Arc<Config>,
    dispatcher: Arc<Dispatcher>,
    outbound: OutboundHandle,
    seq: OutboundSequence,
    hello: Hello,
    shutdown: CancellationToken,
}

impl Session {
    pub fn new(
        cfg: Arc<Config>,
        dispatcher: Arc<Dispatcher>,
        outbound: OutboundHandle,
        seq: OutboundSequence,
        hello: Hello,
        shutdown: CancellationToken,
    ) -> Self {
        Session {
            cfg,
            dispatcher,
            outbound,
            seq,
            hello,
            shutdown,
        }
    }

    /// Reconnect forever (or until shutdown): open the device, run a
    /// session, repeat. Open failures back off with doubling delays up to
    /// the configured ceiling; a successful open that lives long enough
    /// resets the backoff. `initial` is the connection the boot probe
    /// already opened, if any.
    pub async fn run_forever(
        &self,
        device: Arc<dyn DeviceFactory>,
        mut initial: Option<(DeviceReader, DeviceWriter)>,
    ) {
        let mut backoff = self.cfg.reconnect_backoff_initial();
        loop {
            if self.shutdown.is_cancelled() {
                return;
            }
            let opened = match initial.take() {
                Some(pair) => Ok(pair),
                None => device.open().await,
            };
            match opened {
                Ok((reader, writer)) => {
                    let opened_at = Instant::now();
                    let end = self.run(reader, writer).await;
                    match end {
                        SessionEnd::Shutdown => return,
                        SessionEnd::Disconnected | SessionEnd::ProtocolViolation => {
                            // A session that died instantly (host side
                            // detached) would otherwise reconnect hot.
                            if opened_at.elapsed() >= self.cfg.reconnect_backoff_initial() {
                                backoff = self.cfg.reconnect_backoff_initial();
                                continue;
                            }
                        }
                    }
                }
                Err(DeviceError::PermissionDenied(msg)) => {
                    warn!(%msg, "device open refused; will retry")
                }
                Err(DeviceError::Unavailable(msg)) => {
                    debug!(%msg, "device unavailable; will retry")
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = self.shutdown.cancelled() => return,
            }
            backoff = (backoff * 2).min(self.cfg.reconnect_backoff_max());
        }
    }

    /// Drive one connection instance from handshake to close.
    pub async fn run(&self, reader: DeviceReader, writer: DeviceWriter) -> SessionEnd {
        let mut state = State::Opening;
        transition(&mut state, State::Handshaking);

        let (tx, rx) = mpsc::channel::<Frame>(self.cfg.outbound_queue_depth);

        let hello = Message::event(
            self.seq.next(),
            op::HELLO,
            match ops::encode(&self.hello) {
                Ok(payload) => payload,
                Err(err) => {
                    error!(%err, "hello payload encode failed");
                    return SessionEnd::Disconnected;
                }
            },
        );
        match hello.encode() {
            Ok(frame) => {
                // Queue capacity is fresh; this cannot block.
                let _ = tx.send(frame).await;
            }
            Err(err) => {
                error!(%err, "hello encode failed");
                return SessionEnd::Disconnected;
            }
        }

        let liveness = Arc::new(Liveness::now());
        let requests = CancellationToken::new();

        let mut read_task = tokio::spawn(read_loop(
            reader,
            self.dispatcher.clone(),
            tx.clone(),
            requests.clone(),
            liveness.clone(),
            self.cfg.clone(),
        ));
        let mut write_task = tokio::spawn(write_loop(
            writer,
            rx,
            liveness.clone(),
            self.cfg.clone(),
        ));
        let mut keepalive_task = tokio::spawn(keepalive_loop(
            tx.clone(),
            liveness.clone(),
            self.cfg.clone(),
            self.seq.clone(),
        ));

        self.outbound.install(tx);
        transition(&mut state, State::Ready);
        info!("session ready");

        let end = tokio::select! {
            res = &mut read_task => classify("read", res),
            res = &mut write_task => classify("write", res),
            res = &mut keepalive_task => classify("keepalive", res),
            _ = self.shutdown.cancelled() => SessionEnd::Shutdown,
        };

        transition(&mut state, State::Draining);
        self.outbound.clear();
        requests.cancel();

        let grace = match end {
            SessionEnd::Shutdown => self.cfg.shutdown_grace(),
            _ => self.cfg.session_drain_grace(),
        };
        if !self.dispatcher.wait_idle(grace).await {
            warn!("handlers outlived the drain grace; abandoning them");
            self.dispatcher.force_abort();
            self.dispatcher.wait_idle(Duration::from_secs(1)).await;
        }

        read_task.abort();
        write_task.abort();
        keepalive_task.abort();
        transition(&mut state, State::Closed);
        info!(?end, "session closed");
        end
    }
}

fn transition(state: &mut State, next: State) {
    debug!(from = ?*state, to = ?next, "session state");
    *state = next;
}

fn classify(loop_name: &str, result: Result<LoopEnd, tokio::task::JoinError>) -> SessionEnd {
    match result {
        Ok(LoopEnd::Disconnected) => SessionEnd::Disconnected,
        Ok(LoopEnd::Violation) => SessionEnd::ProtocolViolation,
        Ok(LoopEnd::Quiet) => SessionEnd::Disconnected,
        Err(err) => {
            // A panicking loop costs the session, never the process.
            error!(loop_name, %err, "session loop died");
            SessionEnd::Disconnected
        }
    }
}

/// Timestamps shared by the loops for keepalive and stall decisions.
struct Liveness {
    last_read: Mutex<Instant>,
    last_write: Mutex<Instant>,
}

impl Liveness {
    fn now() -> Self {
        let now = Instant::now();
        Liveness {
            last_read: Mutex::new(now),
            last_write: Mutex::new(now),
        }
    }

    fn touch_read(&self) {
        *self.last_read.lock().unwrap() = Instant::now();
    }

    fn touch_write(&self) {
        *self.last_write.lock().unwrap() = Instant::now();
    }

    fn since_read(&self) -> Duration {
        self.last_read.lock().unwrap().elapsed()
    }

    fn since_write(&self) -> Duration {
        self.last_write.lock().unwrap().elapsed()
    }
}

async fn read_loop(
    mut reader: DeviceReader,
    dispatcher: Arc<Dispatcher>,
    tx: mpsc::Sender<Frame>,
    requests: CancellationToken,
    liveness: Arc<Liveness>,
    cfg: Arc<Config>,
) -> LoopEnd {
    loop {
        match wire::read_frame(&mut reader, cfg.max_frame_bytes).await {
            Ok(frame) => {
                liveness.touch_read();
                let msg = match Message::decode(&frame) {
                    Ok(msg) => msg,
                    Err(err) => {
                        error!(%err, len = frame.len(), "undecodable frame");
                        return LoopEnd::Violation;
                    }
                };
                match msg.kind {
                    Kind::Request => dispatcher.dispatch(msg, tx.clone(), &requests),
                    Kind::Response { .. } => {
                        // The agent does not originate requests today; the
                        // outbound-wait table collapses to this branch.
                        debug!(cid = msg.correlation_id, "unsolicited response from peer");
                    }
                    Kind::Event => match msg.operation.as_str() {
                        op::PING => trace!("peer ping"),
                        op::HELLO => match ops::decode::<Hello>(&msg.payload) {
                            Ok(peer) => info!(
                                protocol_version = peer.protocol_version,
                                version = %peer.agent_version,
                                "peer hello"
                            ),
                            Err(err) => debug!(%err, "undecodable peer hello"),
                        },
                        other => trace!(operation = other, "ignoring peer event"),
                    },
                }
            }
            Err(WireError::Oversize { length, limit }) => {
                error!(length, limit, "frame over the session limit");
                return LoopEnd::Violation;
            }
            Err(WireError::Disconnected) => return LoopEnd::Disconnected,
            Err(WireError::Io(err)) => {
                warn!(%err, "device read failed");
                return LoopEnd::Disconnected;
            }
        }
    }
}

async fn write_loop(
    mut writer: DeviceWriter,
    mut rx: mpsc::Receiver<Frame>,
    liveness: Arc<Liveness>,
    cfg: Arc<Config>,
) -> LoopEnd {
    while let Some(frame) = rx.recv().await {
        match wire::write_frame(&mut writer, &frame, cfg.max_frame_bytes).await {
            Ok(()) => liveness.touch_write(),
            Err(WireError::Oversize { length, limit }) => {
                // A producer bug, not the peer's fault; drop the frame and
                // keep the session.
                error!(length, limit, "oversized outbound frame dropped");
            }
            Err(WireError::Disconnected) => return LoopEnd::Disconnected,
            Err(WireError::Io(err)) => {
                warn!(%err, "device write failed");
                return LoopEnd::Disconnected;
            }
        }
    }
    LoopEnd::Quiet
}

async fn keepalive_loop(
    tx: mpsc::Sender<Frame>,
    liveness: Arc<Liveness>,
    cfg: Arc<Config>,
    seq: OutboundSequence,
) -> LoopEnd {
    let period = cfg.keepalive_interval();
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if liveness.since_read() > cfg.peer_stall_threshold() {
            warn!(
                threshold_secs = cfg.peer_stall_threshold().as_secs(),
                "no bytes from peer; treating the channel as stalled"
            );
            return LoopEnd::Disconnected;
        }
        if liveness.since_write() >= period {
            let Ok(frame) = Message::event(seq.next(), op::PING, Vec::new()).encode() else {
                continue;
            };
            if tx.send(frame).await.is_err() {
                return LoopEnd::Quiet;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{Handler, HandlerError, RequestContext};
    use futures::FutureExt;
    use futures::future::BoxFuture;
    use helion_shared::Status;
    use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};

    struct EchoHandler;

    impl Handler for EchoHandler {
        fn operation(&self) -> &'static str {
            "test_echo"
        }

        fn handle(&self, ctx: RequestContext) -> BoxFuture<'static, Result<Vec<u8>, HandlerError>> {
            async move { Ok(ctx.payload) }.boxed()
        }
    }

    struct Fixture {
        session: Arc<Session>,
        shutdown: CancellationToken,
        host_rd: ReadHalf<DuplexStream>,
        host_wr: WriteHalf<DuplexStream>,
        guest_rd: DeviceReader,
        guest_wr: DeviceWriter,
    }

    fn fixture(tune: impl FnOnce(&mut Config)) -> Fixture {
        let mut cfg = Config::default();
        tune(&mut cfg);
        let cfg = Arc::new(cfg);
        let dispatcher = Arc::new(Dispatcher::new(
            cfg.clone(),
            vec![Arc::new(EchoHandler) as Arc<dyn Handler>],
        ));
        let shutdown = CancellationToken::new();
        let session = Arc::new(Session::new(
            cfg,
            dispatcher,
            OutboundHandle::new(),
            OutboundSequence::new(),
            Hello {
                protocol_version: helion_shared::PROTOCOL_VERSION,
                agent_version: "test".into(),
                capabilities: vec!["test_echo".into()],
                os: Default::default(),
            },
            shutdown.clone(),
        ));

        let (host, guest) = tokio::io::duplex(64 * 1024);
        let (host_rd, host_wr) = tokio::io::split(host);
        let (guest_rd, guest_wr) = tokio::io::split(guest);
        Fixture {
            session,
            shutdown,
            host_rd,
            host_wr,
            guest_rd: Box::new(guest_rd),
            guest_wr: Box::new(guest_wr),
        }
    }

    async fn host_read(host_rd: &mut ReadHalf<DuplexStream>) -> Message {
        let frame = tokio::time::timeout(
            Duration::from_secs(5),
            wire::read_frame(host_rd, 1024 * 1024),
        )
        .await
        .expect("frame in time")
        .expect("readable frame");
        Message::decode(&frame).unwrap()
    }

    #[tokio::test]
    async fn hello_is_the_first_frame() {
        let mut fx = fixture(|_| {});
        let run = tokio::spawn({
            let session = fx.session.clone();
            async move { session.run(fx.guest_rd, fx.guest_wr).await }
        });

        let msg = host_read(&mut fx.host_rd).await;
        assert_eq!(msg.kind, Kind::Event);
        assert_eq!(msg.operation, op::HELLO);
        let hello: Hello = ops::decode(&msg.payload).unwrap();
        assert_eq!(hello.protocol_version, helion_shared::PROTOCOL_VERSION);
        assert!(hello.capabilities.contains(&"test_echo".into()));

        fx.shutdown.cancel();
        assert_eq!(run.await.unwrap(), SessionEnd::Shutdown);
    }

    #[tokio::test]
    async fn request_gets_a_response() {
        let mut fx = fixture(|_| {});
        let run = tokio::spawn({
            let session = fx.session.clone();
            async move { session.run(fx.guest_rd, fx.guest_wr).await }
        });
        let _hello = host_read(&mut fx.host_rd).await;

        let request = Message::request(7, "test_echo", b"payload".to_vec())
            .encode()
            .unwrap();
        wire::write_frame(&mut fx.host_wr, &request, 1024 * 1024)
            .await
            .unwrap();

        let msg = host_read(&mut fx.host_rd).await;
        assert_eq!(msg.correlation_id, 7);
        assert_eq!(
            msg.kind,
            Kind::Response {
                status: Status::Ok
            }
        );
        assert_eq!(msg.payload, b"payload");

        fx.shutdown.cancel();
        run.await.unwrap();
    }

    #[tokio::test]
    async fn oversize_header_tears_the_session_down() {
        let mut fx = fixture(|_| {});
        let run = tokio::spawn({
            let session = fx.session.clone();
            async move { session.run(fx.guest_rd, fx.guest_wr).await }
        });
        let _hello = host_read(&mut fx.host_rd).await;

        fx.host_wr.write_all(&[0xFF; 4]).await.unwrap();
        fx.host_wr.flush().await.unwrap();

        assert_eq!(run.await.unwrap(), SessionEnd::ProtocolViolation);
    }

    #[tokio::test]
    async fn peer_disconnect_ends_the_session() {
        let mut fx = fixture(|_| {});
        let run = tokio::spawn({
            let session = fx.session.clone();
            async move { session.run(fx.guest_rd, fx.guest_wr).await }
        });
        let _hello = host_read(&mut fx.host_rd).await;

        drop(fx.host_wr);
        drop(fx.host_rd);

        assert_eq!(run.await.unwrap(), SessionEnd::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_channel_gets_keepalive_pings() {
        let mut fx = fixture(|cfg| cfg.telemetry_interval_secs = 2);
        let run = tokio::spawn({
            let session = fx.session.clone();
            async move { session.run(fx.guest_rd, fx.guest_wr).await }
        });
        let _hello = host_read(&mut fx.host_rd).await;

        let msg = host_read(&mut fx.host_rd).await;
        assert_eq!(msg.kind, Kind::Event);
        assert_eq!(msg.operation, op::PING);

        // Keep the peer looking alive from the guest's perspective.
        let ping = Message::event(99, op::PING, Vec::new()).encode().unwrap();
        wire::write_frame(&mut fx.host_wr, &ping, 1024 * 1024)
            .await
            .unwrap();

        let msg = host_read(&mut fx.host_rd).await;
        assert_eq!(msg.operation, op::PING);

        fx.shutdown.cancel();
        run.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_is_a_stall() {
        let fx = fixture(|cfg| cfg.telemetry_interval_secs = 1);
        let run = tokio::spawn({
            let session = fx.session.clone();
            async move { session.run(fx.guest_rd, fx.guest_wr).await }
        });
        // Never read or write on the host side; after 3x the telemetry
        // interval the guest must give up.
        let end = tokio::time::timeout(Duration::from_secs(60), run)
            .await
            .expect("session ends")
            .unwrap();
        assert_eq!(end, SessionEnd::Disconnected);
        drop(fx.host_rd);
        drop(fx.host_wr);
    }
}

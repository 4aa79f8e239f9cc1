//! Per-session finite state machine (spec §4.2–§4.3). Each session is a
//! single task draining one inbound-message channel, one app-write channel
//! (the actor side of a duplex pipe), and its own timers; this is the only
//! place session state is mutated, so there is nothing else to lock.

use std::io;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio::time::{sleep, sleep_until};

use tracing::{debug, warn};

use crate::lrcp::packets::{chunk_for_wire, Packet};
use crate::lrcp::protocol::SocketHandler;

/// Sends one already-framed message to the peer. Implementors: a real UDP
/// socket bound to the session's peer address (server side), or a channel
/// back to an in-process fake endpoint (client side / tests).
pub(crate) trait DatagramSink: Clone + Send + Sync + 'static {
    async fn send(&self, packet: Packet) -> io::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Waiting,
    Connected,
    Closed,
}

/// Coordination state shared between the actor and the independent
/// per-chunk retransmission tasks it spawns: the latest acknowledged
/// length, and whether the session has closed. Deliberately not a mutex —
/// these are the only two facts a retransmit task needs, and both are
/// single words.
#[derive(Default)]
struct RetransmitState {
    ack_len: AtomicU32,
    closed: AtomicBool,
}

/// Run a session actor for the locally-initiated path (`Socket::connect`):
/// the handshake ack has already arrived, so the actor starts already
/// Connected.
pub(crate) async fn run_connected<H, S>(
    id: u32,
    ack_len: u32,
    sink: S,
    inbound: mpsc::UnboundedReceiver<Packet>,
    app_half: DuplexStream,
) where
    H: SocketHandler,
    S: DatagramSink,
{
    let mut actor = Actor::<H, S>::new(id, sink, app_half);
    actor.lifecycle = Lifecycle::Connected;
    actor.shared.ack_len.store(ack_len, Ordering::Release);
    actor.run(inbound, None).await;
}

/// Run a session actor for the router-accepted path: `inbound`'s first
/// message is the founding `connect`, which the actor's own FSM turns into
/// the Waiting -> Connected transition and the `ack(id, 0)` reply.
pub(crate) async fn run_accepted<H, S>(
    id: u32,
    sink: S,
    inbound: mpsc::UnboundedReceiver<Packet>,
    app_half: DuplexStream,
    closed_notify: mpsc::UnboundedSender<u32>,
) where
    H: SocketHandler,
    S: DatagramSink,
{
    let mut actor = Actor::<H, S>::new(id, sink, app_half);
    actor.run(inbound, Some(closed_notify)).await;
}

struct Actor<H, S> {
    id: u32,
    lifecycle: Lifecycle,
    rx_len: u32,
    tx_len: u32,
    /// Still-unacknowledged chunks in offset order, kept only so an ack's
    /// immediate retransmit (spec §4.2) can be built without waiting for a
    /// chunk task's own timer; each chunk also retransmits independently
    /// via its own spawned task regardless of this list.
    outstanding: Vec<(u32, u32, Arc<[u8]>)>,
    shared: Arc<RetransmitState>,
    sink: S,
    app_half: DuplexStream,
    last_rx_activity: Instant,
    last_ack_progress: Instant,
    _handler: PhantomData<fn() -> H>,
}

impl<H: SocketHandler, S: DatagramSink> Actor<H, S> {
    fn new(id: u32, sink: S, app_half: DuplexStream) -> Self {
        let now = Instant::now();
        Self {
            id,
            lifecycle: Lifecycle::Waiting,
            rx_len: 0,
            tx_len: 0,
            outstanding: Vec::new(),
            shared: Arc::new(RetransmitState::default()),
            sink,
            app_half,
            last_rx_activity: now,
            last_ack_progress: now,
            _handler: PhantomData,
        }
    }

    async fn run(
        &mut self,
        mut inbound: mpsc::UnboundedReceiver<Packet>,
        closed_notify: Option<mpsc::UnboundedSender<u32>>,
    ) {
        let mut read_buf = [0u8; 8192];

        loop {
            if self.lifecycle == Lifecycle::Closed {
                break;
            }

            let idle_deadline = tokio::time::Instant::from_std(
                self.last_rx_activity + H::idle_timeout(),
            );
            let stall_armed =
                self.shared.ack_len.load(Ordering::Acquire) < self.tx_len;
            let stall_deadline = tokio::time::Instant::from_std(
                self.last_ack_progress + H::ack_stall_ceiling(),
            );

            tokio::select! {
                biased;

                maybe_packet = inbound.recv() => {
                    match maybe_packet {
                        Some(packet) => self.handle_inbound(packet).await,
                        None => {
                            self.close_session().await;
                        }
                    }
                }

                n = self.app_half.read(&mut read_buf), if self.lifecycle == Lifecycle::Connected => {
                    match n {
                        Ok(0) | Err(_) => self.close_session().await,
                        Ok(n) => self.handle_app_write(&read_buf[..n]).await,
                    }
                }

                () = sleep_until(idle_deadline), if self.lifecycle == Lifecycle::Connected => {
                    debug!(id = self.id, "lrcp session idle timeout");
                    self.close_session().await;
                }

                () = sleep_until(stall_deadline), if stall_armed && self.lifecycle == Lifecycle::Connected => {
                    warn!(id = self.id, "lrcp session ack-stall ceiling reached");
                    self.close_session().await;
                }
            }
        }

        if let Some(notify) = closed_notify {
            let _ = notify.send(self.id);
        }
    }

    async fn handle_inbound(&mut self, packet: Packet) {
        self.last_rx_activity = Instant::now();
        match packet {
            Packet::Connect { .. } => self.on_connect().await,
            Packet::Data { pos, payload, .. } => self.on_data(pos, &payload).await,
            Packet::Ack { length, .. } => self.on_ack(length).await,
            Packet::Close { .. } => self.close_session().await,
        }
    }

    async fn on_connect(&mut self) {
        match self.lifecycle {
            Lifecycle::Waiting => {
                self.lifecycle = Lifecycle::Connected;
                self.rx_len = 0;
                self.tx_len = 0;
                self.shared.ack_len.store(0, Ordering::Release);
                self.last_ack_progress = Instant::now();
                self.reply(Packet::Ack { id: self.id, length: 0 }).await;
            }
            Lifecycle::Connected => {
                self.reply(Packet::Ack {
                    id: self.id,
                    length: self.rx_len,
                })
                .await;
            }
            Lifecycle::Closed => {
                self.reply(Packet::Close { id: self.id }).await;
            }
        }
    }

    async fn on_data(&mut self, pos: u32, payload: &[u8]) {
        if self.lifecycle != Lifecycle::Connected {
            self.reply(Packet::Close { id: self.id }).await;
            return;
        }

        let end = pos.saturating_add(payload.len() as u32);

        if pos > self.rx_len || end <= self.rx_len {
            // out of window, or a fully-duplicate retransmission: the
            // sender just needs to hear our current rxLen again.
            self.reply(Packet::Ack {
                id: self.id,
                length: self.rx_len,
            })
            .await;
            return;
        }

        let skip = (self.rx_len - pos) as usize;
        let suffix = &payload[skip..];
        if let Err(err) = self.app_half.write_all(suffix).await {
            warn!(id = self.id, ?err, "application side of session closed");
            self.close_session().await;
            return;
        }
        self.rx_len += suffix.len() as u32;

        self.reply(Packet::Ack {
            id: self.id,
            length: self.rx_len,
        })
        .await;
    }

    async fn on_ack(&mut self, length: u32) {
        if self.lifecycle != Lifecycle::Connected {
            return;
        }

        let current = self.shared.ack_len.load(Ordering::Acquire);
        if length <= current {
            return; // stale
        }
        if length > self.tx_len {
            warn!(
                id = self.id,
                length, tx_len = self.tx_len, "peer acked beyond sent length"
            );
            self.close_session().await;
            return;
        }

        self.shared.ack_len.store(length, Ordering::Release);
        self.last_ack_progress = Instant::now();
        self.outstanding.retain(|&(_, end, _)| end > length);

        if length < self.tx_len {
            if let Some(&(offset, _, ref payload)) = self.outstanding.first() {
                let pos = offset.max(length);
                let skip = (pos - offset) as usize;
                let chunk = payload[skip..].to_vec();
                self.reply(Packet::Data {
                    id: self.id,
                    pos,
                    payload: chunk,
                })
                .await;
            }
        }
    }

    async fn handle_app_write(&mut self, bytes: &[u8]) {
        for chunk in chunk_for_wire(bytes, H::max_payload()) {
            let offset = self.tx_len;
            let payload: Arc<[u8]> = Arc::from(chunk);
            let end = offset + u32::try_from(payload.len()).unwrap_or(u32::MAX);
            self.tx_len = end;
            self.outstanding.push((offset, end, payload.clone()));

            self.reply(Packet::Data {
                id: self.id,
                pos: offset,
                payload: payload.to_vec(),
            })
            .await;

            self.spawn_retransmit(offset, end, payload);
        }
    }

    fn spawn_retransmit(&self, offset: u32, end: u32, payload: Arc<[u8]>) {
        let shared = self.shared.clone();
        let sink = self.sink.clone();
        let id = self.id;
        let interval = H::retransmit_interval();

        tokio::spawn(async move {
            loop {
                sleep(interval).await;
                if shared.closed.load(Ordering::Acquire) || shared.ack_len.load(Ordering::Acquire) >= end {
                    return;
                }
                let _ = sink
                    .send(Packet::Data {
                        id,
                        pos: offset,
                        payload: payload.to_vec(),
                    })
                    .await;
            }
        });
    }

    async fn close_session(&mut self) {
        if self.lifecycle == Lifecycle::Closed {
            return;
        }
        self.lifecycle = Lifecycle::Closed;
        self.shared.closed.store(true, Ordering::Release);
        self.reply(Packet::Close { id: self.id }).await;
    }

    async fn reply(&self, packet: Packet) {
        if let Err(err) = self.sink.send(packet).await {
            debug!(id = self.id, ?err, "failed sending lrcp reply");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncWriteExt, DuplexStream};
    use tokio::sync::mpsc;

    use super::{run_connected, DatagramSink, Packet};
    use crate::lrcp::protocol::SocketHandler;
    use crate::DefaultSocketHandler;

    #[derive(Clone)]
    struct ChannelSink(mpsc::UnboundedSender<Packet>);

    impl DatagramSink for ChannelSink {
        async fn send(&self, packet: Packet) -> io::Result<()> {
            self.0
                .send(packet)
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "test sink closed"))
        }
    }

    /// Spawn an already-`Connected` actor (as if `Socket::connect` had just
    /// completed its handshake) wired to channels the test drives directly.
    async fn spawn_test_actor() -> (
        mpsc::UnboundedSender<Packet>,
        mpsc::UnboundedReceiver<Packet>,
        DuplexStream,
    ) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (sink_tx, sink_rx) = mpsc::unbounded_channel();
        let (app_half, actor_half) = tokio::io::duplex(4096);

        tokio::spawn(run_connected::<DefaultSocketHandler, _>(
            1,
            0,
            ChannelSink(sink_tx),
            inbound_rx,
            actor_half,
        ));

        (inbound_tx, sink_rx, app_half)
    }

    #[tokio::test(start_paused = true)]
    async fn out_of_order_data_is_acked_at_current_rx_len() {
        let (inbound_tx, mut sink_rx, _app_half) = spawn_test_actor().await;

        // pos=5 is beyond rxLen=0: nothing has been received yet, so this
        // chunk is out of window and must not advance rxLen.
        inbound_tx
            .send(Packet::Data {
                id: 1,
                pos: 5,
                payload: b"world".to_vec(),
            })
            .unwrap();

        assert_eq!(
            sink_rx.recv().await.unwrap(),
            Packet::Ack { id: 1, length: 0 }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_data_replays_ack_without_advancing_rx_len() {
        let (inbound_tx, mut sink_rx, _app_half) = spawn_test_actor().await;

        inbound_tx
            .send(Packet::Data {
                id: 1,
                pos: 0,
                payload: b"hello".to_vec(),
            })
            .unwrap();
        assert_eq!(
            sink_rx.recv().await.unwrap(),
            Packet::Ack { id: 1, length: 5 }
        );

        // Same bytes again, still at pos=0: end (5) <= rxLen (5), so this is
        // fully duplicate and rxLen must not move.
        inbound_tx
            .send(Packet::Data {
                id: 1,
                pos: 0,
                payload: b"hello".to_vec(),
            })
            .unwrap();
        assert_eq!(
            sink_rx.recv().await.unwrap(),
            Packet::Ack { id: 1, length: 5 }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_ack_causes_retransmission_until_acked() {
        let (inbound_tx, mut sink_rx, mut app_half) = spawn_test_actor().await;

        app_half.write_all(b"hi").await.unwrap();

        let first = sink_rx.recv().await.unwrap();
        assert_eq!(
            first,
            Packet::Data {
                id: 1,
                pos: 0,
                payload: b"hi".to_vec(),
            }
        );

        // The client never acks; once a full retransmit interval passes the
        // chunk's own retransmit task resends it unprompted.
        tokio::time::advance(DefaultSocketHandler::retransmit_interval()).await;
        assert_eq!(sink_rx.recv().await.unwrap(), first);

        inbound_tx
            .send(Packet::Ack { id: 1, length: 2 })
            .unwrap();
        tokio::task::yield_now().await;

        // Now that the chunk is fully acked, the retransmit task must see
        // ackLen >= end on its next wake and stop sending.
        tokio::time::advance(DefaultSocketHandler::retransmit_interval()).await;
        assert!(
            tokio::time::timeout(Duration::from_millis(10), sink_rx.recv())
                .await
                .is_err()
        );
    }
}

//! Session router (spec §4.5): demultiplexes inbound datagrams to sessions
//! by id, creates a session on first `connect`, and replies `close`
//! directly for any other message addressed to an id with no session.

use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use tracing::{debug, warn};

use crate::lrcp::packets::Packet;
use crate::lrcp::protocol::{Socket, SocketHandler};
use crate::lrcp::session::{self, DatagramSink};

const APP_BUFFER: usize = 64 * 1024;
/// UDP datagrams larger than the wire format's 1000-byte cap are truncated
/// or simply never valid; this is generous headroom for `recv_from`.
const RECV_BUFFER: usize = 1024;

pub struct Router<H> {
    socket: Arc<UdpSocket>,
    debug: bool,
    _handler: PhantomData<H>,
}

impl<H: SocketHandler> Router<H> {
    pub(crate) fn new(socket: Arc<UdpSocket>, debug: bool) -> Self {
        Self {
            socket,
            debug,
            _handler: PhantomData,
        }
    }

    /// Spawn the router's demux loop and return the stream of newly
    /// connected sessions.
    pub(crate) fn spawn(self) -> mpsc::UnboundedReceiver<(u32, Socket<H>)> {
        let (new_sessions_tx, new_sessions_rx) = mpsc::unbounded_channel();
        tokio::spawn(self.run(new_sessions_tx));
        new_sessions_rx
    }

    async fn run(self, new_sessions_tx: mpsc::UnboundedSender<(u32, Socket<H>)>) {
        let mut sessions: HashMap<u32, mpsc::UnboundedSender<Packet>> = HashMap::new();
        // Ids that have already completed a full connect/close lifecycle.
        // Spec invariant: a session whose address has been cleared (Closed)
        // must never be re-opened under the same id.
        let mut retired: HashSet<u32> = HashSet::new();
        let (closed_tx, mut closed_rx) = mpsc::unbounded_channel::<u32>();
        let mut buf = [0u8; RECV_BUFFER];

        loop {
            tokio::select! {
                recv = self.socket.recv_from(&mut buf) => {
                    match recv {
                        Ok((len, peer)) => {
                            self.handle_datagram(
                                &buf[..len],
                                peer,
                                &mut sessions,
                                &mut retired,
                                &closed_tx,
                                &new_sessions_tx,
                            )
                            .await;
                        }
                        Err(err) => {
                            warn!(?err, "lrcp udp recv error, stopping router");
                            break;
                        }
                    }
                }

                Some(id) = closed_rx.recv() => {
                    sessions.remove(&id);
                    retired.insert(id);
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_datagram(
        &self,
        raw: &[u8],
        peer: SocketAddr,
        sessions: &mut HashMap<u32, mpsc::UnboundedSender<Packet>>,
        retired: &mut HashSet<u32>,
        closed_tx: &mpsc::UnboundedSender<u32>,
        new_sessions_tx: &mpsc::UnboundedSender<(u32, Socket<H>)>,
    ) {
        let packet = match Packet::parse(raw, self.debug) {
            Ok(packet) => packet,
            Err(err) => {
                debug!(?err, "dropping malformed lrcp datagram");
                return;
            }
        };
        let id = packet.id();

        if let Some(sender) = sessions.get(&id) {
            if sender.send(packet).is_err() {
                sessions.remove(&id);
            }
            return;
        }

        if retired.contains(&id) {
            self.send_direct(Packet::Close { id }, peer).await;
            return;
        }

        let Packet::Connect { id } = packet else {
            self.send_direct(Packet::Close { id }, peer).await;
            return;
        };

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        // The founding connect is replayed to the session itself so its own
        // FSM (shared with every later connect/data/ack/close for this id)
        // performs the Waiting -> Connected transition and sends ack(id, 0).
        if inbound_tx.send(Packet::Connect { id }).is_err() {
            return;
        }
        sessions.insert(id, inbound_tx);

        let (app_half, actor_half) = tokio::io::duplex(APP_BUFFER);
        let sink = UdpPeerSink {
            socket: self.socket.clone(),
            peer,
        };
        tokio::spawn(session::run_accepted::<H, _>(
            id,
            sink,
            inbound_rx,
            actor_half,
            closed_tx.clone(),
        ));

        if new_sessions_tx.send((id, Socket::from_duplex(app_half))).is_err() {
            debug!(id, "no one listening for new lrcp sessions");
        }
    }

    async fn send_direct(&self, packet: Packet, peer: SocketAddr) {
        let rendered = packet.render();
        if let Err(err) = self.socket.send_to(&rendered, peer).await {
            warn!(?err, "failed sending direct lrcp reply");
        }
    }
}

#[derive(Clone)]
struct UdpPeerSink {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
}

impl DatagramSink for UdpPeerSink {
    async fn send(&self, packet: Packet) -> io::Result<()> {
        let rendered = packet.render();
        self.socket.send_to(&rendered, self.peer).await?;
        Ok(())
    }
}

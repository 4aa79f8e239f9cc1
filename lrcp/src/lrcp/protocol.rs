//! The application-facing byte stream (spec §4.4) and the generic transport
//! abstraction a [`Socket`] is built on.

use std::io;
use std::marker::PhantomData;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::mpsc;
use tokio::time::timeout;

pub use crate::lrcp::packets::Packet;
use crate::lrcp::session::{self, DatagramSink};

/// The buffer size of the duplex pipe connecting the application side of a
/// [`Socket`] to its session actor. Generous enough that a single `write()`
/// call is never starved waiting for the actor to drain it under normal
/// retransmission timing.
const APP_BUFFER: usize = 64 * 1024;

/// Timing policy for a session. `lrcp::DefaultSocketHandler` is the
/// production implementation; tests may supply a faster one.
pub trait SocketHandler: Send + Sync + 'static {
    fn retransmit_interval() -> Duration;
    fn idle_timeout() -> Duration;
    fn ack_stall_ceiling() -> Duration;
    fn max_payload() -> usize;
}

/// A full-duplex packet transport, split into an inbound stream and an
/// outbound sink. This is the seam that lets [`Socket::connect`] run over a
/// real UDP socket or, as in this crate's own integration tests, an
/// in-process fake that loops packets straight back to a server task.
pub trait Endpoint<P, Rx, Tx> {
    fn split(self) -> (Rx, Tx);
}

/// A reliable, ordered byte stream over LRCP. Implements `AsyncRead` +
/// `AsyncWrite`; reads observe the peer's write stream strictly in order,
/// writes return once bytes are queued for sending (not once acknowledged).
pub struct Socket<H> {
    inner: DuplexStream,
    _handler: PhantomData<H>,
}

impl<H: SocketHandler> Socket<H> {
    /// Connect as the initiating side: pick a session id, send `connect`
    /// over `endpoint`, and wait for the matching `ack` before returning a
    /// usable stream. Retries the `connect` at the handler's retransmit
    /// interval until acknowledged.
    ///
    /// # Errors
    /// Returns an error if the endpoint's sender is closed before an ack
    /// arrives.
    pub async fn connect<E>(endpoint: E) -> io::Result<Self>
    where
        E: Endpoint<Packet, mpsc::UnboundedReceiver<Packet>, mpsc::UnboundedSender<Packet>>,
    {
        let (mut inbound, outbound) = endpoint.split();
        let id = rand::random::<u32>() & 0x7fff_ffff;

        outbound
            .send(Packet::Connect { id })
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "endpoint closed"))?;

        let ack_len = loop {
            match timeout(H::retransmit_interval(), inbound.recv()).await {
                Ok(Some(Packet::Ack { id: ack_id, length })) if ack_id == id => break length,
                Ok(Some(_)) => continue,
                Ok(None) => {
                    return Err(io::Error::new(io::ErrorKind::BrokenPipe, "endpoint closed"))
                }
                Err(_) => {
                    outbound.send(Packet::Connect { id }).map_err(|_| {
                        io::Error::new(io::ErrorKind::BrokenPipe, "endpoint closed")
                    })?;
                }
            }
        };

        let (app_half, actor_half) = tokio::io::duplex(APP_BUFFER);
        let sink = ChannelSink(outbound);
        tokio::spawn(session::run_connected::<H, _>(
            id, ack_len, sink, inbound, actor_half,
        ));

        Ok(Self {
            inner: app_half,
            _handler: PhantomData,
        })
    }

    pub(crate) fn from_duplex(inner: DuplexStream) -> Self {
        Self {
            inner,
            _handler: PhantomData,
        }
    }
}

impl<H> AsyncRead for Socket<H> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<H> AsyncWrite for Socket<H> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// [`DatagramSink`] over an unbounded channel of parsed packets, used by the
/// client-side [`Socket::connect`] path where there's no real socket to
/// write to.
#[derive(Clone)]
struct ChannelSink(mpsc::UnboundedSender<Packet>);

impl DatagramSink for ChannelSink {
    async fn send(&self, packet: Packet) -> io::Result<()> {
        self.0
            .send(packet)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "endpoint closed"))
    }
}

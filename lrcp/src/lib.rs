//! Line Reversal Control Protocol
//!
//! LRCP is a reliable, ordered byte-stream transport layered on top of an
//! unreliable UDP datagram service. A session is identified by a 32-bit id
//! chosen by whichever peer sends the first `connect`. Data arrives out of
//! order, is duplicated, and is lost; the session state machine in
//! [`lrcp::session`] turns that into an ordered byte stream with
//! acknowledgement-driven retransmission.
//!
//! This crate exposes the session engine (`lrcp::protocol::Socket`, an
//! `AsyncRead`/`AsyncWrite` stream) and a small line-reversal demo handler
//! wired up by [`run`]. The handler is peripheral; the session engine is the
//! point of this crate.

pub mod lrcp;

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{split, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UdpSocket;

use tracing::{info, warn};

pub use crate::lrcp::protocol::{Socket, SocketHandler};

use crate::lrcp::router::Router;

/// Timing policy used by [`Socket`] and the session router. `DefaultSocketHandler`
/// carries the defaults spec'd for LRCP: a 3s retransmission interval, a 60s
/// idle timeout, a 60s ack-stall ceiling, and the 950-byte conservative
/// payload cap (1000 bytes of datagram minus framing overhead).
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultSocketHandler;

impl SocketHandler for DefaultSocketHandler {
    fn retransmit_interval() -> Duration {
        Duration::from_secs(3)
    }

    fn idle_timeout() -> Duration {
        Duration::from_secs(60)
    }

    fn ack_stall_ceiling() -> Duration {
        Duration::from_secs(60)
    }

    fn max_payload() -> usize {
        950
    }
}

/// Run the LRCP server loop: demultiplex datagrams on `socket` into
/// per-session actors, and hand each newly-connected session to the
/// line-reversal handler.
///
/// # Errors
/// Returns an error if the UDP socket itself errors on receive.
pub async fn run<H: SocketHandler>(socket: UdpSocket) -> io::Result<()> {
    let debug = std::env::var("DEBUG").is_ok();
    let socket = Arc::new(socket);
    let router = Router::<H>::new(socket, debug);
    let mut sessions = router.spawn();

    while let Some((id, socket)) = sessions.recv().await {
        tokio::spawn(async move {
            if let Err(err) = handle_session(socket).await {
                warn!(id, ?err, "session handler failed");
            }
        });
    }

    Ok(())
}

/// Reverse every newline-terminated line written by the peer and echo it
/// back. This demo handler is peripheral; the reliable stream it runs on
/// top of is the point of this crate.
async fn handle_session<H: SocketHandler>(socket: Socket<H>) -> io::Result<()> {
    let (read, mut write) = split(socket);
    let mut read = BufReader::new(read);

    let mut line = String::new();
    loop {
        line.clear();
        let n = read.read_line(&mut line).await?;
        if n == 0 {
            return Ok(());
        }

        let had_newline = line.ends_with('\n');
        let body = line.strip_suffix('\n').unwrap_or(&line);
        let reversed: String = body.chars().rev().collect();

        info!(bytes = n, "reversing line");

        write.write_all(reversed.as_bytes()).await?;
        if had_newline {
            write.write_all(b"\n").await?;
        }
        write.flush().await?;
    }
}

//! Binary wire format (spec §4.6): big-endian integers and a single
//! length-prefixed string type, messages concatenated with no delimiter and
//! dispatched by a leading tag byte the caller reads before delegating here.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// A message's wire tag, checked by callers against a byte already read off
/// the stream before dispatching to [`ReadFrom::read_payload_from`].
pub trait TaggedMessage {
    const TAG: u8;
}

pub trait ReadFrom: Sized {
    async fn read_payload_from<R>(read: &mut R) -> io::Result<Self>
    where
        R: AsyncRead + Unpin + Send;
}

pub trait WriteTo {
    async fn write_to<W>(&self, write: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin + Send;
}

pub(crate) async fn read_str<R>(read: &mut R) -> io::Result<String>
where
    R: AsyncRead + Unpin + Send,
{
    let len = read.read_u8().await?;
    let mut buf = vec![0u8; usize::from(len)];
    read.read_exact(&mut buf).await?;
    String::from_utf8(buf).map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "non-ascii str field"))
}

pub(crate) async fn write_str<W>(write: &mut W, value: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    let bytes = value.as_bytes();
    let len = u8::try_from(bytes.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "str field longer than 255 bytes"))?;
    write.write_u8(len).await?;
    write.write_all(bytes).await
}

/// 0x10 Error (Server->Client). Sent immediately before disconnecting a
/// client that has committed a protocol violation.
#[derive(Debug, Clone)]
pub struct Error {
    pub msg: String,
}

impl TaggedMessage for Error {
    const TAG: u8 = 0x10;
}

impl WriteTo for Error {
    async fn write_to<W>(&self, write: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        write.write_u8(Self::TAG).await?;
        write_str(write, &self.msg).await
    }
}

/// 0x20 Plate (Client->Server, camera only).
#[derive(Debug, Clone)]
pub struct Plate {
    pub plate: String,
    pub timestamp: u32,
}

impl TaggedMessage for Plate {
    const TAG: u8 = 0x20;
}

impl ReadFrom for Plate {
    async fn read_payload_from<R>(read: &mut R) -> io::Result<Self>
    where
        R: AsyncRead + Unpin + Send,
    {
        let plate = read_str(read).await?;
        let timestamp = read.read_u32().await?;
        Ok(Self { plate, timestamp })
    }
}

/// 0x40 `WantHeartbeat` (Client->Server). Interval is in deciseconds; 0
/// disables heartbeats (the default).
#[derive(Debug, Clone, Copy)]
pub struct WantHeartbeat {
    pub interval: u32,
}

impl TaggedMessage for WantHeartbeat {
    const TAG: u8 = 0x40;
}

impl ReadFrom for WantHeartbeat {
    async fn read_payload_from<R>(read: &mut R) -> io::Result<Self>
    where
        R: AsyncRead + Unpin + Send,
    {
        let interval = read.read_u32().await?;
        Ok(Self { interval })
    }
}

/// 0x41 Heartbeat (Server->Client). No fields.
#[derive(Debug, Clone, Copy, Default)]
pub struct Heartbeat;

impl TaggedMessage for Heartbeat {
    const TAG: u8 = 0x41;
}

impl WriteTo for Heartbeat {
    async fn write_to<W>(&self, write: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        write.write_u8(Self::TAG).await
    }
}

/// 0x80 `IAmCamera` (Client->Server).
#[derive(Debug, Clone, Copy)]
pub struct IAmCamera {
    pub road: u16,
    pub mile: u16,
    pub limit: u16,
}

impl TaggedMessage for IAmCamera {
    const TAG: u8 = 0x80;
}

impl ReadFrom for IAmCamera {
    async fn read_payload_from<R>(read: &mut R) -> io::Result<Self>
    where
        R: AsyncRead + Unpin + Send,
    {
        let road = read.read_u16().await?;
        let mile = read.read_u16().await?;
        let limit = read.read_u16().await?;
        Ok(Self { road, mile, limit })
    }
}

/// 0x81 `IAmDispatcher` (Client->Server).
#[derive(Debug, Clone)]
pub struct IAmDispatcher {
    pub roads: Vec<u16>,
}

impl TaggedMessage for IAmDispatcher {
    const TAG: u8 = 0x81;
}

impl ReadFrom for IAmDispatcher {
    async fn read_payload_from<R>(read: &mut R) -> io::Result<Self>
    where
        R: AsyncRead + Unpin + Send,
    {
        let numroads = read.read_u8().await?;
        let mut roads = Vec::with_capacity(usize::from(numroads));
        for _ in 0..numroads {
            roads.push(read.read_u16().await?);
        }
        Ok(Self { roads })
    }
}

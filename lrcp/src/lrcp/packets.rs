//! Wire format: `/`-framed ASCII messages with two escape sequences.
//!
//! Every message is exactly `/field/field/.../` with `\\` and `\/` escaping
//! `\` and `/` inside a data payload. Numeric fields are decimal, must be
//! less than 2^31, and the whole rendered datagram must stay under 1000
//! bytes. Anything else is silently dropped by the caller — this module
//! only ever reports the drop via `Err`, never panics.

use std::io;

const MAX_DATAGRAM: usize = 1000;
const MAX_FIELD_VALUE: u32 = 2_147_483_648 - 1;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("message missing leading/trailing '/' framing")]
    NotFramed,
    #[error("unknown message name {0:?}")]
    UnknownName(String),
    #[error("wrong field count for {0}")]
    WrongFieldCount(&'static str),
    #[error("field is not a valid u32 < 2^31")]
    InvalidNumber,
    #[error("unescaped '/' in payload")]
    UnescapedSlash,
    #[error("dangling escape at end of payload")]
    DanglingEscape,
    #[error("datagram exceeds {MAX_DATAGRAM} bytes")]
    TooLarge,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect { id: u32 },
    Data { id: u32, pos: u32, payload: Vec<u8> },
    Ack { id: u32, length: u32 },
    Close { id: u32 },
}

impl Packet {
    #[must_use]
    pub fn id(&self) -> u32 {
        match *self {
            Packet::Connect { id }
            | Packet::Data { id, .. }
            | Packet::Ack { id, .. }
            | Packet::Close { id } => id,
        }
    }

    /// Parse a raw datagram. `debug` enables the whitespace-trimming,
    /// `\n`-substituting lenient mode documented as a test aid in spec §6 —
    /// it is never enabled on the real wire path.
    pub fn parse(raw: &[u8], debug: bool) -> Result<Self, ParseError> {
        if raw.len() > MAX_DATAGRAM {
            return Err(ParseError::TooLarge);
        }

        if raw.len() < 2 || raw[0] != b'/' || raw[raw.len() - 1] != b'/' {
            return Err(ParseError::NotFramed);
        }

        let body = &raw[1..raw.len() - 1];
        let fields = split_fields(body)?;
        if fields.is_empty() {
            return Err(ParseError::WrongFieldCount("<empty>"));
        }

        let name = std::str::from_utf8(fields[0]).map_err(|_| ParseError::UnescapedSlash)?;

        match name {
            "connect" => {
                if fields.len() != 2 {
                    return Err(ParseError::WrongFieldCount("connect"));
                }
                let id = parse_u32(fields[1], debug)?;
                Ok(Packet::Connect { id })
            }
            "data" => {
                if fields.len() != 4 {
                    return Err(ParseError::WrongFieldCount("data"));
                }
                let id = parse_u32(fields[1], debug)?;
                let pos = parse_u32(fields[2], debug)?;
                let payload = unescape(fields[3], debug)?;
                Ok(Packet::Data { id, pos, payload })
            }
            "ack" => {
                if fields.len() != 3 {
                    return Err(ParseError::WrongFieldCount("ack"));
                }
                let id = parse_u32(fields[1], debug)?;
                let length = parse_u32(fields[2], debug)?;
                Ok(Packet::Ack { id, length })
            }
            "close" => {
                if fields.len() != 2 {
                    return Err(ParseError::WrongFieldCount("close"));
                }
                let id = parse_u32(fields[1], debug)?;
                Ok(Packet::Close { id })
            }
            other => Err(ParseError::UnknownName(other.to_string())),
        }
    }

    #[must_use]
    pub fn render(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32);
        out.push(b'/');
        match self {
            Packet::Connect { id } => {
                out.extend_from_slice(b"connect/");
                out.extend_from_slice(id.to_string().as_bytes());
            }
            Packet::Data { id, pos, payload } => {
                out.extend_from_slice(b"data/");
                out.extend_from_slice(id.to_string().as_bytes());
                out.push(b'/');
                out.extend_from_slice(pos.to_string().as_bytes());
                out.push(b'/');
                escape_into(payload, &mut out);
            }
            Packet::Ack { id, length } => {
                out.extend_from_slice(b"ack/");
                out.extend_from_slice(id.to_string().as_bytes());
                out.push(b'/');
                out.extend_from_slice(length.to_string().as_bytes());
            }
            Packet::Close { id } => {
                out.extend_from_slice(b"close/");
                out.extend_from_slice(id.to_string().as_bytes());
            }
        }
        out.push(b'/');
        out
    }
}

/// Synchronous rendering into a caller-provided buffer, for callers (such as
/// a UDP client harness) that build a datagram without going through an
/// async writer.
pub trait SyncWrite {
    fn write_value(&mut self, packet: &Packet) -> io::Result<usize>;
}

impl SyncWrite for &mut [u8] {
    fn write_value(&mut self, packet: &Packet) -> io::Result<usize> {
        let rendered = packet.render();
        if rendered.len() > self.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "buffer too small for rendered LRCP packet",
            ));
        }
        self[..rendered.len()].copy_from_slice(&rendered);
        Ok(rendered.len())
    }
}

/// Split the framed body on unescaped `/`, validating escape sequences
/// along the way. Returns field slices still in escaped form; payload
/// fields are unescaped separately since only `data`'s last field is meant
/// to contain arbitrary text.
fn split_fields(body: &[u8]) -> Result<Vec<&[u8]>, ParseError> {
    // The wire grammar only allows an unescaped '/' as a field separator,
    // and `data` is the only message with free-form payload text, which
    // the grammar places last. So splitting on unescaped '/' here, without
    // knowing yet which message this is, is safe: every field before the
    // payload is numeric (never contains '/' or '\'), and splitn-like
    // behavior falls out naturally because we stop splitting once we've
    // seen the first 3 fields (name/id/pos) and hand back the remainder
    // raw for `data`'s payload to unescape itself.
    let mut fields = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i < body.len() {
        match body[i] {
            b'\\' => {
                i += 2;
                if i > body.len() {
                    return Err(ParseError::DanglingEscape);
                }
            }
            b'/' => {
                fields.push(&body[start..i]);
                start = i + 1;
                i += 1;
                if fields.len() == 3 {
                    // Remaining bytes (including any further '/') are the
                    // `data` payload verbatim; stop splitting.
                    fields.push(&body[start..]);
                    return Ok(fields);
                }
            }
            _ => i += 1,
        }
    }
    fields.push(&body[start..]);
    Ok(fields)
}

fn parse_u32(field: &[u8], debug: bool) -> Result<u32, ParseError> {
    let text = if debug {
        std::str::from_utf8(field)
            .map_err(|_| ParseError::InvalidNumber)?
            .trim()
    } else {
        std::str::from_utf8(field).map_err(|_| ParseError::InvalidNumber)?
    };
    let value: u32 = text.parse().map_err(|_| ParseError::InvalidNumber)?;
    if value > MAX_FIELD_VALUE {
        return Err(ParseError::InvalidNumber);
    }
    Ok(value)
}

fn unescape(field: &[u8], debug: bool) -> Result<Vec<u8>, ParseError> {
    let field: std::borrow::Cow<[u8]> = if debug {
        std::borrow::Cow::Owned(debug_normalize(field))
    } else {
        std::borrow::Cow::Borrowed(field)
    };

    let mut out = Vec::with_capacity(field.len());
    let mut i = 0;
    while i < field.len() {
        match field[i] {
            b'\\' => {
                let Some(&next) = field.get(i + 1) else {
                    return Err(ParseError::DanglingEscape);
                };
                match next {
                    b'\\' => out.push(b'\\'),
                    b'/' => out.push(b'/'),
                    _ => return Err(ParseError::DanglingEscape),
                }
                i += 2;
            }
            b'/' => return Err(ParseError::UnescapedSlash),
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }
    Ok(out)
}

/// Test-aid lenient mode: trim surrounding whitespace and turn a literal
/// two-byte `\n` sequence into an actual newline, before the normal escape
/// pass runs. Not part of the wire contract.
fn debug_normalize(field: &[u8]) -> Vec<u8> {
    let trimmed = std::str::from_utf8(field)
        .map(str::trim)
        .unwrap_or_else(|_| std::str::from_utf8(field).unwrap_or(""));
    let mut out = Vec::with_capacity(trimmed.len());
    let bytes = trimmed.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && bytes.get(i + 1) == Some(&b'n') {
            out.push(b'\n');
            i += 2;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    out
}

fn escape_into(payload: &[u8], out: &mut Vec<u8>) {
    for &byte in payload {
        match byte {
            b'\\' => out.extend_from_slice(b"\\\\"),
            b'/' => out.extend_from_slice(b"\\/"),
            other => out.push(other),
        }
    }
}

/// Greedily split `payload` into chunks whose *escaped* rendering fits
/// under `max_escaped` bytes, so that a `data` frame built from one chunk
/// stays under the datagram cap once framing overhead is added by the
/// caller.
#[must_use]
pub fn chunk_for_wire(payload: &[u8], max_escaped: usize) -> Vec<&[u8]> {
    let mut chunks = Vec::new();
    let mut start = 0;
    let mut escaped_len = 0;
    for (i, &byte) in payload.iter().enumerate() {
        let cost = usize::from(matches!(byte, b'\\' | b'/')) + 1;
        if escaped_len + cost > max_escaped && i > start {
            chunks.push(&payload[start..i]);
            start = i;
            escaped_len = 0;
        }
        escaped_len += cost;
    }
    if start < payload.len() {
        chunks.push(&payload[start..]);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_connect() {
        let packet = Packet::Connect { id: 12345 };
        let rendered = packet.render();
        assert_eq!(rendered, b"/connect/12345/");
        assert_eq!(Packet::parse(&rendered, false).unwrap(), packet);
    }

    #[test]
    fn round_trips_data_with_escapes() {
        let packet = Packet::Data {
            id: 1,
            pos: 0,
            payload: b"foo/bar\\baz".to_vec(),
        };
        let rendered = packet.render();
        assert_eq!(rendered, b"/data/1/0/foo\\/bar\\\\baz/");
        assert_eq!(Packet::parse(&rendered, false).unwrap(), packet);
    }

    #[test]
    fn rejects_unescaped_slash_in_payload() {
        assert_eq!(
            Packet::parse(b"/data/1/0/foo/bar/", false),
            Err(ParseError::WrongFieldCount("data"))
        );
    }

    #[test]
    fn rejects_dangling_escape() {
        assert_eq!(
            Packet::parse(b"/data/1/0/foo\\/", false),
            Err(ParseError::DanglingEscape)
        );
    }

    #[test]
    fn rejects_oversized_datagram() {
        let huge = vec![b'a'; MAX_DATAGRAM + 1];
        assert_eq!(Packet::parse(&huge, false), Err(ParseError::TooLarge));
    }

    #[test]
    fn rejects_field_at_or_above_2_31() {
        assert_eq!(
            Packet::parse(b"/connect/2147483648/", false),
            Err(ParseError::InvalidNumber)
        );
    }

    #[test]
    fn chunking_respects_escaped_length() {
        let payload = vec![b'/'; 10];
        let chunks = chunk_for_wire(&payload, 6);
        for chunk in &chunks {
            let mut escaped = Vec::new();
            escape_into(chunk, &mut escaped);
            assert!(escaped.len() <= 6);
        }
        assert_eq!(
            chunks.iter().map(|c| c.len()).sum::<usize>(),
            payload.len()
        );
    }
}

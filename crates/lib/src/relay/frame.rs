//! WebSocket frame codec (RFC 6455 subset): text in and out, ping, pong, close.
//!
//! Reads accept masked (client) and unmasked frames. Writes are always single unmasked frames.
//! Fragmentation, extensions, and unknown opcodes are rejected.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::relay::error::ConnectionError;

/// Close code used when the peer's close frame carries none.
pub const CLOSE_NORMAL: u16 = 1000;

/// Server heartbeat: unmasked PING, empty payload.
pub const PING_FRAME: [u8; 2] = [0x89, 0x00];

const FIN: u8 = 0x80;
const MASK_BIT: u8 = 0x80;
const LEN_U16: u8 = 126;
const LEN_U64: u8 = 127;
const MAX_CONTROL_PAYLOAD: u8 = 125;
/// Upper bound on a single data frame; larger frames are refused before allocation.
pub const MAX_PAYLOAD: u64 = 16 * 1024 * 1024;

/// WebSocket opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl OpCode {
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x0 => Some(OpCode::Continuation),
            0x1 => Some(OpCode::Text),
            0x2 => Some(OpCode::Binary),
            0x8 => Some(OpCode::Close),
            0x9 => Some(OpCode::Ping),
            0xA => Some(OpCode::Pong),
            _ => None,
        }
    }
}

/// One decoded inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Text or binary data frame, decoded as UTF-8.
    Text(String),
    /// Ping with its (unmasked) payload, to be echoed in a pong.
    Ping(Vec<u8>),
    Pong,
    Close { code: u16, reason: String },
}

/// Read one frame from the stream. Any short read is a transport failure.
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame, ConnectionError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 2];
    reader.read_exact(&mut header).await?;

    let fin = header[0] & FIN != 0;
    let opcode =
        OpCode::from_u8(header[0] & 0x0F).ok_or(ConnectionError::Protocol("unknown opcode"))?;
    let masked = header[1] & MASK_BIT != 0;
    let base_len = header[1] & 0x7F;

    if !fin {
        return Err(ConnectionError::Protocol("fragmented frames are not supported"));
    }

    match opcode {
        OpCode::Continuation => Err(ConnectionError::Protocol(
            "continuation frames are not supported",
        )),
        OpCode::Pong => {
            // Payload is not used but must be consumed to stay aligned.
            read_payload(reader, control_len(base_len)?, masked).await?;
            Ok(Frame::Pong)
        }
        OpCode::Ping => {
            let payload = read_payload(reader, control_len(base_len)?, masked).await?;
            Ok(Frame::Ping(payload))
        }
        OpCode::Close => {
            let payload = read_payload(reader, control_len(base_len)?, masked).await?;
            Ok(parse_close(&payload))
        }
        OpCode::Text | OpCode::Binary => {
            let len = read_data_len(reader, base_len).await?;
            if len > MAX_PAYLOAD {
                return Err(ConnectionError::Protocol("frame too large"));
            }
            let payload = read_payload(reader, len as usize, masked).await?;
            String::from_utf8(payload)
                .map(Frame::Text)
                .map_err(|_| ConnectionError::Protocol("frame payload is not valid UTF-8"))
        }
    }
}

fn control_len(base_len: u8) -> Result<usize, ConnectionError> {
    if base_len > MAX_CONTROL_PAYLOAD {
        return Err(ConnectionError::Protocol("control frame payload too long"));
    }
    Ok(usize::from(base_len))
}

/// Resolve the true payload length: literal up to 125, else a 16- or 64-bit big-endian extension.
async fn read_data_len<R>(reader: &mut R, base_len: u8) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
{
    match base_len {
        LEN_U16 => Ok(u64::from(reader.read_u16().await?)),
        LEN_U64 => reader.read_u64().await,
        n => Ok(u64::from(n)),
    }
}

/// Read the mask key (if any) and `len` payload bytes, unmasking in place.
async fn read_payload<R>(reader: &mut R, len: usize, masked: bool) -> io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut mask = [0u8; 4];
    if masked {
        reader.read_exact(&mut mask).await?;
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    if masked {
        apply_mask(&mut payload, mask);
    }
    Ok(payload)
}

/// XOR byte `i` with `mask[i % 4]`. Applying it twice restores the input.
pub fn apply_mask(payload: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask[i % 4];
    }
}

fn parse_close(payload: &[u8]) -> Frame {
    if payload.len() < 2 {
        return Frame::Close {
            code: CLOSE_NORMAL,
            reason: String::new(),
        };
    }
    Frame::Close {
        code: u16::from_be_bytes([payload[0], payload[1]]),
        reason: String::from_utf8_lossy(&payload[2..]).into_owned(),
    }
}

/// Encode a text frame: FIN + TEXT, never masked, shortest length form.
pub fn encode_text(text: &str) -> Vec<u8> {
    let payload = text.as_bytes();
    let len = payload.len();
    let mut frame = Vec::with_capacity(len + 10);
    frame.push(FIN | OpCode::Text as u8);
    if len <= usize::from(MAX_CONTROL_PAYLOAD) {
        frame.push(len as u8);
    } else if len <= usize::from(u16::MAX) {
        frame.push(LEN_U16);
        frame.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        frame.push(LEN_U64);
        frame.extend_from_slice(&(len as u64).to_be_bytes());
    }
    frame.extend_from_slice(payload);
    frame
}

/// Pong echoing a ping payload. Ping payloads are at most 125 bytes (enforced on read).
pub fn encode_pong(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 2);
    frame.push(FIN | OpCode::Pong as u8);
    frame.push(payload.len() as u8);
    frame.extend_from_slice(payload);
    frame
}

/// Close frame carrying only the status code.
pub fn encode_close(code: u16) -> Vec<u8> {
    let [hi, lo] = code.to_be_bytes();
    vec![FIN | OpCode::Close as u8, 0x02, hi, lo]
}

/// Write one text frame to the stream.
pub async fn write_frame<W>(writer: &mut W, text: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&encode_text(text)).await
}

//! Framing used on the UDP tunnel:
//! +-----------+------+------------+--------+----------+
//! | TUNNEL_ID | TYPE | SESSION_ID | LENGTH | PAYLOAD  |
//! +-----------+------+------------+--------+----------+
//! |     4     |  2   |     4      |   4    | VARIABLE |
//! +-----------+------+------------+--------+----------+
//!
//! All integers are little-endian. A `TUNNEL_ID` of [`TUNNEL_ID_RAW`] marks a raw control datagram
//! (punching, heartbeats, address probes) which must be exactly one header plus its payload.
//! Any other value is the stream id of the reliable stream, whose packets start with that same id,
//! so the first four bytes of every datagram tell the two apart.
//!
//! Inside the reliable stream the same header is used with `TUNNEL_ID` set to the stream id, and
//! frames follow each other like on the TCP tunnels.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::message::{check_session_rules, parse_kind, FrameError, MessageKind, TunnelMessage, MAX_PAYLOAD_LENGTH};

/// The size (in bytes) of a datagram header.
pub const DATAGRAM_HEADER_SIZE: usize = 4 + 2 + 4 + 4;

/// The tunnel id of raw (not reliable-stream) datagrams.
pub const TUNNEL_ID_RAW: u32 = 0;

/// A message together with the tunnel id it was framed with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatagramMessage {
    pub tunnel_id: u32,
    pub message: TunnelMessage,
}

impl DatagramMessage {
    pub fn new(tunnel_id: u32, message: TunnelMessage) -> Self {
        Self { tunnel_id, message }
    }

    /// Whether this is a raw control datagram rather than part of the reliable stream.
    pub fn is_raw(&self) -> bool {
        self.tunnel_id == TUNNEL_ID_RAW
    }
}

/// A parsed and validated datagram header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatagramHeader {
    pub tunnel_id: u32,
    pub kind: MessageKind,
    pub session_id: u32,
    pub length: u32,
}

impl DatagramHeader {
    /// Parses the header at the start of `buf`. Returns `Ok(None)` if fewer than
    /// [`DATAGRAM_HEADER_SIZE`] bytes are available.
    pub fn parse(mut buf: &[u8]) -> Result<Option<Self>, FrameError> {
        if buf.len() < DATAGRAM_HEADER_SIZE {
            return Ok(None);
        }

        let tunnel_id = buf.get_u32_le();
        let kind = parse_kind(buf.get_u16_le())?;
        let session_id = buf.get_u32_le();
        let length = buf.get_u32_le();

        validate(tunnel_id, kind, session_id, length)?;
        Ok(Some(Self {
            tunnel_id,
            kind,
            session_id,
            length,
        }))
    }

    pub fn frame_size(&self) -> usize {
        DATAGRAM_HEADER_SIZE + self.length as usize
    }
}

// The session id slot of a heartbeat is free: peers put their accepted stream id there as a marker.
fn validate(tunnel_id: u32, kind: MessageKind, session_id: u32, length: u32) -> Result<(), FrameError> {
    match kind {
        MessageKind::Heartbeat | MessageKind::AddrProbe if tunnel_id != TUNNEL_ID_RAW => {
            return Err(FrameError::InvalidTunnelId { kind, tunnel_id })
        }
        MessageKind::Heartbeat if length != 0 => return Err(FrameError::InvalidLength { kind, length }),
        MessageKind::AddrProbe if session_id != 0 => return Err(FrameError::InvalidSessionId { kind, session_id }),
        MessageKind::AddrProbe if length == 0 => return Err(FrameError::InvalidLength { kind, length }),
        MessageKind::StreamInit | MessageKind::StreamData | MessageKind::StreamFini if tunnel_id == TUNNEL_ID_RAW => {
            return Err(FrameError::InvalidTunnelId { kind, tunnel_id })
        }
        _ => {}
    }

    check_session_rules(kind, session_id, length)
}

/// Reads the tunnel id of a datagram without validating anything else.
pub fn peek_tunnel_id(buf: &[u8]) -> Option<u32> {
    let bytes = buf.first_chunk::<4>()?;
    Some(u32::from_le_bytes(*bytes))
}

/// The size of the frame at the start of `buf` according to its length field alone, so a frame
/// whose header fails validation can be skipped. `None` if the header is incomplete or the length
/// is above [`MAX_PAYLOAD_LENGTH`].
pub fn announced_frame_size(buf: &[u8]) -> Option<usize> {
    let length = u32::from_le_bytes(*buf.get(10..DATAGRAM_HEADER_SIZE)?.first_chunk::<4>()?);
    (length <= MAX_PAYLOAD_LENGTH).then(|| DATAGRAM_HEADER_SIZE + length as usize)
}

/// Appends the framed message to `buf`.
pub fn encode(tunnel_id: u32, message: &TunnelMessage, buf: &mut BytesMut) -> Result<(), FrameError> {
    encode_parts(tunnel_id, message.kind, message.session_id, &message.payload, buf)
}

/// Like [`encode`], for a payload that isn't held in a [`TunnelMessage`].
pub fn encode_parts(
    tunnel_id: u32,
    kind: MessageKind,
    session_id: u32,
    payload: &[u8],
    buf: &mut BytesMut,
) -> Result<(), FrameError> {
    let length = u32::try_from(payload.len()).map_err(|_| FrameError::PayloadTooLarge(u32::MAX))?;
    validate(tunnel_id, kind, session_id, length)?;

    buf.reserve(DATAGRAM_HEADER_SIZE + payload.len());
    buf.put_u32_le(tunnel_id);
    buf.put_u16_le(kind.into());
    buf.put_u32_le(session_id);
    buf.put_u32_le(length);
    buf.put_slice(payload);
    Ok(())
}

/// Encodes a raw control datagram into a standalone buffer.
pub fn encode_raw(message: &TunnelMessage) -> Result<Bytes, FrameError> {
    let mut buf = BytesMut::with_capacity(DATAGRAM_HEADER_SIZE + message.payload.len());
    encode(TUNNEL_ID_RAW, message, &mut buf)?;
    Ok(buf.freeze())
}

/// Decodes the frame at the start of `buf`. `Ok(None)` means more data is needed.
pub fn decode(buf: &[u8]) -> Result<Option<(DatagramMessage, usize)>, FrameError> {
    let header = match DatagramHeader::parse(buf)? {
        Some(h) => h,
        None => return Ok(None),
    };

    let frame_size = header.frame_size();
    if buf.len() < frame_size {
        return Ok(None);
    }

    let payload = Bytes::copy_from_slice(&buf[DATAGRAM_HEADER_SIZE..frame_size]);
    let message = TunnelMessage::new(header.kind, header.session_id, payload);
    Ok(Some((DatagramMessage::new(header.tunnel_id, message), frame_size)))
}

/// Like [`decode`], but takes the frame out of `buf` on success. On `Ok(None)` or `Err` the buffer
/// is left untouched.
pub fn decode_from(buf: &mut BytesMut) -> Result<Option<DatagramMessage>, FrameError> {
    let header = match DatagramHeader::parse(buf)? {
        Some(h) => h,
        None => return Ok(None),
    };

    if buf.len() < header.frame_size() {
        return Ok(None);
    }

    buf.advance(DATAGRAM_HEADER_SIZE);
    let payload = buf.split_to(header.length as usize).freeze();
    let message = TunnelMessage::new(header.kind, header.session_id, payload);
    Ok(Some(DatagramMessage::new(header.tunnel_id, message)))
}

/// Parses a whole raw control datagram. The datagram must hold exactly one header plus the
/// payload length it announces, and its tunnel id must be [`TUNNEL_ID_RAW`].
pub fn parse_raw(buf: &[u8]) -> Result<TunnelMessage, FrameError> {
    let header = DatagramHeader::parse(buf)?.ok_or(FrameError::Truncated)?;

    if header.tunnel_id != TUNNEL_ID_RAW {
        return Err(FrameError::InvalidTunnelId {
            kind: header.kind,
            tunnel_id: header.tunnel_id,
        });
    }

    if buf.len() != header.frame_size() {
        return Err(FrameError::LengthMismatch {
            expected: header.frame_size(),
            actual: buf.len(),
        });
    }

    let payload = Bytes::copy_from_slice(&buf[DATAGRAM_HEADER_SIZE..]);
    Ok(TunnelMessage::new(header.kind, header.session_id, payload))
}

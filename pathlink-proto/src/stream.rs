//! Framing used on the TCP tunnels (direct and relay):
//! +------+------------+--------+----------+
//! | TYPE | SESSION_ID | LENGTH | PAYLOAD  |
//! +------+------------+--------+----------+
//! |  2   |     4      |   4    | VARIABLE |
//! +------+------------+--------+----------+
//!
//! All integers are little-endian. `TYPE` is a [`MessageKind`], `SESSION_ID` is the proxy session
//! the message belongs to (0 for control messages) and `LENGTH` is the size of `PAYLOAD`.
//!
//! A connection's bytes are a plain sequence of these frames, so decoding is resumable: a buffer
//! holding a partial frame yields `Ok(None)` and consumes nothing.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::message::{check_session_rules, parse_kind, FrameError, MessageKind, TunnelMessage};

/// The size (in bytes) of a stream header.
pub const STREAM_HEADER_SIZE: usize = 2 + 4 + 4;

/// A parsed and validated stream header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamHeader {
    pub kind: MessageKind,
    pub session_id: u32,
    pub length: u32,
}

impl StreamHeader {
    /// Parses the header at the start of `buf`. Returns `Ok(None)` if fewer than
    /// [`STREAM_HEADER_SIZE`] bytes are available.
    pub fn parse(mut buf: &[u8]) -> Result<Option<Self>, FrameError> {
        if buf.len() < STREAM_HEADER_SIZE {
            return Ok(None);
        }

        let kind = parse_kind(buf.get_u16_le())?;
        let session_id = buf.get_u32_le();
        let length = buf.get_u32_le();

        validate(kind, session_id, length)?;
        Ok(Some(Self { kind, session_id, length }))
    }

    /// The size of the whole frame this header starts.
    pub fn frame_size(&self) -> usize {
        STREAM_HEADER_SIZE + self.length as usize
    }
}

fn validate(kind: MessageKind, session_id: u32, length: u32) -> Result<(), FrameError> {
    match kind {
        MessageKind::AddrProbe => return Err(FrameError::NotAllowed(kind)),
        MessageKind::Heartbeat if session_id != 0 => return Err(FrameError::InvalidSessionId { kind, session_id }),
        MessageKind::Heartbeat if length != 0 => return Err(FrameError::InvalidLength { kind, length }),
        _ => {}
    }

    check_session_rules(kind, session_id, length)
}

/// Appends the framed message to `buf`. Fails without writing anything if the message would not
/// pass validation on the receiving end.
pub fn encode(message: &TunnelMessage, buf: &mut BytesMut) -> Result<(), FrameError> {
    encode_parts(message.kind, message.session_id, &message.payload, buf)
}

/// Like [`encode`], for a payload that isn't held in a [`TunnelMessage`].
pub fn encode_parts(kind: MessageKind, session_id: u32, payload: &[u8], buf: &mut BytesMut) -> Result<(), FrameError> {
    let length = u32::try_from(payload.len()).map_err(|_| FrameError::PayloadTooLarge(u32::MAX))?;
    validate(kind, session_id, length)?;

    buf.reserve(STREAM_HEADER_SIZE + payload.len());
    buf.put_u16_le(kind.into());
    buf.put_u32_le(session_id);
    buf.put_u32_le(length);
    buf.put_slice(payload);
    Ok(())
}

/// Decodes the frame at the start of `buf`, returning the message and the amount of bytes it
/// occupied. `Ok(None)` means more data is needed.
pub fn decode(buf: &[u8]) -> Result<Option<(TunnelMessage, usize)>, FrameError> {
    let header = match StreamHeader::parse(buf)? {
        Some(h) => h,
        None => return Ok(None),
    };

    let frame_size = header.frame_size();
    if buf.len() < frame_size {
        return Ok(None);
    }

    let payload = Bytes::copy_from_slice(&buf[STREAM_HEADER_SIZE..frame_size]);
    Ok(Some((TunnelMessage::new(header.kind, header.session_id, payload), frame_size)))
}

/// Like [`decode`], but takes the frame out of `buf` on success. On `Ok(None)` or `Err` the buffer
/// is left untouched.
pub fn decode_from(buf: &mut BytesMut) -> Result<Option<TunnelMessage>, FrameError> {
    let header = match StreamHeader::parse(buf)? {
        Some(h) => h,
        None => return Ok(None),
    };

    if buf.len() < header.frame_size() {
        return Ok(None);
    }

    buf.advance(STREAM_HEADER_SIZE);
    let payload = buf.split_to(header.length as usize).freeze();
    Ok(Some(TunnelMessage::new(header.kind, header.session_id, payload)))
}

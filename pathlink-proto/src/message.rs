use bytes::Bytes;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use thiserror::Error;

/// The largest payload a single message may carry. Anything above this is treated as a corrupt
/// length field rather than buffered.
pub const MAX_PAYLOAD_LENGTH: u32 = 2 * 1024 * 1024;

/// The type of a tunnel message, as sent in the `TYPE` field of both header shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum MessageKind {
    /// Keepalive. Carries no payload.
    Heartbeat = 0,

    /// Tunnel handshake. The request carries the client's identity and the response (UDP only)
    /// carries the stream id assigned by the peer.
    TunnelInit = 1,

    /// Public address discovery against the probe server. Only valid on the UDP tunnel.
    AddrProbe = 2,

    /// Opens a proxy session. The payload holds the port to connect to on the remote side.
    StreamInit = 10,

    /// Proxied bytes for a session.
    StreamData = 11,

    /// Closes a proxy session. Carries no payload.
    StreamFini = 12,
}

impl MessageKind {
    /// Whether this kind belongs to a proxy session (and thus requires a non-zero session id).
    pub fn is_session_message(self) -> bool {
        matches!(self, Self::StreamInit | Self::StreamData | Self::StreamFini)
    }
}

/// A decoded tunnel message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelMessage {
    pub kind: MessageKind,
    pub session_id: u32,
    pub payload: Bytes,
}

impl TunnelMessage {
    pub fn new(kind: MessageKind, session_id: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            session_id,
            payload: payload.into(),
        }
    }

    pub fn heartbeat() -> Self {
        Self::new(MessageKind::Heartbeat, 0, Bytes::new())
    }

    pub fn tunnel_init(payload: impl Into<Bytes>) -> Self {
        Self::new(MessageKind::TunnelInit, 0, payload)
    }

    pub fn stream_data(session_id: u32, payload: impl Into<Bytes>) -> Self {
        Self::new(MessageKind::StreamData, session_id, payload)
    }

    pub fn stream_fini(session_id: u32) -> Self {
        Self::new(MessageKind::StreamFini, session_id, Bytes::new())
    }

    /// The value written in the header's `LENGTH` field.
    pub fn payload_length(&self) -> u32 {
        self.payload.len() as u32
    }
}

/// Reasons a header is rejected. None of these are recoverable on a byte stream, since the
/// position of the next header can no longer be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    /// The `TYPE` field holds a value that isn't a known [`MessageKind`].
    #[error("unknown message type {0}")]
    UnknownKind(u16),

    /// The session id is not allowed for this message kind.
    #[error("session id {session_id} is not valid for {kind:?}")]
    InvalidSessionId { kind: MessageKind, session_id: u32 },

    /// The tunnel id is not allowed for this message kind.
    #[error("tunnel id {tunnel_id} is not valid for {kind:?}")]
    InvalidTunnelId { kind: MessageKind, tunnel_id: u32 },

    /// The payload length is not allowed for this message kind.
    #[error("payload length {length} is not valid for {kind:?}")]
    InvalidLength { kind: MessageKind, length: u32 },

    /// The payload length is above [`MAX_PAYLOAD_LENGTH`].
    #[error("payload length {0} exceeds the maximum of {MAX_PAYLOAD_LENGTH}")]
    PayloadTooLarge(u32),

    /// The message kind can't be sent over this kind of tunnel.
    #[error("{0:?} is not allowed on this tunnel")]
    NotAllowed(MessageKind),

    /// A raw datagram's size doesn't match the length its header announces.
    #[error("datagram holds {actual} bytes but its header announces {expected}")]
    LengthMismatch { expected: usize, actual: usize },

    /// A raw datagram is shorter than a header.
    #[error("datagram is too short to hold a header")]
    Truncated,
}

pub(crate) fn parse_kind(raw: u16) -> Result<MessageKind, FrameError> {
    MessageKind::try_from(raw).map_err(|_| FrameError::UnknownKind(raw))
}

/// Checks the rules shared by both header shapes: the payload cap and the session id and length
/// requirements of session messages.
pub(crate) fn check_session_rules(kind: MessageKind, session_id: u32, length: u32) -> Result<(), FrameError> {
    if length > MAX_PAYLOAD_LENGTH {
        return Err(FrameError::PayloadTooLarge(length));
    }

    match kind {
        MessageKind::StreamInit | MessageKind::StreamData | MessageKind::StreamFini if session_id == 0 => {
            Err(FrameError::InvalidSessionId { kind, session_id })
        }
        MessageKind::StreamInit | MessageKind::StreamData if length == 0 => Err(FrameError::InvalidLength { kind, length }),
        MessageKind::StreamFini if length != 0 => Err(FrameError::InvalidLength { kind, length }),
        MessageKind::TunnelInit if session_id != 0 => Err(FrameError::InvalidSessionId { kind, session_id }),
        MessageKind::TunnelInit if length == 0 => Err(FrameError::InvalidLength { kind, length }),
        _ => Ok(()),
    }
}

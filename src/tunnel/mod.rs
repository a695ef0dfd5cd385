//! The three transports a session can be carried over.
//!
//! Every tunnel is a sans-IO state machine: it buffers what should be written, reports when it
//! wants to be woken up through `poll_timeout` and never touches a socket itself. The
//! [`runtime`](crate::runtime) owns the sockets and feeds events in.

use std::{fmt, time::Instant};

use pathlink_proto::MessageKind;

use crate::error::TunnelError;

mod stream;
mod udp;

pub use stream::*;
pub use udp::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// TCP straight to the device's LAN address.
    Direct,

    /// The hole-punched UDP path with the reliable stream on top.
    Udp,

    /// TCP to the relay server, which forwards to the device.
    Relay,
}

impl TransportKind {
    /// Preference order for new sessions.
    pub const PRIORITY: [TransportKind; 3] = [TransportKind::Direct, TransportKind::Udp, TransportKind::Relay];

    /// The transports that run over a TCP connection.
    pub const STREAMS: [TransportKind; 2] = [TransportKind::Direct, TransportKind::Relay];
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct => write!(f, "direct"),
            Self::Udp => write!(f, "udp"),
            Self::Relay => write!(f, "relay"),
        }
    }
}

/// What the subsystem needs from any tunnel to carry proxy sessions.
pub trait Tunnel {
    fn kind(&self) -> TransportKind;

    /// Whether the tunnel can carry data right now.
    fn is_ready(&self) -> bool;

    /// Frames and queues a session message carrying `payload`.
    fn send(&mut self, kind: MessageKind, session_id: u32, payload: &[u8]) -> Result<(), TunnelError>;

    /// Frames and queues a session message without payload.
    fn send_control(&mut self, kind: MessageKind, session_id: u32) -> Result<(), TunnelError> {
        self.send(kind, session_id, &[])
    }

    /// Tears down the tunnel's connection. Stream tunnels schedule a reconnect, the UDP tunnel goes
    /// back to idle.
    fn close(&mut self, now: Instant);
}

/// Rejects session messages that can never be valid, before they reach a codec.
pub(crate) fn check_outbound(kind: MessageKind, session_id: u32, payload: &[u8]) -> Result<(), TunnelError> {
    if !kind.is_session_message() {
        return Err(TunnelError::InvalidInput("control messages are only sent by the tunnels"));
    }

    if session_id == 0 {
        return Err(TunnelError::InvalidInput("session id must not be zero"));
    }

    match kind {
        MessageKind::StreamFini if !payload.is_empty() => Err(TunnelError::InvalidInput("StreamFini carries no payload")),
        MessageKind::StreamInit | MessageKind::StreamData if payload.is_empty() => {
            Err(TunnelError::InvalidInput("payload must not be empty"))
        }
        _ => Ok(()),
    }
}

/// The closed set of tunnels a subsystem owns.
pub struct Tunnels {
    pub direct: StreamTunnel,
    pub relay: StreamTunnel,
    pub udp: UdpTunnel,
}

impl Tunnels {
    pub fn is_ready(&self, kind: TransportKind) -> bool {
        match kind {
            TransportKind::Direct => self.direct.is_ready(),
            TransportKind::Udp => self.udp.is_ready(),
            TransportKind::Relay => self.relay.is_ready(),
        }
    }

    /// [`Tunnel::send`] on the tunnel of `kind`.
    pub fn send(&mut self, kind: TransportKind, message: MessageKind, session_id: u32, payload: &[u8]) -> Result<(), TunnelError> {
        match kind {
            TransportKind::Direct => self.direct.send(message, session_id, payload),
            TransportKind::Udp => self.udp.send(message, session_id, payload),
            TransportKind::Relay => self.relay.send(message, session_id, payload),
        }
    }

    pub fn send_control(&mut self, kind: TransportKind, message: MessageKind, session_id: u32) -> Result<(), TunnelError> {
        self.send(kind, message, session_id, &[])
    }

    /// The stream tunnel for `kind`, or `None` for [`TransportKind::Udp`].
    pub fn stream(&self, kind: TransportKind) -> Option<&StreamTunnel> {
        match kind {
            TransportKind::Direct => Some(&self.direct),
            TransportKind::Relay => Some(&self.relay),
            TransportKind::Udp => None,
        }
    }

    pub fn stream_mut(&mut self, kind: TransportKind) -> Option<&mut StreamTunnel> {
        match kind {
            TransportKind::Direct => Some(&mut self.direct),
            TransportKind::Relay => Some(&mut self.relay),
            TransportKind::Udp => None,
        }
    }
}

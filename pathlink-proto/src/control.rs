//! JSON payloads carried by control messages.

use std::num::NonZeroU32;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("malformed control payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid tunnel id {0:?}")]
    InvalidTunnelId(String),

    #[error("invalid peer address {0:?}")]
    InvalidAddress(String),
}

/// Who we are, sent as the payload of every `TunnelInit` request. The direct and relay handshakes
/// and the UDP punch datagrams all carry the same document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerIdentity {
    pub order_id: String,
    pub device_token: String,
    pub user_token: String,
}

/// The peer's answer to a punch. Older peers send the id as a string.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PunchResponse {
    tunnel_id: TunnelIdField,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
enum TunnelIdField {
    Number(u64),
    Text(String),
}

impl PunchResponse {
    /// The stream id the peer assigned. Zero, negative and out of range values are rejected.
    pub fn stream_id(&self) -> Result<NonZeroU32, ControlError> {
        let parsed = match &self.tunnel_id {
            TunnelIdField::Number(n) => u32::try_from(*n).ok(),
            TunnelIdField::Text(s) => s.trim().parse::<u32>().ok(),
        };

        parsed.and_then(NonZeroU32::new).ok_or_else(|| {
            let shown = match &self.tunnel_id {
                TunnelIdField::Number(n) => n.to_string(),
                TunnelIdField::Text(s) => s.clone(),
            };
            ControlError::InvalidTunnelId(shown)
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddrProbeRequest {
    pub user_token: String,
}

/// The probe server's view of our address, as `ip:port`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddrProbeResponse {
    pub peer_addr: String,
}

impl AddrProbeResponse {
    pub fn socket_addr(&self) -> Result<std::net::SocketAddr, ControlError> {
        self.peer_addr
            .parse()
            .map_err(|_| ControlError::InvalidAddress(self.peer_addr.clone()))
    }
}

/// Payload of `StreamInit`: the port the peer should connect the new session to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamInit {
    pub port: u16,
}

/// Serializes a control document into a message payload.
pub fn to_payload<T: Serialize>(value: &T) -> Result<Bytes, ControlError> {
    Ok(Bytes::from(serde_json::to_vec(value)?))
}

/// Parses a control document from a message payload.
pub fn from_payload<'a, T: Deserialize<'a>>(payload: &'a [u8]) -> Result<T, ControlError> {
    Ok(serde_json::from_slice(payload)?)
}

use std::{net::SocketAddr, ops::BitXorAssign};

use base64::Engine;
use pathlink_proto::control::PeerIdentity;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::DEFAULT_TARGET_PORT;

/// Everything the control channel hands over to open a tunnel session: who we are and where the
/// device can be reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionParams {
    pub identity: PeerIdentity,

    /// The device's LAN address, for direct connections.
    #[serde(default)]
    pub direct_addr: Option<SocketAddr>,

    /// The device's public address, for hole punching.
    #[serde(default)]
    pub public_addr: Option<SocketAddr>,

    #[serde(default)]
    pub relay_addr: Option<SocketAddr>,

    /// The server that tells us our own public address.
    #[serde(default)]
    pub probe_addr: Option<SocketAddr>,

    /// The port sessions are opened to on the device.
    #[serde(default = "default_target_port")]
    pub target_port: u16,
}

fn default_target_port() -> u16 {
    DEFAULT_TARGET_PORT
}

#[derive(Debug, Error)]
pub enum SessionCodeError {
    #[error("session code is not valid base64")]
    InvalidBase64,

    #[error("session code is too short")]
    UnexpectedEnd,

    #[error("session code checksum doesn't match, was it copied wrong?")]
    BadChecksum,

    #[error("session code contents are malformed: {0}")]
    Json(#[from] serde_json::Error),
}

fn calc_checksum(buf: &[u8]) -> u16 {
    let mut ones_count = 0u8;
    let mut xored = 0x69;

    for ele in buf {
        ones_count = ones_count.wrapping_add(ele.count_ones() as u8);
        xored.bitxor_assign(*ele);
    }

    (xored as u16) | ((ones_count as u16) << 8)
}

impl SessionParams {
    pub fn new(identity: PeerIdentity) -> Self {
        Self {
            identity,
            direct_addr: None,
            public_addr: None,
            relay_addr: None,
            probe_addr: None,
            target_port: DEFAULT_TARGET_PORT,
        }
    }

    pub fn serialize_to_bytes(&self) -> Result<Vec<u8>, SessionCodeError> {
        let mut buf = serde_json::to_vec(self)?;
        let checksum = calc_checksum(&buf);
        buf.extend_from_slice(&checksum.to_le_bytes());
        Ok(buf)
    }

    pub fn serialize_to_string(&self) -> Result<String, SessionCodeError> {
        let buf = self.serialize_to_bytes()?;
        Ok(base64::prelude::BASE64_URL_SAFE_NO_PAD.encode(buf))
    }

    pub fn deserialize_from_bytes(buf: &[u8]) -> Result<SessionParams, SessionCodeError> {
        let Some(index) = buf.len().checked_sub(2) else {
            return Err(SessionCodeError::UnexpectedEnd);
        };

        let checksum = u16::from_le_bytes([buf[index], buf[index + 1]]);
        if checksum != calc_checksum(&buf[..index]) {
            return Err(SessionCodeError::BadChecksum);
        }

        Ok(serde_json::from_slice(&buf[..index])?)
    }

    pub fn deserialize_from_str(string: &str) -> Result<SessionParams, SessionCodeError> {
        let buf = base64::prelude::BASE64_URL_SAFE_NO_PAD
            .decode(string.trim())
            .map_err(|_| SessionCodeError::InvalidBase64)?;

        Self::deserialize_from_bytes(&buf)
    }
}

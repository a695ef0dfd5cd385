use std::io;

use pathlink_arq::ArqError;
use pathlink_proto::control::ControlError;
use pathlink_proto::FrameError;
use thiserror::Error;

use crate::tunnel::TransportKind;

/// Errors returned by the tunnel subsystem's operations.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// The caller passed something that can never be sent (session id 0, empty data, ...).
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),

    /// Bytes from the remote side failed validation.
    #[error("protocol violation: {0}")]
    ProtocolViolation(#[from] FrameError),

    /// The tunnel has no usable connection right now.
    #[error("the {0} tunnel is not connected")]
    TransportFailure(TransportKind),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// No proxy session is registered under this id.
    #[error("proxy session {0} not found")]
    SessionNotFound(u32),

    /// No tunnel is ready to carry a new session.
    #[error("no tunnel is ready")]
    PathUnavailable,

    #[error("reliable stream error: {0}")]
    Arq(#[from] ArqError),

    #[error(transparent)]
    Control(#[from] ControlError),
}

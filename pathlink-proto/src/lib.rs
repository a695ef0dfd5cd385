//! Framing for the messages exchanged between a pathlink client and its peer.
//!
//! Two header shapes exist. Messages on the TCP tunnels (direct and relay) use the
//! [stream header](stream), while messages on the UDP tunnel use the [datagram header](datagram),
//! which prepends a tunnel id used to tell raw control datagrams apart from reliable-stream
//! packets. Control messages carry small JSON documents, see [`control`].

pub mod control;
pub mod datagram;
mod message;
pub mod stream;

pub use message::*;

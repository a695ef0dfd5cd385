use std::{
    net::SocketAddr,
    time::{Duration, Instant},
};

use bytes::{Bytes, BytesMut};
use pathlink_proto::{
    control::{self, PeerIdentity},
    stream, MessageKind, TunnelMessage,
};
use tracing::{debug, info, trace, warn};

use crate::{
    config::TunnelConfig,
    error::TunnelError,
    reconnect::ReconnectPolicy,
    tunnel::{check_outbound, TransportKind, Tunnel},
    utils::earliest,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// No connection. A reconnect may be scheduled.
    Disconnected,

    /// A connection attempt is in flight. Frames can be queued but the tunnel isn't ready yet.
    Connecting,

    /// The connection became writable. Frames are being written.
    Ready,
}

/// A request for the runtime to open a TCP connection for a stream tunnel. Every event coming back
/// from that connection must carry the same `generation`, so events from replaced connections can
/// be told apart and ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectRequest {
    pub kind: TransportKind,
    pub generation: u64,
    pub address: SocketAddr,
}

/// A tunnel over a single TCP connection: either straight to the device (direct) or through the
/// relay server. Both speak the same stream framing, and both start every connection with a
/// `TunnelInit` frame carrying our identity.
pub struct StreamTunnel {
    kind: TransportKind,
    target: Option<SocketAddr>,
    init_payload: Bytes,
    policy: ReconnectPolicy,
    connect_timeout: Duration,
    heartbeat_interval: Duration,

    state: StreamState,
    generation: u64,
    outbound: BytesMut,
    inbound: BytesMut,
    pending_connect: bool,
    reconnect_at: Option<Instant>,
    connect_deadline: Option<Instant>,
    next_heartbeat: Option<Instant>,
}

impl StreamTunnel {
    pub fn new(
        kind: TransportKind,
        target: Option<SocketAddr>,
        identity: &PeerIdentity,
        policy: ReconnectPolicy,
        config: &TunnelConfig,
    ) -> Result<Self, TunnelError> {
        if kind == TransportKind::Udp {
            return Err(TunnelError::InvalidInput("the udp transport has its own tunnel"));
        }

        Ok(Self {
            kind,
            target,
            init_payload: control::to_payload(identity)?,
            policy,
            connect_timeout: config.connect_timeout,
            heartbeat_interval: config.stream_heartbeat_interval,
            state: StreamState::Disconnected,
            generation: 0,
            outbound: BytesMut::new(),
            inbound: BytesMut::new(),
            pending_connect: false,
            reconnect_at: None,
            connect_deadline: None,
            next_heartbeat: None,
        })
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn target(&self) -> Option<SocketAddr> {
        self.target
    }

    /// When the pending reconnect fires, if one is scheduled.
    pub fn reconnect_at(&self) -> Option<Instant> {
        self.reconnect_at
    }

    /// Starts the first connection. Does nothing when no target address is configured.
    pub fn start(&mut self, now: Instant) {
        match self.target {
            Some(_) => self.connect(now),
            None => debug!(kind = %self.kind, "no address configured, tunnel stays down"),
        }
    }

    /// Begins a new connection, discarding whatever the previous one left in the buffers.
    fn connect(&mut self, now: Instant) {
        let Some(address) = self.target else {
            return;
        };

        self.generation += 1;
        self.outbound.clear();
        self.inbound.clear();

        if let Err(error) = stream::encode_parts(MessageKind::TunnelInit, 0, &self.init_payload, &mut self.outbound) {
            warn!(kind = %self.kind, %error, "could not frame the tunnel handshake");
        }

        self.state = StreamState::Connecting;
        self.pending_connect = true;
        self.reconnect_at = None;
        self.connect_deadline = Some(now + self.connect_timeout);
        self.next_heartbeat = None;

        info!(kind = %self.kind, %address, generation = self.generation, "connecting");
    }

    /// Takes the pending connection request, if any.
    pub fn poll_connect(&mut self) -> Option<ConnectRequest> {
        if !self.pending_connect {
            return None;
        }

        self.pending_connect = false;
        let address = self.target?;
        Some(ConnectRequest {
            kind: self.kind,
            generation: self.generation,
            address,
        })
    }

    /// The connection became writable for the first time.
    pub fn on_writable(&mut self, generation: u64, now: Instant) {
        if generation != self.generation || self.state != StreamState::Connecting {
            return;
        }

        self.state = StreamState::Ready;
        self.connect_deadline = None;
        self.next_heartbeat = Some(now + self.heartbeat_interval);
        info!(kind = %self.kind, generation, "tunnel ready");
    }

    /// Feeds bytes read from the connection, returning the session messages they completed.
    /// A framing error closes the connection.
    pub fn on_received(&mut self, generation: u64, data: &[u8], now: Instant) -> Vec<TunnelMessage> {
        let mut messages = Vec::new();
        if generation != self.generation || self.state == StreamState::Disconnected {
            return messages;
        }

        self.inbound.extend_from_slice(data);

        loop {
            match stream::decode_from(&mut self.inbound) {
                Ok(Some(message)) => match message.kind {
                    MessageKind::Heartbeat | MessageKind::TunnelInit => {
                        trace!(kind = %self.kind, message_kind = ?message.kind, "control frame");
                    }
                    _ => messages.push(message),
                },
                Ok(None) => break,
                Err(error) => {
                    warn!(kind = %self.kind, %error, "protocol violation, dropping connection");
                    self.on_closed(generation, now);
                    break;
                }
            }
        }

        messages
    }

    /// The connection failed, was closed by the remote or errored. Schedules exactly one
    /// reconnect; later reports for the same connection are ignored.
    pub fn on_closed(&mut self, generation: u64, now: Instant) {
        if generation != self.generation || self.state == StreamState::Disconnected {
            return;
        }

        self.state = StreamState::Disconnected;
        self.outbound.clear();
        self.inbound.clear();
        self.pending_connect = false;
        self.connect_deadline = None;
        self.next_heartbeat = None;

        let delay = self.policy.next_delay();
        self.reconnect_at = Some(now + delay);
        info!(kind = %self.kind, generation, ?delay, "tunnel closed, reconnect scheduled");
    }

    /// Takes everything queued for writing. Nothing is handed out while disconnected.
    pub fn take_outbound(&mut self) -> Option<Bytes> {
        if self.state == StreamState::Disconnected || self.outbound.is_empty() {
            return None;
        }

        Some(self.outbound.split().freeze())
    }

    pub fn poll_timeout(&self) -> Option<Instant> {
        earliest([self.reconnect_at, self.connect_deadline, self.next_heartbeat])
    }

    pub fn handle_timeout(&mut self, now: Instant) {
        if self.reconnect_at.is_some_and(|at| at <= now) {
            self.connect(now);
        }

        if self.connect_deadline.is_some_and(|at| at <= now) {
            warn!(kind = %self.kind, timeout = ?self.connect_timeout, "connect timed out");
            self.on_closed(self.generation, now);
        }

        if let Some(at) = self.next_heartbeat.filter(|at| *at <= now) {
            if let Err(error) = stream::encode(&TunnelMessage::heartbeat(), &mut self.outbound) {
                warn!(kind = %self.kind, %error, "could not frame heartbeat");
            }

            let next = at + self.heartbeat_interval;
            self.next_heartbeat = Some(if next > now { next } else { now + self.heartbeat_interval });
        }
    }
}

impl Tunnel for StreamTunnel {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn is_ready(&self) -> bool {
        self.state == StreamState::Ready
    }

    fn send(&mut self, kind: MessageKind, session_id: u32, payload: &[u8]) -> Result<(), TunnelError> {
        check_outbound(kind, session_id, payload)?;

        if self.state == StreamState::Disconnected {
            return Err(TunnelError::TransportFailure(self.kind));
        }

        stream::encode_parts(kind, session_id, payload, &mut self.outbound)?;
        Ok(())
    }

    fn close(&mut self, now: Instant) {
        self.on_closed(self.generation, now);
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;

    fn identity() -> PeerIdentity {
        PeerIdentity {
            order_id: "order-1".to_string(),
            device_token: "device".to_string(),
            user_token: "user".to_string(),
        }
    }

    fn relay() -> StreamTunnel {
        let config = TunnelConfig::default();
        let policy = ReconnectPolicy::with_rng(config.reconnect_min, config.reconnect_max, StdRng::seed_from_u64(1));
        let target = Some("192.0.2.10:9000".parse().unwrap());
        StreamTunnel::new(TransportKind::Relay, target, &identity(), policy, &config).unwrap()
    }

    fn connected(now: Instant) -> StreamTunnel {
        let mut tunnel = relay();
        tunnel.start(now);
        let request = tunnel.poll_connect().unwrap();
        tunnel.on_writable(request.generation, now);
        tunnel.take_outbound();
        tunnel
    }

    #[test]
    fn test_handshake_first() {
        let now = Instant::now();
        let mut tunnel = relay();
        assert_eq!(tunnel.poll_connect(), None);

        tunnel.start(now);
        let request = tunnel.poll_connect().unwrap();
        assert_eq!(request.address, "192.0.2.10:9000".parse().unwrap());
        assert_eq!(request.kind, TransportKind::Relay);
        assert_eq!(tunnel.poll_connect(), None);
        assert!(!tunnel.is_ready());

        // Frames queued while connecting go after the handshake.
        tunnel.send(MessageKind::StreamData, 3, b"early").unwrap();

        let mut outbound = BytesMut::from(&tunnel.take_outbound().unwrap()[..]);
        let init = stream::decode_from(&mut outbound).unwrap().unwrap();
        assert_eq!(init.kind, MessageKind::TunnelInit);
        let sent: PeerIdentity = control::from_payload(&init.payload).unwrap();
        assert_eq!(sent, identity());
        assert_eq!(stream::decode_from(&mut outbound).unwrap().unwrap().session_id, 3);

        tunnel.on_writable(request.generation, now);
        assert!(tunnel.is_ready());
    }

    #[test]
    fn test_send_while_disconnected() {
        let mut tunnel = relay();
        assert!(matches!(
            tunnel.send(MessageKind::StreamData, 1, b"x"),
            Err(TunnelError::TransportFailure(TransportKind::Relay))
        ));
        assert!(matches!(
            tunnel.send(MessageKind::StreamData, 0, b"x"),
            Err(TunnelError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_peer_close_schedules_one_reconnect() {
        let now = Instant::now();
        let mut tunnel = connected(now);
        let generation = tunnel.generation();
        tunnel.send(MessageKind::StreamData, 9, b"pending").unwrap();

        tunnel.on_closed(generation, now);
        assert!(!tunnel.is_ready());
        assert_eq!(tunnel.state(), StreamState::Disconnected);
        assert_eq!(tunnel.take_outbound(), None);

        let config = TunnelConfig::default();
        let at = tunnel.reconnect_at().unwrap();
        assert!(at >= now + config.reconnect_min && at <= now + config.reconnect_max);

        // A second report for the same connection changes nothing.
        tunnel.on_closed(generation, now + Duration::from_secs(1));
        assert_eq!(tunnel.reconnect_at(), Some(at));
        assert_eq!(tunnel.poll_timeout(), Some(at));

        tunnel.handle_timeout(at);
        let request = tunnel.poll_connect().unwrap();
        assert_eq!(request.generation, generation + 1);
        assert_eq!(tunnel.state(), StreamState::Connecting);

        // Old outbound data was discarded: only the new handshake is queued.
        let outbound = tunnel.take_outbound().unwrap();
        let (message, consumed) = stream::decode(&outbound).unwrap().unwrap();
        assert_eq!(message.kind, MessageKind::TunnelInit);
        assert_eq!(consumed, outbound.len());
    }

    #[test]
    fn test_stale_generation_ignored() {
        let now = Instant::now();
        let mut tunnel = connected(now);
        let old = tunnel.generation();
        tunnel.close(now);
        tunnel.handle_timeout(tunnel.reconnect_at().unwrap());

        tunnel.on_writable(old, now);
        assert!(!tunnel.is_ready());

        let mut frame = BytesMut::new();
        stream::encode(&TunnelMessage::stream_data(1, &b"late"[..]), &mut frame).unwrap();
        assert!(tunnel.on_received(old, &frame, now).is_empty());

        tunnel.on_closed(old, now);
        assert_eq!(tunnel.state(), StreamState::Connecting);
    }

    #[test]
    fn test_connect_timeout() {
        let now = Instant::now();
        let mut tunnel = relay();
        tunnel.start(now);
        tunnel.poll_connect();

        let deadline = tunnel.poll_timeout().unwrap();
        assert_eq!(deadline, now + TunnelConfig::default().connect_timeout);

        tunnel.handle_timeout(deadline);
        assert_eq!(tunnel.state(), StreamState::Disconnected);
        assert!(tunnel.reconnect_at().is_some());
    }

    #[test]
    fn test_inbound_frames_split_across_reads() {
        let now = Instant::now();
        let mut tunnel = connected(now);
        let generation = tunnel.generation();

        let mut bytes = BytesMut::new();
        stream::encode(&TunnelMessage::heartbeat(), &mut bytes).unwrap();
        stream::encode(&TunnelMessage::stream_data(4, &b"response"[..]), &mut bytes).unwrap();
        stream::encode(&TunnelMessage::stream_fini(4), &mut bytes).unwrap();

        let (first, second) = bytes.split_at(13);
        assert!(tunnel.on_received(generation, first, now).is_empty());

        let messages = tunnel.on_received(generation, second, now);
        assert_eq!(
            messages,
            vec![TunnelMessage::stream_data(4, &b"response"[..]), TunnelMessage::stream_fini(4)]
        );
    }

    #[test]
    fn test_protocol_violation_closes() {
        let now = Instant::now();
        let mut tunnel = connected(now);
        let generation = tunnel.generation();

        // StreamData for session 0 is never valid.
        let garbage = [11, 0, 0, 0, 0, 0, 1, 0, 0, 0, b'x'];
        assert!(tunnel.on_received(generation, &garbage, now).is_empty());
        assert_eq!(tunnel.state(), StreamState::Disconnected);
        assert!(tunnel.reconnect_at().is_some());
    }

    #[test]
    fn test_heartbeat_while_ready() {
        let now = Instant::now();
        let mut tunnel = connected(now);
        let interval = TunnelConfig::default().stream_heartbeat_interval;
        assert_eq!(tunnel.poll_timeout(), Some(now + interval));

        tunnel.handle_timeout(now + interval);
        let outbound = tunnel.take_outbound().unwrap();
        assert_eq!(stream::decode(&outbound).unwrap().unwrap().0, TunnelMessage::heartbeat());
        assert_eq!(tunnel.poll_timeout(), Some(now + interval * 2));
    }

    #[test]
    fn test_heartbeat_after_stall() {
        let now = Instant::now();
        let mut tunnel = connected(now);
        let interval = TunnelConfig::default().stream_heartbeat_interval;

        let late = now + interval * 5 + Duration::from_millis(10);
        tunnel.handle_timeout(late);
        let mut outbound = BytesMut::from(&tunnel.take_outbound().unwrap()[..]);
        assert_eq!(stream::decode_from(&mut outbound).unwrap(), Some(TunnelMessage::heartbeat()));
        assert!(outbound.is_empty());

        assert_eq!(tunnel.poll_timeout(), Some(late + interval));
        tunnel.handle_timeout(late);
        assert_eq!(tunnel.take_outbound(), None);
    }

    #[test]
    fn test_no_target_stays_down() {
        let config = TunnelConfig::default();
        let policy = ReconnectPolicy::new(config.reconnect_min, config.reconnect_max);
        let mut tunnel = StreamTunnel::new(TransportKind::Direct, None, &identity(), policy, &config).unwrap();
        tunnel.start(Instant::now());
        assert_eq!(tunnel.poll_connect(), None);
        assert_eq!(tunnel.poll_timeout(), None);
    }
}

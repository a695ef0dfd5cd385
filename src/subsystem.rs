//! The multi-path tunnel subsystem: three tunnels, one path selector and the dispatch between them
//! and the proxy front-end.

use std::{net::SocketAddr, time::Instant};

use bytes::Bytes;
use pathlink_proto::{
    control::{self, PeerIdentity, StreamInit},
    MessageKind, TunnelMessage,
};
use tracing::{debug, trace, warn};

use crate::{
    config::TunnelConfig,
    error::TunnelError,
    path::PathSelector,
    reconnect::ReconnectPolicy,
    session_code::SessionParams,
    tunnel::{ConnectRequest, StreamState, StreamTunnel, Transmit, TransportKind, Tunnels, UdpTunnel},
    utils::earliest,
};

/// Where inbound session data goes.
pub trait ProxyFrontend {
    /// Hands bytes to the local connection of `session_id`. Fails with
    /// [`TunnelError::SessionNotFound`] if there is no such connection.
    fn deliver(&self, session_id: u32, data: Bytes) -> Result<(), TunnelError>;

    /// Closes the local connection of `session_id`, if it still exists.
    fn close(&self, session_id: u32);

    /// Whether the local connection of `session_id` is still open.
    fn is_live(&self, session_id: u32) -> bool;
}

pub struct TunnelSubsystem<F> {
    tunnels: Tunnels,
    selector: PathSelector,
    frontend: F,
    identity: PeerIdentity,
    public_addr: Option<SocketAddr>,
    probe_addr: Option<SocketAddr>,
    stream_init: Bytes,
}

impl<F: ProxyFrontend> TunnelSubsystem<F> {
    pub fn new(params: &SessionParams, config: &TunnelConfig, frontend: F, now: Instant) -> Result<Self, TunnelError> {
        let policy = || ReconnectPolicy::new(config.reconnect_min, config.reconnect_max);
        let direct = StreamTunnel::new(TransportKind::Direct, params.direct_addr, &params.identity, policy(), config)?;
        let relay = StreamTunnel::new(TransportKind::Relay, params.relay_addr, &params.identity, policy(), config)?;

        Ok(Self {
            tunnels: Tunnels {
                direct,
                relay,
                udp: UdpTunnel::new(config, now),
            },
            selector: PathSelector::new(),
            frontend,
            identity: params.identity.clone(),
            public_addr: params.public_addr,
            probe_addr: params.probe_addr,
            stream_init: control::to_payload(&StreamInit {
                port: params.target_port,
            })?,
        })
    }

    /// Opens the stream tunnels and starts probing and punching on the UDP one, for whichever
    /// addresses were given.
    pub fn start(&mut self, now: Instant) -> Result<(), TunnelError> {
        self.tunnels.direct.start(now);
        self.tunnels.relay.start(now);

        if let Some(probe_addr) = self.probe_addr {
            self.tunnels.udp.init(&self.identity, probe_addr, now)?;
        }

        if let Some(peer) = self.public_addr {
            self.tunnels.udp.start_p2p(&self.identity, peer, now)?;
        }

        Ok(())
    }

    pub fn tunnels(&self) -> &Tunnels {
        &self.tunnels
    }

    pub fn selector(&self) -> &PathSelector {
        &self.selector
    }

    pub fn frontend(&self) -> &F {
        &self.frontend
    }

    /// Sends bytes from a local proxy connection. The first bytes of a session pick its tunnel and
    /// are preceded by a `StreamInit`. Data still queued for a session that has already been
    /// closed fails with [`TunnelError::SessionNotFound`] and opens nothing.
    pub fn on_proxy_data(&mut self, session_id: u32, data: &[u8]) -> Result<(), TunnelError> {
        if data.is_empty() {
            return Err(TunnelError::InvalidInput("payload must not be empty"));
        }

        let tunnels = &self.tunnels;
        let (kind, is_new) = self.selector.resolve(session_id, |kind| tunnels.is_ready(kind))?;

        if is_new {
            if !self.frontend.is_live(session_id) {
                self.selector.release(session_id);
                return Err(TunnelError::SessionNotFound(session_id));
            }

            if let Err(error) = self.tunnels.send(kind, MessageKind::StreamInit, session_id, &self.stream_init) {
                self.selector.release(session_id);
                return Err(error);
            }
        }

        self.tunnels.send(kind, MessageKind::StreamData, session_id, data)
    }

    /// A local proxy connection went away.
    pub fn del_proxy(&mut self, session_id: u32) {
        let Some(kind) = self.selector.release(session_id) else {
            return;
        };

        debug!(session_id, %kind, "session released");
        if let Err(error) = self.tunnels.send_control(kind, MessageKind::StreamFini, session_id) {
            debug!(session_id, %kind, %error, "could not send fini");
        }
    }

    fn dispatch(&mut self, kind: TransportKind, messages: Vec<TunnelMessage>) {
        for message in messages {
            let session_id = message.session_id;
            match message.kind {
                MessageKind::StreamData => match self.frontend.deliver(session_id, message.payload) {
                    Ok(()) => {}
                    Err(TunnelError::SessionNotFound(_)) => {
                        warn!(session_id, %kind, "data for an unknown session dropped");
                        self.selector.release(session_id);
                        if let Err(error) = self.tunnels.send_control(kind, MessageKind::StreamFini, session_id) {
                            debug!(session_id, %kind, %error, "could not send fini");
                        }
                    }
                    Err(error) => warn!(session_id, %kind, %error, "could not deliver data"),
                },
                MessageKind::StreamFini => {
                    debug!(session_id, %kind, "session closed by the peer");
                    self.selector.release(session_id);
                    self.frontend.close(session_id);
                }
                MessageKind::StreamInit => warn!(session_id, %kind, "unexpected StreamInit dropped"),
                other => trace!(?other, %kind, "control message handled by the tunnel"),
            }
        }
    }

    pub fn on_stream_connected(&mut self, kind: TransportKind, generation: u64, now: Instant) {
        if let Some(tunnel) = self.tunnels.stream_mut(kind) {
            tunnel.on_writable(generation, now);
        }
    }

    pub fn on_stream_received(&mut self, kind: TransportKind, generation: u64, data: &[u8], now: Instant) {
        let messages = match self.tunnels.stream_mut(kind) {
            Some(tunnel) => tunnel.on_received(generation, data, now),
            None => return,
        };

        self.dispatch(kind, messages);
    }

    pub fn on_stream_closed(&mut self, kind: TransportKind, generation: u64, now: Instant) {
        if let Some(tunnel) = self.tunnels.stream_mut(kind) {
            tunnel.on_closed(generation, now);
        }
    }

    pub fn on_datagram(&mut self, from: SocketAddr, data: &[u8], now: Instant) {
        let messages = self.tunnels.udp.on_datagram(from, data, now);
        self.dispatch(TransportKind::Udp, messages);
    }

    pub fn start_p2p(&mut self, peer: SocketAddr, now: Instant) -> Result<(), TunnelError> {
        self.public_addr = Some(peer);
        self.tunnels.udp.start_p2p(&self.identity, peer, now)
    }

    pub fn stop_p2p(&mut self) {
        self.public_addr = None;
        self.tunnels.udp.stop_p2p();
    }

    pub fn poll_timeout(&self) -> Option<Instant> {
        earliest([
            self.tunnels.direct.poll_timeout(),
            self.tunnels.relay.poll_timeout(),
            self.tunnels.udp.poll_timeout(),
        ])
    }

    pub fn handle_timeout(&mut self, now: Instant) {
        self.tunnels.direct.handle_timeout(now);
        self.tunnels.relay.handle_timeout(now);
        self.tunnels.udp.handle_timeout(now);
    }

    pub fn poll_connect(&mut self) -> Option<ConnectRequest> {
        self.tunnels
            .direct
            .poll_connect()
            .or_else(|| self.tunnels.relay.poll_connect())
    }

    pub fn take_stream_outbound(&mut self, kind: TransportKind) -> Option<Bytes> {
        self.tunnels.stream_mut(kind)?.take_outbound()
    }

    pub fn stream_state(&self, kind: TransportKind) -> Option<(StreamState, u64)> {
        self.tunnels.stream(kind).map(|tunnel| (tunnel.state(), tunnel.generation()))
    }

    pub fn poll_transmit(&mut self) -> Option<Transmit> {
        self.tunnels.udp.poll_transmit()
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, collections::HashMap, time::Duration};

    use bytes::BytesMut;
    use pathlink_arq::{Arq, ArqConfig};
    use pathlink_proto::{datagram, stream};

    use super::*;

    #[derive(Default)]
    struct MockFrontend {
        open: RefCell<HashMap<u32, Vec<u8>>>,
        closed: RefCell<Vec<u32>>,
    }

    impl MockFrontend {
        fn with_sessions(ids: &[u32]) -> Self {
            let frontend = Self::default();
            for id in ids {
                frontend.open.borrow_mut().insert(*id, Vec::new());
            }
            frontend
        }

        fn received(&self, id: u32) -> Vec<u8> {
            self.open.borrow().get(&id).cloned().unwrap_or_default()
        }
    }

    impl ProxyFrontend for MockFrontend {
        fn deliver(&self, session_id: u32, data: Bytes) -> Result<(), TunnelError> {
            match self.open.borrow_mut().get_mut(&session_id) {
                Some(buf) => {
                    buf.extend_from_slice(&data);
                    Ok(())
                }
                None => Err(TunnelError::SessionNotFound(session_id)),
            }
        }

        fn close(&self, session_id: u32) {
            self.open.borrow_mut().remove(&session_id);
            self.closed.borrow_mut().push(session_id);
        }

        fn is_live(&self, session_id: u32) -> bool {
            self.open.borrow().contains_key(&session_id)
        }
    }

    fn params() -> SessionParams {
        let mut params = SessionParams::new(PeerIdentity {
            order_id: "order-1".to_string(),
            device_token: "device".to_string(),
            user_token: "user".to_string(),
        });
        params.direct_addr = Some("10.0.0.2:60006".parse().unwrap());
        params.relay_addr = Some("192.0.2.10:9000".parse().unwrap());
        params
    }

    fn subsystem(frontend: MockFrontend, now: Instant) -> TunnelSubsystem<MockFrontend> {
        let mut subsystem = TunnelSubsystem::new(&params(), &TunnelConfig::default(), frontend, now).unwrap();
        subsystem.start(now).unwrap();
        subsystem
    }

    /// Brings the stream tunnel of `kind` to ready and discards its handshake.
    fn connect(subsystem: &mut TunnelSubsystem<MockFrontend>, kind: TransportKind, now: Instant) -> u64 {
        let (_, generation) = subsystem.stream_state(kind).unwrap();
        subsystem.on_stream_connected(kind, generation, now);
        subsystem.take_stream_outbound(kind);
        generation
    }

    fn outbound_frames(subsystem: &mut TunnelSubsystem<MockFrontend>, kind: TransportKind) -> Vec<TunnelMessage> {
        let mut buf = BytesMut::new();
        if let Some(bytes) = subsystem.take_stream_outbound(kind) {
            buf.extend_from_slice(&bytes);
        }
        std::iter::from_fn(|| stream::decode_from(&mut buf).unwrap()).collect()
    }

    fn framed(messages: &[TunnelMessage]) -> BytesMut {
        let mut buf = BytesMut::new();
        for message in messages {
            stream::encode(message, &mut buf).unwrap();
        }
        buf
    }

    #[test]
    fn test_nothing_ready() {
        let now = Instant::now();
        let mut subsystem = subsystem(MockFrontend::default(), now);

        assert_eq!(subsystem.poll_connect().map(|r| r.kind), Some(TransportKind::Direct));
        assert_eq!(subsystem.poll_connect().map(|r| r.kind), Some(TransportKind::Relay));
        assert_eq!(subsystem.poll_connect(), None);

        assert!(matches!(subsystem.on_proxy_data(1, b"x"), Err(TunnelError::PathUnavailable)));
        assert!(subsystem.selector().is_empty());
        assert!(matches!(subsystem.on_proxy_data(0, b"x"), Err(TunnelError::InvalidInput(_))));
        assert!(matches!(subsystem.on_proxy_data(1, b""), Err(TunnelError::InvalidInput(_))));
    }

    #[test]
    fn test_stream_init_precedes_first_data() {
        let now = Instant::now();
        let mut subsystem = subsystem(MockFrontend::with_sessions(&[7]), now);
        connect(&mut subsystem, TransportKind::Relay, now);

        subsystem.on_proxy_data(7, b"GET /").unwrap();
        subsystem.on_proxy_data(7, b" HTTP/1.1").unwrap();

        let frames = outbound_frames(&mut subsystem, TransportKind::Relay);
        assert_eq!(
            frames,
            vec![
                TunnelMessage::new(MessageKind::StreamInit, 7, &br#"{"port":8080}"#[..]),
                TunnelMessage::stream_data(7, &b"GET /"[..]),
                TunnelMessage::stream_data(7, &b" HTTP/1.1"[..]),
            ]
        );
        assert_eq!(subsystem.selector().get(7), Some(TransportKind::Relay));
    }

    #[test]
    fn test_sessions_stay_on_their_tunnel() {
        let now = Instant::now();
        let mut subsystem = subsystem(MockFrontend::with_sessions(&[1, 2]), now);
        let relay_generation = connect(&mut subsystem, TransportKind::Relay, now);
        subsystem.on_proxy_data(1, b"a").unwrap();

        connect(&mut subsystem, TransportKind::Direct, now);
        subsystem.on_proxy_data(2, b"b").unwrap();
        subsystem.on_proxy_data(1, b"c").unwrap();
        assert_eq!(subsystem.selector().get(1), Some(TransportKind::Relay));
        assert_eq!(subsystem.selector().get(2), Some(TransportKind::Direct));

        // The relay dropping doesn't move session 1 to the ready direct tunnel.
        subsystem.on_stream_closed(TransportKind::Relay, relay_generation, now);
        assert!(matches!(
            subsystem.on_proxy_data(1, b"d"),
            Err(TunnelError::TransportFailure(TransportKind::Relay))
        ));
        assert_eq!(subsystem.selector().get(1), Some(TransportKind::Relay));
    }

    #[test]
    fn test_relay_close_schedules_reconnect() {
        let now = Instant::now();
        let mut subsystem = subsystem(MockFrontend::default(), now);
        subsystem.poll_connect();
        subsystem.poll_connect();
        let generation = connect(&mut subsystem, TransportKind::Relay, now);

        subsystem.on_stream_closed(TransportKind::Relay, generation, now);
        assert!(!subsystem.tunnels().is_ready(TransportKind::Relay));

        let config = TunnelConfig::default();
        let at = subsystem.tunnels().relay.reconnect_at().unwrap();
        assert!(at >= now + config.reconnect_min && at <= now + config.reconnect_max);

        subsystem.handle_timeout(at);
        let request = subsystem.poll_connect().unwrap();
        assert_eq!(request.kind, TransportKind::Relay);
        assert_eq!(request.generation, generation + 1);
    }

    #[test]
    fn test_inbound_dispatch() {
        let now = Instant::now();
        let mut subsystem = subsystem(MockFrontend::with_sessions(&[3, 4]), now);
        let generation = connect(&mut subsystem, TransportKind::Direct, now);
        subsystem.on_proxy_data(3, b"req").unwrap();
        subsystem.on_proxy_data(4, b"req").unwrap();
        subsystem.take_stream_outbound(TransportKind::Direct);

        let inbound = framed(&[
            TunnelMessage::heartbeat(),
            TunnelMessage::stream_data(3, &b"hello "[..]),
            TunnelMessage::stream_data(3, &b"world"[..]),
            TunnelMessage::stream_fini(4),
            TunnelMessage::stream_data(99, &b"lost"[..]),
        ]);
        subsystem.on_stream_received(TransportKind::Direct, generation, &inbound, now);

        assert_eq!(subsystem.frontend().received(3), b"hello world");
        assert_eq!(*subsystem.frontend().closed.borrow(), vec![4]);
        assert_eq!(subsystem.selector().get(4), None);
        assert_eq!(subsystem.selector().get(3), Some(TransportKind::Direct));

        // The unknown session is told to stop; the fini from the peer isn't echoed.
        let frames = outbound_frames(&mut subsystem, TransportKind::Direct);
        assert_eq!(frames, vec![TunnelMessage::stream_fini(99)]);
    }

    #[test]
    fn test_del_proxy_sends_fini() {
        let now = Instant::now();
        let mut subsystem = subsystem(MockFrontend::with_sessions(&[5]), now);
        connect(&mut subsystem, TransportKind::Direct, now);
        subsystem.on_proxy_data(5, b"x").unwrap();
        subsystem.take_stream_outbound(TransportKind::Direct);

        subsystem.del_proxy(5);
        subsystem.del_proxy(5);
        assert_eq!(
            outbound_frames(&mut subsystem, TransportKind::Direct),
            vec![TunnelMessage::stream_fini(5)]
        );
        assert!(subsystem.selector().is_empty());
    }

    #[test]
    fn test_data_after_peer_fini_dropped() {
        let now = Instant::now();
        let mut subsystem = subsystem(MockFrontend::with_sessions(&[6]), now);
        let generation = connect(&mut subsystem, TransportKind::Direct, now);
        subsystem.on_proxy_data(6, b"first").unwrap();
        subsystem.take_stream_outbound(TransportKind::Direct);

        let inbound = framed(&[TunnelMessage::stream_fini(6)]);
        subsystem.on_stream_received(TransportKind::Direct, generation, &inbound, now);
        assert_eq!(*subsystem.frontend().closed.borrow(), vec![6]);

        // Read from the local connection before it saw the close.
        assert!(matches!(
            subsystem.on_proxy_data(6, b"late"),
            Err(TunnelError::SessionNotFound(6))
        ));
        subsystem.del_proxy(6);

        assert_eq!(subsystem.selector().get(6), None);
        assert!(outbound_frames(&mut subsystem, TransportKind::Direct).is_empty());
    }

    #[test]
    fn test_session_over_udp() {
        let now = Instant::now();
        let peer: SocketAddr = "198.51.100.7:40000".parse().unwrap();
        let mut subsystem = subsystem(MockFrontend::with_sessions(&[7]), now);
        subsystem.start_p2p(peer, now).unwrap();

        let punch = subsystem.poll_transmit().unwrap();
        assert_eq!(punch.to, peer);
        assert_eq!(datagram::parse_raw(&punch.payload).unwrap().kind, MessageKind::TunnelInit);

        let response = datagram::encode_raw(&TunnelMessage::tunnel_init(&br#"{"tunnel_id":1234}"#[..])).unwrap();
        subsystem.on_datagram(peer, &response, now);
        assert!(subsystem.tunnels().is_ready(TransportKind::Udp));

        subsystem.on_proxy_data(7, b"ping").unwrap();
        assert_eq!(subsystem.selector().get(7), Some(TransportKind::Udp));

        let mut device = Arq::new(1234, &ArqConfig::default()).unwrap();
        device.update(0);
        while let Some(transmit) = subsystem.poll_transmit() {
            device.input(&transmit.payload).unwrap();
        }

        let mut received = BytesMut::new();
        while device.recv(&mut received).is_some() {}
        let frames: Vec<_> = std::iter::from_fn(|| datagram::decode_from(&mut received).unwrap()).collect();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].message.kind, MessageKind::StreamInit);
        assert_eq!(frames[1].message, TunnelMessage::stream_data(7, &b"ping"[..]));

        let mut reply = BytesMut::new();
        datagram::encode(1234, &TunnelMessage::stream_data(7, &b"pong"[..]), &mut reply).unwrap();
        device.send(&reply).unwrap();
        device.flush();
        while let Some(packet) = device.poll_transmit() {
            subsystem.on_datagram(peer, &packet, now + Duration::from_millis(5));
        }

        assert_eq!(subsystem.frontend().received(7), b"pong");
    }
}

use std::{
    collections::VecDeque,
    net::SocketAddr,
    num::NonZeroU32,
    time::{Duration, Instant},
};

use bytes::{Buf, Bytes, BytesMut};
use pathlink_arq::{Arq, ArqConfig};
use pathlink_proto::{
    control::{self, AddrProbeRequest, AddrProbeResponse, PeerIdentity, PunchResponse},
    datagram::{self, TUNNEL_ID_RAW},
    MessageKind, TunnelMessage,
};
use pathlink_puncher_sm::{InitOutcome, Puncher, PuncherState};
use tracing::{debug, info, trace, warn};

use crate::{
    config::TunnelConfig,
    error::TunnelError,
    tunnel::{check_outbound, TransportKind, Tunnel},
    utils::earliest,
};

/// A datagram the runtime should send from the tunnel's socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transmit {
    pub to: SocketAddr,
    pub payload: Bytes,
}

/// The hole-punched UDP path. Raw control datagrams (punches, heartbeats, address probes) travel
/// next to the packets of a reliable stream, which carries the session messages once the peer
/// assigned a stream id.
pub struct UdpTunnel {
    puncher: Puncher,
    arq: Option<Arq>,
    arq_config: ArqConfig,
    epoch: Instant,
    heartbeat_interval: Duration,
    arq_tick_interval: Duration,

    probe_addr: Option<SocketAddr>,
    probe_payload: Bytes,
    next_probe: Option<Instant>,
    public_addr: Option<SocketAddr>,

    identity_payload: Bytes,
    next_heartbeat: Option<Instant>,
    next_arq_tick: Option<Instant>,
    last_peer_activity: Option<Instant>,

    reassembly: BytesMut,
    frame_buf: BytesMut,
    transmits: VecDeque<Transmit>,
}

impl UdpTunnel {
    pub fn new(config: &TunnelConfig, now: Instant) -> Self {
        Self {
            puncher: Puncher::new(config.max_punch_attempts, config.punch_interval),
            arq: None,
            arq_config: config.arq.clone(),
            epoch: now,
            heartbeat_interval: config.heartbeat_interval,
            arq_tick_interval: config.arq_tick_interval,
            probe_addr: None,
            probe_payload: Bytes::new(),
            next_probe: None,
            public_addr: None,
            identity_payload: Bytes::new(),
            next_heartbeat: None,
            next_arq_tick: None,
            last_peer_activity: None,
            reassembly: BytesMut::new(),
            frame_buf: BytesMut::new(),
            transmits: VecDeque::new(),
        }
    }

    /// Starts asking the probe server for our public address: once right away, then every
    /// heartbeat interval.
    pub fn init(&mut self, identity: &PeerIdentity, probe_addr: SocketAddr, now: Instant) -> Result<(), TunnelError> {
        let request = AddrProbeRequest {
            user_token: identity.user_token.clone(),
        };

        self.probe_payload = control::to_payload(&request)?;
        self.probe_addr = Some(probe_addr);
        self.next_probe = Some(now);
        self.identity_payload = control::to_payload(identity)?;
        debug!(%probe_addr, "address probing started");
        Ok(())
    }

    /// Starts punching towards the peer's public address, forgetting any previous peer.
    pub fn start_p2p(&mut self, identity: &PeerIdentity, peer: SocketAddr, now: Instant) -> Result<(), TunnelError> {
        self.stop_p2p();
        self.identity_payload = control::to_payload(identity)?;
        self.puncher.start(peer, now);
        info!(%peer, "punching started");
        self.queue_punches();
        Ok(())
    }

    /// Drops the reliable stream and everything known about the peer. Probing continues.
    pub fn stop_p2p(&mut self) {
        if let Some(peer) = self.puncher.remote_address() {
            self.transmits.retain(|transmit| transmit.to != peer);
            debug!(%peer, "p2p stopped");
        }

        self.puncher.reset();
        self.arq = None;
        self.next_heartbeat = None;
        self.next_arq_tick = None;
        self.last_peer_activity = None;
        self.reassembly.clear();
        self.frame_buf.clear();
    }

    pub fn state(&self) -> PuncherState {
        self.puncher.state()
    }

    pub fn stream_id(&self) -> Option<NonZeroU32> {
        self.puncher.state().stream_id()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.puncher.remote_address()
    }

    /// Our address as last seen by the probe server.
    pub fn public_addr(&self) -> Option<SocketAddr> {
        self.public_addr
    }

    /// When the peer last proved it is alive.
    pub fn last_peer_activity(&self) -> Option<Instant> {
        self.last_peer_activity
    }

    fn clock(&self, now: Instant) -> u32 {
        now.saturating_duration_since(self.epoch).as_millis() as u32
    }

    fn queue_raw(&mut self, to: SocketAddr, message: &TunnelMessage) {
        match datagram::encode_raw(message) {
            Ok(payload) => self.transmits.push_back(Transmit { to, payload }),
            Err(error) => warn!(%to, %error, "could not frame datagram"),
        }
    }

    fn queue_punches(&mut self) {
        while let Some(info) = self.puncher.poll_send() {
            trace!(to = %info.to, attempt = info.attempt, "punch");
            let message = TunnelMessage::tunnel_init(self.identity_payload.clone());
            self.queue_raw(info.to, &message);
        }
    }

    pub fn poll_timeout(&self) -> Option<Instant> {
        earliest([
            self.puncher.next_tick_instant(),
            self.next_probe,
            self.next_heartbeat,
            self.next_arq_tick,
        ])
    }

    pub fn handle_timeout(&mut self, now: Instant) {
        if self.puncher.next_tick_instant().is_some_and(|at| at <= now) {
            self.puncher.tick(now);
            if self.puncher.state() == PuncherState::Exhausted {
                warn!(attempts = self.puncher.attempts(), "punching gave up, no answer from the peer");
            }
            self.queue_punches();
        }

        if let (Some(at), Some(probe_addr)) = (self.next_probe, self.probe_addr) {
            if at <= now {
                let message = TunnelMessage::new(MessageKind::AddrProbe, 0, self.probe_payload.clone());
                self.queue_raw(probe_addr, &message);
                self.next_probe = Some(now + self.heartbeat_interval);
            }
        }

        if let (Some(at), Some(stream_id), Some(peer)) = (self.next_heartbeat, self.stream_id(), self.peer_addr()) {
            if at <= now {
                let message = TunnelMessage::new(MessageKind::Heartbeat, stream_id.get(), Bytes::new());
                self.queue_raw(peer, &message);
                self.next_heartbeat = Some(now + self.heartbeat_interval);
            }
        }

        if self.next_arq_tick.is_some_and(|at| at <= now) {
            let current = self.clock(now);
            let dead = match self.arq.as_mut() {
                Some(arq) => {
                    arq.update(current);
                    arq.is_dead()
                }
                None => false,
            };

            if dead {
                warn!("reliable stream link is dead, resetting");
                self.stop_p2p();
            } else {
                self.next_arq_tick = Some(now + self.arq_tick_interval);
            }
        }
    }

    /// Processes a datagram received on the tunnel's socket, returning the session messages it
    /// completed. Bad datagrams are logged and dropped.
    pub fn on_datagram(&mut self, from: SocketAddr, data: &[u8], now: Instant) -> Vec<TunnelMessage> {
        match datagram::peek_tunnel_id(data) {
            None => {
                debug!(%from, len = data.len(), "runt datagram dropped");
                Vec::new()
            }
            Some(TUNNEL_ID_RAW) => {
                self.on_raw(from, data, now);
                Vec::new()
            }
            Some(conv) => self.on_stream_packet(from, conv, data, now),
        }
    }

    fn on_raw(&mut self, from: SocketAddr, data: &[u8], now: Instant) {
        let message = match datagram::parse_raw(data) {
            Ok(message) => message,
            Err(error) => {
                debug!(%from, %error, "malformed raw datagram dropped");
                return;
            }
        };

        match message.kind {
            MessageKind::Heartbeat => {
                if Some(from) == self.peer_addr() {
                    self.last_peer_activity = Some(now);
                }
                trace!(%from, marker = message.session_id, "heartbeat");
            }
            MessageKind::AddrProbe => self.on_probe_response(from, &message.payload),
            MessageKind::TunnelInit => self.on_punch_response(from, &message.payload, now),
            kind => debug!(%from, ?kind, "unexpected raw datagram dropped"),
        }
    }

    fn on_probe_response(&mut self, from: SocketAddr, payload: &[u8]) {
        if Some(from) != self.probe_addr {
            debug!(%from, "address probe from unknown source dropped");
            return;
        }

        let response = control::from_payload::<AddrProbeResponse>(payload).and_then(|r| r.socket_addr());
        match response {
            Ok(addr) => {
                if self.public_addr != Some(addr) {
                    info!(public_addr = %addr, "public address updated");
                }
                self.public_addr = Some(addr);
            }
            Err(error) => debug!(%from, %error, "bad address probe response"),
        }
    }

    fn on_punch_response(&mut self, from: SocketAddr, payload: &[u8], now: Instant) {
        let stream_id = match control::from_payload::<PunchResponse>(payload).and_then(|r| r.stream_id()) {
            Ok(stream_id) => stream_id,
            Err(error) => {
                debug!(%from, %error, "bad punch response");
                return;
            }
        };

        match self.puncher.received_init(stream_id) {
            InitOutcome::Accepted(stream_id) => {
                let mut arq = match Arq::new(stream_id.get(), &self.arq_config) {
                    Ok(arq) => arq,
                    Err(error) => {
                        warn!(%error, "could not create the reliable stream");
                        self.stop_p2p();
                        return;
                    }
                };

                arq.update(self.clock(now));
                self.arq = Some(arq);
                self.last_peer_activity = Some(now);
                self.next_heartbeat = Some(now + self.heartbeat_interval);
                self.next_arq_tick = Some(now + self.arq_tick_interval);
                info!(%from, stream_id = stream_id.get(), "udp tunnel ready");
            }
            InitOutcome::Duplicate => trace!(%from, %stream_id, "duplicate punch response"),
            InitOutcome::Foreign { accepted, received } => {
                warn!(%from, %accepted, %received, "punch response with a different stream id dropped");
            }
            InitOutcome::Unsolicited => debug!(%from, %stream_id, "unsolicited punch response dropped"),
        }
    }

    fn on_stream_packet(&mut self, from: SocketAddr, conv: u32, data: &[u8], now: Instant) -> Vec<TunnelMessage> {
        let mut messages = Vec::new();
        let current = self.clock(now);

        let Some(arq) = self.arq.as_mut() else {
            debug!(%from, conv, "stream packet before the tunnel is ready dropped");
            return messages;
        };

        if arq.conv() != conv {
            debug!(%from, conv, expected = arq.conv(), "stream packet for a foreign stream id dropped");
            return messages;
        }

        arq.update(current);
        if let Err(error) = arq.input(data) {
            debug!(%from, %error, "bad stream packet dropped");
            return messages;
        }
        arq.flush();

        while arq.recv(&mut self.reassembly).is_some() {}
        self.last_peer_activity = Some(now);

        loop {
            match datagram::decode_from(&mut self.reassembly) {
                Ok(Some(frame)) if frame.tunnel_id != conv => {
                    warn!(tunnel_id = frame.tunnel_id, conv, "frame for another stream dropped");
                }
                Ok(Some(frame)) => match frame.message.kind {
                    MessageKind::TunnelInit => trace!("tunnel init inside the stream ignored"),
                    _ => messages.push(frame.message),
                },
                Ok(None) => break,
                Err(error) => match datagram::announced_frame_size(&self.reassembly) {
                    Some(size) if self.reassembly.len() >= size => {
                        warn!(%error, size, "bad frame in the reliable stream skipped");
                        self.reassembly.advance(size);
                    }
                    // Skipped once the rest of it arrives.
                    Some(_) => break,
                    None => {
                        warn!(%error, buffered = self.reassembly.len(), "unreadable reliable stream, dropping buffered bytes");
                        self.reassembly.clear();
                        break;
                    }
                },
            }
        }

        messages
    }

    /// Takes the next datagram to send: queued raw datagrams first, then the reliable stream's
    /// output to the peer.
    pub fn poll_transmit(&mut self) -> Option<Transmit> {
        if let Some(transmit) = self.transmits.pop_front() {
            return Some(transmit);
        }

        let to = self.puncher.remote_address()?;
        let payload = self.arq.as_mut()?.poll_transmit()?;
        Some(Transmit { to, payload })
    }
}

impl Tunnel for UdpTunnel {
    fn kind(&self) -> TransportKind {
        TransportKind::Udp
    }

    fn is_ready(&self) -> bool {
        self.arq.is_some()
    }

    fn send(&mut self, kind: MessageKind, session_id: u32, payload: &[u8]) -> Result<(), TunnelError> {
        check_outbound(kind, session_id, payload)?;

        let Some(arq) = self.arq.as_mut() else {
            return Err(TunnelError::TransportFailure(TransportKind::Udp));
        };

        self.frame_buf.clear();
        datagram::encode_parts(arq.conv(), kind, session_id, payload, &mut self.frame_buf)?;
        arq.send(&self.frame_buf)?;
        arq.flush();
        Ok(())
    }

    fn close(&mut self, _now: Instant) {
        self.stop_p2p();
    }
}

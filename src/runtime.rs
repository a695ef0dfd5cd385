//! The I/O side: owns the sockets and feeds the sans-IO subsystem with events from them.

use std::{collections::HashMap, io, time::Instant};

use bytes::Bytes;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream, UdpSocket},
    select,
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
};
use tracing::{debug, trace, warn};

use crate::{
    config::TunnelConfig,
    error::TunnelError,
    proxy::{handle_proxy_listening, SessionRegistry},
    session_code::SessionParams,
    subsystem::{ProxyFrontend, TunnelSubsystem},
    tunnel::{ConnectRequest, StreamState, TransportKind},
    utils::sleep_until_if_some,
};

const READ_BUFFER_SIZE: usize = 0x4000;
const DATAGRAM_BUFFER_SIZE: usize = 0x10000;

/// Everything that happens on a socket the driver doesn't own directly.
#[derive(Debug)]
pub enum DriverEvent {
    ProxyData { session_id: u32, data: Bytes },
    ProxyClosed { session_id: u32 },
    StreamConnected { kind: TransportKind, generation: u64 },
    StreamReceived { kind: TransportKind, generation: u64, data: Bytes },
    StreamClosed { kind: TransportKind, generation: u64 },
}

/// The task running one stream tunnel connection.
struct StreamIo {
    generation: u64,
    outbound: UnboundedSender<Bytes>,
    handle: JoinHandle<()>,
}

impl Drop for StreamIo {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Runs a whole tunnel session: the proxy listener plus the driver. Must be called from within a
/// `LocalSet`. Only returns on error.
pub async fn run_session(
    params: &SessionParams,
    config: &TunnelConfig,
    listener: TcpListener,
    socket: UdpSocket,
) -> io::Result<()> {
    let registry = SessionRegistry::new();
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    let now = Instant::now();
    let mut subsystem = TunnelSubsystem::new(params, config, registry.clone(), now).map_err(io::Error::other)?;
    subsystem.start(now).map_err(io::Error::other)?;

    let listener_events = events_tx.clone();
    let listener_handle = tokio::task::spawn_local(handle_proxy_listening(listener, registry, listener_events));

    let result = run_driver(subsystem, socket, events_tx, events_rx).await;
    listener_handle.abort();
    result
}

pub async fn run_driver<F: ProxyFrontend>(
    mut subsystem: TunnelSubsystem<F>,
    socket: UdpSocket,
    events_tx: UnboundedSender<DriverEvent>,
    mut events_rx: UnboundedReceiver<DriverEvent>,
) -> io::Result<()> {
    let mut streams: HashMap<TransportKind, StreamIo> = HashMap::new();
    let mut recv_buf = vec![0u8; DATAGRAM_BUFFER_SIZE];

    loop {
        flush(&mut subsystem, &socket, &mut streams, &events_tx);

        let timeout = subsystem.poll_timeout();
        select! {
            biased;
            event = events_rx.recv() => {
                let Some(event) = event else {
                    return Ok(());
                };

                handle_event(&mut subsystem, event);
            }
            result = socket.recv_from(&mut recv_buf) => {
                match result {
                    Ok((len, from)) => subsystem.on_datagram(from, &recv_buf[..len], Instant::now()),
                    // Some platforms report ICMP errors of earlier sends here.
                    Err(error) => debug!(%error, "udp receive failed"),
                }
            }
            _ = sleep_until_if_some(timeout) => subsystem.handle_timeout(Instant::now()),
        }
    }
}

fn handle_event<F: ProxyFrontend>(subsystem: &mut TunnelSubsystem<F>, event: DriverEvent) {
    let now = Instant::now();
    match event {
        DriverEvent::ProxyData { session_id, data } => match subsystem.on_proxy_data(session_id, &data) {
            Ok(()) => {}
            Err(TunnelError::SessionNotFound(_)) => trace!(session_id, "data for a closed session dropped"),
            Err(error) => {
                warn!(session_id, %error, "could not send proxy data, closing the session");
                subsystem.frontend().close(session_id);
                subsystem.del_proxy(session_id);
            }
        },
        DriverEvent::ProxyClosed { session_id } => subsystem.del_proxy(session_id),
        DriverEvent::StreamConnected { kind, generation } => subsystem.on_stream_connected(kind, generation, now),
        DriverEvent::StreamReceived { kind, generation, data } => {
            subsystem.on_stream_received(kind, generation, &data, now)
        }
        DriverEvent::StreamClosed { kind, generation } => subsystem.on_stream_closed(kind, generation, now),
    }
}

/// Carries out everything the subsystem has queued: new connections, stream bytes and datagrams.
fn flush<F: ProxyFrontend>(
    subsystem: &mut TunnelSubsystem<F>,
    socket: &UdpSocket,
    streams: &mut HashMap<TransportKind, StreamIo>,
    events: &UnboundedSender<DriverEvent>,
) {
    while let Some(request) = subsystem.poll_connect() {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let handle = tokio::task::spawn_local(run_stream_connection(request, outbound_rx, events.clone()));
        let io = StreamIo {
            generation: request.generation,
            outbound,
            handle,
        };

        // Replacing the entry drops (and aborts) the previous connection's task.
        streams.insert(request.kind, io);
    }

    for kind in TransportKind::STREAMS {
        let Some((state, generation)) = subsystem.stream_state(kind) else {
            continue;
        };

        let stale = streams
            .get(&kind)
            .is_some_and(|io| state == StreamState::Disconnected || io.generation != generation);
        if stale {
            streams.remove(&kind);
        }

        let Some(io) = streams.get(&kind) else {
            continue;
        };

        if let Some(bytes) = subsystem.take_stream_outbound(kind) {
            if io.outbound.send(bytes).is_err() {
                trace!(%kind, "stream connection task already finished");
            }
        }
    }

    while let Some(transmit) = subsystem.poll_transmit() {
        if let Err(error) = socket.try_send_to(&transmit.payload, transmit.to) {
            debug!(to = %transmit.to, %error, "udp send failed");
        }
    }
}

async fn run_stream_connection(request: ConnectRequest, mut outbound: UnboundedReceiver<Bytes>, events: UnboundedSender<DriverEvent>) {
    let ConnectRequest { kind, generation, address } = request;

    if let Err(error) = stream_connection(request, &mut outbound, &events).await {
        debug!(%kind, %address, generation, %error, "stream connection ended with error");
    }

    let _ = events.send(DriverEvent::StreamClosed { kind, generation });
}

async fn stream_connection(
    request: ConnectRequest,
    outbound: &mut UnboundedReceiver<Bytes>,
    events: &UnboundedSender<DriverEvent>,
) -> io::Result<()> {
    let ConnectRequest { kind, generation, address } = request;

    let mut tcp_stream = TcpStream::connect(address).await?;
    tcp_stream.set_nodelay(true)?;
    tcp_stream.writable().await?;

    if events.send(DriverEvent::StreamConnected { kind, generation }).is_err() {
        return Ok(());
    }

    let (mut read_half, mut write_half) = tcp_stream.split();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        select! {
            biased;
            data = outbound.recv() => {
                match data {
                    Some(data) => write_half.write_all(&data).await?,
                    None => return Ok(()),
                }
            }
            read_result = read_half.read(&mut buf) => {
                let bytes_read = read_result?;
                if bytes_read == 0 {
                    return Ok(());
                }

                let data = Bytes::copy_from_slice(&buf[..bytes_read]);
                if events.send(DriverEvent::StreamReceived { kind, generation, data }).is_err() {
                    return Ok(());
                }
            }
        }
    }
}

//! The local front-end: every TCP connection accepted on the proxy listener becomes one proxy
//! session carried over the tunnels.

use std::{collections::HashMap, sync::Arc};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    select,
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
};
use tracing::{debug, info, warn};

use crate::{error::TunnelError, runtime::DriverEvent, subsystem::ProxyFrontend};

const READ_BUFFER_SIZE: usize = 0x4000;

/// What the driver asks a proxy connection task to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyWrite {
    Data(Bytes),
    Close,
}

struct Inner {
    next_id: u32,
    sessions: HashMap<u32, UnboundedSender<ProxyWrite>>,
}

/// The live proxy sessions, shared by the connection tasks and the driver.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<Mutex<Inner>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                next_id: 1,
                sessions: HashMap::new(),
            })),
        }
    }

    /// Registers a connection and returns its session id. Ids are never 0 and never collide with
    /// a live session.
    pub fn register(&self, writer: UnboundedSender<ProxyWrite>) -> u32 {
        let mut inner = self.inner.lock();

        let mut id = inner.next_id;
        while id == 0 || inner.sessions.contains_key(&id) {
            id = id.wrapping_add(1);
        }

        inner.next_id = id.wrapping_add(1);
        inner.sessions.insert(id, writer);
        id
    }

    pub fn unregister(&self, session_id: u32) -> bool {
        self.inner.lock().sessions.remove(&session_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxyFrontend for SessionRegistry {
    fn deliver(&self, session_id: u32, data: Bytes) -> Result<(), TunnelError> {
        let mut inner = self.inner.lock();
        let Some(writer) = inner.sessions.get(&session_id) else {
            return Err(TunnelError::SessionNotFound(session_id));
        };

        if writer.send(ProxyWrite::Data(data)).is_err() {
            inner.sessions.remove(&session_id);
            return Err(TunnelError::SessionNotFound(session_id));
        }

        Ok(())
    }

    fn close(&self, session_id: u32) {
        if let Some(writer) = self.inner.lock().sessions.remove(&session_id) {
            let _ = writer.send(ProxyWrite::Close);
        }
    }

    fn is_live(&self, session_id: u32) -> bool {
        self.inner.lock().sessions.contains_key(&session_id)
    }
}

pub async fn handle_proxy_listening(listener: TcpListener, registry: SessionRegistry, events: UnboundedSender<DriverEvent>) {
    loop {
        let (tcp_stream, from) = match listener.accept().await {
            Ok(t) => t,
            Err(error) => {
                warn!(%error, "error accepting new proxy connection");
                continue;
            }
        };

        let (writer, writes) = mpsc::unbounded_channel();
        let session_id = registry.register(writer);
        info!(session_id, %from, "proxy connection accepted");

        let registry = registry.clone();
        let events = events.clone();
        tokio::task::spawn_local(async move {
            handle_proxy_connection(session_id, tcp_stream, writes, &events).await;
            registry.unregister(session_id);
            let _ = events.send(DriverEvent::ProxyClosed { session_id });
        });
    }
}

async fn handle_proxy_connection(
    session_id: u32,
    mut tcp_stream: TcpStream,
    mut writes: UnboundedReceiver<ProxyWrite>,
    events: &UnboundedSender<DriverEvent>,
) {
    let (mut read_half, mut write_half) = tcp_stream.split();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let mut sent = 0usize;
    let mut received = 0usize;

    loop {
        select! {
            biased;
            write = writes.recv() => {
                let data = match write {
                    Some(ProxyWrite::Data(data)) => data,
                    Some(ProxyWrite::Close) | None => break,
                };

                if let Err(error) = write_half.write_all(&data).await {
                    debug!(session_id, %error, "write to proxy connection failed");
                    break;
                }
                received += data.len();
            }
            read_result = read_half.read(&mut buf) => {
                let bytes_read = match read_result {
                    Ok(0) => break,
                    Ok(v) => v,
                    Err(error) => {
                        debug!(session_id, %error, "read from proxy connection failed");
                        break;
                    }
                };

                sent += bytes_read;
                let data = Bytes::copy_from_slice(&buf[..bytes_read]);
                if events.send(DriverEvent::ProxyData { session_id, data }).is_err() {
                    break;
                }
            }
        }
    }

    let _ = write_half.shutdown().await;
    info!(session_id, sent, received, "proxy connection ended");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_skip_zero_and_live_sessions() {
        let registry = SessionRegistry::new();
        let (writer, _writes) = mpsc::unbounded_channel();

        assert_eq!(registry.register(writer.clone()), 1);
        assert_eq!(registry.register(writer.clone()), 2);

        registry.inner.lock().next_id = u32::MAX;
        assert_eq!(registry.register(writer.clone()), u32::MAX);
        assert_eq!(registry.register(writer.clone()), 3);
        assert_eq!(registry.len(), 4);

        assert!(registry.unregister(2));
        assert!(!registry.unregister(2));
    }

    #[test]
    fn test_deliver_and_close() {
        let registry = SessionRegistry::new();
        let (writer, mut writes) = mpsc::unbounded_channel();
        let id = registry.register(writer);

        registry.deliver(id, Bytes::from_static(b"hello")).unwrap();
        assert_eq!(writes.try_recv().unwrap(), ProxyWrite::Data(Bytes::from_static(b"hello")));

        assert!(matches!(
            registry.deliver(id + 1, Bytes::from_static(b"x")),
            Err(TunnelError::SessionNotFound(_))
        ));

        assert!(registry.is_live(id));
        registry.close(id);
        assert_eq!(writes.try_recv().unwrap(), ProxyWrite::Close);
        assert!(registry.is_empty());
        assert!(!registry.is_live(id));
        assert!(matches!(
            registry.deliver(id, Bytes::from_static(b"x")),
            Err(TunnelError::SessionNotFound(_))
        ));
    }

    #[test]
    fn test_deliver_to_finished_connection() {
        let registry = SessionRegistry::new();
        let (writer, writes) = mpsc::unbounded_channel();
        let id = registry.register(writer);
        drop(writes);

        assert!(matches!(
            registry.deliver(id, Bytes::from_static(b"x")),
            Err(TunnelError::SessionNotFound(_))
        ));
        assert!(registry.is_empty());
    }
}

//! Local clients: connection records, the service registry, and the
//! per-client I/O tasks.
//!
//! Each accepted socket (or on-demand socketpair end) gets one task that
//! owns the stream. Inbound frames and connection lifecycle flow to the
//! core over a shared event channel; outbound messages flow back through a
//! per-client queue. The core never touches a socket directly.

use std::collections::HashMap;
use std::fmt;
use std::io;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use a314_wire::framing::{Frame, MessageFramed};
use a314_wire::message::Message;

/// Identifier the daemon assigns to a client connection. Stable for the
/// connection's lifetime and never reused within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(u32);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client:{}", self.0)
    }
}

impl ClientId {
    #[cfg(test)]
    pub(crate) fn test(id: u32) -> Self {
        ClientId(id)
    }
}

/// What a client's I/O task reports to the core.
#[derive(Debug)]
pub enum ClientEvent {
    /// A complete inbound frame, not yet interpreted.
    Frame { client: ClientId, frame: Frame },
    /// Clean EOF, a connection reset, or unrecoverable framing; the
    /// connection is gone either way.
    Closed { client: ClientId },
    /// A write failed with something other than a reset.
    WriteFailed { client: ClientId, error: io::Error },
}

/// Core-side record of one client connection.
pub struct ClientConnection {
    pub id: ClientId,
    outbox: mpsc::UnboundedSender<Message>,
    next_stream_id: u32,
    /// Channel ids of the logical channels associated with this client.
    pub associations: Vec<u8>,
    io_task: JoinHandle<()>,
}

impl ClientConnection {
    /// Queue a message toward the client. A failed send means the I/O
    /// task already died and its Closed event is on the way; the message
    /// can only be dropped, which is what the closing path wants anyway.
    pub fn send(&self, msg: Message) {
        let _ = self.outbox.send(msg);
    }

    /// Hand out the next stream id for a new association. Daemon-side
    /// allocations are odd: 1, 3, 5, ...
    pub fn allocate_stream_id(&mut self) -> u32 {
        let id = self.next_stream_id;
        self.next_stream_id += 2;
        id
    }
}

/// All connected clients and the services they registered.
pub struct ClientRegistry {
    clients: HashMap<ClientId, ClientConnection>,
    services: HashMap<Vec<u8>, ClientId>,
    next_client_id: u32,
    events_tx: mpsc::UnboundedSender<ClientEvent>,
}

impl ClientRegistry {
    pub fn new(events_tx: mpsc::UnboundedSender<ClientEvent>) -> Self {
        ClientRegistry {
            clients: HashMap::new(),
            services: HashMap::new(),
            next_client_id: 0,
            events_tx,
        }
    }

    /// Adopt a connected stream: allocate an id and spawn its I/O task.
    pub fn add<S>(&mut self, stream: S) -> ClientId
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let id = ClientId(self.next_client_id);
        self.next_client_id += 1;

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let io_task = tokio::spawn(io_task(id, stream, out_rx, self.events_tx.clone()));

        self.clients.insert(
            id,
            ClientConnection {
                id,
                outbox: out_tx,
                next_stream_id: 1,
                associations: Vec::new(),
                io_task,
            },
        );
        id
    }

    pub fn get(&self, id: ClientId) -> Option<&ClientConnection> {
        self.clients.get(&id)
    }

    pub fn get_mut(&mut self, id: ClientId) -> Option<&mut ClientConnection> {
        self.clients.get_mut(&id)
    }

    pub fn ids(&self) -> Vec<ClientId> {
        self.clients.keys().copied().collect()
    }

    /// Remove the record, stop its I/O task, and drop every service it
    /// registered. The record comes back so the caller can tear down its
    /// channel associations.
    pub fn remove(&mut self, id: ClientId) -> Option<ClientConnection> {
        let cc = self.clients.remove(&id)?;
        cc.io_task.abort();
        self.services.retain(|_, owner| *owner != id);
        Some(cc)
    }

    /// Claim a service name for `owner`. Names are exclusive.
    pub fn register_service(&mut self, name: Vec<u8>, owner: ClientId) -> bool {
        if self.services.contains_key(&name) {
            return false;
        }
        tracing::info!(
            service = %String::from_utf8_lossy(&name),
            %owner,
            "service registered"
        );
        self.services.insert(name, owner);
        true
    }

    /// Release a service name, but only for the client that owns it.
    pub fn deregister_service(&mut self, name: &[u8], owner: ClientId) -> bool {
        match self.services.get(name) {
            Some(o) if *o == owner => {
                self.services.remove(name);
                true
            }
            _ => false,
        }
    }

    pub fn service_owner(&self, name: &[u8]) -> Option<ClientId> {
        self.services.get(name).copied()
    }

    #[cfg(test)]
    pub(crate) fn service_count(&self) -> usize {
        self.services.len()
    }
}

/// The per-client I/O task: pumps inbound frames to the core and drains
/// the outbound queue into the socket.
async fn io_task<S>(
    id: ClientId,
    stream: S,
    mut outbox: mpsc::UnboundedReceiver<Message>,
    events: mpsc::UnboundedSender<ClientEvent>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = MessageFramed::new(stream);

    loop {
        tokio::select! {
            inbound = framed.recv() => match inbound {
                Ok(Some(frame)) => {
                    if events.send(ClientEvent::Frame { client: id, frame }).is_err() {
                        return;
                    }
                }
                Ok(None) => {
                    tracing::info!(%id, "end of file on client connection");
                    let _ = events.send(ClientEvent::Closed { client: id });
                    return;
                }
                Err(e) => {
                    // Resets and desynchronized framing both end the
                    // connection; there is no way to resume either.
                    tracing::warn!(%id, error = %e, "client read failed");
                    let _ = events.send(ClientEvent::Closed { client: id });
                    return;
                }
            },
            queued = outbox.recv() => match queued {
                Some(msg) => {
                    if let Err(e) = framed.send(&msg).await {
                        if e.kind() == io::ErrorKind::ConnectionReset {
                            let _ = events.send(ClientEvent::Closed { client: id });
                        } else {
                            let _ = events.send(ClientEvent::WriteFailed {
                                client: id,
                                error: e,
                            });
                        }
                        return;
                    }
                }
                // The core dropped the record; tear down quietly.
                None => return,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn registry() -> (ClientRegistry, mpsc::UnboundedReceiver<ClientEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ClientRegistry::new(tx), rx)
    }

    #[test]
    fn service_names_are_exclusive() {
        let (mut reg, _rx) = registry();
        let a = ClientId(1);
        let b = ClientId(2);

        assert!(reg.register_service(b"echo".to_vec(), a));
        assert!(!reg.register_service(b"echo".to_vec(), b));
        assert!(reg.register_service(b"disk".to_vec(), b));
        assert_eq!(reg.service_owner(b"echo"), Some(a));
    }

    #[test]
    fn deregister_checks_ownership() {
        let (mut reg, _rx) = registry();
        let a = ClientId(1);
        let b = ClientId(2);

        reg.register_service(b"echo".to_vec(), a);
        assert!(!reg.deregister_service(b"echo", b));
        assert!(reg.deregister_service(b"echo", a));
        assert!(!reg.deregister_service(b"echo", a));
    }

    #[tokio::test]
    async fn remove_drops_owned_services() {
        let (mut reg, _rx) = registry();
        let (local, _remote) = duplex(1024);
        let id = reg.add(local);

        reg.register_service(b"echo".to_vec(), id);
        reg.register_service(b"disk".to_vec(), id);
        assert_eq!(reg.service_count(), 2);

        let cc = reg.remove(id).unwrap();
        assert_eq!(cc.id, id);
        assert_eq!(reg.service_count(), 0);
        assert!(reg.get(id).is_none());
    }

    #[tokio::test]
    async fn stream_ids_are_odd_and_increasing() {
        let (mut reg, _rx) = registry();
        let (local, _remote) = duplex(64);
        let id = reg.add(local);

        let cc = reg.get_mut(id).unwrap();
        assert_eq!(cc.allocate_stream_id(), 1);
        assert_eq!(cc.allocate_stream_id(), 3);
        assert_eq!(cc.allocate_stream_id(), 5);
    }

    #[tokio::test]
    async fn io_task_pumps_frames_and_reports_eof() {
        let (mut reg, mut rx) = registry();
        let (local, remote) = duplex(4096);
        let id = reg.add(local);

        let mut peer = MessageFramed::new(remote);
        peer.send(&Message::Eos { stream_id: 5 }).await.unwrap();

        match rx.recv().await.unwrap() {
            ClientEvent::Frame { client, frame } => {
                assert_eq!(client, id);
                assert_eq!(frame.parse().unwrap(), Message::Eos { stream_id: 5 });
            }
            other => panic!("unexpected event {other:?}"),
        }

        // Outbound path: queue a message, the task writes it through.
        reg.get(id).unwrap().send(Message::RegisterRes { ok: true });
        let frame = peer.recv().await.unwrap().unwrap();
        assert_eq!(frame.parse().unwrap(), Message::RegisterRes { ok: true });

        drop(peer);
        match rx.recv().await.unwrap() {
            ClientEvent::Closed { client } => assert_eq!(client, id),
            other => panic!("unexpected event {other:?}"),
        }
    }
}

//! UDP Authentication Server
//!
//! Receives datagrams, keeps one connection state per remote address, and feeds
//! every datagram to the handshake protocol. Datagrams are handled inline in
//! the receive loop so packets from one peer are processed in arrival order;
//! protocol steps never block.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument, warn};

use super::config::ServerConfig;
use crate::auth::connection::ConnectionState;
use crate::auth::directory::{IdentityDirectory, KeyExchange};
use crate::auth::handshake::{
    Dispatcher, DropReason, HandshakeError, HandshakeOutcome, HandshakeProtocol,
};
use crate::auth::peer::{unix_millis, Transport};
use crate::auth::stage::AuthStage;
use crate::SocketId;

/// Server errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Socket bind or I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No connection is tracked for the address.
    #[error("no connection for {0}")]
    UnknownPeer(SocketAddr),

    /// Sealing an outbound frame failed.
    #[error("handshake error: {0}")]
    Handshake(#[from] HandshakeError),
}

// =============================================================================
// CONNECTION TABLE
// =============================================================================

struct ConnectionEntry {
    socket: SocketId,
    state: Arc<ConnectionState>,
    created_at: u64,
}

/// One row of the reaper's read-only view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReapEntry {
    /// Remote address.
    pub remote: SocketAddr,
    /// Socket id assigned on first contact.
    pub socket: SocketId,
    /// Current stage.
    pub stage: AuthStage,
    /// Milliseconds since the key context was established, or since first contact.
    pub age_millis: u64,
}

/// Connection states keyed by remote address.
pub struct ConnectionTable {
    entries: RwLock<BTreeMap<SocketAddr, ConnectionEntry>>,
    next_socket: AtomicU64,
    max_connections: usize,
}

impl ConnectionTable {
    /// Create an empty table holding at most `max_connections` entries.
    pub fn new(max_connections: usize) -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            next_socket: AtomicU64::new(1),
            max_connections,
        }
    }

    /// State for `remote`, if tracked.
    pub fn get(&self, remote: &SocketAddr) -> Option<(SocketId, Arc<ConnectionState>)> {
        self.entries
            .read()
            .get(remote)
            .map(|e| (e.socket, e.state.clone()))
    }

    /// State for `remote`, created at `None` on first contact.
    ///
    /// Returns `None` when the address is new and the table is full.
    pub fn get_or_insert(&self, remote: SocketAddr) -> Option<(SocketId, Arc<ConnectionState>)> {
        if let Some(found) = self.get(&remote) {
            return Some(found);
        }

        let mut entries = self.entries.write();
        if let Some(e) = entries.get(&remote) {
            return Some((e.socket, e.state.clone()));
        }
        if entries.len() >= self.max_connections {
            return None;
        }

        let socket = self.next_socket.fetch_add(1, Ordering::Relaxed);
        let state = Arc::new(ConnectionState::new());
        entries.insert(
            remote,
            ConnectionEntry {
                socket,
                state: state.clone(),
                created_at: unix_millis(),
            },
        );
        Some((socket, state))
    }

    /// Forget `remote`. Returns whether it was tracked.
    pub fn remove(&self, remote: &SocketAddr) -> bool {
        self.entries.write().remove(remote).is_some()
    }

    /// Number of tracked addresses.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether no address is tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Stage and age of every connection, for an external reaper.
    pub fn reap_view(&self, now: u64) -> Vec<ReapEntry> {
        self.entries
            .read()
            .iter()
            .map(|(remote, entry)| {
                let snapshot = entry.state.snapshot();
                ReapEntry {
                    remote: *remote,
                    socket: entry.socket,
                    stage: snapshot.stage,
                    age_millis: snapshot
                        .age_millis(now)
                        .unwrap_or_else(|| now.saturating_sub(entry.created_at)),
                }
            })
            .collect()
    }
}

// =============================================================================
// SERVER
// =============================================================================

/// UDP listener driving the responder side of the handshake.
pub struct AuthServer<D, K, P> {
    config: ServerConfig,
    socket: UdpSocket,
    protocol: HandshakeProtocol<D, K, P>,
    connections: ConnectionTable,
    shutdown_tx: broadcast::Sender<()>,
}

impl<D, K, P> AuthServer<D, K, P>
where
    D: IdentityDirectory,
    K: KeyExchange,
    P: Dispatcher,
{
    /// Bind the listening socket.
    pub async fn bind(
        config: ServerConfig,
        protocol: HandshakeProtocol<D, K, P>,
    ) -> Result<Self, ServerError> {
        let socket = UdpSocket::bind(config.bind_addr).await?;
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            connections: ConnectionTable::new(config.max_connections),
            config,
            socket,
            protocol,
            shutdown_tx,
        })
    }

    /// Address the socket is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.socket.local_addr()?)
    }

    /// Run until [`shutdown`](Self::shutdown) is called.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<(), ServerError> {
        info!("Auth server listening on {}", self.local_addr()?);

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut buf = vec![0u8; self.config.recv_buffer];

        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, remote)) => self.handle_datagram(&buf[..len], remote).await,
                        Err(e) => error!("Receive error: {}", e),
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        Ok(())
    }

    async fn handle_datagram(&self, bytes: &[u8], remote: SocketAddr) {
        let (socket, state) = match self.connections.get(&remote) {
            Some(found) => found,
            None if !self.protocol.admits_first_contact(bytes) => {
                debug!("Ignoring datagram from untracked {}", remote);
                return;
            }
            None => match self.connections.get_or_insert(remote) {
                Some(found) => found,
                None => {
                    warn!("Connection limit reached, dropping datagram from {}", remote);
                    return;
                }
            },
        };

        let outcome = match self
            .protocol
            .handle_packet(&state, socket, remote, bytes, Transport::Udp)
        {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Handshake error for {}: {}", remote, e);
                return;
            }
        };

        match outcome {
            // A retransmitted confirmation means our acceptance was lost
            HandshakeOutcome::Advanced(AuthStage::Authenticated)
            | HandshakeOutcome::Dropped(DropReason::DuplicateConfirmation) => {
                self.send_acceptance(&state, remote).await;
            }
            HandshakeOutcome::Reset(cause) => {
                debug!("Connection {} reset: {:?}", remote, cause);
                if state.compare_stage(AuthStage::None) {
                    self.connections.remove(&remote);
                }
            }
            _ => {}
        }
    }

    async fn send_acceptance(&self, state: &ConnectionState, remote: SocketAddr) {
        let frame = match self.protocol.seal_acceptance(state) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Could not seal acceptance for {}: {}", remote, e);
                return;
            }
        };
        if let Err(e) = self.socket.send_to(&frame, remote).await {
            warn!("Failed to send acceptance to {}: {}", remote, e);
        }
    }

    /// Seal `payload` for an authenticated peer and send it.
    pub async fn send(&self, remote: SocketAddr, payload: &[u8]) -> Result<(), ServerError> {
        let (_, state) = self
            .connections
            .get(&remote)
            .ok_or(ServerError::UnknownPeer(remote))?;
        let frame = self.protocol.seal_udp(&state, payload)?;
        self.socket.send_to(&frame, remote).await?;
        Ok(())
    }

    /// Connection table.
    pub fn connections(&self) -> &ConnectionTable {
        &self.connections
    }

    /// Number of tracked addresses.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Number of authenticated connections.
    pub fn authenticated_count(&self) -> usize {
        self.connections
            .reap_view(unix_millis())
            .iter()
            .filter(|e| e.stage.is_authenticated())
            .count()
    }

    /// Stop the receive loop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::config::AuthConfig;
    use crate::auth::directory::{LocalIdentity, PeerRecord, PreSharedKeyExchange, StaticDirectory};
    use crate::auth::handshake::{Initiator, VerifiedMessage};
    use std::time::Duration;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
    use zeroize::Zeroizing;

    type TestServer = AuthServer<StaticDirectory, PreSharedKeyExchange, UnboundedSender<VerifiedMessage>>;

    const PSK: [u8; 32] = [0x24; 32];

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_table_creates_once() {
        let table = ConnectionTable::new(10);
        let (s1, a) = table.get_or_insert(addr(1)).unwrap();
        let (s2, b) = table.get_or_insert(addr(1)).unwrap();
        assert_eq!(s1, s2);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.current_stage(), AuthStage::None);

        let (s3, _) = table.get_or_insert(addr(2)).unwrap();
        assert_ne!(s1, s3);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_table_limit_and_remove() {
        let table = ConnectionTable::new(1);
        assert!(table.get_or_insert(addr(1)).is_some());
        assert!(table.get_or_insert(addr(2)).is_none());
        // Known address still resolves when full
        assert!(table.get_or_insert(addr(1)).is_some());

        assert!(table.remove(&addr(1)));
        assert!(!table.remove(&addr(1)));
        assert!(table.is_empty());
        assert!(table.get_or_insert(addr(2)).is_some());
    }

    #[test]
    fn test_reap_view() {
        let table = ConnectionTable::new(10);
        let (_, state) = table.get_or_insert(addr(1)).unwrap();
        state.try_advance(AuthStage::Init);

        let now = unix_millis() + 5_000;
        let view = table.reap_view(now);
        assert_eq!(view.len(), 1);
        assert_eq!(view[0].remote, addr(1));
        assert_eq!(view[0].stage, AuthStage::Init);
        assert!(view[0].age_millis >= 5_000);
    }

    async fn start_server(
        max_connections: usize,
    ) -> (Arc<TestServer>, tokio::sync::mpsc::UnboundedReceiver<VerifiedMessage>) {
        let mut directory = StaticDirectory::new();
        directory.insert(1001, PSK.to_vec());
        let (tx, rx) = unbounded_channel();
        let auth = AuthConfig {
            local_entity_id: 1,
            ..AuthConfig::default()
        };
        let protocol = HandshakeProtocol::new(directory, PreSharedKeyExchange, tx, auth.clone());
        let config = ServerConfig {
            bind_addr: addr(0),
            max_connections,
            auth,
            ..ServerConfig::default()
        };

        let server = Arc::new(TestServer::bind(config, protocol).await.unwrap());
        let runner = server.clone();
        tokio::spawn(async move { runner.run().await });
        (server, rx)
    }

    async fn recv(socket: &UdpSocket) -> Vec<u8> {
        let mut buf = vec![0u8; 2048];
        let (len, _) = tokio::time::timeout(Duration::from_secs(5), socket.recv_from(&mut buf))
            .await
            .expect("timed out waiting for datagram")
            .unwrap();
        buf.truncate(len);
        buf
    }

    #[tokio::test]
    async fn test_loopback_handshake_and_data() {
        let (server, mut rx) = start_server(16).await;
        let server_addr = server.local_addr().unwrap();

        let client_socket = UdpSocket::bind(addr(0)).await.unwrap();
        let client = Initiator::new(
            LocalIdentity { entity_id: 1001 },
            PeerRecord {
                entity_id: 1,
                key_material: Zeroizing::new(PSK.to_vec()),
            },
            server_addr,
            PreSharedKeyExchange,
            AuthConfig::default(),
        );

        client_socket.send_to(&client.identity_claim().unwrap(), server_addr).await.unwrap();
        let salt = Initiator::<PreSharedKeyExchange>::fresh_salt();
        client_socket.send_to(&client.key_agreement(&salt).unwrap(), server_addr).await.unwrap();
        client_socket.send_to(&client.confirmation().unwrap(), server_addr).await.unwrap();

        let acceptance = recv(&client_socket).await;
        assert_eq!(
            client.handle_acceptance(&acceptance).unwrap(),
            HandshakeOutcome::Advanced(AuthStage::Authenticated)
        );
        assert_eq!(server.authenticated_count(), 1);

        client_socket.send_to(&client.seal_udp(b"hello").unwrap(), server_addr).await.unwrap();
        let message = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.peer, 1001);
        assert_eq!(message.payload, b"hello");

        let client_addr = client_socket.local_addr().unwrap();
        server.send(client_addr, b"welcome").await.unwrap();
        let reply = recv(&client_socket).await;
        assert_eq!(client.open(&reply, Transport::Udp).unwrap(), Some(b"welcome".to_vec()));

        server.shutdown();
    }

    #[tokio::test]
    async fn test_send_to_unknown_peer() {
        let (server, _rx) = start_server(16).await;
        assert!(matches!(
            server.send(addr(9), b"x").await,
            Err(ServerError::UnknownPeer(_))
        ));
        assert_eq!(server.connection_count(), 0);
        server.shutdown();
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    fn claim_from(entity_id: u64) -> Vec<u8> {
        crate::auth::packet::encode_identity_claim(&crate::auth::packet::IdentityClaim { entity_id })
            .unwrap()
    }

    #[tokio::test]
    async fn test_junk_does_not_take_table_slots() {
        let (server, _rx) = start_server(1).await;
        let server_addr = server.local_addr().unwrap();

        let junk = UdpSocket::bind(addr(0)).await.unwrap();
        junk.send_to(&[0xEE], server_addr).await.unwrap();
        junk.send_to(&claim_from(4242), server_addr).await.unwrap();

        let legit = UdpSocket::bind(addr(0)).await.unwrap();
        legit.send_to(&claim_from(1001), server_addr).await.unwrap();
        let legit_addr = legit.local_addr().unwrap();

        wait_until(|| server.connections().get(&legit_addr).is_some()).await;
        assert_eq!(server.connection_count(), 1);
        assert!(server.connections().get(&junk.local_addr().unwrap()).is_none());
        server.shutdown();
    }

    #[tokio::test]
    async fn test_reset_forgets_connection() {
        let (server, _rx) = start_server(16).await;
        let server_addr = server.local_addr().unwrap();
        let client = UdpSocket::bind(addr(0)).await.unwrap();
        let client_addr = client.local_addr().unwrap();

        client.send_to(&claim_from(1001), server_addr).await.unwrap();
        wait_until(|| server.connections().get(&client_addr).is_some()).await;

        // Salt below the minimum length fails the key exchange
        let short = crate::auth::packet::encode_key_agreement(&crate::auth::packet::KeyAgreement {
            entity_id: 1001,
            payload: vec![1, 2, 3],
        })
        .unwrap();
        client.send_to(&short, server_addr).await.unwrap();
        wait_until(|| server.connections().get(&client_addr).is_none()).await;
        assert!(server.connections().is_empty());
        server.shutdown();
    }
}

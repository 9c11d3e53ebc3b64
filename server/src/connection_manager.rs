//! Peer connection management for the server
//!
//! This module owns the listening socket and every accepted connection:
//! - Accepting connection requests and assigning peer IDs
//! - The class-id handshake burst and welcome packet for new peers
//! - Capacity limits and replacement of stale sessions
//! - Unicast and broadcast sends with per-peer failure reporting
//! - Graceful disconnects and cleanup of lost peers
//!
//! All bookkeeping happens on the caller's thread during `tick()`. Receive loops only
//! ever push into the shared packet queue, so the peer table needs no lock.

use bytes::Bytes;
use log::{error, info, warn};
use shared::{
    ConnError, ConnectRequest, ConnectionState, DatagramSink, Frame, Host, NetConfig, NetEvent,
    Packet, PacketQueue, PeerConnection, QueueItem, Reliability,
};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinSet;

/// Tracks every connected peer and multiplexes their traffic into one queue
///
/// Peer IDs start at 1 and are never reused while the manager lives, so an ID seen
/// in a late queue item can never be mistaken for a newer peer.
pub struct ConnectionManager {
    /// Listening socket and datagram router
    host: Host,
    /// Where outgoing datagrams go; the host's socket unless a layer was installed
    sink: Arc<dyn DatagramSink>,
    /// Live connections indexed by peer ID
    peers: HashMap<u32, PeerConnection>,
    /// Shared by every receive loop, drained once per tick
    queue: Arc<PacketQueue>,
    /// Next peer ID to hand out
    next_peer_id: u32,
    /// Class names announced to each new peer before its welcome
    class_table: Vec<(i32, String)>,
    config: NetConfig,
}

impl ConnectionManager {
    /// Binds the listening socket
    ///
    /// Accepts at most `config.max_peers` concurrent peers; later requests are
    /// refused until someone leaves.
    pub async fn open(addr: SocketAddr, config: NetConfig) -> io::Result<Self> {
        Self::open_with_sink(addr, config, |sink| sink).await
    }

    /// Binds the listening socket and routes outgoing datagrams through `layer`
    ///
    /// The layer receives the socket's own sink and returns the one every peer
    /// sends through. Useful for fault injection and traffic accounting.
    pub async fn open_with_sink<F>(addr: SocketAddr, config: NetConfig, layer: F) -> io::Result<Self>
    where
        F: FnOnce(Arc<dyn DatagramSink>) -> Arc<dyn DatagramSink>,
    {
        let host = Host::listen(addr).await?;
        let sink = layer(host.sink());

        Ok(Self {
            host,
            sink,
            peers: HashMap::new(),
            queue: Arc::new(PacketQueue::new()),
            next_peer_id: 1,
            class_table: Vec::new(),
            config,
        })
    }

    /// Sets the class table announced to peers that connect from now on
    pub fn with_class_table(mut self, class_table: Vec<(i32, String)>) -> Self {
        self.class_table = class_table;
        self
    }

    pub fn set_class_table(&mut self, class_table: Vec<(i32, String)>) {
        self.class_table = class_table;
    }

    /// Services the manager once without waiting
    ///
    /// Accepts pending connection requests, then returns everything the receive
    /// loops queued since the last call, in arrival order. Newly accepted peers show
    /// up as `Connected` items, lost ones as `Disconnected`; lost peers are removed
    /// from the table before this returns.
    pub fn tick(&mut self) -> Vec<QueueItem> {
        while let Some(request) = self.host.poll_request() {
            self.handle_request(request);
        }

        let items = self.queue.drain();

        for item in &items {
            if item.event != NetEvent::Disconnected {
                continue;
            }
            let confirmed = self
                .peers
                .get(&item.peer_id)
                .is_some_and(|peer| peer.state() == ConnectionState::Disconnected);
            if confirmed {
                self.peers.remove(&item.peer_id);
                info!("Peer {} removed", item.peer_id);
            }
        }

        items
    }

    /// Answers one connection request
    ///
    /// Requests repeating the token of an existing session are resends and ignored.
    /// A request with a new token from a known address means the old session is
    /// dead: it is dropped and reported lost before the new peer is accepted.
    fn handle_request(&mut self, request: ConnectRequest) {
        let existing = self
            .peers
            .iter()
            .find(|(_, peer)| peer.remote() == Some(request.addr))
            .map(|(id, peer)| (*id, peer.token()));

        if let Some((peer_id, token)) = existing {
            if token == Some(request.token) {
                return;
            }

            info!(
                "Peer {} reconnected from {}, dropping old session",
                peer_id, request.addr
            );
            if let Some(mut old) = self.peers.remove(&peer_id) {
                old.reset();
            }
            self.queue
                .push(QueueItem::new(peer_id, request.addr, NetEvent::Disconnected));
        }

        if self.peers.len() >= self.config.max_peers {
            warn!(
                "Refusing {}: server full ({} peers)",
                request.addr, self.config.max_peers
            );
            let refuse = Frame::Refuse {
                token: request.token,
            };
            if let Err(e) = self.sink.send_datagram(&refuse.encode(), request.addr) {
                warn!("Failed to refuse {}: {}", request.addr, e);
            }
            return;
        }

        let peer_id = self.next_peer_id;
        self.next_peer_id += 1;

        self.queue
            .push(QueueItem::new(peer_id, request.addr, NetEvent::Connected));

        let mut peer = PeerConnection::new(&self.host, Arc::clone(&self.queue), self.config.clone())
            .with_sink(Arc::clone(&self.sink));
        peer.accept(request, peer_id);
        info!("Peer {} connected from {}", peer_id, request.addr);

        for (class_id, name) in &self.class_table {
            let mapping = Packet::ClassIdMapping {
                class_id: *class_id,
                name: name.clone(),
            };
            if let Err(e) = peer.send_reliable(mapping.encode()) {
                warn!("Failed to send class mapping to peer {}: {}", peer_id, e);
            }
        }
        if let Err(e) = peer.send_reliable(Packet::Welcome { peer_id }.encode()) {
            warn!("Failed to welcome peer {}: {}", peer_id, e);
        }

        self.peers.insert(peer_id, peer);
    }

    pub fn send_to_peer(
        &self,
        peer_id: u32,
        payload: Bytes,
        reliability: Reliability,
    ) -> Result<(), ConnError> {
        self.peers
            .get(&peer_id)
            .ok_or(ConnError::UnknownPeer(peer_id))?
            .send(payload, reliability)
    }

    /// Sends `payload` to every established peer
    ///
    /// A failing peer does not stop delivery to the others. Returns the peers that
    /// could not be sent to, with the reason.
    pub fn broadcast(&self, payload: Bytes, reliability: Reliability) -> Vec<(u32, ConnError)> {
        let mut failures = Vec::new();

        for peer_id in self.established_peers() {
            if let Err(e) = self.send_to_peer(peer_id, payload.clone(), reliability) {
                warn!("Broadcast to peer {} failed: {}", peer_id, e);
                failures.push((peer_id, e));
            }
        }

        failures
    }

    /// IDs of all established peers in ascending order
    pub fn established_peers(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self
            .peers
            .iter()
            .filter(|(_, peer)| peer.state() == ConnectionState::Established)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Gracefully disconnects one peer
    ///
    /// Waits for the peer's confirmation (or the disconnect timeout) and only then
    /// removes it from the table. A `Disconnected` item for the peer is queued so
    /// the next tick reports it like any other loss.
    pub async fn disconnect_peer(&mut self, peer_id: u32) -> Result<(), ConnError> {
        let peer = self
            .peers
            .get_mut(&peer_id)
            .ok_or(ConnError::UnknownPeer(peer_id))?;
        let remote = peer.remote();

        peer.disconnect().await;

        if peer.state() == ConnectionState::Disconnected {
            self.peers.remove(&peer_id);
            info!("Peer {} disconnected by server", peer_id);
            if let Some(remote) = remote {
                self.queue
                    .push(QueueItem::new(peer_id, remote, NetEvent::Disconnected));
            }
        }
        Ok(())
    }

    /// Disconnects every peer concurrently, then releases the socket
    pub async fn close(self) {
        let ConnectionManager {
            host, peers, queue, ..
        } = self;

        let mut disconnects = JoinSet::new();
        for (_, mut peer) in peers {
            disconnects.spawn(async move { peer.disconnect().await });
        }
        while let Some(result) = disconnects.join_next().await {
            if let Err(e) = result {
                error!("Disconnect task failed: {}", e);
            }
        }

        queue.close();
        host.close().await;
        info!("Connection manager closed");
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.host.local_addr()
    }

    pub fn peer_state(&self, peer_id: u32) -> Option<ConnectionState> {
        self.peers.get(&peer_id).map(PeerConnection::state)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn config(&self) -> &NetConfig {
        &self.config
    }
}

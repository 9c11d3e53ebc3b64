//! Client session: one connection to the server, the mirrored world and the packets
//! the player sends

use bytes::Bytes;
use log::{debug, info, warn};
use shared::{
    decode, ApplyError, ConnError, ConnectionState, GameStateClient, GameStateDiff, Host,
    NetConfig, NetEvent, Packet, PacketQueue, PeerConnection, Reliability, WorldSnapshot,
    RESYNC_REQUEST,
};
use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

/// Receives what the server tells the client
///
/// Every method defaults to doing nothing.
pub trait ClientHandler {
    fn welcomed(&mut self, _peer_id: u32) {}

    fn class_mapped(&mut self, _class_id: i32, _name: &str) {}

    fn chat_received(&mut self, _message: &str) {}

    /// A replicated field changed; `None` means it was removed
    fn field_changed(&mut self, _field_id: u32, _bytes: Option<&Bytes>) {}

    /// The connection to the server is gone. `Client::connect` may be called again.
    fn peer_lost(&mut self) {}
}

impl ClientHandler for () {}

pub struct Client<H = ()> {
    connection: Option<PeerConnection>,
    host: Option<Host>,
    game_state: GameStateClient,
    class_ids: HashMap<i32, String>,
    peer_id: Option<u32>,
    /// A full snapshot was requested and has not arrived yet
    resync_pending: bool,
    handler: H,
    config: NetConfig,
}

impl<H: ClientHandler> Client<H> {
    pub fn new(config: NetConfig, handler: H) -> Self {
        Self {
            connection: None,
            host: None,
            game_state: GameStateClient::new(config.snapshot_history),
            class_ids: HashMap::new(),
            peer_id: None,
            resync_pending: false,
            handler,
            config,
        }
    }

    /// Connects to `server`, dropping any previous connection and mirrored state
    pub async fn connect(&mut self, server: SocketAddr) -> Result<(), ConnError> {
        self.disconnect().await;
        self.game_state.reset();
        self.class_ids.clear();
        self.resync_pending = false;

        let local: SocketAddr = if server.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let host = Host::bind(local).await?;
        let mut connection =
            PeerConnection::new(&host, Arc::new(PacketQueue::new()), self.config.clone());

        connection.connect(server).await?;
        info!("Connected to {}", server);

        self.host = Some(host);
        self.connection = Some(connection);
        Ok(())
    }

    /// Handles everything the server sent since the last tick. Never waits.
    pub fn tick(&mut self) {
        let items: Vec<_> = match &self.connection {
            Some(connection) => std::iter::from_fn(|| connection.poll()).collect(),
            None => return,
        };

        for item in items {
            match item.event {
                NetEvent::Received(payload) => match decode(&payload) {
                    Ok(packet) => self.handle_packet(packet),
                    Err(e) => warn!("Dropping malformed packet from server: {}", e),
                },
                NetEvent::Disconnected => self.handle_peer_lost(),
                NetEvent::Connected => {}
            }
        }
    }

    fn handle_packet(&mut self, packet: Packet) {
        match packet {
            Packet::GameStateDelta(diff) => self.apply_diff(&diff),
            Packet::Welcome { peer_id } => {
                info!("Welcomed as peer {}", peer_id);
                self.peer_id = Some(peer_id);
                self.handler.welcomed(peer_id);
            }
            Packet::ClassIdMapping { class_id, name } => {
                debug!("Class {} is {}", class_id, name);
                self.handler.class_mapped(class_id, &name);
                self.class_ids.insert(class_id, name);
            }
            Packet::Chat { message } => self.handler.chat_received(&message),
            other => warn!("Unexpected {:?} packet from server", other.kind()),
        }
    }

    fn apply_diff(&mut self, diff: &GameStateDiff) {
        let previous = self.game_state.current().cloned();

        match self.game_state.apply_diff(diff) {
            Ok(()) => {
                self.resync_pending = false;
                // acks carry an i32 and non-positive values mean "resync"; past that
                // range the server simply keeps sending full snapshots
                match i32::try_from(diff.target_snapshot_id) {
                    Ok(state) => {
                        if let Err(e) = self.send(Packet::Ack { state }, Reliability::Unreliable) {
                            debug!("Failed to acknowledge snapshot: {}", e);
                        }
                    }
                    Err(_) => warn!(
                        "Snapshot {} is beyond the acknowledgeable range",
                        diff.target_snapshot_id
                    ),
                }
                self.notify_changes(previous.as_ref());
            }
            Err(ApplyError::StaleBase {
                target, current, ..
            }) if target <= current => {
                debug!("Ignoring outdated diff for {} (at {})", target, current);
            }
            Err(e) => {
                if self.resync_pending {
                    debug!("Still waiting for a full snapshot: {}", e);
                    return;
                }
                warn!("Cannot apply diff ({}), requesting full snapshot", e);
                let request = Packet::Ack {
                    state: RESYNC_REQUEST,
                };
                match self.send(request, Reliability::Reliable) {
                    Ok(()) => self.resync_pending = true,
                    Err(e) => warn!("Failed to request full snapshot: {}", e),
                }
            }
        }
    }

    fn notify_changes(&mut self, previous: Option<&WorldSnapshot>) {
        let Some(current) = self.game_state.current() else {
            return;
        };

        for (field_id, bytes) in current.fields() {
            if previous.and_then(|p| p.field(field_id)) != Some(bytes) {
                self.handler.field_changed(field_id, Some(bytes));
            }
        }

        if let Some(previous) = previous {
            for (field_id, _) in previous.fields() {
                if current.field(field_id).is_none() {
                    self.handler.field_changed(field_id, None);
                }
            }
        }
    }

    fn handle_peer_lost(&mut self) {
        warn!("Lost connection to server");
        self.connection = None;
        self.host = None;
        self.peer_id = None;
        self.handler.peer_lost();
    }

    fn send(&self, packet: Packet, reliability: Reliability) -> Result<(), ConnError> {
        self.connection
            .as_ref()
            .ok_or(ConnError::NotConnected)?
            .send(packet.encode(), reliability)
    }

    /// Keystrokes are discrete events and go out reliably
    pub fn send_keystroke(&self, keycode: u8) -> Result<(), ConnError> {
        self.send(Packet::KeyStroke { keycode }, Reliability::Reliable)
    }

    /// Mouse moves are continuous; a lost one is replaced by the next
    pub fn send_mouse(&self, x: f64, y: f64) -> Result<(), ConnError> {
        self.send(Packet::MouseMove { x, y }, Reliability::Unreliable)
    }

    pub fn send_chat(&self, message: &str) -> Result<(), ConnError> {
        let chat = Packet::Chat {
            message: message.to_string(),
        };
        self.send(chat, Reliability::Reliable)
    }

    /// Gracefully closes the connection, if any
    pub async fn disconnect(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            connection.disconnect().await;
        }
        if let Some(host) = self.host.take() {
            host.close().await;
        }
        self.peer_id = None;
    }

    pub fn state(&self) -> ConnectionState {
        self.connection
            .as_ref()
            .map_or(ConnectionState::Disconnected, PeerConnection::state)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Established
    }

    /// ID assigned by the server's welcome
    pub fn peer_id(&self) -> Option<u32> {
        self.peer_id
    }

    pub fn snapshot_id(&self) -> u32 {
        self.game_state.current_snapshot_id()
    }

    pub fn field(&self, field_id: u32) -> Option<&Bytes> {
        self.game_state.field(field_id)
    }

    pub fn class_name(&self, class_id: i32) -> Option<&str> {
        self.class_ids.get(&class_id).map(String::as_str)
    }

    pub fn game_state(&self) -> &GameStateClient {
        &self.game_state
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{FieldChange, QueueItem, FULL_SNAPSHOT_BASE};
    use std::time::{Duration, Instant};
    use tokio::time::sleep;
    use tokio_test::assert_ok;

    #[derive(Default)]
    struct Recorder {
        welcomed: Vec<u32>,
        classes: Vec<(i32, String)>,
        chat: Vec<String>,
        changes: Vec<(u32, Option<Bytes>)>,
        lost: usize,
    }

    impl ClientHandler for Recorder {
        fn welcomed(&mut self, peer_id: u32) {
            self.welcomed.push(peer_id);
        }

        fn class_mapped(&mut self, class_id: i32, name: &str) {
            self.classes.push((class_id, name.to_string()));
        }

        fn chat_received(&mut self, message: &str) {
            self.chat.push(message.to_string());
        }

        fn field_changed(&mut self, field_id: u32, bytes: Option<&Bytes>) {
            self.changes.push((field_id, bytes.cloned()));
        }

        fn peer_lost(&mut self) {
            self.lost += 1;
        }
    }

    /// A bare listening host standing in for the server
    struct FakeServer {
        host: Host,
        queue: Arc<PacketQueue>,
    }

    impl FakeServer {
        async fn start() -> Self {
            Self {
                host: Host::listen("127.0.0.1:0".parse().unwrap()).await.unwrap(),
                queue: Arc::new(PacketQueue::new()),
            }
        }

        async fn accept(&mut self) -> PeerConnection {
            loop {
                if let Some(request) = self.host.poll_request() {
                    let mut peer = PeerConnection::new(
                        &self.host,
                        Arc::clone(&self.queue),
                        NetConfig::default(),
                    );
                    peer.accept(request, 1);
                    return peer;
                }
                sleep(Duration::from_millis(5)).await;
            }
        }

        /// Application packets received so far
        fn received(&self) -> Vec<Packet> {
            std::iter::from_fn(|| self.queue.try_pop())
                .filter_map(|item: QueueItem| item.payload().and_then(|p| decode(p).ok()))
                .collect()
        }
    }

    async fn connected() -> (FakeServer, PeerConnection, Client<Recorder>) {
        let mut server = FakeServer::start().await;
        let mut client = Client::new(NetConfig::default(), Recorder::default());
        let addr = server.host.local_addr();

        let (result, peer) = tokio::join!(client.connect(addr), server.accept());
        assert_ok!(result);
        (server, peer, client)
    }

    async fn tick_until<F>(client: &mut Client<Recorder>, mut condition: F) -> bool
    where
        F: FnMut(&Client<Recorder>) -> bool,
    {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            client.tick();
            if condition(client) {
                return true;
            }
            sleep(Duration::from_millis(5)).await;
        }
        false
    }

    fn full_diff(target: u32, fields: &[(u32, &'static [u8])]) -> Packet {
        Packet::GameStateDelta(GameStateDiff {
            base_snapshot_id: FULL_SNAPSHOT_BASE,
            target_snapshot_id: target,
            is_full: true,
            changes: fields
                .iter()
                .map(|(field_id, bytes)| FieldChange::Set {
                    field_id: *field_id,
                    bytes: Bytes::from_static(bytes),
                })
                .collect(),
        })
    }

    #[tokio::test]
    async fn test_handshake_packets_reach_handler() {
        let (_server, peer, mut client) = connected().await;

        peer.send_reliable(
            Packet::ClassIdMapping {
                class_id: 1,
                name: "Avatar".to_string(),
            }
            .encode(),
        )
        .unwrap();
        peer.send_reliable(Packet::Welcome { peer_id: 1 }.encode())
            .unwrap();
        peer.send_reliable(
            Packet::Chat {
                message: "[2] hi".to_string(),
            }
            .encode(),
        )
        .unwrap();

        assert!(tick_until(&mut client, |c| !c.handler().chat.is_empty()).await);
        assert_eq!(client.peer_id(), Some(1));
        assert_eq!(client.class_name(1), Some("Avatar"));
        assert_eq!(client.handler().welcomed, vec![1]);
        assert_eq!(client.handler().classes, vec![(1, "Avatar".to_string())]);
        assert_eq!(client.handler().chat, vec!["[2] hi".to_string()]);
    }

    #[tokio::test]
    async fn test_full_diff_applied_and_acknowledged() {
        let (server, peer, mut client) = connected().await;

        peer.send_unreliable(full_diff(3, &[(10, &[1, 2]), (11, &[3])]).encode())
            .unwrap();

        assert!(tick_until(&mut client, |c| c.snapshot_id() == 3).await);
        assert_eq!(client.field(10), Some(&Bytes::from_static(&[1, 2])));
        assert_eq!(client.handler().changes.len(), 2);

        let deadline = Instant::now() + Duration::from_secs(3);
        let mut acks = Vec::new();
        while acks.is_empty() && Instant::now() < deadline {
            acks.extend(server.received());
            sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(acks, vec![Packet::Ack { state: 3 }]);
    }

    #[tokio::test]
    async fn test_snapshot_beyond_ack_range_is_applied_but_not_acknowledged() {
        let (server, peer, mut client) = connected().await;
        let target = i32::MAX as u32 + 1;

        peer.send_unreliable(full_diff(target, &[(10, &[7])]).encode())
            .unwrap();

        assert!(tick_until(&mut client, |c| c.snapshot_id() == target).await);
        assert_eq!(client.field(10), Some(&Bytes::from_static(&[7])));

        sleep(Duration::from_millis(300)).await;
        let acks: Vec<_> = server
            .received()
            .into_iter()
            .filter(|packet| matches!(packet, Packet::Ack { .. }))
            .collect();
        assert!(acks.is_empty(), "unexpected acks {:?}", acks);
    }

    #[tokio::test]
    async fn test_removed_field_reported() {
        let (_server, peer, mut client) = connected().await;

        peer.send_unreliable(full_diff(1, &[(10, &[1]), (11, &[2])]).encode())
            .unwrap();
        assert!(tick_until(&mut client, |c| c.snapshot_id() == 1).await);

        let removal = Packet::GameStateDelta(GameStateDiff {
            base_snapshot_id: 1,
            target_snapshot_id: 2,
            is_full: false,
            changes: vec![FieldChange::Remove { field_id: 11 }],
        });
        peer.send_unreliable(removal.encode()).unwrap();

        assert!(tick_until(&mut client, |c| c.snapshot_id() == 2).await);
        assert_eq!(client.field(11), None);
        assert_eq!(client.handler().changes.last(), Some(&(11, None)));
    }

    #[tokio::test]
    async fn test_unknown_base_requests_resync_once() {
        let (server, peer, mut client) = connected().await;

        for target in [6, 7] {
            let diff = Packet::GameStateDelta(GameStateDiff {
                base_snapshot_id: target - 1,
                target_snapshot_id: target,
                is_full: false,
                changes: vec![],
            });
            peer.send_reliable(diff.encode()).unwrap();
        }

        let deadline = Instant::now() + Duration::from_secs(1);
        let mut received = Vec::new();
        while Instant::now() < deadline {
            client.tick();
            received.extend(server.received());
            sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(
            received,
            vec![Packet::Ack {
                state: RESYNC_REQUEST
            }]
        );
        assert_eq!(client.snapshot_id(), FULL_SNAPSHOT_BASE);

        // the full snapshot clears the pending request
        peer.send_unreliable(full_diff(8, &[(10, &[9])]).encode())
            .unwrap();
        assert!(tick_until(&mut client, |c| c.snapshot_id() == 8).await);
    }

    #[tokio::test]
    async fn test_malformed_packet_is_dropped() {
        let (_server, peer, mut client) = connected().await;

        peer.send_unreliable(Bytes::from_static(&[0, 0, 0, 99]))
            .unwrap();
        peer.send_reliable(Packet::Welcome { peer_id: 4 }.encode())
            .unwrap();

        assert!(tick_until(&mut client, |c| c.peer_id() == Some(4)).await);
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_peer_loss_reaches_handler() {
        let (_server, mut peer, mut client) = connected().await;

        peer.disconnect().await;

        assert!(tick_until(&mut client, |c| c.handler().lost == 1).await);
        assert!(!client.is_connected());
        assert_eq!(client.peer_id(), None);
        assert!(client.send_chat("anyone?").is_err());
    }

    #[tokio::test]
    async fn test_sends_require_connection() {
        let client: Client = Client::new(NetConfig::default(), ());
        assert!(matches!(
            client.send_keystroke(b'w'),
            Err(ConnError::NotConnected)
        ));
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }
}

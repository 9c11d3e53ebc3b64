//! Server session: drains the connection manager once per tick and keeps every peer's
//! mirror of the world up to date

use crate::connection_manager::ConnectionManager;
use bytes::Bytes;
use log::{debug, info, warn};
use shared::{
    decode, GameStateManager, NetConfig, NetEvent, Packet, QueueItem, Reliability,
};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::{interval, Instant, MissedTickBehavior};

/// Longest simulation step taken in one tick, in seconds
const MAX_DELTA_TIME: f32 = 1.0 / 20.0;

/// Input forwarded from a peer to the simulation
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InputEvent {
    KeyStroke(u8),
    MouseMove { x: f64, y: f64 },
}

/// The game the server replicates
///
/// Called only from the session's tick. The session never looks inside field bytes;
/// whatever `replicated_fields` returns is what clients see.
pub trait Simulation {
    fn peer_joined(&mut self, peer_id: u32);

    fn peer_lost(&mut self, peer_id: u32);

    fn handle_input(&mut self, peer_id: u32, input: InputEvent);

    fn handle_chat(&mut self, _peer_id: u32, _message: &str) {}

    fn step(&mut self, dt: f32);

    /// Everything that must reach clients, as `(field_id, bytes)` pairs
    fn replicated_fields(&self) -> Vec<(u32, Bytes)>;
}

/// What happened during one tick
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickStats {
    /// Application packets taken from the queue
    pub received: usize,
    /// Packets that failed to decode or made no sense from a client
    pub dropped: usize,
    pub diffs_sent: usize,
    pub send_failures: usize,
}

/// Authoritative server coordinating networking and game simulation
pub struct Server<S> {
    connections: ConnectionManager,
    game_state: GameStateManager,
    simulation: S,
    tick: u64,
}

impl<S: Simulation> Server<S> {
    pub async fn new(addr: SocketAddr, config: NetConfig, simulation: S) -> io::Result<Self> {
        let connections = ConnectionManager::open(addr, config).await?;
        Ok(Self::from_parts(connections, simulation))
    }

    /// Wraps an already opened connection manager
    pub fn from_parts(connections: ConnectionManager, simulation: S) -> Self {
        let game_state = GameStateManager::new(connections.config().snapshot_history);
        Self {
            connections,
            game_state,
            simulation,
            tick: 0,
        }
    }

    /// Runs one network tick
    ///
    /// Handles everything received since the last tick, advances the simulation by
    /// `dt` seconds, captures a snapshot and sends each established peer the diff
    /// from its last acknowledged snapshot. Diffs go out unreliably; a lost one is
    /// superseded by the next tick's.
    pub fn tick(&mut self, dt: f32) -> TickStats {
        let mut stats = TickStats::default();

        for item in self.connections.tick() {
            self.handle_item(item, &mut stats);
        }

        self.simulation.step(dt);
        self.game_state
            .capture_snapshot(self.simulation.replicated_fields());

        for peer_id in self.connections.established_peers() {
            let Some(diff) = self.game_state.diff_for(peer_id) else {
                continue;
            };
            let payload = Packet::GameStateDelta(diff).encode();
            match self
                .connections
                .send_to_peer(peer_id, payload, Reliability::Unreliable)
            {
                Ok(()) => stats.diffs_sent += 1,
                Err(e) => {
                    debug!("Failed to send diff to peer {}: {}", peer_id, e);
                    stats.send_failures += 1;
                }
            }
        }

        self.tick += 1;
        if self.tick % 60 == 0 && !self.connections.is_empty() {
            debug!(
                "Tick {}: {} peers, {} diffs sent, {} packets received",
                self.tick,
                self.connections.peer_count(),
                stats.diffs_sent,
                stats.received
            );
        }

        stats
    }

    fn handle_item(&mut self, item: QueueItem, stats: &mut TickStats) {
        let peer_id = item.peer_id;
        match item.event {
            NetEvent::Connected => self.simulation.peer_joined(peer_id),
            NetEvent::Disconnected => {
                self.game_state.remove_peer(peer_id);
                self.simulation.peer_lost(peer_id);
            }
            NetEvent::Received(payload) => {
                stats.received += 1;
                match decode(&payload) {
                    Ok(packet) => {
                        if !self.handle_packet(peer_id, packet) {
                            stats.dropped += 1;
                        }
                    }
                    Err(e) => {
                        warn!("Dropping malformed packet from peer {}: {}", peer_id, e);
                        stats.dropped += 1;
                    }
                }
            }
        }
    }

    /// Returns false for packets a client has no business sending
    fn handle_packet(&mut self, peer_id: u32, packet: Packet) -> bool {
        match packet {
            Packet::Ack { state } => self.game_state.acknowledge(peer_id, state),
            Packet::KeyStroke { keycode } => self
                .simulation
                .handle_input(peer_id, InputEvent::KeyStroke(keycode)),
            Packet::MouseMove { x, y } => self
                .simulation
                .handle_input(peer_id, InputEvent::MouseMove { x, y }),
            Packet::Chat { message } => {
                info!("[{}] {}", peer_id, message);
                self.simulation.handle_chat(peer_id, &message);

                let relay = Packet::Chat {
                    message: format!("[{}] {}", peer_id, message),
                };
                self.connections
                    .broadcast(relay.encode(), Reliability::Reliable);
            }
            other => {
                warn!("Unexpected {:?} packet from peer {}", other.kind(), peer_id);
                return false;
            }
        }
        true
    }

    /// Main server loop: ticks at `tick_rate` Hz until Ctrl+C, then shuts down
    pub async fn run(mut self, tick_rate: u32) -> io::Result<()> {
        let mut tick_interval = interval(Duration::from_secs_f32(1.0 / tick_rate.max(1) as f32));
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_tick = Instant::now();

        info!("Server started on {}", self.local_addr());

        loop {
            tokio::select! {
                _ = tick_interval.tick() => {
                    let now = Instant::now();
                    let mut dt = now.duration_since(last_tick).as_secs_f32();
                    last_tick = now;

                    if dt > MAX_DELTA_TIME {
                        debug!("Large delta time ({:.3}s), capping to {:.3}s", dt, MAX_DELTA_TIME);
                        dt = MAX_DELTA_TIME;
                    }

                    self.tick(dt);
                }
                result = tokio::signal::ctrl_c() => {
                    result?;
                    info!("Received Ctrl+C, shutting down gracefully...");
                    break;
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// Disconnects every peer and releases the socket
    pub async fn shutdown(self) {
        self.connections.close().await;
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.connections.local_addr()
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    pub fn connections_mut(&mut self) -> &mut ConnectionManager {
        &mut self.connections
    }

    pub fn game_state(&self) -> &GameStateManager {
        &self.game_state
    }

    pub fn simulation(&self) -> &S {
        &self.simulation
    }

    pub fn simulation_mut(&mut self) -> &mut S {
        &mut self.simulation
    }

    pub fn tick_count(&self) -> u64 {
        self.tick
    }
}

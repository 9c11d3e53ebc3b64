//! # Shared networking core
//!
//! Everything both executables need to keep a mirrored world consistent with an
//! authoritative server over UDP:
//!
//! - [`codec`]: typed application packets and their byte layout
//! - [`queue`]: the hand-off buffer between receive loops and the simulation thread
//! - [`transport`], [`reliable`], [`fragment`], [`host`]: a small reliable-UDP layer
//!   (handshake frames, acknowledgements, retransmission, fragmentation, keep-alive) on
//!   top of a tokio `UdpSocket`
//! - [`peer`]: one connection to one remote endpoint and its background receive loop
//! - [`gamestate`]: snapshots, per-client diffs and their application on the client
//! - [`config`]: timeouts and limits shared by client and server
//!
//! The simulation itself is not part of this crate. It only hands over flat lists of
//! `(field_id, bytes)` and gets the same pairs back on the other side.

pub mod codec;
pub mod config;
pub mod fragment;
pub mod gamestate;
pub mod host;
pub mod peer;
pub mod queue;
pub mod reliable;
pub mod transport;

pub use codec::{decode, encode, DecodeError, Packet, PacketKind};
pub use config::NetConfig;
pub use fragment::MAX_PAYLOAD;
pub use gamestate::{
    ApplyError, FieldChange, GameStateClient, GameStateDiff, GameStateManager, WorldSnapshot,
    FULL_SNAPSHOT_BASE,
};
pub use host::{ConnectRequest, Host};
pub use peer::{ConnError, ConnectionState, PeerConnection};
pub use queue::{NetEvent, PacketQueue, QueueItem};
pub use transport::{DatagramSink, Fragment, Frame, Reliability};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 55556;
pub const WORLD_WIDTH: f32 = 800.0;
pub const WORLD_HEIGHT: f32 = 600.0;
pub const AVATAR_SPEED: f32 = 300.0;

/// `Ack` state a client sends when it needs a full snapshot.
pub const RESYNC_REQUEST: i32 = 0;

/// A player's replicated avatar, as carried in one game-state field.
///
/// The demo simulation replicates each avatar under `field_id == id`; the field bytes
/// are the bincode encoding of this struct.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Avatar {
    pub id: u32,
    pub x: f32,
    pub y: f32,
    pub vel_x: f32,
    pub vel_y: f32,
    pub aim_x: f64,
    pub aim_y: f64,
}

impl Avatar {
    pub fn new(id: u32, x: f32, y: f32) -> Self {
        Self {
            id,
            x,
            y,
            vel_x: 0.0,
            vel_y: 0.0,
            aim_x: 0.0,
            aim_y: 0.0,
        }
    }

    pub fn to_field_bytes(&self) -> Result<Bytes, bincode::Error> {
        bincode::serialize(self).map(Bytes::from)
    }

    pub fn from_field_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Advances the avatar by `dt` seconds and keeps it inside the world.
    pub fn integrate(&mut self, dt: f32) {
        self.x = (self.x + self.vel_x * dt).clamp(0.0, WORLD_WIDTH);
        self.y = (self.y + self.vel_y * dt).clamp(0.0, WORLD_HEIGHT);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_avatar_creation() {
        let avatar = Avatar::new(1, 100.0, 200.0);
        assert_eq!(avatar.id, 1);
        assert_eq!(avatar.x, 100.0);
        assert_eq!(avatar.y, 200.0);
        assert_eq!(avatar.vel_x, 0.0);
        assert_eq!(avatar.vel_y, 0.0);
    }

    #[test]
    fn test_avatar_field_bytes_roundtrip() {
        let mut avatar = Avatar::new(7, 12.5, 40.0);
        avatar.aim_x = 0.25;
        avatar.aim_y = -1.5;

        let bytes = avatar.to_field_bytes().unwrap();
        let decoded = Avatar::from_field_bytes(&bytes).unwrap();

        assert_eq!(decoded, avatar);
    }

    #[test]
    fn test_avatar_integrate_clamps_to_world() {
        let mut avatar = Avatar::new(1, WORLD_WIDTH - 1.0, 1.0);
        avatar.vel_x = AVATAR_SPEED;
        avatar.vel_y = -AVATAR_SPEED;

        avatar.integrate(1.0);

        assert_approx_eq!(avatar.x, WORLD_WIDTH, 0.001);
        assert_approx_eq!(avatar.y, 0.0, 0.001);
    }

    #[test]
    fn test_avatar_rejects_garbage_bytes() {
        assert!(Avatar::from_field_bytes(&[1, 2, 3]).is_err());
    }
}

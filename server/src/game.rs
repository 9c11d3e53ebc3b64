use crate::network::{InputEvent, Simulation};
use bytes::Bytes;
use log::{info, warn};
use shared::{Avatar, AVATAR_SPEED, WORLD_HEIGHT, WORLD_WIDTH};
use std::collections::HashMap;

/// Demo simulation: one avatar per peer, steered with w/a/s/d and aimed with the mouse
#[derive(Debug, Clone, Default)]
pub struct World {
    pub tick: u32,
    pub avatars: HashMap<u32, Avatar>,
}

impl World {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_avatar(&mut self, peer_id: u32) {
        let spawn_x = 100.0 + (peer_id as f32 * 60.0) % (WORLD_WIDTH - 200.0);
        let spawn_y = WORLD_HEIGHT / 2.0;

        let avatar = Avatar::new(peer_id, spawn_x, spawn_y);

        info!("Added avatar {} at ({}, {})", peer_id, avatar.x, avatar.y);
        self.avatars.insert(peer_id, avatar);
    }

    pub fn remove_avatar(&mut self, peer_id: u32) {
        if self.avatars.remove(&peer_id).is_some() {
            info!("Removed avatar {}", peer_id);
        }
    }

    pub fn apply_key(&mut self, peer_id: u32, keycode: u8) {
        let Some(avatar) = self.avatars.get_mut(&peer_id) else {
            return;
        };

        match keycode {
            b'w' => (avatar.vel_x, avatar.vel_y) = (0.0, -AVATAR_SPEED),
            b's' => (avatar.vel_x, avatar.vel_y) = (0.0, AVATAR_SPEED),
            b'a' => (avatar.vel_x, avatar.vel_y) = (-AVATAR_SPEED, 0.0),
            b'd' => (avatar.vel_x, avatar.vel_y) = (AVATAR_SPEED, 0.0),
            b' ' => (avatar.vel_x, avatar.vel_y) = (0.0, 0.0),
            _ => {}
        }
    }

    pub fn apply_aim(&mut self, peer_id: u32, x: f64, y: f64) {
        if let Some(avatar) = self.avatars.get_mut(&peer_id) {
            avatar.aim_x = x;
            avatar.aim_y = y;
        }
    }
}

impl Simulation for World {
    fn peer_joined(&mut self, peer_id: u32) {
        self.add_avatar(peer_id);
    }

    fn peer_lost(&mut self, peer_id: u32) {
        self.remove_avatar(peer_id);
    }

    fn handle_input(&mut self, peer_id: u32, input: InputEvent) {
        match input {
            InputEvent::KeyStroke(keycode) => self.apply_key(peer_id, keycode),
            InputEvent::MouseMove { x, y } => self.apply_aim(peer_id, x, y),
        }
    }

    fn step(&mut self, dt: f32) {
        for avatar in self.avatars.values_mut() {
            avatar.integrate(dt);
        }
        self.tick += 1;
    }

    /// Each avatar is one field, keyed by its peer ID
    fn replicated_fields(&self) -> Vec<(u32, Bytes)> {
        self.avatars
            .values()
            .filter_map(|avatar| match avatar.to_field_bytes() {
                Ok(bytes) => Some((avatar.id, bytes)),
                Err(e) => {
                    warn!("Failed to encode avatar {}: {}", avatar.id, e);
                    None
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_peer_lifecycle() {
        let mut world = World::new();
        world.peer_joined(1);
        world.peer_joined(2);
        assert_eq!(world.avatars.len(), 2);

        world.peer_lost(1);
        assert!(!world.avatars.contains_key(&1));
        assert!(world.avatars.contains_key(&2));
    }

    #[test]
    fn test_keys_steer_avatar() {
        let mut world = World::new();
        world.peer_joined(1);
        let start_y = world.avatars[&1].y;

        world.handle_input(1, InputEvent::KeyStroke(b'w'));
        world.step(0.1);

        let avatar = &world.avatars[&1];
        assert_approx_eq!(avatar.y, start_y - AVATAR_SPEED * 0.1, 0.001);
        assert_eq!(avatar.vel_x, 0.0);
    }

    #[test]
    fn test_mouse_sets_aim() {
        let mut world = World::new();
        world.peer_joined(3);
        world.handle_input(3, InputEvent::MouseMove { x: 12.0, y: -4.5 });

        assert_eq!(world.avatars[&3].aim_x, 12.0);
        assert_eq!(world.avatars[&3].aim_y, -4.5);
    }

    #[test]
    fn test_input_for_unknown_peer_is_ignored() {
        let mut world = World::new();
        world.handle_input(7, InputEvent::KeyStroke(b'd'));
        assert!(world.avatars.is_empty());
    }

    #[test]
    fn test_replicated_fields_decode_back() {
        let mut world = World::new();
        world.peer_joined(4);

        let fields = world.replicated_fields();
        assert_eq!(fields.len(), 1);
        assert_eq!(fields[0].0, 4);

        let avatar = Avatar::from_field_bytes(&fields[0].1).unwrap();
        assert_eq!(avatar, world.avatars[&4]);
    }
}

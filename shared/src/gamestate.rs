//! Replicated world state: snapshots, per-client diffs and their application.
//!
//! The server captures one [`WorldSnapshot`] per tick and remembers, per client, the
//! newest snapshot that client acknowledged. [`GameStateManager::diff_for`] diffs the
//! current snapshot against that base, or falls back to a full snapshot when there is
//! no usable base. On the client, [`GameStateClient::apply_diff`] only accepts a diff
//! whose base it still holds and whose target is newer than what it has, so duplicated,
//! reordered or stale diffs are rejected instead of corrupting the mirror.
//!
//! Field contents are opaque bytes keyed by a numeric field id chosen by the simulation.

use crate::codec::{changes_len, DELTA_HEADER_LEN};
use bytes::Bytes;
use log::debug;
use std::collections::{BTreeMap, HashMap, VecDeque};
use thiserror::Error;

/// `base_snapshot_id` of a full snapshot. Real snapshot ids start at 1.
pub const FULL_SNAPSHOT_BASE: u32 = 0;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApplyError {
    /// The diff does not apply on top of anything this client holds, or is not newer
    /// than the snapshot already applied
    #[error("diff {base}->{target} does not apply to snapshot {current}")]
    StaleBase { base: u32, target: u32, current: u32 },
    /// The diff removes a field the base snapshot does not contain
    #[error("diff references unknown field {field_id}")]
    UnknownField { field_id: u32 },
}

/// One field-level change inside a diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldChange {
    Set { field_id: u32, bytes: Bytes },
    Remove { field_id: u32 },
}

impl FieldChange {
    pub fn field_id(&self) -> u32 {
        match self {
            FieldChange::Set { field_id, .. } | FieldChange::Remove { field_id } => *field_id,
        }
    }
}

/// Changes that advance a receiver from `base_snapshot_id` to `target_snapshot_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameStateDiff {
    pub base_snapshot_id: u32,
    pub target_snapshot_id: u32,
    pub is_full: bool,
    pub changes: Vec<FieldChange>,
}

impl GameStateDiff {
    /// Size of this diff once wrapped in a `GameStateDelta` frame.
    pub fn encoded_len(&self) -> usize {
        DELTA_HEADER_LEN + changes_len(&self.changes)
    }

    pub fn field(&self, field_id: u32) -> Option<&FieldChange> {
        self.changes.iter().find(|change| change.field_id() == field_id)
    }
}

/// A complete, versioned copy of every replicated field, ordered by field id.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WorldSnapshot {
    id: u32,
    fields: BTreeMap<u32, Bytes>,
}

impl WorldSnapshot {
    /// Builds a snapshot; when a field id repeats, the last value wins.
    pub fn new(id: u32, fields: impl IntoIterator<Item = (u32, Bytes)>) -> Self {
        Self {
            id,
            fields: fields.into_iter().collect(),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn field(&self, field_id: u32) -> Option<&Bytes> {
        self.fields.get(&field_id)
    }

    pub fn fields(&self) -> impl Iterator<Item = (u32, &Bytes)> {
        self.fields.iter().map(|(id, bytes)| (*id, bytes))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn full_diff(&self) -> GameStateDiff {
        GameStateDiff {
            base_snapshot_id: FULL_SNAPSHOT_BASE,
            target_snapshot_id: self.id,
            is_full: true,
            changes: self
                .fields
                .iter()
                .map(|(field_id, bytes)| FieldChange::Set {
                    field_id: *field_id,
                    bytes: bytes.clone(),
                })
                .collect(),
        }
    }

    /// Minimal field-level diff that turns `base` into `self`.
    pub fn diff_from(&self, base: &WorldSnapshot) -> GameStateDiff {
        let mut changes = Vec::new();

        for (field_id, bytes) in &self.fields {
            if base.fields.get(field_id) != Some(bytes) {
                changes.push(FieldChange::Set {
                    field_id: *field_id,
                    bytes: bytes.clone(),
                });
            }
        }
        for field_id in base.fields.keys() {
            if !self.fields.contains_key(field_id) {
                changes.push(FieldChange::Remove {
                    field_id: *field_id,
                });
            }
        }

        GameStateDiff {
            base_snapshot_id: base.id,
            target_snapshot_id: self.id,
            is_full: false,
            changes,
        }
    }

    /// Returns the snapshot `diff` describes, leaving `self` untouched.
    fn patched(&self, diff: &GameStateDiff) -> Result<WorldSnapshot, ApplyError> {
        let mut fields = if diff.is_full {
            BTreeMap::new()
        } else {
            self.fields.clone()
        };

        for change in &diff.changes {
            match change {
                FieldChange::Set { field_id, bytes } => {
                    fields.insert(*field_id, bytes.clone());
                }
                FieldChange::Remove { field_id } => {
                    if fields.remove(field_id).is_none() {
                        return Err(ApplyError::UnknownField {
                            field_id: *field_id,
                        });
                    }
                }
            }
        }

        Ok(WorldSnapshot {
            id: diff.target_snapshot_id,
            fields,
        })
    }
}

/// Server-side snapshot history and per-client acknowledgement tracking.
pub struct GameStateManager {
    history: VecDeque<WorldSnapshot>,
    capacity: usize,
    next_snapshot_id: u32,
    acknowledged: HashMap<u32, u32>,
}

impl GameStateManager {
    /// Creates a manager that keeps the last `history_len` snapshots (at least one).
    pub fn new(history_len: usize) -> Self {
        Self {
            history: VecDeque::with_capacity(history_len.max(1)),
            capacity: history_len.max(1),
            next_snapshot_id: FULL_SNAPSHOT_BASE + 1,
            acknowledged: HashMap::new(),
        }
    }

    /// Stores the simulation's fields as the new current snapshot.
    pub fn capture_snapshot(
        &mut self,
        fields: impl IntoIterator<Item = (u32, Bytes)>,
    ) -> &WorldSnapshot {
        let snapshot = WorldSnapshot::new(self.next_snapshot_id, fields);
        self.next_snapshot_id += 1;

        if self.history.len() == self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(snapshot);
        &self.history[self.history.len() - 1]
    }

    pub fn current(&self) -> Option<&WorldSnapshot> {
        self.history.back()
    }

    pub fn snapshot(&self, snapshot_id: u32) -> Option<&WorldSnapshot> {
        self.history.iter().find(|s| s.id == snapshot_id)
    }

    /// Diff that brings `peer_id` to the current snapshot, or `None` before the first
    /// capture.
    ///
    /// Falls back to a full snapshot when the peer never acknowledged anything, when its
    /// acknowledged snapshot left the history, or when the incremental diff would not be
    /// smaller than the full one.
    pub fn diff_for(&self, peer_id: u32) -> Option<GameStateDiff> {
        let current = self.current()?;
        let full = current.full_diff();

        let base = match self
            .acknowledged
            .get(&peer_id)
            .and_then(|id| self.snapshot(*id))
        {
            Some(base) => base,
            None => return Some(full),
        };

        let incremental = current.diff_from(base);
        if incremental.encoded_len() >= full.encoded_len() {
            debug!(
                "Diff {}->{} for peer {} not smaller than full snapshot",
                base.id, current.id, peer_id
            );
            Some(full)
        } else {
            Some(incremental)
        }
    }

    /// Records that `peer_id` holds `snapshot_id`; ids `<= 0` request a full resync.
    ///
    /// Acknowledgements never move backwards and ids that were never captured are
    /// ignored, so a late or forged ack cannot pin a peer to a wrong base.
    pub fn acknowledge(&mut self, peer_id: u32, snapshot_id: i32) {
        let snapshot_id = match u32::try_from(snapshot_id) {
            Ok(id) if id != FULL_SNAPSHOT_BASE => id,
            _ => {
                debug!("Peer {} requested a full resync", peer_id);
                self.acknowledged.remove(&peer_id);
                return;
            }
        };

        if snapshot_id >= self.next_snapshot_id {
            debug!(
                "Peer {} acknowledged future snapshot {}",
                peer_id, snapshot_id
            );
            return;
        }

        let entry = self.acknowledged.entry(peer_id).or_insert(snapshot_id);
        *entry = (*entry).max(snapshot_id);
    }

    pub fn acknowledged(&self, peer_id: u32) -> Option<u32> {
        self.acknowledged.get(&peer_id).copied()
    }

    pub fn remove_peer(&mut self, peer_id: u32) {
        self.acknowledged.remove(&peer_id);
    }
}

/// Client-side mirror of the server's world.
///
/// Keeps the last few applied snapshots so that an incremental diff computed against a
/// slightly older acknowledged snapshot still applies.
pub struct GameStateClient {
    history: VecDeque<WorldSnapshot>,
    capacity: usize,
}

impl GameStateClient {
    pub fn new(history_len: usize) -> Self {
        Self {
            history: VecDeque::with_capacity(history_len.max(1)),
            capacity: history_len.max(1),
        }
    }

    /// Id of the applied snapshot, `FULL_SNAPSHOT_BASE` if none
    pub fn current_snapshot_id(&self) -> u32 {
        self.history.back().map_or(FULL_SNAPSHOT_BASE, |s| s.id)
    }

    pub fn current(&self) -> Option<&WorldSnapshot> {
        self.history.back()
    }

    pub fn field(&self, field_id: u32) -> Option<&Bytes> {
        self.current().and_then(|snapshot| snapshot.field(field_id))
    }

    pub fn apply_diff(&mut self, diff: &GameStateDiff) -> Result<(), ApplyError> {
        let current = self.current_snapshot_id();
        let stale = ApplyError::StaleBase {
            base: diff.base_snapshot_id,
            target: diff.target_snapshot_id,
            current,
        };

        if diff.target_snapshot_id <= current {
            return Err(stale);
        }

        let next = if diff.is_full {
            if diff.base_snapshot_id != FULL_SNAPSHOT_BASE {
                return Err(stale);
            }
            WorldSnapshot::default().patched(diff)?
        } else {
            match self
                .history
                .iter()
                .find(|s| s.id == diff.base_snapshot_id)
            {
                Some(base) => base.patched(diff)?,
                None => return Err(stale),
            }
        };

        if self.history.len() == self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(next);
        Ok(())
    }

    /// Forgets everything, e.g. before connecting to another server.
    pub fn reset(&mut self) {
        self.history.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(value: &[u8]) -> Bytes {
        Bytes::copy_from_slice(value)
    }

    fn client_at(snapshot_id: u32, fields: Vec<(u32, Bytes)>) -> GameStateClient {
        let mut client = GameStateClient::new(8);
        let snapshot = WorldSnapshot::new(snapshot_id, fields);
        client.apply_diff(&snapshot.full_diff()).unwrap();
        client
    }

    #[test]
    fn test_capture_assigns_increasing_ids() {
        let mut manager = GameStateManager::new(4);
        assert_eq!(manager.capture_snapshot(vec![]).id(), 1);
        assert_eq!(manager.capture_snapshot(vec![]).id(), 2);
        assert_eq!(manager.current().unwrap().id(), 2);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut manager = GameStateManager::new(2);
        for _ in 0..5 {
            manager.capture_snapshot(vec![]);
        }
        assert!(manager.snapshot(3).is_none());
        assert!(manager.snapshot(4).is_some());
        assert!(manager.snapshot(5).is_some());
    }

    #[test]
    fn test_diff_for_unacknowledged_peer_is_full() {
        let mut manager = GameStateManager::new(4);
        manager.capture_snapshot(vec![(10, bytes(&[1])), (11, bytes(&[2]))]);

        let diff = manager.diff_for(7).unwrap();
        assert!(diff.is_full);
        assert_eq!(diff.base_snapshot_id, FULL_SNAPSHOT_BASE);
        assert_eq!(diff.target_snapshot_id, 1);
        assert_eq!(diff.changes.len(), 2);
    }

    #[test]
    fn test_diff_for_before_capture() {
        let manager = GameStateManager::new(4);
        assert!(manager.diff_for(1).is_none());
    }

    #[test]
    fn test_incremental_diff_after_ack() {
        let mut manager = GameStateManager::new(4);
        let big = bytes(&[0u8; 64]);
        manager.capture_snapshot(vec![(1, big.clone()), (2, big.clone()), (3, bytes(&[1]))]);
        manager.acknowledge(9, 1);
        manager.capture_snapshot(vec![(1, big.clone()), (2, big), (3, bytes(&[2]))]);

        let diff = manager.diff_for(9).unwrap();
        assert!(!diff.is_full);
        assert_eq!(diff.base_snapshot_id, 1);
        assert_eq!(diff.target_snapshot_id, 2);
        assert_eq!(
            diff.changes,
            vec![FieldChange::Set {
                field_id: 3,
                bytes: bytes(&[2]),
            }]
        );
    }

    #[test]
    fn test_removed_field_appears_in_diff() {
        let mut manager = GameStateManager::new(4);
        let big = bytes(&[7u8; 32]);
        manager.capture_snapshot(vec![(1, big.clone()), (2, bytes(&[1]))]);
        manager.acknowledge(1, 1);
        manager.capture_snapshot(vec![(1, big)]);

        let diff = manager.diff_for(1).unwrap();
        assert!(!diff.is_full);
        assert_eq!(diff.changes, vec![FieldChange::Remove { field_id: 2 }]);
    }

    #[test]
    fn test_larger_incremental_falls_back_to_full() {
        let mut manager = GameStateManager::new(4);
        manager.capture_snapshot(vec![(1, bytes(&[1])), (2, bytes(&[2]))]);
        manager.acknowledge(1, 1);
        // every field replaced or removed: the incremental diff carries removals too
        manager.capture_snapshot(vec![(3, bytes(&[3]))]);

        let diff = manager.diff_for(1).unwrap();
        assert!(diff.is_full);
    }

    #[test]
    fn test_equal_size_prefers_full() {
        let mut manager = GameStateManager::new(4);
        manager.capture_snapshot(vec![(1, bytes(&[1]))]);
        manager.acknowledge(1, 1);
        manager.capture_snapshot(vec![(1, bytes(&[2]))]);

        // a single changed field encodes exactly like the full snapshot
        let diff = manager.diff_for(1).unwrap();
        assert!(diff.is_full);
    }

    #[test]
    fn test_ack_evicted_from_history_falls_back_to_full() {
        let mut manager = GameStateManager::new(2);
        manager.capture_snapshot(vec![(1, bytes(&[0u8; 16]))]);
        manager.acknowledge(1, 1);
        manager.capture_snapshot(vec![(1, bytes(&[0u8; 16]))]);
        manager.capture_snapshot(vec![(1, bytes(&[0u8; 16]))]);

        assert!(manager.diff_for(1).unwrap().is_full);
    }

    #[test]
    fn test_acknowledge_never_moves_backwards() {
        let mut manager = GameStateManager::new(4);
        for _ in 0..3 {
            manager.capture_snapshot(vec![]);
        }
        manager.acknowledge(1, 3);
        manager.acknowledge(1, 2);
        assert_eq!(manager.acknowledged(1), Some(3));

        manager.acknowledge(1, 99);
        assert_eq!(manager.acknowledged(1), Some(3));
    }

    #[test]
    fn test_resync_request_forgets_ack() {
        let mut manager = GameStateManager::new(4);
        manager.capture_snapshot(vec![(1, bytes(&[0u8; 16]))]);
        manager.acknowledge(1, 1);
        manager.acknowledge(1, 0);
        assert_eq!(manager.acknowledged(1), None);

        manager.capture_snapshot(vec![(1, bytes(&[0u8; 16]))]);
        assert!(manager.diff_for(1).unwrap().is_full);
    }

    #[test]
    fn test_negative_ack_is_a_resync_request() {
        let mut manager = GameStateManager::new(4);
        manager.capture_snapshot(vec![]);
        manager.acknowledge(1, 1);

        manager.acknowledge(1, i32::MIN);
        assert_eq!(manager.acknowledged(1), None);
    }

    #[test]
    fn test_remove_peer() {
        let mut manager = GameStateManager::new(4);
        manager.capture_snapshot(vec![]);
        manager.acknowledge(4, 1);
        manager.remove_peer(4);
        assert_eq!(manager.acknowledged(4), None);
    }

    #[test]
    fn test_apply_diff_advances_then_rejects_duplicate() {
        let mut client = client_at(5, vec![(10, bytes(&[1]))]);
        let diff = GameStateDiff {
            base_snapshot_id: 5,
            target_snapshot_id: 6,
            is_full: false,
            changes: vec![FieldChange::Set {
                field_id: 10,
                bytes: bytes(&[2]),
            }],
        };

        assert_eq!(client.apply_diff(&diff), Ok(()));
        assert_eq!(client.current_snapshot_id(), 6);
        assert_eq!(client.field(10), Some(&bytes(&[2])));

        assert_eq!(
            client.apply_diff(&diff),
            Err(ApplyError::StaleBase {
                base: 5,
                target: 6,
                current: 6,
            })
        );
        assert_eq!(client.current_snapshot_id(), 6);
    }

    #[test]
    fn test_apply_diff_unknown_base_rejected() {
        let mut client = client_at(5, vec![(10, bytes(&[1]))]);
        let diff = GameStateDiff {
            base_snapshot_id: 3,
            target_snapshot_id: 7,
            is_full: false,
            changes: vec![],
        };
        assert!(matches!(
            client.apply_diff(&diff),
            Err(ApplyError::StaleBase { .. })
        ));
        assert_eq!(client.current_snapshot_id(), 5);
    }

    #[test]
    fn test_apply_diff_against_older_retained_base() {
        let mut client = client_at(5, vec![(10, bytes(&[1])), (11, bytes(&[9]))]);
        client
            .apply_diff(&GameStateDiff {
                base_snapshot_id: 5,
                target_snapshot_id: 6,
                is_full: false,
                changes: vec![FieldChange::Set {
                    field_id: 10,
                    bytes: bytes(&[2]),
                }],
            })
            .unwrap();

        // the server only knew about 5 when it built this one
        client
            .apply_diff(&GameStateDiff {
                base_snapshot_id: 5,
                target_snapshot_id: 7,
                is_full: false,
                changes: vec![FieldChange::Set {
                    field_id: 11,
                    bytes: bytes(&[3]),
                }],
            })
            .unwrap();

        assert_eq!(client.current_snapshot_id(), 7);
        assert_eq!(client.field(10), Some(&bytes(&[1])));
        assert_eq!(client.field(11), Some(&bytes(&[3])));
    }

    #[test]
    fn test_apply_diff_unknown_field_is_atomic() {
        let mut client = client_at(1, vec![(10, bytes(&[1]))]);
        let diff = GameStateDiff {
            base_snapshot_id: 1,
            target_snapshot_id: 2,
            is_full: false,
            changes: vec![
                FieldChange::Set {
                    field_id: 10,
                    bytes: bytes(&[5]),
                },
                FieldChange::Remove { field_id: 99 },
            ],
        };

        assert_eq!(
            client.apply_diff(&diff),
            Err(ApplyError::UnknownField { field_id: 99 })
        );
        assert_eq!(client.current_snapshot_id(), 1);
        assert_eq!(client.field(10), Some(&bytes(&[1])));
    }

    #[test]
    fn test_full_snapshot_replaces_mirror() {
        let mut client = client_at(1, vec![(10, bytes(&[1])), (11, bytes(&[1]))]);
        let full = WorldSnapshot::new(4, vec![(12, bytes(&[4]))]).full_diff();

        client.apply_diff(&full).unwrap();

        assert_eq!(client.current_snapshot_id(), 4);
        assert!(client.field(10).is_none());
        assert_eq!(client.field(12), Some(&bytes(&[4])));
    }

    #[test]
    fn test_old_full_snapshot_rejected() {
        let mut client = client_at(4, vec![]);
        let old = WorldSnapshot::new(3, vec![]).full_diff();
        assert!(matches!(
            client.apply_diff(&old),
            Err(ApplyError::StaleBase { .. })
        ));
    }

    #[test]
    fn test_server_diff_applies_on_client() {
        let mut manager = GameStateManager::new(8);
        let mut client = GameStateClient::new(8);
        let payload = bytes(&[0u8; 32]);

        manager.capture_snapshot(vec![(1, payload.clone()), (2, payload.clone())]);
        client.apply_diff(&manager.diff_for(1).unwrap()).unwrap();
        manager.acknowledge(1, client.current_snapshot_id() as i32);

        manager.capture_snapshot(vec![(1, payload.clone()), (3, bytes(&[3]))]);
        let diff = manager.diff_for(1).unwrap();
        assert!(!diff.is_full);
        client.apply_diff(&diff).unwrap();

        assert_eq!(client.current(), manager.current());
    }

    #[test]
    fn test_reset() {
        let mut client = client_at(3, vec![(1, bytes(&[1]))]);
        client.reset();
        assert_eq!(client.current_snapshot_id(), FULL_SNAPSHOT_BASE);
        assert!(client.field(1).is_none());
    }
}

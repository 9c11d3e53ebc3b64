//! Splitting payloads that do not fit in one datagram, and putting them back together.

use crate::transport::Fragment;
use bytes::{Bytes, BytesMut};
use log::debug;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Largest payload carried by a single datagram.
pub const MAX_FRAGMENT_PAYLOAD: usize = 1200;

/// Most pieces one payload may be split into.
pub const MAX_FRAGMENTS: usize = 1024;

/// Largest payload a connection accepts for sending.
pub const MAX_PAYLOAD: usize = MAX_FRAGMENT_PAYLOAD * MAX_FRAGMENTS;

/// Payloads being reassembled at once; the oldest is dropped beyond this.
const MAX_PENDING_GROUPS: usize = 16;

/// One datagram's share of a payload: the whole of it, or one fragment.
pub type Piece = (Option<Fragment>, Bytes);

/// Cuts `payload` into datagram-sized pieces.
///
/// A payload that fits is returned whole, without a fragment header. Callers check
/// [`MAX_PAYLOAD`] first.
pub fn split(payload: Bytes, group: u32) -> Vec<Piece> {
    if payload.len() <= MAX_FRAGMENT_PAYLOAD {
        return vec![(None, payload)];
    }

    let count = payload.len().div_ceil(MAX_FRAGMENT_PAYLOAD);
    (0..count)
        .map(|index| {
            let start = index * MAX_FRAGMENT_PAYLOAD;
            let end = (start + MAX_FRAGMENT_PAYLOAD).min(payload.len());
            let fragment = Fragment {
                group,
                index: index as u16,
                count: count as u16,
            };
            (Some(fragment), payload.slice(start..end))
        })
        .collect()
}

struct Partial {
    pieces: Vec<Option<Bytes>>,
    missing: usize,
    started: Instant,
}

/// Collects fragments per group until every piece of a payload has arrived.
#[derive(Default)]
pub struct Reassembler {
    pending: HashMap<u32, Partial>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores one piece; returns the whole payload once its last piece arrives.
    ///
    /// Duplicates are ignored. A piece whose count disagrees with earlier pieces of the
    /// same group restarts that group.
    pub fn insert(&mut self, fragment: Fragment, chunk: Bytes, now: Instant) -> Option<Bytes> {
        let count = usize::from(fragment.count);
        if count > MAX_FRAGMENTS || usize::from(fragment.index) >= count {
            debug!("Dropping invalid fragment of group {}", fragment.group);
            return None;
        }

        if self
            .pending
            .get(&fragment.group)
            .is_some_and(|partial| partial.pieces.len() != count)
        {
            self.pending.remove(&fragment.group);
        }
        if !self.pending.contains_key(&fragment.group) {
            self.make_room();
        }

        let partial = self.pending.entry(fragment.group).or_insert_with(|| Partial {
            pieces: vec![None; count],
            missing: count,
            started: now,
        });

        let slot = &mut partial.pieces[usize::from(fragment.index)];
        if slot.is_none() {
            *slot = Some(chunk);
            partial.missing -= 1;
        }
        if partial.missing > 0 {
            return None;
        }

        let partial = self.pending.remove(&fragment.group)?;
        let mut whole = BytesMut::new();
        for piece in partial.pieces.into_iter().flatten() {
            whole.extend_from_slice(&piece);
        }
        Some(whole.freeze())
    }

    /// Forgets groups that started more than `max_age` ago.
    pub fn expire(&mut self, now: Instant, max_age: Duration) {
        self.pending
            .retain(|_, partial| now.duration_since(partial.started) < max_age);
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    fn make_room(&mut self) {
        while self.pending.len() >= MAX_PENDING_GROUPS {
            let oldest = self
                .pending
                .iter()
                .min_by_key(|(_, partial)| partial.started)
                .map(|(group, _)| *group);
            match oldest {
                Some(group) => {
                    debug!("Dropping incomplete fragment group {}", group);
                    self.pending.remove(&group);
                }
                None => break,
            }
        }
    }
}

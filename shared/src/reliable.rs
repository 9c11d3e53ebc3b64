//! Sequencing, acknowledgement and retransmission for reliable frames.

use crate::fragment::Piece;
use crate::transport::{Fragment, Frame};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// How far ahead of the next expected sequence number frames are buffered.
pub const RECEIVE_WINDOW: u32 = 1024;

#[derive(Debug)]
struct InFlight {
    fragment: Option<Fragment>,
    payload: Bytes,
    last_sent: Instant,
    attempts: u32,
}

/// A reliable frame was resent `max_retransmits` times without an acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetransmitExhausted {
    pub seq: u32,
}

/// Both directions of one connection's reliable, ordered stream.
#[derive(Debug, Default)]
pub struct ReliableChannel {
    next_seq: u32,
    in_flight: BTreeMap<u32, InFlight>,
    next_expected: u32,
    out_of_order: BTreeMap<u32, Piece>,
}

impl ReliableChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assigns the next sequence number to a piece and tracks it until acknowledged.
    pub fn prepare(&mut self, (fragment, payload): Piece, now: Instant) -> Frame {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        self.in_flight.insert(
            seq,
            InFlight {
                fragment,
                payload: payload.clone(),
                last_sent: now,
                attempts: 0,
            },
        );
        Frame::Reliable {
            seq,
            fragment,
            payload,
        }
    }

    /// Returns false for unknown or already acknowledged sequence numbers.
    pub fn acknowledge(&mut self, seq: u32) -> bool {
        self.in_flight.remove(&seq).is_some()
    }

    /// Frames whose last send is older than `interval`, marked as sent again.
    pub fn due_for_resend(
        &mut self,
        now: Instant,
        interval: Duration,
        max_retransmits: u32,
    ) -> Result<Vec<Frame>, RetransmitExhausted> {
        let mut due = Vec::new();
        for (seq, entry) in self.in_flight.iter_mut() {
            if now.duration_since(entry.last_sent) < interval {
                continue;
            }
            if entry.attempts >= max_retransmits {
                return Err(RetransmitExhausted { seq: *seq });
            }
            entry.attempts += 1;
            entry.last_sent = now;
            due.push(Frame::Reliable {
                seq: *seq,
                fragment: entry.fragment,
                payload: entry.payload.clone(),
            });
        }
        Ok(due)
    }

    /// Accepts an inbound reliable frame.
    ///
    /// Returns `None` if the frame is too far ahead to buffer (it must not be
    /// acknowledged), otherwise the pieces that are now deliverable in order. A
    /// duplicate yields an empty list but should still be acknowledged, since the
    /// sender evidently missed the first acknowledgement.
    pub fn receive(&mut self, seq: u32, piece: Piece) -> Option<Vec<Piece>> {
        let offset = seq.wrapping_sub(self.next_expected);
        if offset >= RECEIVE_WINDOW {
            // behind the window means already delivered
            return if offset > u32::MAX / 2 {
                Some(Vec::new())
            } else {
                None
            };
        }

        self.out_of_order.entry(seq).or_insert(piece);

        let mut released = Vec::new();
        while let Some(piece) = self.out_of_order.remove(&self.next_expected) {
            released.push(piece);
            self.next_expected = self.next_expected.wrapping_add(1);
        }
        Some(released)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}

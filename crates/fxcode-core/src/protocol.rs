//! Sequenced delivery state that survives socket churn.
//!
//! Each side numbers the `Regular` frames it sends, keeps them until the peer
//! acknowledges them, and replays whatever is still unacknowledged after a
//! reconnect. Receivers drop anything they have already seen.

use crate::messages::{Frame, Payload};
use std::collections::VecDeque;

/// Unacknowledged frames beyond this count are dropped oldest-first.
pub const MAX_UNACKED: usize = 10_000;

#[derive(Debug, Default)]
pub struct PersistentProtocol {
    next_seq: u64,
    unacked: VecDeque<(u64, Payload)>,
    last_received: u64,
}

impl PersistentProtocol {
    pub fn new() -> Self {
        Self {
            next_seq: 1,
            unacked: VecDeque::new(),
            last_received: 0,
        }
    }

    /// Assign the next sequence number to `payload` and retain it for replay.
    pub fn enqueue(&mut self, payload: Payload) -> Frame {
        let seq = self.next_seq;
        self.next_seq += 1;
        if self.unacked.len() >= MAX_UNACKED {
            self.unacked.pop_front();
        }
        self.unacked.push_back((seq, payload.clone()));
        Frame::Regular {
            seq,
            ack: self.last_received,
            payload,
        }
    }

    /// Forget every retained frame with `seq <= ack`.
    pub fn acknowledge(&mut self, ack: u64) {
        while self.unacked.front().is_some_and(|(seq, _)| *seq <= ack) {
            self.unacked.pop_front();
        }
    }

    /// Record an incoming `Regular` frame. Returns the payload unless it is a
    /// duplicate of something already delivered.
    pub fn accept(&mut self, seq: u64, ack: u64, payload: Payload) -> Option<Payload> {
        self.acknowledge(ack);
        if seq <= self.last_received {
            return None;
        }
        self.last_received = seq;
        Some(payload)
    }

    /// Frame acknowledging everything received so far.
    pub fn ack_frame(&self) -> Frame {
        Frame::Ack {
            ack: self.last_received,
        }
    }

    /// Every unacknowledged frame, oldest first, stamped with the current ack.
    pub fn replay(&self) -> Vec<Frame> {
        self.unacked
            .iter()
            .map(|(seq, payload)| Frame::Regular {
                seq: *seq,
                ack: self.last_received,
                payload: payload.clone(),
            })
            .collect()
    }

    pub fn last_received(&self) -> u64 {
        self.last_received
    }

    pub fn unacknowledged(&self) -> usize {
        self.unacked.len()
    }
}

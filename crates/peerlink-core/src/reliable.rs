//! Reliable-delivery overlay
//!
//! Sequence/ack framing for channels that may drop or reorder messages.
//! The overlay is a pure state machine: the caller moves frames to and from
//! the channel and drives retransmission from a timer.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
enum ReliableFrame {
    Data { seq: u64, body: Bytes },
    Ack { seq: u64 },
}

/// What the caller should do after receiving a frame
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Received {
    /// Acknowledgement to send back on the channel
    pub ack: Option<Bytes>,
    /// Bodies now deliverable, in send order
    pub delivered: Vec<Bytes>,
}

/// Per-connection overlay state
#[derive(Debug, Default)]
pub struct ReliableOverlay {
    next_seq: u64,
    unacked: BTreeMap<u64, Bytes>,
    expected: u64,
    out_of_order: BTreeMap<u64, Bytes>,
}

impl ReliableOverlay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an outgoing body, returning the frame to put on the channel.
    /// The frame is kept until acknowledged.
    pub fn wrap(&mut self, body: Bytes) -> Result<Bytes> {
        let seq = self.next_seq;
        self.next_seq += 1;
        let frame = Bytes::from(rmp_serde::to_vec(&ReliableFrame::Data { seq, body })?);
        self.unacked.insert(seq, frame.clone());
        Ok(frame)
    }

    /// Process a frame read from the channel
    pub fn receive(&mut self, frame: &[u8]) -> Result<Received> {
        match rmp_serde::from_slice::<ReliableFrame>(frame)? {
            ReliableFrame::Ack { seq } => {
                self.unacked.remove(&seq);
                Ok(Received::default())
            }
            ReliableFrame::Data { seq, body } => {
                let ack = Some(Bytes::from(rmp_serde::to_vec(&ReliableFrame::Ack { seq })?));
                let mut delivered = Vec::new();

                if seq == self.expected {
                    delivered.push(body);
                    self.expected += 1;
                    while let Some(next) = self.out_of_order.remove(&self.expected) {
                        delivered.push(next);
                        self.expected += 1;
                    }
                } else if seq > self.expected {
                    self.out_of_order.entry(seq).or_insert(body);
                }
                // seq < expected: already delivered, ack again

                Ok(Received { ack, delivered })
            }
        }
    }

    /// Frames still waiting for an acknowledgement, oldest first
    pub fn retransmissions(&self) -> Vec<Bytes> {
        self.unacked.values().cloned().collect()
    }

    pub fn has_unacked(&self) -> bool {
        !self.unacked.is_empty()
    }
}

//! Chunk splitting and reassembly
//!
//! Payloads larger than a channel's transmission unit are split into a
//! chunk group. Every chunk carries the group id, its index and the group
//! size so the receiver can put the payload back together no matter the
//! order in which the pieces arrive.

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{Error, Result};

/// Upper bound on the number of chunks accepted for one group
pub const MAX_CHUNKS_PER_GROUP: u32 = 65_536;

/// One fragment of a chunk group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Chunk-group id, unique per sender
    pub group: u32,
    /// Index within the group
    pub n: u32,
    /// Number of chunks in the group
    pub total: u32,
    pub data: Bytes,
}

/// Split `payload` into chunks of at most `mtu` bytes.
///
/// An empty payload still produces one (empty) chunk.
pub fn split(group: u32, payload: &Bytes, mtu: usize) -> Vec<Chunk> {
    let mtu = mtu.max(1);
    let total = payload.len().div_ceil(mtu).max(1) as u32;

    (0..total)
        .map(|n| {
            let start = n as usize * mtu;
            let end = (start + mtu).min(payload.len());
            Chunk {
                group,
                n,
                total,
                data: payload.slice(start..end),
            }
        })
        .collect()
}

struct Partial {
    parts: Vec<Option<Bytes>>,
    received: u32,
    size: usize,
}

/// Receiver-side reassembly table keyed by chunk-group id
#[derive(Default)]
pub struct Reassembler {
    groups: HashMap<u32, Partial>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept one chunk. Returns the full payload once every chunk of its
    /// group has been received.
    pub fn push(&mut self, chunk: Chunk) -> Result<Option<Bytes>> {
        if chunk.total == 0 || chunk.total > MAX_CHUNKS_PER_GROUP {
            return Err(Error::MalformedChunk(format!(
                "group {} declares {} chunks",
                chunk.group, chunk.total
            )));
        }
        if chunk.n >= chunk.total {
            return Err(Error::MalformedChunk(format!(
                "chunk {} out of range for group {} of {}",
                chunk.n, chunk.group, chunk.total
            )));
        }

        let partial = self.groups.entry(chunk.group).or_insert_with(|| Partial {
            parts: vec![None; chunk.total as usize],
            received: 0,
            size: 0,
        });

        if partial.parts.len() != chunk.total as usize {
            let expected = partial.parts.len();
            self.groups.remove(&chunk.group);
            return Err(Error::MalformedChunk(format!(
                "group {} changed size from {} to {}",
                chunk.group, expected, chunk.total
            )));
        }

        let slot = &mut partial.parts[chunk.n as usize];
        if slot.is_some() {
            // duplicate
            return Ok(None);
        }
        partial.size += chunk.data.len();
        *slot = Some(chunk.data);
        partial.received += 1;

        if partial.received < chunk.total {
            return Ok(None);
        }

        let Some(partial) = self.groups.remove(&chunk.group) else {
            return Ok(None);
        };
        let mut out = BytesMut::with_capacity(partial.size);
        for part in partial.parts.into_iter().flatten() {
            out.extend_from_slice(&part);
        }
        Ok(Some(out.freeze()))
    }

    /// Number of groups still waiting for chunks
    pub fn pending_groups(&self) -> usize {
        self.groups.len()
    }

    /// Drop every incomplete group
    pub fn clear(&mut self) {
        self.groups.clear();
    }
}

//! Bounded free-list pools of packet and admitted-batch slots.
//!
//! Grounded in the same ring primitive as everything else (spec §9: "Use
//! bounded MPMC rings as the only mutable sharing"): a mempool is simply an
//! [`Ring<PacketIdx, Mpmc>`](crate::ring::Ring) pre-loaded with every index,
//! plus the [`PacketArena`] that the indices address. `get`/`put` never
//! block, matching spec §4.1's mempool contract.

use crate::packet::{EndpointId, FlowId, PacketArena, PacketIdx};
use crate::ring::{Mpmc, Ring};

/// Mempool of packet slots, backed by a [`PacketArena`].
pub struct PacketMempool {
    free: Ring<PacketIdx, Mpmc>,
    arena_capacity: usize,
}

impl PacketMempool {
    pub fn new(capacity: usize) -> (Self, PacketArena) {
        let free = Ring::new(capacity);
        for i in 0..capacity as u32 {
            free.enqueue(PacketIdx(i))
                .expect("freshly sized ring has room for every index");
        }
        (
            PacketMempool {
                free,
                arena_capacity: capacity,
            },
            PacketArena::new(capacity),
        )
    }

    pub fn capacity(&self) -> usize {
        self.arena_capacity
    }

    /// Number of slots currently free (i.e. not held by any packet in
    /// flight). Used by packet-conservation checks (spec §8, property 1).
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Allocate a slot and initialize it. `None` on exhaustion (`EMPTY`).
    pub fn get(
        &self,
        arena: &PacketArena,
        src: EndpointId,
        dst: EndpointId,
        flow: FlowId,
    ) -> Option<PacketIdx> {
        let idx = self.free.dequeue()?;
        arena.init(idx, src, dst, flow);
        Some(idx)
    }

    /// Return a slot to the pool. Always succeeds.
    pub fn put(&self, idx: PacketIdx) {
        self.free.enqueue(idx).unwrap_or_else(|_| {
            panic!("packet mempool over-filled: more packets freed than allocated")
        });
    }
}

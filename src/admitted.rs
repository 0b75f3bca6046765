//! Admitted batches: the fixed-capacity set of admit/drop edges emitted to
//! the allocator once per timeslot (spec §3, §4.5).

use crate::packet::{EndpointId, FlowId};
use crate::ring::{Mpmc, Ring};

/// Number of edges held by one admitted batch before it must be flushed.
pub const EMU_ADMITS_PER_ADMITTED: usize = 128;

/// One admission decision for a (src, dst) pair of a given flow.
#[derive(Debug, Clone, Copy)]
pub struct AdmittedEdge {
    pub src: EndpointId,
    pub dst: EndpointId,
    pub flow: FlowId,
    pub dropped: bool,
}

/// A fixed-capacity array of edges, flushed to the allocator when full or
/// at the end of a timeslot. `size <= EMU_ADMITS_PER_ADMITTED` always.
///
/// `Copy` so a drainer can hand the caller an owned snapshot of a batch's
/// edges while recycling the original `Box<AdmittedBatch>` straight back to
/// [`AdmittedMempool`] (see `Emulation::run`'s drain loop).
#[derive(Clone, Copy)]
pub struct AdmittedBatch {
    edges: [AdmittedEdge; EMU_ADMITS_PER_ADMITTED],
    size: usize,
}

impl AdmittedBatch {
    fn empty() -> Self {
        AdmittedBatch {
            edges: [AdmittedEdge {
                src: EndpointId(0),
                dst: EndpointId(0),
                flow: FlowId(0),
                dropped: false,
            }; EMU_ADMITS_PER_ADMITTED],
            size: 0,
        }
    }

    pub fn reset(&mut self) {
        self.size = 0;
    }

    pub fn is_full(&self) -> bool {
        self.size == EMU_ADMITS_PER_ADMITTED
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn edges(&self) -> &[AdmittedEdge] {
        &self.edges[..self.size]
    }

    /// Append an edge. Panics if already full -- callers must flush once
    /// `is_full()` returns true (spec §3's invariant `size <=
    /// EMU_ADMITS_PER_ADMITTED` must never be crossed, only reached).
    pub fn push(&mut self, edge: AdmittedEdge) {
        assert!(!self.is_full(), "admitted batch overflowed its fixed capacity");
        self.edges[self.size] = edge;
        self.size += 1;
    }
}

/// Mempool of pre-allocated admitted batches, so `flush()` never allocates
/// on the hot path (spec §4.5).
pub struct AdmittedMempool {
    free: Ring<Box<AdmittedBatch>, Mpmc>,
}

impl AdmittedMempool {
    pub fn new(capacity: usize) -> Self {
        let free = Ring::new(capacity);
        for _ in 0..capacity {
            free.enqueue(Box::new(AdmittedBatch::empty()))
                .expect("freshly sized ring has room for every slot");
        }
        AdmittedMempool { free }
    }

    pub fn get(&self) -> Option<Box<AdmittedBatch>> {
        self.free.dequeue().map(|mut batch| {
            batch.reset();
            batch
        })
    }

    pub fn put(&self, batch: Box<AdmittedBatch>) {
        self.free
            .enqueue(batch)
            .unwrap_or_else(|_| panic!("admitted mempool over-filled"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_bound_enforced() {
        let mut batch = AdmittedBatch::empty();
        for _ in 0..EMU_ADMITS_PER_ADMITTED {
            batch.push(AdmittedEdge {
                src: EndpointId(0),
                dst: EndpointId(1),
                flow: FlowId(0),
                dropped: false,
            });
        }
        assert!(batch.is_full());
        assert_eq!(batch.size(), EMU_ADMITS_PER_ADMITTED);
    }

    #[test]
    fn mempool_reinit_clears_size() {
        let pool = AdmittedMempool::new(1);
        let mut batch = pool.get().unwrap();
        batch.push(AdmittedEdge {
            src: EndpointId(0),
            dst: EndpointId(1),
            flow: FlowId(0),
            dropped: false,
        });
        pool.put(batch);

        let batch = pool.get().unwrap();
        assert_eq!(batch.size(), 0);
    }
}

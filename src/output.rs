//! The per-core admitted-batch sink (spec §4.5).
//!
//! `EmulationOutput` owns the in-construction [`AdmittedBatch`] for its core
//! and is never shared between cores (spec §4.5's invariant). `flush()` is
//! one of exactly two blocking points in the whole emulator (spec §5): it
//! spins on the output ring and on the admitted mempool, counting
//! `wait_for_admitted_enqueue`/`admitted_alloc_failed` while it does, so a
//! slow allocator shows up in stats rather than losing admitted traffic.

use log::warn;

use crate::admitted::{AdmittedBatch, AdmittedEdge, AdmittedMempool};
use crate::mempool::PacketMempool;
use crate::packet::PacketArena;
use crate::packet::PacketIdx;
use crate::ring::{Mpmc, Ring};
use crate::stats::CoreStats;

pub struct EmulationOutput<'a> {
    q_admitted_out: &'a Ring<Box<AdmittedBatch>, Mpmc>,
    admitted_mempool: &'a AdmittedMempool,
    /// Always `Some` between calls; only `None` transiently inside
    /// `flush()` while the batch is in flight to `q_admitted_out`.
    current: Option<Box<AdmittedBatch>>,
}

impl<'a> EmulationOutput<'a> {
    pub fn new(
        q_admitted_out: &'a Ring<Box<AdmittedBatch>, Mpmc>,
        admitted_mempool: &'a AdmittedMempool,
    ) -> Self {
        let current = admitted_mempool
            .get()
            .expect("admitted mempool must be sized to cover every live core at startup");
        EmulationOutput {
            q_admitted_out,
            admitted_mempool,
            current: Some(current),
        }
    }

    #[inline]
    fn current_mut(&mut self) -> &mut AdmittedBatch {
        self.current.as_mut().expect("current batch present between calls")
    }

    /// Admit a packet: record an `Admitted` edge and return its slot to the
    /// packet mempool.
    pub fn admit(
        &mut self,
        idx: PacketIdx,
        arena: &PacketArena,
        packet_mempool: &PacketMempool,
        stats: &mut CoreStats,
    ) {
        let cell = arena.get(idx);
        self.current_mut().push(AdmittedEdge {
            src: cell.src,
            dst: cell.dst,
            flow: cell.flow,
            dropped: false,
        });
        stats.admitted += 1;
        if self.current_mut().is_full() {
            self.flush(stats);
        }
        packet_mempool.put(idx);
    }

    /// Drop a packet: record a `Dropped` edge and return its slot to the
    /// packet mempool.
    pub fn drop_packet(
        &mut self,
        idx: PacketIdx,
        arena: &PacketArena,
        packet_mempool: &PacketMempool,
        stats: &mut CoreStats,
    ) {
        let cell = arena.get(idx);
        self.current_mut().push(AdmittedEdge {
            src: cell.src,
            dst: cell.dst,
            flow: cell.flow,
            dropped: true,
        });
        stats.dropped += 1;
        if self.current_mut().is_full() {
            self.flush(stats);
        }
        packet_mempool.put(idx);
    }

    /// Free a packet directly, bypassing admit/drop. Used only by
    /// `EndpointGroup::reset` (spec §4.2): reset drops are silent, i.e.
    /// never reported as an admitted-batch edge.
    pub fn free_packet(&self, idx: PacketIdx, packet_mempool: &PacketMempool) {
        packet_mempool.put(idx);
    }

    /// Flush the current batch and allocate a fresh one. Blocks (spins)
    /// until both the enqueue and the allocation succeed -- this is the
    /// back-pressure point named in spec §5.
    pub fn flush(&mut self, stats: &mut CoreStats) {
        if self.current_mut().size() == 0 {
            return;
        }
        let mut outgoing = self.current.take().expect("current batch present between calls");
        loop {
            match self.q_admitted_out.enqueue(outgoing) {
                Ok(()) => break,
                Err(rejected) => {
                    stats.wait_for_admitted_enqueue += 1;
                    outgoing = rejected;
                    warn!("q_admitted_out full, spinning (back-pressure)");
                }
            }
        }
        let next = loop {
            match self.admitted_mempool.get() {
                Some(batch) => break batch,
                None => {
                    stats.admitted_alloc_failed += 1;
                }
            }
        };
        self.current = Some(next);
    }
}

impl Drop for EmulationOutput<'_> {
    fn drop(&mut self) {
        if let Some(batch) = self.current.take() {
            self.admitted_mempool.put(batch);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admitted::EMU_ADMITS_PER_ADMITTED;
    use crate::packet::{EndpointId, FlowId};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::thread;
    use std::time::Duration;

    /// Spec §8 scenario 5: a one-slot `q_admitted_out` forces the producer
    /// to spin in `flush()` until a slow consumer drains it, and every
    /// admitted edge must still make it out (no losses under back-pressure).
    #[test]
    fn flush_spins_under_back_pressure_without_losing_edges() {
        let out_ring: Ring<Box<AdmittedBatch>, Mpmc> = Ring::new(1);
        let admitted_pool = AdmittedMempool::new(2);
        let (packet_pool, arena) = PacketMempool::new(4);
        let waited = AtomicU64::new(0);
        let total_edges = AtomicU64::new(0);

        let admits = EMU_ADMITS_PER_ADMITTED * 3 + 10;

        thread::scope(|scope| {
            scope.spawn(|| {
                let mut output = EmulationOutput::new(&out_ring, &admitted_pool);
                let mut stats = CoreStats::default();
                for _ in 0..admits {
                    let idx = packet_pool
                        .get(&arena, EndpointId(0), EndpointId(1), FlowId(0))
                        .expect("packet pool replenished by admit() on every iteration");
                    output.admit(idx, &arena, &packet_pool, &mut stats);
                }
                output.flush(&mut stats);
                waited.store(stats.wait_for_admitted_enqueue, Ordering::Relaxed);
            });

            // Let the producer race ahead and fill the one-slot ring before
            // this side starts draining, so `flush()` is guaranteed to see
            // it full at least once.
            thread::sleep(Duration::from_millis(20));
            let mut drained = 0u64;
            while drained < admits as u64 {
                let mut buf = Vec::new();
                let n = out_ring.dequeue_burst(&mut buf, 1);
                if n == 0 {
                    thread::yield_now();
                    continue;
                }
                for batch in buf {
                    drained += batch.size() as u64;
                    admitted_pool.put(batch);
                }
            }
            total_edges.store(drained, Ordering::Relaxed);
        });

        assert!(
            waited.load(Ordering::Relaxed) > 0,
            "a one-slot admitted ring racing a producer must register at least one wait_for_admitted_enqueue spin"
        );
        assert_eq!(
            total_edges.load(Ordering::Relaxed),
            admits as u64,
            "every admitted edge must be drained exactly once despite back-pressure"
        );
    }
}

//! Stage wrappers binding a component to its input/output rings and
//! performing one `step()` per timeslot (spec §4.4).

use std::sync::Arc;

use rand::seq::SliceRandom;
use rand::RngCore;

use crate::endpoint::EndpointGroup;
use crate::mempool::PacketMempool;
use crate::output::EmulationOutput;
use crate::packet::{EndpointId, PacketArena, PacketIdx};
use crate::ring::{Mpmc, Ring};
use crate::router::{PortResolver, Router};
use crate::stats::CoreStats;

/// Resolves spec.md §9's Open Question 1: whether a full downstream ring
/// demotes the packet to a logged drop or is retried until it succeeds.
/// Defaults to `Retry` to preserve packet conservation, per the spec's
/// stated preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    DropAndLog,
    Retry,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        FailurePolicy::Retry
    }
}

/// Bulk-enqueue `items` onto `ring` honoring `policy`. On `DropAndLog`, a
/// failed enqueue frees every remaining item back to the packet mempool and
/// counts it as dropped (logged once for the whole burst, matching the
/// source's `DROP_ON_FAILED_ENQUEUE` naming in spec §4.4/§7).
fn flush_with_policy(
    ring: &Ring<PacketIdx, Mpmc>,
    items: &mut Vec<PacketIdx>,
    policy: FailurePolicy,
    arena: &PacketArena,
    packet_mempool: &PacketMempool,
    output: &mut EmulationOutput,
    stats: &mut CoreStats,
) {
    loop {
        if items.is_empty() {
            return;
        }
        if ring.enqueue_bulk(items) {
            return;
        }
        match policy {
            FailurePolicy::Retry => {
                stats.alloc_failed += 1;
                std::hint::spin_loop();
            }
            FailurePolicy::DropAndLog => {
                log::warn!("DROP_ON_FAILED_ENQUEUE: ring full, dropping {} packets", items.len());
                for idx in items.drain(..) {
                    output.drop_packet(idx, arena, packet_mempool, stats);
                }
                return;
            }
        }
    }
}

/// Binds one [`EndpointGroup`] to its rings (spec §4.4).
pub struct EndpointDriver {
    pub group: EndpointGroup,
    q_from_router: Arc<Ring<PacketIdx, Mpmc>>,
    q_to_router: Arc<Ring<PacketIdx, Mpmc>>,
    q_new_packets: Arc<Ring<PacketIdx, Mpmc>>,
    q_resets: Arc<Ring<EndpointId, Mpmc>>,
    policy: FailurePolicy,
    burst_size: usize,
}

impl EndpointDriver {
    pub fn new(
        group: EndpointGroup,
        q_from_router: Arc<Ring<PacketIdx, Mpmc>>,
        q_to_router: Arc<Ring<PacketIdx, Mpmc>>,
        q_new_packets: Arc<Ring<PacketIdx, Mpmc>>,
        q_resets: Arc<Ring<EndpointId, Mpmc>>,
        policy: FailurePolicy,
        burst_size: usize,
    ) -> Self {
        EndpointDriver {
            group,
            q_from_router,
            q_to_router,
            q_new_packets,
            q_resets,
            policy,
            burst_size,
        }
    }

    /// `push`, `pull`, `process_new`, then `reset_drain`, in that fixed
    /// order (spec §4.4).
    pub fn step(
        &mut self,
        arena: &PacketArena,
        packet_mempool: &PacketMempool,
        output: &mut EmulationOutput,
        stats: &mut CoreStats,
    ) {
        // push: deliver packets that arrived back from the router.
        let mut incoming = Vec::with_capacity(self.burst_size);
        self.q_from_router.dequeue_burst(&mut incoming, self.burst_size);
        if !incoming.is_empty() {
            self.group.push_batch(&incoming, arena, output, packet_mempool, stats);
            stats.pushed += incoming.len() as u64;
        }

        // pull: one packet per endpoint, bulk-enqueued toward the router.
        let mut outgoing = Vec::with_capacity(self.group.num_endpoints());
        self.group.pull_batch(&mut outgoing, self.group.num_endpoints());
        stats.pulled += outgoing.len() as u64;
        flush_with_policy(
            &self.q_to_router,
            &mut outgoing,
            self.policy,
            arena,
            packet_mempool,
            output,
            stats,
        );

        // process_new: admit fresh demand into backlogs.
        let mut fresh = Vec::with_capacity(self.burst_size);
        self.q_new_packets.dequeue_burst(&mut fresh, self.burst_size);
        if !fresh.is_empty() {
            self.group.new_packets(&fresh, arena, output, packet_mempool, stats);
        }

        // reset_drain: apply any pending resets, silently.
        let mut resets = Vec::with_capacity(4);
        self.q_resets.dequeue_burst(&mut resets, 4);
        for endpoint in resets {
            self.group.reset(endpoint, output, packet_mempool);
        }
    }

    /// Drain every owned ring back to the mempool at shutdown (spec §5's
    /// `cleanup()`).
    pub fn cleanup(&mut self, packet_mempool: &PacketMempool) {
        let mut buf = Vec::with_capacity(self.burst_size);
        for ring in [&self.q_from_router, &self.q_to_router, &self.q_new_packets] {
            loop {
                buf.clear();
                let n = ring.dequeue_burst(&mut buf, self.burst_size);
                if n == 0 {
                    break;
                }
                for idx in buf.drain(..) {
                    packet_mempool.put(idx);
                }
            }
        }
    }
}

/// Binds one [`Router`] to its rings (spec §4.4).
pub struct RouterDriver {
    pub router: Router,
    resolver: Box<dyn PortResolver + Send>,
    q_to_router: Arc<Ring<PacketIdx, Mpmc>>,
    q_from_router: Vec<Arc<Ring<PacketIdx, Mpmc>>>,
    policy: FailurePolicy,
    burst_size: usize,
    cur_time: u64,
    rng: Box<dyn RngCore + Send>,
}

impl RouterDriver {
    pub fn new(
        router: Router,
        resolver: Box<dyn PortResolver + Send>,
        q_to_router: Arc<Ring<PacketIdx, Mpmc>>,
        q_from_router: Vec<Arc<Ring<PacketIdx, Mpmc>>>,
        policy: FailurePolicy,
        burst_size: usize,
        rng: Box<dyn RngCore + Send>,
    ) -> Self {
        RouterDriver {
            router,
            resolver,
            q_to_router,
            q_from_router,
            policy,
            burst_size,
            cur_time: 0,
            rng,
        }
    }

    pub fn cur_time(&self) -> u64 {
        self.cur_time
    }

    /// Pull-per-neighbor, advance time, then shuffle-and-push, in that
    /// fixed order (spec §4.4).
    pub fn step(
        &mut self,
        arena: &PacketArena,
        packet_mempool: &PacketMempool,
        output: &mut EmulationOutput,
        stats: &mut CoreStats,
    ) {
        // 1. pull up to burst_size per neighbor group, bulk-enqueue outward.
        for (group, ring) in self.q_from_router.iter().enumerate() {
            let mut out = Vec::with_capacity(self.burst_size);
            self.router.pull_batch(&mut out, self.burst_size, group, self.cur_time);
            stats.pulled += out.len() as u64;
            flush_with_policy(ring, &mut out, self.policy, arena, packet_mempool, output, stats);
        }

        // 2. advance cur_time before push, so last_empty_time reflects the
        // slot the new arrivals belong to (spec §4.4).
        self.cur_time += 1;

        // 3. dequeue from q_to_router, Fisher-Yates shuffle, then push.
        let mut incoming = Vec::with_capacity(self.burst_size);
        self.q_to_router.dequeue_burst(&mut incoming, self.burst_size);
        incoming.shuffle(&mut self.rng);
        stats.pushed += incoming.len() as u64;
        self.router.push_batch(
            &incoming,
            self.cur_time,
            self.resolver.as_ref(),
            arena,
            packet_mempool,
            output,
            stats,
            &mut self.rng,
        );
    }

    /// Drain both the ingress-facing and every egress-facing ring, and the
    /// queue bank's own cells, back to the mempool (resolves spec.md §9's
    /// second Open Question: the `QueueBank` owns both halves outright, so
    /// `cleanup` needs no cross-router assumption about who frees what).
    pub fn cleanup(&mut self, packet_mempool: &PacketMempool) {
        let mut buf = Vec::with_capacity(self.burst_size);
        buf.clear();
        while self.q_to_router.dequeue_burst(&mut buf, self.burst_size) > 0 {
            for idx in buf.drain(..) {
                packet_mempool.put(idx);
            }
        }
        for ring in &self.q_from_router {
            buf.clear();
            while ring.dequeue_burst(&mut buf, self.burst_size) > 0 {
                for idx in buf.drain(..) {
                    packet_mempool.put(idx);
                }
            }
        }
        let bank = self.router.bank_mut();
        for in_port in 0..bank.num_in_ports() {
            for out_port in 0..bank.num_out_ports() {
                while let Some(idx) = bank.cell_mut(in_port, out_port).dequeue(self.cur_time) {
                    packet_mempool.put(idx);
                }
            }
        }
    }
}

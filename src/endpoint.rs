//! Rack of endpoints sharing backlog memory (spec §4.2).

use std::collections::{BTreeMap, VecDeque};

use crate::mempool::PacketMempool;
use crate::output::EmulationOutput;
use crate::packet::{EndpointId, PacketArena, PacketIdx};
use crate::stats::CoreStats;

/// One endpoint's backlog: demand FIFOs keyed by destination, plus the
/// persistent round-robin cursor `pull_batch` resumes from (spec §4.2:
/// "round-robin across its non-empty destinations starting from a
/// persistent cursor").
#[derive(Default)]
struct PerEndpoint {
    backlogs: BTreeMap<EndpointId, VecDeque<PacketIdx>>,
    cursor: Option<EndpointId>,
    total: usize,
}

impl PerEndpoint {
    fn enqueue(&mut self, dst: EndpointId, idx: PacketIdx) {
        self.backlogs.entry(dst).or_default().push_back(idx);
        self.total += 1;
    }

    /// Round-robin across non-empty destinations, resuming from `cursor`.
    fn pull_one(&mut self) -> Option<PacketIdx> {
        if self.backlogs.is_empty() {
            return None;
        }
        let keys: Vec<EndpointId> = self.backlogs.keys().copied().collect();
        let start = match self.cursor {
            Some(c) => keys.iter().position(|k| *k >= c).unwrap_or(0),
            None => 0,
        };
        for step in 0..keys.len() {
            let dst = keys[(start + step) % keys.len()];
            let queue = self.backlogs.get_mut(&dst).expect("key taken from backlogs");
            if let Some(idx) = queue.pop_front() {
                self.total -= 1;
                if queue.is_empty() {
                    self.backlogs.remove(&dst);
                }
                self.cursor = keys
                    .get((start + step + 1) % keys.len())
                    .copied()
                    .or(Some(dst));
                return Some(idx);
            }
        }
        None
    }

    fn drain(&mut self) -> Vec<PacketIdx> {
        let mut drained = Vec::with_capacity(self.total);
        for (_, mut queue) in std::mem::take(&mut self.backlogs) {
            drained.append(&mut Vec::from(std::mem::take(&mut queue)));
        }
        self.total = 0;
        self.cursor = None;
        drained
    }
}

/// One rack: `count` endpoints with ids `base.0 .. base.0 + count`, per
/// spec §4.7's contiguous per-rack endpoint numbering.
pub struct EndpointGroup {
    base: EndpointId,
    per_endpoint: Vec<PerEndpoint>,
    backlog_cap: usize,
}

impl EndpointGroup {
    pub fn new(base: EndpointId, count: usize, backlog_cap: usize) -> Self {
        let mut per_endpoint = Vec::with_capacity(count);
        per_endpoint.resize_with(count, PerEndpoint::default);
        EndpointGroup {
            base,
            per_endpoint,
            backlog_cap,
        }
    }

    /// Whether `endpoint` falls within this rack's contiguous id range.
    pub fn contains(&self, endpoint: EndpointId) -> bool {
        self.local_index(endpoint).is_some()
    }

    pub fn num_endpoints(&self) -> usize {
        self.per_endpoint.len()
    }

    fn local_index(&self, endpoint: EndpointId) -> Option<usize> {
        let offset = endpoint.0.checked_sub(self.base.0)? as usize;
        if offset < self.per_endpoint.len() {
            Some(offset)
        } else {
            None
        }
    }

    /// Append fresh demand packets. Excess beyond `backlog_cap` is dropped
    /// and reported (spec §4.2).
    pub fn new_packets(
        &mut self,
        pkts: &[PacketIdx],
        arena: &PacketArena,
        output: &mut EmulationOutput,
        packet_mempool: &PacketMempool,
        stats: &mut CoreStats,
    ) {
        for &idx in pkts {
            let cell = arena.get(idx);
            let local = self
                .local_index(cell.src)
                .expect("new_packets delivered to the wrong endpoint group");
            let endpoint = &mut self.per_endpoint[local];
            if endpoint.total >= self.backlog_cap {
                output.drop_packet(idx, arena, packet_mempool, stats);
                continue;
            }
            endpoint.enqueue(cell.dst, idx);
        }
    }

    /// Drain and silently free every backlog of one endpoint (spec §4.2:
    /// "reset drops are silent").
    pub fn reset(
        &mut self,
        endpoint: EndpointId,
        output: &EmulationOutput,
        packet_mempool: &PacketMempool,
    ) {
        let Some(local) = self.local_index(endpoint) else {
            return;
        };
        for idx in self.per_endpoint[local].drain() {
            output.free_packet(idx, packet_mempool);
        }
    }

    /// Up to one packet per endpoint, in endpoint-id order (spec §4.2).
    pub fn pull_batch(&mut self, out: &mut Vec<PacketIdx>, cap: usize) {
        for endpoint in self.per_endpoint.iter_mut() {
            if out.len() >= cap {
                break;
            }
            if let Some(idx) = endpoint.pull_one() {
                out.push(idx);
            }
        }
    }

    /// Admit packets that arrived back from the network, then free them
    /// (spec §4.2).
    pub fn push_batch(
        &self,
        pkts: &[PacketIdx],
        arena: &PacketArena,
        output: &mut EmulationOutput,
        packet_mempool: &PacketMempool,
        stats: &mut CoreStats,
    ) {
        for &idx in pkts {
            output.admit(idx, arena, packet_mempool, stats);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admitted::AdmittedMempool;
    use crate::mempool::PacketMempool;
    use crate::packet::FlowId;
    use crate::ring::{Mpmc, Ring};

    fn harness(
        capacity: usize,
    ) -> (
        PacketMempool,
        PacketArena,
        AdmittedMempool,
        Ring<Box<crate::admitted::AdmittedBatch>, Mpmc>,
    ) {
        let (pool, arena) = PacketMempool::new(capacity);
        let admitted_pool = AdmittedMempool::new(4);
        let out_ring = Ring::new(4);
        (pool, arena, admitted_pool, out_ring)
    }

    #[test]
    fn pull_batch_round_robins_destinations() {
        let (pool, arena, admitted_pool, out_ring) = harness(16);
        let mut output = EmulationOutput::new(&out_ring, &admitted_pool);
        let mut group = EndpointGroup::new(EndpointId(0), 1, 100);

        let a = pool.get(&arena, EndpointId(0), EndpointId(1), FlowId(0)).unwrap();
        let b = pool.get(&arena, EndpointId(0), EndpointId(2), FlowId(0)).unwrap();
        let mut stats = CoreStats::default();
        group.new_packets(&[a, b], &arena, &mut output, &pool, &mut stats);

        let mut out = Vec::new();
        group.pull_batch(&mut out, 1);
        assert_eq!(out.len(), 1);
        let first_dst = arena.get(out[0]).dst;

        out.clear();
        group.pull_batch(&mut out, 1);
        assert_eq!(out.len(), 1);
        let second_dst = arena.get(out[0]).dst;
        assert_ne!(first_dst, second_dst);
    }

    #[test]
    fn backlog_cap_drops_excess() {
        let (pool, arena, admitted_pool, out_ring) = harness(16);
        let mut output = EmulationOutput::new(&out_ring, &admitted_pool);
        let mut group = EndpointGroup::new(EndpointId(0), 1, 1);
        let mut stats = CoreStats::default();

        let a = pool.get(&arena, EndpointId(0), EndpointId(1), FlowId(0)).unwrap();
        let b = pool.get(&arena, EndpointId(0), EndpointId(1), FlowId(0)).unwrap();
        group.new_packets(&[a], &arena, &mut output, &pool, &mut stats);
        group.new_packets(&[b], &arena, &mut output, &pool, &mut stats);

        assert_eq!(stats.dropped, 1);
        let mut out = Vec::new();
        group.pull_batch(&mut out, 10);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn reset_drains_without_reporting() {
        let (pool, arena, admitted_pool, out_ring) = harness(16);
        let output = EmulationOutput::new(&out_ring, &admitted_pool);
        let mut group = EndpointGroup::new(EndpointId(0), 1, 100);
        let mut stats = CoreStats::default();
        let mut output_mut = output;

        let a = pool.get(&arena, EndpointId(0), EndpointId(1), FlowId(0)).unwrap();
        group.new_packets(&[a], &arena, &mut output_mut, &pool, &mut stats);
        group.reset(EndpointId(0), &output_mut, &pool);

        let mut out = Vec::new();
        group.pull_batch(&mut out, 10);
        assert!(out.is_empty());
        assert_eq!(stats.admitted, 0);
        assert_eq!(stats.dropped, 0);
    }
}

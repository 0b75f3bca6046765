//! Router queueing disciplines: drop-tail, RED, DCTCP, HULL (spec §4.3).
//!
//! Implemented as a tagged enum over shared dispatch (spec §9: "avoid a
//! class hierarchy because discipline state layouts differ and hot-path
//! dispatch benefits from monomorphization"), all four variants sharing one
//! [`QueueBank`].

use rand::Rng;

use crate::mempool::PacketMempool;
use crate::output::EmulationOutput;
use crate::packet::{PacketArena, PacketFlags, PacketIdx};
use crate::queue_bank::QueueBank;
use crate::stats::CoreStats;

#[derive(Debug, Clone, Copy)]
pub struct DropTailParams {
    pub capacity: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct RedParams {
    pub capacity: u32,
    pub weight: f64,
    pub min_th: f64,
    pub max_th: f64,
    pub max_p: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct DctcpParams {
    pub capacity: u32,
    pub mark_threshold: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct HullParams {
    pub capacity: u32,
    pub phantom_k: u32,
    pub drain_rate: u32,
}

/// A router instance: its discipline parameters plus the queue bank and
/// per-output port masks naming which neighbor group each output faces
/// (spec §3 "Port masks").
pub struct Router {
    discipline: Discipline,
    bank: QueueBank,
    /// One mask per neighbor group, pairwise disjoint, indexed by group id.
    port_masks: Vec<u64>,
}

enum Discipline {
    DropTail(DropTailParams),
    Red(RedParams),
    Dctcp(DctcpParams),
    Hull(HullParams),
}

/// How a packet's destination maps to this router's ports. Topology
/// construction (spec §4.7) is responsible for producing a consistent
/// mapping; the router only asks "which port does this endpoint face".
pub trait PortResolver {
    fn input_port(&self, src: crate::packet::EndpointId) -> usize;
    fn output_port(&self, dst: crate::packet::EndpointId) -> usize;
}

impl Router {
    pub fn new_drop_tail(
        num_in_ports: usize,
        num_out_ports: usize,
        port_masks: Vec<u64>,
        params: DropTailParams,
    ) -> Self {
        Router {
            discipline: Discipline::DropTail(params),
            bank: QueueBank::new(num_in_ports, num_out_ports),
            port_masks,
        }
    }

    pub fn new_red(
        num_in_ports: usize,
        num_out_ports: usize,
        port_masks: Vec<u64>,
        params: RedParams,
    ) -> Self {
        Router {
            discipline: Discipline::Red(params),
            bank: QueueBank::new(num_in_ports, num_out_ports),
            port_masks,
        }
    }

    pub fn new_dctcp(
        num_in_ports: usize,
        num_out_ports: usize,
        port_masks: Vec<u64>,
        params: DctcpParams,
    ) -> Self {
        Router {
            discipline: Discipline::Dctcp(params),
            bank: QueueBank::new(num_in_ports, num_out_ports),
            port_masks,
        }
    }

    pub fn new_hull(
        num_in_ports: usize,
        num_out_ports: usize,
        port_masks: Vec<u64>,
        params: HullParams,
    ) -> Self {
        Router {
            discipline: Discipline::Hull(params),
            bank: QueueBank::new(num_in_ports, num_out_ports),
            port_masks,
        }
    }

    fn capacity(&self) -> u32 {
        match self.discipline {
            Discipline::DropTail(p) => p.capacity,
            Discipline::Red(p) => p.capacity,
            Discipline::Dctcp(p) => p.capacity,
            Discipline::Hull(p) => p.capacity,
        }
    }

    /// Enqueue each packet into cell `(input_port, output_port)`, applying
    /// the discipline's admit/drop/mark decision (spec §4.3).
    #[allow(clippy::too_many_arguments)]
    pub fn push_batch(
        &mut self,
        pkts: &[PacketIdx],
        now: u64,
        resolver: &dyn PortResolver,
        arena: &PacketArena,
        packet_mempool: &PacketMempool,
        output: &mut EmulationOutput,
        stats: &mut CoreStats,
        rng: &mut dyn rand::RngCore,
    ) {
        let capacity = self.capacity();
        for &idx in pkts {
            let cell = arena.get(idx);
            let in_port = resolver.input_port(cell.src);
            let out_port = resolver.output_port(cell.dst);
            let queue = self.bank.cell_mut(in_port, out_port);

            match &mut self.discipline {
                Discipline::DropTail(_) => {
                    if queue.occupancy() < capacity {
                        queue.enqueue(idx);
                    } else {
                        queue.record_drop();
                        output.drop_packet(idx, arena, packet_mempool, stats);
                    }
                }
                Discipline::Red(params) => {
                    queue.avg_occupancy = (1.0 - params.weight) * queue.avg_occupancy
                        + params.weight * queue.occupancy() as f64;
                    let avg = queue.avg_occupancy;
                    let drop = if avg >= params.max_th {
                        true
                    } else if avg >= params.min_th {
                        let p =
                            params.max_p * (avg - params.min_th) / (params.max_th - params.min_th);
                        rng.gen::<f64>() < p
                    } else {
                        false
                    };
                    if drop {
                        queue.record_drop();
                        output.drop_packet(idx, arena, packet_mempool, stats);
                    } else {
                        queue.enqueue(idx);
                    }
                }
                Discipline::Dctcp(params) => {
                    let mark_needed =
                        queue.occupancy() < capacity && queue.occupancy() >= params.mark_threshold;
                    if queue.occupancy() < capacity {
                        queue.enqueue(idx);
                        if mark_needed {
                            mark(arena, idx, stats);
                        }
                    } else {
                        queue.record_drop();
                        output.drop_packet(idx, arena, packet_mempool, stats);
                    }
                }
                Discipline::Hull(params) => {
                    // Drain by `drain_rate` at most once per timeslot (spec
                    // §4.3), regardless of how many packets land in this
                    // cell during it.
                    if queue.hull_last_drain_time < now {
                        queue.phantom_occupancy =
                            queue.phantom_occupancy.saturating_sub(params.drain_rate);
                        queue.hull_last_drain_time = now;
                    }
                    queue.phantom_occupancy = queue.phantom_occupancy.saturating_add(1);
                    let mark_needed = queue.phantom_occupancy >= params.phantom_k;
                    if queue.occupancy() < capacity {
                        queue.enqueue(idx);
                        if mark_needed {
                            mark(arena, idx, stats);
                        }
                    } else {
                        queue.record_drop();
                        output.drop_packet(idx, arena, packet_mempool, stats);
                    }
                }
            }
        }
    }

    /// For each output port selected by `port_mask`, emit at most one
    /// packet chosen by the per-output round-robin cursor (spec §4.3).
    pub fn pull_batch(&mut self, out: &mut Vec<PacketIdx>, cap: usize, group: usize, now: u64) {
        let mask = self.port_masks[group];
        for out_port in 0..self.bank.num_out_ports() {
            if out.len() >= cap {
                break;
            }
            if mask & (1u64 << out_port) == 0 {
                continue;
            }
            if let Some(idx) = self.bank.pull_one(out_port, now) {
                out.push(idx);
            }
        }
    }

    pub fn bank(&self) -> &QueueBank {
        &self.bank
    }

    pub fn bank_mut(&mut self) -> &mut QueueBank {
        &mut self.bank
    }
}

/// DCTCP/HULL ECN marking (spec §4.3).
fn mark(arena: &PacketArena, idx: PacketIdx, stats: &mut CoreStats) {
    let flags = arena.get(idx).flags | PacketFlags::MARKED;
    arena.set_flags(idx, flags);
    stats.marked += 1;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mempool::PacketMempool;
    use crate::packet::EndpointId;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    struct Identity;
    impl PortResolver for Identity {
        fn input_port(&self, src: EndpointId) -> usize {
            src.0 as usize
        }
        fn output_port(&self, dst: EndpointId) -> usize {
            dst.0 as usize
        }
    }

    #[test]
    fn drop_tail_rejects_beyond_capacity() {
        let (pool, arena) = PacketMempool::new(16);
        let admitted_pool = crate::admitted::AdmittedMempool::new(4);
        let out_ring = crate::ring::Ring::new(4);
        let mut output = EmulationOutput::new(&out_ring, &admitted_pool);
        let mut stats = CoreStats::default();
        let mut rng = ChaCha8Rng::seed_from_u64(1);

        let mut router = Router::new_drop_tail(4, 4, vec![0xF], DropTailParams { capacity: 2 });
        let resolver = Identity;

        let mut pkts = Vec::new();
        for _ in 0..3 {
            pkts.push(
                pool.get(&arena, EndpointId(0), EndpointId(1), crate::packet::FlowId(0))
                    .unwrap(),
            );
        }
        router.push_batch(&pkts, 0, &resolver, &arena, &pool, &mut output, &mut stats, &mut rng);
        assert_eq!(stats.dropped, 1);
        assert_eq!(router.bank().cell(0, 1).occupancy(), 2);
    }
}

//! One worker per physical core, stepping an assigned list of drivers in
//! strict order each timeslot (spec §4.6).

use crate::admitted::AdmittedMempool;
use crate::driver::{EndpointDriver, RouterDriver};
use crate::mempool::PacketMempool;
use crate::output::EmulationOutput;
use crate::packet::PacketArena;
use crate::ring::{Mpmc, Ring};
use crate::stats::CoreStats;

/// An assigned, ordered set of drivers plus the per-core output sink. Spec
/// §4.6's three assignment patterns (one driver per core, rack-pair-plus-
/// core-router, or everything on one core) are all expressible as an
/// `EmulationCore` with the right driver lists -- the core itself does not
/// care which pattern produced its assignment.
pub struct EmulationCore<'a> {
    endpoint_drivers: Vec<EndpointDriver>,
    router_drivers: Vec<RouterDriver>,
    output: EmulationOutput<'a>,
    stats: CoreStats,
}

impl<'a> EmulationCore<'a> {
    pub fn new(
        endpoint_drivers: Vec<EndpointDriver>,
        router_drivers: Vec<RouterDriver>,
        q_admitted_out: &'a Ring<Box<crate::admitted::AdmittedBatch>, Mpmc>,
        admitted_mempool: &'a AdmittedMempool,
    ) -> Self {
        EmulationCore {
            endpoint_drivers,
            router_drivers,
            output: EmulationOutput::new(q_admitted_out, admitted_mempool),
            stats: CoreStats::default(),
        }
    }

    /// Step every endpoint driver, then every router driver, in order, then
    /// flush the output (spec §4.6's hard ordering requirement: a packet
    /// pulled in slot `t` must not be deliverable to a router pull in the
    /// same slot, which holds because pull precedes push in both drivers
    /// and every packet crosses at least one ring between stages).
    pub fn step(&mut self, arena: &PacketArena, packet_mempool: &PacketMempool) {
        for driver in &mut self.endpoint_drivers {
            driver.step(arena, packet_mempool, &mut self.output, &mut self.stats);
        }
        for driver in &mut self.router_drivers {
            driver.step(arena, packet_mempool, &mut self.output, &mut self.stats);
        }
        self.output.flush(&mut self.stats);
    }

    pub fn stats(&self) -> &CoreStats {
        &self.stats
    }

    /// Relinquish the drivers this core was assigned, so a supervisor can
    /// reassemble them into the next `run()`'s core assignment.
    pub fn into_drivers(self) -> (Vec<EndpointDriver>, Vec<RouterDriver>) {
        (self.endpoint_drivers, self.router_drivers)
    }

    /// Drain every owned ring and release every in-flight packet back to
    /// the mempool (spec §5's shutdown `cleanup()`).
    pub fn cleanup(&mut self, packet_mempool: &PacketMempool) {
        for driver in &mut self.endpoint_drivers {
            driver.cleanup(packet_mempool);
        }
        for driver in &mut self.router_drivers {
            driver.cleanup(packet_mempool);
        }
    }
}

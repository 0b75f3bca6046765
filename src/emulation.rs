//! The top-level emulation: constructs the topology, owns every ring and
//! mempool, assigns drivers to cores, and runs the timeslot loop (spec
//! §3 "Global emulation state", §4.6, §4.7).
//!
//! There is deliberately no `static`/global pointer here (spec §9's design
//! note that this is unnecessary in a rewrite): an [`Emulation`] owns every
//! piece of shared state, and each [`crate::core::EmulationCore`] either
//! borrows from it for the duration of [`Emulation::run`] or is handed
//! exclusive ownership of the drivers assigned to it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{error, warn};

use crate::admitted::{AdmittedBatch, AdmittedMempool};
use crate::core::EmulationCore;
use crate::driver::{EndpointDriver, RouterDriver};
use crate::error::FabricError;
use crate::mempool::PacketMempool;
use crate::packet::{EndpointId, FlowId, PacketArena, PacketIdx};
use crate::ring::{Mpmc, Ring};
use crate::stats::{CoreStats, GlobalStats, StatsSnapshot};

/// How spec §4.6's three driver-to-core assignment patterns apply to one
/// topology. `N_CORES` values other than the ones matched here are a
/// configuration error at startup, per spec §4.6.
enum Assignment {
    /// One driver (endpoint group or router) alone per core.
    PerDriver,
    /// One (endpoint group, ToR) pair per rack, plus the core router alone
    /// on the last core. Only valid when a core router is present.
    RackPairPlusCore,
    /// Every driver on a single core.
    Single,
}

fn resolve_assignment(
    n_cores: usize,
    num_racks: usize,
    num_routers: usize,
    num_endpoint_groups: usize,
    has_core: bool,
) -> Result<Assignment, FabricError> {
    if n_cores == 1 {
        return Ok(Assignment::Single);
    }
    if has_core && n_cores == num_racks + 1 {
        return Ok(Assignment::RackPairPlusCore);
    }
    if n_cores == num_routers + num_endpoint_groups {
        return Ok(Assignment::PerDriver);
    }
    Err(FabricError::UnsupportedCoreCount {
        n_cores,
        num_racks,
        num_routers,
    })
}

/// Owns the full topology: mempools, arena, every ring, every driver, and
/// the accumulated statistics from the most recent [`Emulation::run`].
pub struct Emulation {
    packet_mempool: PacketMempool,
    packet_arena: PacketArena,
    admitted_mempool: AdmittedMempool,
    q_admitted_out: Arc<Ring<Box<AdmittedBatch>, Mpmc>>,
    q_new_packets: Vec<Arc<Ring<PacketIdx, Mpmc>>>,
    q_resets: Vec<Arc<Ring<EndpointId, Mpmc>>>,
    endpoint_drivers: Vec<EndpointDriver>,
    /// ToR drivers followed by the core router driver, if any -- the order
    /// spec §4.6 names for "then each router driver's step in order".
    router_drivers: Vec<RouterDriver>,
    num_racks: usize,
    has_core: bool,
    n_cores: Option<usize>,
    global_stats: GlobalStats,
    last_core_stats: Vec<CoreStats>,
}

impl Emulation {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        packet_mempool: PacketMempool,
        packet_arena: PacketArena,
        admitted_mempool: AdmittedMempool,
        q_admitted_out: Arc<Ring<Box<AdmittedBatch>, Mpmc>>,
        q_new_packets: Vec<Arc<Ring<PacketIdx, Mpmc>>>,
        q_resets: Vec<Arc<Ring<EndpointId, Mpmc>>>,
        endpoint_drivers: Vec<EndpointDriver>,
        tor_drivers: Vec<RouterDriver>,
        core_driver: Option<RouterDriver>,
        num_racks: usize,
        n_cores: Option<usize>,
    ) -> Self {
        let has_core = core_driver.is_some();
        let mut router_drivers = tor_drivers;
        router_drivers.extend(core_driver);
        Emulation {
            packet_mempool,
            packet_arena,
            admitted_mempool,
            q_admitted_out,
            q_new_packets,
            q_resets,
            endpoint_drivers,
            router_drivers,
            num_racks,
            has_core,
            n_cores,
            global_stats: GlobalStats::default(),
            last_core_stats: Vec::new(),
        }
    }

    /// Which rack's endpoint group owns `endpoint`, by its contiguous
    /// per-rack numbering (spec §4.7). `None` if `add_backlog`/
    /// `reset_endpoint` is called while the drivers are checked out by a
    /// running `run()` (they are not reachable from an `EmulationCore` at
    /// that point) or the id is out of range.
    fn epg_of(&self, endpoint: EndpointId) -> Option<usize> {
        self.endpoint_drivers
            .iter()
            .position(|d| d.group.contains(endpoint))
    }

    /// The allocator-facing entry point (spec §6): allocate `amount`
    /// packets from the packet mempool, initialize them `(src, dst, flow)`,
    /// and bulk-enqueue them onto `q_new_packets[epg_of(src)]`. If
    /// allocation fails partway through, the call stops and logs a
    /// demand-drop for the call, per spec §6.
    pub fn add_backlog(&mut self, src: EndpointId, dst: EndpointId, flow: FlowId, amount: u32) {
        let Some(epg) = self.epg_of(src) else {
            warn!("add_backlog: source endpoint {src} does not belong to any rack");
            return;
        };

        let mut batch = Vec::with_capacity(amount as usize);
        for _ in 0..amount {
            match self.packet_mempool.get(&self.packet_arena, src, dst, flow) {
                Some(idx) => batch.push(idx),
                None => {
                    self.global_stats.packet_alloc_failed += 1;
                    warn!("add_backlog: packet mempool exhausted, demand drop for {src}->{dst}");
                    break;
                }
            }
        }
        if batch.is_empty() {
            return;
        }
        if !self.q_new_packets[epg].enqueue_bulk(&mut batch) {
            self.global_stats.backlog_enqueue_failed += 1;
            warn!("add_backlog: q_new_packets full, demand drop for {src}->{dst}");
            for idx in batch {
                self.packet_mempool.put(idx);
            }
        }
    }

    /// Signal that `endpoint` has lost sync with the allocator (spec §6):
    /// enqueues a reset token that the owning core drains and applies
    /// before the next timeslot's demand (spec §4.4).
    pub fn reset_endpoint(&mut self, endpoint: EndpointId) {
        let Some(epg) = self.epg_of(endpoint) else {
            warn!("reset_endpoint: endpoint {endpoint} does not belong to any rack");
            return;
        };
        if self.q_resets[epg].enqueue(endpoint).is_err() {
            self.global_stats.reset_enqueue_failed += 1;
            warn!("reset_endpoint: q_resets full, reset dropped for endpoint {endpoint}");
        }
    }

    /// Partition the owned drivers into per-core `(endpoint, router)`
    /// groups per spec §4.6's three assignment patterns. Returns owned
    /// driver groups rather than `EmulationCore`s directly: an
    /// `EmulationCore` borrows the admitted-batch ring and mempool, and
    /// building it here would tie that borrow to this method's `&mut self`
    /// for as long as the cores live, which would then conflict with the
    /// immutable borrows `run()` needs for the arena and packet mempool.
    fn take_driver_groups(
        &mut self,
    ) -> Result<Vec<(Vec<EndpointDriver>, Vec<RouterDriver>)>, FabricError> {
        let num_endpoint_groups = self.endpoint_drivers.len();
        let num_routers = self.router_drivers.len();
        let n_cores = self.n_cores.unwrap_or(num_endpoint_groups + num_routers);
        let assignment = resolve_assignment(
            n_cores,
            self.num_racks,
            num_routers,
            num_endpoint_groups,
            self.has_core,
        )?;

        let endpoint_drivers = std::mem::take(&mut self.endpoint_drivers);
        let mut router_drivers = std::mem::take(&mut self.router_drivers);
        let core_driver = if self.has_core { router_drivers.pop() } else { None };
        let tor_drivers = router_drivers;

        let groups = match assignment {
            Assignment::PerDriver => {
                let mut groups = Vec::with_capacity(num_endpoint_groups + num_routers);
                for ep in endpoint_drivers {
                    groups.push((vec![ep], Vec::new()));
                }
                for tor in tor_drivers {
                    groups.push((Vec::new(), vec![tor]));
                }
                if let Some(core) = core_driver {
                    groups.push((Vec::new(), vec![core]));
                }
                groups
            }
            Assignment::RackPairPlusCore => {
                let mut groups = Vec::with_capacity(self.num_racks + 1);
                for (ep, tor) in endpoint_drivers.into_iter().zip(tor_drivers) {
                    groups.push((vec![ep], vec![tor]));
                }
                if let Some(core) = core_driver {
                    groups.push((Vec::new(), vec![core]));
                }
                groups
            }
            Assignment::Single => {
                let mut routers = tor_drivers;
                routers.extend(core_driver);
                vec![(endpoint_drivers, routers)]
            }
        };
        Ok(groups)
    }

    /// Run `timeslots` timeslots: one OS thread per assigned
    /// [`EmulationCore`] (spec §5 "Parallel -- one OS thread per
    /// `EmulationCore`"), draining `q_admitted_out` concurrently so that a
    /// slow drain exercises back-pressure (spec §4.5/§5) rather than
    /// stalling forever. Returns every admitted batch produced, in the
    /// order it was flushed by whichever core produced it first (batches
    /// from different cores may interleave; ordering within one core's own
    /// output is preserved).
    pub fn run(&mut self, timeslots: u64) -> Result<Vec<Box<AdmittedBatch>>, FabricError> {
        let mut admitted = Vec::new();
        let groups = self.take_driver_groups()?;
        let packet_arena = &self.packet_arena;
        let packet_mempool = &self.packet_mempool;
        let q_admitted_out = &self.q_admitted_out;
        let admitted_mempool = &self.admitted_mempool;
        let cores: Vec<EmulationCore<'_>> = groups
            .into_iter()
            .map(|(endpoints, routers)| {
                EmulationCore::new(endpoints, routers, q_admitted_out, admitted_mempool)
            })
            .collect();
        let done = AtomicBool::new(false);
        let mut finished_cores = Vec::new();

        std::thread::scope(|scope| {
            let handles: Vec<_> = cores
                .into_iter()
                .map(|mut core| {
                    scope.spawn(move || {
                        for _ in 0..timeslots {
                            core.step(packet_arena, packet_mempool);
                        }
                        core
                    })
                })
                .collect();

            // Drain admitted batches while the cores are still running so
            // a small `q_admitted_out` (the back-pressure scenario in spec
            // §8) doesn't stall a core's `flush()` for the rest of the run.
            // Each batch is copied out for the caller and its `Box` is
            // recycled straight back to `admitted_mempool` -- otherwise the
            // pool (fixed-capacity, spec §4.5) never gets a slot back and
            // `flush()` spins forever on `admitted_mempool.get()` once it
            // empties.
            let drainer = scope.spawn(|| {
                let mut collected = Vec::new();
                let mut buf = Vec::new();
                while !done.load(Ordering::Acquire) {
                    buf.clear();
                    let n = q_admitted_out.dequeue_burst(&mut buf, 64);
                    if n == 0 {
                        std::thread::yield_now();
                        continue;
                    }
                    for batch in buf.drain(..) {
                        collected.push(Box::new(*batch));
                        admitted_mempool.put(batch);
                    }
                }
                collected
            });

            for handle in handles {
                match handle.join() {
                    Ok(core) => finished_cores.push(core),
                    Err(payload) => {
                        error!("emulation core thread panicked");
                        std::panic::resume_unwind(payload);
                    }
                }
            }
            done.store(true, Ordering::Release);

            let mut buf = Vec::new();
            q_admitted_out.dequeue_burst(&mut buf, q_admitted_out.capacity());
            for batch in buf.drain(..) {
                admitted.push(Box::new(*batch));
                admitted_mempool.put(batch);
            }

            match drainer.join() {
                Ok(mut collected) => admitted.append(&mut collected),
                Err(payload) => std::panic::resume_unwind(payload),
            }
        });

        self.last_core_stats = finished_cores.iter().map(|c| c.stats().clone()).collect();
        // `take_driver_groups` assigned drivers to cores in a fixed
        // traversal order (endpoint drivers, then ToR drivers, then the
        // optional core driver last) for every `Assignment` variant, so
        // collecting them back in the same per-core order restores that
        // invariant for the next `run()` call. Deliberately no
        // `cleanup()` here: packets still queued in a ring or a queue cell
        // belong to the run in progress, not to a shutdown, and must stay
        // owned until `shutdown()` or a later `run()` processes them --
        // freeing them here without an admit/drop edge would break the
        // packet-conservation invariant (spec §8, property 1).
        for core in finished_cores {
            let (endpoints, routers) = core.into_drivers();
            self.endpoint_drivers.extend(endpoints);
            self.router_drivers.extend(routers);
        }

        Ok(admitted)
    }

    /// Drain every still-owned ring back to the packet mempool (spec §5's
    /// shutdown `cleanup()`; spec §8 invariant 6: every packet returns to
    /// the mempool once its backlog is drained). Call after the final
    /// `run()`, once no more demand will be injected.
    pub fn shutdown(&mut self) {
        for ring in &self.q_new_packets {
            let mut buf = Vec::new();
            while ring.dequeue_burst(&mut buf, 256) > 0 {
                for idx in buf.drain(..) {
                    self.packet_mempool.put(idx);
                }
            }
        }
        for driver in &mut self.endpoint_drivers {
            driver.cleanup(&self.packet_mempool);
        }
        for driver in &mut self.router_drivers {
            driver.cleanup(&self.packet_mempool);
        }
    }

    /// Every packet slot still free in the mempool; used by packet
    /// conservation tests (spec §8, property 1 and 6).
    pub fn packets_in_system(&self) -> usize {
        self.packet_mempool.capacity() - self.packet_mempool.free_count()
    }

    /// A read-only snapshot of the counters from the most recent `run()`
    /// (spec §3 "Statistics"; spec §9: "a `Stats` snapshot type ... taken
    /// only at safe points").
    pub fn snapshot_stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            per_core: self.last_core_stats.clone(),
            global: self.global_stats.clone(),
        }
    }
}

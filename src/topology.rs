//! Topology construction: wires racks, ToR routers, and an optional core
//! router into a runnable [`Emulation`] (spec §4.7).

use std::sync::Arc;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::config::{RouterType, TopologyConfig};
use crate::driver::{EndpointDriver, FailurePolicy, RouterDriver};
use crate::emulation::Emulation;
use crate::endpoint::EndpointGroup;
use crate::error::FabricError;
use crate::packet::EndpointId;
use crate::ring::{Mpmc, Ring};
use crate::router::{PortResolver, Router};

const PACKET_MEMPOOL_SIZE: usize = 1 << 16;
const ADMITTED_MEMPOOL_SIZE: usize = 256;
const MAX_ENDPOINTS_PER_RACK: usize = 64;

/// A ToR's ports: `0..count` face its own rack's endpoints, and if the
/// rack is attached to a core router, port `count` faces the uplink
/// (spec §4.7's "upper half of each ToR's ports" relationship, modeled
/// here as a single dedicated uplink port rather than a bit-range since a
/// ToR has exactly one core-router neighbor).
struct TorResolver {
    base: EndpointId,
    count: usize,
    uplink_port: usize,
}

impl TorResolver {
    fn local_offset(&self, id: EndpointId) -> Option<usize> {
        let offset = id.0.checked_sub(self.base.0)? as usize;
        (offset < self.count).then_some(offset)
    }
}

impl PortResolver for TorResolver {
    fn input_port(&self, src: EndpointId) -> usize {
        self.local_offset(src).unwrap_or(self.uplink_port)
    }
    fn output_port(&self, dst: EndpointId) -> usize {
        self.local_offset(dst).unwrap_or(self.uplink_port)
    }
}

/// The core router's ports are partitioned into one contiguous range per
/// rack (spec §4.7's mask table: 1 rack -> all 64 ports, 2 racks -> 32
/// each, 3 racks -> 16 each). Endpoints within a rack are spread evenly
/// across that rack's port range so more than one packet per rack can
/// reach the core in a single timeslot.
struct CoreResolver {
    endpoints_per_rack: usize,
    rack_port_count: usize,
}

impl CoreResolver {
    fn port_for(&self, id: EndpointId) -> usize {
        let rack = id.0 as usize / self.endpoints_per_rack;
        let within = id.0 as usize % self.endpoints_per_rack;
        rack * self.rack_port_count + (within % self.rack_port_count)
    }
}

impl PortResolver for CoreResolver {
    fn input_port(&self, src: EndpointId) -> usize {
        self.port_for(src)
    }
    fn output_port(&self, dst: EndpointId) -> usize {
        self.port_for(dst)
    }
}

fn rack_port_count(num_racks: usize) -> Result<usize, FabricError> {
    match num_racks {
        1 => Ok(64),
        2 => Ok(32),
        3 => Ok(16),
        other => Err(FabricError::UnsupportedCoreNeighbors {
            core_neighbors: other,
            num_racks: other,
        }),
    }
}

fn build_router(
    router_type: RouterType,
    router_args: &crate::config::RouterArgs,
    num_in: usize,
    num_out: usize,
    masks: Vec<u64>,
) -> Router {
    match router_type {
        RouterType::DropTail => {
            Router::new_drop_tail(num_in, num_out, masks, router_args.as_drop_tail())
        }
        RouterType::Red => Router::new_red(num_in, num_out, masks, router_args.as_red()),
        RouterType::Dctcp => Router::new_dctcp(num_in, num_out, masks, router_args.as_dctcp()),
        RouterType::Hull => Router::new_hull(num_in, num_out, masks, router_args.as_hull()),
    }
}

/// Construct a fully-wired [`Emulation`] from a validated [`TopologyConfig`]
/// (spec §4.7). Fallible: unsupported core/neighbor counts are rejected
/// here rather than panicking (spec §7's "Configuration error" class).
pub fn build(config: &TopologyConfig, seed: u64) -> Result<Emulation, FabricError> {
    if config.endpoints_per_rack > MAX_ENDPOINTS_PER_RACK {
        return Err(FabricError::TooManyEndpointsPerRack(config.endpoints_per_rack));
    }
    if config.num_core_routers > 1 {
        return Err(FabricError::UnsupportedCoreRouterCount(config.num_core_routers));
    }
    if !config.packet_ring_size.is_power_of_two() || config.packet_ring_size == 0 {
        return Err(FabricError::InvalidRingCapacity(config.packet_ring_size));
    }
    let admitted_ring_size = config.effective_admitted_ring_size();
    if !admitted_ring_size.is_power_of_two() || admitted_ring_size == 0 {
        return Err(FabricError::InvalidRingCapacity(admitted_ring_size));
    }

    let has_core = config.num_core_routers == 1;
    if has_core && config.core_neighbors != config.num_racks {
        return Err(FabricError::UnsupportedCoreNeighbors {
            core_neighbors: config.core_neighbors,
            num_racks: config.num_racks,
        });
    }

    let (packet_mempool, packet_arena) = crate::mempool::PacketMempool::new(PACKET_MEMPOOL_SIZE);
    let admitted_mempool = crate::admitted::AdmittedMempool::new(ADMITTED_MEMPOOL_SIZE);
    let q_admitted_out: Arc<Ring<Box<crate::admitted::AdmittedBatch>, Mpmc>> =
        Arc::new(Ring::new(admitted_ring_size));
    let q_new_packets: Vec<Arc<Ring<crate::packet::PacketIdx, Mpmc>>> =
        (0..config.num_racks).map(|_| Arc::new(Ring::new(config.packet_ring_size))).collect();
    let q_resets: Vec<Arc<Ring<EndpointId, Mpmc>>> =
        (0..config.num_racks).map(|_| Arc::new(Ring::new(64))).collect();

    // Per-rack ring: endpoint-group -> ToR. This is the ToR's single
    // `q_to_router` input (spec §4.4); since it is MPMC, the core router's
    // downlink pull (below) enqueues onto the very same ring as the
    // endpoint group's own uplink pull, so the ToR observes both streams
    // through the one ring its driver contract names instead of needing a
    // separate software merge stage.
    let q_to_tor: Vec<Arc<Ring<crate::packet::PacketIdx, Mpmc>>> =
        (0..config.num_racks).map(|_| Arc::new(Ring::new(config.packet_ring_size))).collect();
    let q_from_tor_to_endpoints: Vec<Arc<Ring<crate::packet::PacketIdx, Mpmc>>> =
        (0..config.num_racks).map(|_| Arc::new(Ring::new(config.packet_ring_size))).collect();

    // Single merged uplink ring ToR -> core router, only meaningful if a
    // core router exists: every ToR's uplink neighbor group pushes onto
    // this one MPMC ring, which is the core router's sole `q_to_router`.
    let q_to_core_merged: Option<Arc<Ring<crate::packet::PacketIdx, Mpmc>>> =
        has_core.then(|| Arc::new(Ring::new(config.packet_ring_size)));

    let backlog_cap = config.effective_backlog_cap();

    let mut endpoint_drivers = Vec::with_capacity(config.num_racks);
    let mut tor_drivers = Vec::with_capacity(config.num_racks);

    for rack in 0..config.num_racks {
        let base = EndpointId((rack * config.endpoints_per_rack) as u16);
        let group = EndpointGroup::new(base, config.endpoints_per_rack, backlog_cap);

        let endpoint_driver = EndpointDriver::new(
            group,
            q_from_tor_to_endpoints[rack].clone(),
            q_to_tor[rack].clone(),
            q_new_packets[rack].clone(),
            q_resets[rack].clone(),
            FailurePolicy::default(),
            config.burst_size,
        );
        endpoint_drivers.push(endpoint_driver);

        let tor_num_ports = config.endpoints_per_rack + if has_core { 1 } else { 0 };
        let uplink_port = config.endpoints_per_rack;
        let mut tor_masks = vec![0u64; if has_core { 2 } else { 1 }];
        tor_masks[0] = mask_for_range(0, config.endpoints_per_rack);
        if has_core {
            tor_masks[1] = mask_for_range(uplink_port, uplink_port + 1);
        }
        let tor_router = build_router(
            config.router_type,
            &config.router_args,
            tor_num_ports,
            tor_num_ports,
            tor_masks,
        );
        let resolver: Box<dyn PortResolver + Send> = Box::new(TorResolver {
            base,
            count: config.endpoints_per_rack,
            uplink_port,
        });

        let mut tor_outgoing = vec![q_from_tor_to_endpoints[rack].clone()];
        if let Some(merged) = &q_to_core_merged {
            tor_outgoing.push(merged.clone());
        }

        let tor_driver = RouterDriver::new(
            tor_router,
            resolver,
            q_to_tor[rack].clone(),
            tor_outgoing,
            FailurePolicy::default(),
            config.burst_size,
            Box::new(ChaCha8Rng::seed_from_u64(seed.wrapping_add(rack as u64))),
        );
        tor_drivers.push(tor_driver);
    }

    let core_driver = if let Some(merged) = q_to_core_merged {
        let rpc = rack_port_count(config.num_racks)?;
        let core_num_ports = config.num_racks * rpc;
        let core_masks: Vec<u64> = (0..config.num_racks)
            .map(|r| mask_for_range(r * rpc, (r + 1) * rpc))
            .collect();
        let core_router = build_router(
            config.router_type,
            &config.router_args,
            core_num_ports,
            core_num_ports,
            core_masks,
        );
        let resolver: Box<dyn PortResolver + Send> = Box::new(CoreResolver {
            endpoints_per_rack: config.endpoints_per_rack,
            rack_port_count: rpc,
        });
        // The core router's per-rack downlink neighbor group pushes
        // straight back onto that rack's `q_to_tor` ring -- the same ring
        // the rack's endpoint group pulls onto -- so the ToR observes both
        // directions of traffic through the single input ring its driver
        // contract names (see the `q_to_tor` comment above).
        Some(RouterDriver::new(
            core_router,
            resolver,
            merged,
            q_to_tor.clone(),
            FailurePolicy::default(),
            config.burst_size,
            Box::new(ChaCha8Rng::seed_from_u64(seed.wrapping_add(0xC0FFEE))),
        ))
    } else {
        None
    };

    Ok(Emulation::new(
        packet_mempool,
        packet_arena,
        admitted_mempool,
        q_admitted_out,
        q_new_packets,
        q_resets,
        endpoint_drivers,
        tor_drivers,
        core_driver,
        config.num_racks,
        config.n_cores,
    ))
}

fn mask_for_range(start: usize, end: usize) -> u64 {
    if end >= 64 && start == 0 {
        return u64::MAX;
    }
    ((1u128 << end) - (1u128 << start)) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RouterArgs;

    fn single_rack_config() -> TopologyConfig {
        TopologyConfig {
            num_racks: 1,
            endpoints_per_rack: 8,
            num_core_routers: 0,
            tor_neighbors: 1,
            core_neighbors: 0,
            router_type: RouterType::DropTail,
            router_args: RouterArgs::DropTail { capacity: 4 },
            packet_ring_size: 64,
            admitted_ring_size: None,
            backlog_cap: None,
            burst_size: 32,
            n_cores: None,
        }
    }

    #[test]
    fn rejects_too_many_endpoints_per_rack() {
        let mut cfg = single_rack_config();
        cfg.endpoints_per_rack = 65;
        assert!(matches!(build(&cfg, 1), Err(FabricError::TooManyEndpointsPerRack(65))));
    }

    #[test]
    fn builds_single_rack_topology() {
        let cfg = single_rack_config();
        assert!(build(&cfg, 1).is_ok());
    }

    #[test]
    fn mask_for_full_range_is_all_ones() {
        assert_eq!(mask_for_range(0, 64), u64::MAX);
        assert_eq!(mask_for_range(0, 8), 0xFF);
        assert_eq!(mask_for_range(8, 16), 0xFF00);
    }
}

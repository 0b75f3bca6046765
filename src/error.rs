//! Fatal error types.
//!
//! Per the propagation policy: resource exhaustion (ring full, mempool
//! empty), policy drops and demand drops never reach here — they are
//! counted in [`crate::stats`] and surfaced as [`crate::admitted::AdmittedEdge`]s
//! instead. Only configuration errors (rejected at construction) and
//! invariant violations (programming defects) are modeled as [`FabricError`].

use thiserror::Error;

/// A fatal error: either the topology requested at construction time is
/// not supported, or an internal invariant was violated.
#[derive(Debug, Error)]
pub enum FabricError {
    #[error("unsupported core count {n_cores} for {num_racks} racks / {num_routers} routers")]
    UnsupportedCoreCount {
        n_cores: usize,
        num_racks: usize,
        num_routers: usize,
    },

    #[error("unsupported core-router neighbor count {core_neighbors} for {num_racks} racks")]
    UnsupportedCoreNeighbors {
        core_neighbors: usize,
        num_racks: usize,
    },

    #[error("endpoints_per_rack {0} exceeds the 64-port limit")]
    TooManyEndpointsPerRack(usize),

    #[error("num_core_routers must be 0 or 1, got {0}")]
    UnsupportedCoreRouterCount(usize),

    #[error("ring capacity {0} is not representable (must be a non-zero power of two)")]
    InvalidRingCapacity(usize),

    #[error("invariant violated: {0}")]
    InvariantViolation(&'static str),
}

//! `fabricsim` emulates a datacenter packet fabric (endpoints, top-of-rack
//! routers, an optional core router) at timeslot granularity: each timeslot
//! every endpoint may inject and receive at most one MTU-sized packet, and
//! every router forwards packets from ingress to egress ports according to
//! a configurable queueing discipline (drop-tail, RED, DCTCP, HULL).
//!
//! The crate is driven by an external allocator: it pushes demand through
//! [`Emulation::add_backlog`] and collects admitted/dropped edges from the
//! [`Vec`] of batches [`Emulation::run`] returns. See the `topology` module
//! to build an [`Emulation`] from a [`config::TopologyConfig`];
//! `src/bin/fabricsim_run.rs` is a minimal demo allocator that exercises the
//! library end to end.

pub mod admitted;
pub mod config;
pub mod core;
pub mod driver;
pub mod emulation;
pub mod endpoint;
pub mod error;
pub mod mempool;
pub mod output;
pub mod packet;
pub mod queue_bank;
pub mod ring;
pub mod router;
pub mod stats;
pub mod topology;

pub use emulation::Emulation;
pub use error::FabricError;
pub use packet::{EndpointId, FlowId, PacketIdx};

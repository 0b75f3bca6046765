//! The packet handle and its backing arena.
//!
//! A [`Packet`] in this emulator is never boxed or reference counted: it is
//! a move-only index into a [`PacketArena`], following the same
//! index-not-pointer discipline the teacher uses for ring buffer slots
//! (`BufIdx`, see `crate::ring`). This sidesteps the cyclic-ownership
//! problem a pointer-based packet would create between endpoints and
//! routers, and keeps the hot path allocation-free after startup.

use core::fmt;
use std::cell::UnsafeCell;

/// Endpoint identifier, 16-bit per spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct EndpointId(pub u16);

/// Application flow identifier, opaque to the fabric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct FlowId(pub u16);

/// Index of a packet's backing cell in a [`PacketArena`].
///
/// Not comparable to a raw `u32` outside the arena; masking/validity is the
/// arena's responsibility, mirroring the teacher's `BufIdx`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PacketIdx(pub u32);

bitflags::bitflags! {
    /// Discipline hints carried on a packet: ECN-capability, having been
    /// marked by a router (DCTCP/HULL), or carrying a drop hint.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PacketFlags: u8 {
        const ECN_CAPABLE = 1 << 0;
        const MARKED      = 1 << 1;
        const DROP_HINTED = 1 << 2;
    }
}

/// The data held for one packet slot in the arena.
#[derive(Debug, Clone, Copy)]
pub struct PacketCell {
    pub src: EndpointId,
    pub dst: EndpointId,
    pub flow: FlowId,
    pub flags: PacketFlags,
}

impl PacketCell {
    fn new(src: EndpointId, dst: EndpointId, flow: FlowId) -> Self {
        PacketCell {
            src,
            dst,
            flow,
            flags: PacketFlags::empty(),
        }
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Fixed-size backing store for every packet in flight.
///
/// Indices are recycled through the packet mempool (`crate::mempool`); the
/// arena itself never grows or shrinks after construction. Exactly one
/// component holds a given [`PacketIdx`] at a time, by convention (spec
/// §3's ownership invariant) -- cells are `UnsafeCell`-wrapped, the same
/// trusted-disjoint-access discipline `crate::ring::Ring` already uses for
/// its slots, since cores run on separate OS threads (spec §5) and each
/// touches only the cells named by the indices it currently owns.
pub struct PacketArena {
    cells: Box<[UnsafeCell<PacketCell>]>,
}

// Safety: two cores never hold the same `PacketIdx` at once (spec §3's
// ownership invariant, also exercised by the conservation tests in
// `tests/scenarios.rs`), so concurrent `get`/`init`/`set_flags` calls from
// different cores always target disjoint cells.
unsafe impl Sync for PacketArena {}

impl PacketArena {
    pub fn new(capacity: usize) -> Self {
        let mut cells = Vec::with_capacity(capacity);
        cells.resize_with(capacity, || {
            UnsafeCell::new(PacketCell::new(EndpointId(0), EndpointId(0), FlowId(0)))
        });
        PacketArena {
            cells: cells.into_boxed_slice(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.cells.len()
    }

    #[inline]
    pub fn init(&self, idx: PacketIdx, src: EndpointId, dst: EndpointId, flow: FlowId) {
        unsafe {
            *self.cells[idx.0 as usize].get() = PacketCell::new(src, dst, flow);
        }
    }

    #[inline]
    pub fn get(&self, idx: PacketIdx) -> PacketCell {
        unsafe { *self.cells[idx.0 as usize].get() }
    }

    /// Set a packet's discipline flags in place (spec §4.3's DCTCP/HULL
    /// ECN marking).
    #[inline]
    pub fn set_flags(&self, idx: PacketIdx, flags: PacketFlags) {
        unsafe {
            (*self.cells[idx.0 as usize].get()).flags = flags;
        }
    }
}

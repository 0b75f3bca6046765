//! Bounded, lock-free rings: the only primitive used to share mutable state
//! across cores (spec §5).
//!
//! The design generalizes the teacher's `XskRing`/`XskRingProd`/`XskRingCons`
//! (`examples/HeroicKatora-xdpilone/src/xsk/ring.rs`): a fixed power-of-two
//! slot array, a producer-owned head and consumer-owned tail. The teacher's
//! version is specialized to descriptor/address rings backed by an `mmap`
//! with exactly one writer and one reader; this version is generic over `T`
//! and lives entirely in process memory, and keeps the same reserve/commit
//! and peek/release shape (compare `WriteTx`/`ReadRx` in `xsk/user.rs`, the
//! direct model for [`Ring::enqueue_bulk`]/[`Ring::dequeue_burst`]) for the
//! [`Spsc`] case.
//!
//! Producer/consumer cardinality (spec §4.1) is a type parameter, not a
//! runtime flag, so mixing up the two is a compile error rather than a race
//! discovered at 2 a.m. [`Mpmc`] cannot reuse the SPSC scheme directly: a
//! single shared `head` would let a consumer observe a slot reservation
//! before the producer that claimed it has written the slot, reading
//! uninitialized memory or a stale value. Instead each side keeps a
//! reservation cursor (claimed via `compare_exchange`, giving out a
//! contiguous range to exactly one caller) and a separate publish cursor
//! that a caller advances only after its own slot writes/reads are done,
//! spinning until every earlier reservation on that side has published
//! first so the publish cursor advances in the same order slots were
//! claimed. This is the same head/tail-sync (`RTE_RING_SYNC_MT_HTS`)
//! discipline DPDK's `rte_ring` uses for its multi-producer/multi-consumer
//! mode -- a natural model to borrow given the teacher is itself an
//! AF_XDP/DPDK-adjacent zero-copy ring library.

use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU32, Ordering};

mod private {
    pub trait Sealed {}
}

/// Declares how many producers/consumers a [`Ring`] may have.
pub trait Cardinality: private::Sealed {
    const MULTI_PRODUCER: bool;
    const MULTI_CONSUMER: bool;
}

/// Single-producer/single-consumer ring.
pub struct Spsc;
/// Multi-producer/multi-consumer ring.
pub struct Mpmc;

impl private::Sealed for Spsc {}
impl private::Sealed for Mpmc {}

impl Cardinality for Spsc {
    const MULTI_PRODUCER: bool = false;
    const MULTI_CONSUMER: bool = false;
}

impl Cardinality for Mpmc {
    const MULTI_PRODUCER: bool = true;
    const MULTI_CONSUMER: bool = true;
}

/// A bounded FIFO ring of `T`, shared only through atomics -- no locks.
///
/// Capacity is rounded to the next power of two; enqueue order from a
/// single producer is preserved on dequeue (spec §4.1's ordering
/// guarantee). `head`/`tail` are the *published* cursors: data below `head`
/// is visible to consumers and slots below `tail` are free for producers to
/// reuse. [`Mpmc`] additionally uses `head_reserve`/`tail_reserve` to hand
/// out non-overlapping ranges before a slot's write/read has completed;
/// [`Spsc`] leaves them at zero and touches only the published cursors,
/// since a single producer/consumer never needs a separate reservation
/// step.
pub struct Ring<T, K: Cardinality> {
    mask: u32,
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
    head: AtomicU32,
    tail: AtomicU32,
    head_reserve: AtomicU32,
    tail_reserve: AtomicU32,
    _kind: PhantomData<K>,
}

// Safety: access to `slots` is only ever performed on indices exclusively
// reserved by `head`/`tail` (or, for `Mpmc`, `head_reserve`/`tail_reserve`)
// arithmetic, which is itself synchronized by the atomics above. `T: Send`
// is required to move values across threads.
unsafe impl<T: Send, K: Cardinality> Sync for Ring<T, K> {}
unsafe impl<T: Send, K: Cardinality> Send for Ring<T, K> {}

impl<T, K: Cardinality> Ring<T, K> {
    /// Create a new ring. `capacity` is rounded up to the next power of two.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1).next_power_of_two();
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || UnsafeCell::new(MaybeUninit::uninit()));

        Ring {
            mask: capacity as u32 - 1,
            slots: slots.into_boxed_slice(),
            head: AtomicU32::new(0),
            tail: AtomicU32::new(0),
            head_reserve: AtomicU32::new(0),
            tail_reserve: AtomicU32::new(0),
            _kind: PhantomData,
        }
    }

    pub fn capacity(&self) -> usize {
        self.mask as usize + 1
    }

    #[inline]
    fn slot(&self, pos: u32) -> *mut MaybeUninit<T> {
        self.slots[(pos & self.mask) as usize].get()
    }

    /// Number of items currently published (may be stale under concurrent
    /// access from the other side, which is fine: every caller re-checks
    /// via the atomic index before touching a slot).
    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        head.wrapping_sub(tail) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Ring<T, Spsc> {
    /// Enqueue a single item. Never blocks; returns the item back on `FULL`.
    pub fn enqueue(&self, item: T) -> Result<(), T> {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        if head.wrapping_sub(tail) >= self.capacity() as u32 {
            return Err(item);
        }
        unsafe { self.slot(head).write(MaybeUninit::new(item)) };
        self.head.store(head.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// All-or-nothing bulk enqueue. Returns `false` (no side effect) if
    /// there isn't room for every item.
    pub fn enqueue_bulk(&self, items: &mut Vec<T>) -> bool {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        let free = self.capacity() as u32 - head.wrapping_sub(tail);
        if (items.len() as u32) > free {
            return false;
        }
        for (i, item) in items.drain(..).enumerate() {
            unsafe {
                self.slot(head.wrapping_add(i as u32))
                    .write(MaybeUninit::new(item))
            };
        }
        self.head
            .store(head.wrapping_add(items.len() as u32), Ordering::Release);
        true
    }

    /// Dequeue up to `max` items, in FIFO order, appending them to `out`.
    /// Returns the number dequeued.
    pub fn dequeue_burst(&self, out: &mut Vec<T>, max: usize) -> usize {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        let available = head.wrapping_sub(tail) as usize;
        let n = available.min(max);
        out.reserve(n);
        for i in 0..n {
            let value = unsafe { self.slot(tail.wrapping_add(i as u32)).read().assume_init() };
            out.push(value);
        }
        self.tail.store(tail.wrapping_add(n as u32), Ordering::Release);
        n
    }

    pub fn dequeue(&self) -> Option<T> {
        let mut out = Vec::with_capacity(1);
        if self.dequeue_burst(&mut out, 1) == 1 {
            out.pop()
        } else {
            None
        }
    }
}

impl<T> Ring<T, Mpmc> {
    /// Claim `n` contiguous slots for writing against `tail` (the published
    /// consumer cursor: slots below it are free even if a concurrent
    /// consumer has reserved-but-not-yet-finished reading further back).
    /// Returns the reserved range's start, or `None` if there isn't enough
    /// free capacity right now.
    fn reserve_enqueue(&self, n: u32) -> Option<u32> {
        loop {
            let head = self.head_reserve.load(Ordering::Relaxed);
            let tail = self.tail.load(Ordering::Acquire);
            let free = self.capacity() as u32 - head.wrapping_sub(tail);
            if n > free {
                return None;
            }
            if self
                .head_reserve
                .compare_exchange_weak(
                    head,
                    head.wrapping_add(n),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                return Some(head);
            }
        }
    }

    /// Publish a completed write of `[start, start + n)`. Spins until every
    /// earlier reservation on this side has published, so `head` only ever
    /// advances over slots that are fully written -- a concurrent consumer
    /// acquiring `head` is guaranteed to see initialized data.
    fn publish_enqueue(&self, start: u32, n: u32) {
        while self.head.load(Ordering::Relaxed) != start {
            std::hint::spin_loop();
        }
        self.head.store(start.wrapping_add(n), Ordering::Release);
    }

    /// Claim up to `max` contiguous slots for reading against `head` (the
    /// published producer cursor: only fully-written data is available).
    /// Returns `(start, n)`, `n` possibly zero.
    fn reserve_dequeue(&self, max: usize) -> Option<(u32, u32)> {
        loop {
            let tail = self.tail_reserve.load(Ordering::Relaxed);
            let head = self.head.load(Ordering::Acquire);
            let available = head.wrapping_sub(tail) as usize;
            let n = available.min(max) as u32;
            if n == 0 {
                return None;
            }
            if self
                .tail_reserve
                .compare_exchange_weak(
                    tail,
                    tail.wrapping_add(n),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                return Some((tail, n));
            }
        }
    }

    /// Publish a completed read of `[start, start + n)`, freeing those
    /// slots for producers to reuse. Spins until every earlier reservation
    /// on this side has published first, for the same reason `head` does.
    fn publish_dequeue(&self, start: u32, n: u32) {
        while self.tail.load(Ordering::Relaxed) != start {
            std::hint::spin_loop();
        }
        self.tail.store(start.wrapping_add(n), Ordering::Release);
    }

    /// Enqueue a single item, retrying the reservation under contention from
    /// other producers. Never blocks on the consumer side.
    pub fn enqueue(&self, item: T) -> Result<(), T> {
        let Some(start) = self.reserve_enqueue(1) else {
            return Err(item);
        };
        unsafe { self.slot(start).write(MaybeUninit::new(item)) };
        self.publish_enqueue(start, 1);
        Ok(())
    }

    /// All-or-nothing bulk enqueue, reserving a contiguous range with one
    /// `compare_exchange` against concurrent producers.
    pub fn enqueue_bulk(&self, items: &mut Vec<T>) -> bool {
        let n = items.len() as u32;
        let Some(start) = self.reserve_enqueue(n) else {
            return false;
        };
        for (i, item) in items.drain(..).enumerate() {
            unsafe {
                self.slot(start.wrapping_add(i as u32))
                    .write(MaybeUninit::new(item))
            };
        }
        self.publish_enqueue(start, n);
        true
    }

    pub fn dequeue_burst(&self, out: &mut Vec<T>, max: usize) -> usize {
        let Some((start, n)) = self.reserve_dequeue(max) else {
            return 0;
        };
        out.reserve(n as usize);
        for i in 0..n {
            let value = unsafe { self.slot(start.wrapping_add(i)).read().assume_init() };
            out.push(value);
        }
        self.publish_dequeue(start, n);
        n as usize
    }

    pub fn dequeue(&self) -> Option<T> {
        let mut out = Vec::with_capacity(1);
        if self.dequeue_burst(&mut out, 1) == 1 {
            out.pop()
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spsc_fifo_order() {
        let ring: Ring<u32, Spsc> = Ring::new(4);
        assert!(ring.enqueue(1).is_ok());
        assert!(ring.enqueue(2).is_ok());
        assert!(ring.enqueue(3).is_ok());
        let mut out = Vec::new();
        assert_eq!(ring.dequeue_burst(&mut out, 10), 3);
        assert_eq!(out, vec![1, 2, 3]);
    }

    #[test]
    fn spsc_full_rejects() {
        let ring: Ring<u32, Spsc> = Ring::new(2);
        assert!(ring.enqueue(1).is_ok());
        assert!(ring.enqueue(2).is_ok());
        assert_eq!(ring.enqueue(3), Err(3));
    }

    #[test]
    fn bulk_enqueue_all_or_nothing() {
        let ring: Ring<u32, Spsc> = Ring::new(2);
        let mut items = vec![1, 2, 3];
        assert!(!ring.enqueue_bulk(&mut items));
        assert_eq!(items, vec![1, 2, 3], "rejected bulk enqueue must not consume items");

        let mut items = vec![1, 2];
        assert!(ring.enqueue_bulk(&mut items));
        assert!(items.is_empty());
    }

    #[test]
    fn mpmc_round_trip() {
        let ring: Ring<u32, Mpmc> = Ring::new(8);
        for i in 0..8 {
            assert!(ring.enqueue(i).is_ok());
        }
        assert!(ring.enqueue(100).is_err());
        let mut out = Vec::new();
        assert_eq!(ring.dequeue_burst(&mut out, 8), 8);
        assert_eq!(out, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn mpmc_concurrent_producers_preserve_all_items() {
        use std::sync::Arc;

        let ring: Arc<Ring<u32, Mpmc>> = Arc::new(Ring::new(1024));
        std::thread::scope(|scope| {
            for t in 0..4u32 {
                let ring = ring.clone();
                scope.spawn(move || {
                    for i in 0..100u32 {
                        while ring.enqueue(t * 1000 + i).is_err() {
                            std::thread::yield_now();
                        }
                    }
                });
            }
        });

        let mut out = Vec::new();
        assert_eq!(ring.dequeue_burst(&mut out, 1024), 400);
    }

    /// Regression test for the publish-before-write race: with many
    /// producers racing many consumers on a small ring, every dequeued
    /// value must be one that was actually, fully written -- never
    /// uninitialized memory and never a value seen twice.
    #[test]
    fn mpmc_concurrent_producers_and_consumers_never_observe_torn_writes() {
        use std::sync::atomic::AtomicUsize;
        use std::sync::Arc;

        let ring: Arc<Ring<u32, Mpmc>> = Arc::new(Ring::new(16));
        const PER_PRODUCER: u32 = 2000;
        const PRODUCERS: u32 = 6;
        let consumed = Arc::new(AtomicUsize::new(0));
        let target = (PER_PRODUCER * PRODUCERS) as usize;
        let seen_sum = Arc::new(std::sync::atomic::AtomicU64::new(0));

        std::thread::scope(|scope| {
            for t in 0..PRODUCERS {
                let ring = ring.clone();
                scope.spawn(move || {
                    for i in 0..PER_PRODUCER {
                        let value = t * PER_PRODUCER + i;
                        while ring.enqueue(value).is_err() {
                            std::thread::yield_now();
                        }
                    }
                });
            }
            for _ in 0..3 {
                let ring = ring.clone();
                let consumed = consumed.clone();
                let seen_sum = seen_sum.clone();
                scope.spawn(move || {
                    let mut buf = Vec::new();
                    while consumed.load(Ordering::Relaxed) < target {
                        buf.clear();
                        let n = ring.dequeue_burst(&mut buf, 8);
                        if n == 0 {
                            std::thread::yield_now();
                            continue;
                        }
                        // every value is below the known total range; a torn
                        // read of an uninitialized slot would very likely
                        // produce a value outside it (or a double-counted
                        // duplicate caught by the sum check below).
                        for &v in &buf {
                            assert!(
                                v < PER_PRODUCER * PRODUCERS,
                                "observed a value outside the producers' range: {v}"
                            );
                        }
                        seen_sum.fetch_add(buf.iter().map(|&v| v as u64).sum(), Ordering::Relaxed);
                        consumed.fetch_add(n, Ordering::Relaxed);
                    }
                });
            }
        });

        assert_eq!(consumed.load(Ordering::Relaxed), target);
        let expected_sum: u64 = (0..PER_PRODUCER * PRODUCERS).map(|v| v as u64).sum();
        assert_eq!(
            seen_sum.load(Ordering::Relaxed),
            expected_sum,
            "every produced value must be consumed exactly once, with no duplicates or corruption"
        );
    }
}

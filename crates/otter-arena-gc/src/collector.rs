//! Concurrent mark/sweep pass
//!
//! The collector owns the mark list (`mark_next`, headed by the sentinel).
//! A pass runs while mutators keep allocating and storing:
//!
//! 1. Enter `Marking` so the write barrier records newly exposed blocks.
//! 2. Absorb the handoff list into the mark list.
//! 3. Clear every mark on the mark list.
//! 4. Mark from blocks with a non-zero root count, then from the barrier
//!    buffer. The last drain runs with barrier sections excluded.
//! 5. Still exclusive: absorb blocks published during marking (they were
//!    allocated marked), unlink unmarked blocks from the mark list, null weak
//!    slots pointing at them, then flag them `sweep = 1`.
//!
//! After step 5 the collector never reads a condemned block again; the
//! allocator reclaims the bytes on its next walk past it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rustc_hash::FxHashSet;

use crate::allocator::Allocator;
use crate::arena::Arena;
use crate::barrier::{GcPhase, WriteBarrier};
use crate::descriptor::DescriptorTable;
use crate::error::{GcError, GcResult};
use crate::handoff::HandoffList;
use crate::object::{ALIGN, HEADER_SIZE, HeaderPtr, RefSlot, SLOT_SIZE};

/// Barrier drains attempted before taking the gate exclusively
const CONCURRENT_DRAIN_ROUNDS: usize = 4;

/// GC statistics
#[derive(Debug, Default, Clone)]
pub struct GcStats {
    /// Completed collector passes
    pub passes: u64,
    /// Successful allocations
    pub allocations: u64,
    /// Allocations that returned `OutOfMemory`
    pub failed_allocations: u64,
    /// Blocks moved from the handoff list into the mark list
    pub absorbed: u64,
    /// Blocks flagged dead
    pub swept: u64,
    /// Dead blocks the allocator has unlinked and reused
    pub reclaimed_blocks: u64,
    /// Bytes of those blocks
    pub reclaimed_bytes: u64,
    /// Weak slots nulled because their referent died
    pub weak_cleared: u64,
    /// Write barrier entries traced
    pub barrier_entries: u64,
    /// Blocks marked in the last pass
    pub last_marked: usize,
    /// Time spent in passes
    pub total_pass_time: Duration,
    /// Duration of the last pass
    pub last_pass_time: Duration,
}

/// Outcome of one collector pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassReport {
    /// Pass number, starting at 1
    pub pass: u64,
    /// Blocks absorbed from the handoff list
    pub absorbed: usize,
    /// Blocks marked reachable
    pub marked: usize,
    /// Blocks flagged dead
    pub swept: usize,
    /// Weak slots nulled
    pub weak_cleared: usize,
    /// Write barrier entries traced
    pub barrier_entries: usize,
    /// Blocks left on the mark list
    pub tracked: usize,
    /// Wall time of the pass
    pub duration: Duration,
}

/// Consistency report from `GcHeap::verify`
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HeapReport {
    /// Live blocks on the allocation list, sentinel excluded
    pub blocks: usize,
    /// Bytes held by those blocks
    pub bytes_in_use: usize,
    /// Bytes not held by a live block, dead blocks included
    pub free_bytes: usize,
    /// Largest contiguous run of free bytes
    pub largest_gap: usize,
    /// Dead blocks still linked on the allocation list
    pub pending_reclaim: usize,
    /// Blocks on the mark list, sentinel excluded
    pub tracked: usize,
    /// Blocks waiting on the handoff list
    pub pending_handoff: usize,
}

pub(crate) struct Collector {
    state: Mutex<CollectorState>,
    totals: Mutex<GcStats>,
    passes: AtomicU64,
}

struct CollectorState {
    /// Mark list length, sentinel excluded
    tracked: usize,
    stack: Vec<HeaderPtr>,
    condemned: Vec<HeaderPtr>,
    condemned_set: FxHashSet<usize>,
}

impl Collector {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(CollectorState {
                tracked: 0,
                stack: Vec::with_capacity(256),
                condemned: Vec::new(),
                condemned_set: FxHashSet::default(),
            }),
            totals: Mutex::new(GcStats::default()),
            passes: AtomicU64::new(0),
        }
    }

    pub(crate) fn passes(&self) -> u64 {
        self.passes.load(Ordering::Acquire)
    }

    /// Collector-side counters (`passes` through `last_pass_time`)
    pub(crate) fn totals(&self) -> GcStats {
        self.totals.lock().clone()
    }

    /// Run one full pass on the calling thread.
    pub(crate) fn collect(
        &self,
        arena: &Arena,
        handoff: &HandoffList,
        barrier: &WriteBarrier,
        descriptors: &DescriptorTable,
    ) -> PassReport {
        let mut state = self.state.lock();
        let start = Instant::now();
        let sentinel = arena.sentinel();
        let mut report = PassReport::default();

        barrier.exclusive().set_phase(GcPhase::Marking);

        report.absorbed = state.absorb(sentinel, handoff);
        state.clear_marks(sentinel);
        report.marked = state.mark_roots(sentinel, descriptors);

        for _ in 0..CONCURRENT_DRAIN_ROUNDS {
            let entries = barrier.drain();
            if entries.is_empty() {
                break;
            }
            report.barrier_entries += entries.len();
            report.marked += state.mark_from(&entries, descriptors);
        }

        {
            let exclusive = barrier.exclusive();
            let entries = exclusive.drain();
            report.barrier_entries += entries.len();
            report.marked += state.mark_from(&entries, descriptors);
            exclusive.set_phase(GcPhase::Sweeping);

            report.absorbed += state.absorb(sentinel, handoff);
            report.swept = state.condemn(sentinel);
            report.weak_cleared = state.clear_weak(sentinel);
            state.publish_condemned();

            exclusive.set_phase(GcPhase::Idle);
        }

        report.tracked = state.tracked;
        report.duration = start.elapsed();
        report.pass = self.passes.fetch_add(1, Ordering::AcqRel) + 1;
        drop(state);

        {
            let mut totals = self.totals.lock();
            totals.passes = totals.passes.max(report.pass);
            totals.absorbed += report.absorbed as u64;
            totals.swept += report.swept as u64;
            totals.weak_cleared += report.weak_cleared as u64;
            totals.barrier_entries += report.barrier_entries as u64;
            totals.last_marked = report.marked;
            totals.total_pass_time += report.duration;
            totals.last_pass_time = report.duration;
        }

        #[cfg(feature = "gc_logging")]
        tracing::debug!(
            target: "otter::arena_gc",
            pass = report.pass,
            absorbed = report.absorbed,
            marked = report.marked,
            swept = report.swept,
            weak_cleared = report.weak_cleared,
            barrier_entries = report.barrier_entries,
            tracked = report.tracked,
            elapsed_us = report.duration.as_micros() as u64,
            "collection pass complete"
        );

        report
    }

    /// Walk every list and check the heap invariants.
    ///
    /// Holds the collector and the allocator for the duration, in that order.
    pub(crate) fn verify(
        &self,
        arena: &Arena,
        handoff: &HandoffList,
        allocator: &Allocator,
    ) -> GcResult<HeapReport> {
        let state = self.state.lock();
        let _walk = allocator.pause();

        let sentinel = arena.sentinel();
        let mut report = HeapReport::default();
        let mut live = FxHashSet::default();

        let mut prev_end = arena.start() + HEADER_SIZE;
        let mut free_run = 0;
        // SAFETY: the sentinel is permanent
        let mut cursor = HeaderPtr::from_raw(
            unsafe { sentinel.get() }
                .alloc_next
                .load(Ordering::Acquire),
        );
        while let Some(node) = cursor {
            let addr = node.addr();
            if addr < prev_end {
                return Err(corrupted(format!(
                    "block {addr:#x} overlaps its predecessor"
                )));
            }
            if !arena.contains(addr, HEADER_SIZE) {
                return Err(corrupted(format!("block {addr:#x} lies outside the arena")));
            }
            // SAFETY: the header lies inside the arena and walks are paused
            let header = unsafe { node.get() };
            let len = header.block_len();
            if len < HEADER_SIZE || len % ALIGN != 0 || !arena.contains(addr, len) {
                return Err(corrupted(format!("block {addr:#x} has bad length {len}")));
            }

            free_run += addr - prev_end;
            if header.is_swept() {
                report.pending_reclaim += 1;
                free_run += len;
            } else {
                report.largest_gap = report.largest_gap.max(free_run);
                free_run = 0;
                report.blocks += 1;
                report.bytes_in_use += len;
                live.insert(addr);
            }
            prev_end = addr + len;
            cursor = HeaderPtr::from_raw(header.alloc_next.load(Ordering::Acquire));
        }
        free_run += arena.end() - prev_end;
        report.largest_gap = report.largest_gap.max(free_run);
        report.free_bytes = arena.capacity() - HEADER_SIZE - report.bytes_in_use;

        let mut tracked = FxHashSet::default();
        for node in mark_list(sentinel, &live) {
            let node = node?;
            if !tracked.insert(node.addr()) {
                return Err(corrupted(format!("mark list loops at {:#x}", node.addr())));
            }
            // SAFETY: node is a live block on the allocation list
            if unsafe { node.get() }.is_pending() {
                return Err(corrupted(format!(
                    "tracked block {:#x} is still waiting for handoff",
                    node.addr()
                )));
            }
        }
        report.tracked = tracked.len();
        if report.tracked != state.tracked {
            return Err(corrupted(format!(
                "mark list holds {} blocks, expected {}",
                report.tracked, state.tracked
            )));
        }

        let mut pending = FxHashSet::default();
        let mut cursor = handoff.head();
        while let Some(node) = cursor {
            let addr = node.addr();
            if !live.contains(&addr) {
                return Err(corrupted(format!(
                    "handoff block {addr:#x} is not a live allocation"
                )));
            }
            if tracked.contains(&addr) {
                return Err(corrupted(format!("block {addr:#x} is on both lists")));
            }
            if !pending.insert(addr) {
                return Err(corrupted(format!("handoff list loops at {addr:#x}")));
            }
            // SAFETY: node is a live block on the allocation list
            let header = unsafe { node.get() };
            if !header.is_pending() {
                return Err(corrupted(format!("handoff block {addr:#x} lacks addme")));
            }
            cursor = HeaderPtr::from_raw(header.addme_next.load(Ordering::Relaxed));
        }
        report.pending_handoff = pending.len();
        if report.pending_handoff != handoff.pending() {
            return Err(corrupted(format!(
                "handoff list holds {} blocks, {} published",
                report.pending_handoff,
                handoff.pending()
            )));
        }

        if report.tracked + report.pending_handoff != report.blocks {
            return Err(corrupted(format!(
                "{} live blocks are on neither the mark list nor the handoff list",
                report.blocks - report.tracked - report.pending_handoff
            )));
        }

        Ok(report)
    }
}

impl CollectorState {
    /// Move every published block onto the mark list, after the sentinel.
    fn absorb(&mut self, sentinel: HeaderPtr, handoff: &HandoffList) -> usize {
        // SAFETY: the sentinel is permanent
        let head = unsafe { sentinel.get() };
        let mut absorbed = 0;
        for node in handoff.take() {
            // SAFETY: published blocks stay valid until this collector
            // sweeps them
            let header = unsafe { node.get() };
            header.clear_pending();
            header
                .mark_next
                .store(head.mark_next.load(Ordering::Relaxed), Ordering::Relaxed);
            head.mark_next.store(node.as_ptr(), Ordering::Relaxed);
            absorbed += 1;
        }
        self.tracked += absorbed;
        absorbed
    }

    fn clear_marks(&self, sentinel: HeaderPtr) {
        let mut cursor = successor(sentinel);
        while let Some(node) = cursor {
            // SAFETY: blocks on the mark list are not swept
            let header = unsafe { node.get() };
            header.set_mark(false);
            cursor = successor(node);
        }
    }

    fn mark_roots(&mut self, sentinel: HeaderPtr, descriptors: &DescriptorTable) -> usize {
        let mut marked = 0;
        let mut cursor = successor(sentinel);
        while let Some(node) = cursor {
            // SAFETY: blocks on the mark list are not swept
            let header = unsafe { node.get() };
            if header.rrcnt() > 0 && !header.marked_relaxed() {
                header.set_mark(true);
                self.stack.push(node);
                marked += 1 + self.trace(descriptors);
            }
            cursor = successor(node);
        }
        marked
    }

    fn mark_from(&mut self, entries: &[HeaderPtr], descriptors: &DescriptorTable) -> usize {
        let mut marked = 0;
        for &node in entries {
            // SAFETY: the barrier only records blocks a mutator holds live
            let header = unsafe { node.get() };
            if !header.marked_relaxed() {
                header.set_mark(true);
                self.stack.push(node);
                marked += 1 + self.trace(descriptors);
            }
        }
        marked
    }

    /// Drain the work stack, marking every unmarked child. Returns the number
    /// of blocks newly marked.
    fn trace(&mut self, descriptors: &DescriptorTable) -> usize {
        let stack = &mut self.stack;
        let mut marked = 0;
        while let Some(node) = stack.pop() {
            // SAFETY: only marked, reachable blocks are pushed
            let header = unsafe { node.get() };
            if header.is_weakref() {
                continue;
            }

            let mut visit = |slot: &RefSlot| {
                if let Some(child) = slot.get() {
                    let child = child.header_ptr();
                    // SAFETY: slots only hold live blocks
                    let child_header = unsafe { child.get() };
                    if !child_header.marked_relaxed() {
                        child_header.set_mark(true);
                        marked += 1;
                        stack.push(child);
                    }
                }
            };

            if header.is_refarray() {
                for index in 0..header.slot_count() {
                    // SAFETY: index is within the payload
                    visit(unsafe { node.slot_at(index * SLOT_SIZE) });
                }
            } else if let Some(descriptor) = descriptors.get(header.type_tag()) {
                // SAFETY: create_ref checked the payload against min_payload
                unsafe { descriptor.visit(node.payload(), &mut visit) };
            }
        }
        marked
    }

    /// Unlink unmarked blocks from the mark list.
    fn condemn(&mut self, sentinel: HeaderPtr) -> usize {
        let mut prev = sentinel;
        let mut cursor = successor(sentinel);
        while let Some(node) = cursor {
            // SAFETY: blocks on the mark list are not swept
            let header = unsafe { node.get() };
            let next = header.mark_next.load(Ordering::Relaxed);
            if header.marked_relaxed() {
                prev = node;
            } else {
                debug_assert_eq!(header.rrcnt(), 0, "rooted block left unmarked");
                // SAFETY: prev is the sentinel or a surviving block
                let prev_header = unsafe { prev.get() };
                prev_header.mark_next.store(next, Ordering::Relaxed);
                self.condemned.push(node);
                self.condemned_set.insert(node.addr());
            }
            cursor = HeaderPtr::from_raw(next);
        }
        self.tracked -= self.condemned.len();
        self.condemned.len()
    }

    /// Null weak slots whose referent was condemned this pass.
    fn clear_weak(&self, sentinel: HeaderPtr) -> usize {
        if self.condemned_set.is_empty() {
            return 0;
        }
        let mut cleared = 0;
        let mut cursor = successor(sentinel);
        while let Some(node) = cursor {
            // SAFETY: blocks on the mark list are not swept
            let header = unsafe { node.get() };
            if header.is_weakref() && header.slot_count() > 0 {
                // SAFETY: weak blocks hold at least one slot
                let slot = unsafe { node.slot_at(0) };
                if let Some(target) = slot.get()
                    && self.condemned_set.contains(&target.header_ptr().addr())
                    && slot.clear_if(target)
                {
                    cleared += 1;
                }
            }
            cursor = successor(node);
        }
        cleared
    }

    /// Hand condemned blocks to the allocator. They are not read again.
    fn publish_condemned(&mut self) {
        for node in self.condemned.drain(..) {
            // SAFETY: condemned blocks are unlinked but not yet reclaimable
            unsafe { node.get() }.set_swept();
        }
        self.condemned_set.clear();
    }
}

/// Mark list iterator for verification. Stops with an error at the first
/// block that is not a live allocation.
fn mark_list(
    sentinel: HeaderPtr,
    live: &FxHashSet<usize>,
) -> impl Iterator<Item = GcResult<HeaderPtr>> + '_ {
    let mut cursor = successor(sentinel);
    let mut failed = false;
    std::iter::from_fn(move || {
        if failed {
            return None;
        }
        let node = cursor?;
        if !live.contains(&node.addr()) {
            failed = true;
            return Some(Err(corrupted(format!(
                "tracked block {:#x} is not a live allocation",
                node.addr()
            ))));
        }
        cursor = successor(node);
        Some(Ok(node))
    })
}

fn successor(node: HeaderPtr) -> Option<HeaderPtr> {
    // SAFETY: callers only pass the sentinel or blocks on the mark list
    HeaderPtr::from_raw(unsafe { node.get() }.mark_next.load(Ordering::Relaxed))
}

fn corrupted(detail: String) -> GcError {
    #[cfg(feature = "gc_logging")]
    tracing::error!(target: "otter::arena_gc", %detail, "heap verification failed");
    GcError::Corrupted(detail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::TypeTag;
    use crate::object::{BlockHeader, GcRef, flags};
    use std::ptr;

    struct Fixture {
        arena: Arena,
        handoff: HandoffList,
        barrier: WriteBarrier,
        descriptors: DescriptorTable,
        allocator: Allocator,
        collector: Collector,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                arena: Arena::new(4096).unwrap(),
                handoff: HandoffList::new(),
                barrier: WriteBarrier::new(),
                descriptors: DescriptorTable::new(),
                allocator: Allocator::new(),
                collector: Collector::new(),
            }
        }

        fn alloc(&self, len: usize, alloc_flags: u8) -> GcRef {
            let node = self
                .allocator
                .allocate(&self.arena, &self.handoff, len, TypeTag::LEAF, alloc_flags)
                .unwrap();
            GcRef::from_header(node)
        }

        fn collect(&self) -> PassReport {
            self.collector
                .collect(&self.arena, &self.handoff, &self.barrier, &self.descriptors)
        }

        fn verify(&self) -> HeapReport {
            self.try_verify().unwrap()
        }

        fn try_verify(&self) -> GcResult<HeapReport> {
            self.collector
                .verify(&self.arena, &self.handoff, &self.allocator)
        }

        /// Link `block` right after the sentinel on the mark list.
        unsafe fn push_tracked(&self, block: GcRef) {
            let sentinel = unsafe { self.arena.sentinel().get() };
            let node = block.header_ptr();
            let head = sentinel.mark_next.load(Ordering::Relaxed);
            let header = unsafe { node.get() };
            header.mark_next.store(head, Ordering::Relaxed);
            sentinel.mark_next.store(node.as_ptr(), Ordering::Relaxed);
        }
    }

    fn assert_corrupted(result: GcResult<HeapReport>, needle: &str) {
        match result {
            Err(GcError::Corrupted(detail)) => {
                assert!(detail.contains(needle), "unexpected detail: {detail}")
            }
            other => panic!("expected corruption, got {other:?}"),
        }
    }

    #[test]
    fn test_unrooted_block_is_swept() {
        let fx = Fixture::new();
        let root = fx.alloc(64, flags::ROOT);
        let garbage = fx.alloc(64, 0);

        let report = fx.collect();
        assert_eq!(report.pass, 1);
        assert_eq!(report.absorbed, 2);
        assert_eq!(report.swept, 1);
        assert_eq!(report.tracked, 1);
        unsafe {
            assert!(!root.info().swept);
            assert!(garbage.info().swept);
        }
        assert_eq!(fx.collector.passes(), 1);
    }

    #[test]
    fn test_refarray_children_survive() {
        let fx = Fixture::new();
        let parent = fx.alloc(HEADER_SIZE + 2 * SLOT_SIZE, flags::ROOT | flags::REFARRAY);
        let child = fx.alloc(64, 0);
        unsafe { parent.slot(1) }.set(Some(child));

        let report = fx.collect();
        assert_eq!(report.swept, 0);
        assert_eq!(report.marked, 2);
        assert!(!unsafe { child.info() }.swept);
    }

    #[test]
    fn test_weak_slot_cleared() {
        let fx = Fixture::new();
        let holder = fx.alloc(HEADER_SIZE + SLOT_SIZE, flags::ROOT | flags::WEAKREF);
        let target = fx.alloc(64, 0);
        unsafe { holder.slot(0) }.set(Some(target));

        let report = fx.collect();
        assert_eq!(report.swept, 1);
        assert_eq!(report.weak_cleared, 1);
        assert!(unsafe { holder.slot(0) }.get().is_none());
    }

    #[test]
    fn test_verify_counts() {
        let fx = Fixture::new();
        let _root = fx.alloc(64, flags::ROOT);
        let _garbage = fx.alloc(64, 0);

        let before = fx.verify();
        assert_eq!(before.blocks, 2);
        assert_eq!(before.pending_handoff, 2);
        assert_eq!(before.tracked, 0);

        fx.collect();
        let after = fx.verify();
        assert_eq!(after.blocks, 1);
        assert_eq!(after.pending_reclaim, 1);
        assert_eq!(after.tracked, 1);
        assert_eq!(after.pending_handoff, 0);
        assert_eq!(after.bytes_in_use, 64);
        assert_eq!(after.free_bytes, 4096 - HEADER_SIZE - 64);
        assert_eq!(after.largest_gap, 4096 - HEADER_SIZE - 64);
    }

    #[test]
    fn test_barrier_entries_are_traced() {
        let fx = Fixture::new();
        let parent = fx.alloc(HEADER_SIZE + SLOT_SIZE, flags::REFARRAY);
        let child = fx.alloc(64, 0);
        unsafe { parent.slot(0) }.set(Some(child));

        let sentinel = fx.arena.sentinel();
        let mut state = fx.collector.state.lock();
        assert_eq!(state.absorb(sentinel, &fx.handoff), 2);
        state.clear_marks(sentinel);
        assert_eq!(state.mark_roots(sentinel, &fx.descriptors), 0);
        assert_eq!(state.mark_from(&[parent.header_ptr()], &fx.descriptors), 2);
        assert_eq!(state.condemn(sentinel), 0);
        assert_eq!(state.tracked, 2);
    }

    #[test]
    fn test_verify_rejects_pending_block_on_mark_list() {
        let fx = Fixture::new();
        let _root = fx.alloc(64, flags::ROOT);
        fx.collect();

        // Still on the handoff list, now also tracked.
        let fresh = fx.alloc(64, flags::ROOT);
        unsafe { fx.push_tracked(fresh) };
        assert_corrupted(fx.try_verify(), "waiting for handoff");
    }

    #[test]
    fn test_verify_rejects_dead_block_on_mark_list() {
        let fx = Fixture::new();
        let _root = fx.alloc(64, flags::ROOT);
        let garbage = fx.alloc(64, 0);
        fx.collect();
        assert!(unsafe { garbage.info() }.swept);

        unsafe { fx.push_tracked(garbage) };
        assert_corrupted(fx.try_verify(), "not a live allocation");
    }

    #[test]
    fn test_verify_rejects_overlapping_blocks() {
        let fx = Fixture::new();
        let first = fx.alloc(64, flags::ROOT);
        let _second = fx.alloc(64, flags::ROOT);
        fx.collect();

        // Rewrite the first header with a length reaching into its successor.
        let node = first.header_ptr();
        unsafe {
            let old = node.get();
            let grown = BlockHeader::new(128, old.type_tag(), 0, old.rrcnt());
            grown.clear_pending();
            for (to, from) in [
                (&grown.alloc_next, &old.alloc_next),
                (&grown.mark_next, &old.mark_next),
                (&grown.addme_next, &old.addme_next),
            ] {
                to.store(from.load(Ordering::Relaxed), Ordering::Relaxed);
            }
            ptr::write(node.as_ptr(), grown);
        }
        assert_corrupted(fx.try_verify(), "overlaps its predecessor");
    }

    #[test]
    fn test_verify_rejects_lost_handoff_blocks() {
        let fx = Fixture::new();
        let _first = fx.alloc(64, flags::ROOT);
        let _second = fx.alloc(64, flags::ROOT);

        // Detached but never absorbed.
        drop(fx.handoff.take());
        assert_corrupted(fx.try_verify(), "handoff list holds 0 blocks, 2 published");
    }
}

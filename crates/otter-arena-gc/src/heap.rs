//! Heap handle and owner
//!
//! [`GcHeap`] is the shared handle every mutator thread uses: allocation,
//! root counting, barriered pointer stores and statistics. [`Gc`] owns a heap
//! together with its background collector thread and stops the thread when
//! dropped.
//!
//! # Caller contract
//!
//! A [`GcRef`] does not keep its block alive. Blocks survive while they have a
//! non-zero root count or are reachable from one that does. Mutators must:
//!
//! - `inc_ref` a block they read out of a slot before removing it from the
//!   last slot that holds it, or read it with `load_slot_retained` when
//!   another thread may remove it;
//! - only store references to blocks that are still alive;
//! - balance every `inc_ref` (and every `ROOT` allocation) with one `dec_ref`.

use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crossbeam_utils::Backoff;

use crate::allocator::Allocator;
use crate::arena::Arena;
use crate::barrier::{GcPhase, WriteBarrier};
use crate::collector::{Collector, GcStats, HeapReport, PassReport};
use crate::concurrent::CollectorThread;
use crate::config::GcConfig;
use crate::descriptor::{DescriptorTable, TypeTag};
use crate::error::{GcError, GcResult};
use crate::handoff::HandoffList;
use crate::object::{ALIGN, GcRef, HEADER_SIZE, RefSlot, SLOT_SIZE, flags};

/// Shared heap handle
pub struct GcHeap {
    config: GcConfig,
    arena: Arena,
    descriptors: DescriptorTable,
    handoff: HandoffList,
    pub(crate) barrier: WriteBarrier,
    allocator: Allocator,
    collector: Collector,
    collector_running: AtomicBool,
    allocations: AtomicU64,
    failed_allocations: AtomicU64,
}

impl GcHeap {
    /// Create a heap without a background collector.
    ///
    /// Passes only run when the caller invokes [`GcHeap::collect`]. Use
    /// [`Gc::init`] for a heap with its own collector thread.
    pub fn new(config: GcConfig, descriptors: DescriptorTable) -> GcResult<Arc<Self>> {
        config.validate()?;
        let arena = Arena::new(config.arena_size)?;
        Ok(Arc::new(Self {
            config,
            arena,
            descriptors,
            handoff: HandoffList::new(),
            barrier: WriteBarrier::new(),
            allocator: Allocator::new(),
            collector: Collector::new(),
            collector_running: AtomicBool::new(false),
            allocations: AtomicU64::new(0),
            failed_allocations: AtomicU64::new(0),
        }))
    }

    /// Heap configuration
    pub fn config(&self) -> &GcConfig {
        &self.config
    }

    /// Descriptor table the heap was built with
    pub fn descriptors(&self) -> &DescriptorTable {
        &self.descriptors
    }

    /// Arena size in bytes, sentinel included
    pub fn capacity(&self) -> usize {
        self.arena.capacity()
    }

    /// Allocate a block with a zero-filled payload of at least `len` bytes.
    ///
    /// `alloc_flags` combines [`flags::ROOT`] with at most one of
    /// [`flags::REFARRAY`] and [`flags::WEAKREF`]. A `ROOT` block starts with
    /// a root count of one. Any other block may be condemned by the first
    /// pass that absorbs it before it is linked from a live block, so with a
    /// background collector allocate with `ROOT`, link, then `dec_ref`.
    pub fn create_ref(&self, len: usize, type_tag: TypeTag, alloc_flags: u8) -> GcResult<GcRef> {
        if alloc_flags & !flags::ALL != 0 || alloc_flags & flags::KIND == flags::KIND {
            return Err(GcError::InvalidFlags(alloc_flags));
        }
        let descriptor = self
            .descriptors
            .get(type_tag)
            .ok_or(GcError::UnknownType(type_tag.raw()))?;
        let required = if alloc_flags & flags::WEAKREF != 0 {
            SLOT_SIZE
        } else if alloc_flags & flags::REFARRAY != 0 {
            0
        } else {
            descriptor.min_payload()
        };
        if len < required {
            return Err(GcError::PayloadTooSmall {
                tag: type_tag.raw(),
                len,
                required,
            });
        }

        let capacity = self.capacity();
        let block_len = len
            .checked_add(HEADER_SIZE + ALIGN - 1)
            .map(|padded| padded & !(ALIGN - 1))
            .filter(|block_len| *block_len <= capacity - HEADER_SIZE);
        let Some(block_len) = block_len else {
            return Err(self.out_of_memory(len.saturating_add(HEADER_SIZE)));
        };

        let mut retries = 0;
        loop {
            if let Some(node) = self.allocator.allocate(
                &self.arena,
                &self.handoff,
                block_len,
                type_tag,
                alloc_flags,
            ) {
                self.allocations.fetch_add(1, Ordering::Relaxed);
                return Ok(GcRef::from_header(node));
            }
            if retries >= self.config.alloc_retry_passes || !self.is_collector_running() {
                return Err(self.out_of_memory(block_len));
            }
            retries += 1;
            // The pass in flight may predate the garbage, so wait for two.
            self.wait_for_passes(2);
        }
    }

    fn out_of_memory(&self, requested: usize) -> GcError {
        self.failed_allocations.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "gc_logging")]
        tracing::warn!(
            target: "otter::arena_gc",
            requested,
            capacity = self.capacity(),
            "allocation failed"
        );
        GcError::OutOfMemory {
            requested,
            capacity: self.capacity(),
        }
    }

    fn wait_for_passes(&self, count: u64) {
        let target = self.passes() + count;
        let backoff = Backoff::new();
        while self.passes() < target && self.is_collector_running() {
            backoff.snooze();
        }
    }

    /// Add a root holder to `block`.
    ///
    /// # Safety
    /// `block` must be alive: rooted, or reachable from a rooted block.
    pub unsafe fn inc_ref(&self, block: GcRef) {
        let section = self.barrier.enter();
        let node = block.header_ptr();
        // SAFETY: caller guarantees the block is alive
        unsafe { node.get() }.retain();
        section.shade(node);
    }

    /// Drop a root holder from `block`.
    ///
    /// # Safety
    /// Must balance an earlier `inc_ref` or `ROOT` allocation of the same
    /// block. Releasing below zero is caught in debug builds only.
    pub unsafe fn dec_ref(&self, block: GcRef) {
        // SAFETY: a held root count keeps the block alive
        unsafe { block.header() }.release();
    }

    /// Store `value` into `slot` through the write barrier.
    ///
    /// # Safety
    /// `slot` must belong to a live block and `value` must be alive.
    pub unsafe fn store(&self, slot: &RefSlot, value: Option<GcRef>) {
        let section = self.barrier.enter();
        slot.set(value);
        if let Some(child) = value {
            let node = child.header_ptr();
            // SAFETY: caller guarantees the stored block is alive
            debug_assert!(!unsafe { node.get() }.is_swept(), "stored a swept block");
            section.shade(node);
        }
    }

    /// Store `value` into reference slot `index` of `block`.
    ///
    /// # Safety
    /// Same contract as [`GcHeap::store`].
    ///
    /// # Panics
    /// Panics if `index` is outside the payload.
    pub unsafe fn store_slot(&self, block: GcRef, index: usize, value: Option<GcRef>) {
        // SAFETY: forwarded to caller
        unsafe { self.store(block.slot(index), value) }
    }

    /// Read reference slot `index` of `block` and retain the referent.
    ///
    /// Safe against a concurrent store that unlinks the referent: the load
    /// and the retain happen inside one barrier section, which a sweep
    /// cannot overlap. The caller owns one root count on success.
    ///
    /// # Safety
    /// `block` must be alive.
    ///
    /// # Panics
    /// Panics if `index` is outside the payload.
    pub unsafe fn load_slot_retained(&self, block: GcRef, index: usize) -> Option<GcRef> {
        let section = self.barrier.enter();
        // SAFETY: forwarded to caller
        let target = unsafe { block.slot(index) }.get()?;
        let node = target.header_ptr();
        // SAFETY: a live block's slots only hold live blocks, and no sweep
        // runs while the section is held
        unsafe { node.get() }.retain();
        section.shade(node);
        Some(target)
    }

    /// Read reference slot `index` of `block`.
    ///
    /// The result is not retained; see [`GcHeap::load_slot_retained`].
    ///
    /// # Safety
    /// `block` must be alive.
    ///
    /// # Panics
    /// Panics if `index` is outside the payload.
    pub unsafe fn load_slot(&self, block: GcRef, index: usize) -> Option<GcRef> {
        // SAFETY: forwarded to caller
        unsafe { block.slot(index) }.get()
    }

    /// Run one collector pass on the calling thread.
    ///
    /// Passes are serialized: with a background collector running this waits
    /// for the current pass and then runs another.
    pub fn collect(&self) -> PassReport {
        self.collector
            .collect(&self.arena, &self.handoff, &self.barrier, &self.descriptors)
    }

    /// Completed passes
    pub fn passes(&self) -> u64 {
        self.collector.passes()
    }

    /// Current collector phase
    pub fn phase(&self) -> GcPhase {
        self.barrier.phase()
    }

    /// Whether a background collector is attached
    pub fn is_collector_running(&self) -> bool {
        self.collector_running.load(Ordering::Acquire)
    }

    pub(crate) fn set_collector_running(&self, running: bool) {
        self.collector_running.store(running, Ordering::Release);
    }

    /// Snapshot of the heap statistics
    pub fn stats(&self) -> GcStats {
        let reclaimed = self.allocator.reclaimed();
        GcStats {
            allocations: self.allocations.load(Ordering::Relaxed),
            failed_allocations: self.failed_allocations.load(Ordering::Relaxed),
            reclaimed_blocks: reclaimed.blocks,
            reclaimed_bytes: reclaimed.bytes,
            ..self.collector.totals()
        }
    }

    /// Check list ordering, bounds, disjointness and flag invariants.
    ///
    /// Waits for the current pass and pauses allocation while it runs.
    pub fn verify(&self) -> GcResult<HeapReport> {
        self.collector
            .verify(&self.arena, &self.handoff, &self.allocator)
    }
}

impl std::fmt::Debug for GcHeap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcHeap")
            .field("capacity", &self.capacity())
            .field("descriptors", &self.descriptors.len())
            .field("phase", &self.phase())
            .field("passes", &self.passes())
            .finish_non_exhaustive()
    }
}

/// Heap owner with its background collector
pub struct Gc {
    heap: Arc<GcHeap>,
    collector: Option<CollectorThread>,
}

impl Gc {
    /// Build the heap and, unless disabled in `config`, start the collector
    /// thread.
    pub fn init(config: GcConfig, descriptors: DescriptorTable) -> GcResult<Self> {
        let background = config.background_collector;
        let thread_name = config.thread_name.clone();
        let heap = GcHeap::new(config, descriptors)?;
        let collector = if background {
            Some(CollectorThread::spawn(Arc::clone(&heap), &thread_name)?)
        } else {
            None
        };
        Ok(Self { heap, collector })
    }

    /// Shared handle for mutator threads
    pub fn heap(&self) -> &Arc<GcHeap> {
        &self.heap
    }

    /// Stop the collector thread and release the owner.
    ///
    /// The arena is freed once every `Arc<GcHeap>` clone is gone.
    pub fn shutdown(mut self) {
        self.stop_collector();
    }

    fn stop_collector(&mut self) {
        if let Some(mut collector) = self.collector.take() {
            collector.stop();
        }
    }
}

impl Deref for Gc {
    type Target = GcHeap;

    fn deref(&self) -> &GcHeap {
        &self.heap
    }
}

impl Drop for Gc {
    fn drop(&mut self) {
        self.stop_collector();
    }
}

impl std::fmt::Debug for Gc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gc")
            .field("heap", &self.heap)
            .field("collector", &self.collector.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::Descriptor;

    fn manual_heap() -> Arc<GcHeap> {
        let mut table = DescriptorTable::new();
        table.register(Descriptor::offsets([0, 8])).unwrap();
        GcHeap::new(GcConfig::manual(4096), table).unwrap()
    }

    #[test]
    fn test_create_ref_rounds_length() {
        let heap = manual_heap();
        let block = heap.create_ref(13, TypeTag::LEAF, flags::ROOT).unwrap();
        let info = unsafe { block.info() };
        assert_eq!(info.len, HEADER_SIZE + 16);
        assert_eq!(info.rrcnt, 1);
        assert_eq!(heap.stats().allocations, 1);
    }

    #[test]
    fn test_create_ref_rejects_bad_input() {
        let heap = manual_heap();
        assert_eq!(
            heap.create_ref(8, TypeTag::LEAF, flags::REFARRAY | flags::WEAKREF),
            Err(GcError::InvalidFlags(6))
        );
        assert_eq!(
            heap.create_ref(8, TypeTag::LEAF, 0x10),
            Err(GcError::InvalidFlags(0x10))
        );
        assert_eq!(
            heap.create_ref(8, TypeTag::new(9), 0),
            Err(GcError::UnknownType(9))
        );
        assert_eq!(
            heap.create_ref(8, TypeTag::new(1), 0),
            Err(GcError::PayloadTooSmall {
                tag: 1,
                len: 8,
                required: 16
            })
        );
        assert!(matches!(
            heap.create_ref(0, TypeTag::LEAF, flags::WEAKREF),
            Err(GcError::PayloadTooSmall { required: 8, .. })
        ));
    }

    #[test]
    fn test_oversized_request_fails_without_retry() {
        let heap = manual_heap();
        let err = heap.create_ref(4096, TypeTag::LEAF, 0).unwrap_err();
        assert!(matches!(err, GcError::OutOfMemory { capacity: 4096, .. }));
        assert_eq!(heap.stats().failed_allocations, 1);
    }

    #[test]
    fn test_root_count_round_trip() {
        let heap = manual_heap();
        let block = heap.create_ref(16, TypeTag::LEAF, 0).unwrap();
        unsafe {
            heap.inc_ref(block);
            heap.inc_ref(block);
            assert_eq!(block.info().rrcnt, 2);
            heap.dec_ref(block);
            assert_eq!(block.info().rrcnt, 1);
        }
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "root count released below zero")]
    fn test_double_release_is_caught() {
        let heap = manual_heap();
        let block = heap.create_ref(16, TypeTag::LEAF, flags::ROOT).unwrap();
        unsafe {
            heap.dec_ref(block);
            heap.dec_ref(block);
        }
    }

    #[test]
    fn test_store_and_load_slot() {
        let heap = manual_heap();
        let parent = heap.create_ref(16, TypeTag::new(1), flags::ROOT).unwrap();
        let child = heap.create_ref(8, TypeTag::LEAF, 0).unwrap();
        unsafe {
            heap.store_slot(parent, 1, Some(child));
            assert_eq!(heap.load_slot(parent, 1), Some(child));
            assert_eq!(heap.load_slot(parent, 0), None);
        }
        heap.collect();
        assert!(!unsafe { child.info() }.swept);
    }

    #[test]
    fn test_manual_gc_has_no_thread() {
        let gc = Gc::init(GcConfig::manual(4096), DescriptorTable::new()).unwrap();
        assert!(!gc.is_collector_running());
        assert_eq!(gc.phase(), GcPhase::Idle);
        gc.shutdown();
    }
}

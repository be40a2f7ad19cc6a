//! First-fit allocator over the address-ordered block list
//!
//! The allocator owns `alloc_next`. A walk starts at the sentinel, unlinks
//! every block the collector has flagged with `sweep = 1`, and carves the new
//! block out of the first gap that fits. Physical reclamation is therefore
//! lazy: a dead block's bytes become reusable the next time a walk passes it.
//!
//! Mutator threads serialize their walks on one mutex. The collector never
//! takes it and never reads `alloc_next`.

use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, MutexGuard};

use crate::arena::Arena;
use crate::descriptor::TypeTag;
use crate::handoff::HandoffList;
use crate::object::{BlockHeader, HEADER_SIZE, HeaderPtr, flags};

pub(crate) struct Allocator {
    walk: Mutex<()>,
    reclaimed_blocks: AtomicU64,
    reclaimed_bytes: AtomicU64,
}

/// Reclamation counters of the allocator
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ReclaimCounters {
    pub(crate) blocks: u64,
    pub(crate) bytes: u64,
}

impl Allocator {
    pub(crate) fn new() -> Self {
        Self {
            walk: Mutex::new(()),
            reclaimed_blocks: AtomicU64::new(0),
            reclaimed_bytes: AtomicU64::new(0),
        }
    }

    /// Carve a block of `len` bytes (header included, `ALIGN`-rounded).
    ///
    /// The block is fully initialized and published on the handoff list
    /// before it becomes visible on `alloc_next`. Returns `None` when no gap
    /// fits.
    pub(crate) fn allocate(
        &self,
        arena: &Arena,
        handoff: &HandoffList,
        len: usize,
        type_tag: TypeTag,
        alloc_flags: u8,
    ) -> Option<HeaderPtr> {
        debug_assert!(len >= HEADER_SIZE);
        let _walk = self.walk.lock();

        let mut prev = arena.sentinel();
        loop {
            // SAFETY: blocks on alloc_next stay valid until this walk unlinks
            // them
            let prev_header = unsafe { prev.get() };
            let gap_start = prev.addr() + prev_header.block_len();
            let mut next = HeaderPtr::from_raw(prev_header.alloc_next.load(Ordering::Acquire));

            while let Some(candidate) = next {
                check_block(arena, candidate, gap_start);
                // SAFETY: checked to lie inside the arena past `prev`
                let header = unsafe { candidate.get() };
                if !header.is_swept() {
                    break;
                }
                let after = header.alloc_next.load(Ordering::Relaxed);
                prev_header.alloc_next.store(after, Ordering::Release);
                self.reclaimed_blocks.fetch_add(1, Ordering::Relaxed);
                self.reclaimed_bytes
                    .fetch_add(header.block_len() as u64, Ordering::Relaxed);
                next = HeaderPtr::from_raw(after);
            }

            let gap_end = next.map_or(arena.end(), HeaderPtr::addr);
            if gap_end - gap_start >= len {
                let node = arena.at(gap_start);
                let rrcnt = usize::from(alloc_flags & flags::ROOT != 0);
                let header = BlockHeader::new(len, type_tag, alloc_flags, rrcnt);
                let successor = next.map_or(ptr::null_mut(), HeaderPtr::as_ptr);
                header.alloc_next.store(successor, Ordering::Relaxed);

                // SAFETY: [gap_start, gap_start + len) is unused arena space.
                // Nothing else references it until the block is published.
                unsafe {
                    ptr::write_bytes(node.payload().as_ptr(), 0, len - HEADER_SIZE);
                    ptr::write(node.as_ptr(), header);
                    handoff.publish(node);
                }
                prev_header
                    .alloc_next
                    .store(node.as_ptr(), Ordering::Release);
                return Some(node);
            }

            match next {
                Some(block) => prev = block,
                None => return None,
            }
        }
    }

    /// Hold off allocator walks while the caller inspects `alloc_next`
    pub(crate) fn pause(&self) -> MutexGuard<'_, ()> {
        self.walk.lock()
    }

    pub(crate) fn reclaimed(&self) -> ReclaimCounters {
        ReclaimCounters {
            blocks: self.reclaimed_blocks.load(Ordering::Relaxed),
            bytes: self.reclaimed_bytes.load(Ordering::Relaxed),
        }
    }
}

/// Abort unless `block` is a plausible successor of a block ending at `min`.
fn check_block(arena: &Arena, block: HeaderPtr, min: usize) {
    let addr = block.addr();
    if addr < min {
        corrupted("overlapping blocks on the allocation list", addr);
    }
    if !arena.contains(addr, HEADER_SIZE) {
        corrupted("block outside the arena", addr);
    }
    // SAFETY: the header lies inside the arena
    let len = unsafe { block.get() }.block_len();
    if len < HEADER_SIZE || !arena.contains(addr, len) {
        corrupted("block length runs past the arena", addr);
    }
}

#[cold]
fn corrupted(detail: &str, addr: usize) -> ! {
    #[cfg(feature = "gc_logging")]
    tracing::error!(
        target: "otter::arena_gc",
        addr,
        detail,
        "arena corrupted, aborting"
    );
    #[cfg(not(feature = "gc_logging"))]
    let _ = (detail, addr);
    std::process::abort()
}

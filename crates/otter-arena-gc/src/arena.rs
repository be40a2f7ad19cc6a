//! The managed arena
//!
//! One contiguous, zero-filled region reserved at heap creation. The first
//! header-sized slot holds the sentinel block, which heads the allocation
//! list and the mark list and is never collected.

use std::alloc::{Layout, alloc_zeroed, dealloc, handle_alloc_error};
use std::ptr::{self, NonNull};

use crate::error::{GcError, GcResult};
use crate::object::{ALIGN, BlockHeader, HEADER_SIZE, HeaderPtr};

const ARENA_ALIGN: usize = 16;

pub(crate) struct Arena {
    base: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the arena is a plain byte region. Concurrent access to its blocks is
// coordinated by the allocator mutex, the handoff list and the sweep flag.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    /// Reserve `size` bytes (rounded down to `ALIGN`) and place the sentinel.
    pub(crate) fn new(size: usize) -> GcResult<Self> {
        let size = size & !(ALIGN - 1);
        if size < 2 * HEADER_SIZE {
            return Err(GcError::InvalidConfig(format!(
                "arena of {size} bytes cannot hold a block"
            )));
        }
        let layout = Layout::from_size_align(size, ARENA_ALIGN)
            .map_err(|err| GcError::InvalidConfig(err.to_string()))?;

        // SAFETY: layout has a non-zero size
        let raw = unsafe { alloc_zeroed(layout) };
        let Some(base) = NonNull::new(raw) else {
            handle_alloc_error(layout)
        };

        // SAFETY: base is aligned for BlockHeader and the region holds at
        // least one header
        unsafe { ptr::write(base.cast::<BlockHeader>().as_ptr(), BlockHeader::sentinel()) };

        Ok(Self { base, layout })
    }

    pub(crate) fn sentinel(&self) -> HeaderPtr {
        HeaderPtr::new(self.base.cast())
    }

    pub(crate) fn capacity(&self) -> usize {
        self.layout.size()
    }

    pub(crate) fn start(&self) -> usize {
        self.base.as_ptr() as usize
    }

    pub(crate) fn end(&self) -> usize {
        self.start() + self.capacity()
    }

    /// Whether `[addr, addr + len)` lies inside the arena
    pub(crate) fn contains(&self, addr: usize, len: usize) -> bool {
        addr >= self.start() && len <= self.end().saturating_sub(addr)
    }

    /// Header pointer for an address inside the arena.
    ///
    /// Derived from the base pointer so the result keeps its provenance.
    pub(crate) fn at(&self, addr: usize) -> HeaderPtr {
        debug_assert!(self.contains(addr, HEADER_SIZE));
        debug_assert_eq!(addr % ALIGN, 0);
        // SAFETY: addr lies inside the arena allocation
        HeaderPtr::new(unsafe { self.base.add(addr - self.start()) }.cast())
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        // SAFETY: base was allocated with this layout in `new`
        unsafe { dealloc(self.base.as_ptr(), self.layout) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_arena_sentinel() {
        let arena = Arena::new(1024).unwrap();
        assert_eq!(arena.capacity(), 1024);
        let sentinel = arena.sentinel();
        assert_eq!(sentinel.addr(), arena.start());
        // SAFETY: the sentinel lives as long as the arena
        let header = unsafe { sentinel.get() };
        assert_eq!(header.rrcnt(), 1);
        assert!(header.is_marked());
        assert!(!header.is_pending());
        assert!(header.alloc_next.load(Ordering::Relaxed).is_null());
    }

    #[test]
    fn test_arena_rounds_down() {
        let arena = Arena::new(1001).unwrap();
        assert_eq!(arena.capacity(), 1000);
        assert!(arena.contains(arena.start(), 1000));
        assert!(!arena.contains(arena.start() + 8, 1000));
    }

    #[test]
    fn test_arena_too_small() {
        assert!(Arena::new(HEADER_SIZE).is_err());
    }

    #[test]
    fn test_at_keeps_address() {
        let arena = Arena::new(1024).unwrap();
        let addr = arena.start() + 2 * HEADER_SIZE;
        assert_eq!(arena.at(addr).addr(), addr);
    }
}

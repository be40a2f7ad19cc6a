//! Weak references
//!
//! A weak holder is a `WEAKREF` block whose first payload slot points at its
//! referent without keeping it alive. When the referent dies, the collector
//! nulls the slot in the same pass, before the referent's bytes can be
//! reused.

use crate::descriptor::TypeTag;
use crate::error::GcResult;
use crate::heap::GcHeap;
use crate::object::{GcRef, SLOT_SIZE, flags};

/// Typed handle to a weak holder block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeakRef {
    holder: GcRef,
}

impl WeakRef {
    /// Wrap an existing `WEAKREF` block.
    ///
    /// # Safety
    /// `holder` must be a live block allocated with [`flags::WEAKREF`].
    pub unsafe fn from_holder(holder: GcRef) -> Self {
        // SAFETY: forwarded to caller
        debug_assert!(unsafe { holder.header() }.is_weakref());
        Self { holder }
    }

    /// The holder block, for rooting or linking it
    pub fn holder(&self) -> GcRef {
        self.holder
    }

    /// Current referent without retaining it.
    ///
    /// The result may be swept by the next pass; use
    /// [`WeakRef::upgrade`] to keep it.
    ///
    /// # Safety
    /// The holder must be alive.
    pub unsafe fn get(&self) -> Option<GcRef> {
        // SAFETY: holder is alive and has one slot
        unsafe { self.holder.slot(0) }.get()
    }

    /// Point the holder at `target`.
    ///
    /// # Safety
    /// See [`GcHeap::store_weak`].
    pub unsafe fn set(&self, heap: &GcHeap, target: Option<GcRef>) {
        // SAFETY: forwarded to caller
        unsafe { heap.store_weak(self.holder, target) }
    }

    /// Retain the referent if it is still alive.
    ///
    /// # Safety
    /// See [`GcHeap::upgrade_weak`].
    pub unsafe fn upgrade(&self, heap: &GcHeap) -> Option<GcRef> {
        // SAFETY: forwarded to caller
        unsafe { heap.upgrade_weak(self.holder) }
    }
}

impl GcHeap {
    /// Allocate a weak holder pointing at `target`.
    ///
    /// With `root` the holder starts with a root count of one. Without it
    /// the holder follows the same rule as any unrooted allocation (see
    /// [`GcHeap::create_ref`]).
    pub fn create_weak(&self, target: Option<GcRef>, root: bool) -> GcResult<WeakRef> {
        let alloc_flags = if root {
            flags::WEAKREF | flags::ROOT
        } else {
            flags::WEAKREF
        };
        let holder = self.create_ref(SLOT_SIZE, TypeTag::LEAF, alloc_flags)?;
        if target.is_some() {
            // SAFETY: holder was just allocated; the caller vouches for target
            unsafe { self.store_weak(holder, target) };
        }
        Ok(WeakRef { holder })
    }

    /// Store a weak pointer. No barrier: weak slots are never traced.
    ///
    /// # Safety
    /// `holder` must be a live `WEAKREF` block and `target` must be alive.
    pub unsafe fn store_weak(&self, holder: GcRef, target: Option<GcRef>) {
        // SAFETY: caller guarantees the holder is alive
        let header = unsafe { holder.header() };
        debug_assert!(header.is_weakref(), "weak store into a strong block");
        // SAFETY: weak blocks carry at least one slot
        unsafe { holder.slot(0) }.set(target);
    }

    /// Read a weak pointer and retain its target.
    ///
    /// Returns `None` once the target has died. On success the caller owns
    /// one root count and must `dec_ref` it.
    ///
    /// # Safety
    /// `holder` must be a live `WEAKREF` block.
    pub unsafe fn upgrade_weak(&self, holder: GcRef) -> Option<GcRef> {
        // Dead targets are nulled while sections are excluded, so a target
        // read inside a section is still alive.
        let section = self.barrier.enter();
        // SAFETY: caller guarantees the holder is alive
        let target = unsafe { holder.slot(0) }.get()?;
        let node = target.header_ptr();
        // SAFETY: see above
        unsafe { node.get() }.retain();
        section.shade(node);
        Some(target)
    }
}

//! Block layout inside the arena
//!
//! Every allocation is a `BlockHeader` immediately followed by its payload.
//! References handed to callers ([`GcRef`]) point at the payload; the header
//! is always the `HEADER_SIZE` bytes before it.
//!
//! ```text
//! ┌──────────────────────────────┬─────────────────────────────┐
//! │ BlockHeader (48 bytes)       │ payload (len - HEADER_SIZE) │
//! └──────────────────────────────┴─────────────────────────────┘
//! ^ alloc_next / mark_next /     ^ GcRef
//!   addme_next point here
//! ```

use std::fmt;
use std::mem::{align_of, size_of};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicU8, AtomicUsize, Ordering};

use crate::descriptor::TypeTag;

/// Allocation flags for `GcHeap::create_ref`
pub mod flags {
    /// Block starts with one root holder (`rrcnt = 1`)
    pub const ROOT: u8 = 1;
    /// Payload is an array of reference slots, traced positionally
    pub const REFARRAY: u8 = 2;
    /// First payload slot is weak: never traced, cleared when its referent dies
    pub const WEAKREF: u8 = 4;

    pub(crate) const ALL: u8 = ROOT | REFARRAY | WEAKREF;
    pub(crate) const KIND: u8 = REFARRAY | WEAKREF;
}

/// Alignment unit of the arena; block lengths are multiples of it
pub const ALIGN: usize = align_of::<u64>();

/// Size of a block header
pub const HEADER_SIZE: usize = size_of::<BlockHeader>();

/// Size of a reference slot in a payload
pub const SLOT_SIZE: usize = size_of::<RefSlot>();

const _: () = assert!(HEADER_SIZE % ALIGN == 0);
const _: () = assert!(SLOT_SIZE == ALIGN);

/// Per-block metadata.
///
/// Flags that both the allocator and the collector touch are separate
/// atomics. `kind`, `type_tag` and `len` are written once before the block
/// is published and never change afterwards.
#[repr(C)]
pub struct BlockHeader {
    /// External strong holders; non-zero makes the block a trace root
    rrcnt: AtomicUsize,
    /// Reachable in the current pass
    mark: AtomicU8,
    /// Confirmed dead, waiting for the allocator to unlink it
    sweep: AtomicU8,
    /// Waiting on the handoff list
    addme: AtomicU8,
    kind: u8,
    type_tag: u32,
    /// Header + payload, rounded to `ALIGN`
    len: usize,
    /// Address-ordered list, owned by the allocator
    pub(crate) alloc_next: AtomicPtr<BlockHeader>,
    /// Collector-private trace candidates
    pub(crate) mark_next: AtomicPtr<BlockHeader>,
    /// Handoff list shared by allocator and collector
    pub(crate) addme_next: AtomicPtr<BlockHeader>,
}

impl BlockHeader {
    /// Header for a freshly carved block: marked, not swept, pending handoff.
    pub(crate) fn new(len: usize, type_tag: TypeTag, kind: u8, rrcnt: usize) -> Self {
        Self {
            rrcnt: AtomicUsize::new(rrcnt),
            mark: AtomicU8::new(1),
            sweep: AtomicU8::new(0),
            addme: AtomicU8::new(1),
            kind: kind & flags::KIND,
            type_tag: type_tag.raw(),
            len,
            alloc_next: AtomicPtr::new(ptr::null_mut()),
            mark_next: AtomicPtr::new(ptr::null_mut()),
            addme_next: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// The permanent first block of every arena
    pub(crate) fn sentinel() -> Self {
        let header = Self::new(HEADER_SIZE, TypeTag::LEAF, 0, 1);
        header.addme.store(0, Ordering::Relaxed);
        header
    }

    /// Current root count
    pub fn rrcnt(&self) -> usize {
        self.rrcnt.load(Ordering::Acquire)
    }

    /// Whether the block was reached in the latest pass
    pub fn is_marked(&self) -> bool {
        self.mark.load(Ordering::Acquire) != 0
    }

    /// Whether the collector has confirmed the block dead
    pub fn is_swept(&self) -> bool {
        self.sweep.load(Ordering::Acquire) != 0
    }

    /// Whether the block still waits on the handoff list
    pub fn is_pending(&self) -> bool {
        self.addme.load(Ordering::Acquire) != 0
    }

    /// Total block length, header included
    pub fn block_len(&self) -> usize {
        self.len
    }

    /// Payload length (rounded)
    pub fn payload_len(&self) -> usize {
        self.len - HEADER_SIZE
    }

    /// Number of slot-sized words in the payload
    pub fn slot_count(&self) -> usize {
        self.payload_len() / SLOT_SIZE
    }

    /// Descriptor row of this block
    pub fn type_tag(&self) -> TypeTag {
        TypeTag::new(self.type_tag)
    }

    /// Payload is traced positionally
    pub fn is_refarray(&self) -> bool {
        self.kind & flags::REFARRAY != 0
    }

    /// Payload holds a weak reference
    pub fn is_weakref(&self) -> bool {
        self.kind & flags::WEAKREF != 0
    }

    pub(crate) fn retain(&self) -> usize {
        self.rrcnt.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn release(&self) -> usize {
        let prev = self.rrcnt.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "root count released below zero");
        prev.wrapping_sub(1)
    }

    // Mark bits are only written by the collector once a block is published.
    pub(crate) fn marked_relaxed(&self) -> bool {
        self.mark.load(Ordering::Relaxed) != 0
    }

    pub(crate) fn set_mark(&self, marked: bool) {
        self.mark.store(marked as u8, Ordering::Relaxed);
    }

    pub(crate) fn set_swept(&self) {
        self.sweep.store(1, Ordering::Release);
    }

    pub(crate) fn clear_pending(&self) {
        self.addme.store(0, Ordering::Relaxed);
    }

    fn info(&self) -> BlockInfo {
        BlockInfo {
            rrcnt: self.rrcnt(),
            marked: self.is_marked(),
            swept: self.is_swept(),
            pending: self.is_pending(),
            len: self.len,
            type_tag: self.type_tag(),
            refarray: self.is_refarray(),
            weakref: self.is_weakref(),
        }
    }
}

impl fmt::Debug for BlockHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.info(), f)
    }
}

/// Snapshot of a block header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// Root count
    pub rrcnt: usize,
    /// Mark bit
    pub marked: bool,
    /// Sweep bit
    pub swept: bool,
    /// Handoff bit (`addme`)
    pub pending: bool,
    /// Block length, header included
    pub len: usize,
    /// Descriptor row
    pub type_tag: TypeTag,
    /// `REFARRAY` block
    pub refarray: bool,
    /// `WEAKREF` block
    pub weakref: bool,
}

/// Address of a block header inside the arena.
///
/// Derived from the arena base pointer, so payload addresses computed from it
/// stay inside the arena allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct HeaderPtr(NonNull<BlockHeader>);

// SAFETY: HeaderPtr is only an address. Every dereference is governed by the
// list protocol, which guarantees the block is not reclaimed while read.
unsafe impl Send for HeaderPtr {}
unsafe impl Sync for HeaderPtr {}

impl HeaderPtr {
    pub(crate) const fn new(raw: NonNull<BlockHeader>) -> Self {
        Self(raw)
    }

    pub(crate) fn from_raw(raw: *mut BlockHeader) -> Option<Self> {
        NonNull::new(raw).map(Self)
    }

    pub(crate) fn as_ptr(self) -> *mut BlockHeader {
        self.0.as_ptr()
    }

    pub(crate) fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    /// # Safety
    /// The block must not have been reclaimed by the allocator.
    pub(crate) unsafe fn get<'a>(self) -> &'a BlockHeader {
        // SAFETY: caller guarantees the header is initialized and live
        unsafe { self.0.as_ref() }
    }

    pub(crate) fn payload(self) -> NonNull<u8> {
        // SAFETY: every block is at least HEADER_SIZE long and lies inside
        // the arena, so the payload address is in bounds
        unsafe { self.0.cast::<u8>().add(HEADER_SIZE) }
    }

    /// # Safety
    /// `payload` must have been produced by [`HeaderPtr::payload`].
    pub(crate) unsafe fn from_payload(payload: NonNull<u8>) -> Self {
        // SAFETY: the header occupies the HEADER_SIZE bytes before the payload
        Self(unsafe { payload.sub(HEADER_SIZE) }.cast())
    }

    /// # Safety
    /// The block must be live and `offset + SLOT_SIZE` must lie within its
    /// payload, with `offset` a multiple of `SLOT_SIZE`.
    pub(crate) unsafe fn slot_at<'a>(self, offset: usize) -> &'a RefSlot {
        // SAFETY: caller guarantees bounds and alignment
        unsafe { self.payload().add(offset).cast::<RefSlot>().as_ref() }
    }
}

/// Reference to a block's payload.
///
/// A `GcRef` is a plain address: it does not keep the block alive. Hold a
/// root count (`GcHeap::inc_ref`) or keep it reachable from a rooted block.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct GcRef(NonNull<u8>);

// SAFETY: GcRef is an address into the shared arena; accessing the block
// behind it is unsafe and carries the liveness contract.
unsafe impl Send for GcRef {}
unsafe impl Sync for GcRef {}

impl GcRef {
    pub(crate) fn from_header(header: HeaderPtr) -> Self {
        Self(header.payload())
    }

    pub(crate) fn header_ptr(self) -> HeaderPtr {
        // SAFETY: GcRefs are only created from block payloads
        unsafe { HeaderPtr::from_payload(self.0) }
    }

    /// Payload address
    pub fn as_ptr(self) -> *mut u8 {
        self.0.as_ptr()
    }

    /// Rebuild a reference from a payload address.
    ///
    /// # Safety
    /// `ptr` must be null or a payload address previously returned by
    /// [`GcRef::as_ptr`] for a block of the same heap.
    pub unsafe fn from_raw(ptr: *mut u8) -> Option<Self> {
        NonNull::new(ptr).map(Self)
    }

    /// Header of the block.
    ///
    /// # Safety
    /// The block must not have been reclaimed.
    pub unsafe fn header<'a>(self) -> &'a BlockHeader {
        // SAFETY: forwarded to caller
        unsafe { self.header_ptr().get() }
    }

    /// Snapshot of the block header.
    ///
    /// # Safety
    /// The block must not have been reclaimed.
    pub unsafe fn info(self) -> BlockInfo {
        // SAFETY: forwarded to caller
        unsafe { self.header() }.info()
    }

    /// Reference slot `index` of the payload.
    ///
    /// # Safety
    /// The block must not have been reclaimed.
    ///
    /// # Panics
    /// Panics if `index` is outside the payload.
    pub unsafe fn slot<'a>(self, index: usize) -> &'a RefSlot {
        let header = self.header_ptr();
        // SAFETY: caller guarantees the block is live
        let count = unsafe { header.get() }.slot_count();
        assert!(
            index < count,
            "slot index {index} out of bounds for {count} slots"
        );
        // SAFETY: index is within the payload and slots are ALIGN-aligned
        unsafe { header.slot_at(index * SLOT_SIZE) }
    }

    /// View the payload as a `T`.
    ///
    /// Payloads start zero-filled, so `T` must be valid when all-zero. Fields
    /// mutated while other threads may read the block must use interior
    /// mutability (`RefSlot`, atomics).
    ///
    /// # Safety
    /// The block must not have been reclaimed and must have been allocated
    /// for a `T`.
    ///
    /// # Panics
    /// Panics if `T` does not fit the payload or needs more than `ALIGN`.
    pub unsafe fn cast<'a, T>(self) -> &'a T {
        // SAFETY: caller guarantees the block is live
        let payload_len = unsafe { self.header() }.payload_len();
        assert!(size_of::<T>() <= payload_len, "payload too small for type");
        assert!(align_of::<T>() <= ALIGN, "type over-aligned for the arena");
        // SAFETY: size and alignment checked above; zero-fill makes T valid
        unsafe { self.0.cast::<T>().as_ref() }
    }
}

impl fmt::Debug for GcRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GcRef({:p})", self.0)
    }
}

/// A reference-holding word inside a payload.
///
/// Reads are lock-free. Writes go through `GcHeap::store` so the write
/// barrier sees them.
#[derive(Default)]
#[repr(transparent)]
pub struct RefSlot(AtomicPtr<u8>);

impl RefSlot {
    /// An empty slot
    pub const fn empty() -> Self {
        Self(AtomicPtr::new(ptr::null_mut()))
    }

    /// Current referent
    pub fn get(&self) -> Option<GcRef> {
        NonNull::new(self.0.load(Ordering::Acquire)).map(GcRef)
    }

    /// Whether the slot is null
    pub fn is_empty(&self) -> bool {
        self.0.load(Ordering::Acquire).is_null()
    }

    pub(crate) fn set(&self, value: Option<GcRef>) {
        let raw = value.map_or(ptr::null_mut(), GcRef::as_ptr);
        self.0.store(raw, Ordering::Release);
    }

    /// Null the slot if it still holds `expected`.
    pub(crate) fn clear_if(&self, expected: GcRef) -> bool {
        self.0
            .compare_exchange(
                expected.as_ptr(),
                ptr::null_mut(),
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok()
    }
}

impl fmt::Debug for RefSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RefSlot").field(&self.get()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        assert_eq!(HEADER_SIZE, 48);
        assert_eq!(align_of::<BlockHeader>(), 8);
        assert_eq!(SLOT_SIZE, 8);
    }

    #[test]
    fn test_new_header_flags() {
        let header = BlockHeader::new(64, TypeTag::LEAF, flags::REFARRAY | flags::ROOT, 1);
        assert_eq!(header.rrcnt(), 1);
        assert!(header.is_marked());
        assert!(!header.is_swept());
        assert!(header.is_pending());
        assert!(header.is_refarray());
        assert!(!header.is_weakref());
        assert_eq!(header.payload_len(), 64 - HEADER_SIZE);
        assert_eq!(header.slot_count(), 2);
    }

    #[test]
    fn test_sentinel_header() {
        let sentinel = BlockHeader::sentinel();
        assert_eq!(sentinel.rrcnt(), 1);
        assert!(sentinel.is_marked());
        assert!(!sentinel.is_pending());
        assert_eq!(sentinel.block_len(), HEADER_SIZE);
        assert_eq!(sentinel.slot_count(), 0);
    }

    #[test]
    fn test_root_count() {
        let header = BlockHeader::new(HEADER_SIZE, TypeTag::LEAF, 0, 0);
        assert_eq!(header.retain(), 1);
        assert_eq!(header.retain(), 2);
        assert_eq!(header.release(), 1);
        assert_eq!(header.release(), 0);
    }

    #[test]
    fn test_ref_slot() {
        let mut backing = [0u64; 2];
        let target = GcRef(NonNull::from(&mut backing[1]).cast());
        let slot = RefSlot::empty();
        assert!(slot.is_empty());

        slot.set(Some(target));
        assert_eq!(slot.get(), Some(target));

        let other = GcRef(NonNull::from(&mut backing[0]).cast());
        assert!(!slot.clear_if(other));
        assert_eq!(slot.get(), Some(target));
        assert!(slot.clear_if(target));
        assert!(slot.get().is_none());
    }
}

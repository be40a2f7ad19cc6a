//! Type descriptor table
//!
//! Each block carries a [`TypeTag`] naming a row of the table. A row tells the
//! collector where the reference slots of the payload are: either as a list
//! of byte offsets, or through a [`Traceable`] implementation that visits the
//! slots of a typed payload.
//!
//! The table is built before the heap starts and is read-only afterwards.

use std::fmt;
use std::mem::{align_of, size_of};
use std::ptr::NonNull;

use crate::error::{GcError, GcResult};
use crate::object::{ALIGN, RefSlot, SLOT_SIZE};

/// Trace function for typed payloads
pub type TraceFn = unsafe fn(*const u8, &mut dyn FnMut(&RefSlot));

/// Row index into the descriptor table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeTag(u32);

impl TypeTag {
    /// Row 0: payload without references
    pub const LEAF: TypeTag = TypeTag(0);

    /// Tag for a raw row index
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw row index
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Payload types whose reference slots the collector can enumerate.
///
/// `trace` must report every [`RefSlot`] the value contains. Payloads are
/// zero-filled before use, so implementors must be valid when all-zero and
/// must not need `Drop`: the collector never runs destructors.
pub trait Traceable {
    /// Visit all reference slots in this value
    fn trace(&self, visitor: &mut dyn FnMut(&RefSlot));
}

impl Traceable for RefSlot {
    #[inline]
    fn trace(&self, visitor: &mut dyn FnMut(&RefSlot)) {
        visitor(self);
    }
}

impl<T: Traceable, const N: usize> Traceable for [T; N] {
    fn trace(&self, visitor: &mut dyn FnMut(&RefSlot)) {
        for item in self {
            item.trace(visitor);
        }
    }
}

macro_rules! impl_leaf_traceable {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Traceable for $ty {
                #[inline]
                fn trace(&self, _visitor: &mut dyn FnMut(&RefSlot)) {}
            }
        )*
    };
}

impl_leaf_traceable!(
    (),
    bool,
    u8,
    u16,
    u32,
    u64,
    usize,
    i8,
    i16,
    i32,
    i64,
    isize,
    f32,
    f64,
    std::sync::atomic::AtomicU32,
    std::sync::atomic::AtomicU64,
    std::sync::atomic::AtomicUsize,
);

/// Trace function for a typed payload
unsafe fn trace_payload<T: Traceable>(ptr: *const u8, visitor: &mut dyn FnMut(&RefSlot)) {
    let value_ptr = ptr as *const T;
    // SAFETY: ptr points to a live payload at least size_of::<T>() bytes long
    unsafe {
        (*value_ptr).trace(visitor);
    }
}

/// One row of the descriptor table
#[derive(Clone)]
pub enum Descriptor {
    /// No references
    Leaf,
    /// Byte offsets of reference slots inside the payload
    Offsets(Box<[usize]>),
    /// Typed payload traced by its `Traceable` impl
    Trace {
        /// Monomorphized trace function
        trace: TraceFn,
        /// `size_of` the payload type
        size: usize,
        /// `align_of` the payload type
        align: usize,
    },
}

impl Descriptor {
    /// Row for a `Traceable` payload type
    pub fn of<T: Traceable>() -> Self {
        Descriptor::Trace {
            trace: trace_payload::<T>,
            size: size_of::<T>(),
            align: align_of::<T>(),
        }
    }

    /// Row listing reference slots by byte offset
    pub fn offsets(offsets: impl IntoIterator<Item = usize>) -> Self {
        Descriptor::Offsets(offsets.into_iter().collect())
    }

    /// Smallest payload the tracer can walk without leaving the block
    pub fn min_payload(&self) -> usize {
        match self {
            Descriptor::Leaf => 0,
            Descriptor::Offsets(offsets) => offsets
                .iter()
                .map(|offset| offset + SLOT_SIZE)
                .max()
                .unwrap_or(0),
            Descriptor::Trace { size, .. } => *size,
        }
    }

    /// Number of statically known child slots (`None` for typed rows)
    pub fn child_count(&self) -> Option<usize> {
        match self {
            Descriptor::Leaf => Some(0),
            Descriptor::Offsets(offsets) => Some(offsets.len()),
            Descriptor::Trace { .. } => None,
        }
    }

    fn validate(&self) -> GcResult<()> {
        match self {
            Descriptor::Leaf => Ok(()),
            Descriptor::Offsets(offsets) => {
                match offsets.iter().find(|offset| *offset % SLOT_SIZE != 0) {
                    Some(offset) => Err(GcError::InvalidDescriptor(format!(
                        "offset {offset} is not a multiple of {SLOT_SIZE}"
                    ))),
                    None => Ok(()),
                }
            }
            Descriptor::Trace { align, .. } if *align > ALIGN => {
                Err(GcError::InvalidDescriptor(format!(
                    "payload alignment {align} exceeds the arena alignment {ALIGN}"
                )))
            }
            Descriptor::Trace { .. } => Ok(()),
        }
    }

    /// Visit every reference slot of a payload.
    ///
    /// # Safety
    /// `payload` must point to a live payload of at least
    /// [`Descriptor::min_payload`] bytes, aligned to `ALIGN`.
    pub(crate) unsafe fn visit(&self, payload: NonNull<u8>, visitor: &mut dyn FnMut(&RefSlot)) {
        match self {
            Descriptor::Leaf => {}
            Descriptor::Offsets(offsets) => {
                for &offset in offsets.iter() {
                    // SAFETY: offsets are slot aligned and below min_payload
                    let slot = unsafe { payload.add(offset).cast::<RefSlot>().as_ref() };
                    visitor(slot);
                }
            }
            Descriptor::Trace { trace, .. } => {
                // SAFETY: payload holds at least `size` bytes
                unsafe { (*trace)(payload.as_ptr(), visitor) }
            }
        }
    }
}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Descriptor::Leaf => f.write_str("Leaf"),
            Descriptor::Offsets(offsets) => f.debug_tuple("Offsets").field(offsets).finish(),
            Descriptor::Trace { size, align, .. } => f
                .debug_struct("Trace")
                .field("size", size)
                .field("align", align)
                .finish_non_exhaustive(),
        }
    }
}

/// Table of descriptors indexed by [`TypeTag`]
#[derive(Debug, Clone)]
pub struct DescriptorTable {
    rows: Vec<Descriptor>,
}

impl DescriptorTable {
    /// Table holding only the leaf row
    pub fn new() -> Self {
        Self {
            rows: vec![Descriptor::Leaf],
        }
    }

    /// Append a row and return its tag
    pub fn register(&mut self, descriptor: Descriptor) -> GcResult<TypeTag> {
        descriptor.validate()?;
        let raw = u32::try_from(self.rows.len())
            .map_err(|_| GcError::InvalidDescriptor("table is full".to_string()))?;
        self.rows.push(descriptor);
        Ok(TypeTag(raw))
    }

    /// Append a row for a `Traceable` payload type
    pub fn register_type<T: Traceable>(&mut self) -> GcResult<TypeTag> {
        self.register(Descriptor::of::<T>())
    }

    /// Row for `tag`
    pub fn get(&self, tag: TypeTag) -> Option<&Descriptor> {
        self.rows.get(tag.0 as usize)
    }

    /// Number of rows, leaf row included
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Always false: the leaf row is permanent
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl Default for DescriptorTable {
    fn default() -> Self {
        Self::new()
    }
}

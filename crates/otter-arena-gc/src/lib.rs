//! # Otter Arena GC
//!
//! Concurrent mark/sweep collector over a single pre-reserved arena.
//!
//! ## Design
//!
//! - **Arena**: one contiguous region; every block is a [`BlockHeader`]
//!   followed by its payload, and the first slot holds a permanent sentinel
//! - **First-fit allocation**: mutators walk the address-ordered block list
//!   and reclaim blocks the collector flagged dead as they pass them
//! - **Handoff list**: new blocks reach the collector through a lock-free
//!   stack, so neither side ever unlinks from a list the other owns
//! - **Background collector**: clears marks, traces from blocks with a
//!   non-zero root count and flags the rest dead, pass after pass
//! - **Write barrier**: stores and retains made while marking are recorded
//!   and traced before the sweep; new blocks are allocated marked
//! - **Weak holders**: `WEAKREF` blocks are nulled in the pass that kills
//!   their referent
//!
//! Blocks are described by a [`DescriptorTable`]: either byte offsets of
//! reference slots, or a [`Traceable`] payload type.
//!
//! ## Alternatives not taken
//!
//! Two other coordination schemes fit the same list layout. A global
//! invalidate flag set by the allocator can force the collector to restart
//! its pass whenever the block list changes under it; it is simpler but
//! starves the collector under steady allocation. Per-block allocator and
//! collector lock flags with busy waiting avoid restarts but put a spin on
//! every list step. The handoff list makes both unnecessary.
//!
//! ## Example
//!
//! ```ignore
//! use otter_arena_gc::{DescriptorTable, Gc, GcConfig, TypeTag, flags};
//!
//! let gc = Gc::init(GcConfig::default(), DescriptorTable::new())?;
//! let list = gc.create_ref(16, TypeTag::LEAF, flags::ROOT | flags::REFARRAY)?;
//! // Root the new block until it is linked from a live one.
//! let item = gc.create_ref(32, TypeTag::LEAF, flags::ROOT)?;
//! unsafe {
//!     gc.store_slot(list, 0, Some(item));
//!     gc.dec_ref(item);
//!     gc.dec_ref(list);
//! }
//! gc.shutdown();
//! ```

#![warn(clippy::all)]
#![warn(missing_docs)]

mod allocator;
mod arena;
pub mod barrier;
pub mod collector;
mod concurrent;
pub mod config;
pub mod descriptor;
pub mod error;
mod handoff;
pub mod heap;
pub mod object;
pub mod weak_ref;

pub use barrier::GcPhase;
pub use collector::{GcStats, HeapReport, PassReport};
pub use config::GcConfig;
pub use descriptor::{Descriptor, DescriptorTable, TraceFn, Traceable, TypeTag};
pub use error::{GcError, GcResult};
pub use heap::{Gc, GcHeap};
pub use object::{ALIGN, BlockHeader, BlockInfo, GcRef, HEADER_SIZE, RefSlot, SLOT_SIZE, flags};
pub use weak_ref::WeakRef;

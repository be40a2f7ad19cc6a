//! Write barrier for concurrent marking
//!
//! Mutator operations that create a new path to a block (pointer stores,
//! root retains, weak upgrades) run inside a shared barrier section. While
//! the collector is marking, the block they expose is recorded in a buffer
//! the collector drains and traces (insertion barrier).
//!
//! Phase changes and the final drain take the gate exclusively, so no
//! section straddles a transition.

use std::mem;
use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::object::HeaderPtr;

/// Collector phase
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcPhase {
    /// No pass in progress
    Idle = 0,
    /// Tracing; write barrier active
    Marking = 1,
    /// Condemning and publishing dead blocks
    Sweeping = 2,
}

impl From<u8> for GcPhase {
    fn from(value: u8) -> Self {
        match value {
            1 => GcPhase::Marking,
            2 => GcPhase::Sweeping,
            _ => GcPhase::Idle,
        }
    }
}

pub(crate) struct WriteBarrier {
    gate: RwLock<()>,
    phase: AtomicU8,
    buffer: Mutex<Vec<HeaderPtr>>,
}

impl WriteBarrier {
    pub(crate) fn new() -> Self {
        Self {
            gate: RwLock::new(()),
            phase: AtomicU8::new(GcPhase::Idle as u8),
            buffer: Mutex::new(Vec::with_capacity(256)),
        }
    }

    pub(crate) fn phase(&self) -> GcPhase {
        GcPhase::from(self.phase.load(Ordering::Acquire))
    }

    /// Enter a mutator section
    pub(crate) fn enter(&self) -> BarrierSection<'_> {
        BarrierSection {
            barrier: self,
            _guard: self.gate.read(),
        }
    }

    /// Exclude all mutator sections
    pub(crate) fn exclusive(&self) -> Exclusive<'_> {
        Exclusive {
            barrier: self,
            _guard: self.gate.write(),
        }
    }

    /// Take the buffered entries
    pub(crate) fn drain(&self) -> Vec<HeaderPtr> {
        mem::take(&mut *self.buffer.lock())
    }
}

/// Shared section held by a mutator while it exposes a block
pub(crate) struct BarrierSection<'a> {
    barrier: &'a WriteBarrier,
    _guard: RwLockReadGuard<'a, ()>,
}

impl BarrierSection<'_> {
    /// Record `node` if the collector is marking
    pub(crate) fn shade(&self, node: HeaderPtr) {
        // The phase cannot change while the section is held.
        if self.barrier.phase() == GcPhase::Marking {
            self.barrier.buffer.lock().push(node);
        }
    }
}

/// Exclusive section held by the collector
pub(crate) struct Exclusive<'a> {
    barrier: &'a WriteBarrier,
    _guard: RwLockWriteGuard<'a, ()>,
}

impl Exclusive<'_> {
    pub(crate) fn set_phase(&self, phase: GcPhase) {
        self.barrier.phase.store(phase as u8, Ordering::Release);
    }

    pub(crate) fn drain(&self) -> Vec<HeaderPtr> {
        self.barrier.drain()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr::NonNull;

    #[test]
    fn test_phase_from_u8() {
        assert_eq!(GcPhase::from(0), GcPhase::Idle);
        assert_eq!(GcPhase::from(1), GcPhase::Marking);
        assert_eq!(GcPhase::from(2), GcPhase::Sweeping);
        assert_eq!(GcPhase::from(9), GcPhase::Idle);
    }

    #[test]
    fn test_shade_only_while_marking() {
        let barrier = WriteBarrier::new();
        let mut word = 0u64;
        let node = HeaderPtr::new(NonNull::from(&mut word).cast());

        barrier.enter().shade(node);
        assert!(barrier.drain().is_empty());

        barrier.exclusive().set_phase(GcPhase::Marking);
        barrier.enter().shade(node);
        barrier.enter().shade(node);
        assert_eq!(barrier.drain(), vec![node, node]);

        let exclusive = barrier.exclusive();
        exclusive.set_phase(GcPhase::Idle);
        assert!(exclusive.drain().is_empty());
        drop(exclusive);
        assert_eq!(barrier.phase(), GcPhase::Idle);
    }
}

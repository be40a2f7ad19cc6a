//! Handoff list between the allocator and the collector
//!
//! The only list both roles write. The allocator pushes freshly initialized
//! blocks onto the head; the collector detaches the whole chain with one swap
//! and splices it into its mark list. A node on the list always has
//! `addme == 1`.

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crossbeam_utils::{Backoff, CachePadded};

use crate::object::{BlockHeader, HeaderPtr};

pub(crate) struct HandoffList {
    head: CachePadded<AtomicPtr<BlockHeader>>,
    pending: AtomicUsize,
}

impl HandoffList {
    pub(crate) fn new() -> Self {
        Self {
            head: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
            pending: AtomicUsize::new(0),
        }
    }

    /// Push a block onto the list.
    ///
    /// # Safety
    /// `node` must be fully initialized with `addme == 1` and not be on the
    /// list already.
    pub(crate) unsafe fn publish(&self, node: HeaderPtr) {
        // SAFETY: caller guarantees the header is initialized
        let header = unsafe { node.get() };
        debug_assert!(header.is_pending());

        self.pending.fetch_add(1, Ordering::Relaxed);
        let backoff = Backoff::new();
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            header.addme_next.store(head, Ordering::Relaxed);
            match self.head.compare_exchange_weak(
                head,
                node.as_ptr(),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(current) => {
                    head = current;
                    backoff.spin();
                }
            }
        }
    }

    /// Detach every published block, newest first.
    pub(crate) fn take(&self) -> Detached<'_> {
        let head = self.head.swap(ptr::null_mut(), Ordering::Acquire);
        Detached {
            list: self,
            next: HeaderPtr::from_raw(head),
        }
    }

    /// Newest published block, for inspection while publishing and taking
    /// are both held off
    pub(crate) fn head(&self) -> Option<HeaderPtr> {
        HeaderPtr::from_raw(self.head.load(Ordering::Acquire))
    }

    /// Blocks published and not yet taken
    pub(crate) fn pending(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }
}

/// A chain detached from the handoff list
pub(crate) struct Detached<'a> {
    list: &'a HandoffList,
    next: Option<HeaderPtr>,
}

impl Iterator for Detached<'_> {
    type Item = HeaderPtr;

    fn next(&mut self) -> Option<HeaderPtr> {
        let node = self.next?;
        // SAFETY: published blocks are not reclaimed before the collector
        // has absorbed and swept them
        let header = unsafe { node.get() };
        debug_assert!(header.is_pending(), "handoff node without addme");
        self.next = HeaderPtr::from_raw(header.addme_next.load(Ordering::Relaxed));
        self.list.pending.fetch_sub(1, Ordering::Relaxed);
        Some(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::TypeTag;
    use crate::object::HEADER_SIZE;
    use std::ptr::NonNull;

    fn node(header: &mut BlockHeader) -> HeaderPtr {
        HeaderPtr::new(NonNull::from(header))
    }

    #[test]
    fn test_take_is_lifo() {
        let list = HandoffList::new();
        let mut a = BlockHeader::new(HEADER_SIZE, TypeTag::LEAF, 0, 0);
        let mut b = BlockHeader::new(HEADER_SIZE, TypeTag::LEAF, 0, 0);
        let (a, b) = (node(&mut a), node(&mut b));

        unsafe {
            list.publish(a);
            list.publish(b);
        }
        assert_eq!(list.pending(), 2);

        let taken: Vec<_> = list.take().collect();
        assert_eq!(taken, vec![b, a]);
        assert_eq!(list.pending(), 0);
        assert_eq!(list.take().count(), 0);
    }

    #[test]
    fn test_concurrent_publish() {
        const THREADS: usize = 4;
        const PER_THREAD: usize = 64;

        let list = HandoffList::new();
        let mut headers: Vec<BlockHeader> = (0..THREADS * PER_THREAD)
            .map(|_| BlockHeader::new(HEADER_SIZE, TypeTag::LEAF, 0, 0))
            .collect();
        let nodes: Vec<HeaderPtr> = headers.iter_mut().map(node).collect();

        std::thread::scope(|scope| {
            for chunk in nodes.chunks(PER_THREAD) {
                let list = &list;
                scope.spawn(move || {
                    for &n in chunk {
                        unsafe { list.publish(n) };
                    }
                });
            }
        });

        let mut taken: Vec<usize> = list.take().map(HeaderPtr::addr).collect();
        let mut expected: Vec<usize> = nodes.iter().map(|n| n.addr()).collect();
        taken.sort_unstable();
        expected.sort_unstable();
        assert_eq!(taken, expected);
    }
}

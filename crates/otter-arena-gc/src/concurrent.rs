//! Background collector thread
//!
//! Runs collector passes back to back, yielding between them, until the
//! owning [`Gc`](crate::Gc) shuts it down.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use crate::error::{GcError, GcResult};
use crate::heap::GcHeap;

pub(crate) struct CollectorThread {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl CollectorThread {
    pub(crate) fn spawn(heap: Arc<GcHeap>, name: &str) -> GcResult<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);

        // Allocators may start waiting on passes before the thread runs.
        heap.set_collector_running(true);
        let worker = Arc::clone(&heap);
        let spawned = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run(&worker, &flag));

        match spawned {
            Ok(handle) => {
                #[cfg(feature = "gc_logging")]
                tracing::info!(
                    target: "otter::arena_gc",
                    thread = name,
                    arena_bytes = heap.capacity(),
                    "collector started"
                );
                Ok(Self {
                    shutdown,
                    handle: Some(handle),
                })
            }
            Err(err) => {
                heap.set_collector_running(false);
                Err(GcError::Spawn(err.to_string()))
            }
        }
    }

    /// Request shutdown and wait for the current pass to finish.
    pub(crate) fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                #[cfg(feature = "gc_logging")]
                tracing::warn!(target: "otter::arena_gc", "collector thread panicked");
            }
            #[cfg(feature = "gc_logging")]
            tracing::info!(target: "otter::arena_gc", "collector stopped");
        }
    }
}

impl Drop for CollectorThread {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(heap: &GcHeap, shutdown: &AtomicBool) {
    // Clears the running flag even if a pass panics.
    struct Running<'a>(&'a GcHeap);
    impl Drop for Running<'_> {
        fn drop(&mut self) {
            self.0.set_collector_running(false);
        }
    }
    let _running = Running(heap);

    while !shutdown.load(Ordering::Acquire) {
        heap.collect();
        thread::yield_now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GcConfig;
    use crate::descriptor::DescriptorTable;

    #[test]
    fn test_thread_runs_passes_until_stopped() {
        let heap = GcHeap::new(GcConfig::manual(4096), DescriptorTable::new()).unwrap();
        let mut worker = CollectorThread::spawn(Arc::clone(&heap), "arena-gc-test").unwrap();
        assert!(heap.is_collector_running());

        while heap.passes() < 3 {
            thread::yield_now();
        }
        worker.stop();
        assert!(!heap.is_collector_running());

        let passes = heap.passes();
        thread::yield_now();
        assert_eq!(heap.passes(), passes);
    }
}

//! Heap configuration

use crate::error::{GcError, GcResult};
use crate::object::HEADER_SIZE;

/// GC configuration
#[derive(Debug, Clone)]
pub struct GcConfig {
    /// Arena size in bytes, sentinel included (default: 16MB)
    pub arena_size: usize,
    /// Start a background collector thread on init (default: true)
    pub background_collector: bool,
    /// Name of the collector thread
    pub thread_name: String,
    /// How many times an allocation that found no gap waits for the
    /// background collector before giving up (default: 2)
    pub alloc_retry_passes: u32,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            arena_size: 16 * 1024 * 1024, // 16MB
            background_collector: true,
            thread_name: "otter-arena-gc".to_string(),
            alloc_retry_passes: 2,
        }
    }
}

impl GcConfig {
    /// Default configuration with a different arena size
    pub fn with_arena_size(arena_size: usize) -> Self {
        Self {
            arena_size,
            ..Self::default()
        }
    }

    /// Configuration without a background thread.
    ///
    /// Collection only happens when the caller runs `GcHeap::collect`.
    pub fn manual(arena_size: usize) -> Self {
        Self {
            arena_size,
            background_collector: false,
            alloc_retry_passes: 0,
            ..Self::default()
        }
    }

    pub(crate) fn validate(&self) -> GcResult<()> {
        if self.arena_size < 2 * HEADER_SIZE {
            return Err(GcError::InvalidConfig(format!(
                "arena_size {} is below the minimum of {} bytes",
                self.arena_size,
                2 * HEADER_SIZE
            )));
        }
        if self.background_collector && self.thread_name.is_empty() {
            return Err(GcError::InvalidConfig(
                "collector thread name must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

//! Error types for the arena collector

use thiserror::Error;

/// Errors surfaced by heap construction and allocation.
///
/// Protocol violations (double release, use of a swept reference) are not
/// represented here: they are programming errors caught by debug assertions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GcError {
    /// No gap in the arena fits the request
    #[error("arena exhausted: requested {requested} bytes, capacity {capacity} bytes")]
    OutOfMemory {
        /// Block size that was requested (header included, rounded)
        requested: usize,
        /// Total arena capacity
        capacity: usize,
    },

    /// Type tag has no row in the descriptor table
    #[error("unknown type tag {0}")]
    UnknownType(u32),

    /// Payload too small for the slots its descriptor names
    #[error("payload of {len} bytes is smaller than the {required} bytes type {tag} describes")]
    PayloadTooSmall {
        /// Requested type tag
        tag: u32,
        /// Requested payload length
        len: usize,
        /// Minimum payload length for the type
        required: usize,
    },

    /// Unknown or conflicting allocation flags
    #[error("invalid allocation flags {0:#04x}")]
    InvalidFlags(u8),

    /// Descriptor row rejected at registration
    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(String),

    /// Configuration rejected at init
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Block lists failed verification
    #[error("arena corrupted: {0}")]
    Corrupted(String),

    /// The background collector thread could not be started
    #[error("failed to spawn collector thread: {0}")]
    Spawn(String),
}

/// Result alias used throughout the crate
pub type GcResult<T> = Result<T, GcError>;

//! Error types for the fluid kernel.

use thiserror::Error;

/// Errors surfaced by solver construction and the per-substep phases.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum KernelError {
    /// A solver parameter is out of its valid range.
    #[error("invalid parameter `{name}`: {reason}")]
    InvalidParams {
        /// Parameter name.
        name: &'static str,
        /// Why the value was rejected.
        reason: String,
    },

    /// The grid descriptor cannot be built from the given extents.
    #[error("invalid grid: {0}")]
    InvalidGrid(String),

    /// A position hashed to a cell outside `[0, grid_num)`.
    #[error("position {position:?} maps to cell {cell:?} outside grid dims {dims:?}")]
    CellOutOfRange {
        /// Offending world-space position.
        position: [f32; 3],
        /// Unclamped integer cell coordinates.
        cell: [i64; 3],
        /// Grid dimensions.
        dims: [u32; 3],
    },

    /// Two particles were scattered to the same sorted slot.
    #[error("counting sort collision at slot {slot}: particles {first} and {second}")]
    SortCollision {
        /// Sorted-buffer slot.
        slot: usize,
        /// Particle that claimed the slot first.
        first: u32,
        /// Particle that tried to claim it again.
        second: u32,
    },

    /// A sorted slot was never written, or a particle's slot lies past the end.
    #[error("counting sort gap at slot {slot} (particle count {particle_count})")]
    SortGap {
        /// Sorted-buffer slot.
        slot: usize,
        /// Number of particles.
        particle_count: usize,
    },

    /// The GPU scatter wrote particles to an occupied or out-of-range slot.
    #[error("GPU counting sort misplaced {faults} particles")]
    GpuSortFaults {
        /// Particles that hit an occupied slot or landed past the end.
        faults: u32,
    },

    /// Two buffers handed to a phase disagree in length.
    #[error("buffer length mismatch for {buffer}: expected {expected}, got {actual}")]
    LengthMismatch {
        /// Buffer name.
        buffer: &'static str,
        /// Expected length.
        expected: usize,
        /// Actual length.
        actual: usize,
    },

    /// The reflecting box does not fit inside the hashed region.
    #[error("boundary half-extents {requested:?} exceed hashed region {limit:?}")]
    BoxOutsideGrid {
        /// Requested half-extents.
        requested: [f32; 3],
        /// Half-extents of the hashed region.
        limit: [f32; 3],
    },

    /// GPU device, pipeline or buffer setup failed.
    #[error("GPU initialization failed: {0}")]
    GpuInit(String),

    /// Reading a GPU buffer back to the host failed.
    #[error("GPU readback failed: {0}")]
    GpuReadback(String),
}

/// Convenience alias used throughout the kernel.
pub type Result<T> = std::result::Result<T, KernelError>;

impl KernelError {
    pub(crate) fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidParams {
            name,
            reason: reason.into(),
        }
    }
}

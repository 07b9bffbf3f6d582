//! Uniform grid descriptor and the cell-counting phase.
//!
//! The grid covers the reflecting box plus a sentinel margin on every side,
//! so a particle inside the box and all 27 cells around it always hash to
//! valid cells. Cells are linearised x-fastest:
//!
//! ```text
//! cell = xi + yi * x_grids + zi * x_grids * y_grids
//! ```

use std::sync::atomic::{AtomicU32, Ordering};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{KernelError, Result};
use crate::particle::Particle;

/// Default sentinel margin, in cells.
pub const DEFAULT_SENTINEL_CELLS: u32 = 2;

/// Fixed spatial hashing layout for one run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridDescriptor {
    /// Cells per axis.
    pub dims: [u32; 3],
    /// Edge length of a cell (equal to the kernel radius).
    pub cell_size: f32,
    /// Half-extents of the region the grid was sized for.
    pub half_extents: [f32; 3],
    /// Padding added on each side of the region.
    pub sentinel_offset: f32,
}

impl GridDescriptor {
    /// Size a grid for `half_extents` with `cell_size` cells and a margin of
    /// `sentinel_cells` cells on every side.
    pub fn new(half_extents: [f32; 3], cell_size: f32, sentinel_cells: u32) -> Result<Self> {
        if !(cell_size.is_finite() && cell_size > 0.0) {
            return Err(KernelError::InvalidGrid(format!(
                "cell size {cell_size} must be positive"
            )));
        }
        if sentinel_cells == 0 {
            return Err(KernelError::InvalidGrid(
                "at least one sentinel cell is required for 27-cell neighbour search".into(),
            ));
        }
        let sentinel_offset = sentinel_cells as f32 * cell_size;
        let mut dims = [0u32; 3];
        for axis in 0..3 {
            let h = half_extents[axis];
            if !(h.is_finite() && h > 0.0) {
                return Err(KernelError::InvalidGrid(format!(
                    "half extent {h} on axis {axis} must be positive"
                )));
            }
            let cells = ((2.0 * h + 2.0 * sentinel_offset) / cell_size).ceil();
            if cells > u32::MAX as f32 {
                return Err(KernelError::InvalidGrid(format!(
                    "{cells} cells on axis {axis} overflows u32"
                )));
            }
            dims[axis] = cells as u32;
        }
        let desc = Self {
            dims,
            cell_size,
            half_extents,
            sentinel_offset,
        };
        if desc.grid_num_checked().is_none() {
            return Err(KernelError::InvalidGrid(format!(
                "grid {dims:?} has more cells than fit in u32"
            )));
        }
        Ok(desc)
    }

    fn grid_num_checked(&self) -> Option<u32> {
        self.dims[0]
            .checked_mul(self.dims[1])
            .and_then(|xy| xy.checked_mul(self.dims[2]))
    }

    /// Total number of cells, `x_grids * y_grids * z_grids`.
    #[inline]
    pub fn grid_num(&self) -> usize {
        self.dims[0] as usize * self.dims[1] as usize * self.dims[2] as usize
    }

    /// Unclamped integer cell coordinates of `p`.
    #[inline]
    pub fn cell_coords(&self, p: [f32; 3]) -> [i64; 3] {
        let mut c = [0i64; 3];
        for axis in 0..3 {
            let shifted = p[axis] + self.half_extents[axis] + self.sentinel_offset;
            c[axis] = (shifted / self.cell_size).floor() as i64;
        }
        c
    }

    /// Linear index of in-range cell coordinates.
    #[inline]
    pub fn linearize(&self, c: [u32; 3]) -> usize {
        c[0] as usize
            + c[1] as usize * self.dims[0] as usize
            + c[2] as usize * self.dims[0] as usize * self.dims[1] as usize
    }

    /// Cell of `p`, clamped into the grid. The flag is `true` when clamping
    /// was needed, which means the position left the padded region.
    #[inline]
    pub fn cell_index(&self, p: [f32; 3]) -> (usize, bool) {
        let raw = self.cell_coords(p);
        let mut clamped = false;
        let mut c = [0u32; 3];
        for axis in 0..3 {
            let max = self.dims[axis] as i64 - 1;
            let v = raw[axis].clamp(0, max);
            clamped |= v != raw[axis];
            c[axis] = v as u32;
        }
        // NaN positions floor to 0 via the saturating cast; treat as out of range.
        if !(p[0].is_finite() && p[1].is_finite() && p[2].is_finite()) {
            clamped = true;
        }
        (self.linearize(c), clamped)
    }

    /// Cell of `p`, or [`KernelError::CellOutOfRange`] if it is outside the grid.
    pub fn cell_index_checked(&self, p: [f32; 3]) -> Result<usize> {
        let raw = self.cell_coords(p);
        let inside = p.iter().all(|v| v.is_finite())
            && (0..3).all(|a| raw[a] >= 0 && raw[a] < self.dims[a] as i64);
        if !inside {
            return Err(KernelError::CellOutOfRange {
                position: p,
                cell: raw,
                dims: self.dims,
            });
        }
        Ok(self.linearize([raw[0] as u32, raw[1] as u32, raw[2] as u32]))
    }

    /// Clamped integer coordinates of `p`, used by the neighbour search.
    #[inline]
    pub(crate) fn clamped_coords(&self, p: [f32; 3]) -> [i64; 3] {
        let raw = self.cell_coords(p);
        let mut c = raw;
        for axis in 0..3 {
            c[axis] = raw[axis].clamp(0, self.dims[axis] as i64 - 1);
        }
        c
    }

    /// `true` if a box with `half_extents` fits inside the hashed region.
    pub fn covers(&self, half_extents: [f32; 3]) -> bool {
        (0..3).all(|a| half_extents[a] <= self.half_extents[a])
    }
}

/// Clears and fills the per-cell particle counts.
///
/// Owns the count array and the per-particle local offsets; both are
/// allocated once and reused every substep.
pub struct GridBuilder {
    desc: GridDescriptor,
    /// Particles per cell, written with atomic fetch-and-add.
    counts: Vec<AtomicU32>,
    /// Pre-increment counter value per particle: its rank within its cell.
    local_offsets: Vec<u32>,
}

impl GridBuilder {
    /// Allocate counts for `desc` and offsets for `particle_count` particles.
    pub fn new(desc: GridDescriptor, particle_count: usize) -> Self {
        let counts = (0..desc.grid_num()).map(|_| AtomicU32::new(0)).collect();
        Self {
            desc,
            counts,
            local_offsets: vec![0; particle_count],
        }
    }

    /// Grid this builder hashes into.
    pub fn descriptor(&self) -> &GridDescriptor {
        &self.desc
    }

    /// Zero every cell counter.
    pub fn clear(&self) {
        self.counts
            .par_iter()
            .for_each(|c| c.store(0, Ordering::Relaxed));
    }

    /// Count particles per cell and record each particle's local offset.
    ///
    /// Every particle does one `fetch_add` on its cell counter; the returned
    /// pre-increment value is its rank within the cell, unique among the
    /// particles of that cell. Positions outside the padded region are
    /// clamped into the nearest edge cell; the number of such particles is
    /// returned and logged.
    pub fn count(&mut self, particles: &[Particle]) -> Result<u32> {
        if particles.len() != self.local_offsets.len() {
            return Err(KernelError::LengthMismatch {
                buffer: "particles",
                expected: self.local_offsets.len(),
                actual: particles.len(),
            });
        }
        let desc = &self.desc;
        let counts = &self.counts;
        let clamped: u32 = self
            .local_offsets
            .par_iter_mut()
            .zip(particles.par_iter())
            .map(|(offset, p)| {
                let (cell, clamped) = desc.cell_index(p.position);
                *offset = counts[cell].fetch_add(1, Ordering::Relaxed);
                clamped as u32
            })
            .sum();
        if clamped > 0 {
            tracing::warn!(
                clamped,
                dims = ?self.desc.dims,
                "particles hashed outside the padded grid were clamped to edge cells"
            );
        }
        Ok(clamped)
    }

    /// Per-cell counts from the last [`count`](Self::count).
    pub fn counts(&self) -> &[AtomicU32] {
        &self.counts
    }

    /// Count of a single cell.
    pub fn cell_count(&self, cell: usize) -> u32 {
        self.counts[cell].load(Ordering::Relaxed)
    }

    /// Per-particle local offsets from the last [`count`](Self::count).
    pub fn local_offsets(&self) -> &[u32] {
        &self.local_offsets
    }
}

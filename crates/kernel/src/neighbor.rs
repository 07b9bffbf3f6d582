//! 27-cell neighbour enumeration over the cell-ordered particle buffer.
//!
//! After the counting sort, cell `c` owns the sorted slots
//! `prefix[c] .. prefix[c + 1]` (the last cell ends at the particle count),
//! so neighbour search needs no per-cell lists: only the prefix sum and the
//! sorted buffer.

use std::ops::Range;

use crate::grid::GridDescriptor;

/// Read-only view of the grid's cell ranges for one substep.
#[derive(Clone, Copy)]
pub struct NeighborView<'a> {
    grid: &'a GridDescriptor,
    prefix: &'a [u32],
    particle_count: usize,
}

impl<'a> NeighborView<'a> {
    /// Wrap the prefix sum produced for `grid`.
    pub fn new(grid: &'a GridDescriptor, prefix: &'a [u32], particle_count: usize) -> Self {
        debug_assert_eq!(prefix.len(), grid.grid_num());
        Self {
            grid,
            prefix,
            particle_count,
        }
    }

    /// Sorted-buffer slots belonging to `cell`.
    #[inline]
    pub fn cell_range(&self, cell: usize) -> Range<usize> {
        let start = self.prefix[cell] as usize;
        let end = self
            .prefix
            .get(cell + 1)
            .map_or(self.particle_count, |&e| e as usize);
        start..end
    }

    /// Call `f` with every sorted slot in the 3x3x3 block of cells around the
    /// cell containing `position`, including that cell itself.
    ///
    /// Cells past the grid edge are skipped. No distance filtering is done
    /// here; callers test against the kernel radius.
    #[inline]
    pub fn for_each_candidate<F>(&self, position: [f32; 3], mut f: F)
    where
        F: FnMut(usize),
    {
        let [cx, cy, cz] = self.grid.clamped_coords(position);
        let dims = self.grid.dims;

        for dz in -1i64..=1 {
            let nz = cz + dz;
            if nz < 0 || nz >= dims[2] as i64 {
                continue;
            }
            for dy in -1i64..=1 {
                let ny = cy + dy;
                if ny < 0 || ny >= dims[1] as i64 {
                    continue;
                }
                for dx in -1i64..=1 {
                    let nx = cx + dx;
                    if nx < 0 || nx >= dims[0] as i64 {
                        continue;
                    }
                    let cell = self.grid.linearize([nx as u32, ny as u32, nz as u32]);
                    for k in self.cell_range(cell) {
                        f(k);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranges_follow_prefix() {
        let grid = GridDescriptor::new([0.5; 3], 1.0, 1).unwrap();
        assert_eq!(grid.grid_num(), 27);
        let mut prefix = vec![0u32; 27];
        // Cell 13 (the centre) holds slots 0..3, cell 26 holds 3..5.
        for p in prefix.iter_mut().skip(14) {
            *p = 3;
        }
        prefix[26] = 3;
        let view = NeighborView::new(&grid, &prefix, 5);
        assert_eq!(view.cell_range(13), 0..3);
        assert_eq!(view.cell_range(26), 3..5);
        assert_eq!(view.cell_range(0), 0..0);
    }

    #[test]
    fn centre_cell_sees_all_27_cells() {
        let grid = GridDescriptor::new([0.5; 3], 1.0, 1).unwrap();
        // One particle per cell.
        let prefix: Vec<u32> = (0..27).collect();
        let view = NeighborView::new(&grid, &prefix, 27);
        let mut seen = Vec::new();
        view.for_each_candidate([0.0; 3], |k| seen.push(k));
        seen.sort_unstable();
        assert_eq!(seen, (0..27).collect::<Vec<_>>());
    }

    #[test]
    fn corner_cell_skips_outside_cells() {
        let grid = GridDescriptor::new([0.5; 3], 1.0, 1).unwrap();
        let prefix: Vec<u32> = (0..27).collect();
        let view = NeighborView::new(&grid, &prefix, 27);
        let mut seen = Vec::new();
        view.for_each_candidate([-1.4, -1.4, -1.4], |k| seen.push(k));
        assert_eq!(seen.len(), 8);
    }
}

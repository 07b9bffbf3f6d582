//! Counting sort of particles into cell order.
//!
//! Each particle `i` in cell `c` lands at `prefix[c] + local_offset[i]`.
//! The scatter goes through a claim table of slot owners: every particle
//! claims its slot with a compare-exchange, so a collision (two particles,
//! one slot) or a slot beyond the end is reported instead of overwriting
//! another record. The sorted buffer is then gathered from the claim table,
//! and an unclaimed slot is reported as a gap.

use std::sync::atomic::{AtomicU32, Ordering};

use rayon::prelude::*;

use crate::error::{KernelError, Result};
use crate::grid::GridDescriptor;
use crate::particle::Particle;

const UNCLAIMED: u32 = u32::MAX;

/// Scatter of the canonical particle buffer into its cell-ordered copy.
pub struct CountingSort {
    /// `slot_owner[k]` = unsorted index of the particle at sorted slot `k`.
    slot_owner: Vec<AtomicU32>,
    /// Order each cell's particles by identity after the scatter.
    deterministic: bool,
}

/// Buffers read by one [`CountingSort::execute`].
#[derive(Clone, Copy)]
pub struct SortInputs<'a> {
    /// Grid the counts were built on.
    pub grid: &'a GridDescriptor,
    /// Canonical particle buffer.
    pub unsorted: &'a [Particle],
    /// Exclusive scan of the cell counts.
    pub prefix: &'a [u32],
    /// Per-particle rank within its cell.
    pub local_offsets: &'a [u32],
}

impl CountingSort {
    /// Allocate the claim table for `particle_count` particles.
    pub fn new(particle_count: usize) -> Self {
        Self {
            slot_owner: (0..particle_count).map(|_| AtomicU32::new(UNCLAIMED)).collect(),
            deterministic: false,
        }
    }

    /// When enabled, particles within a cell are ordered by identity rather
    /// than by the order their atomic increments happened to run in.
    pub fn set_deterministic(&mut self, deterministic: bool) {
        self.deterministic = deterministic;
    }

    /// Whether per-cell ordering by identity is enabled.
    pub fn is_deterministic(&self) -> bool {
        self.deterministic
    }

    /// Write `sorted[prefix[c] + o] = unsorted[i]` and `sorted_ids[...] = i`.
    ///
    /// `prefix` and `local_offsets` must come from a count over the same
    /// positions; stale counts surface as [`KernelError::SortCollision`] or
    /// [`KernelError::SortGap`]. Zero particles is a no-op.
    pub fn execute(
        &mut self,
        inputs: SortInputs<'_>,
        sorted: &mut [Particle],
        sorted_ids: &mut [u32],
    ) -> Result<()> {
        let n = self.slot_owner.len();
        check_len("unsorted", n, inputs.unsorted.len())?;
        check_len("local_offsets", n, inputs.local_offsets.len())?;
        check_len("sorted", n, sorted.len())?;
        check_len("sorted_ids", n, sorted_ids.len())?;
        check_len("prefix", inputs.grid.grid_num(), inputs.prefix.len())?;
        if n == 0 {
            return Ok(());
        }

        self.slot_owner
            .par_iter()
            .for_each(|s| s.store(UNCLAIMED, Ordering::Relaxed));

        let owners = &self.slot_owner;
        inputs
            .unsorted
            .par_iter()
            .zip(inputs.local_offsets.par_iter())
            .enumerate()
            .try_for_each(|(i, (p, &offset))| {
                let (cell, _) = inputs.grid.cell_index(p.position);
                let slot = inputs.prefix[cell] as usize + offset as usize;
                if slot >= n {
                    return Err(KernelError::SortGap {
                        slot,
                        particle_count: n,
                    });
                }
                owners[slot]
                    .compare_exchange(UNCLAIMED, i as u32, Ordering::Relaxed, Ordering::Relaxed)
                    .map(|_| ())
                    .map_err(|first| KernelError::SortCollision {
                        slot,
                        first,
                        second: i as u32,
                    })
            })?;

        if self.deterministic {
            self.order_cells_by_identity(inputs.prefix);
        }

        let owners = &self.slot_owner;
        sorted
            .par_iter_mut()
            .zip(sorted_ids.par_iter_mut())
            .enumerate()
            .try_for_each(|(slot, (dst, id))| {
                let owner = owners[slot].load(Ordering::Relaxed);
                if owner == UNCLAIMED {
                    return Err(KernelError::SortGap {
                        slot,
                        particle_count: n,
                    });
                }
                *dst = inputs.unsorted[owner as usize];
                *id = owner;
                Ok(())
            })
    }

    /// Sort every cell's segment of the claim table by particle index.
    fn order_cells_by_identity(&mut self, prefix: &[u32]) {
        let n = self.slot_owner.len();
        let mut segments: Vec<&mut [AtomicU32]> = Vec::new();
        let mut rest: &mut [AtomicU32] = &mut self.slot_owner;
        let mut consumed = 0usize;
        for (c, &start) in prefix.iter().enumerate() {
            let end = prefix.get(c + 1).map_or(n, |&e| e as usize);
            let start = start as usize;
            if end <= start + 1 {
                continue;
            }
            let (_, tail) = std::mem::take(&mut rest).split_at_mut(start - consumed);
            let (segment, tail) = tail.split_at_mut(end - start);
            segments.push(segment);
            rest = tail;
            consumed = end;
        }
        segments
            .into_par_iter()
            .for_each(|seg| seg.sort_unstable_by_key(|a| a.load(Ordering::Relaxed)));
    }
}

fn check_len(buffer: &'static str, expected: usize, actual: usize) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(KernelError::LengthMismatch {
            buffer,
            expected,
            actual,
        })
    }
}

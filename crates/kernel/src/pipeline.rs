//! CPU solver: the substep phase pipeline on the rayon thread pool.
//!
//! Each [`Phase`] is one data-parallel dispatch. A phase returns only after
//! every worker has finished, which is the barrier the next phase relies on.

use serde::{Deserialize, Serialize};

use crate::error::{KernelError, Result};
use crate::grid::{GridBuilder, GridDescriptor, DEFAULT_SENTINEL_CELLS};
use crate::neighbor::NeighborView;
use crate::params::{BoundaryBox, SphParams};
use crate::particle::Particle;
use crate::scan::ParallelPrefixSum;
use crate::sort::{CountingSort, SortInputs};
use crate::sph;
use crate::{FluidSolver, FrameStats};

/// One dispatch of the substep pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Zero the per-cell counters.
    GridClear,
    /// Count particles per cell and assign local offsets.
    GridCount,
    /// Exclusive scan of the cell counts.
    PrefixSum,
    /// Scatter the canonical buffer into cell order.
    Sort,
    /// Density and near-density into the canonical buffer.
    Density,
    /// Scatter again so the sorted copy carries the new densities.
    Resort,
    /// Net acceleration into the canonical buffer.
    Force,
    /// Semi-implicit Euler step with box reflection.
    Integrate,
}

impl Phase {
    /// Short name used in trace spans.
    pub fn name(self) -> &'static str {
        match self {
            Phase::GridClear => "grid_clear",
            Phase::GridCount => "grid_count",
            Phase::PrefixSum => "prefix_sum",
            Phase::Sort => "sort",
            Phase::Density => "density",
            Phase::Resort => "resort",
            Phase::Force => "force",
            Phase::Integrate => "integrate",
        }
    }
}

/// Phase order of one substep.
pub const SUBSTEP_PHASES: [Phase; 8] = [
    Phase::GridClear,
    Phase::GridCount,
    Phase::PrefixSum,
    Phase::Sort,
    Phase::Density,
    Phase::Resort,
    Phase::Force,
    Phase::Integrate,
];

/// Phases run once at construction so the first substep starts from valid
/// densities and accelerations.
pub const PRIME_PHASES: [Phase; 7] = [
    Phase::GridClear,
    Phase::GridCount,
    Phase::PrefixSum,
    Phase::Sort,
    Phase::Density,
    Phase::Resort,
    Phase::Force,
];

/// Solver construction options.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SolverOptions {
    /// Substeps per [`FluidSolver::step_frame`].
    #[serde(default = "default_substeps")]
    pub substeps_per_frame: u32,
    /// Order particles within each cell by identity after every sort.
    #[serde(default)]
    pub deterministic: bool,
    /// Fail the substep instead of clamping when a particle hashes outside
    /// the grid.
    #[serde(default)]
    pub strict_hashing: bool,
    /// Sentinel margin around the hashed region, in cells.
    #[serde(default = "default_sentinel_cells")]
    pub sentinel_cells: u32,
    /// Half-extents of the hashed region. Defaults to the initial box; a
    /// larger region leaves room to grow the box at runtime.
    #[serde(default)]
    pub grid_half_extents: Option<[f32; 3]>,
}

fn default_substeps() -> u32 {
    2
}

fn default_sentinel_cells() -> u32 {
    DEFAULT_SENTINEL_CELLS
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            substeps_per_frame: default_substeps(),
            deterministic: false,
            strict_hashing: false,
            sentinel_cells: default_sentinel_cells(),
            grid_half_extents: None,
        }
    }
}

impl SolverOptions {
    /// Check option ranges.
    pub fn validate(&self) -> Result<()> {
        if self.substeps_per_frame == 0 {
            return Err(KernelError::invalid(
                "substeps_per_frame",
                "at least one substep per frame is required",
            ));
        }
        Ok(())
    }

    /// Grid sized for `boundary` under these options.
    pub fn grid_for(&self, params: &SphParams, boundary: &BoundaryBox) -> Result<GridDescriptor> {
        let region = self.grid_half_extents.unwrap_or(boundary.half_extents);
        let grid = GridDescriptor::new(region, params.kernel_radius, self.sentinel_cells)?;
        if !grid.covers(boundary.half_extents) {
            return Err(KernelError::BoxOutsideGrid {
                requested: boundary.half_extents,
                limit: grid.half_extents,
            });
        }
        Ok(grid)
    }
}

/// Validate everything a back-end needs before allocating.
pub(crate) fn validate_setup(
    particles: &[Particle],
    params: &SphParams,
    boundary: &BoundaryBox,
    options: &SolverOptions,
) -> Result<GridDescriptor> {
    params.validate()?;
    boundary.validate()?;
    options.validate()?;
    if particles.len() >= u32::MAX as usize {
        return Err(KernelError::invalid(
            "particle_count",
            format!("{} particles do not fit in u32 indices", particles.len()),
        ));
    }
    let outside = particles
        .iter()
        .filter(|p| !boundary.contains(p.position))
        .count();
    if outside > 0 {
        tracing::warn!(outside, "initial particles lie outside the boundary box");
    }
    options.grid_for(params, boundary)
}

/// Reference CPU implementation of [`FluidSolver`].
///
/// All buffers are allocated in [`new`](Self::new) and reused; a substep
/// performs no allocation on the hot path.
pub struct CpuSolver {
    /// SPH parameters (fixed for the run).
    params: SphParams,
    /// Reflecting box, read by the integrate phase.
    boundary: BoundaryBox,
    options: SolverOptions,

    // ---- Particle buffers ----
    /// Canonical buffer: identity is the index and never changes.
    particles: Vec<Particle>,
    /// Cell-ordered copy, rebuilt by every sort phase.
    sorted: Vec<Particle>,
    /// Canonical index of each sorted record.
    sorted_ids: Vec<u32>,

    // ---- Grid scratch ----
    grid: GridBuilder,
    /// Exclusive scan of the cell counts.
    prefix: Vec<u32>,
    scanner: ParallelPrefixSum,
    sorter: CountingSort,

    // ---- Diagnostics ----
    clamped_cells: u32,
    substeps: u64,
    frames: u64,
}

impl CpuSolver {
    /// Build a solver over `particles` and prime densities and forces.
    pub fn new(
        particles: Vec<Particle>,
        params: SphParams,
        boundary: BoundaryBox,
        options: SolverOptions,
    ) -> Result<Self> {
        let grid = validate_setup(&particles, &params, &boundary, &options)?;
        let n = particles.len();

        tracing::info!(
            particles = n,
            dims = ?grid.dims,
            cells = grid.grid_num(),
            cell_size = grid.cell_size,
            "CPU fluid solver initialised"
        );

        let mut sorter = CountingSort::new(n);
        sorter.set_deterministic(options.deterministic);

        let mut solver = Self {
            params,
            boundary,
            options,
            sorted: vec![Particle::default(); n],
            sorted_ids: vec![0; n],
            particles,
            prefix: vec![0; grid.grid_num()],
            scanner: ParallelPrefixSum::new(grid.grid_num()),
            grid: GridBuilder::new(grid, n),
            sorter,
            clamped_cells: 0,
            substeps: 0,
            frames: 0,
        };
        solver.run_phases(&PRIME_PHASES)?;
        Ok(solver)
    }

    /// Build a solver from seed positions, all particles at rest.
    pub fn from_positions(
        positions: &[[f32; 3]],
        params: SphParams,
        boundary: BoundaryBox,
        options: SolverOptions,
    ) -> Result<Self> {
        Self::new(
            crate::particle::particles_from_positions(positions),
            params,
            boundary,
            options,
        )
    }

    /// Run `phases` in order.
    pub fn run_phases(&mut self, phases: &[Phase]) -> Result<()> {
        for &phase in phases {
            let _span = tracing::trace_span!("phase", name = phase.name()).entered();
            self.run_phase(phase)?;
        }
        Ok(())
    }

    fn run_phase(&mut self, phase: Phase) -> Result<()> {
        let n = self.particles.len();
        match phase {
            Phase::GridClear => self.grid.clear(),
            Phase::GridCount => {
                self.clamped_cells = self.grid.count(&self.particles)?;
                if self.options.strict_hashing && self.clamped_cells > 0 {
                    let desc = self.grid.descriptor();
                    for p in &self.particles {
                        desc.cell_index_checked(p.position)?;
                    }
                }
            }
            Phase::PrefixSum => self.scanner.execute(self.grid.counts(), &mut self.prefix)?,
            Phase::Sort | Phase::Resort => self.sorter.execute(
                SortInputs {
                    grid: self.grid.descriptor(),
                    unsorted: &self.particles,
                    prefix: &self.prefix,
                    local_offsets: self.grid.local_offsets(),
                },
                &mut self.sorted,
                &mut self.sorted_ids,
            )?,
            Phase::Density => {
                let view = NeighborView::new(self.grid.descriptor(), &self.prefix, n);
                sph::compute_density(&mut self.particles, &self.sorted, &view, &self.params);
            }
            Phase::Force => {
                let view = NeighborView::new(self.grid.descriptor(), &self.prefix, n);
                sph::compute_force(
                    &mut self.particles,
                    &self.sorted,
                    &self.sorted_ids,
                    &view,
                    &self.params,
                );
            }
            Phase::Integrate => sph::integrate(&mut self.particles, &self.params, &self.boundary),
        }
        Ok(())
    }

    /// Cell-ordered copy from the last sort phase.
    pub fn sorted(&self) -> &[Particle] {
        &self.sorted
    }

    /// Canonical index of each sorted record.
    pub fn sorted_ids(&self) -> &[u32] {
        &self.sorted_ids
    }

    /// Exclusive scan of the cell counts from the last prefix-sum phase.
    pub fn prefix_sum(&self) -> &[u32] {
        &self.prefix
    }

    /// Grid counts and local offsets.
    pub fn grid(&self) -> &GridBuilder {
        &self.grid
    }

    /// Hashing layout.
    pub fn grid_descriptor(&self) -> &GridDescriptor {
        self.grid.descriptor()
    }

    /// Options this solver was built with.
    pub fn options(&self) -> &SolverOptions {
        &self.options
    }

    /// Frames advanced through [`FluidSolver::step_frame`].
    pub fn frames(&self) -> u64 {
        self.frames
    }
}

impl FluidSolver for CpuSolver {
    fn substep(&mut self) -> Result<()> {
        self.run_phases(&SUBSTEP_PHASES)?;
        self.substeps += 1;
        Ok(())
    }

    fn substeps_per_frame(&self) -> u32 {
        self.options.substeps_per_frame
    }

    fn step_frame(&mut self) -> Result<()> {
        for _ in 0..self.options.substeps_per_frame {
            self.substep()?;
        }
        self.frames += 1;
        if self.frames % 100 == 0 {
            tracing::debug!(frames = self.frames, substeps = self.substeps, "frame progress");
        }
        Ok(())
    }

    fn particles(&self) -> &[Particle] {
        &self.particles
    }

    fn params(&self) -> &SphParams {
        &self.params
    }

    fn boundary(&self) -> BoundaryBox {
        self.boundary
    }

    fn set_boundary(&mut self, boundary: BoundaryBox) -> Result<()> {
        boundary.validate()?;
        let grid = self.grid.descriptor();
        if !grid.covers(boundary.half_extents) {
            return Err(KernelError::BoxOutsideGrid {
                requested: boundary.half_extents,
                limit: grid.half_extents,
            });
        }
        tracing::info!(half_extents = ?boundary.half_extents, "boundary box updated");
        self.boundary = boundary;
        Ok(())
    }

    fn stats(&self) -> FrameStats {
        FrameStats::measure(&self.particles, &self.params, self.substeps, self.clamped_cells)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(n_side: usize, spacing: f32) -> Vec<[f32; 3]> {
        let offset = -0.5 * spacing * (n_side as f32 - 1.0);
        let mut out = Vec::new();
        for z in 0..n_side {
            for y in 0..n_side {
                for x in 0..n_side {
                    out.push([
                        offset + x as f32 * spacing,
                        offset + y as f32 * spacing,
                        offset + z as f32 * spacing,
                    ]);
                }
            }
        }
        out
    }

    fn solver(options: SolverOptions) -> CpuSolver {
        CpuSolver::from_positions(
            &block(5, 0.5),
            SphParams::default(),
            BoundaryBox::new([3.0; 3]),
            options,
        )
        .unwrap()
    }

    #[test]
    fn construction_primes_density_and_force() {
        let s = solver(SolverOptions::default());
        assert!(s.particles().iter().all(|p| p.density > 0.0));
        // Gravity is always part of the net acceleration.
        assert!(s.particles().iter().any(|p| p.force != [0.0; 3]));
    }

    #[test]
    fn stats_report_applied_acceleration() {
        let mut s = CpuSolver::from_positions(
            &[[0.0; 3]],
            SphParams::default(),
            BoundaryBox::new([3.0; 3]),
            SolverOptions::default(),
        )
        .unwrap();
        // Priming does not integrate.
        assert_eq!(s.stats().max_acceleration, 0.0);

        s.step_frame().unwrap();
        let g = glam::Vec3::from_array(s.params().gravity).length();
        assert!((s.stats().max_acceleration - g).abs() < 1e-4);
    }

    #[test]
    fn step_frame_runs_configured_substeps() {
        let mut s = solver(SolverOptions {
            substeps_per_frame: 3,
            ..SolverOptions::default()
        });
        s.step_frame().unwrap();
        assert_eq!(s.stats().substeps, 3);
        assert_eq!(s.frames(), 1);
    }

    #[test]
    fn set_boundary_rejects_box_larger_than_grid() {
        let mut s = solver(SolverOptions::default());
        assert!(matches!(
            s.set_boundary(BoundaryBox::new([4.0, 3.0, 3.0])),
            Err(KernelError::BoxOutsideGrid { .. })
        ));
        assert!(s.set_boundary(BoundaryBox::new([2.0, 3.0, 3.0])).is_ok());
        assert_eq!(s.boundary().half_extents, [2.0, 3.0, 3.0]);
    }

    #[test]
    fn larger_hashed_region_allows_growing_the_box() {
        let mut s = solver(SolverOptions {
            grid_half_extents: Some([5.0; 3]),
            ..SolverOptions::default()
        });
        assert!(s.set_boundary(BoundaryBox::new([5.0; 3])).is_ok());
    }

    #[test]
    fn rejects_zero_substeps() {
        let result = CpuSolver::from_positions(
            &block(2, 0.5),
            SphParams::default(),
            BoundaryBox::new([3.0; 3]),
            SolverOptions {
                substeps_per_frame: 0,
                ..SolverOptions::default()
            },
        );
        assert!(result.is_err());
    }

    #[test]
    fn strict_hashing_rejects_escaped_particles() {
        let mut positions = block(2, 0.5);
        positions.push([50.0, 0.0, 0.0]);
        let result = CpuSolver::from_positions(
            &positions,
            SphParams::default(),
            BoundaryBox::new([3.0; 3]),
            SolverOptions {
                strict_hashing: true,
                ..SolverOptions::default()
            },
        );
        assert!(matches!(result, Err(KernelError::CellOutOfRange { .. })));
    }

    #[test]
    fn options_deserialize_with_defaults() {
        let o: SolverOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(o, SolverOptions::default());
        assert_eq!(o.substeps_per_frame, 2);
    }
}

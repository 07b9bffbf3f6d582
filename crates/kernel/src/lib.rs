//! Parallel SPH fluid solver kernel
//!
//! Each substep runs a fixed pipeline of data-parallel phases over a fixed
//! set of particles:
//!
//! 1. grid clear and count ([`grid`])
//! 2. exclusive prefix sum of cell counts ([`scan`])
//! 3. counting sort into cell order ([`sort`])
//! 4. density, re-sort, force and integrate ([`sph`])
//!
//! # Modules
//! - [`particle`] -- 64-byte particle record and the position-copy utility.
//! - [`params`] -- SPH parameters and the reflecting boundary box.
//! - [`grid`] -- Grid descriptor and the atomic cell-counting phase.
//! - [`scan`] -- Blelloch-style parallel exclusive scan for any length.
//! - [`sort`] -- Counting sort with collision and gap detection.
//! - [`neighbor`] -- 27-cell neighbour enumeration over the sorted buffer.
//! - [`sph`] -- Smoothing kernels and the density / force / integrate passes.
//! - [`pipeline`] -- `CpuSolver`: the phase sequence on the rayon pool.

#![warn(missing_docs)]

pub mod error;
pub mod grid;
pub mod neighbor;
pub mod params;
pub mod particle;
pub mod pipeline;
pub mod scan;
pub mod sort;
pub mod sph;

#[cfg(feature = "gpu")]
#[allow(missing_docs)]
pub mod gpu;

pub use error::{KernelError, Result};
pub use grid::{GridBuilder, GridDescriptor};
pub use neighbor::NeighborView;
pub use params::{BoundaryBox, SphParams};
pub use particle::{copy_positions, particles_from_positions, Particle};
pub use pipeline::{CpuSolver, Phase, SolverOptions};
pub use scan::{exclusive_scan, ParallelPrefixSum};
pub use sort::{CountingSort, SortInputs};

#[cfg(feature = "gpu")]
pub use gpu::GpuSolver;

// ---------------------------------------------------------------------------
// FluidSolver trait
// ---------------------------------------------------------------------------

/// Diagnostics for the current particle state.
#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize)]
pub struct FrameStats {
    /// Number of particles (fixed for the run).
    pub particle_count: usize,
    /// Substeps executed since construction.
    pub substeps: u64,
    /// Mean density over finite particles.
    pub mean_density: f32,
    /// Largest `|rho - rho0| / rho0` over finite particles.
    pub max_density_error: f32,
    /// Largest particle speed.
    pub max_speed: f32,
    /// Largest acceleration magnitude applied by the last integrate pass.
    pub max_acceleration: f32,
    /// Total kinetic energy `sum 0.5 m |v|^2`.
    pub kinetic_energy: f64,
    /// Particles with a non-finite position, velocity or density.
    pub non_finite: usize,
    /// Particles clamped into edge cells by the last count phase.
    pub clamped_cells: u32,
}

impl FrameStats {
    /// Measure `particles` against `params`.
    pub fn measure(
        particles: &[Particle],
        params: &SphParams,
        substeps: u64,
        clamped_cells: u32,
    ) -> Self {
        let mut stats = Self {
            particle_count: particles.len(),
            substeps,
            clamped_cells,
            ..Self::default()
        };
        let mut density_sum = 0.0f64;
        let mut finite = 0usize;
        for p in particles {
            if !p.is_finite() {
                stats.non_finite += 1;
                continue;
            }
            finite += 1;
            density_sum += p.density as f64;
            let err = (p.density - params.rest_density).abs() / params.rest_density;
            stats.max_density_error = stats.max_density_error.max(err);
            let speed2 = p.vel().length_squared();
            stats.max_speed = stats.max_speed.max(speed2.sqrt());
            let accel = glam::Vec3::from_array(p.last_acceleration).length();
            if accel.is_finite() {
                stats.max_acceleration = stats.max_acceleration.max(accel);
            }
            stats.kinetic_energy += 0.5 * params.mass as f64 * speed2 as f64;
        }
        if finite > 0 {
            stats.mean_density = (density_sum / finite as f64) as f32;
        }
        stats
    }
}

/// Interface shared by the CPU and GPU solver back-ends.
///
/// A `FluidSolver` owns the canonical particle buffer and advances it one
/// substep at a time through the same phase order:
///
/// 1. Grid clear / count
/// 2. Prefix sum
/// 3. Counting sort
/// 4. Density
/// 5. Counting sort (re-propagates densities)
/// 6. Force
/// 7. Integrate
pub trait FluidSolver {
    /// Run one substep of all phases.
    fn substep(&mut self) -> Result<()>;

    /// Substeps run by [`step_frame`](Self::step_frame).
    fn substeps_per_frame(&self) -> u32;

    /// Advance one rendered frame.
    fn step_frame(&mut self) -> Result<()> {
        for _ in 0..self.substeps_per_frame() {
            self.substep()?;
        }
        Ok(())
    }

    /// Canonical particle buffer, indexed by particle identity.
    fn particles(&self) -> &[Particle];

    /// Number of particles in the simulation.
    fn particle_count(&self) -> usize {
        self.particles().len()
    }

    /// Copy positions into `out` (one entry per particle).
    fn copy_positions(&self, out: &mut [[f32; 3]]) {
        particle::copy_positions(self.particles(), out);
    }

    /// Positions as a new buffer.
    fn positions(&self) -> Vec<[f32; 3]> {
        let mut out = vec![[0.0; 3]; self.particle_count()];
        self.copy_positions(&mut out);
        out
    }

    /// SPH parameters for this run.
    fn params(&self) -> &SphParams;

    /// Current reflecting box.
    fn boundary(&self) -> BoundaryBox;

    /// Replace the reflecting box. It must fit inside the hashed region.
    fn set_boundary(&mut self, boundary: BoundaryBox) -> Result<()>;

    /// Diagnostics for the current state.
    fn stats(&self) -> FrameStats;
}

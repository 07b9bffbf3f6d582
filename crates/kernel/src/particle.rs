//! Particle records and the position-copy utility.
//!
//! A [`Particle`] is a 64-byte `repr(C)` record whose layout matches the
//! `Particle` struct in the WGSL shaders (`vec3<f32>` fields padded to 16
//! bytes by the trailing scalar), so the same bytes upload to the GPU
//! unchanged.

use glam::Vec3;
use rayon::prelude::*;

/// State of a single SPH particle.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, bytemuck::Pod, bytemuck::Zeroable)]
pub struct Particle {
    // ---- Kinematics ----
    /// World-space position.
    pub position: [f32; 3],
    /// SPH density.
    pub density: f32,
    /// Velocity.
    pub velocity: [f32; 3],
    /// Near-density used by the repulsive near-pressure term.
    pub near_density: f32,

    // ---- Accumulators ----
    /// Net acceleration written by the force pass.
    pub force: [f32; 3],
    pub(crate) _pad0: f32,
    /// Acceleration applied by the previous integrate pass. Reported as
    /// `FrameStats::max_acceleration`.
    pub last_acceleration: [f32; 3],
    pub(crate) _pad1: f32,
}

impl Particle {
    /// A particle at rest at `position`.
    pub fn at(position: [f32; 3]) -> Self {
        Self {
            position,
            ..Self::default()
        }
    }

    /// A particle at `position` moving with `velocity`.
    pub fn with_velocity(position: [f32; 3], velocity: [f32; 3]) -> Self {
        Self {
            position,
            velocity,
            ..Self::default()
        }
    }

    #[inline]
    pub(crate) fn pos(&self) -> Vec3 {
        Vec3::from_array(self.position)
    }

    #[inline]
    pub(crate) fn vel(&self) -> Vec3 {
        Vec3::from_array(self.velocity)
    }

    /// `true` if every kinematic field is finite.
    pub fn is_finite(&self) -> bool {
        self.pos().is_finite()
            && self.vel().is_finite()
            && self.density.is_finite()
            && self.near_density.is_finite()
    }
}

/// Build a particle buffer from seed positions, all at rest.
pub fn particles_from_positions(positions: &[[f32; 3]]) -> Vec<Particle> {
    positions.iter().copied().map(Particle::at).collect()
}

/// Copy every particle's position into a packed position buffer.
///
/// This is the only particle data the renderer consumes. `out` must hold
/// exactly one entry per particle; extra entries are left untouched and a
/// shorter buffer copies only its prefix.
pub fn copy_positions(particles: &[Particle], out: &mut [[f32; 3]]) {
    out.par_iter_mut()
        .zip(particles.par_iter())
        .for_each(|(dst, p)| *dst = p.position);
}

//! SPH smoothing kernels and the density, force and integrate passes.
//!
//! All kernels have compact support `h` (the kernel radius, equal to the
//! grid cell size):
//!
//! ```text
//! poly6(r)        = 315 / (64 pi h^9) * (h^2 - r^2)^3      density, viscosity, cohesion
//! spiky2'(r)      = -15 / (pi h^5)    * (h - r)            pressure gradient
//! spiky3(r)       =  15 / (pi h^6)    * (h - r)^3          near-density
//! spiky3'(r)      = -45 / (pi h^6)    * (h - r)^2          near-pressure gradient
//! ```
//!
//! Every pass runs one worker per canonical (unsorted) particle. A worker
//! owns its own output slot and reads neighbours only from the sorted
//! buffer, so no pass needs synchronisation.

use std::f32::consts::PI;

use glam::Vec3;
use rayon::prelude::*;

use crate::neighbor::NeighborView;
use crate::params::{BoundaryBox, SphParams};
use crate::particle::Particle;

/// Pairs closer than this have no defined direction and skip gradient terms.
const MIN_PAIR_DISTANCE: f32 = 1.0e-6;

/// Poly6 density kernel, from the squared distance.
#[inline]
pub fn poly6(r2: f32, params: &SphParams) -> f32 {
    if r2 >= params.radius2 {
        return 0.0;
    }
    let d = params.radius2 - r2;
    315.0 / (64.0 * PI * params.radius9) * d * d * d
}

/// Radial derivative of the spiky kernel `15 / (2 pi h^5) (h - r)^2`.
#[inline]
pub fn spiky2_derivative(r: f32, params: &SphParams) -> f32 {
    if r >= params.kernel_radius {
        return 0.0;
    }
    -15.0 / (PI * params.radius5) * (params.kernel_radius - r)
}

/// Sharper spiky kernel used for near-density.
#[inline]
pub fn spiky3(r: f32, params: &SphParams) -> f32 {
    if r >= params.kernel_radius {
        return 0.0;
    }
    let d = params.kernel_radius - r;
    15.0 / (PI * params.radius6) * d * d * d
}

/// Radial derivative of [`spiky3`].
#[inline]
pub fn spiky3_derivative(r: f32, params: &SphParams) -> f32 {
    if r >= params.kernel_radius {
        return 0.0;
    }
    let d = params.kernel_radius - r;
    -45.0 / (PI * params.radius6) * d * d
}

/// Pressure from the linear equation of state, `P = k (rho - rho0)`.
#[inline]
pub fn pressure(density: f32, params: &SphParams) -> f32 {
    params.stiffness * (density - params.rest_density)
}

/// Near-pressure `P_near = k_near * rho_near`. Never negative.
#[inline]
pub fn near_pressure(near_density: f32, params: &SphParams) -> f32 {
    (params.near_stiffness * near_density).max(0.0)
}

// ---------------------------------------------------------------------------
// Density pass
// ---------------------------------------------------------------------------

/// Accumulate density and near-density for every particle.
///
/// ```text
/// rho_i      = sum_j m * poly6(|x_i - x_j|)
/// rho_near_i = sum_j m * spiky3(|x_i - x_j|)
/// ```
///
/// The sum runs over the sorted buffer and includes the particle itself, so
/// density is always positive. Results are written into `particles` (the
/// canonical buffer), which the sorted copy does not see until the next sort.
pub fn compute_density(
    particles: &mut [Particle],
    sorted: &[Particle],
    neighbors: &NeighborView<'_>,
    params: &SphParams,
) {
    particles.par_iter_mut().for_each(|p| {
        let xi = p.pos();
        let mut density = 0.0f32;
        let mut near_density = 0.0f32;
        neighbors.for_each_candidate(p.position, |k| {
            let r2 = xi.distance_squared(sorted[k].pos());
            if r2 < params.radius2 {
                density += poly6(r2, params);
                near_density += spiky3(r2.sqrt(), params);
            }
        });
        p.density = params.mass * density;
        p.near_density = params.mass * near_density;
    });
}

// ---------------------------------------------------------------------------
// Force pass
// ---------------------------------------------------------------------------

/// Compute the net acceleration of every particle into `force`.
///
/// For each neighbour `j != i` within the kernel radius, with `r = x_i - x_j`:
///
/// ```text
/// a_pressure  = -m (P_i + P_j) / (2 rho_i rho_j)           * spiky2'(|r|) r/|r|
/// a_near      = -m (Pn_i + Pn_j) / (2 rho_i rho_j)         * spiky3'(|r|) r/|r|
/// a_viscosity =  mu m (v_j - v_i) / rho_j                   * poly6(|r|)
/// a_cohesion  =  sigma m (x_j - x_i) / rho_j                * poly6(|r|)
/// a           =  sum of the above + g
/// ```
///
/// The pressure terms are antisymmetric in `i, j`, so each pair exerts
/// equal and opposite forces. Neighbour density and near-density are read
/// from the sorted buffer, which must have been re-sorted after the
/// density pass.
pub fn compute_force(
    particles: &mut [Particle],
    sorted: &[Particle],
    sorted_ids: &[u32],
    neighbors: &NeighborView<'_>,
    params: &SphParams,
) {
    let gravity = Vec3::from_array(params.gravity);
    particles.par_iter_mut().enumerate().for_each(|(i, p)| {
        let xi = p.pos();
        let vi = p.vel();
        let rho_i = p.density;
        let p_i = pressure(rho_i, params);
        let pn_i = near_pressure(p.near_density, params);

        let mut pressure_acc = Vec3::ZERO;
        let mut viscosity_acc = Vec3::ZERO;
        let mut cohesion_acc = Vec3::ZERO;

        neighbors.for_each_candidate(p.position, |k| {
            if sorted_ids[k] as usize == i {
                return;
            }
            let nb = &sorted[k];
            let xj = nb.pos();
            let rij = xi - xj;
            let r2 = rij.length_squared();
            if r2 >= params.radius2 {
                return;
            }
            let rho_j = nb.density;
            let w = poly6(r2, params);

            viscosity_acc += (nb.vel() - vi) * (w / rho_j);
            cohesion_acc += (xj - xi) * (w / rho_j);

            let r = r2.sqrt();
            if r < MIN_PAIR_DISTANCE {
                return;
            }
            let dir = rij / r;
            let p_j = pressure(rho_j, params);
            let pn_j = near_pressure(nb.near_density, params);
            let denom = 2.0 * rho_i * rho_j;
            let scalar = (p_i + p_j) / denom * spiky2_derivative(r, params)
                + (pn_i + pn_j) / denom * spiky3_derivative(r, params);
            pressure_acc -= dir * scalar;
        });

        let acc = params.mass
            * (pressure_acc
                + params.viscosity * viscosity_acc
                + params.surface_tension * cohesion_acc)
            + gravity;
        p.force = acc.to_array();
    });
}

// ---------------------------------------------------------------------------
// Integrate pass
// ---------------------------------------------------------------------------

/// Semi-implicit Euler step with box reflection.
///
/// ```text
/// v += a dt
/// x += v dt
/// ```
///
/// On each axis a position beyond the box half-extent is clamped onto the
/// wall and that velocity component is reflected and scaled by
/// `wall_damping`.
pub fn integrate(particles: &mut [Particle], params: &SphParams, boundary: &BoundaryBox) {
    let dt = params.dt;
    particles.par_iter_mut().for_each(|p| {
        let a = Vec3::from_array(p.force);
        let v = p.vel() + a * dt;
        let x = p.pos() + v * dt;
        let mut position = x.to_array();
        let mut velocity = v.to_array();
        for axis in 0..3 {
            let limit = boundary.half_extents[axis];
            if position[axis] > limit {
                position[axis] = limit;
                velocity[axis] = -velocity[axis] * params.wall_damping;
            } else if position[axis] < -limit {
                position[axis] = -limit;
                velocity[axis] = -velocity[axis] * params.wall_damping;
            }
        }
        p.position = position;
        p.velocity = velocity;
        p.last_acceleration = p.force;
    });
}

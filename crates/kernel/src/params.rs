//! Solver parameters and the reflecting boundary box.
//!
//! [`SphParams`] is immutable for a run and carries the kernel radius powers
//! the smoothing polynomials need. [`BoundaryBox`] may change between frames.

use serde::{Deserialize, Serialize};

use crate::error::{KernelError, Result};

/// SPH material and integration parameters.
///
/// The kernel radius powers (`radius2`, `radius5`, `radius6`, `radius9`) are
/// derived from `kernel_radius` by [`SphParams::new`] and
/// [`SphParams::with_kernel_radius`]; they are never set independently.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "SphParamsConfig", into = "SphParamsConfig")]
pub struct SphParams {
    /// Mass of every particle.
    pub mass: f32,
    /// Smoothing kernel support radius `h`. Also the grid cell size.
    pub kernel_radius: f32,
    /// `h^2`
    pub radius2: f32,
    /// `h^5`
    pub radius5: f32,
    /// `h^6`
    pub radius6: f32,
    /// `h^9`
    pub radius9: f32,
    /// Substep duration (seconds).
    pub dt: f32,
    /// Pressure stiffness `k` in `P = k (rho - rho0)`.
    pub stiffness: f32,
    /// Near-pressure stiffness `k_near` in `P_near = k_near * rho_near`.
    pub near_stiffness: f32,
    /// Rest density `rho0`.
    pub rest_density: f32,
    /// Viscosity coefficient (1/s).
    pub viscosity: f32,
    /// Surface-tension (cohesion) coefficient (1/s^2).
    pub surface_tension: f32,
    /// Constant gravitational acceleration.
    pub gravity: [f32; 3],
    /// Fraction of the normal velocity kept after a wall reflection.
    pub wall_damping: f32,
}

impl SphParams {
    /// Build parameters from a kernel radius and a rest particle spacing.
    ///
    /// Mass is chosen so a cubic lattice at `spacing` sits at `rest_density`.
    pub fn new(kernel_radius: f32, spacing: f32, rest_density: f32) -> Self {
        let mass = rest_density * spacing * spacing * spacing;
        Self {
            mass,
            ..Self::default()
        }
        .with_kernel_radius(kernel_radius)
        .with_rest_density(rest_density)
    }

    /// Replace the kernel radius and recompute its powers.
    pub fn with_kernel_radius(mut self, kernel_radius: f32) -> Self {
        let h = kernel_radius;
        let h2 = h * h;
        self.kernel_radius = h;
        self.radius2 = h2;
        self.radius5 = h2 * h2 * h;
        self.radius6 = h2 * h2 * h2;
        self.radius9 = self.radius6 * h2 * h;
        self
    }

    fn with_rest_density(mut self, rest_density: f32) -> Self {
        self.rest_density = rest_density;
        self
    }

    /// Check every field for a usable value.
    pub fn validate(&self) -> Result<()> {
        positive("kernel_radius", self.kernel_radius)?;
        positive("mass", self.mass)?;
        positive("dt", self.dt)?;
        positive("rest_density", self.rest_density)?;
        non_negative("stiffness", self.stiffness)?;
        non_negative("near_stiffness", self.near_stiffness)?;
        non_negative("viscosity", self.viscosity)?;
        non_negative("surface_tension", self.surface_tension)?;
        if !(0.0..=1.0).contains(&self.wall_damping) {
            return Err(KernelError::invalid(
                "wall_damping",
                format!("{} is outside [0, 1]", self.wall_damping),
            ));
        }
        if self.gravity.iter().any(|g| !g.is_finite()) {
            return Err(KernelError::invalid("gravity", "must be finite"));
        }
        let expected = Self::default().with_kernel_radius(self.kernel_radius);
        let close = |a: f32, b: f32| (a - b).abs() <= 1.0e-4 * b.abs().max(f32::MIN_POSITIVE);
        if !(close(self.radius2, expected.radius2)
            && close(self.radius5, expected.radius5)
            && close(self.radius6, expected.radius6)
            && close(self.radius9, expected.radius9))
        {
            return Err(KernelError::invalid(
                "kernel_radius",
                "radius powers are inconsistent with kernel_radius",
            ));
        }
        Ok(())
    }
}

impl Default for SphParams {
    fn default() -> Self {
        let spacing = 0.5_f32;
        let rest_density = 1000.0;
        Self {
            mass: rest_density * spacing * spacing * spacing,
            kernel_radius: 0.0,
            radius2: 0.0,
            radius5: 0.0,
            radius6: 0.0,
            radius9: 0.0,
            dt: 0.004,
            stiffness: 2000.0,
            near_stiffness: 2.0,
            rest_density,
            viscosity: 1.0,
            surface_tension: 2.0,
            gravity: [0.0, -9.8, 0.0],
            wall_damping: 0.5,
        }
        .with_kernel_radius(1.0)
    }
}

fn positive(name: &'static str, value: f32) -> Result<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(KernelError::invalid(name, format!("{value} must be positive")))
    }
}

fn non_negative(name: &'static str, value: f32) -> Result<()> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(KernelError::invalid(name, format!("{value} must be non-negative")))
    }
}

/// Serialized form of [`SphParams`]: radius powers are derived, not stored.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct SphParamsConfig {
    #[serde(default = "default_mass")]
    mass: f32,
    #[serde(default = "default_kernel_radius")]
    kernel_radius: f32,
    #[serde(default = "default_dt")]
    dt: f32,
    #[serde(default = "default_stiffness")]
    stiffness: f32,
    #[serde(default = "default_near_stiffness")]
    near_stiffness: f32,
    #[serde(default = "default_rest_density")]
    rest_density: f32,
    #[serde(default = "default_viscosity")]
    viscosity: f32,
    #[serde(default = "default_surface_tension")]
    surface_tension: f32,
    #[serde(default = "default_gravity")]
    gravity: [f32; 3],
    #[serde(default = "default_wall_damping")]
    wall_damping: f32,
}

fn default_mass() -> f32 {
    SphParams::default().mass
}

fn default_kernel_radius() -> f32 {
    SphParams::default().kernel_radius
}

fn default_dt() -> f32 {
    SphParams::default().dt
}

fn default_stiffness() -> f32 {
    SphParams::default().stiffness
}

fn default_near_stiffness() -> f32 {
    SphParams::default().near_stiffness
}

fn default_rest_density() -> f32 {
    SphParams::default().rest_density
}

fn default_viscosity() -> f32 {
    SphParams::default().viscosity
}

fn default_surface_tension() -> f32 {
    SphParams::default().surface_tension
}

fn default_gravity() -> [f32; 3] {
    SphParams::default().gravity
}

fn default_wall_damping() -> f32 {
    SphParams::default().wall_damping
}

impl From<SphParamsConfig> for SphParams {
    fn from(c: SphParamsConfig) -> Self {
        Self {
            mass: c.mass,
            dt: c.dt,
            stiffness: c.stiffness,
            near_stiffness: c.near_stiffness,
            rest_density: c.rest_density,
            viscosity: c.viscosity,
            surface_tension: c.surface_tension,
            gravity: c.gravity,
            wall_damping: c.wall_damping,
            ..Self::default()
        }
        .with_kernel_radius(c.kernel_radius)
    }
}

impl From<SphParams> for SphParamsConfig {
    fn from(p: SphParams) -> Self {
        Self {
            mass: p.mass,
            kernel_radius: p.kernel_radius,
            dt: p.dt,
            stiffness: p.stiffness,
            near_stiffness: p.near_stiffness,
            rest_density: p.rest_density,
            viscosity: p.viscosity,
            surface_tension: p.surface_tension,
            gravity: p.gravity,
            wall_damping: p.wall_damping,
        }
    }
}

/// Axis-aligned reflecting box centred on the origin.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundaryBox {
    /// Half-extent on each axis; particles stay in `[-h, h]`.
    pub half_extents: [f32; 3],
}

impl BoundaryBox {
    /// Create a box with the given half-extents.
    pub fn new(half_extents: [f32; 3]) -> Self {
        Self { half_extents }
    }

    /// Reject non-positive or non-finite extents.
    pub fn validate(&self) -> Result<()> {
        for &e in &self.half_extents {
            if !(e.is_finite() && e > 0.0) {
                return Err(KernelError::invalid(
                    "half_extents",
                    format!("{:?} must be positive on every axis", self.half_extents),
                ));
            }
        }
        Ok(())
    }

    /// `true` if `p` lies inside the closed box.
    pub fn contains(&self, p: [f32; 3]) -> bool {
        (0..3).all(|a| p[a] >= -self.half_extents[a] && p[a] <= self.half_extents[a])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn radius_powers_follow_kernel_radius() {
        let p = SphParams::default().with_kernel_radius(2.0);
        assert_eq!(p.radius2, 4.0);
        assert_eq!(p.radius5, 32.0);
        assert_eq!(p.radius6, 64.0);
        assert_eq!(p.radius9, 512.0);
    }

    #[test]
    fn lattice_mass_matches_rest_density() {
        let p = SphParams::new(1.0, 0.25, 1000.0);
        assert!((p.mass - 1000.0 * 0.25f32.powi(3)).abs() < 1e-4);
        assert_eq!(p.rest_density, 1000.0);
        assert!(p.validate().is_ok());
    }

    #[test]
    fn default_params_validate() {
        assert!(SphParams::default().validate().is_ok());
    }

    #[test]
    fn rejects_bad_values() {
        let mut p = SphParams::default();
        p.dt = 0.0;
        assert!(matches!(
            p.validate(),
            Err(KernelError::InvalidParams { name: "dt", .. })
        ));

        let mut p = SphParams::default();
        p.wall_damping = 1.5;
        assert!(p.validate().is_err());

        let mut p = SphParams::default();
        p.radius9 = 3.0;
        assert!(p.validate().is_err());
    }

    #[test]
    fn json_defaults_fill_missing_fields() {
        let p: SphParams = serde_json::from_str(r#"{ "kernel_radius": 2.0 }"#).unwrap();
        assert_eq!(p.kernel_radius, 2.0);
        assert_eq!(p.radius9, 512.0);
        assert_eq!(p.dt, SphParams::default().dt);

        let json = serde_json::to_string(&p).unwrap();
        assert!(!json.contains("radius9"));
    }

    #[test]
    fn box_contains_and_validates() {
        let b = BoundaryBox::new([1.0, 2.0, 3.0]);
        assert!(b.validate().is_ok());
        assert!(b.contains([1.0, -2.0, 0.0]));
        assert!(!b.contains([1.01, 0.0, 0.0]));
        assert!(BoundaryBox::new([1.0, 0.0, 1.0]).validate().is_err());
    }
}

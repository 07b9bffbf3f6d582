//! Scene configuration parsing and validation

use std::fs;
use std::path::Path;

use fluid_kernel::{BoundaryBox, KernelError, SolverOptions, SphParams};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading or validating a scene.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path that was read.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid JSON for [`SceneConfig`].
    #[error("failed to parse config JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// A scene-level value is out of range.
    #[error("invalid scene: {0}")]
    Invalid(String),

    /// Solver parameters, options or the box were rejected by the kernel.
    #[error(transparent)]
    Kernel(#[from] KernelError),
}

/// Which solver back-end to build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendType {
    /// Rayon CPU solver.
    Cpu,
    /// wgpu compute solver (requires the `gpu` feature).
    Gpu,
    /// GPU when available, otherwise CPU.
    #[default]
    Auto,
}

/// Initial particle layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SeedConfig {
    /// Block of fluid in the low x / low y corner of the box.
    DamBreak {
        /// Fraction of the box filled along each axis.
        #[serde(default = "default_fill")]
        fill: [f32; 3],
    },
    /// Uniformly random particles in a cube.
    RandomCube {
        /// Number of particles.
        count: usize,
        /// Half-extent of the cube.
        half_extent: f32,
        /// Cube centre.
        #[serde(default)]
        center: [f32; 3],
        /// RNG seed.
        #[serde(default)]
        seed: u64,
    },
    /// Regular lattice at the particle spacing.
    Lattice {
        /// Particles per axis.
        counts: [usize; 3],
        /// Lattice centre.
        #[serde(default)]
        center: [f32; 3],
    },
}

impl Default for SeedConfig {
    fn default() -> Self {
        Self::DamBreak {
            fill: default_fill(),
        }
    }
}

/// Complete description of one simulation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneConfig {
    /// Human-readable scene name
    #[serde(default = "default_name")]
    pub name: String,
    /// Solver back-end
    #[serde(default)]
    pub backend: BackendType,
    /// Initial particle layout
    #[serde(default)]
    pub seed: SeedConfig,
    /// Rest spacing between seeded particles
    #[serde(default = "default_spacing")]
    pub particle_spacing: f32,
    /// Reflecting box half-extents
    #[serde(default = "default_box")]
    pub box_half_extents: [f32; 3],
    /// SPH parameters
    #[serde(default)]
    pub params: SphParams,
    /// Derive particle mass from `rest_density * spacing^3`, overriding
    /// `params.mass`
    #[serde(default = "default_true")]
    pub derive_mass: bool,
    /// Solver options (substeps, determinism, hashing)
    #[serde(default)]
    pub solver: SolverOptions,
    /// Stop after this many frames
    #[serde(default = "default_max_frames")]
    pub max_frames: Option<u64>,
}

// Default values
fn default_name() -> String {
    "dam_break".to_string()
}

fn default_fill() -> [f32; 3] {
    [0.4, 0.8, 1.0]
}

fn default_spacing() -> f32 {
    0.5
}

fn default_box() -> [f32; 3] {
    [3.0, 3.0, 3.0]
}

fn default_true() -> bool {
    true
}

fn default_max_frames() -> Option<u64> {
    Some(240)
}

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            backend: BackendType::default(),
            seed: SeedConfig::default(),
            particle_spacing: default_spacing(),
            box_half_extents: default_box(),
            params: SphParams::default(),
            derive_mass: true,
            solver: SolverOptions::default(),
            max_frames: default_max_frames(),
        }
    }
}

impl SceneConfig {
    /// Load configuration from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&contents)
    }

    /// Parse and validate configuration from a JSON string
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: SceneConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.particle_spacing.is_finite() && self.particle_spacing > 0.0) {
            return Err(ConfigError::Invalid(
                "particle_spacing must be positive".to_string(),
            ));
        }
        if self.max_frames == Some(0) {
            return Err(ConfigError::Invalid(
                "max_frames must be at least 1".to_string(),
            ));
        }

        self.boundary().validate()?;
        self.sph_params().validate()?;
        self.solver.validate()?;

        match &self.seed {
            SeedConfig::DamBreak { fill } => {
                if fill.iter().any(|f| !(*f > 0.0 && *f <= 1.0)) {
                    return Err(ConfigError::Invalid(format!(
                        "dam_break fill {fill:?} must be in (0, 1] on every axis"
                    )));
                }
            }
            SeedConfig::RandomCube {
                half_extent,
                center,
                ..
            } => {
                if !(half_extent.is_finite() && *half_extent > 0.0) {
                    return Err(ConfigError::Invalid(
                        "random_cube half_extent must be positive".to_string(),
                    ));
                }
                for axis in 0..3 {
                    if (center[axis].abs() + half_extent) > self.box_half_extents[axis] {
                        return Err(ConfigError::Invalid(format!(
                            "random_cube extends outside the box on axis {axis}"
                        )));
                    }
                }
            }
            SeedConfig::Lattice { counts, center } => {
                for axis in 0..3 {
                    let half_span =
                        0.5 * self.particle_spacing * counts[axis].saturating_sub(1) as f32;
                    if center[axis].abs() + half_span > self.box_half_extents[axis] {
                        return Err(ConfigError::Invalid(format!(
                            "lattice extends outside the box on axis {axis}"
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// SPH parameters with the mass derived from the spacing when requested
    pub fn sph_params(&self) -> SphParams {
        let mut params = self.params;
        if self.derive_mass {
            let s = self.particle_spacing;
            params.mass = params.rest_density * s * s * s;
        }
        params
    }

    /// Initial reflecting box
    pub fn boundary(&self) -> BoundaryBox {
        BoundaryBox::new(self.box_half_extents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_json_uses_defaults() {
        let config = SceneConfig::from_json("{}").unwrap();
        assert_eq!(config, SceneConfig::default());
        assert_eq!(config.backend, BackendType::Auto);
        assert_eq!(config.max_frames, Some(240));
    }

    #[test]
    fn test_mass_follows_spacing() {
        let config = SceneConfig {
            particle_spacing: 0.25,
            ..SceneConfig::default()
        };
        let p = config.sph_params();
        assert!((p.mass - p.rest_density * 0.25f32.powi(3)).abs() < 1e-4);

        let fixed = SceneConfig {
            derive_mass: false,
            ..config
        };
        assert_eq!(fixed.sph_params().mass, SphParams::default().mass);
    }

    #[test]
    fn test_seed_variants_parse() {
        let config = SceneConfig::from_json(
            r#"{
                "name": "cube",
                "backend": "cpu",
                "seed": { "kind": "random_cube", "count": 100, "half_extent": 1.0, "seed": 3 },
                "params": { "kernel_radius": 1.2, "stiffness": 500.0 },
                "solver": { "substeps_per_frame": 4 }
            }"#,
        )
        .unwrap();
        assert_eq!(config.backend, BackendType::Cpu);
        assert_eq!(config.solver.substeps_per_frame, 4);
        assert_eq!(config.params.stiffness, 500.0);
        assert!((config.params.radius2 - 1.44).abs() < 1e-5);
        assert!(matches!(
            config.seed,
            SeedConfig::RandomCube { count: 100, seed: 3, .. }
        ));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let bad_spacing = SceneConfig {
            particle_spacing: -1.0,
            ..SceneConfig::default()
        };
        assert!(matches!(bad_spacing.validate(), Err(ConfigError::Invalid(_))));

        let bad_box = SceneConfig {
            box_half_extents: [1.0, 0.0, 1.0],
            ..SceneConfig::default()
        };
        assert!(matches!(bad_box.validate(), Err(ConfigError::Kernel(_))));

        let bad_cube = SceneConfig {
            seed: SeedConfig::RandomCube {
                count: 10,
                half_extent: 2.5,
                center: [1.0, 0.0, 0.0],
                seed: 0,
            },
            ..SceneConfig::default()
        };
        assert!(bad_cube.validate().is_err());

        let zero_frames = SceneConfig {
            max_frames: Some(0),
            ..SceneConfig::default()
        };
        assert!(zero_frames.validate().is_err());
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = SceneConfig::load("/nonexistent/scene.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}

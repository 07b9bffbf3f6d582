//! Orchestration Layer
//!
//! This crate wires the fluid kernel into runnable simulations:
//! - JSON scene configuration and validation
//! - Seeding routines (dam-break, random cube, lattice)
//! - Back-end selection (CPU, GPU, auto)
//! - Simulation runner with lifecycle management

#![warn(missing_docs)]

pub mod config;
pub mod runner;
pub mod scene;

pub use config::{BackendType, ConfigError, SceneConfig, SeedConfig};
pub use runner::{RunnerState, SimulationRunner};

use std::path::Path;

use fluid_kernel::{BoundaryBox, CpuSolver, FluidSolver, KernelError, SolverOptions, SphParams};

/// Create a runner from a configuration file
///
/// This function performs the full simulation setup pipeline:
/// 1. Load and validate the configuration
/// 2. Seed the initial particle positions
/// 3. Create the solver for the configured back-end
/// 4. Wrap it in a SimulationRunner for lifecycle management
///
/// # Example
/// ```no_run
/// use fluid_orchestrator::create_simulation;
///
/// let runner = create_simulation("scenes/dam_break.json")?;
/// runner.start();
/// // ... query status, pause, resume, etc.
/// # Ok::<(), fluid_orchestrator::ConfigError>(())
/// ```
pub fn create_simulation(config_path: impl AsRef<Path>) -> Result<SimulationRunner, ConfigError> {
    let config_path = config_path.as_ref();
    tracing::info!("Creating simulation from config: {}", config_path.display());

    let config = SceneConfig::load(config_path)?;
    tracing::info!("Configuration loaded: {}", config.name);

    let solver = build_solver(&config)?;
    tracing::info!("Simulation ready to start");
    Ok(SimulationRunner::new(solver, config.max_frames))
}

/// Seed a validated scene and build its solver.
pub fn build_solver(config: &SceneConfig) -> Result<Box<dyn FluidSolver + Send>, ConfigError> {
    let positions = scene::seed_positions(config);
    let solver = create_solver(
        config.backend,
        &positions,
        config.sph_params(),
        config.boundary(),
        config.solver,
    )?;
    Ok(solver)
}

/// Create a solver for the requested back-end.
///
/// For `Auto`, attempts GPU first and falls back to CPU if unavailable.
/// For `Gpu`, returns [`KernelError::GpuInit`] if the device cannot be
/// created or the `gpu` feature is disabled.
/// For `Cpu`, always returns a CPU solver.
pub fn create_solver(
    backend: BackendType,
    positions: &[[f32; 3]],
    params: SphParams,
    boundary: BoundaryBox,
    options: SolverOptions,
) -> Result<Box<dyn FluidSolver + Send>, KernelError> {
    match backend {
        BackendType::Cpu => {
            tracing::info!("Creating CPU fluid solver...");
            Ok(Box::new(CpuSolver::from_positions(
                positions, params, boundary, options,
            )?))
        }
        #[cfg(feature = "gpu")]
        BackendType::Gpu => {
            tracing::info!("Creating GPU fluid solver...");
            Ok(Box::new(fluid_kernel::GpuSolver::from_positions(
                positions, params, boundary, options,
            )?))
        }
        #[cfg(not(feature = "gpu"))]
        BackendType::Gpu => Err(KernelError::GpuInit(
            "GPU backend requested but the 'gpu' feature is not enabled".to_string(),
        )),
        #[cfg(feature = "gpu")]
        BackendType::Auto => {
            tracing::info!("Auto-detecting backend...");
            if fluid_kernel::gpu::gpu_available() {
                match fluid_kernel::GpuSolver::from_positions(positions, params, boundary, options)
                {
                    Ok(gpu) => return Ok(Box::new(gpu)),
                    Err(KernelError::GpuInit(e)) => {
                        tracing::warn!("GPU init failed ({e}), falling back to CPU");
                    }
                    Err(e) => return Err(e),
                }
            } else {
                tracing::info!("No GPU available, using CPU solver");
            }
            Ok(Box::new(CpuSolver::from_positions(
                positions, params, boundary, options,
            )?))
        }
        #[cfg(not(feature = "gpu"))]
        BackendType::Auto => {
            tracing::info!("GPU feature not enabled, using CPU solver");
            Ok(Box::new(CpuSolver::from_positions(
                positions, params, boundary, options,
            )?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_backend_builds() {
        let config = SceneConfig {
            backend: BackendType::Cpu,
            ..SceneConfig::default()
        };
        let solver = build_solver(&config).unwrap();
        assert_eq!(
            solver.particle_count(),
            scene::seed_positions(&config).len()
        );
    }

    #[cfg(not(feature = "gpu"))]
    #[test]
    fn test_gpu_backend_requires_feature() {
        let result = create_solver(
            BackendType::Gpu,
            &[[0.0; 3]],
            SphParams::default(),
            BoundaryBox::new([1.0; 3]),
            SolverOptions::default(),
        );
        assert!(matches!(result, Err(KernelError::GpuInit(_))));
    }

    #[test]
    fn test_auto_backend_always_yields_a_solver() {
        let solver = create_solver(
            BackendType::Auto,
            &[[0.0; 3], [0.25, 0.0, 0.0]],
            SphParams::default(),
            BoundaryBox::new([1.0; 3]),
            SolverOptions::default(),
        )
        .unwrap();
        assert_eq!(solver.particle_count(), 2);
    }
}

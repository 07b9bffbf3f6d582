//! Headless fluid runner
//!
//! Usage: `fluid-headless [scene.json]`
//!
//! Runs the scene for its configured frame count, logging statistics as it
//! goes, and prints the final statistics as JSON.

use std::process::ExitCode;
use std::time::Instant;

use fluid_orchestrator::{build_solver, SceneConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Frames between info-level progress lines.
const LOG_EVERY: u64 = 10;

fn main() -> ExitCode {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fluid_orchestrator=info,fluid_kernel=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = match std::env::args().nth(1) {
        Some(path) => SceneConfig::load(&path)?,
        None => {
            tracing::info!("No scene given, running the default dam break");
            let config = SceneConfig::default();
            config.validate()?;
            config
        }
    };

    let mut solver = build_solver(&config)?;
    let frames = config.max_frames.unwrap_or(240);
    tracing::info!(
        scene = %config.name,
        particles = solver.particle_count(),
        frames,
        "Starting headless run"
    );

    let start = Instant::now();
    for frame in 1..=frames {
        solver.step_frame()?;
        let stats = solver.stats();
        tracing::debug!(frame, ?stats, "frame complete");
        if frame % LOG_EVERY == 0 || frame == frames {
            tracing::info!(
                frame,
                mean_density = stats.mean_density,
                max_density_error = stats.max_density_error,
                max_speed = stats.max_speed,
                kinetic_energy = stats.kinetic_energy,
                clamped = stats.clamped_cells,
                "progress"
            );
        }
        if stats.non_finite > 0 {
            return Err(format!(
                "{} particles became non-finite at frame {frame}",
                stats.non_finite
            )
            .into());
        }
    }

    let elapsed = start.elapsed().as_secs_f64();
    tracing::info!(
        "Finished {} frames in {:.2}s ({:.1} frames/s)",
        frames,
        elapsed,
        frames as f64 / elapsed
    );
    println!("{}", serde_json::to_string_pretty(&solver.stats())?);
    Ok(())
}

//! Initial particle layouts.
//!
//! Every routine returns positions only; particles start at rest.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::{SceneConfig, SeedConfig};

/// Block of fluid filling `fill` of the box, packed into the corner at
/// `-box_half` on x and y and centred on z.
pub fn dam_break(box_half: [f32; 3], fill: [f32; 3], spacing: f32) -> Vec<[f32; 3]> {
    let mut counts = [0usize; 3];
    for axis in 0..3 {
        let extent = 2.0 * box_half[axis] * fill[axis];
        counts[axis] = ((extent / spacing).floor() as usize).max(1);
    }
    let start = [
        -box_half[0] + 0.5 * spacing,
        -box_half[1] + 0.5 * spacing,
        -0.5 * spacing * (counts[2] as f32 - 1.0),
    ];
    grid_points(start, counts, spacing)
}

/// `count` uniformly random points in the cube `center +- half_extent`.
pub fn random_cube(count: usize, half_extent: f32, center: [f32; 3], seed: u64) -> Vec<[f32; 3]> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|_| {
            [
                center[0] + rng.gen_range(-half_extent..=half_extent),
                center[1] + rng.gen_range(-half_extent..=half_extent),
                center[2] + rng.gen_range(-half_extent..=half_extent),
            ]
        })
        .collect()
}

/// Regular lattice of `counts` points at `spacing`, centred on `center`.
pub fn lattice(counts: [usize; 3], spacing: f32, center: [f32; 3]) -> Vec<[f32; 3]> {
    let start = [
        center[0] - 0.5 * spacing * (counts[0] as f32 - 1.0),
        center[1] - 0.5 * spacing * (counts[1] as f32 - 1.0),
        center[2] - 0.5 * spacing * (counts[2] as f32 - 1.0),
    ];
    grid_points(start, counts, spacing)
}

/// Seed positions for a scene.
pub fn seed_positions(config: &SceneConfig) -> Vec<[f32; 3]> {
    let positions = match &config.seed {
        SeedConfig::DamBreak { fill } => {
            dam_break(config.box_half_extents, *fill, config.particle_spacing)
        }
        SeedConfig::RandomCube {
            count,
            half_extent,
            center,
            seed,
        } => random_cube(*count, *half_extent, *center, *seed),
        SeedConfig::Lattice { counts, center } => {
            lattice(*counts, config.particle_spacing, *center)
        }
    };
    tracing::info!(scene = %config.name, particles = positions.len(), "seeded particles");
    positions
}

fn grid_points(start: [f32; 3], counts: [usize; 3], spacing: f32) -> Vec<[f32; 3]> {
    let mut out = Vec::with_capacity(counts[0] * counts[1] * counts[2]);
    for iz in 0..counts[2] {
        for iy in 0..counts[1] {
            for ix in 0..counts[0] {
                out.push([
                    start[0] + ix as f32 * spacing,
                    start[1] + iy as f32 * spacing,
                    start[2] + iz as f32 * spacing,
                ]);
            }
        }
    }
    out
}

//! End-to-end checks of the CPU pipeline: density, conservation and
//! boundary containment.

use fluid_kernel::pipeline::{PRIME_PHASES, SUBSTEP_PHASES};
use fluid_kernel::{BoundaryBox, CpuSolver, FluidSolver, Phase, SolverOptions, SphParams};

/// Cubic lattice of `n_side^3` points centred on the origin.
fn lattice(n_side: usize, spacing: f32) -> Vec<[f32; 3]> {
    let offset = -0.5 * spacing * (n_side as f32 - 1.0);
    let mut out = Vec::with_capacity(n_side * n_side * n_side);
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

fn assert_permutation(ids: &[u32]) {
    let mut seen = vec![false; ids.len()];
    for &id in ids {
        assert!(!seen[id as usize], "particle {id} sorted twice");
        seen[id as usize] = true;
    }
}

#[test]
fn lattice_interior_sits_at_rest_density() {
    let h = 1.0;
    let spacing = h / 3.0;
    let params = SphParams::new(h, spacing, 1000.0);
    let positions = lattice(9, spacing);
    let solver = CpuSolver::from_positions(
        &positions,
        params,
        BoundaryBox::new([2.0; 3]),
        SolverOptions::default(),
    )
    .unwrap();

    // Centre of a 9^3 lattice: index 4 on every axis.
    let centre = 4 + 4 * 9 + 4 * 81;
    assert_eq!(positions[centre], [0.0, 0.0, 0.0]);
    let rho = solver.particles()[centre].density;
    let err = (rho - params.rest_density).abs() / params.rest_density;
    assert!(err < 0.02, "centre density {rho} is {:.2}% off", err * 100.0);
}

#[test]
fn every_phase_preserves_particles_and_mass() {
    let params = SphParams::default();
    let positions = lattice(6, 0.5);
    let n = positions.len();
    let mut solver = CpuSolver::from_positions(
        &positions,
        params,
        BoundaryBox::new([3.0; 3]),
        SolverOptions::default(),
    )
    .unwrap();

    for _ in 0..3 {
        for &phase in SUBSTEP_PHASES.iter() {
            solver.run_phases(&[phase]).unwrap();
            assert_eq!(solver.particle_count(), n, "count changed in {}", phase.name());
            let mass = solver.particle_count() as f32 * solver.params().mass;
            assert_eq!(mass, n as f32 * params.mass);
            if matches!(phase, Phase::Sort | Phase::Resort) {
                assert_permutation(solver.sorted_ids());
                for (slot, &id) in solver.sorted_ids().iter().enumerate() {
                    assert_eq!(solver.sorted()[slot], solver.particles()[id as usize]);
                }
            }
        }
    }
}

#[test]
fn prefix_sum_ends_at_particle_count() {
    let positions = lattice(5, 0.5);
    let mut solver = CpuSolver::from_positions(
        &positions,
        SphParams::default(),
        BoundaryBox::new([3.0; 3]),
        SolverOptions::default(),
    )
    .unwrap();
    solver.run_phases(&PRIME_PHASES).unwrap();
    let prefix = solver.prefix_sum();
    let grid = solver.grid();
    let last = prefix.len() - 1;
    assert_eq!(
        prefix[last] + grid.cell_count(last),
        positions.len() as u32
    );
    assert!(prefix.windows(2).all(|w| w[0] <= w[1]));
}

#[test]
fn particles_stay_inside_the_box() {
    let half = [1.5, 2.0, 1.5];
    // Block resting in the lower corner, falling onto the floor.
    let positions: Vec<[f32; 3]> = lattice(5, 0.5)
        .into_iter()
        .map(|[x, y, z]| [x - 0.3, y - 0.8, z - 0.3])
        .collect();
    let mut solver = CpuSolver::from_positions(
        &positions,
        SphParams::default(),
        BoundaryBox::new(half),
        SolverOptions::default(),
    )
    .unwrap();

    for _ in 0..50 {
        solver.step_frame().unwrap();
        for p in solver.particles() {
            assert!(p.is_finite());
            for axis in 0..3 {
                assert!(
                    p.position[axis].abs() <= half[axis],
                    "particle at {:?} escaped the box",
                    p.position
                );
            }
        }
    }
    let stats = solver.stats();
    assert_eq!(stats.non_finite, 0);
    assert_eq!(stats.substeps, 100);
}

#[test]
fn pair_forces_are_equal_and_opposite() {
    let params = SphParams {
        gravity: [0.0; 3],
        ..SphParams::default()
    };
    let solver = CpuSolver::from_positions(
        &[[-0.2, 0.0, 0.0], [0.2, 0.0, 0.0]],
        params,
        BoundaryBox::new([2.0; 3]),
        SolverOptions::default(),
    )
    .unwrap();
    let p = solver.particles();
    assert_eq!(p[0].density, p[1].density);
    for axis in 0..3 {
        assert!(
            (p[0].force[axis] + p[1].force[axis]).abs() < 1e-4,
            "forces {:?} and {:?} do not cancel",
            p[0].force,
            p[1].force
        );
    }
    // The pair is compressed well below rest density, so cohesion and
    // negative pressure pull the particles together.
    assert!(p[0].force[0] > 0.0);
}

#[test]
fn deterministic_runs_repeat_exactly() {
    let positions = lattice(5, 0.45);
    let options = SolverOptions {
        deterministic: true,
        ..SolverOptions::default()
    };
    let run = || {
        let mut s = CpuSolver::from_positions(
            &positions,
            SphParams::default(),
            BoundaryBox::new([3.0; 3]),
            options,
        )
        .unwrap();
        for _ in 0..5 {
            s.step_frame().unwrap();
        }
        s.positions()
    };
    assert_eq!(run(), run());
}

#[test]
fn copy_positions_matches_particles() {
    let positions = lattice(3, 0.5);
    let solver = CpuSolver::from_positions(
        &positions,
        SphParams::default(),
        BoundaryBox::new([2.0; 3]),
        SolverOptions::default(),
    )
    .unwrap();
    assert_eq!(solver.positions(), positions);
}

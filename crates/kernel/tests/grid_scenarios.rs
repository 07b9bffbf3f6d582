//! Grid counting and sorting on hand-built particle layouts.

use std::collections::HashSet;

use fluid_kernel::{
    CountingSort, GridBuilder, GridDescriptor, Particle, ParallelPrefixSum, SortInputs,
};

fn cube_corners(origin: [f32; 3], side: f32) -> Vec<Particle> {
    let mut out = Vec::new();
    for z in 0..2 {
        for y in 0..2 {
            for x in 0..2 {
                out.push(Particle::at([
                    origin[0] + x as f32 * side,
                    origin[1] + y as f32 * side,
                    origin[2] + z as f32 * side,
                ]));
            }
        }
    }
    out
}

#[test]
fn cube_corners_share_one_cell() {
    let desc = GridDescriptor::new([1.0; 3], 1.0, 2).unwrap();
    let particles = cube_corners([0.3, 0.3, 0.3], 0.2);
    let mut grid = GridBuilder::new(desc, particles.len());

    grid.clear();
    let clamped = grid.count(&particles).unwrap();
    assert_eq!(clamped, 0);

    let (cell, _) = desc.cell_index(particles[0].position);
    for p in &particles {
        assert_eq!(desc.cell_index(p.position).0, cell);
    }
    assert_eq!(grid.cell_count(cell), 8);

    let occupied = (0..desc.grid_num()).filter(|&c| grid.cell_count(c) > 0).count();
    assert_eq!(occupied, 1);

    let offsets: HashSet<u32> = grid.local_offsets().iter().copied().collect();
    assert_eq!(offsets, (0..8).collect::<HashSet<u32>>());
}

#[test]
fn cube_corners_sort_into_contiguous_slots() {
    let desc = GridDescriptor::new([1.0; 3], 1.0, 2).unwrap();
    let particles = cube_corners([0.3, 0.3, 0.3], 0.2);
    let n = particles.len();
    let mut grid = GridBuilder::new(desc, n);
    grid.clear();
    grid.count(&particles).unwrap();

    let mut prefix = vec![0u32; desc.grid_num()];
    ParallelPrefixSum::new(desc.grid_num())
        .execute(grid.counts(), &mut prefix)
        .unwrap();

    let mut sorted = vec![Particle::default(); n];
    let mut ids = vec![0u32; n];
    CountingSort::new(n)
        .execute(
            SortInputs {
                grid: &desc,
                unsorted: &particles,
                prefix: &prefix,
                local_offsets: grid.local_offsets(),
            },
            &mut sorted,
            &mut ids,
        )
        .unwrap();

    let (cell, _) = desc.cell_index(particles[0].position);
    assert_eq!(prefix[cell], 0);
    let mut seen = ids.clone();
    seen.sort_unstable();
    assert_eq!(seen, (0..8).collect::<Vec<u32>>());
    for (slot, &id) in ids.iter().enumerate() {
        assert_eq!(sorted[slot].position, particles[id as usize].position);
    }
}

#[test]
fn empty_grid_is_a_no_op() {
    let desc = GridDescriptor::new([1.0; 3], 0.5, 2).unwrap();
    let mut grid = GridBuilder::new(desc, 0);
    grid.clear();
    assert_eq!(grid.count(&[]).unwrap(), 0);
    assert!(grid.local_offsets().is_empty());

    let mut prefix = vec![u32::MAX; desc.grid_num()];
    ParallelPrefixSum::new(desc.grid_num())
        .execute(grid.counts(), &mut prefix)
        .unwrap();
    assert!(prefix.iter().all(|&p| p == 0));

    let mut sorted: Vec<Particle> = Vec::new();
    let mut ids: Vec<u32> = Vec::new();
    CountingSort::new(0)
        .execute(
            SortInputs {
                grid: &desc,
                unsorted: &[],
                prefix: &prefix,
                local_offsets: &[],
            },
            &mut sorted,
            &mut ids,
        )
        .unwrap();
    assert!(sorted.is_empty());
}

#[test]
fn zero_length_scan_completes() {
    let mut scan = ParallelPrefixSum::new(0);
    let mut out: Vec<u32> = Vec::new();
    scan.execute::<u32>(&[], &mut out).unwrap();
    assert!(out.is_empty());
}

#[test]
fn escaped_particles_are_clamped_and_counted() {
    let desc = GridDescriptor::new([1.0; 3], 1.0, 2).unwrap();
    let particles = vec![
        Particle::at([0.0; 3]),
        Particle::at([100.0, 0.0, 0.0]),
        Particle::at([f32::NAN, 0.0, 0.0]),
    ];
    let mut grid = GridBuilder::new(desc, particles.len());
    grid.clear();
    assert_eq!(grid.count(&particles).unwrap(), 2);
    let total: u32 = (0..desc.grid_num()).map(|c| grid.cell_count(c)).sum();
    assert_eq!(total, 3);
    assert!(desc.cell_index_checked([100.0, 0.0, 0.0]).is_err());
}

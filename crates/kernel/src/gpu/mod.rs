//! GPU (Metal/Vulkan/DX12 via wgpu) implementation of the fluid pipeline.
//!
//! `GpuSolver` implements [`FluidSolver`] with one compute pass per
//! [`Phase`], recorded in the same order as the CPU solver. Passes inside a
//! command encoder are ordered by wgpu, which provides the barrier between
//! phases.
//!
//! # Shader modules
//! - `grid.wgsl`: `grid_clear`, `grid_count`
//! - `scan.wgsl`: `block_scan`, `scan_block_sums`, `add_block_offsets`
//! - `sort.wgsl`: `counting_sort`
//! - `sph.wgsl`: `compute_density`, `compute_force`, `integrate`, `copy_positions`
//!
//! `common.wgsl` (particle layout, uniforms and hashing) is prepended to every
//! module except the scan. Each module uses a single bind group.
//!
//! The scatter claims each sorted slot atomically. A slot claimed twice or
//! a destination past the end fails the submit with
//! [`KernelError::GpuSortFaults`].
//!
//! Particle data lives on the GPU; the canonical buffer is read back into a
//! CPU cache after every submitted batch so [`FluidSolver::particles`] stays
//! cheap.

pub mod buffers;

use buffers::{read_staging, GpuBuffers, GpuScanParams, GpuSimParams};

use crate::error::{KernelError, Result};
use crate::grid::GridDescriptor;
use crate::params::{BoundaryBox, SphParams};
use crate::particle::Particle;
use crate::pipeline::{validate_setup, Phase, SolverOptions, PRIME_PHASES, SUBSTEP_PHASES};
use crate::scan::{block_count, WORKGROUP_SIZE};
use crate::{FluidSolver, FrameStats};

const COMMON_WGSL: &str = include_str!("shaders/common.wgsl");

/// Check whether a GPU adapter is available.
pub fn gpu_available() -> bool {
    let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
        backends: wgpu::Backends::all(),
        ..Default::default()
    });
    let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
        power_preference: wgpu::PowerPreference::HighPerformance,
        compatible_surface: None,
        force_fallback_adapter: false,
    }));
    adapter.is_some()
}

/// GPU implementation of [`FluidSolver`].
pub struct GpuSolver {
    device: wgpu::Device,
    queue: wgpu::Queue,

    // Compute pipelines
    pipeline_grid_clear: wgpu::ComputePipeline,
    pipeline_grid_count: wgpu::ComputePipeline,
    pipeline_block_scan: wgpu::ComputePipeline,
    pipeline_scan_block_sums: wgpu::ComputePipeline,
    pipeline_add_block_offsets: wgpu::ComputePipeline,
    pipeline_counting_sort: wgpu::ComputePipeline,
    pipeline_density: wgpu::ComputePipeline,
    pipeline_force: wgpu::ComputePipeline,
    pipeline_integrate: wgpu::ComputePipeline,
    pipeline_copy_positions: wgpu::ComputePipeline,

    // One bind group per shader module
    grid_bg: wgpu::BindGroup,
    scan_bg: wgpu::BindGroup,
    sort_bg: wgpu::BindGroup,
    sph_bg: wgpu::BindGroup,

    bufs: GpuBuffers,
    sim_params: GpuSimParams,

    params: SphParams,
    boundary: BoundaryBox,
    options: SolverOptions,
    grid: GridDescriptor,

    /// CPU copy of the canonical buffer, refreshed after every submit.
    particles: Vec<Particle>,
    clamped_cells: u32,
    substeps: u64,
    frames: u64,
}

impl GpuSolver {
    /// Create the device, upload `particles` and prime densities and forces.
    ///
    /// Returns [`KernelError::GpuInit`] if no adapter or device is available,
    /// allowing callers to fall back to [`CpuSolver`](crate::CpuSolver).
    pub fn new(
        particles: Vec<Particle>,
        params: SphParams,
        boundary: BoundaryBox,
        options: SolverOptions,
    ) -> Result<Self> {
        let grid = validate_setup(&particles, &params, &boundary, &options)?;
        if options.deterministic {
            tracing::warn!("deterministic cell ordering is only implemented by the CPU solver");
        }

        // --- Device initialization ---
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .ok_or_else(|| KernelError::GpuInit("no suitable GPU adapter found".into()))?;

        tracing::info!("GPU adapter: {:?}", adapter.get_info().name);

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("fluid_device"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default(),
                memory_hints: wgpu::MemoryHints::Performance,
            },
            None,
        ))
        .map_err(|e| KernelError::GpuInit(format!("failed to create device: {e}")))?;

        // --- Buffers ---
        let n = particles.len() as u32;
        let sim_params = GpuSimParams::new(&params, &grid, &boundary, n);
        let scan_params = GpuScanParams {
            len: grid.grid_num() as u32,
            num_blocks: block_count(grid.grid_num()).max(1) as u32,
            _pad0: 0,
            _pad1: 0,
        };
        let bufs = GpuBuffers::new(&device, &particles, &sim_params, &scan_params);

        tracing::info!(
            particles = n,
            dims = ?grid.dims,
            cells = grid.grid_num(),
            blocks = scan_params.num_blocks,
            "GPU fluid solver initialised"
        );

        // --- Shaders ---
        let grid_shader = shader_module(&device, "grid", &with_common(include_str!("shaders/grid.wgsl")));
        let scan_shader = shader_module(&device, "scan", include_str!("shaders/scan.wgsl"));
        let sort_shader = shader_module(&device, "sort", &with_common(include_str!("shaders/sort.wgsl")));
        let sph_shader = shader_module(&device, "sph", &with_common(include_str!("shaders/sph.wgsl")));

        // --- Bind group layouts ---
        let grid_bgl = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("grid_bgl"),
            entries: &[
                bgl_uniform(0),
                bgl_storage_ro(1),
                bgl_storage_rw(2),
                bgl_storage_rw(3),
                bgl_storage_rw(4),
            ],
        });
        let scan_bgl = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("scan_bgl"),
            entries: &[
                bgl_uniform(0),
                bgl_storage_ro(1),
                bgl_storage_rw(2),
                bgl_storage_rw(3),
            ],
        });
        let sort_bgl = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("sort_bgl"),
            entries: &[
                bgl_uniform(0),
                bgl_storage_ro(1),
                bgl_storage_ro(2),
                bgl_storage_ro(3),
                bgl_storage_rw(4),
                bgl_storage_rw(5),
                bgl_storage_rw(6),
                bgl_storage_rw(7),
            ],
        });
        let sph_bgl = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("sph_bgl"),
            entries: &[
                bgl_uniform(0),
                bgl_storage_rw(1),
                bgl_storage_ro(2),
                bgl_storage_ro(3),
                bgl_storage_ro(4),
                bgl_storage_rw(5),
            ],
        });

        // --- Bind groups ---
        let grid_bg = bind_group(
            &device,
            "grid_bg",
            &grid_bgl,
            &[
                &bufs.params,
                &bufs.particles,
                &bufs.cell_counts,
                &bufs.local_offsets,
                &bufs.clamped,
            ],
        );
        let scan_bg = bind_group(
            &device,
            "scan_bg",
            &scan_bgl,
            &[
                &bufs.scan_params,
                &bufs.cell_counts,
                &bufs.prefix_sum,
                &bufs.block_sums,
            ],
        );
        let sort_bg = bind_group(
            &device,
            "sort_bg",
            &sort_bgl,
            &[
                &bufs.params,
                &bufs.particles,
                &bufs.prefix_sum,
                &bufs.local_offsets,
                &bufs.sorted,
                &bufs.sorted_ids,
                &bufs.slot_claims,
                &bufs.sort_faults,
            ],
        );
        let sph_bg = bind_group(
            &device,
            "sph_bg",
            &sph_bgl,
            &[
                &bufs.params,
                &bufs.particles,
                &bufs.sorted,
                &bufs.sorted_ids,
                &bufs.prefix_sum,
                &bufs.positions,
            ],
        );

        // --- Compute pipelines ---
        let pipeline = |module: &wgpu::ShaderModule, bgl: &wgpu::BindGroupLayout, entry: &str| {
            compute_pipeline(&device, module, bgl, entry)
        };
        let pipeline_grid_clear = pipeline(&grid_shader, &grid_bgl, "grid_clear");
        let pipeline_grid_count = pipeline(&grid_shader, &grid_bgl, "grid_count");
        let pipeline_block_scan = pipeline(&scan_shader, &scan_bgl, "block_scan");
        let pipeline_scan_block_sums = pipeline(&scan_shader, &scan_bgl, "scan_block_sums");
        let pipeline_add_block_offsets = pipeline(&scan_shader, &scan_bgl, "add_block_offsets");
        let pipeline_counting_sort = pipeline(&sort_shader, &sort_bgl, "counting_sort");
        let pipeline_density = pipeline(&sph_shader, &sph_bgl, "compute_density");
        let pipeline_force = pipeline(&sph_shader, &sph_bgl, "compute_force");
        let pipeline_integrate = pipeline(&sph_shader, &sph_bgl, "integrate");
        let pipeline_copy_positions = pipeline(&sph_shader, &sph_bgl, "copy_positions");

        let mut solver = Self {
            device,
            queue,
            pipeline_grid_clear,
            pipeline_grid_count,
            pipeline_block_scan,
            pipeline_scan_block_sums,
            pipeline_add_block_offsets,
            pipeline_counting_sort,
            pipeline_density,
            pipeline_force,
            pipeline_integrate,
            pipeline_copy_positions,
            grid_bg,
            scan_bg,
            sort_bg,
            sph_bg,
            bufs,
            sim_params,
            params,
            boundary,
            options,
            grid,
            particles,
            clamped_cells: 0,
            substeps: 0,
            frames: 0,
        };

        solver.check_hashing()?;
        solver.submit(&[&PRIME_PHASES[..]])?;
        Ok(solver)
    }

    /// Build a solver from seed positions, all particles at rest.
    pub fn from_positions(
        positions: &[[f32; 3]],
        params: SphParams,
        boundary: BoundaryBox,
        options: SolverOptions,
    ) -> Result<Self> {
        Self::new(
            crate::particle::particles_from_positions(positions),
            params,
            boundary,
            options,
        )
    }

    /// Hashing layout.
    pub fn grid_descriptor(&self) -> &GridDescriptor {
        &self.grid
    }

    /// Frames advanced through [`FluidSolver::step_frame`].
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Read back the prefix sum from the last scan.
    pub fn prefix_sum(&self) -> Result<Vec<u32>> {
        self.read_buffer(&self.bufs.prefix_sum, self.bufs.grid_num as usize)
    }

    /// Read back the canonical index of each sorted record.
    pub fn sorted_ids(&self) -> Result<Vec<u32>> {
        self.read_buffer(&self.bufs.sorted_ids, self.bufs.particle_count as usize)
    }

    /// Run the position-copy pass and read back the packed positions.
    pub fn read_positions(&self) -> Result<Vec<[f32; 3]>> {
        let n = self.bufs.particle_count;
        if n == 0 {
            return Ok(Vec::new());
        }
        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("copy_positions"),
        });
        encode_pass(
            &mut encoder,
            "copy_positions",
            &self.pipeline_copy_positions,
            &self.sph_bg,
            dispatch_size(n, WORKGROUP_SIZE as u32),
        );
        self.queue.submit(std::iter::once(encoder.finish()));
        let flat: Vec<f32> = self.read_buffer(&self.bufs.positions, n as usize * 3)?;
        Ok(flat.chunks_exact(3).map(|c| [c[0], c[1], c[2]]).collect())
    }

    /// With strict hashing, reject a state in which any particle lies
    /// outside the grid before it is counted.
    fn check_hashing(&self) -> Result<()> {
        if self.options.strict_hashing {
            for p in &self.particles {
                self.grid.cell_index_checked(p.position)?;
            }
        }
        Ok(())
    }

    /// Encode the phase lists in order, submit once and refresh the cache.
    fn submit(&mut self, batches: &[&[Phase]]) -> Result<()> {
        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("fluid_substeps"),
        });
        encoder.clear_buffer(&self.bufs.sort_faults, 0, None);
        for phases in batches {
            for &phase in phases.iter() {
                self.encode_phase(&mut encoder, phase);
            }
        }

        let n = self.bufs.particle_count as usize;
        let particle_bytes = (n * std::mem::size_of::<Particle>()) as u64;
        if particle_bytes > 0 {
            encoder.copy_buffer_to_buffer(
                &self.bufs.particles,
                0,
                &self.bufs.staging_particles,
                0,
                particle_bytes,
            );
        }
        encoder.copy_buffer_to_buffer(&self.bufs.clamped, 0, &self.bufs.staging_clamped, 0, 4);
        encoder.copy_buffer_to_buffer(
            &self.bufs.sort_faults,
            0,
            &self.bufs.staging_sort_faults,
            0,
            4,
        );
        self.queue.submit(std::iter::once(encoder.finish()));

        self.particles = read_staging(&self.device, &self.bufs.staging_particles, n)?;
        self.clamped_cells = read_staging::<u32>(&self.device, &self.bufs.staging_clamped, 1)?
            .first()
            .copied()
            .unwrap_or(0);
        if self.clamped_cells > 0 {
            tracing::warn!(
                clamped = self.clamped_cells,
                "particles outside the grid were clamped into edge cells"
            );
        }
        let faults = read_staging::<u32>(&self.device, &self.bufs.staging_sort_faults, 1)?
            .first()
            .copied()
            .unwrap_or(0);
        if faults > 0 {
            return Err(KernelError::GpuSortFaults { faults });
        }
        Ok(())
    }

    fn encode_phase(&self, encoder: &mut wgpu::CommandEncoder, phase: Phase) {
        let n = self.bufs.particle_count;
        let wg = WORKGROUP_SIZE as u32;
        let wg_particles = dispatch_size(n, wg);
        let (pipeline, bind_group, workgroups) = match phase {
            Phase::GridClear => (
                &self.pipeline_grid_clear,
                &self.grid_bg,
                dispatch_size(self.bufs.grid_num, wg),
            ),
            Phase::PrefixSum => {
                let blocks = self.bufs.num_blocks;
                encode_pass(encoder, "block_scan", &self.pipeline_block_scan, &self.scan_bg, blocks);
                encode_pass(encoder, "scan_block_sums", &self.pipeline_scan_block_sums, &self.scan_bg, 1);
                encode_pass(encoder, "add_block_offsets", &self.pipeline_add_block_offsets, &self.scan_bg, blocks);
                return;
            }
            // Particle passes have nothing to do for an empty set.
            _ if n == 0 => return,
            Phase::GridCount => (&self.pipeline_grid_count, &self.grid_bg, wg_particles),
            Phase::Sort | Phase::Resort => {
                encoder.clear_buffer(&self.bufs.slot_claims, 0, None);
                (&self.pipeline_counting_sort, &self.sort_bg, wg_particles)
            }
            Phase::Density => (&self.pipeline_density, &self.sph_bg, wg_particles),
            Phase::Force => (&self.pipeline_force, &self.sph_bg, wg_particles),
            Phase::Integrate => (&self.pipeline_integrate, &self.sph_bg, wg_particles),
        };
        encode_pass(encoder, phase.name(), pipeline, bind_group, workgroups);
    }

    /// Copy `count` elements of `src` into a fresh staging buffer and read them.
    fn read_buffer<T: bytemuck::Pod>(&self, src: &wgpu::Buffer, count: usize) -> Result<Vec<T>> {
        let bytes = (count * std::mem::size_of::<T>()) as u64;
        if bytes == 0 {
            return Ok(Vec::new());
        }
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("readback"),
            size: bytes,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("readback"),
        });
        encoder.copy_buffer_to_buffer(src, 0, &staging, 0, bytes);
        self.queue.submit(std::iter::once(encoder.finish()));
        read_staging(&self.device, &staging, count)
    }
}

impl FluidSolver for GpuSolver {
    fn substep(&mut self) -> Result<()> {
        self.check_hashing()?;
        self.submit(&[&SUBSTEP_PHASES[..]])?;
        self.substeps += 1;
        Ok(())
    }

    fn substeps_per_frame(&self) -> u32 {
        self.options.substeps_per_frame
    }

    fn step_frame(&mut self) -> Result<()> {
        let substeps = self.options.substeps_per_frame;
        if self.options.strict_hashing {
            // Each substep must be checked against the positions it hashes.
            for _ in 0..substeps {
                self.substep()?;
            }
        } else {
            let batches = vec![&SUBSTEP_PHASES[..]; substeps as usize];
            self.submit(&batches)?;
            self.substeps += substeps as u64;
        }
        self.frames += 1;
        if self.frames % 100 == 0 {
            tracing::debug!(frames = self.frames, substeps = self.substeps, "frame progress");
        }
        Ok(())
    }

    fn particles(&self) -> &[Particle] {
        &self.particles
    }

    fn params(&self) -> &SphParams {
        &self.params
    }

    fn boundary(&self) -> BoundaryBox {
        self.boundary
    }

    fn set_boundary(&mut self, boundary: BoundaryBox) -> Result<()> {
        boundary.validate()?;
        if !self.grid.covers(boundary.half_extents) {
            return Err(KernelError::BoxOutsideGrid {
                requested: boundary.half_extents,
                limit: self.grid.half_extents,
            });
        }
        self.sim_params.set_boundary(&boundary);
        self.queue
            .write_buffer(&self.bufs.params, 0, bytemuck::bytes_of(&self.sim_params));
        tracing::info!(half_extents = ?boundary.half_extents, "boundary box updated");
        self.boundary = boundary;
        Ok(())
    }

    fn stats(&self) -> FrameStats {
        FrameStats::measure(&self.particles, &self.params, self.substeps, self.clamped_cells)
    }
}

fn with_common(src: &str) -> String {
    format!("{COMMON_WGSL}\n{src}")
}

fn shader_module(device: &wgpu::Device, label: &str, src: &str) -> wgpu::ShaderModule {
    device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(label),
        source: wgpu::ShaderSource::Wgsl(src.into()),
    })
}

fn compute_pipeline(
    device: &wgpu::Device,
    module: &wgpu::ShaderModule,
    bgl: &wgpu::BindGroupLayout,
    entry: &str,
) -> wgpu::ComputePipeline {
    let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some(entry),
        bind_group_layouts: &[bgl],
        push_constant_ranges: &[],
    });
    device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label: Some(entry),
        layout: Some(&layout),
        module,
        entry_point: Some(entry),
        compilation_options: Default::default(),
        cache: None,
    })
}

/// Bind `buffers` to bindings `0..` in order.
fn bind_group(
    device: &wgpu::Device,
    label: &str,
    layout: &wgpu::BindGroupLayout,
    buffers: &[&wgpu::Buffer],
) -> wgpu::BindGroup {
    let entries: Vec<wgpu::BindGroupEntry<'_>> = buffers
        .iter()
        .enumerate()
        .map(|(i, buf)| wgpu::BindGroupEntry {
            binding: i as u32,
            resource: buf.as_entire_binding(),
        })
        .collect();
    device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some(label),
        layout,
        entries: &entries,
    })
}

fn encode_pass(
    encoder: &mut wgpu::CommandEncoder,
    label: &str,
    pipeline: &wgpu::ComputePipeline,
    bind_group: &wgpu::BindGroup,
    workgroups: u32,
) {
    let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
        label: Some(label),
        timestamp_writes: None,
    });
    pass.set_pipeline(pipeline);
    pass.set_bind_group(0, bind_group, &[]);
    pass.dispatch_workgroups(workgroups, 1, 1);
}

/// Calculate dispatch workgroup count: ceil(total / workgroup_size).
fn dispatch_size(total: u32, workgroup_size: u32) -> u32 {
    total.div_ceil(workgroup_size)
}

// ---- Bind group layout entry helpers ----

fn bgl_uniform(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn bgl_storage_ro(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only: true },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn bgl_storage_rw(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only: false },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

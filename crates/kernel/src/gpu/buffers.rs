//! GPU buffer layouts and allocation for the fluid pipeline.
//!
//! All buffers are created once at solver construction and sized for the
//! fixed particle count and grid; nothing is reallocated per substep.

use wgpu::util::DeviceExt;

use crate::grid::GridDescriptor;
use crate::params::{BoundaryBox, SphParams};
use crate::particle::Particle;

/// Simulation uniform layout.
/// Must match the SimParams struct in `common.wgsl` exactly.
#[repr(C)]
#[derive(Debug, Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
pub struct GpuSimParams {
    pub particle_count: u32,
    pub grid_num: u32,
    pub grid_x: u32,
    pub grid_y: u32,
    pub grid_z: u32,
    pub cell_size: f32,
    pub origin_offset_x: f32,
    pub origin_offset_y: f32,
    pub origin_offset_z: f32,
    pub mass: f32,
    pub radius: f32,
    pub radius2: f32,
    pub radius5: f32,
    pub radius6: f32,
    pub radius9: f32,
    pub dt: f32,
    pub stiffness: f32,
    pub near_stiffness: f32,
    pub rest_density: f32,
    pub viscosity: f32,
    pub surface_tension: f32,
    pub wall_damping: f32,
    pub gravity_x: f32,
    pub gravity_y: f32,
    pub gravity_z: f32,
    pub box_x: f32,
    pub box_y: f32,
    pub box_z: f32,
}

impl GpuSimParams {
    pub fn new(
        params: &SphParams,
        grid: &GridDescriptor,
        boundary: &BoundaryBox,
        particle_count: u32,
    ) -> Self {
        Self {
            particle_count,
            grid_num: grid.grid_num() as u32,
            grid_x: grid.dims[0],
            grid_y: grid.dims[1],
            grid_z: grid.dims[2],
            cell_size: grid.cell_size,
            origin_offset_x: grid.half_extents[0] + grid.sentinel_offset,
            origin_offset_y: grid.half_extents[1] + grid.sentinel_offset,
            origin_offset_z: grid.half_extents[2] + grid.sentinel_offset,
            mass: params.mass,
            radius: params.kernel_radius,
            radius2: params.radius2,
            radius5: params.radius5,
            radius6: params.radius6,
            radius9: params.radius9,
            dt: params.dt,
            stiffness: params.stiffness,
            near_stiffness: params.near_stiffness,
            rest_density: params.rest_density,
            viscosity: params.viscosity,
            surface_tension: params.surface_tension,
            wall_damping: params.wall_damping,
            gravity_x: params.gravity[0],
            gravity_y: params.gravity[1],
            gravity_z: params.gravity[2],
            box_x: boundary.half_extents[0],
            box_y: boundary.half_extents[1],
            box_z: boundary.half_extents[2],
        }
    }

    pub fn set_boundary(&mut self, boundary: &BoundaryBox) {
        self.box_x = boundary.half_extents[0];
        self.box_y = boundary.half_extents[1];
        self.box_z = boundary.half_extents[2];
    }
}

/// Scan uniform layout. Must match ScanParams in `scan.wgsl`.
#[repr(C)]
#[derive(Debug, Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
pub struct GpuScanParams {
    pub len: u32,
    pub num_blocks: u32,
    pub _pad0: u32,
    pub _pad1: u32,
}

/// Every GPU buffer the pipeline binds.
pub struct GpuBuffers {
    pub params: wgpu::Buffer,
    pub scan_params: wgpu::Buffer,

    // Particle buffers
    pub particles: wgpu::Buffer,
    pub sorted: wgpu::Buffer,
    pub sorted_ids: wgpu::Buffer,
    pub positions: wgpu::Buffer,

    // Grid scratch
    pub cell_counts: wgpu::Buffer,
    pub local_offsets: wgpu::Buffer,
    pub prefix_sum: wgpu::Buffer,
    pub block_sums: wgpu::Buffer,
    pub clamped: wgpu::Buffer,
    pub slot_claims: wgpu::Buffer,
    pub sort_faults: wgpu::Buffer,

    // Readback
    pub staging_particles: wgpu::Buffer,
    pub staging_clamped: wgpu::Buffer,
    pub staging_sort_faults: wgpu::Buffer,

    pub particle_count: u32,
    pub grid_num: u32,
    pub num_blocks: u32,
}

/// Minimum storage buffer size: one particle record.
const MIN_BUF_SIZE: u64 = std::mem::size_of::<Particle>() as u64;

const STORAGE: wgpu::BufferUsages = wgpu::BufferUsages::STORAGE
    .union(wgpu::BufferUsages::COPY_SRC)
    .union(wgpu::BufferUsages::COPY_DST);

impl GpuBuffers {
    pub fn new(
        device: &wgpu::Device,
        particles: &[Particle],
        sim_params: &GpuSimParams,
        scan_params: &GpuScanParams,
    ) -> Self {
        let n = particles.len() as u64;
        let grid_num = sim_params.grid_num as u64;
        let particle_bytes = n * std::mem::size_of::<Particle>() as u64;

        let params = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("sim_params"),
            contents: bytemuck::bytes_of(sim_params),
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        });
        let scan_params_buf = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("scan_params"),
            contents: bytemuck::bytes_of(scan_params),
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        });

        Self {
            params,
            scan_params: scan_params_buf,
            particles: create_storage_init(device, "particles", bytemuck::cast_slice(particles)),
            sorted: create_storage(device, "sorted_particles", particle_bytes),
            sorted_ids: create_storage(device, "sorted_ids", n * 4),
            positions: create_storage(device, "positions", n * 12),
            cell_counts: create_storage(device, "cell_counts", grid_num * 4),
            local_offsets: create_storage(device, "local_offsets", n * 4),
            prefix_sum: create_storage(device, "prefix_sum", grid_num * 4),
            block_sums: create_storage(device, "block_sums", scan_params.num_blocks as u64 * 4),
            clamped: create_storage(device, "clamped_count", 4),
            slot_claims: create_storage(device, "slot_claims", n * 4),
            sort_faults: create_storage(device, "sort_faults", 4),
            staging_particles: create_staging(device, "staging_particles", particle_bytes),
            staging_clamped: create_staging(device, "staging_clamped", 4),
            staging_sort_faults: create_staging(device, "staging_sort_faults", 4),
            particle_count: n as u32,
            grid_num: grid_num as u32,
            num_blocks: scan_params.num_blocks,
        }
    }
}

/// Create a zeroed storage buffer of `size` bytes (at least one record).
fn create_storage(device: &wgpu::Device, label: &str, size: u64) -> wgpu::Buffer {
    device.create_buffer(&wgpu::BufferDescriptor {
        label: Some(label),
        size: size.max(MIN_BUF_SIZE),
        usage: STORAGE,
        mapped_at_creation: false,
    })
}

/// Create a storage buffer holding `data`.
fn create_storage_init(device: &wgpu::Device, label: &str, data: &[u8]) -> wgpu::Buffer {
    if (data.len() as u64) < MIN_BUF_SIZE {
        return create_storage(device, label, MIN_BUF_SIZE);
    }
    device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some(label),
        contents: data,
        usage: STORAGE,
    })
}

/// Create a staging (MAP_READ) buffer for readback.
fn create_staging(device: &wgpu::Device, label: &str, size: u64) -> wgpu::Buffer {
    device.create_buffer(&wgpu::BufferDescriptor {
        label: Some(label),
        size: size.max(4),
        usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    })
}

/// Map `staging`, copy its first `count` elements out and unmap.
///
/// The caller must already have submitted the copy into `staging`.
pub fn read_staging<T: bytemuck::Pod>(
    device: &wgpu::Device,
    staging: &wgpu::Buffer,
    count: usize,
) -> crate::Result<Vec<T>> {
    let byte_len = (count * std::mem::size_of::<T>()) as u64;
    if byte_len == 0 {
        return Ok(Vec::new());
    }
    let slice = staging.slice(..byte_len);
    let (tx, rx) = std::sync::mpsc::channel();
    slice.map_async(wgpu::MapMode::Read, move |result| {
        let _ = tx.send(result);
    });
    device.poll(wgpu::Maintain::Wait);
    rx.recv()
        .map_err(|e| crate::KernelError::GpuReadback(e.to_string()))?
        .map_err(|e| crate::KernelError::GpuReadback(e.to_string()))?;

    let data = slice.get_mapped_range();
    let out: Vec<T> = bytemuck::cast_slice(&data).to_vec();
    drop(data);
    staging.unmap();
    Ok(out)
}

//! WGSL kernel sources and dispatch helpers.
//!
//! Sources are specialized with naga_oil shader defs through
//! [`ProgramKey`](tessera_core::ProgramKey) parameters; every source exposes a
//! `main` entry point and takes its per-launch scalars as a uniform at binding 0.

use bytemuck::Pod;
use tessera_core::{Error, Result};
use wgpu::util::DeviceExt;

pub const IM2COL: &str = include_str!("../shaders/im2col.wgsl");
pub const SGEMM: &str = include_str!("../shaders/sgemm.wgsl");
pub const BWD_BIAS: &str = include_str!("../shaders/bwd_bias.wgsl");
pub const SCAL: &str = include_str!("../shaders/scal.wgsl");

/// Look up a kernel source by its source id.
pub fn kernel_source(name: &str) -> Option<&'static str> {
    match name {
        "im2col" => Some(IM2COL),
        "sgemm" => Some(SGEMM),
        "bwd_bias" => Some(BWD_BIAS),
        "scal" => Some(SCAL),
        _ => None,
    }
}

/// Upload a launch parameter block as a uniform buffer.
pub(crate) fn uniform_buffer<T: Pod>(device: &wgpu::Device, label: &str, params: &T) -> wgpu::Buffer {
    device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some(label),
        contents: bytemuck::bytes_of(params),
        usage: wgpu::BufferUsages::UNIFORM,
    })
}

/// Workgroup counts, checked against the device limit.
pub(crate) fn workgroups(device: &wgpu::Device, counts: [usize; 3]) -> Result<[u32; 3]> {
    let limit = device.limits().max_compute_workgroups_per_dimension;
    let mut out = [0u32; 3];
    for (slot, count) in out.iter_mut().zip(counts) {
        *slot = u32::try_from(count)
            .ok()
            .filter(|c| *c <= limit)
            .ok_or_else(|| {
                Error::Validation(format!(
                    "Dispatch of {count} workgroups exceeds device limit {limit}"
                ))
            })?;
    }
    Ok(out)
}

/// Convert a size to the `u32` kernels index with.
pub(crate) fn to_u32(value: usize, what: &str) -> Result<u32> {
    u32::try_from(value).map_err(|_| Error::Validation(format!("{what} {value} exceeds u32")))
}

//! Tensors bound to host or device storage.

use crate::context::Context;
use crate::types::{DataType, Shape, TensorSpecs};
use crate::{Error, Result};
use std::sync::Arc;
use wgpu::util::DeviceExt;

/// A tensor with backing storage on the side of the context that allocated it.
///
/// Host tensors own a `Vec<f32>`. Device tensors reference a region of a
/// shared `wgpu::Buffer`, starting `offset` elements into it.
#[derive(Debug, Clone)]
pub struct Tensor {
    specs: TensorSpecs,
    storage: Storage,
}

#[derive(Debug, Clone)]
enum Storage {
    Host(Vec<f32>),
    Device { buffer: Arc<wgpu::Buffer>, offset: usize },
}

/// Explicit (buffer, element offset, element count) view of a device tensor.
#[derive(Debug, Clone, Copy)]
pub struct DeviceView<'a> {
    pub buffer: &'a wgpu::Buffer,
    pub offset: usize,
    pub len: usize,
}

impl DeviceView<'_> {
    /// Offset as passed to kernels, which index buffers with `u32`.
    pub fn offset_u32(&self) -> Result<u32> {
        u32::try_from(self.offset)
            .map_err(|_| Error::Validation(format!("Element offset {} exceeds u32", self.offset)))
    }
}

const STORAGE_USAGE: wgpu::BufferUsages = wgpu::BufferUsages::STORAGE
    .union(wgpu::BufferUsages::COPY_SRC)
    .union(wgpu::BufferUsages::COPY_DST);

impl Tensor {
    /// Allocate zero-initialized storage for `specs` on the context's side.
    pub fn new(ctx: &Context, specs: TensorSpecs) -> Result<Self> {
        check_dtype(&specs)?;
        let len = specs.shape().total_size();

        let storage = if ctx.is_cpu_context() {
            Storage::Host(vec![0.0; len])
        } else {
            // wgpu requires buffers to be at least 4 bytes
            let size = (len * specs.dtype().size()).max(4) as u64;
            let buffer = ctx.device()?.create_buffer(&wgpu::BufferDescriptor {
                label: Some("tensor"),
                size,
                usage: STORAGE_USAGE,
                mapped_at_creation: false,
            });
            Storage::Device {
                buffer: Arc::new(buffer),
                offset: 0,
            }
        };

        Ok(Self { specs, storage })
    }

    /// Allocate a tensor of `shape` holding a copy of `data`.
    pub fn from_host(ctx: &Context, shape: impl Into<Shape>, data: &[f32]) -> Result<Self> {
        let specs = TensorSpecs::new(shape, DataType::F32);
        check_len(&specs, data.len())?;

        if ctx.is_cpu_context() {
            return Ok(Self {
                specs,
                storage: Storage::Host(data.to_vec()),
            });
        }

        let contents: &[u8] = if data.is_empty() {
            &[0u8; 4]
        } else {
            bytemuck::cast_slice(data)
        };
        let buffer = ctx
            .device()?
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("tensor"),
                contents,
                usage: STORAGE_USAGE,
            });
        Ok(Self {
            specs,
            storage: Storage::Device {
                buffer: Arc::new(buffer),
                offset: 0,
            },
        })
    }

    /// Bind a tensor to the region of `buffer` starting `offset` elements in.
    pub fn from_device_buffer(
        buffer: Arc<wgpu::Buffer>,
        offset: usize,
        specs: TensorSpecs,
    ) -> Result<Self> {
        check_dtype(&specs)?;
        let capacity = buffer.size() as usize / specs.dtype().size();
        let end = offset + specs.shape().total_size();
        if end > capacity {
            return Err(Error::Validation(format!(
                "Tensor {specs} at offset {offset} exceeds buffer of {capacity} elements"
            )));
        }
        Ok(Self {
            specs,
            storage: Storage::Device { buffer, offset },
        })
    }

    pub fn specs(&self) -> &TensorSpecs {
        &self.specs
    }

    pub fn shape(&self) -> &Shape {
        self.specs.shape()
    }

    pub fn dtype(&self) -> DataType {
        self.specs.dtype()
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.specs.shape().total_size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_host(&self) -> bool {
        matches!(self.storage, Storage::Host(_))
    }

    /// Reinterpret the tensor with a new shape of the same element count.
    pub fn reshape(&mut self, shape: impl Into<Shape>) -> Result<()> {
        let shape = shape.into();
        if shape.total_size() != self.len() {
            return Err(Error::Validation(format!(
                "Cannot reshape {} to {shape}: element count differs",
                self.shape()
            )));
        }
        self.specs = TensorSpecs::new(shape, self.dtype());
        Ok(())
    }

    pub fn host_data(&self) -> Result<&[f32]> {
        match &self.storage {
            Storage::Host(data) => Ok(data),
            Storage::Device { .. } => Err(Error::Validation(
                "Host data requested from a device tensor".to_string(),
            )),
        }
    }

    pub fn host_data_mut(&mut self) -> Result<&mut [f32]> {
        match &mut self.storage {
            Storage::Host(data) => Ok(data),
            Storage::Device { .. } => Err(Error::Validation(
                "Host data requested from a device tensor".to_string(),
            )),
        }
    }

    pub fn device_view(&self) -> Result<DeviceView<'_>> {
        match &self.storage {
            Storage::Device { buffer, offset } => {
                let len = self.len();
                debug_assert!(
                    (offset + len) * self.dtype().size() <= buffer.size() as usize,
                    "device view out of bounds"
                );
                Ok(DeviceView {
                    buffer,
                    offset: *offset,
                    len,
                })
            }
            Storage::Host(_) => Err(Error::Validation(
                "Device buffer requested from a host tensor".to_string(),
            )),
        }
    }

    /// Overwrite the tensor contents with `data`.
    pub fn write_host(&mut self, ctx: &Context, data: &[f32]) -> Result<()> {
        check_len(&self.specs, data.len())?;
        match &mut self.storage {
            Storage::Host(host) => host.copy_from_slice(data),
            Storage::Device { buffer, offset } => {
                if !data.is_empty() {
                    let byte_offset = (*offset * self.specs.dtype().size()) as u64;
                    ctx.queue()?
                        .write_buffer(buffer, byte_offset, bytemuck::cast_slice(data));
                }
            }
        }
        Ok(())
    }

    /// Copy the tensor contents to host memory.
    ///
    /// For device tensors this blocks until all previously submitted work on
    /// the context's queue has finished.
    pub fn read_host(&self, ctx: &Context) -> Result<Vec<f32>> {
        let (buffer, offset) = match &self.storage {
            Storage::Host(data) => return Ok(data.clone()),
            Storage::Device { buffer, offset } => (buffer, *offset),
        };
        if self.is_empty() {
            return Ok(Vec::new());
        }

        let device = ctx.device()?;
        let queue = ctx.queue()?;
        let elem = self.dtype().size() as u64;
        let size = self.len() as u64 * elem;

        let staging = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("download_staging"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("download_copy"),
        });
        encoder.copy_buffer_to_buffer(buffer, offset as u64 * elem, &staging, 0, size);
        queue.submit(std::iter::once(encoder.finish()));

        let slice = staging.slice(..);
        let (sender, receiver) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        device
            .poll(wgpu::PollType::Wait {
                submission_index: None,
                timeout: None,
            })
            .map_err(|e| Error::Device(format!("GPU poll failed during download: {e:?}")))?;

        receiver
            .recv()
            .map_err(|e| Error::Device(format!("Map recv failed: {e}")))??;

        let data = bytemuck::pod_collect_to_vec::<u8, f32>(&slice.get_mapped_range()[..]);
        staging.unmap();

        Ok(data)
    }
}

fn check_dtype(specs: &TensorSpecs) -> Result<()> {
    if specs.dtype() != DataType::F32 {
        return Err(Error::Validation(format!(
            "Only float32 tensors are supported, got {}",
            specs.dtype()
        )));
    }
    Ok(())
}

fn check_len(specs: &TensorSpecs, len: usize) -> Result<()> {
    let expected = specs.shape().total_size();
    if len != expected {
        return Err(Error::Validation(format!(
            "Data length {len} doesn't match shape {} (expected {expected})",
            specs.shape()
        )));
    }
    Ok(())
}

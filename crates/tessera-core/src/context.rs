//! CPU or GPU execution target shared by all operators.

use crate::program_cache::{Program, ProgramCache, ProgramKey};
use crate::{Error, Result};
use std::fmt;
use std::sync::Arc;

/// Identifies where operators execute and owns the device's kernel cache.
///
/// Cloning is cheap; clones share the same device, queue, and
/// [`ProgramCache`]. A context is never mutated after construction apart from
/// the cache filling up.
///
/// # Example
/// ```no_run
/// # use tessera_core::Context;
/// #[pollster::main]
/// async fn main() -> tessera_core::Result<()> {
///     let ctx = Context::request_gpu().await?;
///     println!("running on {}", ctx.name());
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Context {
    inner: Arc<Target>,
}

enum Target {
    Cpu,
    Gpu(GpuDevice),
}

struct GpuDevice {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    adapter_info: Option<wgpu::AdapterInfo>,
    programs: ProgramCache<Program>,
}

impl Context {
    /// Host execution; no device resources are created.
    pub fn cpu() -> Self {
        Self {
            inner: Arc::new(Target::Cpu),
        }
    }

    /// Wrap an existing device and queue.
    pub fn from_device(device: Arc<wgpu::Device>, queue: Arc<wgpu::Queue>) -> Self {
        Self::gpu(device, queue, None)
    }

    /// Create a GPU context on the default high-performance adapter.
    ///
    /// # Errors
    /// Returns [`Error::Device`] if no adapter is available or the device
    /// request fails.
    pub async fn request_gpu() -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .map_err(|e| Error::Device(format!("Failed to find suitable GPU adapter: {e}")))?;

        let adapter_info = adapter.get_info();
        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor::default())
            .await
            .map_err(|e| Error::Device(format!("Failed to create device: {e}")))?;

        tracing::info!(adapter = %adapter_info.name, backend = ?adapter_info.backend, "GPU context created");

        Ok(Self::gpu(Arc::new(device), Arc::new(queue), Some(adapter_info)))
    }

    fn gpu(
        device: Arc<wgpu::Device>,
        queue: Arc<wgpu::Queue>,
        adapter_info: Option<wgpu::AdapterInfo>,
    ) -> Self {
        Self {
            inner: Arc::new(Target::Gpu(GpuDevice {
                device,
                queue,
                adapter_info,
                programs: ProgramCache::new(),
            })),
        }
    }

    pub fn is_cpu_context(&self) -> bool {
        matches!(*self.inner, Target::Cpu)
    }

    /// Human readable target name.
    pub fn name(&self) -> String {
        match &*self.inner {
            Target::Cpu => "CPU".to_string(),
            Target::Gpu(gpu) => match &gpu.adapter_info {
                Some(info) => format!("{} ({:?})", info.name, info.backend),
                None => "GPU".to_string(),
            },
        }
    }

    pub fn device(&self) -> Result<&Arc<wgpu::Device>> {
        Ok(&self.gpu_device()?.device)
    }

    pub fn queue(&self) -> Result<&Arc<wgpu::Queue>> {
        Ok(&self.gpu_device()?.queue)
    }

    /// The kernel cache owned by this context.
    pub fn program_cache(&self) -> Result<&ProgramCache<Program>> {
        Ok(&self.gpu_device()?.programs)
    }

    /// Fetch the program for `key`, compiling `source` on first use.
    pub fn get_program(&self, key: &ProgramKey, source: &str) -> Result<Arc<Program>> {
        let gpu = self.gpu_device()?;
        gpu.programs
            .get_or_compile(key, |k| Program::compile(&gpu.device, k, source))
    }

    fn gpu_device(&self) -> Result<&GpuDevice> {
        match &*self.inner {
            Target::Gpu(gpu) => Ok(gpu),
            Target::Cpu => Err(Error::Validation(
                "GPU resources requested from a CPU context".to_string(),
            )),
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context").field("target", &self.name()).finish()
    }
}

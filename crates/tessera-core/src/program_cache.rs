//! Specialized kernel compilation and caching.
//!
//! Kernels are WGSL sources parametrized through naga_oil shader defs. A
//! [`ProgramKey`] names the source plus the ordered list of specialization
//! values, and a [`ProgramCache`] compiles each distinct key exactly once for
//! the lifetime of the owning [`Context`](crate::Context).

use crate::{Error, Result};
use naga_oil::compose::{Composer, NagaModuleDescriptor, ShaderDefValue};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Kernel source identifier plus ordered specialization parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProgramKey {
    source_id: String,
    params: Vec<(String, i32)>,
}

impl ProgramKey {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            params: Vec::new(),
        }
    }

    /// Append a specialization parameter, or replace its value if already set.
    ///
    /// Parameter order is part of the key.
    pub fn param(mut self, name: &str, value: impl Into<i32>) -> Self {
        let value = value.into();
        match self.params.iter_mut().find(|(n, _)| n == name) {
            Some(slot) => slot.1 = value,
            None => self.params.push((name.to_string(), value)),
        }
        self
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn params(&self) -> &[(String, i32)] {
        &self.params
    }

    /// Canonical textual form, e.g. `sgemm[BIAS=1,BTRANS=1]`.
    pub fn label(&self) -> String {
        self.to_string()
    }

    fn shader_defs(&self) -> HashMap<String, ShaderDefValue> {
        self.params
            .iter()
            .map(|(name, value)| (name.clone(), ShaderDefValue::Int(*value)))
            .collect()
    }
}

impl fmt::Display for ProgramKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[", self.source_id)?;
        for (i, (name, value)) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{name}={value}")?;
        }
        write!(f, "]")
    }
}

/// Append-only cache of compiled artifacts keyed by [`ProgramKey`].
///
/// Generic over the artifact so that the keying and compile-once behavior can
/// be exercised with plain naga modules when no device is present.
pub struct ProgramCache<P> {
    entries: Mutex<HashMap<ProgramKey, Arc<P>>>,
    compiles: AtomicUsize,
}

impl<P> ProgramCache<P> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            compiles: AtomicUsize::new(0),
        }
    }

    /// Return the cached artifact for `key`, compiling it on first request.
    ///
    /// A failed compilation is returned unchanged and nothing is cached.
    pub fn get_or_compile<F>(&self, key: &ProgramKey, compile: F) -> Result<Arc<P>>
    where
        F: FnOnce(&ProgramKey) -> Result<P>,
    {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| Error::Device("program cache lock poisoned".to_string()))?;

        if let Some(program) = entries.get(key) {
            return Ok(Arc::clone(program));
        }

        tracing::debug!(key = %key, "compiling program");
        let program = Arc::new(compile(key)?);
        self.compiles.fetch_add(1, Ordering::Relaxed);
        entries.insert(key.clone(), Arc::clone(&program));
        Ok(program)
    }

    /// Number of compilations performed so far.
    pub fn compile_count(&self) -> usize {
        self.compiles.load(Ordering::Relaxed)
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<P> Default for ProgramCache<P> {
    fn default() -> Self {
        Self::new()
    }
}

/// Preprocess `source` with the key's params and parse it into a naga module.
pub fn compose_module(key: &ProgramKey, source: &str) -> Result<naga::Module> {
    let mut composer = Composer::default();
    let file_path = format!("{}.wgsl", key.source_id());

    composer
        .make_naga_module(NagaModuleDescriptor {
            source,
            file_path: &file_path,
            shader_defs: key.shader_defs(),
            ..Default::default()
        })
        .map_err(|e| {
            Error::ShaderCompilation(format!("Shader compilation failed for '{key}': {e}"))
        })
}

/// A compiled compute pipeline ready to launch.
#[derive(Debug)]
pub struct Program {
    label: String,
    pipeline: wgpu::ComputePipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    bindings: Vec<u32>,
}

impl Program {
    /// Entry point every kernel source exposes.
    pub const ENTRY_POINT: &'static str = "main";

    /// Compose `source` for `key` and build its pipeline on `device`.
    pub fn compile(device: &wgpu::Device, key: &ProgramKey, source: &str) -> Result<Self> {
        let label = key.label();
        let module = compose_module(key, source)?;
        let entries = bind_group_layout_entries(&module);
        let bindings = entries.iter().map(|e| e.binding).collect();

        let shader_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(&label),
            source: wgpu::ShaderSource::Naga(Cow::Owned(module)),
        });

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some(&format!("{label}_layout")),
            entries: &entries,
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(&format!("{label}_pipeline_layout")),
            bind_group_layouts: &[&bind_group_layout],
            immediate_size: 0,
        });

        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(&label),
            layout: Some(&pipeline_layout),
            module: &shader_module,
            entry_point: Some(Self::ENTRY_POINT),
            compilation_options: Default::default(),
            cache: None,
        });

        Ok(Self {
            label,
            pipeline,
            bind_group_layout,
            bindings,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn pipeline(&self) -> &wgpu::ComputePipeline {
        &self.pipeline
    }

    /// Build a bind group from buffers listed in binding order.
    pub fn bind(&self, device: &wgpu::Device, buffers: &[&wgpu::Buffer]) -> Result<wgpu::BindGroup> {
        if buffers.len() != self.bindings.len() {
            return Err(Error::Validation(format!(
                "Program '{}' expects {} bindings, got {}",
                self.label,
                self.bindings.len(),
                buffers.len()
            )));
        }

        let entries: Vec<_> = self
            .bindings
            .iter()
            .zip(buffers)
            .map(|(&binding, buffer)| wgpu::BindGroupEntry {
                binding,
                resource: buffer.as_entire_binding(),
            })
            .collect();

        Ok(device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(&format!("{}_bind_group", self.label)),
            layout: &self.bind_group_layout,
            entries: &entries,
        }))
    }
}

/// Derive bind group layout entries from the module's bound globals.
fn bind_group_layout_entries(module: &naga::Module) -> Vec<wgpu::BindGroupLayoutEntry> {
    let mut entries: Vec<_> = module
        .global_variables
        .iter()
        .filter_map(|(_, var)| {
            let binding = var.binding.as_ref()?;
            let ty = match var.space {
                naga::AddressSpace::Uniform => wgpu::BufferBindingType::Uniform,
                naga::AddressSpace::Storage { access } => wgpu::BufferBindingType::Storage {
                    read_only: !access.contains(naga::StorageAccess::STORE),
                },
                _ => return None,
            };
            Some(wgpu::BindGroupLayoutEntry {
                binding: binding.binding,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            })
        })
        .collect();

    entries.sort_by_key(|e| e.binding);
    entries
}

//! Core tensor model, device context, and operator contract for Tessera.
//!
//! This crate provides the foundational abstractions the operator crates build on:
//! - Shapes and tensor specifications (`Shape`, `TensorSpecs`, `DataType`)
//! - Host- or device-resident tensors (`Tensor`, `DeviceView`)
//! - CPU/GPU execution context owning the kernel cache (`Context`)
//! - Specialized kernel compilation and caching (`ProgramCache`, `ProgramKey`)
//! - Ordered device work submission (`ExecutionContext`, `Event`)
//! - The operator contract and its registry (`Operator`, `OperatorRegistry`)

pub mod config;
pub mod context;
pub mod execution;
pub mod operator;
pub mod program_cache;
pub mod registry;
pub mod tensor;
pub mod types;

// Re-export commonly used types
pub use config::{Activation, get_1d_nd};
pub use context::Context;
pub use execution::{Event, ExecutionContext, KernelLaunch};
pub use operator::{Operator, OperatorSetup, OperatorState, ParameterStore};
pub use program_cache::{Program, ProgramCache, ProgramKey, compose_module};
pub use registry::OperatorRegistry;
pub use tensor::{DeviceView, Tensor};
pub use types::{DataType, Shape, TensorSpecs};

/// Result type using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for tessera operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Bad configuration, shape, or call precondition.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A contract method the operator intentionally does not provide.
    #[error("Not implemented: {0}")]
    NotImplemented(String),

    #[error("Shader compilation error: {0}")]
    ShaderCompilation(String),

    #[error("Device error: {0}")]
    Device(String),

    #[error("Buffer async error: {0}")]
    BufferAsync(#[from] wgpu::BufferAsyncError),
}

impl Error {
    pub fn is_validation(&self) -> bool {
        matches!(self, Error::Validation(_))
    }

    pub fn is_not_implemented(&self) -> bool {
        matches!(self, Error::NotImplemented(_))
    }
}

/// Return a [`Error::Validation`] unless `cond` holds.
///
/// ```ignore
/// ensure!(in.rank() == 4, "expected 4D input, got {}", in);
/// ```
#[macro_export]
macro_rules! ensure {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            return Err($crate::Error::Validation(format!($($arg)+)));
        }
    };
}

//! Operator implementations for Tessera.
//!
//! # Operators
//!
//! - [`Convolution2D`]: im2col plus tiled matrix multiply, with fused bias and
//!   activation, on host (`matrixmultiply`) or device (wgpu)
//! - [`BWBias`]: bias-gradient reduction over batch and spatial positions
//!
//! Both pick their backend once, at construction, from the kind of
//! [`Context`](tessera_core::Context) they are given.

pub mod activation;
pub mod bwd_bias;
pub mod conv2d;
pub mod kernels;

mod registry;

pub use activation::apply_activation;
pub use bwd_bias::BWBias;
pub use conv2d::{Convolution2D, Convolution2DConfig, output_extent};
pub use kernels::kernel_source;
pub use registry::core_operator_registry;

//! Core operator registry.
//!
//! Provides a pre-populated registry with the operators this crate builds
//! through the generic create-by-name path.

use tessera_core::{Operator, OperatorRegistry};

use crate::conv2d::{Convolution2D, Convolution2DConfig};

/// Returns an operator registry pre-populated with the core operators.
///
/// The registry includes:
/// - Convolution2D
///
/// `BWBias` is a building block for other operators' backward passes and is
/// constructed directly rather than by name.
pub fn core_operator_registry() -> OperatorRegistry {
    let mut registry = OperatorRegistry::new();

    registry.register("Convolution2D", |ctx, config, dtype| {
        let config = Convolution2DConfig::from_json(config)?;
        let op: Box<dyn Operator> = Box::new(Convolution2D::new(ctx, config, dtype)?);
        Ok(op)
    });

    registry
}

//! Operator registry for construction by name.

use crate::context::Context;
use crate::operator::Operator;
use crate::types::DataType;
use crate::{Error, Result};
use serde_json::Value;
use std::collections::HashMap;

/// Constructor stored in the registry.
pub type OperatorConstructor =
    Box<dyn Fn(&Context, &Value, DataType) -> Result<Box<dyn Operator>> + Send + Sync>;

/// Registry of operator constructors.
///
/// Maps operator type names (e.g., "Convolution2D") to closures that build a
/// configured operator from a structured config value.
///
/// # Example
///
/// ```ignore
/// let mut registry = OperatorRegistry::new();
/// registry.register("Convolution2D", |ctx, cfg, dtype| {
///     let config = Convolution2DConfig::from_json(cfg)?;
///     Ok(Box::new(Convolution2D::new(ctx, config, dtype)?))
/// });
///
/// let conv = registry.create(&ctx, "Convolution2D", &config, DataType::F32)?;
/// ```
pub struct OperatorRegistry {
    constructors: HashMap<String, OperatorConstructor>,
}

impl OperatorRegistry {
    /// Create a new empty operator registry.
    pub fn new() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// Register a constructor under `name`, replacing any previous one.
    ///
    /// Returns `self` for method chaining.
    pub fn register<F>(&mut self, name: &str, constructor: F) -> &mut Self
    where
        F: Fn(&Context, &Value, DataType) -> Result<Box<dyn Operator>> + Send + Sync + 'static,
    {
        self.constructors
            .insert(name.to_string(), Box::new(constructor));
        self
    }

    /// Build the operator registered under `name`.
    ///
    /// # Errors
    /// Returns [`Error::Validation`] for an unknown name, or whatever the
    /// constructor reports for a bad config.
    pub fn create(
        &self,
        ctx: &Context,
        name: &str,
        config: &Value,
        dtype: DataType,
    ) -> Result<Box<dyn Operator>> {
        let constructor = self
            .constructors
            .get(name)
            .ok_or_else(|| Error::Validation(format!("Unknown operator {name}")))?;
        constructor(ctx, config, dtype)
    }

    /// Check if an operator is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.constructors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constructors.is_empty()
    }

    /// Iterate over all registered operator names.
    pub fn operator_names(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(|s| s.as_str())
    }
}

impl Default for OperatorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

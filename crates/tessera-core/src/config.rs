//! Helpers for reading operator configuration from structured values.

use crate::{Error, Result};
use serde_json::Value;
use std::fmt;

/// Elementwise activation fused into an operator's output.
///
/// The discriminant is the value kernels are specialized with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Activation {
    #[default]
    Identity = 0,
    Relu = 1,
    Tanh = 2,
    Sigmoid = 3,
    Relu6 = 4,
}

impl Activation {
    /// Parse an activation name.
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "identity" => Ok(Activation::Identity),
            "relu" => Ok(Activation::Relu),
            "tanh" => Ok(Activation::Tanh),
            "sigmoid" => Ok(Activation::Sigmoid),
            "relu6" => Ok(Activation::Relu6),
            other => Err(Error::Validation(format!("Unknown activation '{other}'"))),
        }
    }

    /// Read the optional `"activation"` field of an operator config.
    pub fn from_json(value: &Value) -> Result<Self> {
        match value.get("activation") {
            None | Some(Value::Null) => Ok(Activation::Identity),
            Some(Value::String(name)) => Self::parse(name),
            Some(other) => Err(Error::Validation(format!(
                "Field 'activation' must be a string, got {other}"
            ))),
        }
    }

    /// Kernel specialization value.
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn name(self) -> &'static str {
        match self {
            Activation::Identity => "identity",
            Activation::Relu => "relu",
            Activation::Tanh => "tanh",
            Activation::Sigmoid => "sigmoid",
            Activation::Relu6 => "relu6",
        }
    }
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Read a per-axis pair from `value[name]`.
///
/// A scalar is broadcast to both axes, a two-element array gives one value per
/// axis. A missing field yields `default`, or fails if `required`.
pub fn get_1d_nd(value: &Value, name: &str, default: [i64; 2], required: bool) -> Result<[i64; 2]> {
    match value.get(name) {
        None | Some(Value::Null) if required => Err(Error::Validation(format!(
            "Missing required field '{name}'"
        ))),
        None | Some(Value::Null) => Ok(default),
        Some(Value::Number(n)) => {
            let v = as_int(n, name)?;
            Ok([v, v])
        }
        Some(Value::Array(items)) if items.len() == 2 => {
            let mut out = [0i64; 2];
            for (slot, item) in out.iter_mut().zip(items) {
                *slot = match item {
                    Value::Number(n) => as_int(n, name)?,
                    other => {
                        return Err(Error::Validation(format!(
                            "Field '{name}' must contain integers, got {other}"
                        )));
                    }
                };
            }
            Ok(out)
        }
        Some(other) => Err(Error::Validation(format!(
            "Field '{name}' must be an integer or a pair of integers, got {other}"
        ))),
    }
}

/// Read an optional integer field.
pub fn get_int(value: &Value, name: &str, default: i64) -> Result<i64> {
    match value.get(name) {
        None | Some(Value::Null) => Ok(default),
        Some(Value::Number(n)) => as_int(n, name),
        Some(other) => Err(Error::Validation(format!(
            "Field '{name}' must be an integer, got {other}"
        ))),
    }
}

/// Read a required integer field.
pub fn require_int(value: &Value, name: &str) -> Result<i64> {
    match value.get(name) {
        None | Some(Value::Null) => Err(Error::Validation(format!(
            "Missing required field '{name}'"
        ))),
        Some(_) => get_int(value, name, 0),
    }
}

/// Read an optional boolean field.
pub fn get_bool(value: &Value, name: &str, default: bool) -> Result<bool> {
    match value.get(name) {
        None | Some(Value::Null) => Ok(default),
        Some(Value::Bool(b)) => Ok(*b),
        Some(other) => Err(Error::Validation(format!(
            "Field '{name}' must be a boolean, got {other}"
        ))),
    }
}

fn as_int(n: &serde_json::Number, name: &str) -> Result<i64> {
    n.as_i64()
        .ok_or_else(|| Error::Validation(format!("Field '{name}' must be an integer, got {n}")))
}

//! Core types for tensor shapes and element types.

use std::fmt;
use std::ops::Index;

/// Tensor element type.
///
/// Kernels and CPU routines operate on `F32` only; the other variants exist so
/// that specs arriving from a graph description can be rejected with a clear
/// error instead of being misread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    F32,
    F16,
    I32,
}

impl DataType {
    /// Size of one element in bytes.
    pub fn size(&self) -> usize {
        match self {
            DataType::F32 | DataType::I32 => 4,
            DataType::F16 => 2,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::F32 => "float32",
            DataType::F16 => "float16",
            DataType::I32 => "int32",
        };
        f.write_str(name)
    }
}

/// Ordered tensor dimensions; index 0 is the batch dimension.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Shape(Vec<usize>);

impl Shape {
    pub fn new(dims: impl Into<Vec<usize>>) -> Self {
        Self(dims.into())
    }

    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    /// Number of dimensions.
    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Product of all dimensions (1 for a scalar shape).
    pub fn total_size(&self) -> usize {
        self.0.iter().product()
    }

    /// Product of all dimensions except the batch dimension.
    pub fn size_no_batch(&self) -> usize {
        self.0.iter().skip(1).product()
    }
}

impl Index<usize> for Shape {
    type Output = usize;

    fn index(&self, index: usize) -> &usize {
        &self.0[index]
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(dims: [usize; N]) -> Self {
        Self(dims.to_vec())
    }
}

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self {
        Self(dims)
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Self(dims.to_vec())
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{d}")?;
        }
        write!(f, ")")
    }
}

/// Shape and element type of a tensor, without storage.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TensorSpecs {
    shape: Shape,
    dtype: DataType,
}

impl TensorSpecs {
    pub fn new(shape: impl Into<Shape>, dtype: DataType) -> Self {
        Self {
            shape: shape.into(),
            dtype,
        }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    /// Storage needed for a tensor with these specs, in bytes.
    pub fn memory_size(&self) -> usize {
        self.shape.total_size() * self.dtype.size()
    }
}

impl fmt::Display for TensorSpecs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.shape, self.dtype)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_sizes() {
        let shape = Shape::from([2, 3, 8, 8]);
        assert_eq!(shape.rank(), 4);
        assert_eq!(shape.total_size(), 384);
        assert_eq!(shape.size_no_batch(), 192);
        assert_eq!(shape[1], 3);
    }

    #[test]
    fn test_shape_single_dim() {
        let shape = Shape::from([5]);
        assert_eq!(shape.total_size(), 5);
        assert_eq!(shape.size_no_batch(), 1);
    }

    #[test]
    fn test_shape_display() {
        assert_eq!(Shape::from([2, 4, 6]).to_string(), "(2,4,6)");
        assert_eq!(Shape::default().to_string(), "()");
    }

    #[test]
    fn test_specs_memory_size() {
        let specs = TensorSpecs::new([4, 3, 3, 3], DataType::F32);
        assert_eq!(specs.memory_size(), 4 * 27 * 4);
        assert_eq!(specs.to_string(), "(4,3,3,3):float32");

        let half = TensorSpecs::new([10], DataType::F16);
        assert_eq!(half.memory_size(), 20);
    }
}

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    F32,
    F64,
    F16,
    I8,
    I32,
    I64,
    U8,
    Bool,
}

impl DType {
    pub fn byte_size(self) -> usize {
        match self {
            DType::F64 | DType::I64 => 8,
            DType::F32 | DType::I32 => 4,
            DType::F16 => 2,
            DType::I8 | DType::U8 | DType::Bool => 1,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, DType::F32 | DType::F64 | DType::F16)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DType::F32 => "float32",
            DType::F64 => "float64",
            DType::F16 => "float16",
            DType::I8 => "int8",
            DType::I32 => "int32",
            DType::I64 => "int64",
            DType::U8 => "uint8",
            DType::Bool => "bool",
        };
        f.write_str(s)
    }
}

/// A single dimension of a tensor shape.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dim {
    Fixed(usize),
    /// Named dynamic dimension, e.g. `batch`.
    Symbolic(String),
    Unknown,
}

impl Dim {
    pub fn fixed(&self) -> Option<usize> {
        match self {
            Dim::Fixed(n) => Some(*n),
            _ => None,
        }
    }
}

impl From<usize> for Dim {
    fn from(n: usize) -> Self {
        Dim::Fixed(n)
    }
}

impl fmt::Display for Dim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dim::Fixed(n) => write!(f, "{n}"),
            Dim::Symbolic(name) => f.write_str(name),
            Dim::Unknown => f.write_str("?"),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape(pub SmallVec<[Dim; 6]>);

impl Shape {
    pub fn from_slice(d: &[usize]) -> Self {
        Self(d.iter().copied().map(Dim::Fixed).collect())
    }

    pub fn from_dims(dims: impl IntoIterator<Item = Dim>) -> Self {
        Self(dims.into_iter().collect())
    }

    pub fn scalar() -> Self {
        Self(SmallVec::new())
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    pub fn dims(&self) -> &[Dim] {
        &self.0
    }

    /// Concrete sizes, if every dimension is fixed.
    pub fn concrete(&self) -> Option<Vec<usize>> {
        self.0.iter().map(Dim::fixed).collect()
    }

    /// Element count; `None` when a dimension is not fixed or the product overflows.
    pub fn numel(&self) -> Option<usize> {
        self.0
            .iter()
            .try_fold(1usize, |acc, d| acc.checked_mul(d.fixed()?))
    }
}

/// Product of `dims`, or `None` on overflow.
pub fn checked_numel(dims: &[usize]) -> Option<usize> {
    dims.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d))
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{d}")?;
        }
        f.write_str("]")
    }
}

/// Name, element type and shape of a tensor in a graph.
///
/// Either half of the type may be missing when the source graph does not
/// declare it and it cannot be inferred.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorDescriptor {
    pub name: String,
    pub dtype: Option<DType>,
    pub shape: Option<Shape>,
}

impl TensorDescriptor {
    pub fn new(name: impl Into<String>, dtype: DType, shape: Shape) -> Self {
        Self {
            name: name.into(),
            dtype: Some(dtype),
            shape: Some(shape),
        }
    }

    pub fn untyped(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dtype: None,
            shape: None,
        }
    }
}

/// Concrete tensor contents, stored as little-endian bytes.
#[derive(Clone, Debug, PartialEq)]
pub struct TensorValue {
    pub dtype: DType,
    pub dims: SmallVec<[usize; 6]>,
    pub bytes: Bytes,
}

impl TensorValue {
    pub fn from_bytes(dtype: DType, dims: &[usize], bytes: Bytes) -> Result<Self> {
        let expected = checked_numel(dims)
            .and_then(|n| n.checked_mul(dtype.byte_size()))
            .ok_or_else(|| {
                Error::InvalidModel(format!("tensor dims {dims:?} overflow the address space"))
            })?;
        if bytes.len() != expected {
            return Err(Error::InvalidModel(format!(
                "tensor byte size mismatch: got {}, expected {expected}",
                bytes.len()
            )));
        }
        Ok(Self {
            dtype,
            dims: dims.iter().copied().collect(),
            bytes,
        })
    }

    pub fn from_f32(dims: &[usize], data: &[f32]) -> Result<Self> {
        let bytes: Vec<u8> = data.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::from_bytes(DType::F32, dims, Bytes::from(bytes))
    }

    pub fn from_i64(dims: &[usize], data: &[i64]) -> Result<Self> {
        let bytes: Vec<u8> = data.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::from_bytes(DType::I64, dims, Bytes::from(bytes))
    }

    pub fn shape(&self) -> Shape {
        Shape::from_slice(&self.dims)
    }

    pub fn numel(&self) -> usize {
        self.dims.iter().product()
    }

    /// Decodes an integer tensor (I32 or I64) into i64 values.
    pub fn to_i64_vec(&self) -> Result<Vec<i64>> {
        match self.dtype {
            DType::I64 => Ok(self
                .bytes
                .chunks_exact(8)
                .map(|b| i64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
                .collect()),
            DType::I32 => Ok(self
                .bytes
                .chunks_exact(4)
                .map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]) as i64)
                .collect()),
            other => Err(Error::InvalidModel(format!(
                "expected an integer tensor, got {other}"
            ))),
        }
    }

    pub fn to_f32_vec(&self) -> Result<Vec<f32>> {
        if self.dtype != DType::F32 {
            return Err(Error::InvalidModel(format!(
                "expected a float32 tensor, got {}",
                self.dtype
            )));
        }
        Ok(self
            .bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_display_mixes_dim_kinds() {
        let shape = Shape::from_dims([Dim::Symbolic("batch".into()), Dim::Fixed(784), Dim::Unknown]);
        assert_eq!(shape.to_string(), "[batch,784,?]");
        assert_eq!(shape.concrete(), None);
    }

    #[test]
    fn value_rejects_wrong_byte_len() {
        let err = TensorValue::from_bytes(DType::F32, &[2, 2], Bytes::from(vec![0u8; 12]));
        assert!(err.is_err());
    }

    #[test]
    fn oversized_dims_are_invalid_not_a_panic() {
        let err = TensorValue::from_bytes(DType::F32, &[1 << 40, 1 << 40], Bytes::from(vec![0u8; 4]));
        assert!(matches!(err, Err(Error::InvalidModel(_))));
        assert_eq!(Shape::from_slice(&[1 << 40, 1 << 40]).numel(), None);
        assert_eq!(Shape::from_slice(&[2, 3]).numel(), Some(6));
    }

    #[test]
    fn i64_values_decode() {
        let v = TensorValue::from_i64(&[3], &[1, -1, 784]).unwrap();
        assert_eq!(v.to_i64_vec().unwrap(), vec![1, -1, 784]);
    }
}

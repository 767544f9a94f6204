//! Host-side dense tensors with a runtime element type.
//!
//! Tensors are stored as native-endian bytes so they can be handed to the
//! staging buffers without conversion. `DataType` mirrors the runtime's
//! element type enumeration (raw codes 0..=4).

use std::fmt;

use half::f16;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Element type of a binding or tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Float,
    Half,
    Int8,
    Int32,
    Bool,
}

impl DataType {
    /// Maps the runtime's raw element type code.
    pub fn from_raw(code: i32) -> Option<Self> {
        match code {
            0 => Some(DataType::Float),
            1 => Some(DataType::Half),
            2 => Some(DataType::Int8),
            3 => Some(DataType::Int32),
            4 => Some(DataType::Bool),
            _ => None,
        }
    }

    pub fn raw(self) -> i32 {
        match self {
            DataType::Float => 0,
            DataType::Half => 1,
            DataType::Int8 => 2,
            DataType::Int32 => 3,
            DataType::Bool => 4,
        }
    }

    /// Size of one element in bytes.
    pub fn size(self) -> usize {
        match self {
            DataType::Float | DataType::Int32 => 4,
            DataType::Half => 2,
            DataType::Int8 | DataType::Bool => 1,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DataType::Float => "float32",
            DataType::Half => "float16",
            DataType::Int8 => "int8",
            DataType::Int32 => "int32",
            DataType::Bool => "bool",
        }
    }

    /// Encodes `values` into this element type, appending to `out`.
    pub fn encode_into(self, values: &[f32], out: &mut Vec<u8>) {
        out.reserve(values.len() * self.size());
        for &v in values {
            match self {
                DataType::Float => out.extend_from_slice(&v.to_ne_bytes()),
                DataType::Half => out.extend_from_slice(&f16::from_f32(v).to_ne_bytes()),
                DataType::Int8 => out.push((v.round().clamp(-128.0, 127.0) as i8) as u8),
                DataType::Int32 => out.extend_from_slice(&(v.round() as i32).to_ne_bytes()),
                DataType::Bool => out.push(u8::from(v != 0.0)),
            }
        }
    }

    /// Decodes bytes of this element type into f32 values.
    pub fn decode(self, bytes: &[u8]) -> Vec<f32> {
        match self {
            DataType::Float => bytes
                .chunks_exact(4)
                .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
            DataType::Half => bytes
                .chunks_exact(2)
                .map(|c| f16::from_ne_bytes([c[0], c[1]]).to_f32())
                .collect(),
            DataType::Int8 => bytes.iter().map(|&b| b as i8 as f32).collect(),
            DataType::Int32 => bytes
                .chunks_exact(4)
                .map(|c| i32::from_ne_bytes([c[0], c[1], c[2], c[3]]) as f32)
                .collect(),
            DataType::Bool => bytes.iter().map(|&b| if b != 0 { 1.0 } else { 0.0 }).collect(),
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Tensor dimensions, outermost first.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Shape(Vec<usize>);

impl Shape {
    pub fn new(dims: impl Into<Vec<usize>>) -> Self {
        Shape(dims.into())
    }

    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    /// Number of elements; 1 for a rank-0 shape.
    pub fn volume(&self) -> usize {
        self.0.iter().product()
    }

    /// Prepends a batch dimension.
    pub fn batched(&self, n: usize) -> Shape {
        let mut dims = Vec::with_capacity(self.0.len() + 1);
        dims.push(n);
        dims.extend_from_slice(&self.0);
        Shape(dims)
    }

    /// Splits off the leading dimension, if any.
    pub fn split_batch(&self) -> Option<(usize, Shape)> {
        let (&n, rest) = self.0.split_first()?;
        Some((n, Shape(rest.to_vec())))
    }
}

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self {
        Shape(dims)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("scalar");
        }
        let dims: Vec<String> = self.0.iter().map(|d| d.to_string()).collect();
        f.write_str(&dims.join("x"))
    }
}

/// Dense host tensor. For batches the leading dimension is the sample count.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    dtype: DataType,
    shape: Shape,
    data: Vec<u8>,
}

impl Tensor {
    /// Wraps raw bytes; the length must match `shape` and `dtype` exactly.
    pub fn from_bytes(dtype: DataType, shape: impl Into<Shape>, data: Vec<u8>) -> Result<Self> {
        let shape = shape.into();
        let expected = shape.volume() * dtype.size();
        if data.len() != expected {
            return Err(EngineError::mismatch(
                format!("{} bytes for {}[{}]", expected, dtype, shape),
                format!("{} bytes", data.len()),
            ));
        }
        Ok(Self { dtype, shape, data })
    }

    pub fn zeros(dtype: DataType, shape: impl Into<Shape>) -> Self {
        let shape = shape.into();
        let data = vec![0u8; shape.volume() * dtype.size()];
        Self { dtype, shape, data }
    }

    /// Builds a tensor of `dtype` from f32 values, converting each element.
    pub fn from_f32(dtype: DataType, shape: impl Into<Shape>, values: &[f32]) -> Result<Self> {
        let shape = shape.into();
        if values.len() != shape.volume() {
            return Err(EngineError::mismatch(
                format!("{} elements for shape {}", shape.volume(), shape),
                format!("{} elements", values.len()),
            ));
        }
        let mut data = Vec::new();
        dtype.encode_into(values, &mut data);
        Ok(Self { dtype, shape, data })
    }

    pub fn to_f32_vec(&self) -> Vec<f32> {
        self.dtype.decode(&self.data)
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Leading dimension; 0 for a rank-0 tensor.
    pub fn len(&self) -> usize {
        self.shape.dims().first().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes of sample `index` along the leading dimension.
    pub fn sample_bytes(&self, index: usize) -> Option<&[u8]> {
        let (n, rest) = self.shape.split_batch()?;
        if index >= n {
            return None;
        }
        let stride = rest.volume() * self.dtype.size();
        Some(&self.data[index * stride..(index + 1) * stride])
    }

    /// Copies sample `index` out as its own tensor.
    pub fn sample(&self, index: usize) -> Option<Tensor> {
        let bytes = self.sample_bytes(index)?.to_vec();
        let (_, rest) = self.shape.split_batch()?;
        Some(Tensor {
            dtype: self.dtype,
            shape: rest,
            data: bytes,
        })
    }

    /// Short `dtype[shape]` description used in error messages.
    pub fn signature(&self) -> String {
        format!("{}[{}]", self.dtype, self.shape)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_codes_match_runtime_enumeration() {
        for code in 0..=4 {
            let dtype = DataType::from_raw(code).unwrap();
            assert_eq!(dtype.raw(), code);
        }
        assert_eq!(DataType::from_raw(5), None);
        assert_eq!(DataType::Half.size(), 2);
        assert_eq!(DataType::Int32.size(), 4);
    }

    #[test]
    fn half_values_survive_encoding() {
        let t = Tensor::from_f32(DataType::Half, vec![2, 2], &[0.5, -1.0, 2.0, 0.25]).unwrap();
        assert_eq!(t.as_bytes().len(), 8);
        assert_eq!(t.to_f32_vec(), vec![0.5, -1.0, 2.0, 0.25]);
    }

    #[test]
    fn int8_saturates() {
        let t = Tensor::from_f32(DataType::Int8, vec![3], &[300.0, -300.0, 4.4]).unwrap();
        assert_eq!(t.to_f32_vec(), vec![127.0, -128.0, 4.0]);
    }

    #[test]
    fn from_bytes_rejects_wrong_length() {
        let err = Tensor::from_bytes(DataType::Float, vec![2, 3], vec![0; 20]).unwrap_err();
        assert!(matches!(err, EngineError::InputMismatch { .. }));
    }

    #[test]
    fn samples_split_along_leading_dimension() {
        let values: Vec<f32> = (0..6).map(|v| v as f32).collect();
        let t = Tensor::from_f32(DataType::Float, vec![3, 2], &values).unwrap();
        assert_eq!(t.len(), 3);
        let second = t.sample(1).unwrap();
        assert_eq!(second.shape().dims(), &[2]);
        assert_eq!(second.to_f32_vec(), vec![2.0, 3.0]);
        assert!(t.sample(3).is_none());
    }

    #[test]
    fn shape_display_and_batching() {
        let s = Shape::new(vec![3, 32, 32]);
        assert_eq!(s.to_string(), "3x32x32");
        assert_eq!(s.volume(), 3072);
        assert_eq!(s.batched(8).dims(), &[8, 3, 32, 32]);
        assert_eq!(Shape::default().to_string(), "scalar");
        assert_eq!(Shape::default().volume(), 1);
    }
}

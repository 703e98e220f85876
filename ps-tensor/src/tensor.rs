//! Dense and COO tensor representations.
//!
//! Grounded in `original_source/kraken/t/tensor_impl.cc`'s split between a
//! dense backing store and a COO (indices/values/shape) sparse view, and in
//! the optimizer update loops (`original_source/kraken/ps/optim/*.cc`), which
//! uniformly densify a COO gradient before applying it.

use serde::{Deserialize, Serialize};

/// The element type of a tensor's storage.
///
/// Only `F32` is backed by real arithmetic; the others exist so the wire
/// codec can round-trip a `TableMetaData.element_type` byte it doesn't
/// itself need to compute on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ElementType {
    F32 = 0,
    F64 = 1,
    I32 = 2,
    I64 = 3,
}

impl ElementType {
    /// Width in bytes of a single element, used when computing a dense
    /// tensor's raw byte length for the wire codec.
    pub fn byte_width(self) -> usize {
        match self {
            ElementType::F32 | ElementType::I32 => 4,
            ElementType::F64 | ElementType::I64 => 8,
        }
    }
}

/// A dense tensor: a shape plus a flat row-major `f32` backing buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenseTensor {
    pub shape: Vec<i64>,
    pub dtype: ElementType,
    pub data: Vec<f32>,
}

impl DenseTensor {
    pub fn new(shape: Vec<i64>, dtype: ElementType, data: Vec<f32>) -> Self {
        debug_assert_eq!(
            shape.iter().product::<i64>() as usize,
            data.len(),
            "dense tensor data length must match shape"
        );
        DenseTensor { shape, dtype, data }
    }

    pub fn filled(shape: Vec<i64>, dtype: ElementType, value: f32) -> Self {
        let len = shape.iter().product::<i64>().max(0) as usize;
        DenseTensor {
            shape,
            dtype,
            data: vec![value; len],
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// A zero tensor with the same shape/dtype as `self`. Used by every
    /// optimizer to lazily allocate state vectors on first touch.
    pub fn zero_like(&self) -> DenseTensor {
        DenseTensor::filled(self.shape.clone(), self.dtype, 0.0)
    }

    pub fn square(&self) -> DenseTensor {
        self.map(|x| x * x)
    }

    pub fn sqrt(&self) -> DenseTensor {
        self.map(|x| x.sqrt())
    }

    /// Elementwise max of two same-shaped tensors.
    pub fn max(&self, other: &DenseTensor) -> DenseTensor {
        self.zip(other, f32::max)
    }

    pub fn add_scalar(&self, eps: f32) -> DenseTensor {
        self.map(|x| x + eps)
    }

    fn map(&self, f: impl Fn(f32) -> f32) -> DenseTensor {
        DenseTensor {
            shape: self.shape.clone(),
            dtype: self.dtype,
            data: self.data.iter().map(|&x| f(x)).collect(),
        }
    }

    fn zip(&self, other: &DenseTensor, f: impl Fn(f32, f32) -> f32) -> DenseTensor {
        debug_assert_eq!(self.shape, other.shape);
        DenseTensor {
            shape: self.shape.clone(),
            dtype: self.dtype,
            data: self
                .data
                .iter()
                .zip(other.data.iter())
                .map(|(&a, &b)| f(a, b))
                .collect(),
        }
    }
}

impl std::ops::Add for &DenseTensor {
    type Output = DenseTensor;
    fn add(self, rhs: &DenseTensor) -> DenseTensor {
        self.zip(rhs, |a, b| a + b)
    }
}

impl std::ops::AddAssign<&DenseTensor> for DenseTensor {
    fn add_assign(&mut self, rhs: &DenseTensor) {
        debug_assert_eq!(self.shape, rhs.shape);
        for (a, &b) in self.data.iter_mut().zip(rhs.data.iter()) {
            *a += b;
        }
    }
}

impl std::ops::Sub for &DenseTensor {
    type Output = DenseTensor;
    fn sub(self, rhs: &DenseTensor) -> DenseTensor {
        self.zip(rhs, |a, b| a - b)
    }
}

impl std::ops::SubAssign<&DenseTensor> for DenseTensor {
    fn sub_assign(&mut self, rhs: &DenseTensor) {
        debug_assert_eq!(self.shape, rhs.shape);
        for (a, &b) in self.data.iter_mut().zip(rhs.data.iter()) {
            *a -= b;
        }
    }
}

impl std::ops::Mul for &DenseTensor {
    type Output = DenseTensor;
    fn mul(self, rhs: &DenseTensor) -> DenseTensor {
        self.zip(rhs, |a, b| a * b)
    }
}

impl std::ops::Mul<f32> for &DenseTensor {
    type Output = DenseTensor;
    fn mul(self, rhs: f32) -> DenseTensor {
        self.map(|a| a * rhs)
    }
}

impl std::ops::Div for &DenseTensor {
    type Output = DenseTensor;
    fn div(self, rhs: &DenseTensor) -> DenseTensor {
        self.zip(rhs, |a, b| a / b)
    }
}

impl std::ops::Div<f32> for &DenseTensor {
    type Output = DenseTensor;
    fn div(self, rhs: f32) -> DenseTensor {
        self.map(|a| a / rhs)
    }
}

/// A sparse tensor in coordinate form: `indices` selects rows of the leading
/// dimension of `shape` that `values` (a dense tensor of shape
/// `[indices.len(), ..shape[1..]]`) supplies; every other row is implicitly
/// zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CooTensor {
    pub indices: Vec<i64>,
    pub values: DenseTensor,
    pub shape: Vec<i64>,
}

impl CooTensor {
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Scatter `values` rows into a zero tensor of `shape`, matching
    /// `Tensor::ToDense` in the original implementation.
    pub fn to_dense(&self) -> DenseTensor {
        let dtype = self.values.dtype;
        let row_len: i64 = self.shape.iter().skip(1).product();
        let row_len = row_len.max(1) as usize;
        let mut out = DenseTensor::filled(self.shape.clone(), dtype, 0.0);
        for (slot, &row_idx) in self.indices.iter().enumerate() {
            let dst_start = row_idx as usize * row_len;
            let src_start = slot * row_len;
            out.data[dst_start..dst_start + row_len]
                .copy_from_slice(&self.values.data[src_start..src_start + row_len]);
        }
        out
    }
}

/// Either representation a gradient or pushed/pulled value can take on the
/// wire. Optimizers only ever operate on the densified form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Tensor {
    Dense(DenseTensor),
    Coo(CooTensor),
}

impl Tensor {
    pub fn is_coo(&self) -> bool {
        matches!(self, Tensor::Coo(_))
    }

    pub fn is_empty_coo(&self) -> bool {
        matches!(self, Tensor::Coo(c) if c.is_empty())
    }

    /// Densify `self` if it's COO, matching `grad.IsCoo() -> grad.ToDense()`
    /// in every optimizer's `Update`.
    pub fn densify(&self) -> DenseTensor {
        match self {
            Tensor::Dense(d) => d.clone(),
            Tensor::Coo(c) => c.to_dense(),
        }
    }

    pub fn shape(&self) -> &[i64] {
        match self {
            Tensor::Dense(d) => &d.shape,
            Tensor::Coo(c) => &c.shape,
        }
    }

    pub fn dtype(&self) -> ElementType {
        match self {
            Tensor::Dense(d) => d.dtype,
            Tensor::Coo(c) => c.values.dtype,
        }
    }
}

impl From<DenseTensor> for Tensor {
    fn from(d: DenseTensor) -> Self {
        Tensor::Dense(d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coo_to_dense_scatters_rows() {
        let coo = CooTensor {
            indices: vec![2, 0],
            values: DenseTensor::new(vec![2, 2], ElementType::F32, vec![1.0, 1.0, 2.0, 2.0]),
            shape: vec![4, 2],
        };
        let dense = coo.to_dense();
        assert_eq!(dense.data, vec![2.0, 2.0, 0.0, 0.0, 1.0, 1.0, 0.0, 0.0]);
    }

    #[test]
    fn empty_coo_is_empty() {
        let coo = CooTensor {
            indices: vec![],
            values: DenseTensor::new(vec![0, 2], ElementType::F32, vec![]),
            shape: vec![4, 2],
        };
        assert!(coo.is_empty());
        assert!(Tensor::Coo(coo).is_empty_coo());
    }
}

//! Host tensors passed to and returned from fusions.
//!
//! A [`HostTensor`] is a strided view over flat `f64` storage. Values are
//! rounded to the tensor's dtype on construction, so a `Half` tensor only
//! ever holds representable halves. Strides are in elements and never
//! negative.

use fuser_dtype::DataType;
use fuser_ir::ConstValue;
use ndarray::{ArrayD, ArrayViewD, Dimension, IxDyn};
use snafu::ensure;

use crate::error::*;

#[derive(Debug, Clone, PartialEq)]
pub struct HostTensor {
    dtype: DataType,
    sizes: Vec<usize>,
    strides: Vec<i64>,
    storage: Vec<f64>,
}

impl HostTensor {
    /// Copy of `array`, keeping its memory order when it has one.
    pub fn from_array(dtype: DataType, array: ArrayViewD<'_, f64>) -> Self {
        let sizes = array.shape().to_vec();
        let positive = array.strides().iter().all(|&s| s >= 0);
        if positive && !array.is_empty() && let Some(memory) = array.as_slice_memory_order() {
            let strides = array.strides().iter().map(|&s| s as i64).collect();
            let storage = memory.iter().map(|&v| dtype.round(v)).collect();
            return Self { dtype, sizes, strides, storage };
        }
        let storage: Vec<f64> = array.iter().map(|&v| dtype.round(v)).collect();
        Self { dtype, strides: contiguous_strides(&sizes), sizes, storage }
    }

    /// Row-major tensor over `values`.
    pub fn from_vec(dtype: DataType, sizes: &[usize], values: Vec<f64>) -> Result<Self> {
        let numel: usize = sizes.iter().product();
        ensure!(
            numel == values.len(),
            ExecutionSnafu { reason: format!("{} values do not fill a tensor of sizes {sizes:?}", values.len()) }
        );
        let storage = values.into_iter().map(|v| dtype.round(v)).collect();
        Ok(Self { dtype, sizes: sizes.to_vec(), strides: contiguous_strides(sizes), storage })
    }

    /// Tensor over existing storage with explicit strides.
    ///
    /// Every element the strides reach must lie inside `storage`.
    pub fn strided(dtype: DataType, sizes: &[usize], strides: &[i64], storage: Vec<f64>) -> Result<Self> {
        ensure!(
            sizes.len() == strides.len(),
            ExecutionSnafu { reason: format!("sizes {sizes:?} and strides {strides:?} differ in rank") }
        );
        ensure!(
            strides.iter().all(|&s| s >= 0),
            ExecutionSnafu { reason: format!("negative strides {strides:?} are not supported") }
        );
        let span = required_len(sizes, strides);
        ensure!(
            span <= storage.len(),
            ExecutionSnafu { reason: format!("strides {strides:?} reach {span} elements, storage holds {}", storage.len()) }
        );
        let storage = storage.into_iter().map(|v| dtype.round(v)).collect();
        Ok(Self { dtype, sizes: sizes.to_vec(), strides: strides.to_vec(), storage })
    }

    pub fn zeros(dtype: DataType, sizes: &[usize]) -> Self {
        let numel = sizes.iter().product();
        Self { dtype, sizes: sizes.to_vec(), strides: contiguous_strides(sizes), storage: vec![0.0; numel] }
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn sizes(&self) -> &[usize] {
        &self.sizes
    }

    pub fn strides(&self) -> &[i64] {
        &self.strides
    }

    pub fn ndims(&self) -> usize {
        self.sizes.len()
    }

    pub fn numel(&self) -> usize {
        self.sizes.iter().product()
    }

    pub fn storage(&self) -> &[f64] {
        &self.storage
    }

    pub(crate) fn into_storage(self) -> Vec<f64> {
        self.storage
    }

    /// Element at a multi-dimensional index.
    pub fn get(&self, index: &[usize]) -> Option<f64> {
        if index.len() != self.sizes.len() || index.iter().zip(&self.sizes).any(|(&i, &s)| i >= s) {
            return None;
        }
        let offset: i64 = index.iter().zip(&self.strides).map(|(&i, &s)| i as i64 * s).sum();
        self.storage.get(offset as usize).copied()
    }

    /// Logical contents as a row-major array.
    pub fn to_array(&self) -> ArrayD<f64> {
        ArrayD::from_shape_fn(IxDyn(&self.sizes), |index| {
            let offset: i64 = (0..index.ndim()).map(|d| index[d] as i64 * self.strides[d]).sum();
            self.storage[offset as usize]
        })
    }

    /// Whether dimension `dim` can be folded into the one inside it.
    ///
    /// Size-one dimensions and empty tensors never constrain the layout.
    pub fn is_contiguous_at(&self, dim: usize) -> bool {
        if self.sizes[dim] <= 1 || self.numel() == 0 {
            return true;
        }
        let inner = (dim + 1..self.ndims()).find(|&d| self.sizes[d] > 1);
        let expected = inner.map_or(1, |inner| self.strides[inner] * self.sizes[inner] as i64);
        self.strides[dim] == expected
    }
}

/// Fingerprint of a scalar argument for the executor cache.
pub(crate) fn scalar_bits(value: ConstValue) -> (u8, u64) {
    match value {
        ConstValue::Bool(v) => (0, v as u64),
        ConstValue::Int(v) => (1, v as u64),
        ConstValue::Float(v) => (2, v.to_bits()),
    }
}

pub fn contiguous_strides(sizes: &[usize]) -> Vec<i64> {
    let mut strides = vec![1i64; sizes.len()];
    for i in (0..sizes.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * sizes[i + 1].max(1) as i64;
    }
    strides
}

/// Elements of storage a strided layout touches.
pub fn required_len(sizes: &[usize], strides: &[i64]) -> usize {
    if sizes.contains(&0) {
        return 0;
    }
    let last: i64 = sizes.iter().zip(strides).map(|(&n, &s)| (n as i64 - 1) * s).sum();
    last as usize + 1
}

/// A runtime argument of a fusion.
#[derive(Debug, Clone, PartialEq)]
pub enum Argument {
    Tensor(HostTensor),
    Scalar(ConstValue),
}

impl From<HostTensor> for Argument {
    fn from(tensor: HostTensor) -> Self {
        Argument::Tensor(tensor)
    }
}

impl From<ConstValue> for Argument {
    fn from(value: ConstValue) -> Self {
        Argument::Scalar(value)
    }
}

impl From<f64> for Argument {
    fn from(value: f64) -> Self {
        Argument::Scalar(ConstValue::Float(value))
    }
}

impl From<i64> for Argument {
    fn from(value: i64) -> Self {
        Argument::Scalar(ConstValue::Int(value))
    }
}

impl Argument {
    pub fn as_tensor(&self) -> Option<&HostTensor> {
        match self {
            Argument::Tensor(t) => Some(t),
            Argument::Scalar(_) => None,
        }
    }

    /// Shape of the argument as schedulers see it.
    pub fn arg_info(&self) -> fuser_schedule::ArgInfo {
        match self {
            Argument::Tensor(t) => fuser_schedule::ArgInfo::Tensor {
                dtype: t.dtype,
                sizes: t.sizes.clone(),
                strides: t.strides.iter().map(|&s| s as usize).collect(),
            },
            Argument::Scalar(v) => fuser_schedule::ArgInfo::Scalar(*v),
        }
    }
}

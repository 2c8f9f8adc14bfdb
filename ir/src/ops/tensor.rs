//! Fusion input tensors.
//!
//! Symbolic extents are `TensorSize` scalars naming the owning tensor and
//! dimension, so lowering can read them from the kernel argument.

use fuser_dtype::DataType;

use crate::fusion::Fusion;
use crate::ids::ValId;
use crate::tensor_view::TensorDomain;
use crate::types::IterType;
use crate::val::{ScalarKind, ValKind};

/// Size of one dimension of a concrete tensor declaration.
pub const SYMBOLIC_SIZE: i64 = -1;

impl Fusion {
    /// Contiguous tensor of rank `ndims` with symbolic sizes.
    pub fn symbolic_tensor(&mut self, ndims: usize, dtype: DataType) -> ValId {
        self.tensor_with_contiguity(&vec![true; ndims], dtype)
    }

    /// Tensor with symbolic sizes and explicit per-dimension contiguity.
    pub fn tensor_with_contiguity(&mut self, contiguity: &[bool], dtype: DataType) -> ValId {
        let sizes = vec![SYMBOLIC_SIZE; contiguity.len()];
        self.declare_tensor(&sizes, contiguity, dtype)
    }

    /// Tensor with fixed sizes; [`SYMBOLIC_SIZE`] leaves a dimension symbolic
    /// and a size of 1 declares a broadcast axis.
    pub fn concrete_tensor(&mut self, sizes: &[i64], dtype: DataType) -> ValId {
        self.declare_tensor(sizes, &vec![true; sizes.len()], dtype)
    }

    fn declare_tensor(&mut self, sizes: &[i64], contiguity: &[bool], dtype: DataType) -> ValId {
        let tv = self.new_tensor(TensorDomain::contiguous(Vec::new()), dtype);
        let mut root = Vec::with_capacity(sizes.len());
        for (dim, &size) in sizes.iter().enumerate() {
            let (extent, iter_type) = match size {
                SYMBOLIC_SIZE => {
                    let extent = self.new_val(DataType::Int64, ValKind::Scalar(ScalarKind::TensorSize { tensor: tv, dim }));
                    (extent, IterType::Iteration)
                }
                1 => (self.int_val(1), IterType::Broadcast),
                size => (self.int_val(size), IterType::Iteration),
            };
            root.push(self.new_axis(extent, iter_type));
        }
        self.tv_mut(tv).set_domain(TensorDomain::new(root, contiguity.to_vec()));
        tv
    }
}

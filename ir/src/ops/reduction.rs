//! Reductions and Welford.

use std::collections::BTreeSet;

use fuser_dtype::DataType;
use snafu::ensure;

use crate::error::*;
use crate::expr::ExprKind;
use crate::fusion::Fusion;
use crate::ids::{IterDomainId, ValId};
use crate::tensor_view::TensorDomain;
use crate::types::{BinaryOpType, ConstValue, IterType};

/// Outputs of a Welford reduction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WelfordResult {
    pub avg: ValId,
    /// Sum of squared deviations from the mean (M2).
    pub var_sum: ValId,
    /// Number of samples, always `Int64`.
    pub n: ValId,
}

impl WelfordResult {
    pub fn outputs(&self) -> [ValId; 3] {
        [self.avg, self.var_sum, self.n]
    }
}

impl Fusion {
    /// Reduce `tv` over `axes` with `op`, starting from `init`.
    pub fn reduction_op(&mut self, op: BinaryOpType, axes: &[isize], init: ConstValue, tv: ValId) -> Result<ValId> {
        self.ensure_tensor(tv)?;
        ensure!(
            op.is_reduction_op(),
            InvalidReductionSnafu { op: "reduction_op", reason: format!("non-associative operator {op}") }
        );
        let dtype = self.dtype(tv);
        let root = self.reduction_domain(tv, axes)?;
        let out = self.new_tensor(TensorDomain::contiguous(root), dtype);
        self.register_expr(ExprKind::Reduction { op, init: init.cast(dtype) }, vec![tv], vec![out]);
        Ok(out)
    }

    pub fn sum(&mut self, tv: ValId, axes: &[isize]) -> Result<ValId> {
        self.reduce_with_identity(BinaryOpType::Add, tv, axes)
    }

    pub fn prod(&mut self, tv: ValId, axes: &[isize]) -> Result<ValId> {
        self.reduce_with_identity(BinaryOpType::Mul, tv, axes)
    }

    pub fn max(&mut self, tv: ValId, axes: &[isize]) -> Result<ValId> {
        self.reduce_with_identity(BinaryOpType::Max, tv, axes)
    }

    pub fn min(&mut self, tv: ValId, axes: &[isize]) -> Result<ValId> {
        self.reduce_with_identity(BinaryOpType::Min, tv, axes)
    }

    fn reduce_with_identity(&mut self, op: BinaryOpType, tv: ValId, axes: &[isize]) -> Result<ValId> {
        let dtype = self.dtype(tv);
        let Some(init) = op.reduction_identity(dtype) else {
            return InvalidReductionSnafu { op: "reduction_op", reason: format!("no identity for {op}") }.fail();
        };
        self.reduction_op(op, axes, init, tv)
    }

    /// Single-pass mean and variance over `axes`.
    ///
    /// The three outputs are siblings: they share one domain, so scheduling
    /// any of them schedules all.
    pub fn welford(&mut self, tv: ValId, axes: &[isize]) -> Result<WelfordResult> {
        self.ensure_tensor(tv)?;
        let dtype = self.dtype(tv);
        ensure!(dtype.is_float(), InvalidDTypeSnafu { op: "welford", dtype });
        let root = self.reduction_domain(tv, axes)?;
        let domain = TensorDomain::contiguous(root);
        let accumulate = dtype.accumulate_type();
        let avg = self.new_tensor(domain.clone(), accumulate);
        let var_sum = self.new_tensor(domain.clone(), accumulate);
        let n = self.new_tensor(domain, DataType::Int64);
        self.register_expr(ExprKind::Welford, vec![tv], vec![avg, var_sum, n]);
        Ok(WelfordResult { avg, var_sum, n })
    }

    /// Output root of a reduction: input axes with `axes` turned into reductions.
    fn reduction_domain(&mut self, tv: ValId, axes: &[isize]) -> Result<Vec<IterDomainId>> {
        ensure!(!axes.is_empty(), EmptyReductionAxesSnafu);
        let input_root = self.non_reduction_root(tv);
        let mut reduced = BTreeSet::new();
        for &axis in axes {
            let axis = normalize_axis(axis, input_root.len())?;
            ensure!(reduced.insert(axis), DuplicateAxisSnafu { axis });
        }
        let mut root = Vec::with_capacity(input_root.len());
        for (i, &input) in input_root.iter().enumerate() {
            let extent = self.extent(input);
            let iter_type = if reduced.contains(&i) {
                IterType::Reduction
            } else if self.id(input).is_broadcast() {
                IterType::Broadcast
            } else {
                IterType::Iteration
            };
            root.push(self.new_axis(extent, iter_type));
        }
        Ok(root)
    }
}

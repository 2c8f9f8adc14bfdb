use fuser_dtype::DataType;
use fuser_ir::{ConstValue, ExpressionEvaluator, Fusion, IterDomainId, ValId};
use snafu::ensure;

use crate::error::*;

/// Shape of one runtime argument as schedulers see it.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgInfo {
    Tensor { dtype: DataType, sizes: Vec<usize>, strides: Vec<usize> },
    Scalar(ConstValue),
}

impl ArgInfo {
    /// A contiguous row-major tensor.
    pub fn contiguous(dtype: DataType, sizes: &[usize]) -> Self {
        let mut strides = vec![1; sizes.len()];
        for i in (0..sizes.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * sizes[i + 1].max(1);
        }
        Self::Tensor { dtype, sizes: sizes.to_vec(), strides }
    }
}

/// Runtime facts about the arguments of one fusion invocation.
#[derive(Debug, Clone)]
pub struct SchedulerRuntimeInfo {
    inputs: Vec<ValId>,
    args: Vec<ArgInfo>,
}

impl SchedulerRuntimeInfo {
    pub fn new(fusion: &Fusion, args: Vec<ArgInfo>) -> Result<Self> {
        let inputs = fusion.inputs().to_vec();
        ensure!(
            inputs.len() == args.len(),
            NoSchedulerSnafu { reason: format!("fusion takes {} arguments, {} given", inputs.len(), args.len()) }
        );
        let info = Self { inputs, args };
        // Reject shapes that contradict constant extents up front.
        info.evaluator(fusion)?;
        Ok(info)
    }

    pub fn args(&self) -> &[ArgInfo] {
        &self.args
    }

    /// Argument bound to fusion input `v`.
    pub fn arg(&self, v: ValId) -> Option<&ArgInfo> {
        self.inputs.iter().position(|&i| i == v).map(|i| &self.args[i])
    }

    pub fn sizes(&self, v: ValId) -> Option<&[usize]> {
        match self.arg(v)? {
            ArgInfo::Tensor { sizes, .. } => Some(sizes),
            ArgInfo::Scalar(_) => None,
        }
    }

    pub fn strides(&self, v: ValId) -> Option<&[usize]> {
        match self.arg(v)? {
            ArgInfo::Tensor { strides, .. } => Some(strides),
            ArgInfo::Scalar(_) => None,
        }
    }

    /// Evaluator over `fusion` with every input size and scalar bound.
    ///
    /// `fusion` may be a scheduled copy of the fusion this info was built
    /// for; input handles are shared.
    pub fn evaluator<'f>(&self, fusion: &'f Fusion) -> Result<ExpressionEvaluator<'f>> {
        let mut evaluator = ExpressionEvaluator::new(fusion);
        for (&input, arg) in self.inputs.iter().zip(&self.args) {
            match arg {
                ArgInfo::Tensor { sizes, .. } => evaluator.bind_tensor_sizes(input, sizes)?,
                ArgInfo::Scalar(value) => evaluator.bind(input, *value),
            }
        }
        Ok(evaluator)
    }

    /// Concrete extent of an axis, if it only depends on the inputs.
    pub fn extent(&self, fusion: &Fusion, id: IterDomainId) -> Option<i64> {
        self.evaluator(fusion).ok()?.evaluate_int(fusion.extent(id))
    }

    /// Product of the extents of `ids`.
    pub fn numel(&self, fusion: &Fusion, ids: &[IterDomainId]) -> Option<i64> {
        let mut evaluator = self.evaluator(fusion).ok()?;
        ids.iter().try_fold(1i64, |acc, &id| Some(acc * evaluator.evaluate_int(fusion.extent(id))?))
    }

    /// Input dimension with the smallest stride among non-unit dimensions.
    pub fn fastest_dim(&self, v: ValId) -> Option<usize> {
        let (sizes, strides) = (self.sizes(v)?, self.strides(v)?);
        (0..sizes.len()).filter(|&d| sizes[d] > 1).min_by_key(|&d| (strides[d], std::cmp::Reverse(d)))
    }
}

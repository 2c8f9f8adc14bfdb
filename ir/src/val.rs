use fuser_dtype::DataType;

use crate::ids::{ExprId, ValId};
use crate::tensor_view::TensorView;
use crate::types::ConstValue;

/// What a scalar value stands for.
#[derive(Debug, Clone, PartialEq)]
pub enum ScalarKind {
    Const(ConstValue),
    /// A fusion input or the result of a scalar expression.
    Symbolic,
    /// Runtime size of dimension `dim` of an input tensor.
    TensorSize { tensor: ValId, dim: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ValKind {
    Scalar(ScalarKind),
    Tensor(TensorView),
}

/// A named SSA value.
#[derive(Debug, Clone)]
pub struct Val {
    pub(crate) name: ValId,
    pub(crate) dtype: DataType,
    pub(crate) kind: ValKind,
    pub(crate) definition: Option<ExprId>,
    pub(crate) uses: Vec<ExprId>,
}

impl Val {
    pub fn name(&self) -> ValId {
        self.name
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn kind(&self) -> &ValKind {
        &self.kind
    }

    pub fn definition(&self) -> Option<ExprId> {
        self.definition
    }

    pub fn uses(&self) -> &[ExprId] {
        &self.uses
    }

    pub fn is_tensor(&self) -> bool {
        matches!(self.kind, ValKind::Tensor(_))
    }

    pub fn is_scalar(&self) -> bool {
        matches!(self.kind, ValKind::Scalar(_))
    }

    pub fn as_tensor(&self) -> Option<&TensorView> {
        match &self.kind {
            ValKind::Tensor(tv) => Some(tv),
            ValKind::Scalar(_) => None,
        }
    }

    pub fn as_const(&self) -> Option<ConstValue> {
        match self.kind {
            ValKind::Scalar(ScalarKind::Const(value)) => Some(value),
            _ => None,
        }
    }
}

use crate::ids::{ExprId, ValId};
use crate::types::{BinaryOpType, ConstValue, TernaryOpType, UnaryOpType};

/// Closed set of expression kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Unary(UnaryOpType),
    Binary(BinaryOpType),
    Ternary(TernaryOpType),
    Reduction { op: BinaryOpType, init: ConstValue },
    /// Outputs are `[avg, var_sum, n]`. Inputs are either the raw tensor or a
    /// partial `[avg, var_sum, n]` triple produced by an rfactor.
    Welford,
    Broadcast { is_broadcast_dim: Vec<bool> },
}

impl ExprKind {
    pub fn is_reduction(&self) -> bool {
        matches!(self, ExprKind::Reduction { .. } | ExprKind::Welford)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ExprKind::Unary(_) => "UnaryOp",
            ExprKind::Binary(_) => "BinaryOp",
            ExprKind::Ternary(_) => "TernaryOp",
            ExprKind::Reduction { .. } => "ReductionOp",
            ExprKind::Welford => "WelfordOp",
            ExprKind::Broadcast { .. } => "BroadcastOp",
        }
    }
}

/// An immutable expression node. Rewrites replace expressions, they never edit them.
#[derive(Debug, Clone)]
pub struct Expr {
    pub(crate) name: ExprId,
    pub(crate) kind: ExprKind,
    pub(crate) inputs: Vec<ValId>,
    pub(crate) outputs: Vec<ValId>,
}

impl Expr {
    pub fn name(&self) -> ExprId {
        self.name
    }

    pub fn kind(&self) -> &ExprKind {
        &self.kind
    }

    pub fn inputs(&self) -> &[ValId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[ValId] {
        &self.outputs
    }

    pub fn input(&self, i: usize) -> ValId {
        self.inputs[i]
    }

    pub fn output(&self, i: usize) -> ValId {
        self.outputs[i]
    }

    /// A Welford combining partial results rather than raw samples.
    pub fn is_welford_combine(&self) -> bool {
        matches!(self.kind, ExprKind::Welford) && self.inputs.len() == 3
    }
}

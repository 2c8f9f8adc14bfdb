//! Human-readable dumps of a fusion, in the usual `T3_l[ iS4{i0} ]` notation.

use std::fmt::{self, Write};

use itertools::Itertools;

use crate::expr::ExprKind;
use crate::fusion::Fusion;
use crate::ids::{ExprId, IterDomainId, ValId};
use crate::types::{BinaryOpType, ParallelType};
use crate::val::{ScalarKind, ValKind};

impl Fusion {
    pub fn print_math(&self) -> String {
        FusionPrinter { fusion: self }.to_string()
    }

    /// Short operand name: `T3` for tensors, the expression for scalars.
    pub fn val_to_string(&self, v: ValId) -> String {
        match self.val(v).kind() {
            ValKind::Tensor(_) => format!("T{}", v.index()),
            ValKind::Scalar(ScalarKind::Const(value)) => value.to_string(),
            ValKind::Scalar(ScalarKind::TensorSize { .. } | ScalarKind::Symbolic) => match self.definition(v) {
                Some(def) => self.scalar_expr_to_string(def),
                None => format!("i{}", v.index()),
            },
        }
    }

    fn scalar_expr_to_string(&self, e: ExprId) -> String {
        let expr = self.expr(e);
        let operand = |i: usize| self.val_to_string(expr.input(i));
        match expr.kind() {
            ExprKind::Unary(op) => format!("{op}({})", operand(0)),
            ExprKind::Binary(BinaryOpType::CeilDiv) => format!("ceilDiv({}, {})", operand(0), operand(1)),
            ExprKind::Binary(op) => match binary_symbol(*op) {
                Some(symbol) => format!("( {} {symbol} {} )", operand(0), operand(1)),
                None => format!("{op}({}, {})", operand(0), operand(1)),
            },
            ExprKind::Ternary(op) => format!("{op}({}, {}, {})", operand(0), operand(1), operand(2)),
            other => other.name().to_string(),
        }
    }

    pub fn iter_domain_to_string(&self, id: IterDomainId) -> String {
        let axis = self.id(id);
        let parallel = match axis.parallel_type {
            ParallelType::Serial => "S".to_string(),
            other => other.to_string(),
        };
        let rfactor = if axis.is_rfactor { "rf" } else { "" };
        format!("{}{parallel}{}{{{}}}{rfactor}", axis.iter_type.symbol(), id.index(), self.val_to_string(axis.extent))
    }

    /// Full tensor notation including the leaf domain and positions.
    pub fn tensor_to_string(&self, v: ValId) -> String {
        let tv = self.tv(v);
        let mut out = format!(
            "T{}_{}[ {} ]",
            v.index(),
            tv.memory_type().symbol(),
            tv.domain().leaf().iter().map(|&id| self.iter_domain_to_string(id)).join(", ")
        );
        if tv.compute_at_position() > 0 {
            let _ = write!(out, " ca_pos( {} )", tv.compute_at_position());
        }
        if tv.max_producer_position() > 0 {
            let _ = write!(out, " produce_pos( {} )", tv.max_producer_position());
        }
        out
    }

    pub fn expr_to_string(&self, e: ExprId) -> String {
        let expr = self.expr(e);
        let outputs = expr
            .outputs()
            .iter()
            .map(|&o| if self.is_tensor(o) { self.tensor_to_string(o) } else { self.val_to_string(o) })
            .join(",\n   ");
        let operand = |i: usize| self.val_to_string(expr.input(i));
        let rhs = match expr.kind() {
            ExprKind::Unary(crate::types::UnaryOpType::Set) => operand(0),
            ExprKind::Unary(crate::types::UnaryOpType::Cast) => {
                format!("({}) {}", self.dtype(expr.output(0)).cuda_type(), operand(0))
            }
            ExprKind::Unary(op) => format!("{op}({})", operand(0)),
            ExprKind::Binary(op) => match binary_symbol(*op) {
                Some(symbol) => format!("{} {symbol} {}", operand(0), operand(1)),
                None => format!("{op}({}, {})", operand(0), operand(1)),
            },
            ExprKind::Ternary(op) => format!("{op}({}, {}, {})", operand(0), operand(1), operand(2)),
            ExprKind::Reduction { op, init } => {
                format!("reduction( {}, op = {op}, initial value = {init} )", operand(0))
            }
            ExprKind::Welford => {
                format!("welford( {} )", expr.inputs().iter().map(|&v| self.val_to_string(v)).join(", "))
            }
            ExprKind::Broadcast { is_broadcast_dim } => {
                format!("broadcast( {}, flags = {is_broadcast_dim:?} )", operand(0))
            }
        };
        format!("{outputs}\n   = {rhs};")
    }
}

pub(crate) fn binary_symbol(op: BinaryOpType) -> Option<&'static str> {
    Some(match op {
        BinaryOpType::Add => "+",
        BinaryOpType::Sub => "-",
        BinaryOpType::Mul => "*",
        BinaryOpType::Div => "/",
        BinaryOpType::Mod => "%",
        BinaryOpType::Lt => "<",
        BinaryOpType::Le => "<=",
        BinaryOpType::Gt => ">",
        BinaryOpType::Ge => ">=",
        BinaryOpType::Eq => "==",
        BinaryOpType::Ne => "!=",
        BinaryOpType::And => "&&",
        BinaryOpType::Or => "||",
        _ => return None,
    })
}

struct FusionPrinter<'a> {
    fusion: &'a Fusion,
}

impl fmt::Display for FusionPrinter<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fusion = self.fusion;
        writeln!(f, "Inputs:")?;
        for &input in fusion.inputs() {
            writeln!(f, "  {}, {}", describe(fusion, input), fusion.dtype(input))?;
        }
        writeln!(f, "Outputs:")?;
        for &output in fusion.outputs() {
            writeln!(f, "  {}, {}", describe(fusion, output), fusion.dtype(output))?;
        }
        writeln!(f, "\n%kernel_math {{")?;
        for e in fusion.exprs() {
            writeln!(f, "{}", fusion.expr_to_string(e))?;
        }
        writeln!(f, "}}")
    }
}

fn describe(fusion: &Fusion, v: ValId) -> String {
    if fusion.is_tensor(v) { fusion.tensor_to_string(v) } else { fusion.val_to_string(v) }
}

//! Index and predicate arithmetic of a kernel.
//!
//! Builders fold constants and drop identities as they go, so a loop over a
//! constant extent split by a constant factor indexes with plain numbers and
//! a provably true predicate disappears.

use std::fmt;

use fuser_ir::{BinaryOpType, ConstValue, DataType, ParallelType, UnaryOpType, ValId};

/// Handle of a serial loop index inside one kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LoopId(pub u32);

impl fmt::Display for LoopId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "i{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Int(i64),
    Float(f64),
    Bool(bool),
    /// A scalar kernel argument.
    Input { val: ValId, dtype: DataType },
    /// Runtime size of a kernel tensor argument.
    TensorSize { tensor: ValId, dim: usize },
    TensorStride { tensor: ValId, dim: usize },
    /// `threadIdx.x`, `blockIdx.y` ...
    ParallelIndex(ParallelType),
    /// `blockDim.x`, `gridDim.y` ...
    ParallelDim(ParallelType),
    Loop(LoopId),
    Unary(UnaryOpType, Box<Scalar>),
    Binary(BinaryOpType, Box<Scalar>, Box<Scalar>),
    Where(Box<Scalar>, Box<Scalar>, Box<Scalar>),
}

/// Values a [`Scalar`] can refer to at run time.
pub trait ScalarEnv {
    fn input(&self, val: ValId) -> Option<ConstValue>;
    fn tensor_size(&self, tensor: ValId, dim: usize) -> Option<i64>;
    fn tensor_stride(&self, tensor: ValId, dim: usize) -> Option<i64>;
    fn parallel_index(&self, parallel: ParallelType) -> Option<i64>;
    fn parallel_dim(&self, parallel: ParallelType) -> Option<i64>;
    fn loop_index(&self, id: LoopId) -> Option<i64>;
}

impl Scalar {
    pub const ZERO: Scalar = Scalar::Int(0);
    pub const ONE: Scalar = Scalar::Int(1);
    pub const TRUE: Scalar = Scalar::Bool(true);

    pub fn as_int(&self) -> Option<i64> {
        match *self {
            Scalar::Int(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_true(&self) -> bool {
        matches!(self, Scalar::Bool(true))
    }

    pub fn is_const(&self) -> bool {
        matches!(self, Scalar::Int(_) | Scalar::Float(_) | Scalar::Bool(_))
    }

    pub fn from_const(value: ConstValue) -> Self {
        match value {
            ConstValue::Bool(v) => Scalar::Bool(v),
            ConstValue::Int(v) => Scalar::Int(v),
            ConstValue::Float(v) => Scalar::Float(v),
        }
    }

    pub fn binary(op: BinaryOpType, lhs: Scalar, rhs: Scalar) -> Scalar {
        use BinaryOpType::*;
        if let (Scalar::Int(a), Scalar::Int(b)) = (&lhs, &rhs)
            && let Some(folded) = fold_int(op, *a, *b)
        {
            return folded;
        }
        match (op, &lhs, &rhs) {
            (Add, Scalar::Int(0), _) => rhs,
            (Add | Sub, _, Scalar::Int(0)) => lhs,
            (Mul, Scalar::Int(0), _) | (Mul, _, Scalar::Int(0)) => Scalar::ZERO,
            (Mul, Scalar::Int(1), _) => rhs,
            (Mul | Div | CeilDiv, _, Scalar::Int(1)) => lhs,
            (Mod, _, Scalar::Int(1)) => Scalar::ZERO,
            (Div | Mod, Scalar::Int(0), _) => Scalar::ZERO,
            (And, Scalar::Bool(true), _) | (Or, Scalar::Bool(false), _) => rhs,
            (And, _, Scalar::Bool(true)) | (Or, _, Scalar::Bool(false)) => lhs,
            (And, Scalar::Bool(false), _) | (And, _, Scalar::Bool(false)) => Scalar::Bool(false),
            (Or, Scalar::Bool(true), _) | (Or, _, Scalar::Bool(true)) => Scalar::TRUE,
            (Max | Min, _, _) if lhs == rhs => lhs,
            (Lt, _, _) | (Ne, _, _) if lhs == rhs => Scalar::Bool(false),
            (Le, _, _) | (Eq, _, _) if lhs == rhs => Scalar::TRUE,
            _ => Scalar::Binary(op, Box::new(lhs), Box::new(rhs)),
        }
    }

    pub fn add(self, rhs: Scalar) -> Scalar {
        Self::binary(BinaryOpType::Add, self, rhs)
    }

    pub fn sub(self, rhs: Scalar) -> Scalar {
        Self::binary(BinaryOpType::Sub, self, rhs)
    }

    pub fn mul(self, rhs: Scalar) -> Scalar {
        Self::binary(BinaryOpType::Mul, self, rhs)
    }

    pub fn div(self, rhs: Scalar) -> Scalar {
        Self::binary(BinaryOpType::Div, self, rhs)
    }

    pub fn rem(self, rhs: Scalar) -> Scalar {
        Self::binary(BinaryOpType::Mod, self, rhs)
    }

    pub fn ceil_div(self, rhs: Scalar) -> Scalar {
        Self::binary(BinaryOpType::CeilDiv, self, rhs)
    }

    pub fn max(self, rhs: Scalar) -> Scalar {
        Self::binary(BinaryOpType::Max, self, rhs)
    }

    pub fn lt(self, rhs: Scalar) -> Scalar {
        Self::binary(BinaryOpType::Lt, self, rhs)
    }

    pub fn eq(self, rhs: Scalar) -> Scalar {
        Self::binary(BinaryOpType::Eq, self, rhs)
    }

    pub fn and(self, rhs: Scalar) -> Scalar {
        Self::binary(BinaryOpType::And, self, rhs)
    }

    pub fn unary(op: UnaryOpType, operand: Scalar) -> Scalar {
        match (op, &operand) {
            (UnaryOpType::Set, _) => operand,
            (UnaryOpType::Neg, Scalar::Int(v)) => Scalar::Int(-v),
            _ => Scalar::Unary(op, Box::new(operand)),
        }
    }

    pub fn select(cond: Scalar, a: Scalar, b: Scalar) -> Scalar {
        match cond {
            Scalar::Bool(true) => a,
            Scalar::Bool(false) => b,
            cond => Scalar::Where(Box::new(cond), Box::new(a), Box::new(b)),
        }
    }

    /// Conjunction of `terms`; true when empty.
    pub fn all(terms: impl IntoIterator<Item = Scalar>) -> Scalar {
        let mut acc = Scalar::TRUE;
        for term in terms {
            acc = acc.and(term);
        }
        acc
    }

    /// Replace every loop index `f` knows a value for, refolding on the way up.
    pub fn substitute(&self, f: &impl Fn(LoopId) -> Option<Scalar>) -> Scalar {
        match self {
            Scalar::Loop(id) => f(*id).unwrap_or(Scalar::Loop(*id)),
            Scalar::Unary(op, x) => Scalar::unary(*op, x.substitute(f)),
            Scalar::Binary(op, a, b) => Scalar::binary(*op, a.substitute(f), b.substitute(f)),
            Scalar::Where(c, a, b) => Scalar::select(c.substitute(f), a.substitute(f), b.substitute(f)),
            leaf => leaf.clone(),
        }
    }

    /// Whether loop index `id` appears.
    pub fn uses_loop(&self, id: LoopId) -> bool {
        match self {
            Scalar::Loop(l) => *l == id,
            Scalar::Unary(_, x) => x.uses_loop(id),
            Scalar::Binary(_, a, b) => a.uses_loop(id) || b.uses_loop(id),
            Scalar::Where(c, a, b) => c.uses_loop(id) || a.uses_loop(id) || b.uses_loop(id),
            _ => false,
        }
    }

    pub fn evaluate(&self, env: &dyn ScalarEnv) -> Option<ConstValue> {
        Some(match self {
            Scalar::Int(v) => ConstValue::Int(*v),
            Scalar::Float(v) => ConstValue::Float(*v),
            Scalar::Bool(v) => ConstValue::Bool(*v),
            Scalar::Input { val, .. } => env.input(*val)?,
            Scalar::TensorSize { tensor, dim } => ConstValue::Int(env.tensor_size(*tensor, *dim)?),
            Scalar::TensorStride { tensor, dim } => ConstValue::Int(env.tensor_stride(*tensor, *dim)?),
            Scalar::ParallelIndex(pt) => ConstValue::Int(env.parallel_index(*pt)?),
            Scalar::ParallelDim(pt) => ConstValue::Int(env.parallel_dim(*pt)?),
            Scalar::Loop(id) => ConstValue::Int(env.loop_index(*id)?),
            Scalar::Unary(op, x) => {
                let x = x.evaluate(env)?;
                match (op, x) {
                    (UnaryOpType::Neg, ConstValue::Int(v)) => ConstValue::Int(-v),
                    (UnaryOpType::Abs, ConstValue::Int(v)) => ConstValue::Int(v.abs()),
                    (UnaryOpType::Set | UnaryOpType::Cast, x) => x,
                    (op, x) => ConstValue::Float(op.eval(x.as_f64())),
                }
            }
            Scalar::Binary(op, a, b) => {
                let (a, b) = (a.evaluate(env)?, b.evaluate(env)?);
                match (a, b) {
                    (ConstValue::Int(a), ConstValue::Int(b)) => match fold_int(*op, a, b)? {
                        Scalar::Int(v) => ConstValue::Int(v),
                        Scalar::Bool(v) => ConstValue::Bool(v),
                        _ => return None,
                    },
                    (a, b) if op.is_logical() => ConstValue::Bool(op.eval(a.as_f64(), b.as_f64(), true) != 0.0),
                    (a, b) if op.is_comparison() => ConstValue::Bool(op.eval(a.as_f64(), b.as_f64(), false) != 0.0),
                    (a, b) => ConstValue::Float(op.eval(a.as_f64(), b.as_f64(), false)),
                }
            }
            Scalar::Where(c, a, b) => {
                if c.evaluate(env)?.as_bool() {
                    a.evaluate(env)?
                } else {
                    b.evaluate(env)?
                }
            }
        })
    }

    pub fn evaluate_int(&self, env: &dyn ScalarEnv) -> Option<i64> {
        self.evaluate(env).map(|v| v.as_i64())
    }
}

/// Integer folding with C semantics: division truncates toward zero.
fn fold_int(op: BinaryOpType, a: i64, b: i64) -> Option<Scalar> {
    use BinaryOpType::*;
    Some(match op {
        Add => Scalar::Int(a.checked_add(b)?),
        Sub => Scalar::Int(a.checked_sub(b)?),
        Mul => Scalar::Int(a.checked_mul(b)?),
        Div => Scalar::Int(a.checked_div(b)?),
        Mod => Scalar::Int(a.checked_rem(b)?),
        CeilDiv => {
            if b <= 0 {
                return None;
            }
            Scalar::Int((a + b - 1).div_euclid(b))
        }
        Max => Scalar::Int(a.max(b)),
        Min => Scalar::Int(a.min(b)),
        Lt => Scalar::Bool(a < b),
        Le => Scalar::Bool(a <= b),
        Gt => Scalar::Bool(a > b),
        Ge => Scalar::Bool(a >= b),
        Eq => Scalar::Bool(a == b),
        Ne => Scalar::Bool(a != b),
        And => Scalar::Bool(a != 0 && b != 0),
        Or => Scalar::Bool(a != 0 || b != 0),
    })
}

/// Debug spelling; code generators render scalars themselves.
impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Int(v) => write!(f, "{v}"),
            Scalar::Float(v) => write!(f, "{v:?}"),
            Scalar::Bool(v) => write!(f, "{v}"),
            Scalar::Input { val, .. } => write!(f, "s{}", val.index()),
            Scalar::TensorSize { tensor, dim } => write!(f, "T{}.size[{dim}]", tensor.index()),
            Scalar::TensorStride { tensor, dim } => write!(f, "T{}.stride[{dim}]", tensor.index()),
            Scalar::ParallelIndex(pt) => write!(f, "{pt}"),
            Scalar::ParallelDim(pt) => write!(f, "{}", pt.dim_name().unwrap_or("?")),
            Scalar::Loop(id) => write!(f, "{id}"),
            Scalar::Unary(op, x) => write!(f, "{op:?}({x})"),
            Scalar::Binary(op, a, b) => match binary_symbol(*op) {
                Some(symbol) => write!(f, "({a} {symbol} {b})"),
                None => write!(f, "{op:?}({a}, {b})"),
            },
            Scalar::Where(c, a, b) => write!(f, "({c} ? {a} : {b})"),
        }
    }
}

/// Infix spelling shared by every C-like printer.
pub fn binary_symbol(op: BinaryOpType) -> Option<&'static str> {
    use BinaryOpType::*;
    Some(match op {
        Add => "+",
        Sub => "-",
        Mul => "*",
        Div => "/",
        Mod => "%",
        Lt => "<",
        Le => "<=",
        Gt => ">",
        Ge => ">=",
        Eq => "==",
        Ne => "!=",
        And => "&&",
        Or => "||",
        CeilDiv | Max | Min => return None,
    })
}

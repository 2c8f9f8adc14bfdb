//! Type definitions for IR operations.
//!
//! This module contains the fundamental enums shared by the fusion IR, the
//! scheduler and lowering: constant values, operation types, iteration kinds,
//! parallel bindings and memory spaces.

use std::fmt;

use enumset::EnumSet;
use fuser_dtype::DataType;

/// Constant value carried by a scalar [`Val`](crate::Val).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConstValue {
    Bool(bool),
    Int(i64),
    Float(f64),
}

impl ConstValue {
    pub const fn dtype(&self) -> DataType {
        match self {
            ConstValue::Bool(_) => DataType::Bool,
            ConstValue::Int(_) => DataType::Int64,
            ConstValue::Float(_) => DataType::Double,
        }
    }

    pub const fn zero(dtype: DataType) -> Self {
        match dtype {
            DataType::Bool => Self::Bool(false),
            DataType::Int32 | DataType::Int64 => Self::Int(0),
            DataType::Half | DataType::Float | DataType::Double => Self::Float(0.0),
        }
    }

    pub const fn one(dtype: DataType) -> Self {
        match dtype {
            DataType::Bool => Self::Bool(true),
            DataType::Int32 | DataType::Int64 => Self::Int(1),
            DataType::Half | DataType::Float | DataType::Double => Self::Float(1.0),
        }
    }

    /// Smallest value of `dtype`, the identity of a max reduction.
    pub const fn lowest(dtype: DataType) -> Self {
        match dtype {
            DataType::Bool => Self::Bool(false),
            DataType::Int32 => Self::Int(i32::MIN as i64),
            DataType::Int64 => Self::Int(i64::MIN),
            DataType::Half | DataType::Float | DataType::Double => Self::Float(f64::NEG_INFINITY),
        }
    }

    /// Largest value of `dtype`, the identity of a min reduction.
    pub const fn highest(dtype: DataType) -> Self {
        match dtype {
            DataType::Bool => Self::Bool(true),
            DataType::Int32 => Self::Int(i32::MAX as i64),
            DataType::Int64 => Self::Int(i64::MAX),
            DataType::Half | DataType::Float | DataType::Double => Self::Float(f64::INFINITY),
        }
    }

    pub fn from_f64(value: f64, dtype: DataType) -> Self {
        match dtype {
            DataType::Bool => Self::Bool(value != 0.0),
            DataType::Int32 | DataType::Int64 => Self::Int(dtype.round(value) as i64),
            DataType::Half | DataType::Float | DataType::Double => Self::Float(dtype.round(value)),
        }
    }

    pub fn as_f64(&self) -> f64 {
        match *self {
            ConstValue::Bool(v) => v as u8 as f64,
            ConstValue::Int(v) => v as f64,
            ConstValue::Float(v) => v,
        }
    }

    /// Integer view of the value; floats truncate toward zero.
    pub fn as_i64(&self) -> i64 {
        match *self {
            ConstValue::Bool(v) => v as i64,
            ConstValue::Int(v) => v,
            ConstValue::Float(v) => v as i64,
        }
    }

    pub fn as_bool(&self) -> bool {
        match *self {
            ConstValue::Bool(v) => v,
            ConstValue::Int(v) => v != 0,
            ConstValue::Float(v) => v != 0.0,
        }
    }

    /// Cast this constant to `dtype` with C semantics.
    pub fn cast(&self, dtype: DataType) -> Self {
        match (*self, dtype) {
            (ConstValue::Int(v), DataType::Int32) => ConstValue::Int(v as i32 as i64),
            (ConstValue::Int(v), DataType::Int64) => ConstValue::Int(v),
            (value, dtype) => Self::from_f64(value.as_f64(), dtype),
        }
    }
}

impl fmt::Display for ConstValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConstValue::Bool(v) => write!(f, "{v}"),
            ConstValue::Int(v) => write!(f, "{v}"),
            ConstValue::Float(v) => write!(f, "{v:?}"),
        }
    }
}

/// Unary operation types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum UnaryOpType {
    /// Plain copy; the only op a vectorized axis may be defined by.
    Set,
    /// Conversion to the output's dtype.
    Cast,
    Neg,
    Abs,
    Exp,
    Log,
    Sqrt,
    Rsqrt,
    Reciprocal,
    Relu,
    Sigmoid,
    Tanh,
}

impl UnaryOpType {
    /// Operations that only make sense over floating point values.
    pub const fn is_float_only(self) -> bool {
        matches!(self, Self::Exp | Self::Log | Self::Sqrt | Self::Rsqrt | Self::Reciprocal | Self::Sigmoid | Self::Tanh)
    }

    pub fn eval(self, x: f64) -> f64 {
        match self {
            Self::Set | Self::Cast => x,
            Self::Neg => -x,
            Self::Abs => x.abs(),
            Self::Exp => x.exp(),
            Self::Log => x.ln(),
            Self::Sqrt => x.sqrt(),
            Self::Rsqrt => 1.0 / x.sqrt(),
            Self::Reciprocal => 1.0 / x,
            Self::Relu => x.max(0.0),
            Self::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            Self::Tanh => x.tanh(),
        }
    }
}

/// Binary operation types.
///
/// Comparison and logical operations produce `Bool`; everything else keeps
/// the promoted operand type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum BinaryOpType {
    Add,
    Sub,
    Mul,
    /// Division; truncates toward zero for integers.
    Div,
    /// C-style remainder, sign of the dividend.
    Mod,
    CeilDiv,
    Max,
    Min,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
}

impl BinaryOpType {
    pub fn is_comparison(self) -> bool {
        matches!(self, Self::Lt | Self::Le | Self::Gt | Self::Ge | Self::Eq | Self::Ne)
    }

    pub fn is_logical(self) -> bool {
        matches!(self, Self::And | Self::Or)
    }

    /// Whether the op can drive a reduction (associative and commutative).
    pub fn is_reduction_op(self) -> bool {
        matches!(self, Self::Add | Self::Mul | Self::Max | Self::Min | Self::And | Self::Or)
    }

    /// Identity element of a reduction over `dtype`.
    pub fn reduction_identity(self, dtype: DataType) -> Option<ConstValue> {
        match self {
            Self::Add | Self::Or => Some(ConstValue::zero(dtype)),
            Self::Mul | Self::And => Some(ConstValue::one(dtype)),
            Self::Max => Some(ConstValue::lowest(dtype)),
            Self::Min => Some(ConstValue::highest(dtype)),
            _ => None,
        }
    }

    /// Evaluate over host values; `integral` selects integer division semantics.
    pub fn eval(self, a: f64, b: f64, integral: bool) -> f64 {
        match self {
            Self::Add => a + b,
            Self::Sub => a - b,
            Self::Mul => a * b,
            Self::Div if integral => {
                if b == 0.0 {
                    0.0
                } else {
                    (a / b).trunc()
                }
            }
            Self::Div => a / b,
            Self::Mod if integral => {
                if b == 0.0 {
                    0.0
                } else {
                    ((a as i64) % (b as i64)) as f64
                }
            }
            Self::Mod => a % b,
            Self::CeilDiv => {
                if b == 0.0 {
                    0.0
                } else {
                    ((a as i64 + b as i64 - 1).div_euclid(b as i64)) as f64
                }
            }
            Self::Max => a.max(b),
            Self::Min => a.min(b),
            Self::Lt => (a < b) as u8 as f64,
            Self::Le => (a <= b) as u8 as f64,
            Self::Gt => (a > b) as u8 as f64,
            Self::Ge => (a >= b) as u8 as f64,
            Self::Eq => (a == b) as u8 as f64,
            Self::Ne => (a != b) as u8 as f64,
            Self::And => (a != 0.0 && b != 0.0) as u8 as f64,
            Self::Or => (a != 0.0 || b != 0.0) as u8 as f64,
        }
    }
}

/// Ternary operation types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum TernaryOpType {
    /// `cond ? a : b`
    Where,
}

/// Kind of an iteration axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IterType {
    Iteration,
    Reduction,
    Broadcast,
}

impl IterType {
    pub const fn symbol(self) -> char {
        match self {
            Self::Iteration => 'i',
            Self::Reduction => 'r',
            Self::Broadcast => 'b',
        }
    }
}

/// How a leaf axis is executed.
///
/// Variants are ordered the way launch dimensions are printed: block
/// dimensions, then thread dimensions, then the intra-thread kinds.
#[derive(Debug, Hash, PartialOrd, Ord, strum::Display)]
#[derive(enumset::EnumSetType)]
#[enumset(repr = "u16")]
pub enum ParallelType {
    #[strum(serialize = "blockIdx.z")]
    BIDz,
    #[strum(serialize = "blockIdx.y")]
    BIDy,
    #[strum(serialize = "blockIdx.x")]
    BIDx,
    #[strum(serialize = "threadIdx.z")]
    TIDz,
    #[strum(serialize = "threadIdx.y")]
    TIDy,
    #[strum(serialize = "threadIdx.x")]
    TIDx,
    #[strum(serialize = "V")]
    Vectorize,
    #[strum(serialize = "MV")]
    MisalignedVectorize,
    #[strum(serialize = "UR")]
    Unroll,
    #[strum(serialize = "US")]
    Unswitch,
    #[strum(serialize = "S")]
    Serial,
}

pub type ParallelTypeSet = EnumSet<ParallelType>;

impl ParallelType {
    /// Block and thread types in the order launch dimensions are reported.
    pub const LAUNCH_TYPES: [ParallelType; 6] = [Self::BIDx, Self::BIDy, Self::BIDz, Self::TIDx, Self::TIDy, Self::TIDz];

    pub const fn is_block_dim(self) -> bool {
        matches!(self, Self::BIDx | Self::BIDy | Self::BIDz)
    }

    pub const fn is_thread_dim(self) -> bool {
        matches!(self, Self::TIDx | Self::TIDy | Self::TIDz)
    }

    /// Block or thread binding; these become launch dimensions.
    pub const fn is_launch_dim(self) -> bool {
        self.is_block_dim() || self.is_thread_dim()
    }

    pub const fn is_vectorize(self) -> bool {
        matches!(self, Self::Vectorize | Self::MisalignedVectorize)
    }

    /// Name of the launch-dimension builtin (`blockDim.x`, `gridDim.y` ...).
    pub const fn dim_name(self) -> Option<&'static str> {
        match self {
            Self::BIDx => Some("gridDim.x"),
            Self::BIDy => Some("gridDim.y"),
            Self::BIDz => Some("gridDim.z"),
            Self::TIDx => Some("blockDim.x"),
            Self::TIDy => Some("blockDim.y"),
            Self::TIDz => Some("blockDim.z"),
            _ => None,
        }
    }

    /// Position in a `[BIDx, BIDy, BIDz, TIDx, TIDy, TIDz]` array.
    pub const fn launch_slot(self) -> Option<usize> {
        match self {
            Self::BIDx => Some(0),
            Self::BIDy => Some(1),
            Self::BIDz => Some(2),
            Self::TIDx => Some(3),
            Self::TIDy => Some(4),
            Self::TIDz => Some(5),
            _ => None,
        }
    }
}

/// Where a tensor lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, strum::Display)]
pub enum MemoryType {
    /// Registers, private to a thread.
    Local,
    /// Shared by the threads of a block.
    Shared,
    /// Device memory.
    Global,
}

impl MemoryType {
    pub const fn symbol(self) -> char {
        match self {
            Self::Local => 'l',
            Self::Shared => 's',
            Self::Global => 'g',
        }
    }
}

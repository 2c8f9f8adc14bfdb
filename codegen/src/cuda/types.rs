//! CUDA spelling of types, constants and index arithmetic.

use fuser_ir::{BinaryOpType, ConstValue, DataType, UnaryOpType};
use fuser_lower::Scalar;
use fuser_lower::kir::scalar::binary_symbol;

/// Type values of `dtype` are computed in; halves compute in float.
pub fn compute_type(dtype: DataType) -> &'static str {
    dtype.accumulate_type().cuda_type()
}

/// Render a constant as a literal of `dtype`.
pub fn cuda_const(value: ConstValue, dtype: DataType) -> String {
    match dtype {
        DataType::Bool => if value.as_bool() { "true" } else { "false" }.to_string(),
        DataType::Int32 => value.as_i64().to_string(),
        DataType::Int64 => format!("{}LL", value.as_i64()),
        DataType::Float => float_literal(value.as_f64() as f32),
        DataType::Double => double_literal(value.as_f64()),
        DataType::Half => format!("__float2half({})", float_literal(value.as_f64() as f32)),
    }
}

fn float_literal(f: f32) -> String {
    if f.is_nan() {
        "NAN_F".to_string()
    } else if f.is_infinite() {
        if f > 0.0 { "POS_INFINITY" } else { "NEG_INFINITY" }.to_string()
    } else {
        format!("{f:?}f")
    }
}

fn double_literal(f: f64) -> String {
    if f.is_nan() {
        "__longlong_as_double(0x7ff8000000000000LL)".to_string()
    } else if f.is_infinite() {
        let bits = if f > 0.0 { "0x7ff0000000000000LL" } else { "0xfff0000000000000LL" };
        format!("__longlong_as_double({bits})")
    } else {
        format!("{f:?}")
    }
}

/// Device function computing `op` elementwise in `dtype`.
pub fn unary_fn(op: UnaryOpType, dtype: DataType) -> &'static str {
    match op {
        UnaryOpType::Set | UnaryOpType::Cast => "",
        UnaryOpType::Neg => "-",
        UnaryOpType::Abs if dtype.is_float() => "fabs",
        UnaryOpType::Abs => "abs",
        UnaryOpType::Exp => "exp",
        UnaryOpType::Log => "log",
        UnaryOpType::Sqrt => "sqrt",
        UnaryOpType::Rsqrt => "rsqrt",
        UnaryOpType::Reciprocal => "reciprocal",
        UnaryOpType::Relu => "relu",
        UnaryOpType::Sigmoid => "sigmoid",
        UnaryOpType::Tanh => "tanh",
    }
}

/// `op` applied to two rendered operands of `dtype`.
pub fn binary_expr(op: BinaryOpType, a: &str, b: &str, dtype: DataType) -> String {
    let float = dtype.is_float();
    match op {
        BinaryOpType::Max if float => format!("fmax({a}, {b})"),
        BinaryOpType::Min if float => format!("fmin({a}, {b})"),
        BinaryOpType::Max => format!("imax({a}, {b})"),
        BinaryOpType::Min => format!("imin({a}, {b})"),
        BinaryOpType::Mod if float => format!("fmod({a}, {b})"),
        BinaryOpType::CeilDiv if float => format!("ceil({a} / {b})"),
        BinaryOpType::CeilDiv => format!("ceilDiv({a}, {b})"),
        BinaryOpType::And if !dtype.is_bool() => format!("({a} & {b})"),
        BinaryOpType::Or if !dtype.is_bool() => format!("({a} | {b})"),
        op => match binary_symbol(op) {
            Some(symbol) => format!("({a} {symbol} {b})"),
            None => format!("{op:?}({a}, {b})"),
        },
    }
}

/// Whether a scalar computes in floating point.
fn is_float_scalar(s: &Scalar) -> bool {
    match s {
        Scalar::Float(_) => true,
        Scalar::Input { dtype, .. } => dtype.is_float(),
        Scalar::Unary(op, x) => op.is_float_only() || is_float_scalar(x),
        Scalar::Binary(op, a, b) => !op.is_comparison() && !op.is_logical() && (is_float_scalar(a) || is_float_scalar(b)),
        Scalar::Where(_, a, b) => is_float_scalar(a) || is_float_scalar(b),
        _ => false,
    }
}

/// Render index or predicate arithmetic.
pub fn render_scalar(s: &Scalar) -> String {
    match s {
        Scalar::Int(v) if i32::try_from(*v).is_ok() => v.to_string(),
        Scalar::Int(v) => format!("{v}LL"),
        Scalar::Float(v) => double_literal(*v),
        Scalar::Bool(v) => v.to_string(),
        Scalar::Input { val, .. } => format!("s{}", val.index()),
        Scalar::TensorSize { tensor, dim } => format!("T{}.size[{dim}]", tensor.index()),
        Scalar::TensorStride { tensor, dim } => format!("T{}.stride[{dim}]", tensor.index()),
        Scalar::ParallelIndex(pt) => pt.to_string(),
        Scalar::ParallelDim(pt) => pt.dim_name().unwrap_or("1").to_string(),
        Scalar::Loop(id) => id.to_string(),
        Scalar::Unary(UnaryOpType::Set | UnaryOpType::Cast, x) => render_scalar(x),
        Scalar::Unary(UnaryOpType::Neg, x) => format!("(-{})", render_scalar(x)),
        Scalar::Unary(op, x) => {
            let dtype = if is_float_scalar(x) { DataType::Double } else { DataType::Int64 };
            format!("{}({})", unary_fn(*op, dtype), render_scalar(x))
        }
        Scalar::Binary(op, a, b) => {
            let dtype = if is_float_scalar(a) || is_float_scalar(b) {
                DataType::Double
            } else if op.is_logical() {
                DataType::Bool
            } else {
                DataType::Int64
            };
            binary_expr(*op, &render_scalar(a), &render_scalar(b), dtype)
        }
        Scalar::Where(c, a, b) => format!("({} ? {} : {})", render_scalar(c), render_scalar(a), render_scalar(b)),
    }
}

/// Render a scalar operand as a value of `dtype`.
pub fn render_scalar_as(s: &Scalar, dtype: DataType) -> String {
    match s {
        Scalar::Int(v) => cuda_const(ConstValue::Int(*v), dtype.accumulate_type()),
        Scalar::Float(v) => cuda_const(ConstValue::Float(*v), dtype.accumulate_type()),
        Scalar::Bool(v) => cuda_const(ConstValue::Bool(*v), dtype.accumulate_type()),
        Scalar::Input { dtype: DataType::Half, .. } => format!("__half2float({})", render_scalar(s)),
        other => render_scalar(other),
    }
}

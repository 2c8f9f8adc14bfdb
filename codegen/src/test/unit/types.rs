use fuser_dtype::DataType;
use fuser_ir::{BinaryOpType, ConstValue, Fusion, ParallelType};
use fuser_lower::Scalar;
use test_case::test_case;

use crate::cuda::types::{binary_expr, cuda_const, render_scalar, render_scalar_as};

#[test_case(ConstValue::Float(0.5), DataType::Float, "0.5f" ; "float")]
#[test_case(ConstValue::Float(0.1), DataType::Double, "0.1" ; "double")]
#[test_case(ConstValue::Int(3), DataType::Int64, "3LL" ; "int64")]
#[test_case(ConstValue::Int(3), DataType::Int32, "3" ; "int32")]
#[test_case(ConstValue::Int(0), DataType::Bool, "false" ; "bool")]
#[test_case(ConstValue::Float(f64::NEG_INFINITY), DataType::Float, "NEG_INFINITY" ; "negative infinity")]
#[test_case(ConstValue::Float(1.0), DataType::Half, "__float2half(1.0f)" ; "half")]
#[test_case(ConstValue::Int(2), DataType::Float, "2.0f" ; "int as float")]
fn test_constant_literals(value: ConstValue, dtype: DataType, expected: &str) {
    assert_eq!(cuda_const(value, dtype), expected);
}

#[test_case(BinaryOpType::Max, DataType::Float, "fmax(a, b)" ; "float max")]
#[test_case(BinaryOpType::Max, DataType::Int64, "imax(a, b)" ; "index max")]
#[test_case(BinaryOpType::Mod, DataType::Double, "fmod(a, b)" ; "float remainder")]
#[test_case(BinaryOpType::Mod, DataType::Int32, "(a % b)" ; "int remainder")]
#[test_case(BinaryOpType::CeilDiv, DataType::Int64, "ceilDiv(a, b)" ; "ceil div")]
#[test_case(BinaryOpType::And, DataType::Bool, "(a && b)" ; "logical and")]
#[test_case(BinaryOpType::And, DataType::Int32, "(a & b)" ; "bitwise and")]
fn test_binary_spelling(op: BinaryOpType, dtype: DataType, expected: &str) {
    assert_eq!(binary_expr(op, "a", "b", dtype), expected);
}

#[test]
fn test_index_arithmetic() {
    let mut fusion = Fusion::new();
    let t0 = fusion.symbolic_tensor(2, DataType::Float);
    let t = t0.index();

    let stride = Scalar::TensorStride { tensor: t0, dim: 1 };
    let index = Scalar::ParallelIndex(ParallelType::TIDx).mul(stride);
    assert_eq!(render_scalar(&index), format!("(threadIdx.x * T{t}.stride[1])"));

    let size = Scalar::TensorSize { tensor: t0, dim: 0 };
    assert_eq!(render_scalar(&size.clone().ceil_div(Scalar::Int(128))), format!("ceilDiv(T{t}.size[0], 128)"));
    assert_eq!(render_scalar(&size.max(Scalar::ParallelDim(ParallelType::BIDy))), format!("imax(T{t}.size[0], gridDim.y)"));
    assert_eq!(render_scalar(&Scalar::Int(1 << 40)), "1099511627776LL");
}

#[test]
fn test_float_inputs_use_float_functions() {
    let mut fusion = Fusion::new();
    let s0 = fusion.new_scalar(DataType::Float);
    let input = Scalar::Input { val: s0, dtype: DataType::Float };
    let s = s0.index();
    assert_eq!(render_scalar(&input.clone().max(Scalar::Float(0.5))), format!("fmax(s{s}, 0.5)"));
    assert_eq!(render_scalar_as(&Scalar::Float(0.5), DataType::Float), "0.5f");
    assert_eq!(render_scalar_as(&input, DataType::Float), format!("s{s}"));
}

//! Property tests for constant folding and broadcasting.

use fuser_dtype::DataType;
use proptest::prelude::*;

use crate::{BinaryOpType, ConstValue, Fusion, const_int};

proptest! {
    #[test]
    fn folded_integer_ops_match_host_arithmetic(a in -1000i64..1000, b in 1i64..100) {
        let mut fusion = Fusion::new();
        let cases = [
            (BinaryOpType::Add, a + b),
            (BinaryOpType::Sub, a - b),
            (BinaryOpType::Mul, a * b),
            (BinaryOpType::Div, a / b),
            (BinaryOpType::Mod, a % b),
            (BinaryOpType::Max, a.max(b)),
            (BinaryOpType::Min, a.min(b)),
        ];
        for (op, expected) in cases {
            let v = fusion.binary_op(op, a, b).unwrap();
            prop_assert_eq!(fusion.as_const(v), Some(ConstValue::Int(expected)));
        }
    }

    #[test]
    fn ceil_div_rounds_up(a in 0i64..100_000, b in 1i64..512) {
        let mut fusion = Fusion::new();
        let v = fusion.ceil_div(a, b).unwrap();
        let q = const_int(&fusion, v).unwrap();
        prop_assert!(q * b >= a);
        prop_assert!((q - 1) * b < a || q == 0);
    }

    #[test]
    fn elementwise_output_is_broadcast_only_when_all_inputs_are(
        shape_a in proptest::collection::vec(prop_oneof![Just(1i64), Just(7i64)], 1..4),
        seed in proptest::collection::vec(any::<bool>(), 4),
    ) {
        let shape_b: Vec<i64> = shape_a.iter().zip(&seed).map(|(&s, &flip)| if flip { 7 } else { s }).collect();
        let mut fusion = Fusion::new();
        let a = fusion.concrete_tensor(&shape_a, DataType::Float);
        let b = fusion.concrete_tensor(&shape_b, DataType::Float);
        let out = fusion.add(a, b).unwrap();
        let root = fusion.tv(out).domain().root().to_vec();
        for (d, &id) in root.iter().enumerate() {
            let all_broadcast = shape_a[d] == 1 && shape_b[d] == 1;
            prop_assert_eq!(fusion.id(id).is_broadcast(), all_broadcast);
        }
    }
}

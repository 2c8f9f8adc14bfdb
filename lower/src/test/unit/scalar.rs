use fuser_ir::{ConstValue, ParallelType};
use test_case::test_case;

use crate::kir::{LoopId, Scalar};
use crate::test::helpers::Bindings;

fn i(n: u32) -> Scalar {
    Scalar::Loop(LoopId(n))
}

#[test]
fn test_constants_fold() {
    assert_eq!(Scalar::Int(3).add(Scalar::Int(4)), Scalar::Int(7));
    assert_eq!(Scalar::Int(10).ceil_div(Scalar::Int(4)), Scalar::Int(3));
    assert_eq!(Scalar::Int(5).lt(Scalar::Int(9)), Scalar::TRUE);
    assert_eq!(Scalar::Int(7).max(Scalar::Int(2)), Scalar::Int(7));
}

#[test]
fn test_identities_drop() {
    assert_eq!(i(0).mul(Scalar::ONE), i(0));
    assert_eq!(Scalar::ZERO.add(i(1)), i(1));
    assert_eq!(i(0).mul(Scalar::ZERO), Scalar::ZERO);
    assert_eq!(i(2).rem(Scalar::ONE), Scalar::ZERO);
    assert_eq!(i(2).lt(i(2)), Scalar::Bool(false));
    assert_eq!(Scalar::TRUE.and(i(0).lt(Scalar::Int(4))), i(0).lt(Scalar::Int(4)));
}

#[test]
fn test_conjunction() {
    assert!(Scalar::all([]).is_true());
    assert!(Scalar::all([Scalar::TRUE, Scalar::TRUE]).is_true());
    let guard = i(0).lt(Scalar::Int(8));
    assert_eq!(Scalar::all([Scalar::TRUE, guard.clone()]), guard);
    assert_eq!(Scalar::all([guard, Scalar::Bool(false)]), Scalar::Bool(false));
}

#[test_case(-7, 2, -3, -1 ; "negative dividend truncates")]
#[test_case(7, -2, -3, 1 ; "negative divisor truncates")]
#[test_case(9, 3, 3, 0 ; "exact")]
fn test_division_truncates_toward_zero(a: i64, b: i64, quotient: i64, remainder: i64) {
    assert_eq!(Scalar::Int(a).div(Scalar::Int(b)), Scalar::Int(quotient));
    assert_eq!(Scalar::Int(a).rem(Scalar::Int(b)), Scalar::Int(remainder));
}

#[test]
fn test_division_by_zero_is_left_unfolded() {
    let expr = Scalar::Int(4).div(Scalar::ZERO);
    assert!(matches!(expr, Scalar::Binary(..)));
    assert_eq!(expr.evaluate_int(&Bindings::default()), None);
}

#[test]
fn test_substitute_refolds() {
    let expr = i(0).mul(Scalar::Int(32)).add(i(1)).lt(Scalar::Int(100));
    let last = expr.substitute(&|l| (l == LoopId(0)).then_some(Scalar::Int(3)));
    assert_eq!(last, Scalar::Int(96).add(i(1)).lt(Scalar::Int(100)));
    assert!(!last.uses_loop(LoopId(0)));
    assert!(last.uses_loop(LoopId(1)));

    let folded = last.substitute(&|_| Some(Scalar::Int(31)));
    assert_eq!(folded, Scalar::Bool(false));
}

#[test]
fn test_evaluate_with_launch_indices() {
    let mut env = Bindings::default();
    env.parallel.insert(ParallelType::TIDx, (5, 128));
    env.parallel.insert(ParallelType::BIDx, (2, 10));
    env.loops.insert(LoopId(0), 3);

    let flat = Scalar::ParallelIndex(ParallelType::BIDx)
        .mul(Scalar::ParallelDim(ParallelType::TIDx))
        .add(Scalar::ParallelIndex(ParallelType::TIDx));
    assert_eq!(flat.evaluate_int(&env), Some(261));

    let guard = flat.clone().lt(Scalar::Int(300)).and(i(0).eq(Scalar::Int(3)));
    assert_eq!(guard.evaluate(&env), Some(ConstValue::Bool(true)));
    assert_eq!(Scalar::select(guard, Scalar::Int(1), Scalar::Int(2)).evaluate_int(&env), Some(1));
    assert_eq!(i(7).evaluate(&env), None);
}

#[test]
fn test_display() {
    let expr = i(0).mul(Scalar::Int(4)).add(Scalar::ParallelIndex(ParallelType::TIDx));
    assert_eq!(expr.to_string(), "((i0 * 4) + threadIdx.x)");
    assert_eq!(Scalar::Int(9).ceil_div(i(1)).to_string(), "CeilDiv(9, i1)");
}

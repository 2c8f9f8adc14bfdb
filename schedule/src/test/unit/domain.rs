use fuser_dtype::DataType;
use fuser_ir::{ExpressionEvaluator, Fusion, IterType, ParallelType, const_int};
use test_case::test_case;

use crate::ScheduleExt;
use crate::error::ScheduleError;
use crate::test::helpers::row_sum_fusion;

#[test_case(10, 4 ; "uneven")]
#[test_case(12, 4 ; "even")]
#[test_case(3, 8 ; "factor larger than extent")]
fn test_split_extents(size: usize, factor: i64) {
    let mut fusion = Fusion::new();
    let t0 = fusion.symbolic_tensor(1, DataType::Float);
    fusion.add_input(t0).unwrap();
    let t1 = fusion.set(t0).unwrap();
    fusion.split(t1, 0, factor).unwrap();

    let leaf = fusion.tv(t1).domain().leaf().to_vec();
    assert_eq!(leaf.len(), 2);
    assert_eq!(const_int(&fusion, fusion.extent(leaf[1])), Some(factor));
    let mut eval = ExpressionEvaluator::new(&fusion);
    eval.bind_tensor_sizes(t0, &[size]).unwrap();
    let outer = eval.evaluate_int(fusion.extent(leaf[0])).unwrap();
    assert_eq!(outer, (size as i64 + factor - 1) / factor);
}

#[test]
fn test_outer_split_swaps_roles() {
    let mut fusion = Fusion::new();
    let t0 = fusion.concrete_tensor(&[32], DataType::Float);
    let t1 = fusion.set(t0).unwrap();
    fusion.outer_split(t1, 0, 4).unwrap();
    let leaf = fusion.tv(t1).domain().leaf().to_vec();
    assert_eq!(const_int(&fusion, fusion.extent(leaf[0])), Some(4));
    assert_eq!(const_int(&fusion, fusion.extent(leaf[1])), Some(8));
}

#[test]
fn test_merge_multiplies_extents() {
    let mut fusion = Fusion::new();
    let t0 = fusion.symbolic_tensor(2, DataType::Float);
    fusion.add_input(t0).unwrap();
    let t1 = fusion.set(t0).unwrap();
    fusion.merge(t1, 0, 1).unwrap();
    let merged = fusion.tv(t1).axis(0);
    let mut eval = ExpressionEvaluator::new(&fusion);
    eval.bind_tensor_sizes(t0, &[6, 7]).unwrap();
    assert_eq!(eval.evaluate_int(fusion.extent(merged)), Some(42));
    assert_eq!(fusion.tv(t1).n_dims(), 1);
}

#[test]
fn test_merge_broadcast_takes_other_type() {
    let mut fusion = Fusion::new();
    let t0 = fusion.concrete_tensor(&[1, 8], DataType::Float);
    let t1 = fusion.set(t0).unwrap();
    fusion.merge(t1, 0, 1).unwrap();
    assert_eq!(fusion.id(fusion.tv(t1).axis(0)).iter_type, IterType::Iteration);
}

#[test]
fn test_merge_rejects_iteration_with_reduction() {
    let (mut fusion, [_, _, t2]) = row_sum_fusion();
    let result = fusion.merge(t2, 0, 1);
    assert!(matches!(result, Err(ScheduleError::InvalidMerge { tv, outer: 0, inner: 1, .. }) if tv == t2));
}

#[test]
fn test_reorder_fills_free_slots_in_order() {
    let mut fusion = Fusion::new();
    let t0 = fusion.symbolic_tensor(3, DataType::Float);
    let t1 = fusion.set(t0).unwrap();
    let before = fusion.tv(t1).domain().leaf().to_vec();
    fusion.reorder(t1, &[(0, 2)]).unwrap();
    assert_eq!(fusion.tv(t1).domain().leaf(), &[before[1], before[2], before[0]]);

    fusion.reorder(t1, &[(-1, 0), (0, -1)]).unwrap();
    assert_eq!(fusion.tv(t1).domain().leaf(), &[before[0], before[2], before[1]]);
}

#[test]
fn test_reorder_rejects_collisions() {
    let mut fusion = Fusion::new();
    let t0 = fusion.symbolic_tensor(3, DataType::Float);
    let t1 = fusion.set(t0).unwrap();
    assert!(matches!(fusion.reorder(t1, &[(0, 1), (2, 1)]), Err(ScheduleError::InvalidReorder { .. })));
    assert!(matches!(fusion.reorder(t1, &[(0, 1), (0, 2)]), Err(ScheduleError::InvalidReorder { .. })));
}

#[test_case(0 ; "zero")]
#[test_case(-3 ; "negative")]
fn test_split_rejects_non_positive_factor(factor: i64) {
    let mut fusion = Fusion::new();
    let t0 = fusion.symbolic_tensor(1, DataType::Float);
    let t1 = fusion.set(t0).unwrap();
    assert_eq!(fusion.split(t1, 0, factor), Err(ScheduleError::InvalidSplitFactor { tv: t1 }));
}

#[test]
fn test_split_by_runtime_scalar() {
    let mut fusion = Fusion::new();
    let t0 = fusion.symbolic_tensor(1, DataType::Float);
    fusion.add_input(t0).unwrap();
    let factor = fusion.new_scalar(DataType::Int64);
    fusion.add_input(factor).unwrap();
    let t1 = fusion.set(t0).unwrap();
    fusion.split(t1, 0, factor).unwrap();
    assert_eq!(fusion.extent(fusion.tv(t1).axis(1)), factor);

    let float = fusion.new_scalar(DataType::Float);
    assert_eq!(fusion.split(t1, 0, float), Err(ScheduleError::InvalidSplitFactor { tv: t1 }));
}

#[test]
fn test_fixed_axes_are_rejected() {
    let mut fusion = Fusion::new();
    let t0 = fusion.symbolic_tensor(2, DataType::Float);
    fusion.add_input(t0).unwrap();
    let t1 = fusion.add(t0, 1.0).unwrap();
    let t2 = fusion.mul(t1, 2.0).unwrap();
    fusion.add_output(t2).unwrap();
    fusion.compute_at(t1, t2, 1).unwrap();

    assert_eq!(fusion.split(t1, 0, 4), Err(ScheduleError::AxisFixed { tv: t1, axis: 0, fixed: 1 }));
    assert_eq!(fusion.split(t2, 0, 4), Err(ScheduleError::AxisFixed { tv: t2, axis: 0, fixed: 1 }));
    fusion.split(t1, 1, 4).unwrap();
    assert_eq!(fusion.tv(t1).n_dims(), 3);
}

#[test]
fn test_vectorize_must_be_innermost() {
    let mut fusion = Fusion::new();
    let t0 = fusion.concrete_tensor(&[8, 16], DataType::Float);
    let t1 = fusion.set(t0).unwrap();
    fusion.split(t1, 1, 4).unwrap();
    assert!(matches!(
        fusion.parallelize(t1, 1, ParallelType::Vectorize),
        Err(ScheduleError::InvalidParallelize { axis: 1, .. })
    ));
    fusion.parallelize(t1, -1, ParallelType::Vectorize).unwrap();
    fusion.parallelize(t1, 0, ParallelType::BIDx).unwrap();
    assert_eq!(fusion.id(fusion.tv(t1).axis(2)).parallel_type, ParallelType::Vectorize);
}

use fuser_dtype::DataType;
use fuser_ir::{Fusion, MemoryType, ParallelType};
use fuser_schedule::ScheduleExt;
use test_case::test_case;

use crate::error::LowerError;
use crate::gpu_lower::{GpuLower, lower};
use crate::test::helpers::pointwise_fusion;

fn vectorize_reason(result: crate::Result<GpuLower>) -> &'static str {
    match result {
        Err(LowerError::InvalidVectorize { reason, .. }) => reason,
        other => panic!("expected a vectorization error, got {other:?}"),
    }
}

/// `t1 = set(t0)` over a concrete input, with `t1` an output.
fn copy_fusion(sizes: &[i64], dtype: DataType) -> (Fusion, [fuser_ir::ValId; 2]) {
    let mut fusion = Fusion::new();
    let t0 = fusion.concrete_tensor(sizes, dtype);
    fusion.add_input(t0).unwrap();
    let t1 = fusion.set(t0).unwrap();
    fusion.add_output(t1).unwrap();
    (fusion, [t0, t1])
}

#[test]
fn test_fusion_without_outputs() {
    let mut fusion = Fusion::new();
    let t0 = fusion.symbolic_tensor(1, DataType::Float);
    fusion.add_input(t0).unwrap();
    assert_eq!(lower(&fusion).unwrap_err(), LowerError::NoOutputs);
}

#[test]
fn test_register_producer_needs_matching_threads() {
    let (mut fusion, t) = pointwise_fusion(Some(&[8, 32]));
    fusion.parallelize(t[1], 1, ParallelType::TIDx).unwrap();
    assert_eq!(
        lower(&fusion).unwrap_err(),
        LowerError::ParallelMismatch { producer: t[1], consumer: t[2], parallel: ParallelType::TIDx, required: MemoryType::Shared }
    );
}

#[test]
fn test_shared_producer_may_differ_in_threads() {
    let (mut fusion, t) = pointwise_fusion(Some(&[8, 32]));
    fusion.set_memory_type(t[1], MemoryType::Shared).unwrap();
    fusion.parallelize(t[1], 1, ParallelType::TIDx).unwrap();
    lower(&fusion).unwrap();
}

#[test]
fn test_shared_producer_needs_matching_blocks() {
    let (mut fusion, t) = pointwise_fusion(Some(&[8, 32]));
    fusion.set_memory_type(t[1], MemoryType::Shared).unwrap();
    fusion.parallelize(t[1], 0, ParallelType::BIDx).unwrap();
    assert!(matches!(
        lower(&fusion).unwrap_err(),
        LowerError::ParallelMismatch { parallel: ParallelType::BIDx, required: MemoryType::Global, .. }
    ));
}

#[test]
fn test_axis_bound_twice() {
    let (mut fusion, t) = pointwise_fusion(Some(&[8, 32]));
    fusion.parallelize(t[2], 0, ParallelType::TIDx).unwrap();
    fusion.parallelize(t[2], 1, ParallelType::TIDx).unwrap();
    assert!(matches!(lower(&fusion).unwrap_err(), LowerError::Unsupported { .. }));
}

#[test]
fn test_two_grid_reductions_are_rejected() {
    let mut fusion = Fusion::new();
    let t0 = fusion.concrete_tensor(&[64, 64], DataType::Float);
    fusion.add_input(t0).unwrap();
    let t1 = fusion.sum(t0, &[1]).unwrap();
    let t2 = fusion.sum(t0, &[0]).unwrap();
    fusion.add_output(t1).unwrap();
    fusion.add_output(t2).unwrap();
    fusion.parallelize(t1, 1, ParallelType::BIDx).unwrap();
    fusion.parallelize(t2, 0, ParallelType::BIDx).unwrap();
    assert_eq!(lower(&fusion).unwrap_err(), LowerError::MultipleGridReductions { count: 2 });
}

#[test]
fn test_vectorized_copy() {
    let (mut fusion, [t0, t1]) = copy_fusion(&[8, 64], DataType::Float);
    fusion.split(t1, 1, 4).unwrap();
    fusion.parallelize(t1, 2, ParallelType::Vectorize).unwrap();
    fusion.parallelize(t1, 1, ParallelType::TIDx).unwrap();
    let lowered = GpuLower::new(&fusion).unwrap();

    let accesses = &lowered.kernel().summary.vectorized;
    assert_eq!(accesses.len(), 2);
    assert_eq!(accesses.iter().map(|a| a.tv).collect::<Vec<_>>(), vec![t0, t1]);
    for access in accesses {
        assert_eq!(access.width, 4);
        assert_eq!(access.merged_dims, 1);
        assert!(!access.misaligned);
    }
}

#[test]
fn test_merged_inner_axes_vectorize_together() {
    let (mut fusion, [_, t1]) = copy_fusion(&[4, 6, 8], DataType::Float);
    fusion.merge(t1, 1, 2).unwrap();
    fusion.split(t1, 1, 2).unwrap();
    fusion.parallelize(t1, 2, ParallelType::Vectorize).unwrap();
    let lowered = GpuLower::new(&fusion).unwrap();
    assert!(lowered.kernel().summary.vectorized.iter().all(|a| a.merged_dims == 2));
}

#[test_case(DataType::Float, 8 ; "thirty two bytes")]
#[test_case(DataType::Double, 4 ; "double width")]
fn test_vector_too_wide(dtype: DataType, width: i64) {
    let (mut fusion, [_, t1]) = copy_fusion(&[8, 64], dtype);
    fusion.split(t1, 1, width).unwrap();
    fusion.parallelize(t1, 2, ParallelType::Vectorize).unwrap();
    assert_eq!(
        vectorize_reason(GpuLower::new(&fusion)),
        "vector width must be a power of two of at most 16 bytes"
    );
}

#[test]
fn test_only_copies_vectorize() {
    let (mut fusion, t) = pointwise_fusion(Some(&[8, 64]));
    fusion.split(t[2], 1, 4).unwrap();
    fusion.parallelize(t[2], 2, ParallelType::Vectorize).unwrap();
    assert_eq!(vectorize_reason(GpuLower::new(&fusion)), "only set operations can be vectorized");
}

#[test]
fn test_vectorized_axis_must_come_from_the_innermost_root() {
    let (mut fusion, [_, t1]) = copy_fusion(&[8, 64], DataType::Float);
    fusion.reorder(t1, &[(0, 1)]).unwrap();
    fusion.split(t1, 1, 4).unwrap();
    fusion.parallelize(t1, 2, ParallelType::Vectorize).unwrap();
    assert_eq!(
        vectorize_reason(GpuLower::new(&fusion)),
        "the vectorized axis must come from the innermost root axes"
    );
}

use fuser_dtype::DataType;
use fuser_ir::{Fusion, MemoryType, ParallelType, ValId, const_int};
use test_case::test_case;

use crate::error::ScheduleError;
use crate::heuristics::{ArgInfo, HeuristicParams, ScheduleHeuristic, SchedulerRuntimeInfo};
use crate::test::helpers::{centering_fusion, row_sum_fusion, runtime_info};
use crate::{can_schedule, propose_heuristic, schedule_fusion};

/// `t1 = t0 * 2; t2 = t1 + 1`
fn pointwise_fusion() -> (Fusion, [ValId; 3]) {
    let mut fusion = Fusion::new();
    let t0 = fusion.symbolic_tensor(2, DataType::Float);
    fusion.add_input(t0).unwrap();
    let t1 = fusion.mul(t0, 2.0).unwrap();
    let t2 = fusion.add(t1, 1.0).unwrap();
    fusion.add_output(t2).unwrap();
    (fusion, [t0, t1, t2])
}

fn parallel(fusion: &Fusion, tv: ValId, axis: usize) -> ParallelType {
    fusion.id(fusion.tv(tv).axis(axis)).parallel_type
}

#[test_case(&[8, 16], 4 ; "divisible by four")]
#[test_case(&[8, 6], 2 ; "divisible by two")]
#[test_case(&[8, 7], 1 ; "odd innermost")]
fn test_pointwise_vector_width(sizes: &[usize], expected: i64) {
    let (fusion, _) = pointwise_fusion();
    let info = runtime_info(&fusion, &[sizes]);
    match propose_heuristic(&fusion, &info).unwrap() {
        HeuristicParams::Pointwise(params) => assert_eq!(params.vector_width, expected),
        other => panic!("expected pointwise parameters, got {other:?}"),
    }
}

#[test]
fn test_column_major_input_selects_transpose() {
    let (fusion, [t0, ..]) = pointwise_fusion();
    let args = vec![ArgInfo::Tensor { dtype: DataType::Float, sizes: vec![64, 64], strides: vec![1, 64] }];
    let info = SchedulerRuntimeInfo::new(&fusion, args).unwrap();
    match propose_heuristic(&fusion, &info).unwrap() {
        HeuristicParams::Transpose(params) => {
            assert_eq!(params.inner_dim, 0);
            assert_eq!(params.transposed, vec![t0]);
        }
        other => panic!("expected transpose parameters, got {other:?}"),
    }
}

#[test]
fn test_small_column_major_input_stays_pointwise() {
    let (fusion, _) = pointwise_fusion();
    let args = vec![ArgInfo::Tensor { dtype: DataType::Float, sizes: vec![16, 64], strides: vec![1, 16] }];
    let info = SchedulerRuntimeInfo::new(&fusion, args).unwrap();
    let params = propose_heuristic(&fusion, &info).unwrap();
    assert_eq!(params.heuristic(), ScheduleHeuristic::Pointwise);
    match params {
        HeuristicParams::Pointwise(params) => assert_eq!(params.vector_width, 1),
        other => panic!("expected pointwise parameters, got {other:?}"),
    }
}

#[test_case(&[16, 1000], false ; "many rows")]
#[test_case(&[2, 32768], true ; "few long rows")]
#[test_case(&[2, 1000], false ; "few short rows")]
fn test_reduction_cross_block(sizes: &[usize], cross_block: bool) {
    let (fusion, _) = row_sum_fusion();
    let info = runtime_info(&fusion, &[sizes]);
    let params = propose_heuristic(&fusion, &info).unwrap();
    assert_eq!(params.heuristic(), ScheduleHeuristic::Reduction);
    match params {
        HeuristicParams::Reduction(params) => assert_eq!(params.cross_block, cross_block),
        other => panic!("expected reduction parameters, got {other:?}"),
    }
}

#[test]
fn test_normalization_is_persistent() {
    let (fusion, _) = centering_fusion();
    let info = runtime_info(&fusion, &[&[16, 1000]]);
    assert_eq!(propose_heuristic(&fusion, &info).unwrap().heuristic(), ScheduleHeuristic::Persistent);

    let wide = runtime_info(&fusion, &[&[16, 20000]]);
    assert!(matches!(propose_heuristic(&fusion, &wide), Err(ScheduleError::NoScheduler { .. })));
    assert!(!can_schedule(&fusion, &wide));
}

#[test]
fn test_mismatched_reductions_are_rejected() {
    let mut fusion = Fusion::new();
    let t0 = fusion.symbolic_tensor(2, DataType::Float);
    fusion.add_input(t0).unwrap();
    let t1 = fusion.sum(t0, &[0]).unwrap();
    let t2 = fusion.sum(t0, &[1]).unwrap();
    fusion.add_output(t1).unwrap();
    fusion.add_output(t2).unwrap();
    let info = runtime_info(&fusion, &[&[8, 8]]);
    assert!(!can_schedule(&fusion, &info));
}

#[test]
fn test_argument_count_is_checked() {
    let (fusion, _) = pointwise_fusion();
    assert!(matches!(SchedulerRuntimeInfo::new(&fusion, Vec::new()), Err(ScheduleError::NoScheduler { .. })));
}

#[test]
fn test_scheduled_fusion_is_rejected() {
    let (mut fusion, _) = pointwise_fusion();
    let info = runtime_info(&fusion, &[&[8, 7]]);
    let params = propose_heuristic(&fusion, &info).unwrap();
    schedule_fusion(&mut fusion, &params).unwrap();
    assert!(!can_schedule(&fusion, &info));
}

#[test]
fn test_pointwise_schedule() {
    let (mut fusion, [t0, t1, t2]) = pointwise_fusion();
    let info = runtime_info(&fusion, &[&[8, 7]]);
    let params = propose_heuristic(&fusion, &info).unwrap();
    schedule_fusion(&mut fusion, &params).unwrap();

    assert_eq!(fusion.tv(t0).compute_at_position(), 0);
    assert_eq!(fusion.tv(t1).compute_at_position(), 2);
    assert_eq!(fusion.tv(t2).max_producer_position(), 2);
    for tv in [t1, t2] {
        assert_eq!(fusion.tv(tv).n_dims(), 2);
        assert_eq!(parallel(&fusion, tv, 0), ParallelType::BIDx);
        assert_eq!(parallel(&fusion, tv, 1), ParallelType::TIDx);
        assert_eq!(const_int(&fusion, fusion.extent(fusion.tv(tv).axis(1))), Some(128));
    }
}

#[test]
fn test_vectorized_pointwise_schedule() {
    let (mut fusion, [t0, t1, t2]) = pointwise_fusion();
    let info = runtime_info(&fusion, &[&[8, 16]]);
    let params = propose_heuristic(&fusion, &info).unwrap();
    schedule_fusion(&mut fusion, &params).unwrap();

    let [load] = fusion.consumer_tvs(t0)[..] else { panic!("expected one cache of the input") };
    let [store] = fusion.producer_tvs(t2)[..] else { panic!("expected one cache of the output") };
    assert_eq!(fusion.producer_tvs(t1), vec![load]);
    assert_eq!(fusion.producer_tvs(store), vec![t1]);

    for tv in [load, t2] {
        assert_eq!(fusion.tv(tv).n_dims(), 3);
        assert_eq!(parallel(&fusion, tv, 2), ParallelType::Vectorize);
        assert_eq!(const_int(&fusion, fusion.extent(fusion.tv(tv).axis(2))), Some(4));
    }
    assert_eq!(parallel(&fusion, t1, 2), ParallelType::Serial);
    assert_eq!(parallel(&fusion, t1, 1), ParallelType::TIDx);
    assert_eq!(fusion.tv(load).compute_at_position(), 2);
}

#[test]
fn test_reduction_schedule() {
    let (mut fusion, [_, t1, t2]) = row_sum_fusion();
    let info = runtime_info(&fusion, &[&[16, 1000]]);
    let params = propose_heuristic(&fusion, &info).unwrap();
    schedule_fusion(&mut fusion, &params).unwrap();

    let [partial] = fusion.producer_tvs(t2)[..] else { panic!("expected one partial reduction") };
    assert_eq!(fusion.producer_tvs(partial), vec![t1]);
    assert_eq!(fusion.tv(t1).compute_at_position(), 3);
    assert_eq!(fusion.tv(partial).compute_at_position(), 2);
    assert_eq!(fusion.tv(t2).max_producer_position(), 2);
    assert_eq!(parallel(&fusion, partial, 0), ParallelType::BIDx);
    // compute_at moves the rfactored lane axis ahead of the serial remainder.
    assert_eq!(parallel(&fusion, partial, 1), ParallelType::TIDx);
    assert!(fusion.id(fusion.tv(partial).axis(1)).is_rfactor);
    assert!(fusion.id(fusion.tv(partial).axis(2)).is_reduction());
    assert_eq!(parallel(&fusion, partial, 2), ParallelType::Serial);
    assert!(fusion.id(fusion.tv(t2).axis(1)).is_reduction());
}

#[test]
fn test_persistent_schedule_inlines_the_row() {
    let (mut fusion, [t0, t1, t2, t3]) = centering_fusion();
    let info = runtime_info(&fusion, &[&[16, 1000]]);
    let params = propose_heuristic(&fusion, &info).unwrap();
    schedule_fusion(&mut fusion, &params).unwrap();

    assert_eq!(fusion.tv(t0).compute_at_position(), 0);
    for tv in fusion.all_tensors() {
        if tv != t0 && tv != t3 {
            assert!(fusion.tv(tv).compute_at_position() >= 1, "{tv}");
        }
    }
    assert!(fusion.id(fusion.tv(t1).axis(1)).is_reduction());
    assert_eq!(parallel(&fusion, t3, 0), ParallelType::BIDx);
    assert_eq!(fusion.tv(t2).n_dims(), 3);
}

#[test]
fn test_transpose_schedule_stages_in_shared_memory() {
    let (mut fusion, [t0, t1, t2]) = pointwise_fusion();
    let args = vec![ArgInfo::Tensor { dtype: DataType::Float, sizes: vec![64, 64], strides: vec![1, 64] }];
    let info = SchedulerRuntimeInfo::new(&fusion, args).unwrap();
    let params = propose_heuristic(&fusion, &info).unwrap();
    schedule_fusion(&mut fusion, &params).unwrap();

    let [staged] = fusion.consumer_tvs(t0)[..] else { panic!("expected one staged input") };
    assert_eq!(fusion.tv(staged).memory_type(), MemoryType::Shared);
    assert_eq!(fusion.tv(staged).compute_at_position(), 1);
    for tv in [staged, t1, t2] {
        assert_eq!(fusion.tv(tv).n_dims(), 3);
        assert_eq!(parallel(&fusion, tv, 0), ParallelType::BIDx);
        assert_eq!(parallel(&fusion, tv, 2), ParallelType::TIDx);
    }
}

use fuser_dtype::DataType;
use fuser_ir::{Fusion, same_scalar};

use crate::error::ScheduleError;
use crate::test::helpers::{diamond_fusion, row_sum_fusion};
use crate::{ReplayMode, ScheduleExt, replay_consumer_as_producer};

fn positions(fusion: &Fusion, tv: fuser_ir::ValId) -> (usize, usize) {
    let view = fusion.tv(tv);
    (view.compute_at_position(), view.max_producer_position())
}

#[test]
fn test_diamond_compute_at_positions() {
    let (mut fusion, t) = diamond_fusion();
    fusion.split(t[7], 0, 128).unwrap();
    fusion.split(t[7], 0, 4).unwrap();
    fusion.compute_at(t[0], t[7], 1).unwrap();

    assert_eq!(positions(&fusion, t[7]), (0, 1));
    for &tv in &t[1..=5] {
        assert_eq!(fusion.tv(tv).compute_at_position(), 1, "{tv}");
    }
    assert_eq!(positions(&fusion, t[6]), (0, 1));
    assert_eq!(positions(&fusion, t[0]).0, 0);

    let outer = fusion.extent(fusion.tv(t[7]).axis(0));
    for &tv in &t[1..=6] {
        assert!(same_scalar(&fusion, fusion.extent(fusion.tv(tv).axis(0)), outer), "{tv}");
    }
}

#[test]
fn test_inlined_axes_are_shared_structure() {
    let (mut fusion, t) = diamond_fusion();
    fusion.split(t[7], 1, 32).unwrap();
    fusion.compute_at(t[0], t[7], 2).unwrap();
    assert_eq!(fusion.tv(t[4]).compute_at_position(), 2);
    assert_eq!(fusion.tv(t[4]).n_dims(), 3);
    let inner = fusion.extent(fusion.tv(t[7]).axis(1));
    assert!(same_scalar(&fusion, fusion.extent(fusion.tv(t[4]).axis(1)), inner));
}

#[test]
fn test_negative_position_counts_from_end() {
    let mut fusion = Fusion::new();
    let t0 = fusion.symbolic_tensor(2, DataType::Float);
    fusion.add_input(t0).unwrap();
    let t1 = fusion.add(t0, 1.0).unwrap();
    let t2 = fusion.mul(t1, 2.0).unwrap();
    fusion.add_output(t2).unwrap();
    fusion.compute_at(t1, t2, -1).unwrap();
    assert_eq!(positions(&fusion, t1), (2, 0));
    assert_eq!(positions(&fusion, t2), (0, 2));
}

#[test]
fn test_position_out_of_range() {
    let mut fusion = Fusion::new();
    let t0 = fusion.symbolic_tensor(2, DataType::Float);
    fusion.add_input(t0).unwrap();
    let t1 = fusion.add(t0, 1.0).unwrap();
    let t2 = fusion.mul(t1, 2.0).unwrap();
    fusion.add_output(t2).unwrap();
    assert_eq!(fusion.compute_at(t1, t2, 3), Err(ScheduleError::PositionOutOfRange { tv: t2, pos: 3, ndims: 2 }));
    assert_eq!(fusion.compute_at(t1, t2, -4), Err(ScheduleError::PositionOutOfRange { tv: t2, pos: -4, ndims: 2 }));
    assert_eq!(fusion.compute_at(t2, t1, 1), Err(ScheduleError::NotAProducer { producer: t2, consumer: t1 }));
}

#[test]
fn test_positions_only_grow() {
    let mut fusion = Fusion::new();
    let t0 = fusion.symbolic_tensor(2, DataType::Float);
    fusion.add_input(t0).unwrap();
    let t1 = fusion.add(t0, 1.0).unwrap();
    let t2 = fusion.mul(t1, 2.0).unwrap();
    fusion.add_output(t2).unwrap();
    fusion.compute_at(t1, t2, 2).unwrap();
    fusion.compute_at(t1, t2, 1).unwrap();
    assert_eq!(positions(&fusion, t1), (2, 0));
    assert_eq!(positions(&fusion, t2), (0, 2));
}

/// `t1 = broadcast(t0)` feeds two consumers whose concrete axes are not
/// known to agree, so the broadcast axis cannot be inlined.
#[test]
fn test_ambiguous_broadcast_is_unmappable() {
    let mut fusion = Fusion::new();
    let t0 = fusion.symbolic_tensor(1, DataType::Float);
    let t2 = fusion.symbolic_tensor(2, DataType::Float);
    let t4 = fusion.symbolic_tensor(2, DataType::Float);
    for tv in [t0, t2, t4] {
        fusion.add_input(tv).unwrap();
    }
    let t1 = fusion.broadcast(t0, &[false, true]).unwrap();
    let t3 = fusion.add(t1, t2).unwrap();
    let t5 = fusion.add(t1, t4).unwrap();
    fusion.add_output(t3).unwrap();
    fusion.add_output(t5).unwrap();

    let id = fusion.tv(t3).axis(1);
    assert_eq!(fusion.compute_at(t1, t3, 2), Err(ScheduleError::UnmappableAxis { producer: t1, consumer: t3, id }));
    fusion.compute_at(t1, t3, 1).unwrap();
    assert_eq!(fusion.tv(t1).compute_at_position(), 1);
}

#[test]
fn test_single_consumer_broadcast_is_inlined() {
    let mut fusion = Fusion::new();
    let t0 = fusion.symbolic_tensor(1, DataType::Float);
    let t2 = fusion.symbolic_tensor(2, DataType::Float);
    fusion.add_input(t0).unwrap();
    fusion.add_input(t2).unwrap();
    let t1 = fusion.broadcast(t0, &[false, true]).unwrap();
    let t3 = fusion.add(t1, t2).unwrap();
    fusion.add_output(t3).unwrap();
    fusion.compute_at(t1, t3, 2).unwrap();
    assert_eq!(positions(&fusion, t1), (2, 0));
    assert_eq!(positions(&fusion, t3), (0, 2));
}

#[test]
fn test_reduction_axis_is_not_inlined() {
    let (mut fusion, [_, _, t2]) = row_sum_fusion();
    let t3 = fusion.add(t2, 1.0).unwrap();
    fusion.add_output(t3).unwrap();
    let id = fusion.tv(t2).axis(1);
    assert_eq!(
        replay_consumer_as_producer(&mut fusion, None, t3, t2, 2, ReplayMode::ComputeAt),
        Err(ScheduleError::ReductionInlined { tv: t2, id })
    );
    fusion.compute_at(t2, t3, -1).unwrap();
    assert_eq!(positions(&fusion, t2), (1, 0));
}

#[test]
fn test_compute_at_through_reduction() {
    let (mut fusion, [t0, t1, t2]) = row_sum_fusion();
    fusion.split(t2, 1, 32).unwrap();
    fusion.compute_at(t0, t2, -1).unwrap();
    assert_eq!(positions(&fusion, t1), (3, 0));
    assert_eq!(positions(&fusion, t2), (0, 3));
}

#[test]
fn test_stacked_diamonds_are_inlined() {
    // 2^32 use paths from the first tensor to the output.
    let mut fusion = Fusion::new();
    let t0 = fusion.symbolic_tensor(2, DataType::Float);
    fusion.add_input(t0).unwrap();
    let first = fusion.mul(t0, 0.5).unwrap();
    let mut tensors = vec![first];
    let mut x = first;
    for _ in 0..32 {
        let a = fusion.mul(x, 2.0).unwrap();
        let b = fusion.add(x, 1.0).unwrap();
        x = fusion.add(a, b).unwrap();
        tensors.extend([a, b, x]);
    }
    fusion.add_output(x).unwrap();
    fusion.split(x, 1, 128).unwrap();
    fusion.compute_at(first, x, 2).unwrap();

    assert_eq!(positions(&fusion, x), (0, 2));
    for &tv in &tensors[..tensors.len() - 1] {
        assert_eq!(fusion.tv(tv).compute_at_position(), 2, "{tv}");
        assert_eq!(fusion.tv(tv).n_dims(), 3, "{tv}");
    }
}

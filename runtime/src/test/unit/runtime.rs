use std::sync::Arc;

use fuser_dtype::DataType;
use fuser_ir::Fusion;
use fuser_schedule::ScheduleHeuristic;
use ndarray::{Array2, Axis};

use crate::error::Error;
use crate::test::helpers::*;
use crate::{Argument, FuserConfig, FusionKernelRuntime, HostBackend, LaunchParams};

fn compile(fusion: &Fusion, args: &[Argument], config: &FuserConfig) -> crate::Result<FusionKernelRuntime> {
    FusionKernelRuntime::compile(fusion, args, config, Arc::new(HostBackend))
}

fn conflicting_reference(x: &Array2<f64>) -> ndarray::ArrayD<f64> {
    let rows = x.sum_axis(Axis(1)).insert_axis(Axis(1));
    (x + &rows).sum_axis(Axis(0)).into_dyn()
}

#[test]
fn test_single_kernel_fusion_is_not_segmented() {
    let (fusion, _) = pointwise_fusion();
    let x = input(4, 8);
    let args = [float(&x).into()];
    let runtime = compile(&fusion, &args, &FuserConfig::default()).unwrap();
    assert!(!runtime.is_segmented());
    assert_eq!(runtime.executors().len(), 1);
    let outputs = runtime.run(&args, &LaunchParams::default()).unwrap();
    assert_close(&outputs[0], &((&x + 1.0) * 2.0).into_dyn(), 0.0);
}

#[test]
fn test_segmented_matches_unsegmented() {
    let (fusion, _) = conflicting_reductions();
    let x = input(16, 1000);
    let args = [float(&x).into()];
    let runtime = compile(&fusion, &args, &FuserConfig::default()).unwrap();
    assert!(runtime.is_segmented());
    let groups = runtime.segmented_fusion().groups();
    assert_eq!(groups.len(), 2);
    assert!(groups.iter().all(|g| g.heuristic().heuristic() == ScheduleHeuristic::Reduction));

    let segmented = runtime.run(&args, &LaunchParams::default()).unwrap();
    // The complete fusion lowered without a schedule is one serial kernel.
    let unsegmented = run(&fusion, &args);
    assert_eq!(segmented[0].to_array(), unsegmented[0].to_array());
    assert_close(&segmented[0], &conflicting_reference(&x), 0.0);
}

#[test]
fn test_disabled_segmentation_is_an_error() {
    let (fusion, _) = conflicting_reductions();
    let args = [float(&input(16, 1000)).into()];
    let config = FuserConfig::builder().disable_segmentation(true).build();
    let err = compile(&fusion, &args, &config).err().unwrap();
    assert!(matches!(err, Error::SegmentationDisabled { .. }), "{err}");

    let (pointwise, _) = pointwise_fusion();
    let args = [float(&input(4, 4)).into()];
    assert!(compile(&pointwise, &args, &config).is_ok());
}

/// `t1 = sum(t0, [1]); t2 = broadcast(t1); t3 = t0 * t2; t4 = t3 + 1;
/// t5 = sum(t4, [0])`.
fn three_stage_fusion() -> Fusion {
    let mut fusion = Fusion::new();
    let t0 = fusion.symbolic_tensor(2, DataType::Float);
    fusion.add_input(t0).unwrap();
    let t1 = fusion.sum(t0, &[1]).unwrap();
    let t2 = fusion.broadcast(t1, &[false, true]).unwrap();
    let t3 = fusion.mul(t0, t2).unwrap();
    let t4 = fusion.add(t3, 1.0).unwrap();
    let t5 = fusion.sum(t4, &[0]).unwrap();
    fusion.add_output(t5).unwrap();
    fusion
}

#[test]
fn test_segment_aliasing_preserves_results() {
    let fusion = three_stage_fusion();
    let x = input(12, 300);
    let args = [float(&x).into()];
    let plain = compile(&fusion, &args, &FuserConfig::default()).unwrap();
    let config = FuserConfig::builder().segment_aliasing(true).build();
    let aliased = compile(&fusion, &args, &config).unwrap();
    assert!(plain.is_segmented());

    let expected = plain.run(&args, &LaunchParams::default()).unwrap();
    let actual = aliased.run(&args, &LaunchParams::default()).unwrap();
    assert_eq!(expected[0].to_array(), actual[0].to_array());

    let rows = x.sum_axis(Axis(1)).insert_axis(Axis(1));
    let reference = (&x * &rows + 1.0).sum_axis(Axis(0)).into_dyn();
    assert_close(&actual[0], &reference, 1e-6);
}

#[test]
fn test_every_segment_output_is_returned() {
    let mut fusion = Fusion::new();
    let t0 = fusion.symbolic_tensor(2, DataType::Float);
    fusion.add_input(t0).unwrap();
    let t1 = fusion.sum(t0, &[1]).unwrap();
    let t2 = fusion.broadcast(t1, &[false, true]).unwrap();
    let t3 = fusion.add(t0, t2).unwrap();
    let t4 = fusion.sum(t3, &[0]).unwrap();
    fusion.add_output(t1).unwrap();
    fusion.add_output(t4).unwrap();

    let x = input(10, 64);
    let args = [float(&x).into()];
    let runtime = compile(&fusion, &args, &FuserConfig::default()).unwrap();
    let outputs = runtime.run(&args, &LaunchParams::default()).unwrap();
    assert_eq!(outputs.len(), 2);
    assert_close(&outputs[0], &x.sum_axis(Axis(1)).into_dyn(), 0.0);
    assert_close(&outputs[1], &conflicting_reference(&x), 0.0);
}

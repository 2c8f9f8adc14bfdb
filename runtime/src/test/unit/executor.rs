use std::sync::Arc;

use fuser_dtype::DataType;
use fuser_ir::{ConstValue, Fusion, ParallelType, ParallelTypeSet};
use fuser_schedule::{ScheduleExt, parallelize_all_like};
use ndarray::Array2;
use test_case::test_case;

use crate::error::Error;
use crate::test::helpers::*;
use crate::{Argument, FuserConfig, FusionExecutor, HostBackend, HostTensor, LaunchParams};

fn flat_schedule(fusion: &mut Fusion, t: [fuser_ir::ValId; 3]) {
    fusion.merge(t[2], 0, 1).unwrap();
    fusion.split(t[2], 0, 128).unwrap();
    fusion.compute_at(t[1], t[2], -1).unwrap();
    fusion.parallelize(t[2], 0, ParallelType::BIDx).unwrap();
    fusion.parallelize(t[2], 1, ParallelType::TIDx).unwrap();
}

#[test_case(1, 1 ; "single element")]
#[test_case(3, 5 ; "smaller than a block")]
#[test_case(17, 129 ; "ragged last block")]
fn test_flat_pointwise_matches_reference(rows: usize, cols: usize) {
    let (mut fusion, t) = pointwise_fusion();
    flat_schedule(&mut fusion, t);
    let x = input(rows, cols);
    let outputs = run(&fusion, &[float(&x).into()]);
    assert_eq!(outputs.len(), 1);
    assert_close(&outputs[0], &((&x + 1.0) * 2.0).into_dyn(), 0.0);
}

#[test]
fn test_auto_scheduled_pointwise_matches_reference() {
    let (mut fusion, _) = pointwise_fusion();
    let x = input(8, 16);
    let args = [float(&x).into()];
    auto_schedule(&mut fusion, &args);
    let outputs = run(&fusion, &args);
    assert_close(&outputs[0], &((&x + 1.0) * 2.0).into_dyn(), 0.0);
}

#[test]
fn test_unscheduled_fusion_runs_serially() {
    let (fusion, _) = pointwise_fusion();
    let x = input(4, 6);
    let outputs = run(&fusion, &[float(&x).into()]);
    assert_close(&outputs[0], &((&x + 1.0) * 2.0).into_dyn(), 0.0);
}

/// `t0.compute_at(t7, 1)` after splitting `t7` by 128 and then 4.
#[test_case(false ; "serial")]
#[test_case(true ; "parallel")]
fn test_diamond_compute_at(parallel: bool) {
    let (mut fusion, t) = diamond_fusion();
    fusion.split(t[7], 0, 128).unwrap();
    fusion.split(t[7], 0, 4).unwrap();
    fusion.compute_at(t[0], t[7], 1).unwrap();

    assert_eq!(fusion.tv(t[7]).compute_at_position(), 0);
    assert_eq!(fusion.tv(t[7]).max_producer_position(), 1);
    for &tv in &t[1..=5] {
        assert_eq!(fusion.tv(tv).compute_at_position(), 1, "{tv}");
    }

    if parallel {
        fusion.parallelize(t[7], 0, ParallelType::BIDx).unwrap();
        fusion.parallelize(t[7], 2, ParallelType::TIDx).unwrap();
        let types: ParallelTypeSet = ParallelType::BIDx | ParallelType::TIDx;
        parallelize_all_like(&mut fusion, t[7], &[], types).unwrap();
    }

    let x = input(129, 127);
    let outputs = run(&fusion, &[float(&x).into()]);
    let t1 = &x * 0.5;
    let t4 = &t1 * 2.0;
    let t6 = (&t1 + 3.0) + (&t1 * -1.0) + &t4;
    let t7 = &t1 + &t4;
    assert_close(&outputs[0], &t6.into_dyn(), 1e-6);
    assert_close(&outputs[1], &t7.into_dyn(), 1e-6);
}

#[test]
fn test_scalar_input() {
    let mut fusion = Fusion::new();
    let t0 = fusion.symbolic_tensor(1, DataType::Float);
    let s0 = fusion.new_scalar(DataType::Float);
    fusion.add_input(t0).unwrap();
    fusion.add_input(s0).unwrap();
    let t1 = fusion.mul(t0, s0).unwrap();
    fusion.add_output(t1).unwrap();

    let x = HostTensor::from_vec(DataType::Float, &[5], vec![1.0, 2.0, 3.0, 4.0, 5.0]).unwrap();
    let outputs = run(&fusion, &[x.into(), Argument::Scalar(ConstValue::Int(3))]);
    assert_eq!(outputs[0].storage(), &[3.0, 6.0, 9.0, 12.0, 15.0]);
}

#[test]
fn test_argument_validation() {
    let (mut fusion, t) = pointwise_fusion();
    flat_schedule(&mut fusion, t);
    let executor = host_executor(&fusion);
    let launch = LaunchParams::default();
    let x = float(&input(4, 4));

    let err = executor.run_fusion(&[], &launch, None).unwrap_err();
    assert!(matches!(err, Error::ArgumentCount { expected: 1, actual: 0 }), "{err}");

    let err = executor.run_fusion(&[Argument::from(1.0)], &launch, None).unwrap_err();
    assert!(matches!(err, Error::ArgumentKind { expected: "tensor", .. }), "{err}");

    let half = HostTensor::from_vec(DataType::Half, &[4, 4], vec![0.0; 16]).unwrap();
    let err = executor.run_fusion(&[half.into()], &launch, None).unwrap_err();
    assert!(
        matches!(err, Error::DtypeMismatch { expected: DataType::Float, actual: DataType::Half, .. }),
        "{err}"
    );

    let flat = HostTensor::from_vec(DataType::Float, &[16], vec![0.0; 16]).unwrap();
    let err = executor.run_fusion(&[flat.into()], &launch, None).unwrap_err();
    assert!(matches!(err, Error::RankMismatch { expected: 2, actual: 1, .. }), "{err}");

    let transposed = input(4, 6);
    let t = HostTensor::from_array(DataType::Float, transposed.t().into_dyn());
    let err = executor.run_fusion(&[t.into()], &launch, None).unwrap_err();
    assert!(matches!(err, Error::NotContiguous { dim: 0, .. }), "{err}");

    assert!(executor.run_fusion(&[x.into()], &launch, None).is_ok());
}

#[test]
fn test_discontiguous_input_when_declared() {
    let mut fusion = Fusion::new();
    let t0 = fusion.tensor_with_contiguity(&[false, false], DataType::Float);
    fusion.add_input(t0).unwrap();
    let t1 = fusion.add(t0, 1.0).unwrap();
    let t2 = fusion.mul(t1, 2.0).unwrap();
    fusion.add_output(t2).unwrap();
    flat_schedule(&mut fusion, [t0, t1, t2]);

    let x = input(5, 7);
    let transposed = x.t();
    let t = HostTensor::from_array(DataType::Float, transposed.into_dyn());
    let outputs = run(&fusion, &[t.into()]);
    assert_close(&outputs[0], &((&transposed + 1.0) * 2.0).into_dyn(), 0.0);
    assert_eq!(outputs[0].strides(), &[5, 1]);
}

#[test]
fn test_vectorized_inputs_are_checked_per_launch() {
    let (mut fusion, _) = pointwise_fusion();
    auto_schedule(&mut fusion, &[float(&input(8, 16)).into()]);
    let executor = host_executor(&fusion);
    let kernel = executor.kernel().unwrap();
    assert!(kernel.summary.vectorized.iter().any(|access| access.width == 4));

    let launch = LaunchParams::default();
    let x = input(4, 8);
    let outputs = executor.run_fusion(&[float(&x).into()], &launch, None).unwrap();
    assert_close(&outputs[0], &((&x + 1.0) * 2.0).into_dyn(), 0.0);

    let err = executor.run_fusion(&[float(&input(3, 5)).into()], &launch, None).unwrap_err();
    assert!(matches!(err, Error::Vectorization { width: 4, .. }), "{err}");
}

#[test]
fn test_launch_overrides() {
    let (mut fusion, t) = pointwise_fusion();
    flat_schedule(&mut fusion, t);
    let executor = host_executor(&fusion);
    let x = input(6, 50);
    let expected = ((&x + 1.0) * 2.0).into_dyn();

    // Extra threads and blocks fail their guards and write nothing.
    let wide = LaunchParams::builder().gdimx(4).bdimx(256).build();
    let outputs = executor.run_fusion(&[float(&x).into()], &wide, None).unwrap();
    assert_close(&outputs[0], &expected, 0.0);

    let huge = LaunchParams::builder().gdimx(1 << 20).build();
    let err = executor.run_fusion(&[float(&x).into()], &huge, None).unwrap_err();
    assert!(matches!(err, Error::LaunchTooLarge { .. }), "{err}");
}

#[test]
fn test_preallocated_outputs() {
    let (mut fusion, t) = pointwise_fusion();
    flat_schedule(&mut fusion, t);
    let executor = host_executor(&fusion);
    let launch = LaunchParams::default();
    let x = input(3, 4);

    let out = HostTensor::zeros(DataType::Float, &[3, 4]);
    let outputs = executor.run_fusion(&[float(&x).into()], &launch, Some(vec![out])).unwrap();
    assert_close(&outputs[0], &((&x + 1.0) * 2.0).into_dyn(), 0.0);

    let wrong = HostTensor::zeros(DataType::Float, &[4, 3]);
    let err = executor.run_fusion(&[float(&x).into()], &launch, Some(vec![wrong])).unwrap_err();
    assert!(matches!(err, Error::InvalidOutput { .. }), "{err}");

    let double = HostTensor::zeros(DataType::Double, &[3, 4]);
    let err = executor.run_fusion(&[float(&x).into()], &launch, Some(vec![double])).unwrap_err();
    assert!(matches!(err, Error::InvalidOutput { .. }), "{err}");
}

#[test]
fn test_aliased_output_updates_its_input() {
    let mut fusion = Fusion::new();
    let t0 = fusion.symbolic_tensor(2, DataType::Float);
    fusion.add_input(t0).unwrap();
    let t1 = fusion.add(t0, 1.0).unwrap();
    let t2 = fusion.mul(t1, 2.0).unwrap();
    fusion.add_output(t2).unwrap();
    fusion.alias_output_to_input(t2, t0).unwrap();
    flat_schedule(&mut fusion, [t0, t1, t2]);

    let executor = host_executor(&fusion);
    let x = input(5, 9);
    let expected = ((&x + 1.0) * 2.0).into_dyn();
    let mut args = [float(&x).into()];

    let outputs = executor.run_fusion(&args, &LaunchParams::default(), None).unwrap();
    assert_close(&outputs[0], &expected, 0.0);
    assert_eq!(args[0].as_tensor().unwrap().to_array(), x.clone().into_dyn());

    let outputs = executor.run_fusion_in_place(&mut args, &LaunchParams::default()).unwrap();
    assert_close(&outputs[0], &expected, 0.0);
    assert_close(args[0].as_tensor().unwrap(), &expected, 0.0);
}

#[test]
fn test_empty_input() {
    let (mut fusion, t) = pointwise_fusion();
    flat_schedule(&mut fusion, t);
    let x = Array2::<f64>::zeros((0, 4));
    let outputs = run(&fusion, &[float(&x).into()]);
    assert_eq!(outputs[0].sizes(), &[0, 4]);
    assert_eq!(outputs[0].numel(), 0);
}

#[test]
fn test_run_before_compile() {
    let executor = FusionExecutor::with_backend(Arc::new(HostBackend), FuserConfig::default());
    let err = executor.run_fusion(&[], &LaunchParams::default(), None).unwrap_err();
    assert!(matches!(err, Error::NotCompiled));
}

#[test]
fn test_dumps_do_not_change_results() {
    let (mut fusion, t) = pointwise_fusion();
    flat_schedule(&mut fusion, t);
    let config = FuserConfig::from_lookup(|name| {
        (name == "FUSER_DUMP").then(|| "cuda_kernel,kernel_ir,fusion_ir,launch_params".to_string())
    });
    let mut executor = FusionExecutor::with_backend(Arc::new(HostBackend), config);
    executor.compile_fusion(&fusion).unwrap();
    assert!(executor.kernel_code().unwrap().contains("__global__"));

    let x = input(2, 3);
    let outputs = executor.run_fusion(&[float(&x).into()], &LaunchParams::default(), None).unwrap();
    assert_close(&outputs[0], &((&x + 1.0) * 2.0).into_dyn(), 0.0);
}

#[test]
fn test_outputs_of_different_thread_extents() {
    let mut fusion = Fusion::new();
    let t0 = fusion.concrete_tensor(&[8, 32], DataType::Float);
    fusion.add_input(t0).unwrap();
    let t1 = fusion.add(t0, 1.0).unwrap();
    let t2 = fusion.mul(t0, 2.0).unwrap();
    fusion.add_output(t1).unwrap();
    fusion.add_output(t2).unwrap();
    fusion.parallelize(t1, 1, ParallelType::TIDx).unwrap();
    fusion.split(t2, 1, 16).unwrap();
    fusion.parallelize(t2, 2, ParallelType::TIDx).unwrap();

    let x = input(8, 32);
    let outputs = run(&fusion, &[float(&x).into()]);
    assert_close(&outputs[0], &(&x + 1.0).into_dyn(), 0.0);
    assert_close(&outputs[1], &(&x * 2.0).into_dyn(), 0.0);
}

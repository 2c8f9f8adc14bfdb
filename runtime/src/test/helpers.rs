//! Fusions, inputs and comparisons shared by the runtime tests.

use std::sync::Arc;

use fuser_dtype::DataType;
use fuser_ir::{Fusion, ValId};
use fuser_schedule::{SchedulerRuntimeInfo, propose_heuristic, schedule_fusion};
use ndarray::{Array2, ArrayD};

use crate::{Argument, FuserConfig, FusionExecutor, HostBackend, HostTensor, LaunchParams};

/// `t1 = t0 + 1; t2 = t1 * 2`
pub fn pointwise_fusion() -> (Fusion, [ValId; 3]) {
    let mut fusion = Fusion::new();
    let t0 = fusion.symbolic_tensor(2, DataType::Float);
    fusion.add_input(t0).unwrap();
    let t1 = fusion.add(t0, 1.0).unwrap();
    let t2 = fusion.mul(t1, 2.0).unwrap();
    fusion.add_output(t2).unwrap();
    (fusion, [t0, t1, t2])
}

/// `t1 = t0 * 2; t2 = sum(t1, [1])`
pub fn row_sum_fusion() -> (Fusion, [ValId; 3]) {
    let mut fusion = Fusion::new();
    let t0 = fusion.symbolic_tensor(2, DataType::Float);
    fusion.add_input(t0).unwrap();
    let t1 = fusion.mul(t0, 2.0).unwrap();
    let t2 = fusion.sum(t1, &[1]).unwrap();
    fusion.add_output(t2).unwrap();
    (fusion, [t0, t1, t2])
}

/// `t1 = t0 * 0.5; t2 = t1 * -1; t3 = t1 + 3; t4 = t1 * 2; t5 = t3 + t2;
/// t6 = t5 + t4; t7 = t1 + t4` with outputs `t6` and `t7`.
pub fn diamond_fusion() -> (Fusion, Vec<ValId>) {
    let mut fusion = Fusion::new();
    let t0 = fusion.symbolic_tensor(2, DataType::Float);
    fusion.add_input(t0).unwrap();
    let t1 = fusion.mul(t0, 0.5).unwrap();
    let t2 = fusion.mul(t1, -1.0).unwrap();
    let t3 = fusion.add(t1, 3.0).unwrap();
    let t4 = fusion.mul(t1, 2.0).unwrap();
    let t5 = fusion.add(t3, t2).unwrap();
    let t6 = fusion.add(t5, t4).unwrap();
    let t7 = fusion.add(t1, t4).unwrap();
    fusion.add_output(t6).unwrap();
    fusion.add_output(t7).unwrap();
    (fusion, vec![t0, t1, t2, t3, t4, t5, t6, t7])
}

/// `t1 = sum(t0, [1]); t2 = broadcast(t1); t3 = t0 + t2; t4 = sum(t3, [0])`:
/// no single kernel reduces over both axes.
pub fn conflicting_reductions() -> (Fusion, [ValId; 5]) {
    let mut fusion = Fusion::new();
    let t0 = fusion.symbolic_tensor(2, DataType::Float);
    fusion.add_input(t0).unwrap();
    let t1 = fusion.sum(t0, &[1]).unwrap();
    let t2 = fusion.broadcast(t1, &[false, true]).unwrap();
    let t3 = fusion.add(t0, t2).unwrap();
    let t4 = fusion.sum(t3, &[0]).unwrap();
    fusion.add_output(t4).unwrap();
    (fusion, [t0, t1, t2, t3, t4])
}

/// Small integers varying with position, so float sums stay exact.
pub fn input(rows: usize, cols: usize) -> Array2<f64> {
    Array2::from_shape_fn((rows, cols), |(i, j)| ((i * 7 + j * 3) % 11) as f64 - 5.0)
}

pub fn float(array: &Array2<f64>) -> HostTensor {
    HostTensor::from_array(DataType::Float, array.view().into_dyn())
}

/// Schedule `fusion` for the given arguments the way the executor cache would.
pub fn auto_schedule(fusion: &mut Fusion, args: &[Argument]) {
    let info = SchedulerRuntimeInfo::new(fusion, args.iter().map(Argument::arg_info).collect()).unwrap();
    let params = propose_heuristic(fusion, &info).unwrap();
    schedule_fusion(fusion, &params).unwrap();
}

pub fn host_executor(fusion: &Fusion) -> FusionExecutor {
    let mut executor = FusionExecutor::with_backend(Arc::new(HostBackend), FuserConfig::default());
    executor.compile_fusion(fusion).unwrap();
    executor
}

/// Compile `fusion` as is and run it once.
pub fn run(fusion: &Fusion, args: &[Argument]) -> Vec<HostTensor> {
    host_executor(fusion).run_fusion(args, &LaunchParams::default(), None).unwrap()
}

#[track_caller]
pub fn assert_close(actual: &HostTensor, expected: &ArrayD<f64>, tolerance: f64) {
    let actual = actual.to_array();
    assert_eq!(actual.shape(), expected.shape());
    for (index, (a, e)) in actual.iter().zip(expected.iter()).enumerate() {
        assert!((a - e).abs() <= tolerance * e.abs().max(1.0), "element {index}: {a} != {e}");
    }
}

//! Fusions and lookups shared by the lowering tests.

use std::collections::HashMap;

use fuser_dtype::DataType;
use fuser_ir::{ConstValue, Fusion, ParallelType, ValId};
use fuser_schedule::{ArgInfo, ScheduleExt, SchedulerRuntimeInfo, propose_heuristic, schedule_fusion};

use crate::kir::{ForLoop, LoopId, ScalarEnv, Stmt};

/// `t1 = t0 + 1; t2 = t1 * 2`
pub fn pointwise_fusion(sizes: Option<&[i64]>) -> (Fusion, [ValId; 3]) {
    let mut fusion = Fusion::new();
    let t0 = match sizes {
        Some(sizes) => fusion.concrete_tensor(sizes, DataType::Float),
        None => fusion.symbolic_tensor(2, DataType::Float),
    };
    fusion.add_input(t0).unwrap();
    let t1 = fusion.add(t0, 1.0).unwrap();
    let t2 = fusion.mul(t1, 2.0).unwrap();
    fusion.add_output(t2).unwrap();
    (fusion, [t0, t1, t2])
}

/// Flatten the output into 128-thread blocks and inline its producers.
pub fn schedule_flat(fusion: &mut Fusion, t: [ValId; 3]) {
    fusion.merge(t[2], 0, 1).unwrap();
    fusion.split(t[2], 0, 128).unwrap();
    fusion.compute_at(t[1], t[2], -1).unwrap();
    fusion.parallelize(t[2], 0, ParallelType::BIDx).unwrap();
    fusion.parallelize(t[2], 1, ParallelType::TIDx).unwrap();
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

/// Schedule with the heuristic chosen for contiguous float inputs of `sizes`.
pub fn auto_schedule(fusion: &mut Fusion, sizes: &[&[usize]]) {
    let args = sizes.iter().map(|s| ArgInfo::contiguous(DataType::Float, s)).collect();
    let info = SchedulerRuntimeInfo::new(fusion, args).unwrap();
    let params = propose_heuristic(fusion, &info).unwrap();
    schedule_fusion(fusion, &params).unwrap();
}

/// Every loop in `stmts`, in pre-order.
pub fn loops(stmts: &[Stmt]) -> Vec<&ForLoop> {
    let mut found = Vec::new();
    Stmt::walk(stmts, &mut |s| {
        if let Stmt::For(l) = s {
            found.push(l);
        }
    });
    found
}

/// `war` flag of every barrier in `stmts`, in pre-order.
pub fn syncs(stmts: &[Stmt]) -> Vec<bool> {
    let mut found = Vec::new();
    Stmt::walk(stmts, &mut |s| {
        if let Stmt::Sync { war } = s {
            found.push(*war);
        }
    });
    found
}

/// Fixed values for every runtime quantity a scalar can name.
#[derive(Debug, Default)]
pub struct Bindings {
    pub inputs: HashMap<ValId, ConstValue>,
    pub sizes: HashMap<(ValId, usize), i64>,
    pub strides: HashMap<(ValId, usize), i64>,
    pub loops: HashMap<LoopId, i64>,
    pub parallel: HashMap<ParallelType, (i64, i64)>,
}

impl ScalarEnv for Bindings {
    fn input(&self, val: ValId) -> Option<ConstValue> {
        self.inputs.get(&val).copied()
    }

    fn tensor_size(&self, tensor: ValId, dim: usize) -> Option<i64> {
        self.sizes.get(&(tensor, dim)).copied()
    }

    fn tensor_stride(&self, tensor: ValId, dim: usize) -> Option<i64> {
        self.strides.get(&(tensor, dim)).copied()
    }

    fn parallel_index(&self, parallel: ParallelType) -> Option<i64> {
        self.parallel.get(&parallel).map(|&(index, _)| index)
    }

    fn parallel_dim(&self, parallel: ParallelType) -> Option<i64> {
        self.parallel.get(&parallel).map(|&(_, dim)| dim)
    }

    fn loop_index(&self, id: LoopId) -> Option<i64> {
        self.loops.get(&id).copied()
    }
}

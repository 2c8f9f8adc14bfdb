use fuser_dtype::DataType;
use fuser_ir::{BinaryOpType, Fusion, MemoryType, ParallelType, ParallelTypeSet};
use fuser_schedule::ScheduleExt;

use crate::gpu_lower::{GpuLower, lower};
use crate::kir::*;
use crate::test::helpers::{auto_schedule, loops, pointwise_fusion, row_sum_fusion, schedule_flat};

#[test]
fn test_pointwise_kernel_structure() {
    let (mut fusion, t) = pointwise_fusion(None);
    schedule_flat(&mut fusion, t);
    let kernel = lower(&fusion).unwrap();

    let roles: Vec<_> = kernel.tensor_params().map(|(tv, _, role, _)| (tv, role)).collect();
    assert_eq!(roles, vec![(t[0], TensorRole::Input), (t[2], TensorRole::Output)]);
    assert!(!kernel.params.iter().any(|p| matches!(p, KernelParam::WorkBuffer { .. })));

    let [Stmt::For(blocks)] = &kernel.body[..] else { panic!("expected one block loop:\n{kernel}") };
    assert_eq!(blocks.parallel, ParallelType::BIDx);
    let [Stmt::For(threads)] = &blocks.body[..] else { panic!("expected one thread loop:\n{kernel}") };
    assert_eq!(threads.parallel, ParallelType::TIDx);
    assert_eq!(threads.extent, Scalar::Int(128));

    let [Stmt::Allocate(alloc), Stmt::If(first), Stmt::If(second)] = &threads.body[..] else {
        panic!("expected an allocation and two guarded ops:\n{kernel}")
    };
    assert_eq!(alloc.tv, t[1]);
    assert_eq!(alloc.memory, MemoryType::Local);
    assert_eq!(alloc.size, Scalar::ONE);
    assert_eq!(first.cond, second.cond);

    let ops = kernel.ops();
    let [Op::Binary { op: BinaryOpType::Add, out, .. }, Op::Binary { op: BinaryOpType::Mul, lhs, .. }] = &ops[..] else {
        panic!("expected add then mul:\n{kernel}")
    };
    assert_eq!(out.tv, t[1]);
    assert_eq!(out.index, Scalar::ZERO);
    assert_eq!(lhs.as_tensor().map(|l| (l.tv, l.index.clone())), Some((t[1], Scalar::ZERO)));
}

#[test]
fn test_divisible_split_needs_no_guard() {
    let (mut fusion, t) = pointwise_fusion(Some(&[32, 64]));
    fusion.split(t[2], 1, 16).unwrap();
    fusion.compute_at(t[1], t[2], -1).unwrap();
    fusion.parallelize(t[2], 0, ParallelType::BIDx).unwrap();
    fusion.parallelize(t[2], 2, ParallelType::TIDx).unwrap();
    let kernel = lower(&fusion).unwrap();

    let mut guards = 0;
    Stmt::walk(&kernel.body, &mut |s| {
        if matches!(s, Stmt::If(_)) {
            guards += 1;
        }
    });
    assert_eq!(guards, 0, "{kernel}");
    assert_eq!(kernel.ops().len(), 2);
    let serial: Vec<_> = loops(&kernel.body).into_iter().filter(|l| !l.is_trivial()).collect();
    assert_eq!(serial.len(), 1);
    assert_eq!(serial[0].extent, Scalar::Int(4));
}

#[test]
fn test_block_reduction() {
    let (mut fusion, [t0, _, t2]) = row_sum_fusion();
    auto_schedule(&mut fusion, &[&[16, 1000]]);
    let lowered = GpuLower::new(&fusion).unwrap();
    let kernel = lowered.kernel();

    assert!(kernel.summary.has_block_reduction);
    assert!(kernel.summary.grid_reduction.is_none());
    assert!(kernel.summary.needs_workspace());
    assert_eq!(kernel.summary.workspace_elem_bytes, DataType::Float.bytes());

    let collectives: Vec<_> = kernel.ops().into_iter().filter_map(|op| op.collective()).filter(|c| !c.is_serial()).collect();
    let [Collective::Block { types, .. }] = &collectives[..] else { panic!("expected one block reduction:\n{kernel}") };
    assert_eq!(*types, ParallelTypeSet::only(ParallelType::TIDx));

    let inits = kernel.ops().into_iter().filter(|op| matches!(op, Op::Init { .. })).count();
    assert_eq!(inits, 2, "{kernel}");

    let roles: Vec<_> = kernel.tensor_params().map(|(tv, _, role, _)| (tv, role)).collect();
    assert_eq!(roles, vec![(t0, TensorRole::Input), (t2, TensorRole::Output)]);
    assert!(lowered.parallel_dimension_map().is_exact(ParallelType::TIDx));
}

#[test]
fn test_reduction_result_is_initialized_before_its_loop() {
    let (mut fusion, [_, _, t2]) = row_sum_fusion();
    auto_schedule(&mut fusion, &[&[16, 1000]]);
    let kernel = lower(&fusion).unwrap();

    let [Stmt::For(blocks)] = &kernel.body[..] else { panic!("expected one block loop:\n{kernel}") };
    let init = blocks.body.iter().position(|s| {
        let ops = Stmt::ops(std::slice::from_ref(s));
        ops.iter().any(|op| matches!(op, Op::Init { out, .. } if out.tv == t2))
    });
    let reduction_loop = blocks.body.iter().position(|s| matches!(s, Stmt::For(l) if l.parallel == ParallelType::TIDx));
    assert!(init.is_some() && reduction_loop.is_some(), "{kernel}");
    assert!(init < reduction_loop);
}

#[test]
fn test_grid_reduction_parameters() {
    let (mut fusion, _) = row_sum_fusion();
    auto_schedule(&mut fusion, &[&[2, 1 << 16]]);
    let kernel = lower(&fusion).unwrap();

    let grid = kernel.summary.grid_reduction.as_ref().expect("a cross-block reduction");
    assert_eq!(grid.values, 1);
    assert_eq!(grid.dtype, DataType::Float);
    assert!(grid.types.contains(ParallelType::BIDx));
    assert!(grid.types.contains(ParallelType::TIDx));

    let n = kernel.params.len();
    assert_eq!(kernel.params[n - 2], KernelParam::WorkBuffer { dtype: DataType::Float });
    assert_eq!(kernel.params[n - 1], KernelParam::SyncFlags);
}

#[test]
fn test_scalar_inputs_become_parameters() {
    let mut fusion = Fusion::new();
    let t0 = fusion.symbolic_tensor(1, DataType::Float);
    let s0 = fusion.new_scalar(DataType::Float);
    fusion.add_input(t0).unwrap();
    fusion.add_input(s0).unwrap();
    let t1 = fusion.mul(t0, s0).unwrap();
    fusion.add_output(t1).unwrap();
    let kernel = lower(&fusion).unwrap();

    assert!(matches!(kernel.params[1], KernelParam::Scalar { val, dtype: DataType::Float } if val == s0));
    let [Op::Binary { rhs: Operand::Scalar { value, .. }, .. }] = &kernel.ops()[..] else { panic!("{kernel}") };
    assert_eq!(*value, Scalar::Input { val: s0, dtype: DataType::Float });
}

#[test]
fn test_unswitch_hoists_bounds() {
    let (mut fusion, t) = pointwise_fusion(Some(&[8, 100]));
    fusion.split(t[2], 1, 32).unwrap();
    fusion.compute_at(t[1], t[2], -1).unwrap();
    fusion.parallelize(t[2], 1, ParallelType::Unswitch).unwrap();
    fusion.parallelize(t[2], 2, ParallelType::TIDx).unwrap();
    let kernel = lower(&fusion).unwrap();

    let [Stmt::For(rows)] = &kernel.body[..] else { panic!("{kernel}") };
    let [Stmt::For(unswitched)] = &rows.body[..] else { panic!("{kernel}") };
    assert_eq!(unswitched.parallel, ParallelType::Serial);
    let [Stmt::If(branch)] = &unswitched.body[..] else { panic!("expected one hoisted condition:\n{kernel}") };
    assert!(branch.cond.uses_loop(unswitched.index));

    let mut fast_guards = 0;
    Stmt::walk(&branch.then_body, &mut |s| fast_guards += usize::from(matches!(s, Stmt::If(_))));
    assert_eq!(fast_guards, 0);
    assert_eq!(Stmt::ops(&branch.then_body).len(), 2);
    assert_eq!(Stmt::ops(&branch.else_body).len(), 2);
    let mut slow_guards = 0;
    Stmt::walk(&branch.else_body, &mut |s| slow_guards += usize::from(matches!(s, Stmt::If(_))));
    assert_eq!(slow_guards, 2);
}

#[test]
fn test_kernel_dump() {
    let (mut fusion, t) = pointwise_fusion(None);
    schedule_flat(&mut fusion, t);
    let kernel = lower(&fusion).unwrap();
    let dump = kernel.to_string();
    assert!(dump.starts_with("kernel kernel(T"), "{dump}");
    assert!(dump.contains("(blockIdx.x, "), "{dump}");
    assert!(dump.contains("alloc T"), "{dump}");
}

/// Right-hand sides of every `threadIdx.x < n` term guarding a branch.
fn tidx_guards(stmts: &[Stmt]) -> Vec<Scalar> {
    fn terms(cond: &Scalar, found: &mut Vec<Scalar>) {
        match cond {
            Scalar::Binary(BinaryOpType::Lt, lhs, rhs) if **lhs == Scalar::ParallelIndex(ParallelType::TIDx) => {
                found.push((**rhs).clone());
            }
            Scalar::Binary(_, lhs, rhs) => {
                terms(lhs, found);
                terms(rhs, found);
            }
            Scalar::Unary(_, x) => terms(x, found),
            _ => {}
        }
    }
    let mut found = Vec::new();
    Stmt::walk(stmts, &mut |s| {
        if let Stmt::If(branch) = s {
            terms(&branch.cond, &mut found);
        }
    });
    found
}

#[test]
fn test_narrower_thread_axis_is_guarded() {
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

    let lowered = GpuLower::new(&fusion).unwrap();
    assert!(!lowered.parallel_dimension_map().is_exact(ParallelType::TIDx));
    let kernel = lowered.kernel();
    let guards = tidx_guards(&kernel.body);
    assert!(guards.contains(&Scalar::Int(16)), "{kernel}");
}

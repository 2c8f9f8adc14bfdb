//! Property tests for index arithmetic and guards.

use fuser_ir::ParallelType;
use proptest::prelude::*;

use crate::gpu_lower::lower;
use crate::kir::{LoopId, Op, Scalar, Stmt};
use crate::test::helpers::{Bindings, pointwise_fusion, schedule_flat};

proptest! {
    #[test]
    fn flattened_output_writes_every_element_once(n in 1i64..24, m in 1i64..24) {
        let (mut fusion, t) = pointwise_fusion(None);
        schedule_flat(&mut fusion, t);
        let kernel = lower(&fusion).unwrap();

        let mut guarded = None;
        Stmt::walk(&kernel.body, &mut |s| {
            if let Stmt::If(branch) = s
                && let [Stmt::Op(Op::Binary { out, .. })] = &branch.then_body[..]
                && out.tv == t[2]
            {
                guarded = Some((branch.cond.clone(), out.index.clone()));
            }
        });
        let (cond, index) = guarded.expect("guarded write of the output");

        let mut env = Bindings::default();
        for (dim, size) in [n, m].into_iter().enumerate() {
            env.sizes.insert((t[0], dim), size);
        }
        env.strides.insert((t[2], 0), m);
        env.strides.insert((t[2], 1), 1);

        let blocks = (n * m + 127) / 128;
        let mut written = Vec::new();
        for bidx in 0..blocks {
            for tidx in 0..128 {
                env.parallel.insert(ParallelType::BIDx, (bidx, blocks));
                env.parallel.insert(ParallelType::TIDx, (tidx, 128));
                if cond.evaluate(&env).unwrap().as_bool() {
                    written.push(index.evaluate_int(&env).unwrap());
                }
            }
        }
        written.sort_unstable();
        prop_assert_eq!(written, (0..n * m).collect::<Vec<_>>());
    }

    #[test]
    fn split_indices_recombine(x in 0i64..10_000, factor in 1i64..64) {
        let mut env = Bindings::default();
        env.loops.insert(LoopId(0), x);
        let x = Scalar::Loop(LoopId(0));
        let f = Scalar::Int(factor);
        let recombined = x.clone().div(f.clone()).mul(f.clone()).add(x.rem(f));
        prop_assert_eq!(recombined.evaluate_int(&env), env.loops.get(&LoopId(0)).copied());
    }
}

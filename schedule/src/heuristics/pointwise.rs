use fuser_ir::{Fusion, ParallelType, ValId};
use tracing::debug;

use super::utils::{compute_inputs_at, input_tvs, merge_range};
use super::{PointwiseParams, SchedulerRuntimeInfo};
use crate::error::*;
use crate::ext::ScheduleExt;
use crate::propagate::{parallelize_all_like, propagate_transforms};

/// The output of highest rank; every output must share that rank.
pub(super) fn reference(fusion: &Fusion) -> Result<ValId> {
    let outputs = fusion.outputs();
    let rank = |tv: ValId| fusion.non_reduction_root(tv).len();
    let Some(&reference) = outputs.iter().max_by_key(|&&tv| (rank(tv), std::cmp::Reverse(tv))) else {
        return NoSchedulerSnafu { reason: "the fusion has no outputs" }.fail();
    };
    if let Some(&other) = outputs.iter().find(|&&tv| rank(tv) != rank(reference)) {
        return NoSchedulerSnafu { reason: format!("outputs {reference} and {other} differ in rank") }.fail();
    }
    Ok(reference)
}

pub(super) fn propose(fusion: &Fusion, info: &SchedulerRuntimeInfo) -> Result<PointwiseParams> {
    let reference = reference(fusion)?;
    let rank = fusion.non_reduction_root(reference).len();
    let vector_width = vector_width(fusion, info, rank);
    Ok(PointwiseParams::builder().vector_width(vector_width).build())
}

/// Widest vector every input supports: no broadcasts anywhere, row-major
/// contiguous inputs of the reference rank, innermost size divisible.
fn vector_width(fusion: &Fusion, info: &SchedulerRuntimeInfo, rank: usize) -> i64 {
    if rank == 0 {
        return 1;
    }
    let any_broadcast = fusion
        .all_tensors()
        .into_iter()
        .any(|tv| fusion.tv(tv).domain().root().iter().any(|&id| fusion.id(id).is_broadcast()));
    if any_broadcast {
        return 1;
    }
    let inputs = input_tvs(fusion);
    let mut innermost = Vec::with_capacity(inputs.len());
    for tv in inputs {
        let (Some(sizes), Some(strides)) = (info.sizes(tv), info.strides(tv)) else { return 1 };
        if sizes.len() != rank || !is_row_major(sizes, strides) {
            return 1;
        }
        innermost.push(sizes[rank - 1]);
    }
    [4, 2].into_iter().find(|&w| innermost.iter().all(|&s| s % w as usize == 0)).unwrap_or(1)
}

fn is_row_major(sizes: &[usize], strides: &[usize]) -> bool {
    let mut expected = 1;
    for (&size, &stride) in sizes.iter().zip(strides).rev() {
        if size > 1 && stride != expected {
            return false;
        }
        expected *= size;
    }
    true
}

pub(super) fn schedule(fusion: &mut Fusion, params: &PointwiseParams) -> Result<()> {
    let reference = reference(fusion)?;
    let ndims = fusion.tv(reference).n_dims();
    if ndims == 0 {
        return Ok(());
    }

    let vectorize = params.vector_width > 1;
    let mut vectorized = Vec::new();
    if vectorize {
        for input in input_tvs(fusion) {
            vectorized.push(fusion.cache_after(input)?);
        }
        for output in fusion.outputs().to_vec() {
            fusion.cache_before(output)?;
            vectorized.push(output);
        }
    }

    merge_range(fusion, reference, 0, ndims)?;
    if vectorize {
        fusion.split(reference, 0, params.vector_width)?;
    }
    fusion.split(reference, 0, params.block_size)?;
    propagate_transforms(fusion, reference)?;

    fusion.parallelize(reference, 0, ParallelType::BIDx)?;
    fusion.parallelize(reference, 1, ParallelType::TIDx)?;
    parallelize_all_like(fusion, reference, &[], ParallelType::BIDx | ParallelType::TIDx)?;
    for &tv in &vectorized {
        fusion.parallelize(tv, -1, ParallelType::Vectorize)?;
    }

    compute_inputs_at(fusion, 2)?;
    debug!(%reference, vector_width = params.vector_width, "scheduled pointwise fusion");
    Ok(())
}

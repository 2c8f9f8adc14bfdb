use fuser_ir::{Fusion, ParallelType, ValId};
use tracing::debug;

use super::utils::{
    compute_inputs_at, input_tvs, merge_range, move_to_front, persistent_buffers, reduced_positions,
    reduction_representatives,
};
use super::{MAX_PERSISTENT_BYTES, ReductionParams, SchedulerRuntimeInfo};
use crate::error::*;
use crate::ext::ScheduleExt;
use crate::propagate::{parallelize_all_like, propagate_transforms};

/// Reductions at least this long with at most [`CROSS_BLOCK_MAX_ROWS`] rows
/// are split across blocks.
const CROSS_BLOCK_MIN_EXTENT: i64 = 16 * 1024;
const CROSS_BLOCK_MAX_ROWS: i64 = 4;

/// All reductions must reduce the same positions of equal-rank inputs.
fn reference(fusion: &Fusion) -> Result<ValId> {
    let representatives = reduction_representatives(fusion);
    let Some(&reference) = representatives.first() else {
        return NoSchedulerSnafu { reason: "the fusion has no reduction" }.fail();
    };
    let rank = fusion.tv(reference).domain().maybe_rfactor().len();
    let reduced = reduced_positions(fusion, reference);
    for &other in &representatives[1..] {
        if fusion.tv(other).domain().maybe_rfactor().len() != rank || reduced_positions(fusion, other) != reduced {
            return NoSchedulerSnafu { reason: format!("{reference} and {other} reduce different axes") }.fail();
        }
    }
    Ok(reference)
}

pub(super) fn propose(fusion: &Fusion, info: &SchedulerRuntimeInfo) -> Result<ReductionParams> {
    let reference = reference(fusion)?;
    let domain = fusion.tv(reference).domain().maybe_rfactor().to_vec();
    let (reduced, iterated): (Vec<_>, Vec<_>) = domain.iter().partition(|&&id| fusion.id(id).is_reduction());
    let Some(reduction_extent) = info.numel(fusion, &reduced) else {
        return NoSchedulerSnafu { reason: "reduction extent is not known from the inputs" }.fail();
    };
    let rows = info.numel(fusion, &iterated).unwrap_or(i64::MAX);

    let buffers = persistent_buffers(fusion);
    let persistent = !buffers.is_empty();
    if persistent {
        let bytes: usize = buffers.iter().map(|&tv| fusion.dtype(tv).bytes() * reduction_extent.max(0) as usize).sum();
        if bytes > MAX_PERSISTENT_BYTES {
            return NoSchedulerSnafu {
                reason: format!("persistent buffers need {bytes} bytes, more than {MAX_PERSISTENT_BYTES}"),
            }
            .fail();
        }
    }
    let cross_block = !persistent
        && reduction_representatives(fusion).len() == 1
        && rows <= CROSS_BLOCK_MAX_ROWS
        && reduction_extent >= CROSS_BLOCK_MIN_EXTENT;
    Ok(ReductionParams::builder().persistent(persistent).cross_block(cross_block).build())
}

pub(super) fn schedule(fusion: &mut Fusion, params: &ReductionParams) -> Result<()> {
    let reference = reference(fusion)?;
    let reduced = reduced_positions(fusion, reference);
    let ndims = fusion.tv(reference).n_dims();
    let iterated: Vec<usize> = (0..ndims).filter(|i| !reduced.contains(i)).collect();
    let has_rows = !iterated.is_empty();

    // [I..., R...] -> [I, R] -> [I, Ro, Ri] or [I, Rb, Rs, Ri]
    move_to_front(fusion, reference, &iterated)?;
    merge_range(fusion, reference, iterated.len(), reduced.len())?;
    if has_rows {
        merge_range(fusion, reference, 0, iterated.len())?;
    }
    let r = usize::from(has_rows) as isize;
    fusion.split(reference, r, params.block_size)?;
    if params.cross_block {
        fusion.outer_split(reference, r, params.grid_size)?;
    }
    propagate_transforms(fusion, reference)?;

    let row_type = if params.cross_block { ParallelType::BIDy } else { ParallelType::BIDx };
    if has_rows {
        fusion.parallelize(reference, 0, row_type)?;
    }
    if params.cross_block {
        fusion.parallelize(reference, r, ParallelType::BIDx)?;
    }
    fusion.parallelize(reference, -1, ParallelType::TIDx)?;
    parallelize_all_like(fusion, reference, &[], row_type | ParallelType::BIDx | ParallelType::TIDx)?;

    let serial = r + isize::from(params.cross_block);
    let mut stages = Vec::new();
    for tv in reduction_representatives(fusion) {
        let partial = fusion.rfactor(tv, &[serial])?;
        stages.push((partial, tv));
    }

    if params.persistent {
        compute_inputs_at(fusion, 1)?;
        for &(partial, tv) in &stages {
            fusion.compute_at(partial, tv, -1)?;
        }
    } else {
        for &(partial, tv) in &stages {
            fusion.compute_at(partial, tv, -1)?;
        }
        for input in input_tvs(fusion) {
            for &(partial, _) in &stages {
                if fusion.depends_on(partial, input) {
                    fusion.compute_at(input, partial, -1)?;
                }
            }
        }
        compute_inputs_at(fusion, 1)?;
    }
    debug!(%reference, stages = stages.len(), ?params, "scheduled reduction fusion");
    Ok(())
}

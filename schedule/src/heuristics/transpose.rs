use fuser_ir::{Fusion, MemoryType, ParallelType, ValId};
use tracing::debug;

use super::pointwise;
use super::utils::{compute_inputs_at, input_tvs, merge_range, move_to_front};
use super::{SchedulerRuntimeInfo, TRANSPOSE_TILE, TransposeParams};
use crate::error::*;
use crate::ext::ScheduleExt;
use crate::propagate::propagate_transforms;

/// Accept a broadcast-free fusion whose inputs share the output rank and at
/// least one of which is laid out with a dimension other than the last
/// fastest. Every transposed input must agree on that dimension and span at
/// least one tile along both it and the last dimension.
pub(super) fn propose(fusion: &Fusion, info: &SchedulerRuntimeInfo) -> Result<Option<TransposeParams>> {
    let Ok(reference) = pointwise::reference(fusion) else { return Ok(None) };
    let rank = fusion.non_reduction_root(reference).len();
    if rank < 2 {
        return Ok(None);
    }
    let any_broadcast = fusion
        .all_tensors()
        .into_iter()
        .any(|tv| fusion.tv(tv).domain().root().iter().any(|&id| fusion.id(id).is_broadcast()));
    if any_broadcast {
        return Ok(None);
    }

    let last = rank - 1;
    let mut inner_dim = None;
    let mut transposed = Vec::new();
    for input in input_tvs(fusion) {
        let Some(sizes) = info.sizes(input) else { return Ok(None) };
        if sizes.len() != rank {
            return Ok(None);
        }
        let Some(fastest) = info.fastest_dim(input) else { continue };
        if fastest == last {
            continue;
        }
        if inner_dim.is_some_and(|d| d != fastest) {
            return Ok(None);
        }
        let tile = TRANSPOSE_TILE as usize;
        if sizes[fastest] < tile || sizes[last] < tile {
            return Ok(None);
        }
        inner_dim = Some(fastest);
        transposed.push(input);
    }
    Ok(inner_dim.map(|inner_dim| TransposeParams::builder().inner_dim(inner_dim).transposed(transposed).build()))
}

/// Tile the reference as `[B, Di, Li]`, where `B` enumerates 32x32 tiles of
/// the transposed dimension `D` and the last dimension `L`.
///
/// Transposed inputs are staged in a shared-memory tile written along `Di`,
/// the input's contiguous direction, and read along `Li` by everything else.
pub(super) fn schedule(fusion: &mut Fusion, params: &TransposeParams) -> Result<()> {
    let reference = pointwise::reference(fusion)?;
    let rank = fusion.tv(reference).n_dims();
    let (d, last) = (params.inner_dim, rank - 1);

    let mut staged = Vec::with_capacity(params.transposed.len());
    for &input in &params.transposed {
        let cache = fusion.cache_after(input)?;
        fusion.set_memory_type(cache, MemoryType::Shared)?;
        staged.push(cache);
    }

    // [O..., D, L] -> [O, Do, Lo, Di, Li] -> [B, Di, Li]
    let mut order: Vec<usize> = (0..rank).filter(|&i| i != d && i != last).collect();
    let outer = order.len();
    order.extend([d, last]);
    move_to_front(fusion, reference, &order)?;
    merge_range(fusion, reference, 0, outer)?;
    let base = isize::from(outer > 0);
    fusion.split(reference, base + 1, params.tile)?;
    fusion.split(reference, base, params.tile)?;
    fusion.reorder(reference, &[(base + 1, base + 2), (base + 2, base + 1)])?;
    merge_range(fusion, reference, 0, base as usize + 2)?;
    propagate_transforms(fusion, reference)?;

    for tv in fusion.all_tensors() {
        if fusion.is_input(tv) || fusion.tv(tv).n_dims() != 3 {
            continue;
        }
        if staged.contains(&tv) {
            fusion.reorder(tv, &[(1, 2), (2, 1)])?;
        }
        tile_threads(fusion, tv, params.block_size)?;
    }

    compute_inputs_at(fusion, 1)?;
    debug!(%reference, inner_dim = d, staged = staged.len(), "scheduled transpose fusion");
    Ok(())
}

/// `[B, X, Y]` -> `[B(BIDx), XY/n, n(TIDx)]`
fn tile_threads(fusion: &mut Fusion, tv: ValId, block_size: i64) -> Result<()> {
    fusion.merge(tv, 1, 2)?;
    fusion.split(tv, 1, block_size)?;
    fusion.parallelize(tv, 0, ParallelType::BIDx)?;
    fusion.parallelize(tv, 2, ParallelType::TIDx)?;
    Ok(())
}

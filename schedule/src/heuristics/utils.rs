//! Helpers shared by the automatic schedulers.

use fuser_ir::{Fusion, ValId};

use crate::error::Result;
use crate::ext::ScheduleExt;

/// Tensors defined by a reduction or Welford, in topological order.
pub fn reduction_tvs(fusion: &Fusion) -> Vec<ValId> {
    fusion.all_tensors().into_iter().filter(|&tv| fusion.is_reduction_tv(tv)).collect()
}

/// One representative per reduction expression (the first output).
pub fn reduction_representatives(fusion: &Fusion) -> Vec<ValId> {
    let mut result = Vec::new();
    for tv in reduction_tvs(fusion) {
        if !fusion.siblings(tv).iter().any(|s| result.contains(s)) {
            result.push(tv);
        }
    }
    result
}

pub fn input_tvs(fusion: &Fusion) -> Vec<ValId> {
    fusion.inputs().iter().copied().filter(|&v| fusion.is_tensor(v)).collect()
}

/// Root positions reduced by `tv`.
pub fn reduced_positions(fusion: &Fusion, tv: ValId) -> Vec<usize> {
    fusion
        .tv(tv)
        .domain()
        .maybe_rfactor()
        .iter()
        .enumerate()
        .filter(|&(_, &id)| fusion.id(id).is_reduction())
        .map(|(i, _)| i)
        .collect()
}

/// Tensors that must stay live until a reduction of their values is done:
/// they feed a reduction and also a branch that later consumes its result.
pub fn persistent_buffers(fusion: &Fusion) -> Vec<ValId> {
    let reductions = reduction_tvs(fusion);
    let tensors = fusion.all_tensors();
    let mut buffers = Vec::new();
    for &tv in &tensors {
        let persistent = reductions.iter().filter(|&&r| r != tv && fusion.depends_on(r, tv)).any(|&r| {
            fusion.consumer_tvs(tv).into_iter().any(|c| {
                !fusion.depends_on(r, c) && tensors.iter().any(|&o| fusion.depends_on(o, c) && fusion.depends_on(o, r))
            })
        });
        if persistent {
            buffers.push(tv);
        }
    }
    buffers
}

/// Reorder `tv`'s leaf so the axes at `first` come first, the rest in order.
pub fn move_to_front(fusion: &mut Fusion, tv: ValId, first: &[usize]) -> Result<()> {
    let ndims = fusion.tv(tv).n_dims();
    let rest = (0..ndims).filter(|i| !first.contains(i));
    let order: Vec<usize> = first.iter().copied().chain(rest).collect();
    let old2new: Vec<(isize, isize)> = order.iter().enumerate().map(|(new, &old)| (old as isize, new as isize)).collect();
    fusion.reorder(tv, &old2new)
}

/// Merge the `count` leaf axes starting at `start` into one.
pub fn merge_range(fusion: &mut Fusion, tv: ValId, start: usize, count: usize) -> Result<()> {
    for _ in 1..count {
        fusion.merge(tv, start as isize, start as isize + 1)?;
    }
    Ok(())
}

/// Inline every input at `pos` into each output computed from it.
pub fn compute_inputs_at(fusion: &mut Fusion, pos: isize) -> Result<()> {
    let outputs = fusion.outputs().to_vec();
    for input in input_tvs(fusion) {
        for &output in &outputs {
            if fusion.depends_on(output, input) {
                fusion.compute_at(input, output, pos)?;
            }
        }
    }
    Ok(())
}

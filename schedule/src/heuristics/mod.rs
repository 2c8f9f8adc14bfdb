//! Automatic schedulers.
//!
//! Each heuristic inspects an unscheduled fusion together with the runtime
//! shapes of its arguments, proposes parameters, and applies a complete
//! schedule: transforms on a reference tensor, propagation to the rest of
//! the graph, parallelization and inlining.
//!
//! | heuristic    | accepts                                                     |
//! |--------------|-------------------------------------------------------------|
//! | `Pointwise`  | no reductions, every output of the reference rank           |
//! | `Transpose`  | no reductions, an input whose fastest dimension is not last |
//! | `Reduction`  | reductions over the same axes, no persistent buffers        |
//! | `Persistent` | as `Reduction`, with persistent buffers that fit on chip    |

mod pointwise;
mod reduction;
pub mod runtime_info;
mod transpose;
pub mod utils;

use bon::Builder;
use fuser_ir::{Fusion, ValId};
use tracing::debug;

pub use runtime_info::{ArgInfo, SchedulerRuntimeInfo};

use crate::error::*;

/// Threads per block used by every scheduler.
pub const DEFAULT_BLOCK_SIZE: i64 = 128;

/// Upper bound on the bytes of persistent buffers per reduction row.
pub const MAX_PERSISTENT_BYTES: usize = 64 * 1024;

/// Side length of a transpose tile.
pub const TRANSPOSE_TILE: i64 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum ScheduleHeuristic {
    Pointwise,
    Reduction,
    Persistent,
    Transpose,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Builder)]
pub struct PointwiseParams {
    #[builder(default = 1)]
    pub vector_width: i64,
    #[builder(default = DEFAULT_BLOCK_SIZE)]
    pub block_size: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Builder)]
pub struct ReductionParams {
    #[builder(default = DEFAULT_BLOCK_SIZE)]
    pub block_size: i64,
    /// Split the reduction across blocks; `grid_size` blocks cooperate.
    #[builder(default)]
    pub cross_block: bool,
    #[builder(default = 8)]
    pub grid_size: i64,
    /// Keep the reduction inputs live in registers for a second pass.
    #[builder(default)]
    pub persistent: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Builder)]
pub struct TransposeParams {
    /// Output dimension the transposed inputs read fastest.
    pub inner_dim: usize,
    /// Inputs staged through shared memory.
    #[builder(default)]
    pub transposed: Vec<ValId>,
    #[builder(default = TRANSPOSE_TILE)]
    pub tile: i64,
    #[builder(default = DEFAULT_BLOCK_SIZE)]
    pub block_size: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HeuristicParams {
    Pointwise(PointwiseParams),
    Reduction(ReductionParams),
    Transpose(TransposeParams),
}

impl HeuristicParams {
    pub fn heuristic(&self) -> ScheduleHeuristic {
        match self {
            Self::Pointwise(_) => ScheduleHeuristic::Pointwise,
            Self::Reduction(params) if params.persistent => ScheduleHeuristic::Persistent,
            Self::Reduction(_) => ScheduleHeuristic::Reduction,
            Self::Transpose(_) => ScheduleHeuristic::Transpose,
        }
    }
}

/// Pick a heuristic and its parameters, or explain why none applies.
pub fn propose_heuristic(fusion: &Fusion, info: &SchedulerRuntimeInfo) -> Result<HeuristicParams> {
    ensure_schedulable(fusion)?;
    let params = if utils::reduction_tvs(fusion).is_empty() {
        match transpose::propose(fusion, info)? {
            Some(params) => HeuristicParams::Transpose(params),
            None => HeuristicParams::Pointwise(pointwise::propose(fusion, info)?),
        }
    } else {
        HeuristicParams::Reduction(reduction::propose(fusion, info)?)
    };
    debug!(heuristic = %params.heuristic(), ?params, "proposed heuristic");
    Ok(params)
}

/// Whether some heuristic accepts `fusion` for these arguments.
pub fn can_schedule(fusion: &Fusion, info: &SchedulerRuntimeInfo) -> bool {
    propose_heuristic(fusion, info).is_ok()
}

/// Apply the schedule described by `params` to an unscheduled fusion.
pub fn schedule_fusion(fusion: &mut Fusion, params: &HeuristicParams) -> Result<()> {
    match params {
        HeuristicParams::Pointwise(params) => pointwise::schedule(fusion, params),
        HeuristicParams::Reduction(params) => reduction::schedule(fusion, params),
        HeuristicParams::Transpose(params) => transpose::schedule(fusion, params),
    }
}

fn ensure_schedulable(fusion: &Fusion) -> Result<()> {
    if fusion.outputs().is_empty() {
        return NoSchedulerSnafu { reason: "the fusion has no outputs" }.fail();
    }
    if let Some(tv) = fusion.all_tensors().into_iter().find(|&tv| fusion.tv(tv).fixed_position() > 0) {
        return NoSchedulerSnafu { reason: format!("{tv} is already scheduled") }.fail();
    }
    Ok(())
}

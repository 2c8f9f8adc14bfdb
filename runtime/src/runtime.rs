//! Segmented execution of a fusion for one input signature.
//!
//! A [`FusionKernelRuntime`] owns one scheduled kernel per segment of the
//! fusion and runs them in the segment order, handing intermediate tensors
//! from producing to consuming segments.

use std::collections::HashMap;
use std::sync::Arc;

use fuser_ir::{Fusion, ValId};
use fuser_schedule::{ScheduleHeuristic, SchedulerRuntimeInfo, SegmentedFusion, propose_heuristic, schedule_fusion, segment};
use snafu::{OptionExt, ResultExt};
use tracing::{debug, trace};

use crate::config::{DumpOption, FuserConfig, LaunchParams};
use crate::error::*;
use crate::executor::FusionExecutor;
use crate::kernel::KernelBackend;
use crate::tensor::{Argument, HostTensor};

/// One kernel per segment, compiled for the arguments it was built with.
pub struct FusionKernelRuntime {
    segmented: SegmentedFusion,
    executors: Vec<FusionExecutor>,
    /// Index of the last group reading each intermediate.
    last_use: HashMap<ValId, usize>,
}

impl FusionKernelRuntime {
    /// Segment, schedule and compile `fusion` for `args`.
    pub fn compile(
        fusion: &Fusion,
        args: &[Argument],
        config: &FuserConfig,
        backend: Arc<dyn KernelBackend>,
    ) -> Result<Self> {
        let info = SchedulerRuntimeInfo::new(fusion, args.iter().map(Argument::arg_info).collect())
            .context(ScheduleSnafu)?;
        let segmented = segment(fusion, &info).context(ScheduleSnafu)?;
        if !segmented.is_single() && config.disable_segmentation {
            let source = match propose_heuristic(fusion, &info) {
                Err(source) => source,
                Ok(_) => {
                    return ExecutionSnafu { reason: "segmented a fusion with a single-kernel schedule" }.fail();
                }
            };
            return Err(Error::SegmentationDisabled { source });
        }
        debug!(groups = segmented.groups().len(), "segmented fusion");
        if config.dumps(DumpOption::SegmentedFusion) {
            debug!(segments = %segmented, "segmented fusion");
        }

        let complete = segmented.complete_fusion();
        let mut last_use = HashMap::new();
        for (index, group) in segmented.groups().iter().enumerate() {
            for &v in group.inputs() {
                if !complete.is_input(v) {
                    last_use.insert(v, index);
                }
            }
        }

        let mut executors = Vec::with_capacity(segmented.groups().len());
        for (index, group) in segmented.groups().iter().enumerate() {
            let mut group_fusion = segmented.make_fusion(index).context(ScheduleSnafu)?;
            schedule_fusion(&mut group_fusion, group.heuristic()).context(ScheduleSnafu)?;
            if config.segment_aliasing && group.heuristic().heuristic() == ScheduleHeuristic::Pointwise {
                for (output, input) in reusable_buffers(complete, &info, group.inputs(), group.outputs(), index, &last_use)
                {
                    group_fusion.alias_output_to_input(output, input).context(IrSnafu)?;
                    trace!(group = index, %output, %input, "output reuses dead intermediate");
                }
            }
            let mut executor = FusionExecutor::with_backend(Arc::clone(&backend), config.clone());
            executor.compile_fusion(&group_fusion)?;
            executors.push(executor);
        }
        Ok(Self { segmented, executors, last_use })
    }

    pub fn segmented_fusion(&self) -> &SegmentedFusion {
        &self.segmented
    }

    pub fn is_segmented(&self) -> bool {
        !self.segmented.is_single()
    }

    pub fn executors(&self) -> &[FusionExecutor] {
        &self.executors
    }

    /// Run all segments; returns the complete fusion's outputs in order.
    pub fn run(&self, args: &[Argument], launch: &LaunchParams) -> Result<Vec<HostTensor>> {
        let complete = self.segmented.complete_fusion();
        let mut values: HashMap<ValId, Argument> =
            complete.inputs().iter().copied().zip(args.iter().cloned()).collect();

        for (index, (group, executor)) in self.segmented.groups().iter().zip(&self.executors).enumerate() {
            let group_args = group
                .inputs()
                .iter()
                .map(|v| values.get(v).cloned().context(ExecutionSnafu { reason: format!("segment input {v} is unset") }))
                .collect::<Result<Vec<_>>>()?;
            let outputs = executor.run_fusion(&group_args, launch, None)?;
            trace!(group = index, outputs = outputs.len(), "segment finished");
            for (&v, tensor) in group.outputs().iter().zip(outputs) {
                values.insert(v, Argument::Tensor(tensor));
            }
            values.retain(|v, _| {
                complete.is_input(*v) || complete.is_output(*v) || self.last_use.get(v).is_none_or(|&last| last > index)
            });
        }

        complete
            .outputs()
            .iter()
            .map(|v| match values.get(v) {
                Some(Argument::Tensor(t)) => Ok(t.clone()),
                _ => ExecutionSnafu { reason: format!("fusion output {v} was not produced") }.fail(),
            })
            .collect()
    }
}

/// Outputs of group `index` that can be written into an intermediate input
/// no later group reads, matched by dtype and concrete shape.
fn reusable_buffers(
    complete: &Fusion,
    info: &SchedulerRuntimeInfo,
    inputs: &[ValId],
    outputs: &[ValId],
    index: usize,
    last_use: &HashMap<ValId, usize>,
) -> Vec<(ValId, ValId)> {
    let shape = |v: ValId| -> Option<Vec<i64>> {
        complete.non_reduction_root(v).into_iter().map(|id| info.extent(complete, id)).collect()
    };
    let mut dead: Vec<(ValId, Vec<i64>)> = inputs
        .iter()
        .copied()
        .filter(|&v| complete.is_tensor(v) && !complete.is_input(v) && !complete.is_output(v))
        .filter(|v| last_use.get(v) == Some(&index))
        .filter_map(|v| Some((v, shape(v)?)))
        .collect();

    let mut pairs = Vec::new();
    for &output in outputs {
        let Some(out_shape) = shape(output) else { continue };
        if let Some(pos) =
            dead.iter().position(|(input, s)| *s == out_shape && complete.dtype(*input) == complete.dtype(output))
        {
            let (input, _) = dead.swap_remove(pos);
            pairs.push((output, input));
        }
    }
    pairs
}

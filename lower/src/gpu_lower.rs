//! The lowering pipeline.

use fuser_ir::{DataType, Fusion, MemoryType};
use snafu::ensure;
use tracing::{debug, instrument};

use crate::alloc::{plan_shared_memory, promote_dynamic_locals, shared_storage};
use crate::compute_at_map::ComputeAtMap;
use crate::error::*;
use crate::index::{Indexer, memory_of};
use crate::kernel_builder::KernelBuilder;
use crate::kir::*;
use crate::loop_nest::build_loop_tree;
use crate::parallel_dims::ParallelDimensionMap;
use crate::sync::insert_syncs;
use crate::thread_predicate::ThreadPredicateMap;
use crate::validation::{
    validate_grid_reductions, validate_leaf_bindings, validate_parallelization, validate_vectorization,
};

/// A scheduled fusion lowered to one kernel.
///
/// Lowering works on its own copy of the fusion, since register buffers
/// with runtime sizes are moved to global memory on the way.
#[derive(Debug)]
pub struct GpuLower {
    fusion: Fusion,
    ca_map: ComputeAtMap,
    thread_preds: ThreadPredicateMap,
    kernel: Kernel,
}

impl GpuLower {
    #[instrument(skip_all)]
    pub fn new(fusion: &Fusion) -> Result<Self> {
        ensure!(!fusion.outputs().is_empty(), NoOutputsSnafu);
        for &out in fusion.outputs() {
            ensure!(
                fusion.is_tensor(out),
                UnsupportedSnafu { reason: format!("scalar output {out}") }
            );
        }
        let mut fusion = fusion.clone();
        let ca_map = ComputeAtMap::build(&fusion)?;
        promote_dynamic_locals(&mut fusion, &ca_map);

        validate_leaf_bindings(&fusion, &ca_map)?;
        validate_parallelization(&fusion, &ca_map)?;
        validate_grid_reductions(&fusion, &ca_map)?;
        let vectorized = validate_vectorization(&fusion, &ca_map)?;

        let pdims = ParallelDimensionMap::build(&fusion, &ca_map);
        let thread_preds = ThreadPredicateMap::build(&fusion, &ca_map);
        let exprs = fusion.tensor_exprs();
        let tree = build_loop_tree(&fusion, &ca_map, &exprs)?;

        let indexer = Indexer::new(&fusion, &ca_map);
        let mut body = KernelBuilder::new(&fusion, &ca_map, &pdims, &thread_preds, &indexer).build(&tree)?;
        let (shared, shared_bytes) = plan_shared_memory(&fusion, &mut body);
        insert_syncs(&mut body, &shared_storage(&fusion, &shared));

        let (summary, work_dtype) = summarize(&body, pdims, vectorized, shared, shared_bytes)?;
        let params = kernel_params(&fusion, &indexer, work_dtype);
        let kernel = Kernel { name: "kernel".to_string(), params, body, summary };
        debug!(ops = kernel.ops().len(), params = kernel.params.len(), "lowered fusion");
        Ok(Self { fusion, ca_map, thread_preds, kernel })
    }

    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    pub fn into_kernel(self) -> Kernel {
        self.kernel
    }

    /// The fusion as lowered, with memory types settled.
    pub fn fusion(&self) -> &Fusion {
        &self.fusion
    }

    pub fn compute_at_map(&self) -> &ComputeAtMap {
        &self.ca_map
    }

    pub fn thread_predicates(&self) -> &ThreadPredicateMap {
        &self.thread_preds
    }

    pub fn parallel_dimension_map(&self) -> &ParallelDimensionMap {
        &self.kernel.summary.parallel_dims
    }
}

/// Lower a scheduled fusion to a kernel.
///
/// # Examples
///
/// ```ignore
/// let kernel = fuser_lower::lower(&fusion)?;
/// println!("{kernel}");
/// ```
pub fn lower(fusion: &Fusion) -> Result<Kernel> {
    Ok(GpuLower::new(fusion)?.into_kernel())
}

fn summarize(
    body: &[Stmt],
    parallel_dims: ParallelDimensionMap,
    vectorized: Vec<VectorizedAccess>,
    shared: Vec<SharedBuffer>,
    shared_bytes: Scalar,
) -> Result<(KernelSummary, Option<DataType>)> {
    let mut summary = KernelSummary {
        parallel_dims,
        has_block_reduction: false,
        has_block_broadcast: false,
        has_grid_broadcast: false,
        has_welford: false,
        grid_reduction: None,
        vectorized,
        shared,
        shared_bytes,
        workspace_elem_bytes: 0,
    };
    let mut grid_dtype: Option<DataType> = None;
    for op in Stmt::ops(body) {
        let (dtype, values) = match op {
            Op::Reduction { out, .. } | Op::Broadcast { out, .. } => (out.dtype.accumulate_type(), 1),
            Op::Welford { out, .. } => {
                summary.has_welford = true;
                (out.avg.dtype.accumulate_type(), 3)
            }
            _ => continue,
        };
        let is_broadcast = matches!(op, Op::Broadcast { .. });
        match op.collective() {
            Some(Collective::Block { .. }) => {
                if is_broadcast {
                    summary.has_block_broadcast = true;
                } else {
                    summary.has_block_reduction = true;
                }
            }
            Some(Collective::Grid { types, .. }) => {
                if is_broadcast {
                    summary.has_grid_broadcast = true;
                } else {
                    summary.grid_reduction = Some(GridReductionInfo { dtype, values, types: *types });
                }
                if let Some(existing) = grid_dtype
                    && existing != dtype
                {
                    return UnsupportedSnafu { reason: "grid collectives over different types" }.fail();
                }
                grid_dtype = Some(dtype);
            }
            _ => continue,
        }
        let bytes = if values == 3 { 2 * dtype.bytes() + DataType::Int64.bytes() } else { dtype.bytes() };
        summary.workspace_elem_bytes = summary.workspace_elem_bytes.max(bytes);
    }
    Ok((summary, grid_dtype))
}

/// Inputs in order, then outputs, then global intermediates, then the grid
/// work buffers when any collective crosses blocks.
fn kernel_params(fusion: &Fusion, indexer: &Indexer<'_>, work_dtype: Option<DataType>) -> Vec<KernelParam> {
    let mut params = Vec::new();
    let mut seen = Vec::new();
    let mut push_tensor = |params: &mut Vec<KernelParam>, tv, role| {
        if !seen.contains(&tv) {
            seen.push(tv);
            params.push(KernelParam::Tensor { tv, dtype: fusion.dtype(tv), role, sizes: indexer.global_sizes(tv) });
        }
    };
    for &v in fusion.inputs() {
        if fusion.is_tensor(v) {
            push_tensor(&mut params, v, TensorRole::Input);
        } else {
            params.push(KernelParam::Scalar { val: v, dtype: fusion.dtype(v) });
        }
    }
    for &v in fusion.outputs() {
        push_tensor(&mut params, v, TensorRole::Output);
    }
    for tv in fusion.all_tensors() {
        if !fusion.is_input(tv) && !fusion.is_output(tv) && memory_of(fusion, tv) == MemoryType::Global {
            push_tensor(&mut params, tv, TensorRole::Intermediate);
        }
    }
    if let Some(dtype) = work_dtype {
        params.push(KernelParam::WorkBuffer { dtype });
        params.push(KernelParam::SyncFlags);
    }
    params
}

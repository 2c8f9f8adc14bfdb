//! Compile and launch one scheduled fusion.
//!
//! [`FusionExecutor`] lowers a fusion that is already scheduled, renders
//! its CUDA source and compiles it through a [`KernelBackend`]. Each
//! `run_fusion` call validates the arguments against what the kernel was
//! compiled for, derives launch dimensions from the kernel's parallel
//! dimension map, allocates outputs and scratch buffers, and launches.

use std::collections::HashMap;
use std::sync::Arc;

use fuser_codegen::{Renderer, RenderedKernel, cuda};
use fuser_dtype::DataType;
use fuser_ir::{ConstValue, Fusion, ParallelType, ValId};
use fuser_lower::{GpuLower, Kernel, KernelParam, LoopId, Scalar, ScalarEnv, TensorRole, VectorizedAccess};
use snafu::{OptionExt, ResultExt, ensure};
use tracing::{debug, trace};

use crate::config::{DumpOption, FuserConfig, LaunchParams};
use crate::error::*;
use crate::interpreter::HostBackend;
use crate::kernel::{ArgValue, KernelBackend, LaunchDims, TensorArg};
use crate::kernel_cache::{CachedKernel, get_or_compile_kernel};
use crate::tensor::{Argument, HostTensor, contiguous_strides};

struct CompiledFusion {
    fusion: Fusion,
    kernel: Kernel,
    rendered: RenderedKernel,
    module: Arc<CachedKernel>,
}

/// Executes one kernel for one scheduled fusion.
pub struct FusionExecutor {
    config: FuserConfig,
    backend: Arc<dyn KernelBackend>,
    compiled: Option<CompiledFusion>,
}

impl Default for FusionExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl FusionExecutor {
    /// Executor running on the host interpreter with environment settings.
    pub fn new() -> Self {
        Self::with_backend(Arc::new(HostBackend), FuserConfig::global().clone())
    }

    pub fn with_backend(backend: Arc<dyn KernelBackend>, config: FuserConfig) -> Self {
        Self { config, backend, compiled: None }
    }

    pub fn is_compiled(&self) -> bool {
        self.compiled.is_some()
    }

    pub fn kernel(&self) -> Option<&Kernel> {
        self.compiled.as_ref().map(|c| &c.kernel)
    }

    /// Generated CUDA source of the compiled kernel.
    pub fn kernel_code(&self) -> Option<&str> {
        self.compiled.as_ref().map(|c| c.rendered.code.as_str())
    }

    /// Compiled module, shared with every executor that generated the
    /// same source.
    pub fn module(&self) -> Option<&Arc<CachedKernel>> {
        self.compiled.as_ref().map(|c| &c.module)
    }

    pub fn fusion(&self) -> Option<&Fusion> {
        self.compiled.as_ref().map(|c| &c.fusion)
    }

    /// Lower, render and compile a scheduled fusion.
    ///
    /// Compiling again replaces the previous kernel.
    pub fn compile_fusion(&mut self, fusion: &Fusion) -> Result<()> {
        if self.config.dumps(DumpOption::FusionIr) {
            debug!(fusion = %fusion.print_math(), "fusion ir");
        }
        let lowered = GpuLower::new(fusion).context(LowerSnafu)?;
        let kernel = lowered.into_kernel();
        if self.config.dumps(DumpOption::KernelIr) {
            debug!(kernel = %kernel, "kernel ir");
        }
        let rendered = cuda::CudaRenderer::new().render(&kernel, None).context(CodegenSnafu)?;
        if self.config.dumps(DumpOption::CudaKernel) {
            debug!(entry_point = %rendered.entry_point, code = %rendered.code, "cuda kernel");
        }

        let backend = Arc::clone(&self.backend);
        let module = get_or_compile_kernel(&rendered.code, backend.name(), || {
            Ok::<_, Error>(CachedKernel {
                kernel: backend.compile(&kernel, &rendered)?,
                backend: backend.name().to_string(),
                code: rendered.code.clone(),
                entry_point: rendered.entry_point.clone(),
            })
        })?;
        debug!(entry_point = %rendered.entry_point, backend = backend.name(), "compiled fusion");

        self.compiled = Some(CompiledFusion { fusion: fusion.clone(), kernel, rendered, module });
        Ok(())
    }

    /// Run the compiled kernel and return the fusion outputs in order.
    ///
    /// `outputs`, when given, supplies one preallocated tensor per fusion
    /// output. Outputs aliased to an input are computed into a copy of that
    /// input; use [`run_fusion_in_place`](Self::run_fusion_in_place) to
    /// update the argument itself.
    pub fn run_fusion(
        &self,
        inputs: &[Argument],
        launch: &LaunchParams,
        outputs: Option<Vec<HostTensor>>,
    ) -> Result<Vec<HostTensor>> {
        Ok(self.execute(inputs, launch, outputs)?.outputs)
    }

    /// Like [`run_fusion`](Self::run_fusion), writing aliased outputs back
    /// into their input arguments.
    pub fn run_fusion_in_place(&self, inputs: &mut [Argument], launch: &LaunchParams) -> Result<Vec<HostTensor>> {
        let execution = self.execute(inputs, launch, None)?;
        for (position, tensor) in execution.aliased {
            inputs[position] = Argument::Tensor(tensor);
        }
        Ok(execution.outputs)
    }

    fn execute(&self, inputs: &[Argument], launch: &LaunchParams, outputs: Option<Vec<HostTensor>>) -> Result<Execution> {
        let compiled = self.compiled.as_ref().context(NotCompiledSnafu)?;
        let fusion = &compiled.fusion;
        let kernel = &compiled.kernel;
        validate_inputs(fusion, inputs)?;

        let env = HostEnv::new(fusion, inputs);
        let mut preallocated = outputs.map(|o| validate_outputs(fusion, kernel, &env, o)).transpose()?;

        let mut buffers: Vec<Vec<f64>> = Vec::new();
        let mut tensors: HashMap<ValId, TensorArg> = HashMap::new();
        for (position, &v) in fusion.inputs().iter().enumerate() {
            if let Argument::Tensor(t) = &inputs[position] {
                tensors.insert(v, TensorArg {
                    tv: v,
                    buffer: buffers.len(),
                    dtype: t.dtype(),
                    sizes: t.sizes().to_vec(),
                    strides: t.strides().to_vec(),
                });
                buffers.push(t.storage().to_vec());
            }
        }

        for (tv, dtype, role, sizes) in kernel.tensor_params() {
            if tensors.contains_key(&tv) {
                continue;
            }
            let given = match role {
                TensorRole::Output => preallocated.as_mut().and_then(|p| p.remove(&tv)),
                _ => None,
            };
            let arg = if let Some(input) = fusion.aliased_input(tv).filter(|_| role == TensorRole::Output) {
                let source = tensors.get(&input).context(ExecutionSnafu {
                    reason: format!("aliased input {input} of {tv} is not a tensor argument"),
                })?;
                TensorArg { tv, ..source.clone() }
            } else if let Some(given) = given {
                let arg = TensorArg {
                    tv,
                    buffer: buffers.len(),
                    dtype,
                    sizes: given.sizes().to_vec(),
                    strides: given.strides().to_vec(),
                };
                buffers.push(given.into_storage());
                arg
            } else {
                let sizes = evaluate_sizes(&env, tv, sizes)?;
                let numel = sizes.iter().product();
                let arg = TensorArg { tv, buffer: buffers.len(), dtype, strides: contiguous_strides(&sizes), sizes };
                buffers.push(vec![0.0; numel]);
                arg
            };
            tensors.insert(tv, arg);
        }

        for access in &kernel.summary.vectorized {
            let arg = tensors.get(&access.tv).context(ExecutionSnafu {
                reason: format!("vectorized tensor {} is not a kernel argument", access.tv),
            })?;
            validate_vectorization(access, arg)?;
        }

        let dims = launch_dims(kernel, &env, launch)?;
        if self.config.dumps(DumpOption::LaunchParams) {
            debug!(grid = ?dims.grid, block = ?dims.block, shared_mem_bytes = dims.shared_mem_bytes, "launch params");
        }

        let args = kernel_args(kernel, inputs, fusion, &tensors, &dims)?;
        if dims.threads() > 0 {
            compiled.module.kernel.launch(&dims, &args, &mut buffers)?;
        } else {
            trace!(kernel = %kernel.name, "empty launch skipped");
        }

        let mut outputs = Vec::with_capacity(fusion.outputs().len());
        for &out in fusion.outputs() {
            let arg = tensors.get(&out).context(ExecutionSnafu { reason: format!("output {out} is not a kernel argument") })?;
            outputs.push(HostTensor::strided(arg.dtype, &arg.sizes, &arg.strides, buffers[arg.buffer].clone())?);
        }
        let aliased = fusion
            .io_aliases()
            .iter()
            .filter_map(|&(out, input)| {
                let position = fusion.inputs().iter().position(|&v| v == input)?;
                let index = fusion.outputs().iter().position(|&v| v == out)?;
                Some((position, outputs[index].clone()))
            })
            .collect();
        Ok(Execution { outputs, aliased })
    }
}

struct Execution {
    outputs: Vec<HostTensor>,
    /// Input position and new contents of each aliased input.
    aliased: Vec<(usize, HostTensor)>,
}

/// Host-side values of scalar expressions: argument sizes, strides and
/// scalar inputs. Thread and loop indices are unbound.
struct HostEnv<'a> {
    tensors: HashMap<ValId, &'a HostTensor>,
    scalars: HashMap<ValId, ConstValue>,
}

impl<'a> HostEnv<'a> {
    fn new(fusion: &Fusion, inputs: &'a [Argument]) -> Self {
        let mut tensors = HashMap::new();
        let mut scalars = HashMap::new();
        for (&v, arg) in fusion.inputs().iter().zip(inputs) {
            match arg {
                Argument::Tensor(t) => {
                    tensors.insert(v, t);
                }
                Argument::Scalar(value) => {
                    scalars.insert(v, value.cast(fusion.dtype(v)));
                }
            }
        }
        Self { tensors, scalars }
    }

    fn evaluate_int(&self, scalar: &Scalar, what: impl FnOnce() -> String) -> Result<i64> {
        scalar.evaluate_int(self).context(UnevaluableSnafu { what: what() })
    }
}

impl ScalarEnv for HostEnv<'_> {
    fn input(&self, val: ValId) -> Option<ConstValue> {
        self.scalars.get(&val).copied()
    }

    fn tensor_size(&self, tensor: ValId, dim: usize) -> Option<i64> {
        self.tensors.get(&tensor)?.sizes().get(dim).map(|&s| s as i64)
    }

    fn tensor_stride(&self, tensor: ValId, dim: usize) -> Option<i64> {
        self.tensors.get(&tensor)?.strides().get(dim).copied()
    }

    fn parallel_index(&self, _: ParallelType) -> Option<i64> {
        None
    }

    fn parallel_dim(&self, _: ParallelType) -> Option<i64> {
        None
    }

    fn loop_index(&self, _: LoopId) -> Option<i64> {
        None
    }
}

fn validate_inputs(fusion: &Fusion, inputs: &[Argument]) -> Result<()> {
    ensure!(
        inputs.len() == fusion.inputs().len(),
        ArgumentCountSnafu { expected: fusion.inputs().len(), actual: inputs.len() }
    );
    for (&input, arg) in fusion.inputs().iter().zip(inputs) {
        match arg {
            Argument::Tensor(t) => {
                ensure!(fusion.is_tensor(input), ArgumentKindSnafu { input, expected: "scalar" });
                let expected = fusion.dtype(input);
                ensure!(t.dtype() == expected, DtypeMismatchSnafu { input, expected, actual: t.dtype() });
                let domain = fusion.tv(input).domain();
                let rank = domain.root().len();
                ensure!(t.ndims() == rank, RankMismatchSnafu { input, expected: rank, actual: t.ndims() });
                for (dim, &contiguous) in domain.contiguity().iter().enumerate() {
                    ensure!(
                        !contiguous || t.is_contiguous_at(dim),
                        NotContiguousSnafu { input, dim, strides: t.strides().to_vec() }
                    );
                }
            }
            Argument::Scalar(_) => {
                ensure!(!fusion.is_tensor(input), ArgumentKindSnafu { input, expected: "tensor" });
            }
        }
    }
    Ok(())
}

fn validate_outputs(
    fusion: &Fusion,
    kernel: &Kernel,
    env: &HostEnv<'_>,
    outputs: Vec<HostTensor>,
) -> Result<HashMap<ValId, HostTensor>> {
    ensure!(
        outputs.len() == fusion.outputs().len(),
        ArgumentCountSnafu { expected: fusion.outputs().len(), actual: outputs.len() }
    );
    let params: HashMap<ValId, (DataType, &[Scalar])> =
        kernel.tensor_params().map(|(tv, dtype, _, sizes)| (tv, (dtype, sizes))).collect();
    let mut given = HashMap::new();
    for (&output, tensor) in fusion.outputs().iter().zip(outputs) {
        if fusion.aliased_input(output).is_some() {
            continue;
        }
        let (dtype, sizes) = params.get(&output).copied().context(InvalidOutputSnafu {
            output,
            reason: "it is not a kernel parameter".to_string(),
        })?;
        ensure!(
            tensor.dtype() == dtype,
            InvalidOutputSnafu { output, reason: format!("expected {dtype}, got {}", tensor.dtype()) }
        );
        let expected = evaluate_sizes(env, output, sizes)?;
        ensure!(
            tensor.sizes() == expected.as_slice(),
            InvalidOutputSnafu { output, reason: format!("expected sizes {expected:?}, got {:?}", tensor.sizes()) }
        );
        given.insert(output, tensor);
    }
    Ok(given)
}

fn evaluate_sizes(env: &HostEnv<'_>, tv: ValId, sizes: &[Scalar]) -> Result<Vec<usize>> {
    sizes
        .iter()
        .enumerate()
        .map(|(dim, size)| {
            let extent = env.evaluate_int(size, || format!("extent {size} of {tv} dimension {dim}"))?;
            Ok(extent.max(0) as usize)
        })
        .collect()
}

/// Vector loads need unit inner stride; aligned ones also need the merged
/// inner extent and every outer stride to be multiples of the width.
fn validate_vectorization(access: &VectorizedAccess, arg: &TensorArg) -> Result<()> {
    let VectorizedAccess { tv, width, misaligned, merged_dims } = *access;
    let fail = |reason: String| Error::Vectorization { tensor: tv, width, reason };
    let ndims = arg.sizes.len();
    if ndims == 0 || width <= 1 {
        return Ok(());
    }
    let inner = ndims - 1;
    if arg.sizes[inner] > 1 && arg.strides[inner] != 1 {
        return Err(fail(format!("innermost stride is {}", arg.strides[inner])));
    }
    if misaligned {
        return Ok(());
    }

    let merged = merged_dims.clamp(1, ndims);
    let first = ndims - merged;
    let mut expected = 1i64;
    for dim in (first..ndims).rev() {
        if arg.sizes[dim] > 1 && arg.strides[dim] != expected {
            return Err(fail(format!("dimension {dim} with stride {} is not contiguous", arg.strides[dim])));
        }
        expected *= arg.sizes[dim] as i64;
    }
    let extent: usize = arg.sizes[first..].iter().product();
    if extent % width != 0 {
        return Err(fail(format!("inner extent {extent} is not divisible")));
    }
    for dim in 0..first {
        if arg.sizes[dim] > 1 && arg.strides[dim] % width as i64 != 0 {
            return Err(fail(format!("stride {} of dimension {dim} breaks alignment", arg.strides[dim])));
        }
    }
    Ok(())
}

fn launch_dims(kernel: &Kernel, env: &HostEnv<'_>, launch: &LaunchParams) -> Result<LaunchDims> {
    let mut extents = [1u32; 6];
    for (slot, pt) in ParallelType::LAUNCH_TYPES.into_iter().enumerate() {
        extents[slot] = match (launch.slot(slot), kernel.summary.parallel_dims.get(pt)) {
            (Some(forced), _) => forced,
            (None, None) => 1,
            (None, Some(dim)) => {
                let mut extent = 0i64;
                for scalar in &dim.extents {
                    extent = extent.max(env.evaluate_int(scalar, || format!("extent {scalar} of {pt}"))?);
                }
                extent.max(0) as u32
            }
        };
    }
    let grid = [extents[0], extents[1], extents[2]];
    let block = [extents[3], extents[4], extents[5]];
    let shared_mem_bytes = match launch.shared_mem_bytes {
        Some(bytes) => bytes,
        None => {
            let shared = env.evaluate_int(&kernel.summary.shared_bytes, || "shared memory size".to_string())?;
            let threads: i64 = block.iter().map(|&d| d as i64).product();
            cuda::dynamic_shared_bytes(kernel, shared, threads).max(0) as u32
        }
    };
    Ok(LaunchDims { grid, block, shared_mem_bytes })
}

fn kernel_args(
    kernel: &Kernel,
    inputs: &[Argument],
    fusion: &Fusion,
    tensors: &HashMap<ValId, TensorArg>,
    dims: &LaunchDims,
) -> Result<Vec<ArgValue>> {
    let blocks = dims.blocks() as usize;
    let threads = dims.threads_per_block() as usize;
    let values = kernel.summary.grid_reduction.as_ref().map_or(1, |info| info.values);
    kernel
        .params
        .iter()
        .map(|param| {
            Ok(match param {
                KernelParam::Tensor { tv, .. } => ArgValue::Tensor(
                    tensors.get(tv).cloned().context(ExecutionSnafu { reason: format!("tensor {tv} has no buffer") })?,
                ),
                KernelParam::Scalar { val, dtype } => {
                    let position = fusion.inputs().iter().position(|v| v == val);
                    let value = match position.map(|p| &inputs[p]) {
                        Some(Argument::Scalar(value)) => value.cast(*dtype),
                        _ => return UnevaluableSnafu { what: format!("scalar parameter {val}") }.fail(),
                    };
                    ArgValue::Scalar { val: *val, dtype: *dtype, value }
                }
                KernelParam::WorkBuffer { dtype } => {
                    ArgValue::WorkBuffer { dtype: *dtype, elements: blocks * threads * values }
                }
                KernelParam::SyncFlags => ArgValue::SyncFlags { elements: blocks },
            })
        })
        .collect()
}

//! CUDA C++ source generation backend.
//!
//! Renders lowered kernel IR to one `extern "C" __global__` function,
//! preceded by the runtime prelude, suitable for NVRTC.
//!
//! # Kernel Signature
//!
//! ```c
//! __global__ void kernel(Tensor<float, 2> T0, ..., float s3, float* work_buf, int64_t* sync_flags);
//! ```
//! - tensors first, in kernel parameter order, as `Tensor<T, N>` structs
//! - scalar inputs by value
//! - the grid work buffer and arrival counters last, when a collective
//!   crosses blocks
//!
//! Dynamic shared memory holds the planned shared buffers at their offsets,
//! followed by the cross-thread workspace at a 16-byte aligned offset.
//! The text depends only on the kernel IR.

pub mod ops;
pub mod types;

use fuser_ir::Fusion;
use fuser_lower::{Kernel, KernelParam, Scalar};
use snafu::ResultExt;
use tracing::{debug, trace};

use crate::error::LowerSnafu;
use crate::{KernelArg, RenderedKernel, Result};

use self::ops::CudaContext;
use self::types::render_scalar;

/// Runtime helpers every kernel is compiled with.
pub const PRELUDE: &str = include_str!("prelude.cu");

/// CUDA C++ renderer for NVRTC.
pub struct CudaRenderer;

impl CudaRenderer {
    pub fn new() -> Self {
        Self
    }
}

impl Default for CudaRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl crate::Renderer for CudaRenderer {
    fn render(&self, kernel: &Kernel, name: Option<&str>) -> Result<RenderedKernel> {
        let kernel_name = name.unwrap_or(&kernel.name);

        let args: Vec<KernelArg> = kernel.params.iter().map(KernelArg::from_param).collect();
        let params: Vec<String> = kernel.params.iter().zip(&args).map(|(p, a)| param_decl(p, &a.name)).collect();

        let mut ctx = CudaContext::new(kernel);
        let summary = &kernel.summary;
        if !summary.shared.is_empty() || summary.needs_workspace() {
            ctx.line("alignas(16) extern __shared__ char array[];");
        }
        if summary.needs_workspace() {
            ctx.line(format!("const unsigned smem_offset = alignBufferSize({}, 16);", render_scalar(&summary.shared_bytes)));
            ctx.line("char* shared_mem = array + smem_offset;");
        }
        ctx.render_block(&kernel.body)?;

        let mut code_lines: Vec<String> = vec![PRELUDE.to_string()];
        code_lines.push(format!("extern \"C\" __global__ void {kernel_name}({}) {{", params.join(", ")));
        code_lines.extend(ctx.into_lines());
        code_lines.push("}".to_string());
        code_lines.push(String::new());
        let code = code_lines.join("\n");

        debug!(kernel = kernel_name, args = args.len(), bytes = code.len(), "cuda codegen: rendered kernel");
        trace!(source = %code, "cuda source");

        let mut rendered = RenderedKernel::new(code, kernel_name.to_string());
        rendered.args = args;
        Ok(rendered)
    }

    fn backend_name(&self) -> &str {
        "cuda"
    }
}

fn param_decl(param: &KernelParam, name: &str) -> String {
    match param {
        KernelParam::Tensor { dtype, sizes, .. } => format!("Tensor<{}, {}> {name}", dtype.cuda_type(), sizes.len()),
        KernelParam::Scalar { dtype, .. } => format!("{} {name}", dtype.cuda_type()),
        KernelParam::WorkBuffer { dtype } => format!("{}* {name}", dtype.cuda_type()),
        KernelParam::SyncFlags => format!("int64_t* {name}"),
    }
}

/// Bytes of dynamic shared memory a launch with `threads` threads per block
/// needs, given the kernel's shared buffer bytes.
pub fn dynamic_shared_bytes(kernel: &Kernel, shared_bytes: i64, threads: i64) -> i64 {
    let summary = &kernel.summary;
    if !summary.needs_workspace() {
        return shared_bytes;
    }
    let aligned = (shared_bytes + 15) / 16 * 16;
    aligned + summary.workspace_elem_bytes as i64 * threads
}

/// Shared buffer bytes when known without launch information.
pub fn static_shared_bytes(kernel: &Kernel) -> Option<i64> {
    match kernel.summary.shared_bytes {
        Scalar::Int(bytes) => Some(bytes),
        _ => None,
    }
}

/// Public render function for the CUDA backend.
pub fn render(kernel: &Kernel, name: Option<&str>) -> Result<RenderedKernel> {
    let renderer = CudaRenderer::new();
    crate::Renderer::render(&renderer, kernel, name)
}

/// Lower a scheduled fusion and render it.
pub fn render_fusion(fusion: &Fusion, name: Option<&str>) -> Result<RenderedKernel> {
    let kernel = fuser_lower::lower(fusion).context(LowerSnafu)?;
    render(&kernel, name)
}

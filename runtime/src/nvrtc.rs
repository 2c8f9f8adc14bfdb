//! NVRTC backend: compiles generated CUDA source at runtime and launches it
//! through the CUDA driver.
//!
//! Host buffers are uploaded before every launch and every tensor buffer is
//! copied back afterwards, so results land in the same place as with the
//! host interpreter.

use std::collections::HashMap;
use std::ffi::c_void;
use std::sync::Arc;

use cudarc::driver::{CudaContext, CudaFunction, CudaSlice, CudaStream, DevicePtr, DeviceRepr, LaunchConfig, PushKernelArg};
use cudarc::nvrtc::{CompileOptions, compile_ptx_with_opts};
use fuser_codegen::RenderedKernel;
use fuser_dtype::DataType;
use fuser_ir::ConstValue;
use fuser_lower::Kernel;
use snafu::ResultExt;
use tracing::{debug, trace};

use crate::error::*;
use crate::kernel::{ArgValue, CompiledKernel, KernelBackend, LaunchDims};

/// One kernel parameter as raw bytes.
struct PackedArg(Vec<u8>);

// The driver reads `size_of` the declared parameter type from this pointer.
unsafe impl DeviceRepr for PackedArg {
    fn as_kernel_param(&self) -> *mut c_void {
        self.0.as_ptr() as *mut c_void
    }
}

pub struct NvrtcBackend {
    context: Arc<CudaContext>,
    arch: Option<&'static str>,
}

impl NvrtcBackend {
    pub fn new(device: usize) -> Result<Self> {
        let context = CudaContext::new(device).context(CudaSnafu)?;
        Ok(Self { context, arch: None })
    }

    /// Target a virtual architecture such as `compute_80`.
    pub fn with_arch(mut self, arch: &'static str) -> Self {
        self.arch = Some(arch);
        self
    }
}

impl KernelBackend for NvrtcBackend {
    fn name(&self) -> &str {
        "nvrtc"
    }

    fn compile(&self, _kernel: &Kernel, rendered: &RenderedKernel) -> Result<Box<dyn CompiledKernel>> {
        let options = CompileOptions { arch: self.arch, ..Default::default() };
        let ptx = compile_ptx_with_opts(&rendered.code, options).map_err(|e| Error::Compilation {
            entry_point: rendered.entry_point.clone(),
            log: format!("{e:?}"),
            code: rendered.code.clone(),
        })?;
        let module = self.context.load_module(ptx).context(CudaSnafu)?;
        let function = module
            .load_function(&rendered.entry_point)
            .map_err(|_| Error::FunctionNotFound { name: rendered.entry_point.clone() })?;
        debug!(entry_point = %rendered.entry_point, "nvrtc module loaded");
        Ok(Box::new(NvrtcKernel {
            stream: self.context.default_stream(),
            function,
            name: rendered.entry_point.clone(),
        }))
    }
}

pub struct NvrtcKernel {
    stream: Arc<CudaStream>,
    function: CudaFunction,
    name: String,
}

impl CompiledKernel for NvrtcKernel {
    fn launch(&self, dims: &LaunchDims, args: &[ArgValue], buffers: &mut [Vec<f64>]) -> Result<()> {
        let stream = &self.stream;

        // Every buffer is uploaded once, in the dtype of its first tensor.
        let mut device: HashMap<usize, (DataType, CudaSlice<u8>)> = HashMap::new();
        for arg in args {
            if let ArgValue::Tensor(t) = arg
                && !device.contains_key(&t.buffer)
            {
                let bytes = encode(t.dtype, &buffers[t.buffer]);
                let slice = if bytes.is_empty() {
                    stream.alloc_zeros::<u8>(t.dtype.bytes()).context(CudaSnafu)?
                } else {
                    stream.memcpy_stod(&bytes).context(CudaSnafu)?
                };
                device.insert(t.buffer, (t.dtype, slice));
            }
        }
        let mut scratch = Vec::new();
        for arg in args {
            match arg {
                ArgValue::WorkBuffer { dtype, elements } => {
                    scratch.push(stream.alloc_zeros::<u8>((*elements).max(1) * dtype.bytes()).context(CudaSnafu)?);
                }
                ArgValue::SyncFlags { elements } => {
                    scratch.push(stream.alloc_zeros::<u8>((*elements).max(1) * 8).context(CudaSnafu)?);
                }
                _ => {}
            }
        }

        let mut packed = Vec::with_capacity(args.len());
        let mut guards = Vec::new();
        let mut scratch_iter = scratch.iter();
        for arg in args {
            let bytes = match arg {
                ArgValue::Tensor(t) => {
                    let (_, slice) = &device[&t.buffer];
                    let (ptr, guard) = slice.device_ptr(stream);
                    guards.push(guard);
                    let mut bytes = (ptr as u64).to_ne_bytes().to_vec();
                    for &size in &t.sizes {
                        bytes.extend((size as i64).to_ne_bytes());
                    }
                    for &stride in &t.strides {
                        bytes.extend(stride.to_ne_bytes());
                    }
                    bytes
                }
                ArgValue::Scalar { dtype, value, .. } => encode_scalar(*dtype, *value),
                ArgValue::WorkBuffer { .. } | ArgValue::SyncFlags { .. } => {
                    let slice = scratch_iter.next().context(ExecutionSnafu { reason: "scratch buffer missing" })?;
                    let (ptr, guard) = slice.device_ptr(stream);
                    guards.push(guard);
                    (ptr as u64).to_ne_bytes().to_vec()
                }
            };
            packed.push(PackedArg(bytes));
        }

        let config = LaunchConfig {
            grid_dim: (dims.grid[0], dims.grid[1], dims.grid[2]),
            block_dim: (dims.block[0], dims.block[1], dims.block[2]),
            shared_mem_bytes: dims.shared_mem_bytes,
        };
        let mut builder = stream.launch_builder(&self.function);
        for arg in &packed {
            builder.arg(arg);
        }
        trace!(kernel = %self.name, grid = ?dims.grid, block = ?dims.block, "nvrtc launch");
        unsafe { builder.launch(config) }.context(CudaSnafu)?;
        stream.synchronize().context(CudaSnafu)?;
        drop(guards);

        for (buffer, (dtype, slice)) in device {
            if buffers[buffer].is_empty() {
                continue;
            }
            let bytes = stream.memcpy_dtov(&slice).context(CudaSnafu)?;
            buffers[buffer] = decode(dtype, &bytes);
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

fn encode(dtype: DataType, values: &[f64]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(values.len() * dtype.bytes());
    for &v in values {
        bytes.extend(encode_scalar(dtype, ConstValue::from_f64(v, dtype)));
    }
    bytes
}

fn encode_scalar(dtype: DataType, value: ConstValue) -> Vec<u8> {
    match dtype {
        DataType::Bool => vec![value.as_bool() as u8],
        DataType::Int32 => (value.as_i64() as i32).to_ne_bytes().to_vec(),
        DataType::Int64 => value.as_i64().to_ne_bytes().to_vec(),
        DataType::Half => half::f16::from_f64(value.as_f64()).to_ne_bytes().to_vec(),
        DataType::Float => (value.as_f64() as f32).to_ne_bytes().to_vec(),
        DataType::Double => value.as_f64().to_ne_bytes().to_vec(),
    }
}

fn decode(dtype: DataType, bytes: &[u8]) -> Vec<f64> {
    bytes
        .chunks_exact(dtype.bytes())
        .map(|chunk| match dtype {
            DataType::Bool => (chunk[0] != 0) as u8 as f64,
            DataType::Int32 => i32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as f64,
            DataType::Int64 => i64::from_ne_bytes(array(chunk)) as f64,
            DataType::Half => half::f16::from_ne_bytes([chunk[0], chunk[1]]).to_f64(),
            DataType::Float => f32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as f64,
            DataType::Double => f64::from_ne_bytes(array(chunk)),
        })
        .collect()
}

fn array(chunk: &[u8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(&chunk[..8]);
    out
}

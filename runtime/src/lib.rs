//! Compiling and running fusions.
//!
//! [`FusionExecutorCache`] takes an unscheduled fusion and, per input
//! signature, segments it, schedules every segment, and compiles one kernel
//! per segment. [`FusionExecutor`] is the single-kernel layer underneath
//! for fusions that are already scheduled.
//!
//! Kernels run through a [`KernelBackend`]. The default [`HostBackend`]
//! interprets the lowered kernel IR on the host. With the `cuda` feature,
//! `NvrtcBackend` compiles the generated CUDA source with NVRTC and
//! launches it on a device.
//!
//! # Module Organization
//!
//! - [`tensor`] - host tensors and fusion arguments
//! - [`executor`] - argument validation, launch setup and execution
//! - [`runtime`] - segmented execution
//! - [`executor_cache`] - runtimes keyed by input signature
//! - [`kernel_cache`] - compiled modules shared across executors
//! - [`interpreter`] - the host backend
//! - [`config`] - settings and launch overrides

pub mod config;
pub mod error;
pub mod executor;
pub mod executor_cache;
pub mod interpreter;
pub mod kernel;
pub mod kernel_cache;
#[cfg(feature = "cuda")]
pub mod nvrtc;
pub mod runtime;
pub mod tensor;


pub use config::{DumpOption, FuserConfig, LaunchParams};
pub use error::*;
pub use executor::FusionExecutor;
pub use executor_cache::{CacheStats, FusionExecutorCache, InputSignature};
pub use interpreter::{HostBackend, HostKernel};
pub use kernel::{ArgValue, CompiledKernel, KernelBackend, LaunchDims, TensorArg};
pub use kernel_cache::{CachedKernel, get_or_compile_kernel};
#[cfg(feature = "cuda")]
pub use nvrtc::{NvrtcBackend, NvrtcKernel};
pub use runtime::FusionKernelRuntime;
pub use tensor::{Argument, HostTensor};

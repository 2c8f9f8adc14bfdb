//! CUDA code generation for lowered fusion kernels.
//!
//! This crate turns the kernel IR produced by `fuser-lower` into CUDA C++
//! source for NVRTC.
//!
//! # Architecture
//!
//! - **Traits**: Backend-agnostic interface (`Renderer`)
//! - **CUDA**: `__global__` function generation with an embedded prelude
//!   of tensor structs and cooperative reduction helpers
//!
//! # Usage
//!
//! ```ignore
//! use fuser_codegen::cuda;
//!
//! let kernel = fuser_lower::lower(&fusion)?;
//! let rendered = cuda::render(&kernel, Some("kernel1"))?;
//! ```

pub mod cuda;
pub mod error;
pub mod traits;
pub mod types;

#[cfg(test)]
pub mod test;

pub use error::*;
pub use traits::*;
pub use types::*;

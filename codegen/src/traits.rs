//! Core traits for code generation.

use fuser_lower::Kernel;

use crate::{RenderedKernel, Result};

/// Backend-agnostic code generation interface.
///
/// Implementers turn lowered kernel IR into source text for one device
/// compiler.
pub trait Renderer {
    /// Render a lowered kernel.
    ///
    /// `name` overrides the kernel's own name for the entry point, so several
    /// kernels of one segmented fusion can share a module namespace.
    fn render(&self, kernel: &Kernel, name: Option<&str>) -> Result<RenderedKernel>;

    /// Get the backend name (e.g., "cuda").
    fn backend_name(&self) -> &str;
}

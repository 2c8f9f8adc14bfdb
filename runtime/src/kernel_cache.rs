//! Global compiled-module cache.
//!
//! Maps (source, backend) pairs to compiled kernels. Two fusions that
//! lower to the same source share one module, whichever executor compiled
//! it first. Uses papaya's lock-free HashMap, so lookups never block.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::{Arc, OnceLock};

use papaya::HashMap;
use tracing::debug;

use crate::kernel::CompiledKernel;

/// A compiled kernel shared across executors.
pub struct CachedKernel {
    pub kernel: Box<dyn CompiledKernel>,
    /// Backend that compiled the module.
    pub backend: String,
    /// Generated source code (for debugging/profiling).
    pub code: String,
    pub entry_point: String,
}

impl std::fmt::Debug for CachedKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedKernel").field("backend", &self.backend).field("entry_point", &self.entry_point).finish()
    }
}

/// Cache key: (generated source, backend name). The full source is part of
/// the key, so two kernels can never share a module by hash collision.
type KernelKey = (String, String);

// Kernels live until no executor holds them and prune_unused() runs, or
// until clear_all().
static KERNELS: OnceLock<HashMap<KernelKey, Arc<CachedKernel>>> = OnceLock::new();

fn kernels() -> &'static HashMap<KernelKey, Arc<CachedKernel>> {
    KERNELS.get_or_init(HashMap::new)
}

/// Short fingerprint of a kernel source, for logs.
pub fn source_hash(code: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    code.hash(&mut hasher);
    hasher.finish()
}

/// Get or compile the module for `code` on `backend`.
///
/// If several threads miss on the same key at once, each compiles but only
/// the first insert is kept and returned to all of them.
pub fn get_or_compile_kernel<F, E>(code: &str, backend: &str, compile_fn: F) -> Result<Arc<CachedKernel>, E>
where
    F: FnOnce() -> Result<CachedKernel, E>,
{
    let hash = source_hash(code);
    let key = (code.to_string(), backend.to_string());
    let map = kernels();
    let guard = map.guard();

    if let Some(cached) = map.get(&key, &guard) {
        debug!(hash, backend, entry_point = %cached.entry_point, "module cache hit");
        return Ok(Arc::clone(cached));
    }

    debug!(hash, backend, "module cache miss");
    let cached = Arc::new(compile_fn()?);

    use papaya::{Compute, Operation};
    match map.compute(
        key,
        |entry| match entry {
            Some((_, existing)) => Operation::Abort(Arc::clone(existing)),
            None => Operation::Insert(Arc::clone(&cached)),
        },
        &guard,
    ) {
        Compute::Inserted(_, kernel) => Ok(Arc::clone(kernel)),
        Compute::Aborted(kernel) => Ok(kernel),
        _ => Ok(cached),
    }
}

/// Whether a module for `code` on `backend` is cached.
pub fn is_cached(code: &str, backend: &str) -> bool {
    let guard = kernels().guard();
    kernels().contains_key(&(code.to_string(), backend.to_string()), &guard)
}

/// Drop every module no executor holds anymore. Returns how many were dropped.
pub fn prune_unused() -> usize {
    let map = kernels();
    let guard = map.guard();
    let before = map.len();
    map.retain(|_, kernel| Arc::strong_count(kernel) > 1, &guard);
    let pruned = before.saturating_sub(map.len());
    if pruned > 0 {
        debug!(pruned, remaining = map.len(), "pruned unused modules");
    }
    pruned
}

/// Number of cached modules.
pub fn cached_kernels() -> usize {
    kernels().len()
}

/// Clear all cached kernels.
///
/// This is primarily useful for testing to ensure test isolation.
pub fn clear_all() {
    let guard = kernels().guard();
    kernels().clear(&guard);
}

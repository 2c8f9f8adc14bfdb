//! Per-fusion cache of compiled runtimes keyed by input signature.
//!
//! [`FusionExecutorCache`] is the entry point for running an unscheduled
//! fusion: the first call with a given combination of dtypes, sizes,
//! strides and scalar values segments, schedules and compiles the fusion;
//! later calls with the same signature reuse the compiled runtime. The
//! least recently used runtime is evicted once the cache is full.

use std::collections::HashMap;
use std::sync::Arc;

use fuser_dtype::DataType;
use fuser_ir::Fusion;
use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::debug;

use crate::config::{FuserConfig, LaunchParams};
use crate::error::*;
use crate::interpreter::HostBackend;
use crate::kernel::KernelBackend;
use crate::kernel_cache;
use crate::runtime::FusionKernelRuntime;
use crate::tensor::{Argument, HostTensor, scalar_bits};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ArgSignature {
    Tensor { dtype: DataType, sizes: SmallVec<[usize; 4]>, strides: SmallVec<[i64; 4]> },
    Scalar(u8, u64),
}

/// What a compiled runtime was specialized for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InputSignature(Vec<ArgSignature>);

impl InputSignature {
    pub fn new(args: &[Argument]) -> Self {
        Self(
            args.iter()
                .map(|arg| match arg {
                    Argument::Tensor(t) => ArgSignature::Tensor {
                        dtype: t.dtype(),
                        sizes: t.sizes().iter().copied().collect(),
                        strides: t.strides().iter().copied().collect(),
                    },
                    Argument::Scalar(value) => {
                        let (tag, bits) = scalar_bits(*value);
                        ArgSignature::Scalar(tag, bits)
                    }
                })
                .collect(),
        )
    }
}

/// Cache statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: usize,
    pub misses: usize,
    pub entries: usize,
    pub evictions: usize,
}

struct Entry {
    runtime: Arc<FusionKernelRuntime>,
    last_used: u64,
}

#[derive(Default)]
struct Runtimes {
    entries: HashMap<InputSignature, Entry>,
    tick: u64,
    stats: CacheStats,
    most_recent: Option<Arc<FusionKernelRuntime>>,
}

/// Compiles and runs one fusion for any number of input signatures.
pub struct FusionExecutorCache {
    fusion: Fusion,
    config: FuserConfig,
    backend: Arc<dyn KernelBackend>,
    runtimes: Mutex<Runtimes>,
}

impl FusionExecutorCache {
    /// Cache over the host interpreter with environment settings.
    pub fn new(fusion: Fusion) -> Self {
        Self::with_backend(fusion, Arc::new(HostBackend), FuserConfig::global().clone())
    }

    pub fn with_config(fusion: Fusion, config: FuserConfig) -> Self {
        Self::with_backend(fusion, Arc::new(HostBackend), config)
    }

    pub fn with_backend(fusion: Fusion, backend: Arc<dyn KernelBackend>, config: FuserConfig) -> Self {
        Self { fusion, config, backend, runtimes: Mutex::new(Runtimes::default()) }
    }

    pub fn fusion(&self) -> &Fusion {
        &self.fusion
    }

    pub fn run_fusion_with_inputs(&self, args: &[Argument]) -> Result<Vec<HostTensor>> {
        self.run_fusion_with_launch(args, &LaunchParams::default())
    }

    /// Run with launch overrides applied to every segment.
    pub fn run_fusion_with_launch(&self, args: &[Argument], launch: &LaunchParams) -> Result<Vec<HostTensor>> {
        self.runtime_for(args)?.run(args, launch)
    }

    /// Compiled runtime for `args`, compiling it on a miss.
    pub fn runtime_for(&self, args: &[Argument]) -> Result<Arc<FusionKernelRuntime>> {
        let signature = InputSignature::new(args);
        let mut runtimes = self.runtimes.lock();
        runtimes.tick += 1;
        let tick = runtimes.tick;

        if let Some(entry) = runtimes.entries.get_mut(&signature) {
            entry.last_used = tick;
            let runtime = Arc::clone(&entry.runtime);
            runtimes.stats.hits += 1;
            runtimes.most_recent = Some(Arc::clone(&runtime));
            debug!(tick, "executor cache hit");
            return Ok(runtime);
        }

        runtimes.stats.misses += 1;
        debug!(tick, entries = runtimes.entries.len(), "executor cache miss");
        let runtime = Arc::new(FusionKernelRuntime::compile(&self.fusion, args, &self.config, Arc::clone(&self.backend))?);

        let mut evicted = None;
        if runtimes.entries.len() >= self.config.cache_capacity
            && let Some(oldest) = runtimes.entries.iter().min_by_key(|(_, e)| e.last_used).map(|(k, _)| k.clone())
        {
            evicted = runtimes.entries.remove(&oldest);
            runtimes.stats.evictions += 1;
            debug!("evicted least recently used runtime");
        }
        runtimes.entries.insert(signature, Entry { runtime: Arc::clone(&runtime), last_used: tick });
        runtimes.stats.entries = runtimes.entries.len();
        runtimes.most_recent = Some(Arc::clone(&runtime));
        drop(runtimes);

        // Modules of the evicted runtime go once nothing else shares them.
        if let Some(entry) = evicted {
            drop(entry);
            kernel_cache::prune_unused();
        }
        Ok(runtime)
    }

    /// Runtime used by the latest run.
    pub fn most_recent_runtime(&self) -> Option<Arc<FusionKernelRuntime>> {
        self.runtimes.lock().most_recent.clone()
    }

    pub fn is_compiled(&self, args: &[Argument]) -> bool {
        self.runtimes.lock().entries.contains_key(&InputSignature::new(args))
    }

    pub fn stats(&self) -> CacheStats {
        self.runtimes.lock().stats.clone()
    }

    pub fn clear(&self) {
        let mut runtimes = self.runtimes.lock();
        runtimes.entries.clear();
        runtimes.most_recent = None;
        runtimes.stats.entries = 0;
        drop(runtimes);
        kernel_cache::prune_unused();
    }
}

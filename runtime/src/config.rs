//! Runtime configuration.
//!
//! Provides typed configuration for compilation and launches with bon
//! builders. [`FuserConfig`] also reads environment variable fallbacks.

use std::str::FromStr;

use bon::bon;
use enumset::EnumSet;
use once_cell::sync::Lazy;
use tracing::warn;

/// Default number of input signatures a [`FusionExecutorCache`] keeps.
///
/// [`FusionExecutorCache`]: crate::FusionExecutorCache
pub const DEFAULT_CACHE_CAPACITY: usize = 16;

/// Artifacts logged at `debug` level while compiling.
#[derive(Debug, Hash, PartialOrd, Ord, strum::Display, strum::EnumString)]
#[derive(enumset::EnumSetType)]
#[strum(serialize_all = "snake_case")]
pub enum DumpOption {
    /// Generated CUDA source.
    CudaKernel,
    /// Lowered kernel IR.
    KernelIr,
    /// The scheduled fusion before lowering.
    FusionIr,
    /// Grid, block and shared memory of every launch.
    LaunchParams,
    /// Groups and edges of a segmented fusion.
    SegmentedFusion,
}

static ENV_CONFIG: Lazy<FuserConfig> = Lazy::new(FuserConfig::from_env);

/// Compilation and caching settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuserConfig {
    /// Fail with an error instead of segmenting a fusion no single
    /// scheduler accepts.
    pub disable_segmentation: bool,
    /// Input signatures kept by each executor cache.
    pub cache_capacity: usize,
    pub dump: EnumSet<DumpOption>,
    /// Let a segment write its output into a dead intermediate buffer of
    /// the same shape.
    pub segment_aliasing: bool,
}

impl Default for FuserConfig {
    fn default() -> Self {
        Self {
            disable_segmentation: false,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            dump: EnumSet::empty(),
            segment_aliasing: false,
        }
    }
}

#[bon]
impl FuserConfig {
    #[builder]
    pub fn builder(
        #[builder(default = false)] disable_segmentation: bool,
        #[builder(default = DEFAULT_CACHE_CAPACITY)] cache_capacity: usize,
        #[builder(default)] dump: EnumSet<DumpOption>,
        #[builder(default = false)] segment_aliasing: bool,
    ) -> Self {
        Self { disable_segmentation, cache_capacity: cache_capacity.max(1), dump, segment_aliasing }
    }

    /// Create configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// * `FUSER_DISABLE_SEGMENTATION=1` - Fail instead of segmenting
    /// * `FUSER_CACHE_CAPACITY=N` - Signatures per executor cache (default: 16)
    /// * `FUSER_DUMP=cuda_kernel,kernel_ir,...` - Artifacts to log
    /// * `FUSER_SEGMENT_ALIASING=1` - Reuse dead segment inputs for outputs
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) over an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let flag = |name: &str| lookup(name).is_some_and(|v| matches!(v.trim(), "1" | "true" | "on" | "yes"));
        let cache_capacity = lookup("FUSER_CACHE_CAPACITY")
            .and_then(|s| s.trim().parse::<usize>().ok())
            .filter(|&n| n > 0)
            .unwrap_or(DEFAULT_CACHE_CAPACITY);
        let dump = lookup("FUSER_DUMP").map(|s| parse_dump(&s)).unwrap_or_default();

        Self {
            disable_segmentation: flag("FUSER_DISABLE_SEGMENTATION"),
            cache_capacity,
            dump,
            segment_aliasing: flag("FUSER_SEGMENT_ALIASING"),
        }
    }

    /// Settings read from the environment once per process.
    pub fn global() -> &'static FuserConfig {
        &ENV_CONFIG
    }

    pub fn dumps(&self, option: DumpOption) -> bool {
        self.dump.contains(option)
    }
}

/// Comma separated dump options; unknown names are skipped.
fn parse_dump(list: &str) -> EnumSet<DumpOption> {
    let mut dump = EnumSet::empty();
    for name in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        match DumpOption::from_str(name) {
            Ok(option) => dump.insert(option),
            Err(_) => {
                warn!(option = name, "ignoring unknown FUSER_DUMP option");
                false
            }
        };
    }
    dump
}

/// Launch overrides for one `run_fusion` call.
///
/// Unset dimensions come from the kernel's parallel dimension map.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LaunchParams {
    pub grid: [Option<u32>; 3],
    pub block: [Option<u32>; 3],
    /// Dynamic shared memory in bytes.
    pub shared_mem_bytes: Option<u32>,
}

#[bon]
impl LaunchParams {
    #[builder]
    pub fn builder(
        gdimx: Option<u32>,
        gdimy: Option<u32>,
        gdimz: Option<u32>,
        bdimx: Option<u32>,
        bdimy: Option<u32>,
        bdimz: Option<u32>,
        shared_mem_bytes: Option<u32>,
    ) -> Self {
        Self { grid: [gdimx, gdimy, gdimz], block: [bdimx, bdimy, bdimz], shared_mem_bytes }
    }

    /// Override in launch-slot order: grid x, y, z, then block x, y, z.
    pub fn slot(&self, slot: usize) -> Option<u32> {
        match slot {
            0..3 => self.grid[slot],
            3..6 => self.block[slot - 3],
            _ => None,
        }
    }
}

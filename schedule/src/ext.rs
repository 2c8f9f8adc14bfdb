//! The scheduling surface on [`Fusion`].

use fuser_ir::{Fusion, MemoryType, ParallelType, ValId};

use crate::domain::SplitFactor;
use crate::error::Result;
use crate::{cache, compute_at, domain, rfactor};

/// Per-tensor scheduling operations.
///
/// Axes left of a tensor's compute-at or max-producer position are fixed;
/// operations touching them fail.
pub trait ScheduleExt {
    /// Inner split: the new inner axis has extent `factor`.
    fn split(&mut self, tv: ValId, axis: isize, factor: impl Into<SplitFactor>) -> Result<()>;

    fn split_by(&mut self, tv: ValId, axis: isize, factor: impl Into<SplitFactor>, inner_split: bool) -> Result<()>;

    /// Outer split: the new outer axis has extent `factor`.
    fn outer_split(&mut self, tv: ValId, axis: isize, factor: impl Into<SplitFactor>) -> Result<()> {
        self.split_by(tv, axis, factor, false)
    }

    fn merge(&mut self, tv: ValId, outer: isize, inner: isize) -> Result<()>;

    /// Merge `axis` with the axis right after it.
    fn merge_next(&mut self, tv: ValId, axis: isize) -> Result<()> {
        self.merge(tv, axis, axis + 1)
    }

    fn reorder(&mut self, tv: ValId, old2new: &[(isize, isize)]) -> Result<()>;

    /// Factor the reduction axes `axes` into a new partial tensor.
    fn rfactor(&mut self, tv: ValId, axes: &[isize]) -> Result<ValId>;

    fn parallelize(&mut self, tv: ValId, axis: isize, parallel: ParallelType) -> Result<()>;

    fn set_memory_type(&mut self, tv: ValId, memory_type: MemoryType) -> Result<()>;

    fn cache_before(&mut self, tv: ValId) -> Result<ValId>;

    fn cache_after(&mut self, tv: ValId) -> Result<ValId>;

    fn cache_fork(&mut self, tv: ValId) -> Result<ValId>;

    /// Inline `producer` into the first `pos` loops of `consumer`; a negative
    /// position counts from the end.
    fn compute_at(&mut self, producer: ValId, consumer: ValId, pos: isize) -> Result<()>;
}

impl ScheduleExt for Fusion {
    fn split(&mut self, tv: ValId, axis: isize, factor: impl Into<SplitFactor>) -> Result<()> {
        domain::split(self, tv, axis, factor.into(), true)
    }

    fn split_by(&mut self, tv: ValId, axis: isize, factor: impl Into<SplitFactor>, inner_split: bool) -> Result<()> {
        domain::split(self, tv, axis, factor.into(), inner_split)
    }

    fn merge(&mut self, tv: ValId, outer: isize, inner: isize) -> Result<()> {
        domain::merge(self, tv, outer, inner)
    }

    fn reorder(&mut self, tv: ValId, old2new: &[(isize, isize)]) -> Result<()> {
        domain::reorder(self, tv, old2new)
    }

    fn rfactor(&mut self, tv: ValId, axes: &[isize]) -> Result<ValId> {
        rfactor::rfactor(self, tv, axes)
    }

    fn parallelize(&mut self, tv: ValId, axis: isize, parallel: ParallelType) -> Result<()> {
        domain::parallelize(self, tv, axis, parallel)
    }

    fn set_memory_type(&mut self, tv: ValId, memory_type: MemoryType) -> Result<()> {
        cache::set_memory_type(self, tv, memory_type)
    }

    fn cache_before(&mut self, tv: ValId) -> Result<ValId> {
        cache::cache_before(self, tv)
    }

    fn cache_after(&mut self, tv: ValId) -> Result<ValId> {
        cache::cache_after(self, tv)
    }

    fn cache_fork(&mut self, tv: ValId) -> Result<ValId> {
        cache::cache_fork(self, tv)
    }

    fn compute_at(&mut self, producer: ValId, consumer: ValId, pos: isize) -> Result<()> {
        compute_at::compute_at(self, producer, consumer, pos)
    }
}

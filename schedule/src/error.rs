use fuser_ir::{IterDomainId, ValId};
use snafu::Snafu;

pub type Result<T, E = ScheduleError> = std::result::Result<T, E>;

/// Schedule-validity errors.
///
/// The segmenter branches on these when it speculatively merges groups, so
/// every rejection a caller may want to recover from is a variant here.
#[derive(Debug, Clone, PartialEq, Snafu)]
#[snafu(visibility(pub))]
pub enum ScheduleError {
    #[snafu(display("{source}"), context(false))]
    Ir { source: fuser_ir::Error },

    /// The axis is left of a compute-at or max-producer position.
    #[snafu(display("axis {axis} of {tv} is fixed by position {fixed} and cannot be transformed"))]
    AxisFixed { tv: ValId, axis: usize, fixed: usize },

    #[snafu(display("cannot merge {tv} axes {outer} and {inner}: {reason}"))]
    InvalidMerge { tv: ValId, outer: usize, inner: usize, reason: &'static str },

    #[snafu(display("invalid reorder of {tv}: {reason}"))]
    InvalidReorder { tv: ValId, reason: &'static str },

    #[snafu(display("split factor of {tv} must be a positive integer scalar"))]
    InvalidSplitFactor { tv: ValId },

    #[snafu(display("cannot rfactor {tv}: {reason}"))]
    InvalidRFactor { tv: ValId, reason: &'static str },

    #[snafu(display("cannot cache {tv}: {reason}"))]
    InvalidCache { tv: ValId, reason: &'static str },

    #[snafu(display("{tv} cannot live in {memory_type} memory: {reason}"))]
    InvalidMemoryType { tv: ValId, memory_type: fuser_ir::MemoryType, reason: &'static str },

    #[snafu(display("{producer} is not a producer of {consumer}"))]
    NotAProducer { producer: ValId, consumer: ValId },

    #[snafu(display("compute-at position {pos} is out of range for {tv} with {ndims} axes"))]
    PositionOutOfRange { tv: ValId, pos: isize, ndims: usize },

    /// A required axis has no provably equal-extent counterpart.
    #[snafu(display("axis {id} of {consumer} cannot be mapped to {producer}"))]
    UnmappableAxis { producer: ValId, consumer: ValId, id: IterDomainId },

    #[snafu(display("reduction axis {id} of {tv} cannot be inlined into a consumer"))]
    ReductionInlined { tv: ValId, id: IterDomainId },

    /// Replaying would rewrite axes another compute-at already fixed.
    #[snafu(display("replay onto {tv} conflicts with its fixed axes"))]
    ReplayConflict { tv: ValId },

    #[snafu(display("{tv} axis {axis} cannot be parallelized with {parallel}: {reason}"))]
    InvalidParallelize { tv: ValId, axis: usize, parallel: fuser_ir::ParallelType, reason: &'static str },

    #[snafu(display("no scheduler accepts this fusion: {reason}"))]
    NoScheduler { reason: String },

    #[snafu(display("segmentation is disabled and the fusion needs {segments} kernels"))]
    SegmentationDisabled { segments: usize },
}

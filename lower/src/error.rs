use fuser_ir::{IterDomainId, MemoryType, ParallelType, ValId};
use snafu::Snafu;

pub type Result<T, E = LowerError> = std::result::Result<T, E>;

/// Errors found while turning a scheduled fusion into a kernel.
#[derive(Debug, Clone, PartialEq, Snafu)]
#[snafu(visibility(pub))]
pub enum LowerError {
    #[snafu(display("{source}"), context(false))]
    Schedule { source: fuser_schedule::ScheduleError },

    #[snafu(display("{source}"), context(false))]
    Ir { source: fuser_ir::Error },

    #[snafu(display("fusion has no outputs"))]
    NoOutputs,

    /// A producer axis inside its compute-at position has no counterpart in a consumer.
    #[snafu(display("axis {axis} of {producer} is computed at {consumer} but does not map to it"))]
    UnmappedComputeAt { producer: ValId, consumer: ValId, axis: usize },

    #[snafu(display("loop group of {id} is bound to both {first} and {second}"))]
    ParallelTypeConflict { id: IterDomainId, first: ParallelType, second: ParallelType },

    #[snafu(display("expressions form a cycle in the loop nest: {tensors}"))]
    LoopNestCycle { tensors: String },

    /// A producer's inlined loops do not enclose one of its consumers.
    #[snafu(display("{producer} is inlined into loops that do not enclose {consumer}"))]
    LoopNestMismatch { producer: ValId, consumer: ValId },

    /// A producer axis bound to `parallel` has no same-bound counterpart in
    /// the consumer, so the consumer would read values another thread holds.
    #[snafu(display("{producer} axis bound to {parallel} is not mapped in {consumer}; {producer} needs {required} memory"))]
    ParallelMismatch { producer: ValId, consumer: ValId, parallel: ParallelType, required: MemoryType },

    #[snafu(display("cannot vectorize {tv}: {reason}"))]
    InvalidVectorize { tv: ValId, reason: &'static str },

    #[snafu(display("a kernel supports one grid reduction, found {count}"))]
    MultipleGridReductions { count: usize },

    #[snafu(display("no index for axis {id} of {tv}"))]
    IndexUnavailable { tv: ValId, id: IterDomainId },

    #[snafu(display("unsupported: {reason}"))]
    Unsupported { reason: String },
}

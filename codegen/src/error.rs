//! Error types for code generation.

use fuser_ir::ValId;
use snafu::Snafu;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors that can occur during code generation.
#[derive(Debug, Snafu, PartialEq)]
#[snafu(visibility(pub))]
pub enum Error {
    /// A construct the CUDA renderer has no spelling for.
    #[snafu(display("Unsupported in CUDA codegen: {what}"))]
    Unsupported { what: String },

    /// A tensor is accessed without a parameter or allocation.
    #[snafu(display("T{} is used but never allocated", tv.index()))]
    UnallocatedTensor { tv: ValId },

    /// Register arrays need a size known at compile time.
    #[snafu(display("T{} is a register buffer with symbolic size {size}", tv.index()))]
    SymbolicLocalSize { tv: ValId, size: String },

    /// A shared buffer allocation without a slot in the shared memory plan.
    #[snafu(display("T{} has no shared memory offset", tv.index()))]
    MissingSharedOffset { tv: ValId },

    /// Error from the lowering layer.
    #[snafu(display("Lowering error: {source}"))]
    Lower {
        #[snafu(source)]
        source: fuser_lower::LowerError,
    },
}

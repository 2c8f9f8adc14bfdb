//! Error types for compiling and running fusions.

use fuser_dtype::DataType;
use fuser_ir::ValId;
use snafu::Snafu;

/// Result type for runtime operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("IR error: {source}"))]
    Ir { source: fuser_ir::Error },

    #[snafu(display("Scheduling error: {source}"))]
    Schedule { source: fuser_schedule::ScheduleError },

    #[snafu(display("Lowering error: {source}"))]
    Lower { source: fuser_lower::LowerError },

    #[snafu(display("Codegen error: {source}"))]
    Codegen { source: fuser_codegen::Error },

    /// The backend rejected the generated source.
    #[snafu(display("Compilation of '{entry_point}' failed: {log}"))]
    Compilation { entry_point: String, log: String, code: String },

    #[snafu(display("Function '{name}' not found in module"))]
    FunctionNotFound { name: String },

    #[cfg(feature = "cuda")]
    #[snafu(display("CUDA driver error: {source}"))]
    Cuda { source: cudarc::driver::DriverError },

    #[snafu(display("run_fusion called before compile_fusion"))]
    NotCompiled,

    #[snafu(display("Fusion takes {expected} arguments, {actual} given"))]
    ArgumentCount { expected: usize, actual: usize },

    #[snafu(display("Argument for {input} must be a {expected}"))]
    ArgumentKind { input: ValId, expected: &'static str },

    #[snafu(display("Input {input} was compiled for {expected}, got {actual}"))]
    DtypeMismatch { input: ValId, expected: DataType, actual: DataType },

    #[snafu(display("Input {input} was compiled for rank {expected}, got rank {actual}"))]
    RankMismatch { input: ValId, expected: usize, actual: usize },

    #[snafu(display("Input {input} was compiled contiguous in dimension {dim}, got strides {strides:?}"))]
    NotContiguous { input: ValId, dim: usize, strides: Vec<i64> },

    #[snafu(display("Vectorized access to {tensor} by {width} is invalid: {reason}"))]
    Vectorization { tensor: ValId, width: usize, reason: String },

    #[snafu(display("Preallocated output {output} is invalid: {reason}"))]
    InvalidOutput { output: ValId, reason: String },

    #[snafu(display("Could not evaluate {what}"))]
    Unevaluable { what: String },

    #[snafu(display("No single kernel computes the fusion and segmentation is disabled: {source}"))]
    SegmentationDisabled { source: fuser_schedule::ScheduleError },

    #[snafu(display("Launch of {threads} threads exceeds the host interpreter limit of {limit}"))]
    LaunchTooLarge { threads: u64, limit: u64 },

    #[snafu(display("Access to {tensor} at {index} is outside its {len} elements"))]
    OutOfBounds { tensor: ValId, index: i64, len: usize },

    #[snafu(display("Execution error: {reason}"))]
    Execution { reason: String },
}

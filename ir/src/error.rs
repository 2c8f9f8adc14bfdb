use fuser_dtype::DataType;
use snafu::Snafu;

use crate::ids::ValId;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// IR-construction errors: shape and type mismatches found while building a fusion.
#[derive(Debug, Clone, PartialEq, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// Tensor operands of one op disagree on rank.
    #[snafu(display("rank mismatch in {op}: expected {expected} dimensions, got {actual}"))]
    RankMismatch { op: &'static str, expected: usize, actual: usize },

    /// A tensor was required.
    #[snafu(display("{val} is not a tensor"))]
    NotATensor { val: ValId },

    /// Axis index outside `[-ndims, ndims)`.
    #[snafu(display("axis {axis} is out of range for a tensor with {ndims} dimensions"))]
    AxisOutOfRange { axis: isize, ndims: usize },

    #[snafu(display("axis {axis} listed more than once"))]
    DuplicateAxis { axis: usize },

    #[snafu(display("reduction needs at least one axis"))]
    EmptyReductionAxes,

    #[snafu(display("{op} cannot reduce with {reason}"))]
    InvalidReduction { op: &'static str, reason: String },

    /// Broadcast flags disagree with the input rank.
    #[snafu(display("broadcast of a {actual}-dimensional tensor has {expected} non-broadcast flags"))]
    BroadcastFlagsMismatch { expected: usize, actual: usize },

    #[snafu(display("dtype {dtype} is not supported by {op}"))]
    InvalidDType { op: &'static str, dtype: DataType },

    #[snafu(display("{val} has a definition and cannot be a fusion input"))]
    InputHasDefinition { val: ValId },

    #[snafu(display("{val} is already a fusion input"))]
    AlreadyInput { val: ValId },

    #[snafu(display("{val} is already a fusion output"))]
    AlreadyOutput { val: ValId },

    #[snafu(display("{val} is not a fusion output"))]
    NotAnOutput { val: ValId },

    #[snafu(display("cannot alias output {output} to input {input}: {reason}"))]
    InvalidAlias { output: ValId, input: ValId, reason: String },

    /// A bound size contradicts a constant or earlier binding of the same extent.
    #[snafu(display("extent mismatch for {tensor} dimension {dim}: expected {expected}, got {actual}"))]
    ExtentMismatch { tensor: ValId, dim: usize, expected: i64, actual: i64 },

    #[snafu(display("{tensor} has {expected} dimensions but {actual} sizes were bound"))]
    SizeRankMismatch { tensor: ValId, expected: usize, actual: usize },
}

/// Normalize a possibly negative axis against `ndims`.
pub fn normalize_axis(axis: isize, ndims: usize) -> Result<usize> {
    let normalized = if axis < 0 { axis + ndims as isize } else { axis };
    snafu::ensure!(normalized >= 0 && (normalized as usize) < ndims, AxisOutOfRangeSnafu { axis, ndims });
    Ok(normalized as usize)
}

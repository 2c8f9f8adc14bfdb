
/// Element types a fusion can compute with.
///
/// Variant order doubles as promotion priority: binary ops over two types
/// produce the later one.
#[derive(Debug, Hash, PartialOrd, Ord)]
#[derive(strum::EnumCount, strum::EnumIter, strum::VariantArray, strum::Display)]
#[derive(enumset::EnumSetType)]
#[enumset(repr = "u8")]
pub enum DataType {
    Bool,
    Int32,
    Int64,
    Half,
    Float,
    Double,
}

impl DataType {
    pub const fn bytes(&self) -> usize {
        match self {
            Self::Bool => 1,
            Self::Int32 => 4,
            Self::Int64 => 8,
            Self::Half => 2,
            Self::Float => 4,
            Self::Double => 8,
        }
    }

    pub const fn is_bool(&self) -> bool {
        matches!(self, Self::Bool)
    }

    pub const fn is_int(&self) -> bool {
        matches!(self, Self::Int32 | Self::Int64)
    }

    pub const fn is_float(&self) -> bool {
        matches!(self, Self::Half | Self::Float | Self::Double)
    }

    /// Spelling of the type in generated CUDA source.
    pub const fn cuda_type(&self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::Int32 => "int",
            Self::Int64 => "int64_t",
            Self::Half => "__half",
            Self::Float => "float",
            Self::Double => "double",
        }
    }

    /// Result type of a binary op over `self` and `other`.
    pub fn promote(self, other: Self) -> Self {
        self.max(other)
    }

    /// Type used to accumulate values of this type (halves accumulate in float).
    pub const fn accumulate_type(&self) -> Self {
        match self {
            Self::Half => Self::Float,
            _ => *self,
        }
    }

    /// Round a host `f64` to the precision of this type.
    ///
    /// Host buffers store every element as `f64`; this keeps them faithful to
    /// what the device would hold.
    pub fn round(&self, value: f64) -> f64 {
        match self {
            Self::Bool => {
                if value != 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            Self::Int32 => (value.trunc() as i64 as i32) as f64,
            Self::Int64 => value.trunc() as i64 as f64,
            Self::Half => round_to_half(value),
            Self::Float => value as f32 as f64,
            Self::Double => value,
        }
    }
}

/// Round to the nearest IEEE binary16 value, ties to even.
fn round_to_half(value: f64) -> f64 {
    let x = value as f32;
    if !x.is_finite() || x == 0.0 {
        return x as f64;
    }
    let abs = x.abs();
    if abs >= 65520.0 {
        return f64::INFINITY.copysign(value);
    }
    // Subnormal halves share the spacing of the smallest normal binade.
    let exponent = abs.log2().floor().max(-14.0);
    let quantum = (exponent - 10.0).exp2();
    ((abs / quantum).round_ties_even() * quantum).copysign(x) as f64
}

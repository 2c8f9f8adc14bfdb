//! Stable arena handles.
//!
//! Every node owned by a [`Fusion`](crate::Fusion) is addressed by a small
//! copyable index. Handles stay valid for the lifetime of the fusion that
//! produced them, and a deep copy of a fusion keeps every handle meaningful.

use std::fmt;

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u32);

        impl $name {
            pub const fn from_index(index: usize) -> Self {
                Self(index as u32)
            }

            pub const fn index(self) -> usize {
                self.0 as usize
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

define_id!(
    /// Handle of a scalar or tensor value.
    ValId,
    "v"
);
define_id!(
    /// Handle of a math expression.
    ExprId,
    "e"
);
define_id!(
    /// Handle of one axis of an iteration space.
    IterDomainId,
    "id"
);
define_id!(
    /// Handle of a recorded split or merge.
    TransformId,
    "tr"
);

use std::ops::{Deref, DerefMut};

use tracing::debug;

use crate::fusion::Fusion;

/// Scoped editing session over a fusion.
///
/// The guard holds the only mutable borrow of the fusion while graph
/// construction runs and reports what the session built when it is dropped,
/// whichever way the scope is left.
pub struct FusionGuard<'a> {
    fusion: &'a mut Fusion,
    first_val: usize,
    first_expr: usize,
}

impl<'a> FusionGuard<'a> {
    pub(crate) fn new(fusion: &'a mut Fusion) -> Self {
        let first_val = fusion.num_vals();
        let first_expr = fusion.num_expr_slots();
        Self { fusion, first_val, first_expr }
    }

    /// Values created since the guard was opened.
    pub fn created_vals(&self) -> usize {
        self.fusion.num_vals() - self.first_val
    }

    pub fn created_exprs(&self) -> usize {
        self.fusion.num_expr_slots() - self.first_expr
    }
}

impl Deref for FusionGuard<'_> {
    type Target = Fusion;

    fn deref(&self) -> &Fusion {
        self.fusion
    }
}

impl DerefMut for FusionGuard<'_> {
    fn deref_mut(&mut self) -> &mut Fusion {
        self.fusion
    }
}

impl Drop for FusionGuard<'_> {
    fn drop(&mut self) {
        debug!(
            vals = self.created_vals(),
            exprs = self.created_exprs(),
            inputs = self.fusion.inputs().len(),
            outputs = self.fusion.outputs().len(),
            "fusion guard released"
        );
    }
}

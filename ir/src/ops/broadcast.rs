use snafu::ensure;

use crate::error::*;
use crate::expr::ExprKind;
use crate::fusion::Fusion;
use crate::ids::ValId;
use crate::tensor_view::TensorDomain;
use crate::types::IterType;

impl Fusion {
    /// Insert broadcast axes into `tv`.
    ///
    /// `is_broadcast_dim` has one flag per output axis; the `false` positions
    /// take the input's non-reduction root axes in order.
    pub fn broadcast(&mut self, tv: ValId, is_broadcast_dim: &[bool]) -> Result<ValId> {
        self.ensure_tensor(tv)?;
        let input_root = self.non_reduction_root(tv);
        let kept = is_broadcast_dim.iter().filter(|&&flag| !flag).count();
        ensure!(kept == input_root.len(), BroadcastFlagsMismatchSnafu { expected: kept, actual: input_root.len() });

        let mut inputs = input_root.into_iter();
        let mut root = Vec::with_capacity(is_broadcast_dim.len());
        for &flag in is_broadcast_dim {
            let axis = if flag {
                let one = self.int_val(1);
                self.new_axis(one, IterType::Broadcast)
            } else {
                let Some(input) = inputs.next() else { unreachable!("flag count checked above") };
                let extent = self.extent(input);
                let iter_type = if self.id(input).is_broadcast() { IterType::Broadcast } else { IterType::Iteration };
                self.new_axis(extent, iter_type)
            };
            root.push(axis);
        }

        let dtype = self.dtype(tv);
        let out = self.new_tensor(TensorDomain::contiguous(root), dtype);
        self.register_expr(ExprKind::Broadcast { is_broadcast_dim: is_broadcast_dim.to_vec() }, vec![tv], vec![out]);
        Ok(out)
    }
}

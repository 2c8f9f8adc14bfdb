//! The fusion arena.
//!
//! A [`Fusion`] owns every value, expression, iteration domain and domain
//! transform of one dataflow graph. Nodes are referenced through the stable
//! handles in [`crate::ids`]; nothing is ever freed while the fusion lives,
//! which keeps the append-only transform history intact.
//!
//! Copying a fusion (`Clone`) is a deep copy of the arena, so handles taken
//! from the original address the same nodes in the copy. [`Fusion::take`]
//! moves the graph out and leaves an empty fusion behind.

use std::collections::{HashSet, VecDeque};

use fuser_dtype::DataType;
use snafu::ensure;
use tracing::trace;

use crate::error::*;
use crate::expr::{Expr, ExprKind};
use crate::guard::FusionGuard;
use crate::ids::{ExprId, IterDomainId, TransformId, ValId};
use crate::iter_domain::{IdTransform, IterDomain};
use crate::tensor_view::{TensorDomain, TensorView};
use crate::types::ConstValue;
use crate::val::{ScalarKind, Val, ValKind};

#[derive(Debug, Clone, Default)]
pub struct Fusion {
    vals: Vec<Val>,
    exprs: Vec<Option<Expr>>,
    iter_domains: Vec<IterDomain>,
    transforms: Vec<IdTransform>,
    inputs: Vec<ValId>,
    outputs: Vec<ValId>,
    /// `(output, input)` pairs where the output is written into the input's buffer.
    io_aliases: Vec<(ValId, ValId)>,
}

impl Fusion {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move the graph out, leaving an empty fusion.
    pub fn take(&mut self) -> Self {
        std::mem::take(self)
    }

    /// Open a scoped editing session.
    pub fn guard(&mut self) -> FusionGuard<'_> {
        FusionGuard::new(self)
    }

    pub fn num_vals(&self) -> usize {
        self.vals.len()
    }

    /// Number of expression slots, including removed ones.
    pub fn num_expr_slots(&self) -> usize {
        self.exprs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vals.is_empty()
    }

    // =========================================================================
    // Values
    // =========================================================================

    pub fn new_val(&mut self, dtype: DataType, kind: ValKind) -> ValId {
        let name = ValId::from_index(self.vals.len());
        self.vals.push(Val { name, dtype, kind, definition: None, uses: Vec::new() });
        name
    }

    pub fn new_const(&mut self, value: ConstValue) -> ValId {
        self.new_val(value.dtype(), ValKind::Scalar(ScalarKind::Const(value)))
    }

    pub fn new_const_typed(&mut self, value: ConstValue, dtype: DataType) -> ValId {
        self.new_val(dtype, ValKind::Scalar(ScalarKind::Const(value.cast(dtype))))
    }

    pub fn int_val(&mut self, value: i64) -> ValId {
        self.new_const(ConstValue::Int(value))
    }

    /// A symbolic scalar, typically a fusion input.
    pub fn new_scalar(&mut self, dtype: DataType) -> ValId {
        self.new_val(dtype, ValKind::Scalar(ScalarKind::Symbolic))
    }

    pub fn new_tensor(&mut self, domain: TensorDomain, dtype: DataType) -> ValId {
        self.new_val(dtype, ValKind::Tensor(TensorView::new(domain)))
    }

    pub fn val(&self, v: ValId) -> &Val {
        &self.vals[v.index()]
    }

    pub fn vals(&self) -> impl Iterator<Item = &Val> {
        self.vals.iter()
    }

    pub fn dtype(&self, v: ValId) -> DataType {
        self.val(v).dtype
    }

    pub fn is_tensor(&self, v: ValId) -> bool {
        self.val(v).is_tensor()
    }

    pub fn as_tv(&self, v: ValId) -> Option<&TensorView> {
        self.val(v).as_tensor()
    }

    pub fn tv(&self, v: ValId) -> &TensorView {
        match &self.vals[v.index()].kind {
            ValKind::Tensor(tv) => tv,
            ValKind::Scalar(_) => panic!("{v} is not a tensor"),
        }
    }

    pub fn tv_mut(&mut self, v: ValId) -> &mut TensorView {
        match &mut self.vals[v.index()].kind {
            ValKind::Tensor(tv) => tv,
            ValKind::Scalar(_) => panic!("{v} is not a tensor"),
        }
    }

    pub fn as_const(&self, v: ValId) -> Option<ConstValue> {
        self.val(v).as_const()
    }

    pub fn definition(&self, v: ValId) -> Option<ExprId> {
        self.val(v).definition
    }

    pub fn uses(&self, v: ValId) -> &[ExprId] {
        &self.val(v).uses
    }

    pub fn ensure_tensor(&self, v: ValId) -> Result<&TensorView> {
        self.as_tv(v).ok_or(Error::NotATensor { val: v })
    }

    // =========================================================================
    // Iteration domains
    // =========================================================================

    pub fn new_iter_domain(&mut self, id: IterDomain) -> IterDomainId {
        let name = IterDomainId::from_index(self.iter_domains.len());
        self.iter_domains.push(id);
        name
    }

    pub fn id(&self, id: IterDomainId) -> &IterDomain {
        &self.iter_domains[id.index()]
    }

    pub fn id_mut(&mut self, id: IterDomainId) -> &mut IterDomain {
        &mut self.iter_domains[id.index()]
    }

    pub fn extent(&self, id: IterDomainId) -> ValId {
        self.id(id).extent
    }

    /// Fresh copy of an axis without its history.
    pub fn clone_iter_domain(&mut self, id: IterDomainId) -> IterDomainId {
        let mut copy = self.id(id).clone();
        copy.definition = None;
        copy.is_rfactor = false;
        self.new_iter_domain(copy)
    }

    pub fn add_transform(&mut self, transform: IdTransform) -> TransformId {
        let name = TransformId::from_index(self.transforms.len());
        for output in transform.outputs() {
            self.iter_domains[output.index()].definition = Some(name);
        }
        self.transforms.push(transform);
        name
    }

    pub fn transform(&self, t: TransformId) -> &IdTransform {
        &self.transforms[t.index()]
    }

    pub fn num_transforms(&self) -> usize {
        self.transforms.len()
    }

    /// Transforms on the paths from `from` to `to`, in creation order.
    ///
    /// Creation order is a topological order of the transform graph, so
    /// replaying the result forward from `from` reproduces `to`.
    pub fn transforms_between(&self, from: &[IterDomainId], to: &[IterDomainId]) -> Vec<TransformId> {
        let from: HashSet<IterDomainId> = from.iter().copied().collect();
        let mut seen = HashSet::new();
        let mut stack: Vec<IterDomainId> = to.to_vec();
        let mut result = Vec::new();
        while let Some(id) = stack.pop() {
            if from.contains(&id) {
                continue;
            }
            let Some(def) = self.id(id).definition else { continue };
            if seen.insert(def) {
                result.push(def);
                stack.extend(self.transform(def).inputs());
            }
        }
        result.sort();
        result
    }

    /// Root-to-leaf history of a tensor.
    pub fn history(&self, tv: ValId) -> Vec<TransformId> {
        let domain = self.tv(tv).domain();
        self.transforms_between(domain.root(), domain.leaf())
    }

    /// Every id reachable from `start` through `history`, including `start`.
    pub fn ids_of_history(&self, start: &[IterDomainId], history: &[TransformId]) -> Vec<IterDomainId> {
        let mut ids = start.to_vec();
        for &t in history {
            ids.extend(self.transform(t).outputs());
        }
        ids
    }

    // =========================================================================
    // Expressions
    // =========================================================================

    pub fn register_expr(&mut self, kind: ExprKind, inputs: Vec<ValId>, outputs: Vec<ValId>) -> ExprId {
        let name = ExprId::from_index(self.exprs.len());
        for &input in &inputs {
            let uses = &mut self.vals[input.index()].uses;
            if !uses.contains(&name) {
                uses.push(name);
            }
        }
        for &output in &outputs {
            self.vals[output.index()].definition = Some(name);
        }
        trace!(expr = %name, kind = kind.name(), inputs = ?inputs, outputs = ?outputs, "registered expression");
        self.exprs.push(Some(Expr { name, kind, inputs, outputs }));
        name
    }

    pub fn expr(&self, e: ExprId) -> &Expr {
        match &self.exprs[e.index()] {
            Some(expr) => expr,
            None => panic!("{e} was removed from the fusion"),
        }
    }

    pub fn is_live_expr(&self, e: ExprId) -> bool {
        self.exprs.get(e.index()).is_some_and(Option::is_some)
    }

    pub fn remove_expr(&mut self, e: ExprId) {
        let Some(expr) = self.exprs[e.index()].take() else { return };
        for input in &expr.inputs {
            self.vals[input.index()].uses.retain(|&u| u != e);
        }
        for output in &expr.outputs {
            let val = &mut self.vals[output.index()];
            if val.definition == Some(e) {
                val.definition = None;
            }
        }
    }

    /// Recreate `e` reading `new` wherever it read `old`.
    pub fn replace_expr_input(&mut self, e: ExprId, old: ValId, new: ValId) -> ExprId {
        let expr = self.expr(e).clone();
        self.remove_expr(e);
        let inputs = expr.inputs.iter().map(|&v| if v == old { new } else { v }).collect();
        self.register_expr(expr.kind, inputs, expr.outputs)
    }

    /// Recreate `e` writing `new` instead of `old`.
    pub fn replace_expr_output(&mut self, e: ExprId, old: ValId, new: ValId) -> ExprId {
        let expr = self.expr(e).clone();
        self.remove_expr(e);
        let outputs = expr.outputs.iter().map(|&v| if v == old { new } else { v }).collect();
        self.register_expr(expr.kind, expr.inputs, outputs)
    }

    // =========================================================================
    // Inputs and outputs
    // =========================================================================

    pub fn add_input(&mut self, v: ValId) -> Result<()> {
        ensure!(self.definition(v).is_none(), InputHasDefinitionSnafu { val: v });
        ensure!(!self.inputs.contains(&v), AlreadyInputSnafu { val: v });
        self.inputs.push(v);
        Ok(())
    }

    pub fn add_output(&mut self, v: ValId) -> Result<()> {
        self.ensure_tensor(v)?;
        ensure!(!self.outputs.contains(&v), AlreadyOutputSnafu { val: v });
        self.outputs.push(v);
        Ok(())
    }

    pub fn remove_input(&mut self, v: ValId) {
        self.inputs.retain(|&i| i != v);
        self.io_aliases.retain(|&(_, i)| i != v);
    }

    pub fn remove_output(&mut self, v: ValId) {
        self.outputs.retain(|&o| o != v);
        self.io_aliases.retain(|&(o, _)| o != v);
    }

    pub fn replace_output(&mut self, old: ValId, new: ValId) {
        for output in &mut self.outputs {
            if *output == old {
                *output = new;
            }
        }
        for (output, _) in &mut self.io_aliases {
            if *output == old {
                *output = new;
            }
        }
    }

    pub fn inputs(&self) -> &[ValId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[ValId] {
        &self.outputs
    }

    pub fn is_input(&self, v: ValId) -> bool {
        self.inputs.contains(&v)
    }

    pub fn is_output(&self, v: ValId) -> bool {
        self.outputs.contains(&v)
    }

    /// Declare that `output` is written in place into `input`'s buffer.
    pub fn alias_output_to_input(&mut self, output: ValId, input: ValId) -> Result<()> {
        ensure!(self.is_output(output), NotAnOutputSnafu { val: output });
        let invalid = |reason: &str| Error::InvalidAlias { output, input, reason: reason.to_string() };
        if !self.is_input(input) || !self.is_tensor(input) {
            return Err(invalid("the target is not an input tensor"));
        }
        if self.dtype(output) != self.dtype(input) {
            return Err(invalid("dtypes differ"));
        }
        let out_rank = self.non_reduction_root(output).len();
        let in_rank = self.tv(input).domain().root().len();
        if out_rank != in_rank {
            return Err(invalid("ranks differ"));
        }
        if self.io_aliases.iter().any(|&(o, i)| o == output || i == input) {
            return Err(invalid("already aliased"));
        }
        self.io_aliases.push((output, input));
        Ok(())
    }

    pub fn io_aliases(&self) -> &[(ValId, ValId)] {
        &self.io_aliases
    }

    pub fn aliased_input(&self, output: ValId) -> Option<ValId> {
        self.io_aliases.iter().find(|&&(o, _)| o == output).map(|&(_, i)| i)
    }

    // =========================================================================
    // Traversal
    // =========================================================================

    /// Expressions needed to compute the outputs, producers first.
    ///
    /// Outputs are visited in declaration order and expression inputs in
    /// operand order, so the result is deterministic.
    pub fn exprs(&self) -> Vec<ExprId> {
        let mut order = Vec::new();
        let mut visited = HashSet::new();
        let mut stack: Vec<(ExprId, usize)> = Vec::new();
        for &output in &self.outputs {
            if let Some(def) = self.definition(output)
                && visited.insert(def)
            {
                stack.push((def, 0));
            }
            while let Some(top) = stack.last_mut() {
                let (e, i) = *top;
                let inputs = self.expr(e).inputs();
                if i < inputs.len() {
                    top.1 += 1;
                    if let Some(def) = self.definition(inputs[i])
                        && visited.insert(def)
                    {
                        stack.push((def, 0));
                    }
                } else {
                    order.push(e);
                    stack.pop();
                }
            }
        }
        order
    }

    /// Expressions producing tensors, producers first.
    pub fn tensor_exprs(&self) -> Vec<ExprId> {
        self.exprs().into_iter().filter(|&e| self.expr(e).outputs().iter().any(|&o| self.is_tensor(o))).collect()
    }

    /// Every tensor participating in the computation: inputs first, then in
    /// expression order.
    pub fn all_tensors(&self) -> Vec<ValId> {
        let mut seen = HashSet::new();
        let mut result = Vec::new();
        for &input in &self.inputs {
            if self.is_tensor(input) && seen.insert(input) {
                result.push(input);
            }
        }
        for e in self.exprs() {
            for &v in self.expr(e).inputs().iter().chain(self.expr(e).outputs()) {
                if self.is_tensor(v) && seen.insert(v) {
                    result.push(v);
                }
            }
        }
        result
    }

    /// Tensor inputs of the definition of `v`.
    pub fn producer_tvs(&self, v: ValId) -> Vec<ValId> {
        let Some(def) = self.definition(v) else { return Vec::new() };
        let mut result = Vec::new();
        for &input in self.expr(def).inputs() {
            if self.is_tensor(input) && !result.contains(&input) {
                result.push(input);
            }
        }
        result
    }

    /// Tensor outputs of the uses of `v`, in registration order.
    pub fn consumer_tvs(&self, v: ValId) -> Vec<ValId> {
        let mut uses = self.uses(v).to_vec();
        uses.sort();
        let mut result = Vec::new();
        for e in uses {
            for &output in self.expr(e).outputs() {
                if self.is_tensor(output) && !result.contains(&output) {
                    result.push(output);
                }
            }
        }
        result
    }

    /// Other outputs of the expression defining `v`.
    pub fn siblings(&self, v: ValId) -> Vec<ValId> {
        let Some(def) = self.definition(v) else { return Vec::new() };
        self.expr(def).outputs().iter().copied().filter(|&o| o != v && self.is_tensor(o)).collect()
    }

    /// Make every sibling of `v` share its domain, positions and memory type.
    pub fn sync_siblings(&mut self, v: ValId) {
        let siblings = self.siblings(v);
        if siblings.is_empty() {
            return;
        }
        let view = self.tv(v).clone();
        for sibling in siblings {
            self.tv_mut(sibling).copy_schedule_state(&view);
        }
    }

    /// Whether `consumer` transitively reads `producer`.
    pub fn depends_on(&self, consumer: ValId, producer: ValId) -> bool {
        let mut queue = VecDeque::from([consumer]);
        let mut seen = HashSet::new();
        while let Some(v) = queue.pop_front() {
            if v == producer {
                return true;
            }
            if !seen.insert(v) {
                continue;
            }
            if let Some(def) = self.definition(v) {
                queue.extend(self.expr(def).inputs().iter().copied());
            }
        }
        false
    }

    /// Defined by a reduction or Welford.
    pub fn is_reduction_tv(&self, v: ValId) -> bool {
        self.definition(v).is_some_and(|e| self.expr(e).kind().is_reduction())
    }

    /// Root axes of `v` as seen by a consumer: maybe-rfactor minus reductions.
    pub fn non_reduction_root(&self, v: ValId) -> Vec<IterDomainId> {
        self.tv(v).domain().maybe_rfactor().iter().copied().filter(|&id| !self.id(id).is_reduction()).collect()
    }

    pub fn has_reduction_axes(&self, v: ValId) -> bool {
        self.tv(v).domain().leaf().iter().any(|&id| self.id(id).is_reduction())
    }
}

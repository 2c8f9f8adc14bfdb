//! Emitting kernel IR from the loop-nest tree.
//!
//! Walking the tree keeps a stack of enclosing loops. Each loop opens with
//! the register buffers inlined at it; reduction results are initialized
//! just before their first reduction loop; each expression becomes one
//! guarded op. Unswitched loops are emitted twice, once without bounds
//! checks under a single hoisted condition and once fully predicated.

use std::collections::HashMap;

use fuser_ir::{ConstValue, ExprId, ExprKind, Fusion, IterDomainId, MemoryType, ParallelType, ParallelTypeSet, ValId};
use snafu::ensure;
use tracing::trace;

use crate::compute_at_map::ComputeAtMap;
use crate::error::*;
use crate::index::{Indexer, LoopFrame, memory_of};
use crate::kir::*;
use crate::loop_nest::LoopNode;
use crate::parallel_dims::ParallelDimensionMap;
use crate::predicate::PredicateBuilder;
use crate::thread_predicate::ThreadPredicateMap;
use crate::utils::{expr_output, first_reduction_leaf, lower_val, reduced_parallel_types, tensor_inputs};

struct UnswitchState {
    /// Loops at or past this depth are inside the unswitched loop.
    depth: usize,
    conditions: Vec<Scalar>,
    has_collective: bool,
}

pub struct KernelBuilder<'a> {
    fusion: &'a Fusion,
    ca_map: &'a ComputeAtMap,
    thread_preds: &'a ThreadPredicateMap,
    indexer: &'a Indexer<'a>,
    predicates: PredicateBuilder<'a>,
    loops: Vec<LoopFrame>,
    next_loop: u32,
    inits: HashMap<IterDomainId, Vec<ExprId>>,
    allocations: HashMap<IterDomainId, Vec<ValId>>,
    top_allocations: Vec<ValId>,
    unswitch: Option<UnswitchState>,
}

impl<'a> KernelBuilder<'a> {
    pub fn new(
        fusion: &'a Fusion,
        ca_map: &'a ComputeAtMap,
        pdims: &'a ParallelDimensionMap,
        thread_preds: &'a ThreadPredicateMap,
        indexer: &'a Indexer<'a>,
    ) -> Self {
        let mut inits: HashMap<IterDomainId, Vec<ExprId>> = HashMap::new();
        let mut allocations: HashMap<IterDomainId, Vec<ValId>> = HashMap::new();
        let mut top_allocations = Vec::new();
        for e in fusion.tensor_exprs() {
            let expr = fusion.expr(e);
            if expr.kind().is_reduction()
                && let Some(out) = expr_output(fusion, expr.outputs())
                && let Some(j) = first_reduction_leaf(fusion, out)
            {
                inits.entry(ca_map.class(fusion.tv(out).axis(j))).or_default().push(e);
            }
            for &tv in expr.outputs() {
                if !fusion.is_tensor(tv) || fusion.is_output(tv) {
                    continue;
                }
                let ca = fusion.tv(tv).compute_at_position();
                match memory_of(fusion, tv) {
                    MemoryType::Global => {}
                    MemoryType::Shared => top_allocations.push(tv),
                    MemoryType::Local if ca == 0 => top_allocations.push(tv),
                    MemoryType::Local => {
                        allocations.entry(ca_map.class(fusion.tv(tv).axis(ca - 1))).or_default().push(tv);
                    }
                }
            }
        }
        Self {
            fusion,
            ca_map,
            thread_preds,
            indexer,
            predicates: PredicateBuilder::new(fusion, ca_map, pdims, indexer),
            loops: Vec::new(),
            next_loop: 0,
            inits,
            allocations,
            top_allocations,
            unswitch: None,
        }
    }

    pub fn build(mut self, tree: &[LoopNode]) -> Result<Vec<Stmt>> {
        let mut body = Vec::new();
        for tv in self.top_allocations.clone() {
            body.push(self.allocate(tv));
        }
        for node in tree {
            self.emit_node(node, &mut body)?;
        }
        Ok(body)
    }

    fn fresh_loop(&mut self) -> LoopId {
        let id = LoopId(self.next_loop);
        self.next_loop += 1;
        id
    }

    fn allocate(&self, tv: ValId) -> Stmt {
        Stmt::Allocate(Allocate {
            tv,
            memory: memory_of(self.fusion, tv),
            dtype: self.fusion.dtype(tv),
            size: self.indexer.allocation_size(tv),
            alias: None,
        })
    }

    fn emit_allocations(&self, class: IterDomainId, exprs: &[ExprId], out: &mut Vec<Stmt>) {
        let Some(tvs) = self.allocations.get(&class) else { return };
        for &tv in tvs {
            if self.fusion.definition(tv).is_some_and(|d| exprs.contains(&d)) {
                out.push(self.allocate(tv));
            }
        }
    }

    fn emit_node(&mut self, node: &LoopNode, out: &mut Vec<Stmt>) -> Result<()> {
        let (class, children) = match node {
            LoopNode::Expr(e) => return self.emit_expr(*e, out),
            LoopNode::Loop { class, children } => (*class, children),
        };
        let exprs = node.exprs();
        if let Some(inits) = self.inits.get(&class).cloned() {
            for e in inits.into_iter().filter(|e| exprs.contains(e)) {
                self.emit_init(e, out)?;
            }
        }

        if self.ca_map.is_broadcast(self.fusion, class) {
            self.loops.push(LoopFrame {
                class,
                index: Scalar::ZERO,
                extent: Scalar::ONE,
                parallel: ParallelType::Serial,
                loop_id: None,
            });
            self.emit_allocations(class, &exprs, out);
            for child in children {
                self.emit_node(child, out)?;
            }
            self.loops.pop();
            return Ok(());
        }

        let parallel = self.ca_map.parallel_type(class);
        if parallel == ParallelType::Unswitch && self.unswitch.is_none() {
            return self.emit_unswitch(class, children, &exprs, out);
        }
        let parallel = if parallel == ParallelType::Unswitch { ParallelType::Serial } else { parallel };
        let index = self.fresh_loop();
        let for_loop = self.emit_loop(index, class, parallel, children, &exprs)?;
        out.push(Stmt::For(for_loop));
        Ok(())
    }

    fn emit_loop(
        &mut self,
        index: LoopId,
        class: IterDomainId,
        parallel: ParallelType,
        children: &[LoopNode],
        exprs: &[ExprId],
    ) -> Result<ForLoop> {
        let extent = self.indexer.concrete_extent(class);
        let value = if parallel.is_launch_dim() { Scalar::ParallelIndex(parallel) } else { Scalar::Loop(index) };
        self.loops.push(LoopFrame {
            class,
            index: value,
            extent: extent.clone(),
            parallel,
            loop_id: (!parallel.is_launch_dim()).then_some(index),
        });
        let mut body = Vec::new();
        self.emit_allocations(class, exprs, &mut body);
        for child in children {
            self.emit_node(child, &mut body)?;
        }
        self.loops.pop();
        Ok(ForLoop { index, extent, parallel, iter_domain: self.ca_map.concrete(class), body })
    }

    fn emit_unswitch(&mut self, class: IterDomainId, children: &[LoopNode], exprs: &[ExprId], out: &mut Vec<Stmt>) -> Result<()> {
        let index = self.fresh_loop();
        self.unswitch = Some(UnswitchState { depth: self.loops.len() + 1, conditions: Vec::new(), has_collective: false });
        let fast = self.emit_loop(index, class, ParallelType::Serial, children, exprs);
        let state = self.unswitch.take();
        let mut fast = fast?;
        let Some(state) = state.filter(|s| !s.has_collective) else {
            trace!(%class, "unswitch skipped around a collective");
            let slow = self.emit_loop(index, class, ParallelType::Serial, children, exprs)?;
            out.push(Stmt::For(slow));
            return Ok(());
        };

        let cond = Scalar::all(state.conditions);
        if cond.is_true() {
            out.push(Stmt::For(fast));
            return Ok(());
        }
        let unit = fast.extent == Scalar::ONE && all_loops_unit(&fast.body);
        let else_body = if unit { Vec::new() } else { self.emit_loop(index, class, ParallelType::Serial, children, exprs)?.body };
        let then_body = std::mem::take(&mut fast.body);
        fast.body = vec![Stmt::If(IfThenElse { cond, then_body, else_body })];
        out.push(Stmt::For(fast));
        Ok(())
    }

    /// Bounds checks of ops inside an unswitched loop move to its condition,
    /// evaluated at the last iteration of every inner serial loop.
    fn bounds_guard(&mut self, bounds: Scalar) -> Scalar {
        let Some(state) = self.unswitch.as_mut() else { return bounds };
        let inner: HashMap<LoopId, Scalar> = self.loops[state.depth.min(self.loops.len())..]
            .iter()
            .filter_map(|f| f.loop_id.map(|l| (l, f.extent.clone().sub(Scalar::ONE))))
            .collect();
        let hoisted = bounds.substitute(&|l| inner.get(&l).cloned());
        if !hoisted.is_true() && !state.conditions.contains(&hoisted) {
            state.conditions.push(hoisted);
        }
        Scalar::TRUE
    }

    fn check_enclosure(&self, consumer: ValId, inputs: &[ValId]) -> Result<()> {
        for producer in tensor_inputs(self.fusion, inputs) {
            let tv = self.fusion.tv(producer);
            for i in 0..tv.compute_at_position() {
                let class = self.ca_map.class(tv.axis(i));
                ensure!(self.loops.iter().any(|f| f.class == class), LoopNestMismatchSnafu { producer, consumer });
            }
        }
        Ok(())
    }

    fn output(&self, tv: ValId) -> Result<TensorIndex> {
        Ok(TensorIndex { tv, dtype: self.fusion.dtype(tv), index: self.indexer.consumer_index(tv, &self.loops)? })
    }

    fn operand(&self, v: ValId, consumer: ValId) -> Result<Operand> {
        let dtype = self.fusion.dtype(v);
        if !self.fusion.is_tensor(v) {
            return Ok(Operand::Scalar { value: lower_val(self.fusion, v), dtype });
        }
        let index = self.indexer.producer_index(v, consumer, &self.loops)?;
        Ok(Operand::Tensor(TensorIndex { tv: v, dtype, index }))
    }

    fn emit_guarded(&self, guard: Scalar, op: Op, out: &mut Vec<Stmt>) {
        if guard.is_true() {
            out.push(Stmt::Op(op));
        } else {
            out.push(Stmt::If(IfThenElse { cond: guard, then_body: vec![Stmt::Op(op)], else_body: Vec::new() }));
        }
    }

    fn emit_expr(&mut self, e: ExprId, out: &mut Vec<Stmt>) -> Result<()> {
        let fusion = self.fusion;
        let expr = fusion.expr(e);
        let Some(tv) = expr_output(fusion, expr.outputs()) else { return Ok(()) };
        self.check_enclosure(tv, expr.inputs())?;
        let indices = self.indexer.consumer_indices(tv, &self.loops)?;
        let thread_types = self.thread_preds.expr_types(e);

        let read_bounds = self.predicates.bounds(tv, &indices, true);
        let read_bounds = self.bounds_guard(read_bounds);
        let read_pred = read_bounds.and(self.predicates.parallel_bounds(tv, true));
        let reduced = if expr.kind().is_reduction() { reduced_parallel_types(fusion, self.ca_map, tv) } else { ParallelTypeSet::empty() };

        if !reduced.is_empty() || !self.thread_preds.broadcast_types(e).is_empty() {
            if let Some(state) = self.unswitch.as_mut() {
                state.has_collective = true;
            }
        }

        let serial_guard = |redundant: ParallelTypeSet| {
            read_pred.clone().and(PredicateBuilder::thread_predicate(thread_types | redundant))
        };

        match expr.kind() {
            ExprKind::Unary(op) => {
                let op = Op::Unary { op: *op, out: self.output(tv)?, input: self.operand(expr.input(0), tv)? };
                self.emit_guarded(serial_guard(self.predicates.redundant_types(tv, false)), op, out);
            }
            ExprKind::Binary(op) => {
                let op = Op::Binary {
                    op: *op,
                    out: self.output(tv)?,
                    lhs: self.operand(expr.input(0), tv)?,
                    rhs: self.operand(expr.input(1), tv)?,
                };
                self.emit_guarded(serial_guard(self.predicates.redundant_types(tv, false)), op, out);
            }
            ExprKind::Ternary(_) => {
                let op = Op::Where {
                    out: self.output(tv)?,
                    cond: self.operand(expr.input(0), tv)?,
                    a: self.operand(expr.input(1), tv)?,
                    b: self.operand(expr.input(2), tv)?,
                };
                self.emit_guarded(serial_guard(self.predicates.redundant_types(tv, false)), op, out);
            }
            ExprKind::Reduction { op, init } => {
                let out_index = self.output(tv)?;
                let input = self.operand(expr.input(0), tv)?;
                let init = init.cast(fusion.dtype(tv));
                if reduced.is_empty() {
                    let op = Op::Reduction { op: *op, out: out_index, input, init, collective: Collective::Serial };
                    self.emit_guarded(serial_guard(self.predicates.redundant_types(tv, false)), op, out);
                } else {
                    let collective = self.collective(tv, &indices, reduced, read_pred.clone(), thread_types);
                    out.push(Stmt::Op(Op::Reduction { op: *op, out: out_index, input, init, collective }));
                }
            }
            ExprKind::Welford => {
                let triple = WelfordTriple {
                    avg: self.output(expr.output(0))?,
                    var_sum: self.output(expr.output(1))?,
                    n: self.output(expr.output(2))?,
                };
                let input = if expr.is_welford_combine() {
                    WelfordInput::Partial {
                        avg: self.operand(expr.input(0), tv)?,
                        var_sum: self.operand(expr.input(1), tv)?,
                        n: self.operand(expr.input(2), tv)?,
                    }
                } else {
                    WelfordInput::Sample(self.operand(expr.input(0), tv)?)
                };
                if reduced.is_empty() {
                    let op = Op::Welford { out: triple, input, collective: Collective::Serial };
                    self.emit_guarded(serial_guard(self.predicates.redundant_types(tv, false)), op, out);
                } else {
                    let collective = self.collective(tv, &indices, reduced, read_pred.clone(), thread_types);
                    out.push(Stmt::Op(Op::Welford { out: triple, input, collective }));
                }
            }
            ExprKind::Broadcast { .. } => {
                let out_index = self.output(tv)?;
                let input = self.operand(expr.input(0), tv)?;
                let spread = self.thread_preds.broadcast_types(e);
                if spread.is_empty() {
                    let op = Op::Broadcast { out: out_index, input, collective: Collective::Serial };
                    self.emit_guarded(serial_guard(self.predicates.redundant_types(tv, false)), op, out);
                } else {
                    let read_pred = read_pred.clone().and(PredicateBuilder::thread_predicate(thread_types - spread));
                    let write_pred = PredicateBuilder::thread_predicate(self.predicates.redundant_types(tv, false));
                    let collective = if spread.iter().any(ParallelType::is_block_dim) {
                        Collective::Grid { types: spread, read_pred, write_pred }
                    } else {
                        Collective::Block { types: spread, read_pred, write_pred }
                    };
                    out.push(Stmt::Op(Op::Broadcast { out: out_index, input, collective }));
                }
            }
        }
        Ok(())
    }

    /// Block or grid reduction over the launch types in `reduced`.
    fn collective(
        &self,
        tv: ValId,
        indices: &HashMap<IterDomainId, Scalar>,
        reduced: ParallelTypeSet,
        read_pred: Scalar,
        thread_types: ParallelTypeSet,
    ) -> Collective {
        let read_pred = read_pred.and(PredicateBuilder::thread_predicate(thread_types));
        let write_bounds = self.predicates.bounds(tv, indices, false);
        let write_pred = write_bounds
            .and(self.predicates.parallel_bounds(tv, false))
            .and(PredicateBuilder::thread_predicate(thread_types | self.predicates.redundant_types(tv, true)));
        if reduced.iter().any(ParallelType::is_block_dim) {
            Collective::Grid { types: reduced, read_pred, write_pred }
        } else {
            Collective::Block { types: reduced, read_pred, write_pred }
        }
    }

    /// Initialize a reduction result before its first reduction loop.
    ///
    /// Leaves past that loop that are not yet enclosed get their own init
    /// loops; reduction leaves index zero since the result does not span them.
    fn emit_init(&mut self, e: ExprId, out: &mut Vec<Stmt>) -> Result<()> {
        let fusion = self.fusion;
        let expr = fusion.expr(e);
        let Some(tv) = expr_output(fusion, expr.outputs()) else { return Ok(()) };
        let Some(first) = first_reduction_leaf(fusion, tv) else { return Ok(()) };
        let depth = self.loops.len();
        let mut init_loops: Vec<(LoopId, IterDomainId, Scalar, ParallelType)> = Vec::new();
        for &leaf in &fusion.tv(tv).domain().leaf()[first..] {
            let class = self.ca_map.class(leaf);
            if self.loops.iter().any(|f| f.class == class) {
                continue;
            }
            let axis = fusion.id(leaf);
            let pt = self.ca_map.parallel_type(leaf);
            let extent = self.indexer.concrete_extent(leaf);
            let (index, loop_id) = if axis.is_reduction() || axis.is_broadcast() || self.ca_map.is_broadcast(fusion, leaf) {
                (Scalar::ZERO, None)
            } else if pt.is_launch_dim() {
                (Scalar::ParallelIndex(pt), None)
            } else {
                let id = self.fresh_loop();
                init_loops.push((id, class, extent.clone(), pt));
                (Scalar::Loop(id), Some(id))
            };
            self.loops.push(LoopFrame { class, index, extent, parallel: pt, loop_id });
        }

        let result = self.init_ops(e, tv);
        self.loops.truncate(depth);
        let (guard, ops) = result?;

        let mut body: Vec<Stmt> = Vec::new();
        for op in ops {
            self.emit_guarded(guard.clone(), op, &mut body);
        }
        for (index, class, extent, parallel) in init_loops.into_iter().rev() {
            let parallel = if parallel == ParallelType::Unswitch { ParallelType::Serial } else { parallel };
            body = vec![Stmt::For(ForLoop { index, extent, parallel, iter_domain: self.ca_map.concrete(class), body })];
        }
        out.extend(body);
        Ok(())
    }

    fn init_ops(&mut self, e: ExprId, tv: ValId) -> Result<(Scalar, Vec<Op>)> {
        let fusion = self.fusion;
        let expr = fusion.expr(e);
        let indices = self.indexer.consumer_indices(tv, &self.loops)?;
        let bounds = self.predicates.bounds(tv, &indices, false);
        let guard = self
            .bounds_guard(bounds)
            .and(self.predicates.parallel_bounds(tv, false))
            .and(PredicateBuilder::thread_predicate(self.predicates.redundant_types(tv, true)));
        let ops = match expr.kind() {
            ExprKind::Reduction { init, .. } => vec![Op::Init { out: self.output(tv)?, value: init.cast(fusion.dtype(tv)) }],
            ExprKind::Welford => {
                let mut ops = Vec::with_capacity(3);
                for &out in expr.outputs() {
                    ops.push(Op::Init { out: self.output(out)?, value: ConstValue::zero(fusion.dtype(out)) });
                }
                ops
            }
            _ => Vec::new(),
        };
        Ok((guard, ops))
    }
}

/// Every serial loop in `stmts` runs exactly once.
fn all_loops_unit(stmts: &[Stmt]) -> bool {
    let mut unit = true;
    Stmt::walk(stmts, &mut |s| {
        if let Stmt::For(l) = s
            && !l.parallel.is_launch_dim()
            && l.extent != Scalar::ONE
        {
            unit = false;
        }
    });
    unit
}

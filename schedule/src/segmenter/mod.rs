//! Fusion segmentation.
//!
//! When no single scheduler accepts a fusion, the segmenter partitions its
//! tensor expressions into groups that each compile to one kernel. Groups
//! start as single expressions and are merged greedily, best saving first,
//! in three passes:
//!
//! 1. vertical: a group with one of its direct consumers,
//! 2. horizontal: independent groups feeding a common consumer,
//! 3. final: any remaining pair.
//!
//! A merge is taken only if some scheduler accepts the merged sub-fusion,
//! the group DAG stays acyclic and the [`CostModel`] reports a saving.

mod cost;

pub use cost::{CostModel, KERNEL_LAUNCH_COST};

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;

use fuser_ir::{DataType, ExprId, Fusion, ScalarKind, TensorDomain, ValId, ValKind};
use itertools::Itertools;
use tracing::{debug, trace};

use crate::error::*;
use crate::heuristics::{ArgInfo, HeuristicParams, SchedulerRuntimeInfo, propose_heuristic};

/// Tensors crossing the boundary of a set of expressions, plus every scalar
/// input of the fusion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SegmentIo {
    pub inputs: Vec<ValId>,
    pub outputs: Vec<ValId>,
}

/// One kernel of a segmented fusion.
#[derive(Debug, Clone)]
pub struct SegmentedGroup {
    exprs: Vec<ExprId>,
    io: SegmentIo,
    heuristic: HeuristicParams,
}

impl SegmentedGroup {
    /// Tensor expressions of the group, producers first.
    pub fn exprs(&self) -> &[ExprId] {
        &self.exprs
    }

    pub fn inputs(&self) -> &[ValId] {
        &self.io.inputs
    }

    pub fn outputs(&self) -> &[ValId] {
        &self.io.outputs
    }

    pub fn heuristic(&self) -> &HeuristicParams {
        &self.heuristic
    }
}

/// A tensor materialized by group `from` and read by group `to`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SegmentedEdge {
    pub from: usize,
    pub to: usize,
    pub val: ValId,
}

/// A fusion split into groups listed in a valid execution order.
#[derive(Debug, Clone)]
pub struct SegmentedFusion {
    complete: Fusion,
    groups: Vec<SegmentedGroup>,
    edges: Vec<SegmentedEdge>,
}

impl SegmentedFusion {
    pub fn complete_fusion(&self) -> &Fusion {
        &self.complete
    }

    pub fn groups(&self) -> &[SegmentedGroup] {
        &self.groups
    }

    pub fn edges(&self) -> &[SegmentedEdge] {
        &self.edges
    }

    pub fn is_single(&self) -> bool {
        self.groups.len() == 1
    }

    /// Standalone fusion computing group `index`.
    ///
    /// Value handles are those of the complete fusion.
    pub fn make_fusion(&self, index: usize) -> Result<Fusion> {
        let group = &self.groups[index];
        extract_segment(&self.complete, &group.exprs, &group.io)
    }
}

impl fmt::Display for SegmentedFusion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, group) in self.groups.iter().enumerate() {
            writeln!(
                f,
                "g{i} {}: {{{}}} ({}) -> ({})",
                group.heuristic.heuristic(),
                group.exprs.iter().join(", "),
                group.io.inputs.iter().join(", "),
                group.io.outputs.iter().join(", "),
            )?;
        }
        for edge in &self.edges {
            writeln!(f, "g{} -> g{}: {}", edge.from, edge.to, edge.val)?;
        }
        Ok(())
    }
}

/// Partition `fusion` for the arguments described by `info`.
///
/// A fusion some scheduler accepts as a whole comes back as a single group.
pub fn segment(fusion: &Fusion, info: &SchedulerRuntimeInfo) -> Result<SegmentedFusion> {
    let mut segmenter = Segmenter::new(fusion, info)?;
    if let Ok(heuristic) = propose_heuristic(fusion, info) {
        let exprs = fusion.tensor_exprs();
        let io = segmenter.io(&exprs);
        segmenter.groups = vec![Some(WorkGroup { exprs, io, heuristic })];
        return Ok(segmenter.finish());
    }

    segmenter.seed()?;
    let seeded = segmenter.live().count();
    for kind in [MergeKind::Vertical, MergeKind::Horizontal, MergeKind::Final] {
        segmenter.merge_pass(kind);
    }
    let segmented = segmenter.finish();
    debug!(seeded, groups = segmented.groups.len(), edges = segmented.edges.len(), "segmented fusion");
    Ok(segmented)
}

/// Copy of `complete` computing only `exprs`, reading `io.inputs` and
/// writing `io.outputs`.
///
/// An intermediate input loses its reduction axes and rfactor domain: it is
/// a plain materialized tensor in the segment. Symbolic sizes naming a
/// tensor outside the segment are renamed to the intermediate input that
/// carries them.
pub(crate) fn extract_segment(complete: &Fusion, exprs: &[ExprId], io: &SegmentIo) -> Result<Fusion> {
    let mut segment = complete.clone();
    let keep: HashSet<ExprId> = exprs.iter().copied().collect();
    for e in complete.tensor_exprs() {
        if !keep.contains(&e) {
            segment.remove_expr(e);
        }
    }
    for &v in complete.inputs() {
        segment.remove_input(v);
    }
    for &v in complete.outputs() {
        segment.remove_output(v);
    }

    let mut renamed: HashMap<ValId, ValId> = HashMap::new();
    for &v in &io.inputs {
        if segment.is_tensor(v) && !complete.is_input(v) {
            let root = segment.non_reduction_root(v);
            let mut fresh = Vec::with_capacity(root.len());
            for (dim, id) in root.into_iter().enumerate() {
                let extent = segment.extent(id);
                if let ValKind::Scalar(ScalarKind::TensorSize { tensor, .. }) = *segment.val(extent).kind()
                    && !io.inputs.contains(&tensor)
                    && !renamed.contains_key(&extent)
                {
                    let size = segment.new_val(DataType::Int64, ValKind::Scalar(ScalarKind::TensorSize { tensor: v, dim }));
                    renamed.insert(extent, size);
                }
                fresh.push(segment.clone_iter_domain(id));
            }
            segment.tv_mut(v).set_domain(TensorDomain::contiguous(fresh));
        }
        segment.add_input(v)?;
    }
    for &v in &io.outputs {
        segment.add_output(v)?;
    }

    if !renamed.is_empty() {
        for tv in segment.all_tensors() {
            for id in segment.tv(tv).domain().root().to_vec() {
                if let Some(&size) = renamed.get(&segment.extent(id)) {
                    segment.id_mut(id).extent = size;
                }
            }
        }
    }
    Ok(segment)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MergeKind {
    Vertical,
    Horizontal,
    Final,
}

#[derive(Debug, Clone)]
struct WorkGroup {
    exprs: Vec<ExprId>,
    io: SegmentIo,
    heuristic: HeuristicParams,
}

struct Segmenter<'a> {
    fusion: &'a Fusion,
    info: &'a SchedulerRuntimeInfo,
    /// Topological index of every tensor expression.
    order: HashMap<ExprId, usize>,
    /// Concrete non-reduction extents of every tensor with known size.
    sizes: HashMap<ValId, Vec<usize>>,
    cost: CostModel,
    groups: Vec<Option<WorkGroup>>,
}

impl<'a> Segmenter<'a> {
    fn new(fusion: &'a Fusion, info: &'a SchedulerRuntimeInfo) -> Result<Self> {
        let order = fusion.tensor_exprs().into_iter().enumerate().map(|(i, e)| (e, i)).collect();
        let mut evaluator = info.evaluator(fusion)?;
        let mut sizes = HashMap::new();
        for tv in fusion.all_tensors() {
            if let Some(known) = info.sizes(tv) {
                sizes.insert(tv, known.to_vec());
                continue;
            }
            let extents: Option<Vec<usize>> = fusion
                .non_reduction_root(tv)
                .into_iter()
                .map(|id| evaluator.evaluate_int(fusion.extent(id)).and_then(|e| usize::try_from(e).ok()))
                .collect();
            if let Some(extents) = extents {
                sizes.insert(tv, extents);
            }
        }
        let cost = CostModel::new(fusion, &sizes);
        Ok(Self { fusion, info, order, sizes, cost, groups: Vec::new() })
    }

    fn live(&self) -> impl Iterator<Item = (usize, &WorkGroup)> {
        self.groups.iter().enumerate().filter_map(|(i, g)| g.as_ref().map(|g| (i, g)))
    }

    fn group(&self, index: usize) -> &WorkGroup {
        match &self.groups[index] {
            Some(group) => group,
            None => unreachable!("group {index} was merged away"),
        }
    }

    /// One group per tensor expression; each must be schedulable alone.
    fn seed(&mut self) -> Result<()> {
        for e in self.fusion.tensor_exprs() {
            let exprs = vec![e];
            let io = self.io(&exprs);
            let heuristic = self.propose(&exprs, &io)?;
            self.groups.push(Some(WorkGroup { exprs, io, heuristic }));
        }
        Ok(())
    }

    fn io(&self, exprs: &[ExprId]) -> SegmentIo {
        let fusion = self.fusion;
        let inside: HashSet<ExprId> = exprs.iter().copied().collect();
        let mut io = SegmentIo::default();
        for &e in exprs {
            let expr = fusion.expr(e);
            for &v in expr.inputs() {
                let internal = fusion.definition(v).is_some_and(|d| inside.contains(&d));
                if fusion.is_tensor(v) && !internal && !io.inputs.contains(&v) {
                    io.inputs.push(v);
                }
            }
            for &v in expr.outputs() {
                let escapes = fusion.is_output(v)
                    || fusion.uses(v).iter().any(|u| self.order.contains_key(u) && !inside.contains(u));
                if fusion.is_tensor(v) && escapes && !io.outputs.contains(&v) {
                    io.outputs.push(v);
                }
            }
        }
        io.inputs.extend(fusion.inputs().iter().copied().filter(|&v| !fusion.is_tensor(v)));
        io
    }

    fn args(&self, io: &SegmentIo) -> Result<Vec<ArgInfo>> {
        io.inputs
            .iter()
            .map(|&v| {
                if let Some(arg) = self.info.arg(v) {
                    return Ok(arg.clone());
                }
                match self.sizes.get(&v) {
                    Some(sizes) => Ok(ArgInfo::contiguous(self.fusion.dtype(v), sizes)),
                    None => NoSchedulerSnafu { reason: format!("size of {v} is not known from the inputs") }.fail(),
                }
            })
            .collect()
    }

    fn propose(&self, exprs: &[ExprId], io: &SegmentIo) -> Result<HeuristicParams> {
        let segment = extract_segment(self.fusion, exprs, io)?;
        let info = SchedulerRuntimeInfo::new(&segment, self.args(io)?)?;
        propose_heuristic(&segment, &info)
    }

    fn group_of(&self) -> HashMap<ExprId, usize> {
        self.live().flat_map(|(i, g)| g.exprs.iter().map(move |&e| (e, i))).collect()
    }

    fn consumers(&self, index: usize, group_of: &HashMap<ExprId, usize>) -> BTreeSet<usize> {
        let group = self.group(index);
        group
            .exprs
            .iter()
            .flat_map(|&e| self.fusion.expr(e).outputs().iter())
            .flat_map(|&v| self.fusion.uses(v).iter())
            .filter_map(|u| group_of.get(u).copied())
            .filter(|&g| g != index)
            .collect()
    }

    /// Whether a path between `a` and `b` passes through another group.
    fn creates_cycle(&self, a: usize, b: usize, group_of: &HashMap<ExprId, usize>) -> bool {
        for (from, to) in [(a, b), (b, a)] {
            let mut stack: Vec<usize> = self.consumers(from, group_of).into_iter().filter(|&g| g != to).collect();
            let mut seen = HashSet::new();
            while let Some(g) = stack.pop() {
                if g == to {
                    return true;
                }
                if seen.insert(g) {
                    stack.extend(self.consumers(g, group_of));
                }
            }
        }
        false
    }

    fn candidates(&self, kind: MergeKind, group_of: &HashMap<ExprId, usize>) -> Vec<(usize, usize)> {
        let live: Vec<usize> = self.live().map(|(i, _)| i).collect();
        let consumers: HashMap<usize, BTreeSet<usize>> =
            live.iter().map(|&g| (g, self.consumers(g, group_of))).collect();
        let mut pairs = Vec::new();
        for (&a, &b) in live.iter().tuple_combinations() {
            let connected = consumers[&a].contains(&b) || consumers[&b].contains(&a);
            let accept = match kind {
                MergeKind::Vertical => connected,
                MergeKind::Horizontal => !connected && !consumers[&a].is_disjoint(&consumers[&b]),
                MergeKind::Final => true,
            };
            if accept {
                pairs.push((a, b));
            }
        }
        pairs
    }

    fn merged_exprs(&self, a: usize, b: usize) -> Vec<ExprId> {
        let mut exprs: Vec<ExprId> = self.group(a).exprs.iter().chain(&self.group(b).exprs).copied().collect();
        exprs.sort_by_key(|e| self.order[e]);
        exprs
    }

    /// Merge the best legal pair of `kind` until none saves anything.
    fn merge_pass(&mut self, kind: MergeKind) {
        loop {
            let group_of = self.group_of();
            let mut scored = Vec::new();
            for (a, b) in self.candidates(kind, &group_of) {
                if self.creates_cycle(a, b, &group_of) {
                    continue;
                }
                let exprs = self.merged_exprs(a, b);
                let io = self.io(&exprs);
                let saving = self.cost.merge_saving(&self.group(a).io, &self.group(b).io, &io);
                if saving > 0 {
                    scored.push((saving, a, b, exprs, io));
                }
            }
            scored.sort_by(|x, y| y.0.cmp(&x.0).then((x.1, x.2).cmp(&(y.1, y.2))));

            let mut merged = false;
            for (saving, a, b, exprs, io) in scored {
                match self.propose(&exprs, &io) {
                    Ok(heuristic) => {
                        debug!(?kind, a, b, saving, heuristic = %heuristic.heuristic(), "merged segments");
                        self.groups[b] = None;
                        self.groups[a] = Some(WorkGroup { exprs, io, heuristic });
                        merged = true;
                        break;
                    }
                    Err(error) => trace!(?kind, a, b, %error, "rejected segment merge"),
                }
            }
            if !merged {
                break;
            }
        }
    }

    /// Order groups so producers run first; ties go to the group holding the
    /// earliest expression.
    fn finish(self) -> SegmentedFusion {
        let group_of = self.group_of();
        let mut pending: Vec<usize> = self.live().map(|(i, _)| i).collect();
        let producers: HashMap<usize, BTreeSet<usize>> = pending
            .iter()
            .map(|&g| {
                let producers = self
                    .group(g)
                    .io
                    .inputs
                    .iter()
                    .filter_map(|&v| self.fusion.definition(v))
                    .filter_map(|d| group_of.get(&d).copied())
                    .filter(|&p| p != g)
                    .collect();
                (g, producers)
            })
            .collect();

        let mut sorted: Vec<usize> = Vec::with_capacity(pending.len());
        while !pending.is_empty() {
            let ready = pending
                .iter()
                .copied()
                .filter(|g| producers[g].iter().all(|p| sorted.contains(p)))
                .min_by_key(|&g| self.order[&self.group(g).exprs[0]]);
            let Some(next) = ready else { unreachable!("merges keep the group graph acyclic") };
            pending.retain(|&g| g != next);
            sorted.push(next);
        }

        let position: HashMap<usize, usize> = sorted.iter().enumerate().map(|(new, &old)| (old, new)).collect();
        let mut edges = Vec::new();
        for (to, &g) in sorted.iter().enumerate() {
            for &val in &self.group(g).io.inputs {
                let Some(def) = self.fusion.definition(val) else { continue };
                if let Some(from) = group_of.get(&def).map(|p| position[p])
                    && from != to
                {
                    edges.push(SegmentedEdge { from, to, val });
                }
            }
        }
        let groups = sorted
            .iter()
            .map(|&g| {
                let group = self.group(g).clone();
                SegmentedGroup { exprs: group.exprs, io: group.io, heuristic: group.heuristic }
            })
            .collect();
        SegmentedFusion { complete: self.fusion.clone(), groups, edges }
    }
}

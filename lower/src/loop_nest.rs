//! Ordering expressions into a loop-nest tree.
//!
//! An expression runs inside one loop per leaf of its output, identified by
//! loop group. Expressions are clustered level by level on those groups:
//! every expression whose key extends past the current level joins the
//! cluster of its group there, the rest sit at this level. Clusters and
//! loose expressions are then ordered topologically, ties going to the one
//! that appears first in program order, and each cluster is ordered the
//! same way one level deeper.

use std::collections::{BTreeSet, HashMap};

use fuser_ir::{ExprId, Fusion, IterDomainId};
use itertools::Itertools;

use crate::compute_at_map::ComputeAtMap;
use crate::error::*;
use crate::utils::{expr_output, tensor_inputs};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopNode {
    Expr(ExprId),
    Loop { class: IterDomainId, children: Vec<LoopNode> },
}

impl LoopNode {
    /// Expressions of this subtree in order.
    pub fn exprs(&self) -> Vec<ExprId> {
        match self {
            LoopNode::Expr(e) => vec![*e],
            LoopNode::Loop { children, .. } => children.iter().flat_map(LoopNode::exprs).collect(),
        }
    }
}

enum Unit {
    Expr(ExprId),
    Cluster(IterDomainId, Vec<ExprId>),
}

pub fn build_loop_tree(fusion: &Fusion, ca_map: &ComputeAtMap, exprs: &[ExprId]) -> Result<Vec<LoopNode>> {
    let keys: HashMap<ExprId, Vec<IterDomainId>> = exprs
        .iter()
        .map(|&e| {
            let key = expr_output(fusion, fusion.expr(e).outputs())
                .map(|tv| fusion.tv(tv).domain().leaf().iter().map(|&id| ca_map.class(id)).collect())
                .unwrap_or_default();
            (e, key)
        })
        .collect();
    cluster(fusion, &keys, 0, exprs)
}

fn cluster(fusion: &Fusion, keys: &HashMap<ExprId, Vec<IterDomainId>>, level: usize, exprs: &[ExprId]) -> Result<Vec<LoopNode>> {
    let mut units: Vec<Unit> = Vec::new();
    let mut cluster_of: HashMap<IterDomainId, usize> = HashMap::new();
    let mut unit_of: HashMap<ExprId, usize> = HashMap::new();
    for &e in exprs {
        let key = &keys[&e];
        let unit = if key.len() <= level {
            units.push(Unit::Expr(e));
            units.len() - 1
        } else {
            let class = key[level];
            match cluster_of.get(&class) {
                Some(&u) => {
                    if let Unit::Cluster(_, members) = &mut units[u] {
                        members.push(e);
                    }
                    u
                }
                None => {
                    units.push(Unit::Cluster(class, vec![e]));
                    cluster_of.insert(class, units.len() - 1);
                    units.len() - 1
                }
            }
        };
        unit_of.insert(e, unit);
    }

    let mut successors: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); units.len()];
    let mut indegree = vec![0usize; units.len()];
    for &e in exprs {
        let to = unit_of[&e];
        for input in tensor_inputs(fusion, fusion.expr(e).inputs()) {
            let Some(from) = fusion.definition(input).and_then(|d| unit_of.get(&d)).copied() else { continue };
            if from != to && successors[from].insert(to) {
                indegree[to] += 1;
            }
        }
    }

    let mut ready: BTreeSet<usize> = (0..units.len()).filter(|&u| indegree[u] == 0).collect();
    let mut order = Vec::with_capacity(units.len());
    while let Some(u) = ready.pop_first() {
        order.push(u);
        for &next in &successors[u] {
            indegree[next] -= 1;
            if indegree[next] == 0 {
                ready.insert(next);
            }
        }
    }
    if order.len() < units.len() {
        let tensors = exprs
            .iter()
            .filter(|e| indegree[unit_of[e]] > 0)
            .filter_map(|&e| expr_output(fusion, fusion.expr(e).outputs()))
            .join(", ");
        return LoopNestCycleSnafu { tensors }.fail();
    }

    let mut slots: Vec<Option<Unit>> = units.into_iter().map(Some).collect();
    let mut nodes = Vec::with_capacity(order.len());
    for u in order {
        match slots[u].take() {
            Some(Unit::Expr(e)) => nodes.push(LoopNode::Expr(e)),
            Some(Unit::Cluster(class, members)) => {
                let children = cluster(fusion, keys, level + 1, &members)?;
                nodes.push(LoopNode::Loop { class, children });
            }
            None => {}
        }
    }
    Ok(nodes)
}

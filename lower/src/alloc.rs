//! Storage decisions: register promotion and shared-memory layout.

use std::collections::{HashMap, HashSet};

use fuser_ir::{Fusion, MemoryType, ValId};
use tracing::debug;

use crate::compute_at_map::ComputeAtMap;
use crate::index::{Indexer, memory_of};
use crate::kir::{Op, Scalar, SharedBuffer, Stmt};

/// Registers need a size known at compile time; a register intermediate
/// whose allocation depends on runtime extents moves to global memory.
pub fn promote_dynamic_locals(fusion: &mut Fusion, ca_map: &ComputeAtMap) {
    let promoted: Vec<ValId> = {
        let indexer = Indexer::new(fusion, ca_map);
        fusion
            .all_tensors()
            .into_iter()
            .filter(|&tv| !fusion.is_input(tv) && !fusion.is_output(tv))
            .filter(|&tv| fusion.tv(tv).memory_type() == MemoryType::Local)
            .filter(|&tv| indexer.allocation_size(tv).as_int().is_none())
            .collect()
    };
    for tv in promoted {
        debug!(%tv, "register buffer has a dynamic size, promoting to global memory");
        fusion.tv_mut(tv).set_memory_type(MemoryType::Global);
    }
}

/// Liveness interval of every tensor touched in `stmts`, in op order.
///
/// A tensor touched inside a loop is live for the whole loop, since a later
/// iteration may touch it again.
fn liveness(stmts: &[Stmt], pos: &mut usize, live: &mut HashMap<ValId, (usize, usize)>) {
    fn touch(live: &mut HashMap<ValId, (usize, usize)>, tv: ValId, start: usize, end: usize) {
        let entry = live.entry(tv).or_insert((start, end));
        entry.0 = entry.0.min(start);
        entry.1 = entry.1.max(end);
    }
    for stmt in stmts {
        match stmt {
            Stmt::Op(op) => {
                for t in op.inputs().into_iter().chain(op.outputs()) {
                    touch(live, t.tv, *pos, *pos);
                }
                *pos += 1;
            }
            Stmt::For(l) => {
                let start = *pos;
                let mut inner = HashMap::new();
                liveness(&l.body, pos, &mut inner);
                let end = pos.saturating_sub(1).max(start);
                for tv in inner.into_keys() {
                    touch(live, tv, start, end);
                }
            }
            Stmt::If(i) => {
                liveness(&i.then_body, pos, live);
                liveness(&i.else_body, pos, live);
            }
            Stmt::Allocate(_) | Stmt::Sync { .. } => {}
        }
    }
}

fn align16(bytes: Scalar) -> Scalar {
    bytes.ceil_div(Scalar::Int(16)).mul(Scalar::Int(16))
}

/// Whether a buffer of `size` provably fits in one of `capacity`.
fn fits(size: &Scalar, capacity: &Scalar) -> bool {
    match (size.as_int(), capacity.as_int()) {
        (Some(s), Some(c)) => s <= c,
        _ => size == capacity,
    }
}

/// Lay out shared buffers in dynamic shared memory.
///
/// A buffer whose lifetime starts after another one of the same type ends
/// reuses its storage when it fits. Operands of broadcasts keep their own
/// storage. Returns the buffers and the total bytes they take.
pub fn plan_shared_memory(fusion: &Fusion, body: &mut [Stmt]) -> (Vec<SharedBuffer>, Scalar) {
    let mut live = HashMap::new();
    liveness(body, &mut 0, &mut live);

    let mut pinned: HashSet<ValId> = HashSet::new();
    for op in Stmt::ops(body) {
        if let Op::Broadcast { out, input, .. } = op {
            pinned.insert(out.tv);
            if let Some(t) = input.as_tensor() {
                pinned.insert(t.tv);
            }
        }
    }

    struct Physical {
        tv: ValId,
        size: Scalar,
        end: usize,
        offset: Scalar,
    }
    let mut physical: Vec<Physical> = Vec::new();
    let mut buffers: Vec<SharedBuffer> = Vec::new();
    let mut total = Scalar::ZERO;

    let mut shared: Vec<(ValId, Scalar)> = body
        .iter()
        .filter_map(|s| match s {
            Stmt::Allocate(a) if a.memory == MemoryType::Shared => Some((a.tv, a.size.clone())),
            _ => None,
        })
        .collect();
    shared.sort_by_key(|(tv, _)| live.get(tv).map_or((usize::MAX, tv.index()), |&(start, _)| (start, tv.index())));

    for (tv, size) in shared {
        let dtype = fusion.dtype(tv);
        let (start, end) = live.get(&tv).copied().unwrap_or((usize::MAX, usize::MAX));
        let reuse = if pinned.contains(&tv) {
            None
        } else {
            physical
                .iter_mut()
                .find(|p| !pinned.contains(&p.tv) && fusion.dtype(p.tv) == dtype && p.end < start && fits(&size, &p.size))
        };
        match reuse {
            Some(p) => {
                debug!(%tv, host = %p.tv, "aliasing shared buffer");
                p.end = p.end.max(end);
                buffers.push(SharedBuffer { tv, dtype, size, offset: p.offset.clone(), alias: Some(p.tv) });
            }
            None => {
                let offset = align16(total.clone());
                total = offset.clone().add(size.clone().mul(Scalar::Int(dtype.bytes() as i64)));
                physical.push(Physical { tv, size: size.clone(), end, offset: offset.clone() });
                buffers.push(SharedBuffer { tv, dtype, size, offset, alias: None });
            }
        }
    }

    let aliases: HashMap<ValId, ValId> = buffers.iter().filter_map(|b| b.alias.map(|a| (b.tv, a))).collect();
    for stmt in body.iter_mut() {
        if let Stmt::Allocate(a) = stmt
            && let Some(&host) = aliases.get(&a.tv)
        {
            a.alias = Some(host);
        }
    }
    (buffers, align16(total))
}

/// Every shared tensor mapped to the buffer that holds it.
pub fn shared_storage(fusion: &Fusion, buffers: &[SharedBuffer]) -> HashMap<ValId, ValId> {
    buffers
        .iter()
        .filter(|b| memory_of(fusion, b.tv) == MemoryType::Shared)
        .map(|b| (b.tv, b.alias.unwrap_or(b.tv)))
        .collect()
}

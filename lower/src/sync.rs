//! Block barriers around shared memory.
//!
//! A read of a shared buffer written since the last barrier needs a barrier
//! before it (read after write), and so does a write of a buffer read since
//! the last barrier (write after read). Conditionals are treated as a unit
//! so no barrier lands under divergent control flow. At the end of a loop
//! body, a barrier is appended when the next iteration's first accesses
//! would conflict with this iteration's last ones. Block collectives
//! synchronize internally and count as barriers.

use std::collections::{BTreeSet, HashMap};

use fuser_ir::ValId;
use tracing::trace;

use crate::kir::{Op, Scalar, Stmt};

#[derive(Debug, Clone, Default)]
struct SyncState {
    /// Written since the last barrier.
    dirty: BTreeSet<ValId>,
    /// Read since the last barrier.
    read: BTreeSet<ValId>,
    /// Accesses before the first barrier of this scope.
    first_reads: BTreeSet<ValId>,
    first_writes: BTreeSet<ValId>,
    synced: bool,
}

impl SyncState {
    fn barrier(&mut self) {
        self.dirty.clear();
        self.read.clear();
        self.synced = true;
    }

    fn access(&mut self, reads: &BTreeSet<ValId>, writes: &BTreeSet<ValId>) {
        if !self.synced {
            self.first_reads.extend(reads.iter().copied());
            self.first_writes.extend(writes.iter().copied());
        }
        self.read.extend(reads.iter().copied());
        self.dirty.extend(writes.iter().copied());
    }
}

struct SyncPass<'a> {
    storage: &'a HashMap<ValId, ValId>,
}

impl SyncPass<'_> {
    fn op_access(&self, op: &Op) -> (BTreeSet<ValId>, BTreeSet<ValId>) {
        let reads = op.inputs().into_iter().filter_map(|t| self.storage.get(&t.tv).copied()).collect();
        let writes = op.outputs().into_iter().filter_map(|t| self.storage.get(&t.tv).copied()).collect();
        (reads, writes)
    }

    fn stmts_access(&self, stmts: &[Stmt]) -> (BTreeSet<ValId>, BTreeSet<ValId>) {
        let (mut reads, mut writes) = (BTreeSet::new(), BTreeSet::new());
        for op in Stmt::ops(stmts) {
            let (r, w) = self.op_access(op);
            reads.extend(r);
            writes.extend(w);
        }
        (reads, writes)
    }

    /// `Some(war)` when the accesses conflict with unsynchronized ones.
    fn needs_barrier(state: &SyncState, reads: &BTreeSet<ValId>, writes: &BTreeSet<ValId>) -> Option<bool> {
        if !state.dirty.is_disjoint(reads) {
            return Some(false);
        }
        if !state.read.is_disjoint(writes) {
            return Some(true);
        }
        None
    }

    fn process(&self, stmts: &mut Vec<Stmt>, state: &mut SyncState) {
        let mut result = Vec::with_capacity(stmts.len());
        for mut stmt in stmts.drain(..) {
            match &mut stmt {
                Stmt::Sync { .. } => state.barrier(),
                Stmt::Allocate(_) => {}
                Stmt::Op(op) => {
                    let (reads, writes) = self.op_access(op);
                    if let Some(war) = Self::needs_barrier(state, &reads, &writes) {
                        trace!(war, "inserting block sync before op");
                        result.push(Stmt::Sync { war });
                        state.barrier();
                    }
                    state.access(&reads, &writes);
                    if op.synchronizes() {
                        state.barrier();
                    }
                }
                Stmt::If(branch) => {
                    let (reads, writes) = self.stmts_access(&branch.then_body);
                    let (else_reads, else_writes) = self.stmts_access(&branch.else_body);
                    let reads: BTreeSet<ValId> = reads.union(&else_reads).copied().collect();
                    let writes: BTreeSet<ValId> = writes.union(&else_writes).copied().collect();
                    if let Some(war) = Self::needs_barrier(state, &reads, &writes) {
                        result.push(Stmt::Sync { war });
                        state.barrier();
                    }
                    for body in [&mut branch.then_body, &mut branch.else_body] {
                        let mut inner = SyncState::default();
                        self.process(body, &mut inner);
                    }
                    state.access(&reads, &writes);
                }
                Stmt::For(l) => {
                    let mut inner = SyncState { dirty: state.dirty.clone(), read: state.read.clone(), ..Default::default() };
                    self.process(&mut l.body, &mut inner);
                    let repeats = !l.parallel.is_launch_dim() && l.extent != Scalar::ONE;
                    let carried =
                        !inner.dirty.is_disjoint(&inner.first_reads) || !inner.read.is_disjoint(&inner.first_writes);
                    if repeats && carried {
                        trace!(index = %l.index, "inserting block sync at end of loop");
                        l.body.push(Stmt::Sync { war: true });
                        inner.barrier();
                    }
                    if inner.synced {
                        if !state.synced {
                            state.first_reads.extend(inner.first_reads.iter().copied());
                            state.first_writes.extend(inner.first_writes.iter().copied());
                        }
                        state.synced = true;
                        state.dirty = inner.dirty;
                        state.read = inner.read;
                    } else {
                        state.access(&inner.read, &inner.dirty);
                    }
                }
            }
            result.push(stmt);
        }
        *stmts = result;
    }
}

/// Insert block barriers into `body`; `storage` maps every shared tensor to
/// the buffer holding it.
pub fn insert_syncs(body: &mut Vec<Stmt>, storage: &HashMap<ValId, ValId>) {
    if storage.is_empty() {
        return;
    }
    SyncPass { storage }.process(body, &mut SyncState::default());
}

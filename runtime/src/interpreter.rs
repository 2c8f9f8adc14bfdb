//! Host execution of kernel IR.
//!
//! The interpreter runs every thread of the grid in lockstep: each statement
//! executes for all active threads before the next one starts. Launch-bound
//! loops are implied by the thread coordinates, serial loops iterate with a
//! shared index, and conditionals split the active set. Registers are private
//! per simulated thread and shared memory is private per block.
//!
//! Lockstep execution satisfies every barrier by construction, so `Sync`
//! statements do nothing. Block and grid collectives fold the contributions
//! of each segment in thread order and hand the result to the first thread
//! of the segment, as the device prelude does.

use std::collections::HashMap;

use fuser_codegen::RenderedKernel;
use fuser_ir::{BinaryOpType, ConstValue, MemoryType, ParallelType, ParallelTypeSet, ValId};
use fuser_lower::{
    Allocate, Collective, Kernel, LoopId, Op, Operand, Scalar, ScalarEnv, Stmt, TensorIndex, WelfordInput,
    WelfordTriple,
};
use itertools::Itertools;
use snafu::{OptionExt, ensure};
use tracing::trace;

use crate::error::*;
use crate::kernel::{ArgValue, CompiledKernel, KernelBackend, LaunchDims, TensorArg};

/// Largest grid the interpreter simulates.
pub const MAX_HOST_THREADS: u64 = 1 << 22;

/// Backend running kernels on the host.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostBackend;

impl KernelBackend for HostBackend {
    fn name(&self) -> &str {
        "host"
    }

    fn compile(&self, kernel: &Kernel, rendered: &RenderedKernel) -> Result<Box<dyn CompiledKernel>> {
        Ok(Box::new(HostKernel { kernel: kernel.clone(), name: rendered.entry_point.clone() }))
    }
}

pub struct HostKernel {
    kernel: Kernel,
    name: String,
}

impl HostKernel {
    pub fn new(kernel: Kernel) -> Self {
        let name = kernel.name.clone();
        Self { kernel, name }
    }
}

impl CompiledKernel for HostKernel {
    fn launch(&self, dims: &LaunchDims, args: &[ArgValue], buffers: &mut [Vec<f64>]) -> Result<()> {
        let threads = dims.threads();
        ensure!(threads <= MAX_HOST_THREADS, LaunchTooLargeSnafu { threads, limit: MAX_HOST_THREADS });
        let mut machine = Machine::new(&self.kernel, dims, args, buffers);
        let all: Vec<usize> = (0..machine.coords.len()).collect();
        machine.exec(&self.kernel.body, &all)?;
        trace!(kernel = %self.name, threads, "host kernel finished");
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Values visible to scalar arithmetic, shared by all threads.
struct Context<'a> {
    /// Extents in launch-slot order.
    launch: [i64; 6],
    tensors: HashMap<ValId, &'a TensorArg>,
    scalars: HashMap<ValId, ConstValue>,
    loops: HashMap<LoopId, i64>,
}

struct ThreadEnv<'c, 'a> {
    ctx: &'c Context<'a>,
    coords: &'c [i64; 6],
}

impl ScalarEnv for ThreadEnv<'_, '_> {
    fn input(&self, val: ValId) -> Option<ConstValue> {
        self.ctx.scalars.get(&val).copied()
    }

    fn tensor_size(&self, tensor: ValId, dim: usize) -> Option<i64> {
        self.ctx.tensors.get(&tensor)?.sizes.get(dim).map(|&s| s as i64)
    }

    fn tensor_stride(&self, tensor: ValId, dim: usize) -> Option<i64> {
        self.ctx.tensors.get(&tensor)?.strides.get(dim).copied()
    }

    fn parallel_index(&self, parallel: ParallelType) -> Option<i64> {
        parallel.launch_slot().map(|slot| self.coords[slot])
    }

    fn parallel_dim(&self, parallel: ParallelType) -> Option<i64> {
        parallel.launch_slot().map(|slot| self.ctx.launch[slot])
    }

    fn loop_index(&self, id: LoopId) -> Option<i64> {
        self.ctx.loops.get(&id).copied()
    }
}

/// Storage of every tensor the kernel touches.
struct Memory<'a> {
    buffers: &'a mut [Vec<f64>],
    globals: HashMap<ValId, usize>,
    placement: HashMap<ValId, MemoryType>,
    /// Shared buffers reusing another buffer's storage.
    shared_root: HashMap<ValId, ValId>,
    locals: Vec<HashMap<ValId, Vec<f64>>>,
    shared: Vec<HashMap<ValId, Vec<f64>>>,
    threads_per_block: usize,
}

impl Memory<'_> {
    fn root(&self, tv: ValId) -> ValId {
        let mut tv = tv;
        while let Some(&next) = self.shared_root.get(&tv) {
            tv = next;
        }
        tv
    }

    fn storage(&self, thread: usize, tv: ValId) -> Result<&[f64]> {
        let storage = match self.placement.get(&tv) {
            Some(MemoryType::Global) => self.globals.get(&tv).map(|&b| self.buffers[b].as_slice()),
            Some(MemoryType::Local) => self.locals[thread].get(&tv).map(Vec::as_slice),
            Some(MemoryType::Shared) => {
                self.shared[thread / self.threads_per_block].get(&self.root(tv)).map(Vec::as_slice)
            }
            None => None,
        };
        storage.with_context(|| ExecutionSnafu { reason: format!("{tv} is accessed before it is allocated") })
    }

    fn storage_mut(&mut self, thread: usize, tv: ValId) -> Result<&mut Vec<f64>> {
        let root = self.root(tv);
        let storage = match self.placement.get(&tv) {
            Some(MemoryType::Global) => self.globals.get(&tv).map(|&b| &mut self.buffers[b]),
            Some(MemoryType::Local) => self.locals[thread].get_mut(&tv),
            Some(MemoryType::Shared) => self.shared[thread / self.threads_per_block].get_mut(&root),
            None => None,
        };
        storage.with_context(|| ExecutionSnafu { reason: format!("{tv} is accessed before it is allocated") })
    }

    fn read(&self, thread: usize, tv: ValId, index: i64) -> Result<f64> {
        let storage = self.storage(thread, tv)?;
        let len = storage.len();
        usize::try_from(index).ok().and_then(|i| storage.get(i).copied()).context(OutOfBoundsSnafu { tensor: tv, index, len })
    }

    fn write(&mut self, thread: usize, tv: ValId, index: i64, value: f64) -> Result<()> {
        let storage = self.storage_mut(thread, tv)?;
        let len = storage.len();
        let slot = usize::try_from(index).ok().and_then(|i| storage.get_mut(i)).context(OutOfBoundsSnafu {
            tensor: tv,
            index,
            len,
        })?;
        *slot = value;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Stats {
    avg: f64,
    var_sum: f64,
    n: f64,
}

impl Stats {
    fn combine(&mut self, other: Stats) {
        if other.n == 0.0 {
            return;
        }
        let n = self.n + other.n;
        let weight = other.n / n;
        let delta = other.avg - self.avg;
        self.avg += delta * weight;
        self.var_sum += other.var_sum + delta * delta * self.n * weight;
        self.n = n;
    }
}

struct Machine<'a> {
    ctx: Context<'a>,
    mem: Memory<'a>,
    /// `[BIDx, BIDy, BIDz, TIDx, TIDy, TIDz]` of every thread.
    coords: Vec<[i64; 6]>,
}

impl<'a> Machine<'a> {
    fn new(kernel: &Kernel, dims: &LaunchDims, args: &'a [ArgValue], buffers: &'a mut [Vec<f64>]) -> Self {
        let launch = [
            dims.grid[0] as i64,
            dims.grid[1] as i64,
            dims.grid[2] as i64,
            dims.block[0] as i64,
            dims.block[1] as i64,
            dims.block[2] as i64,
        ];
        let threads_per_block = dims.threads_per_block() as usize;
        let blocks = dims.blocks() as usize;

        let mut coords = Vec::with_capacity(blocks * threads_per_block);
        for block in 0..blocks as i64 {
            let (bx, by, bz) = (block % launch[0], block / launch[0] % launch[1], block / (launch[0] * launch[1]));
            for thread in 0..threads_per_block as i64 {
                let (tx, ty, tz) =
                    (thread % launch[3], thread / launch[3] % launch[4], thread / (launch[3] * launch[4]));
                coords.push([bx, by, bz, tx, ty, tz]);
            }
        }

        let mut tensors = HashMap::new();
        let mut scalars = HashMap::new();
        let mut globals = HashMap::new();
        let mut placement = HashMap::new();
        for arg in args {
            match arg {
                ArgValue::Tensor(t) => {
                    tensors.insert(t.tv, t);
                    globals.insert(t.tv, t.buffer);
                    placement.insert(t.tv, MemoryType::Global);
                }
                ArgValue::Scalar { val, value, .. } => {
                    scalars.insert(*val, *value);
                }
                ArgValue::WorkBuffer { .. } | ArgValue::SyncFlags { .. } => {}
            }
        }
        let mut shared_root = HashMap::new();
        for alloc in kernel.allocations() {
            placement.insert(alloc.tv, alloc.memory);
            if let Some(alias) = alloc.alias {
                shared_root.insert(alloc.tv, alias);
            }
        }

        let threads = coords.len();
        Self {
            ctx: Context { launch, tensors, scalars, loops: HashMap::new() },
            mem: Memory {
                buffers,
                globals,
                placement,
                shared_root,
                locals: vec![HashMap::new(); threads],
                shared: vec![HashMap::new(); blocks],
                threads_per_block,
            },
            coords,
        }
    }

    fn eval(&self, scalar: &Scalar, thread: usize) -> Result<ConstValue> {
        let env = ThreadEnv { ctx: &self.ctx, coords: &self.coords[thread] };
        scalar.evaluate(&env).with_context(|| UnevaluableSnafu { what: format!("`{scalar}`") })
    }

    fn eval_bool(&self, scalar: &Scalar, thread: usize) -> Result<bool> {
        match scalar {
            Scalar::Bool(v) => Ok(*v),
            scalar => Ok(self.eval(scalar, thread)?.as_bool()),
        }
    }

    fn load(&self, ti: &TensorIndex, thread: usize) -> Result<f64> {
        let index = self.eval(&ti.index, thread)?.as_i64();
        self.mem.read(thread, ti.tv, index)
    }

    fn store(&mut self, ti: &TensorIndex, thread: usize, value: f64) -> Result<()> {
        let index = self.eval(&ti.index, thread)?.as_i64();
        self.mem.write(thread, ti.tv, index, ti.dtype.round(value))
    }

    fn operand(&self, operand: &Operand, thread: usize) -> Result<f64> {
        match operand {
            Operand::Tensor(ti) => self.load(ti, thread),
            Operand::Scalar { value, dtype } => Ok(dtype.round(self.eval(value, thread)?.as_f64())),
        }
    }

    fn exec(&mut self, stmts: &[Stmt], active: &[usize]) -> Result<()> {
        let Some(&first) = active.first() else { return Ok(()) };
        for stmt in stmts {
            match stmt {
                Stmt::For(l) if l.is_trivial() => self.exec(&l.body, active)?,
                Stmt::For(l) => {
                    let extent = self.eval(&l.extent, first)?.as_i64();
                    for i in 0..extent {
                        self.ctx.loops.insert(l.index, i);
                        self.exec(&l.body, active)?;
                    }
                    self.ctx.loops.remove(&l.index);
                }
                Stmt::If(branch) => {
                    let mut taken = Vec::new();
                    let mut skipped = Vec::new();
                    for &t in active {
                        if self.eval_bool(&branch.cond, t)? {
                            taken.push(t);
                        } else {
                            skipped.push(t);
                        }
                    }
                    self.exec(&branch.then_body, &taken)?;
                    self.exec(&branch.else_body, &skipped)?;
                }
                Stmt::Allocate(alloc) => self.allocate(alloc, active)?,
                Stmt::Sync { .. } => {}
                Stmt::Op(op) => self.exec_op(op, active)?,
            }
        }
        Ok(())
    }

    fn allocate(&mut self, alloc: &Allocate, active: &[usize]) -> Result<()> {
        let size = self.eval(&alloc.size, active[0])?.as_i64().max(0) as usize;
        match alloc.memory {
            MemoryType::Local => {
                for &t in active {
                    self.mem.locals[t].insert(alloc.tv, vec![0.0; size]);
                }
            }
            MemoryType::Shared => {
                let root = self.mem.root(alloc.tv);
                let tpb = self.mem.threads_per_block;
                for block in active.iter().map(|&t| t / tpb).dedup() {
                    let storage = self.mem.shared[block].entry(root).or_default();
                    if storage.len() < size {
                        storage.resize(size, 0.0);
                    }
                }
            }
            MemoryType::Global => {
                return ExecutionSnafu { reason: format!("{} is a global buffer allocated in the kernel", alloc.tv) }
                    .fail();
            }
        }
        Ok(())
    }

    fn exec_op(&mut self, op: &Op, active: &[usize]) -> Result<()> {
        match op {
            Op::Unary { op, out, input } => {
                for &t in active {
                    let x = self.operand(input, t)?;
                    self.store(out, t, op.eval(x))?;
                }
            }
            Op::Binary { op, out, lhs, rhs } => {
                let integral = !lhs.dtype().is_float() && !rhs.dtype().is_float();
                for &t in active {
                    let (a, b) = (self.operand(lhs, t)?, self.operand(rhs, t)?);
                    self.store(out, t, op.eval(a, b, integral))?;
                }
            }
            Op::Where { out, cond, a, b } => {
                for &t in active {
                    let pick = if self.operand(cond, t)? != 0.0 { a } else { b };
                    let value = self.operand(pick, t)?;
                    self.store(out, t, value)?;
                }
            }
            Op::Init { out, value } => {
                for &t in active {
                    self.store(out, t, value.as_f64())?;
                }
            }
            Op::Reduction { op, out, input, init, collective } => match collective {
                Collective::Serial => {
                    let integral = !out.dtype.is_float();
                    for &t in active {
                        let (acc, x) = (self.load(out, t)?, self.operand(input, t)?);
                        self.store(out, t, op.eval(acc, x, integral))?;
                    }
                }
                Collective::Block { types, read_pred, write_pred }
                | Collective::Grid { types, read_pred, write_pred } => {
                    self.reduce(*op, out, input, *init, *types, read_pred, write_pred, active)?;
                }
            },
            Op::Welford { out, input, collective } => match collective {
                Collective::Serial => {
                    for &t in active {
                        let mut stats = self.load_stats(out, t)?;
                        stats.combine(self.input_stats(input, t)?);
                        self.store_stats(out, t, stats)?;
                    }
                }
                Collective::Block { types, read_pred, write_pred }
                | Collective::Grid { types, read_pred, write_pred } => {
                    self.welford(out, input, *types, read_pred, write_pred, active)?;
                }
            },
            Op::Broadcast { out, input, collective } => match collective {
                Collective::Serial => {
                    for &t in active {
                        let value = self.operand(input, t)?;
                        self.store(out, t, value)?;
                    }
                }
                Collective::Block { types, read_pred, write_pred }
                | Collective::Grid { types, read_pred, write_pred } => {
                    self.broadcast(out, input, *types, read_pred, write_pred, active)?;
                }
            },
        }
        Ok(())
    }

    /// Threads of `active` grouped by their coordinates outside `types`.
    fn segments(&self, active: &[usize], types: ParallelTypeSet) -> Vec<Vec<usize>> {
        let slots: Vec<usize> = types.iter().filter_map(ParallelType::launch_slot).collect();
        active
            .iter()
            .copied()
            .into_group_map_by(|&t| {
                let mut key = self.coords[t];
                for &slot in &slots {
                    key[slot] = 0;
                }
                key
            })
            .into_values()
            .collect()
    }

    /// Whether `thread` has index zero along every type in `types`.
    fn is_first(&self, thread: usize, types: ParallelTypeSet) -> bool {
        types.iter().filter_map(ParallelType::launch_slot).all(|slot| self.coords[thread][slot] == 0)
    }

    #[allow(clippy::too_many_arguments)]
    fn reduce(
        &mut self,
        op: BinaryOpType,
        out: &TensorIndex,
        input: &Operand,
        init: ConstValue,
        types: ParallelTypeSet,
        read_pred: &Scalar,
        write_pred: &Scalar,
        active: &[usize],
    ) -> Result<()> {
        let integral = !out.dtype.is_float();
        for segment in self.segments(active, types) {
            let mut acc = init.as_f64();
            for &t in &segment {
                if self.eval_bool(read_pred, t)? {
                    acc = out.dtype.round(op.eval(acc, self.operand(input, t)?, integral));
                }
            }
            for &t in &segment {
                if self.is_first(t, types) && self.eval_bool(write_pred, t)? {
                    let current = self.load(out, t)?;
                    self.store(out, t, op.eval(current, acc, integral))?;
                }
            }
        }
        Ok(())
    }

    fn welford(
        &mut self,
        out: &WelfordTriple,
        input: &WelfordInput,
        types: ParallelTypeSet,
        read_pred: &Scalar,
        write_pred: &Scalar,
        active: &[usize],
    ) -> Result<()> {
        for segment in self.segments(active, types) {
            let mut acc = Stats::default();
            for &t in &segment {
                if self.eval_bool(read_pred, t)? {
                    acc.combine(self.input_stats(input, t)?);
                }
            }
            for &t in &segment {
                if self.is_first(t, types) && self.eval_bool(write_pred, t)? {
                    let mut stats = self.load_stats(out, t)?;
                    stats.combine(acc);
                    self.store_stats(out, t, stats)?;
                }
            }
        }
        Ok(())
    }

    fn broadcast(
        &mut self,
        out: &TensorIndex,
        input: &Operand,
        types: ParallelTypeSet,
        read_pred: &Scalar,
        write_pred: &Scalar,
        active: &[usize],
    ) -> Result<()> {
        for segment in self.segments(active, types) {
            let mut value = 0.0;
            for &t in &segment {
                if self.is_first(t, types) && self.eval_bool(read_pred, t)? {
                    value = self.operand(input, t)?;
                    break;
                }
            }
            for &t in &segment {
                if self.eval_bool(write_pred, t)? {
                    self.store(out, t, value)?;
                }
            }
        }
        Ok(())
    }

    fn input_stats(&self, input: &WelfordInput, thread: usize) -> Result<Stats> {
        Ok(match input {
            WelfordInput::Sample(x) => Stats { avg: self.operand(x, thread)?, var_sum: 0.0, n: 1.0 },
            WelfordInput::Partial { avg, var_sum, n } => Stats {
                avg: self.operand(avg, thread)?,
                var_sum: self.operand(var_sum, thread)?,
                n: self.operand(n, thread)?,
            },
        })
    }

    fn load_stats(&self, out: &WelfordTriple, thread: usize) -> Result<Stats> {
        Ok(Stats {
            avg: self.load(&out.avg, thread)?,
            var_sum: self.load(&out.var_sum, thread)?,
            n: self.load(&out.n, thread)?,
        })
    }

    fn store_stats(&mut self, out: &WelfordTriple, thread: usize, stats: Stats) -> Result<()> {
        self.store(&out.avg, thread, stats.avg)?;
        self.store(&out.var_sum, thread, stats.var_sum)?;
        self.store(&out.n, thread, stats.n)
    }
}

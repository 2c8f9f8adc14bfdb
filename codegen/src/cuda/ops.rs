//! CUDA source rendering for kernel IR statements and ops.
//!
//! Every tensor is spelled `T<n>[index]`: kernel parameters through the
//! `Tensor` struct's subscript, register arrays and shared buffers as plain
//! arrays. Half values are widened to float on load and narrowed on store.

use std::collections::HashMap;

use fuser_ir::{BinaryOpType, ConstValue, DataType, MemoryType, ParallelType, ParallelTypeSet, UnaryOpType, ValId};
use fuser_lower::{Allocate, Collective, ForLoop, Kernel, Op, Operand, Scalar, Stmt, TensorIndex, WelfordInput, WelfordTriple};
use snafu::{OptionExt, ensure};

use super::types::{binary_expr, compute_type, cuda_const, render_scalar, render_scalar_as, unary_fn};
use crate::error::*;

/// State of one kernel body being rendered.
pub struct CudaContext<'k> {
    lines: Vec<String>,
    depth: usize,
    /// Byte offset of each shared buffer into the dynamic shared array.
    shared_offsets: HashMap<ValId, &'k Scalar>,
}

impl<'k> CudaContext<'k> {
    pub fn new(kernel: &'k Kernel) -> Self {
        let shared_offsets = kernel.summary.shared.iter().map(|b| (b.tv, &b.offset)).collect();
        Self { lines: Vec::new(), depth: 1, shared_offsets }
    }

    pub fn into_lines(self) -> Vec<String> {
        self.lines
    }

    pub fn line(&mut self, text: impl AsRef<str>) {
        let indent = "  ".repeat(self.depth);
        self.lines.push(format!("{indent}{}", text.as_ref()));
    }

    fn open(&mut self, header: impl AsRef<str>) {
        self.line(format!("{} {{", header.as_ref()));
        self.depth += 1;
    }

    fn close(&mut self) {
        self.depth = self.depth.saturating_sub(1);
        self.line("}");
    }

    pub fn render_block(&mut self, stmts: &[Stmt]) -> Result<()> {
        for stmt in stmts {
            self.render_stmt(stmt)?;
        }
        Ok(())
    }

    fn render_stmt(&mut self, stmt: &Stmt) -> Result<()> {
        match stmt {
            Stmt::For(l) => self.render_loop(l),
            Stmt::If(branch) => {
                self.open(format!("if ({})", render_scalar(&branch.cond)));
                self.render_block(&branch.then_body)?;
                if branch.else_body.is_empty() {
                    self.close();
                } else {
                    self.depth = self.depth.saturating_sub(1);
                    self.line("} else {");
                    self.depth += 1;
                    self.render_block(&branch.else_body)?;
                    self.close();
                }
                Ok(())
            }
            Stmt::Allocate(a) => self.render_allocate(a),
            Stmt::Sync { .. } => {
                self.line("block_sync();");
                Ok(())
            }
            Stmt::Op(op) => self.render_op(op),
        }
    }

    fn render_loop(&mut self, l: &ForLoop) -> Result<()> {
        if l.is_trivial() {
            return self.render_block(&l.body);
        }
        if l.parallel == ParallelType::Vectorize && self.render_vectorized(l)? {
            return Ok(());
        }
        if matches!(l.parallel, ParallelType::Unroll | ParallelType::Vectorize | ParallelType::MisalignedVectorize) {
            self.line("#pragma unroll");
        }
        let i = l.index;
        self.open(format!("for (fuser_index_t {i} = 0; {i} < {}; ++{i})", render_scalar(&l.extent)));
        self.render_block(&l.body)?;
        self.close();
        Ok(())
    }

    /// A vectorized copy becomes one `Array` load and store at the first
    /// lane. Returns false when the body is not a plain copy.
    fn render_vectorized(&mut self, l: &ForLoop) -> Result<bool> {
        let Some(width) = l.extent.as_int() else { return Ok(false) };
        let (cond, op) = match &l.body[..] {
            [Stmt::Op(op)] => (None, op),
            [Stmt::If(branch)] if branch.else_body.is_empty() => match &branch.then_body[..] {
                [Stmt::Op(op)] => (Some(&branch.cond), op),
                _ => return Ok(false),
            },
            _ => return Ok(false),
        };
        let Op::Unary { op: UnaryOpType::Set, out, input: Operand::Tensor(input) } = op else { return Ok(false) };
        if input.dtype != out.dtype {
            return Ok(false);
        }
        let first_lane = |s: &Scalar| s.substitute(&|id| (id == l.index).then_some(Scalar::ZERO));
        let ty = format!("Array<{}, {width}>", out.dtype.cuda_type());
        let copy = format!(
            "*reinterpret_cast<{ty}*>(&T{}[{}]) = *reinterpret_cast<{ty}*>(&T{}[{}]);",
            out.tv.index(),
            render_scalar(&first_lane(&out.index)),
            input.tv.index(),
            render_scalar(&first_lane(&input.index)),
        );
        match cond.map(first_lane) {
            Some(cond) if !cond.is_true() => {
                self.open(format!("if ({})", render_scalar(&cond)));
                self.line(copy);
                self.close();
            }
            _ => self.line(copy),
        }
        Ok(true)
    }

    fn render_allocate(&mut self, a: &Allocate) -> Result<()> {
        let ty = a.dtype.cuda_type();
        let name = format!("T{}", a.tv.index());
        match a.memory {
            MemoryType::Local => {
                let size = a.size.as_int().context(SymbolicLocalSizeSnafu { tv: a.tv, size: a.size.to_string() })?;
                self.line(format!("{ty} {name}[{size}];"));
            }
            MemoryType::Shared => {
                let offset = self.shared_offsets.get(&a.tv).context(MissingSharedOffsetSnafu { tv: a.tv })?;
                self.line(format!("{ty}* {name} = reinterpret_cast<{ty}*>(array + {});", render_scalar(offset)));
            }
            MemoryType::Global => {
                return UnsupportedSnafu { what: format!("global allocation of {name} inside a kernel") }.fail();
            }
        }
        Ok(())
    }

    fn render_op(&mut self, op: &Op) -> Result<()> {
        match op {
            Op::Unary { op, out, input } => {
                let value = match op {
                    UnaryOpType::Set | UnaryOpType::Cast => load_as(input, out.dtype),
                    UnaryOpType::Neg => format!("-{}", load_as(input, out.dtype)),
                    op => format!("{}({})", unary_fn(*op, out.dtype), load_as(input, out.dtype)),
                };
                self.line(store(out, value));
            }
            Op::Binary { op, out, lhs, rhs } => {
                let dtype = if op.is_comparison() { lhs.dtype().promote(rhs.dtype()) } else { out.dtype };
                let value = binary_expr(*op, &load_as(lhs, dtype), &load_as(rhs, dtype), dtype);
                self.line(store(out, value));
            }
            Op::Where { out, cond, a, b } => {
                let value = format!("{} ? {} : {}", load_as(cond, DataType::Bool), load_as(a, out.dtype), load_as(b, out.dtype));
                self.line(store(out, value));
            }
            Op::Init { out, value } => self.line(store(out, cuda_const(*value, out.dtype.accumulate_type()))),
            Op::Reduction { op, out, input, init, collective } => self.render_reduction(*op, out, input, *init, collective)?,
            Op::Welford { out, input, collective } => self.render_welford(out, input, collective)?,
            Op::Broadcast { out, input, collective } => self.render_broadcast(out, input, collective)?,
        }
        Ok(())
    }

    fn render_reduction(
        &mut self,
        op: BinaryOpType,
        out: &TensorIndex,
        input: &Operand,
        init: ConstValue,
        collective: &Collective,
    ) -> Result<()> {
        let (read_pred, write_pred, types, grid) = match collective {
            Collective::Serial => {
                let value = binary_expr(op, &load(&Operand::Tensor(out.clone())), &load_as(input, out.dtype), out.dtype);
                self.line(store(out, value));
                return Ok(());
            }
            Collective::Block { types, read_pred, write_pred } => (read_pred, write_pred, *types, false),
            Collective::Grid { types, read_pred, write_pred } => (read_pred, write_pred, *types, true),
        };
        ensure!(out.dtype != DataType::Half, UnsupportedSnafu { what: "half precision cross-thread reductions" });
        let ty = out.dtype.cuda_type();
        let combine = binary_expr(op, "a", "b", out.dtype);
        let args = [
            access(out),
            load_as(input, out.dtype),
            format!("[]({ty} &a, {ty} b) {{ a = {combine}; }}"),
        ];
        let call = if grid {
            format!(
                "gridReduce<{}>({}, work_buf, sync_flags, reinterpret_cast<{ty}*>(shared_mem), {}, {}, {});",
                grid_flags(types),
                args.join(", "),
                render_scalar(read_pred),
                render_scalar(write_pred),
                cuda_const(init, out.dtype),
            )
        } else {
            format!(
                "blockReduce<{}>({}, threadIdx, blockDim, reinterpret_cast<{ty}*>(shared_mem), {}, {}, {});",
                thread_flags(types),
                args.join(", "),
                render_scalar(read_pred),
                render_scalar(write_pred),
                cuda_const(init, out.dtype),
            )
        };
        self.line(call);
        Ok(())
    }

    fn render_welford(&mut self, out: &WelfordTriple, input: &WelfordInput, collective: &Collective) -> Result<()> {
        ensure!(out.avg.dtype != DataType::Half, UnsupportedSnafu { what: "half precision Welford" });
        let (ty, tn) = (out.avg.dtype.cuda_type(), out.n.dtype.cuda_type());
        let (in_avg, in_var, in_n) = match input {
            WelfordInput::Sample(x) => {
                (load_as(x, out.avg.dtype), cuda_const(ConstValue::Float(0.0), out.avg.dtype), cuda_const(ConstValue::Int(1), out.n.dtype))
            }
            WelfordInput::Partial { avg, var_sum, n } => {
                (load_as(avg, out.avg.dtype), load_as(var_sum, out.var_sum.dtype), load_as(n, out.n.dtype))
            }
        };
        let args = [access(&out.avg), access(&out.var_sum), access(&out.n), in_avg, in_var, in_n].join(", ");
        let call = match collective {
            Collective::Serial => format!("welfordCombine<{ty}, {tn}>({args});"),
            Collective::Block { types, read_pred, write_pred } => format!(
                "blockWelford<{}, {ty}, {tn}>({args}, threadIdx, blockDim, shared_mem, {}, {});",
                thread_flags(*types),
                render_scalar(read_pred),
                render_scalar(write_pred),
            ),
            Collective::Grid { types, read_pred, write_pred } => format!(
                "gridWelford<{}, {ty}, {tn}>({args}, work_buf, sync_flags, shared_mem, {}, {});",
                grid_flags(*types),
                render_scalar(read_pred),
                render_scalar(write_pred),
            ),
        };
        self.line(call);
        Ok(())
    }

    fn render_broadcast(&mut self, out: &TensorIndex, input: &Operand, collective: &Collective) -> Result<()> {
        let call = match collective {
            Collective::Serial => store(out, load_as(input, out.dtype)),
            Collective::Block { types, read_pred, write_pred } => {
                ensure!(out.dtype != DataType::Half, UnsupportedSnafu { what: "half precision block broadcasts" });
                let ty = out.dtype.cuda_type();
                format!(
                    "blockBroadcast<{}>({}, {}, reinterpret_cast<{ty}*>(shared_mem), {}, {});",
                    thread_flags(*types),
                    access(out),
                    load_as(input, out.dtype),
                    render_scalar(read_pred),
                    render_scalar(write_pred),
                )
            }
            Collective::Grid { types, read_pred, write_pred } => {
                ensure!(out.dtype != DataType::Half, UnsupportedSnafu { what: "half precision grid broadcasts" });
                format!(
                    "gridBroadcast<{}>({}, {}, work_buf, sync_flags, {}, {});",
                    grid_flags(*types),
                    access(out),
                    load_as(input, out.dtype),
                    render_scalar(read_pred),
                    render_scalar(write_pred),
                )
            }
        };
        self.line(call);
        Ok(())
    }
}

fn access(t: &TensorIndex) -> String {
    format!("T{}[{}]", t.tv.index(), render_scalar(&t.index))
}

/// An operand in its compute type.
fn load(operand: &Operand) -> String {
    match operand {
        Operand::Tensor(t) if t.dtype == DataType::Half => format!("__half2float({})", access(t)),
        Operand::Tensor(t) => access(t),
        Operand::Scalar { value, dtype } => render_scalar_as(value, *dtype),
    }
}

/// An operand converted to the compute type of `dtype`.
fn load_as(operand: &Operand, dtype: DataType) -> String {
    let target = compute_type(dtype);
    match operand {
        Operand::Scalar { value, .. } if value.is_const() => render_scalar_as(value, dtype),
        operand if compute_type(operand.dtype()) == target => load(operand),
        operand => format!("static_cast<{target}>({})", load(operand)),
    }
}

fn store(out: &TensorIndex, value: String) -> String {
    if out.dtype == DataType::Half {
        format!("{} = __float2half({value});", access(out))
    } else {
        format!("{} = {value};", access(out))
    }
}

fn flag(types: ParallelTypeSet, pt: ParallelType) -> &'static str {
    if types.contains(pt) { "true" } else { "false" }
}

fn thread_flags(types: ParallelTypeSet) -> String {
    [ParallelType::TIDx, ParallelType::TIDy, ParallelType::TIDz].map(|pt| flag(types, pt)).join(", ")
}

fn grid_flags(types: ParallelTypeSet) -> String {
    let blocks = [ParallelType::BIDx, ParallelType::BIDy, ParallelType::BIDz].map(|pt| flag(types, pt)).join(", ");
    format!("{blocks}, {}", thread_flags(types))
}

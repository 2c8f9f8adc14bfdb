//! Indented text dump of kernel IR.

use std::fmt::{self, Write};

use super::*;

impl fmt::Display for TensorIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}[{}]", self.tv.index(), self.index)
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Tensor(t) => write!(f, "{t}"),
            Operand::Scalar { value, .. } => write!(f, "{value}"),
        }
    }
}

impl fmt::Display for Collective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Collective::Serial => Ok(()),
            Collective::Block { types, .. } => write!(f, " block{types:?}"),
            Collective::Grid { types, .. } => write!(f, " grid{types:?}"),
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::Unary { op, out, input } => write!(f, "{out} = {op:?}({input})"),
            Op::Binary { op, out, lhs, rhs } => write!(f, "{out} = {op:?}({lhs}, {rhs})"),
            Op::Where { out, cond, a, b } => write!(f, "{out} = where({cond}, {a}, {b})"),
            Op::Init { out, value } => write!(f, "{out} = init {value}"),
            Op::Reduction { op, out, input, collective, .. } => write!(f, "{out} = reduce {op:?}({input}){collective}"),
            Op::Welford { out, input, collective } => {
                let input = match input {
                    WelfordInput::Sample(x) => x.to_string(),
                    WelfordInput::Partial { avg, var_sum, n } => format!("{avg}, {var_sum}, {n}"),
                };
                write!(f, "{}, {}, {} = welford({input}){collective}", out.avg, out.var_sum, out.n)
            }
            Op::Broadcast { out, input, collective } => write!(f, "{out} = broadcast({input}){collective}"),
        }
    }
}

fn write_block(out: &mut String, stmts: &[Stmt], depth: usize) -> fmt::Result {
    let pad = "  ".repeat(depth);
    for stmt in stmts {
        match stmt {
            Stmt::For(l) => {
                writeln!(out, "{pad}for {} in {} ({}, {}):", l.index, l.extent, l.parallel, l.iter_domain)?;
                write_block(out, &l.body, depth + 1)?;
            }
            Stmt::If(i) => {
                writeln!(out, "{pad}if {}:", i.cond)?;
                write_block(out, &i.then_body, depth + 1)?;
                if !i.else_body.is_empty() {
                    writeln!(out, "{pad}else:")?;
                    write_block(out, &i.else_body, depth + 1)?;
                }
            }
            Stmt::Allocate(a) => {
                write!(out, "{pad}alloc T{} {} {}[{}]", a.tv.index(), a.memory, a.dtype, a.size)?;
                match a.alias {
                    Some(alias) => writeln!(out, " aliases T{}", alias.index())?,
                    None => writeln!(out)?,
                }
            }
            Stmt::Sync { war } => writeln!(out, "{pad}sync{}", if *war { " (war)" } else { "" })?,
            Stmt::Op(op) => writeln!(out, "{pad}{op}")?,
        }
    }
    Ok(())
}

impl fmt::Display for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params: Vec<String> = self
            .params
            .iter()
            .map(|p| match p {
                KernelParam::Tensor { tv, dtype, .. } => format!("T{}: {dtype}", tv.index()),
                KernelParam::Scalar { val, dtype } => format!("s{}: {dtype}", val.index()),
                KernelParam::WorkBuffer { dtype } => format!("work: {dtype}"),
                KernelParam::SyncFlags => "sync_flags".to_string(),
            })
            .collect();
        writeln!(f, "kernel {}({}):", self.name, params.join(", "))?;
        let mut body = String::new();
        write_block(&mut body, &self.body, 1)?;
        f.write_str(&body)
    }
}

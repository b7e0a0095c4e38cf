//! Text form of modules.
//!
//! Values are renumbered in order of appearance, so two structurally equal
//! functions print identically regardless of their arena layout.

use crate::ir::function::{BlockId, Func, Module, OpId, ValueId};
use crate::ir::ops::{OpKind, PipelineInfo};
use crate::utils::pretty::{format_list, CodeFormatter};
use std::collections::HashMap;
use std::fmt;

/// Print every function of a module, separated by blank lines.
pub fn print_module(module: &Module) -> String {
    module
        .functions
        .iter()
        .map(print_func)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Print one function.
pub fn print_func(func: &Func) -> String {
    FuncPrinter::new(func).print()
}

/// Function attribute list, empty for plain functions.
fn func_attrs(func: &Func) -> String {
    let mut attrs = Vec::new();
    if func.role != crate::ir::ops::FuncRole::Normal || func.info.is_some() {
        attrs.push(func.role.name().to_string());
    }
    if let Some(PipelineInfo { ii, stage_count, res_mii, rec_mii, prologue_ops, epilogue_ops }) = func.info {
        attrs.push(format!("ii={}", ii));
        attrs.push(format!("stages={}", stage_count));
        attrs.push(format!("res_mii={}", res_mii));
        attrs.push(format!("rec_mii={}", rec_mii));
        attrs.push(format!("prologue_ops={}", prologue_ops));
        attrs.push(format!("epilogue_ops={}", epilogue_ops));
    }
    if attrs.is_empty() {
        String::new()
    } else {
        format!(" [{}]", attrs.join(", "))
    }
}

/// Op attribute list, empty when the op has none.
fn op_attrs(kind: &OpKind) -> String {
    let attrs = match kind {
        OpKind::Const(c) => vec![c.to_string()],
        OpKind::Cmp(pred) => vec![pred.name().to_string()],
        OpKind::Reduce(op) => vec![op.name().to_string()],
        OpKind::Slice(offset) => vec![offset.to_string()],
        OpKind::Call(callee) => vec![format!("@{}", callee)],
        OpKind::For { role, pipeline } => {
            let mut attrs = vec![match role {
                crate::ir::ops::LoopRole::Main => "main".to_string(),
                crate::ir::ops::LoopRole::Tail => "tail".to_string(),
            }];
            if let Some(p) = pipeline {
                attrs.push(format!("prologue=@{}", p.prologue));
                attrs.push(format!("steady=@{}", p.steady));
                attrs.push(format!("epilogue=@{}", p.epilogue));
                attrs.push(format!("stages={}", p.stage_count));
                attrs.push(format!("ii={}", p.ii));
                attrs.push(format!("live_ins={}", p.num_live_ins));
            }
            attrs
        }
        _ => Vec::new(),
    };
    if attrs.is_empty() {
        String::new()
    } else {
        format!("[{}]", attrs.join(", "))
    }
}

struct FuncPrinter<'f> {
    func: &'f Func,
    names: HashMap<ValueId, usize>,
    out: CodeFormatter,
}

impl<'f> FuncPrinter<'f> {
    fn new(func: &'f Func) -> Self {
        Self { func, names: HashMap::new(), out: CodeFormatter::default_indent() }
    }

    fn name(&mut self, v: ValueId) -> String {
        let next = self.names.len();
        let n = *self.names.entry(v).or_insert(next);
        format!("%{}", n)
    }

    fn typed_args(&mut self, block: BlockId) -> String {
        let func = self.func;
        let args = &func.block(block).args;
        let parts: Vec<String> = args
            .iter()
            .map(|&a| format!("{}: {}", self.name(a), func.value_type(a)))
            .collect();
        parts.join(", ")
    }

    fn print(mut self) -> String {
        let params = self.typed_args(self.func.entry());
        let results = format_list(&self.func.result_types, ", ");
        self.out.writeln(&format!(
            "func @{}({}) -> ({}){} {{",
            self.func.name,
            params,
            results,
            func_attrs(self.func)
        ));
        self.out.indent();
        self.print_ops(self.func.entry());
        self.out.dedent();
        self.out.writeln("}");
        self.out.finish()
    }

    fn print_ops(&mut self, block: BlockId) {
        let func = self.func;
        for &op in &func.block(block).ops {
            self.print_op(op);
        }
    }

    fn print_op(&mut self, id: OpId) {
        let func = self.func;
        let op = func.op(id);
        let mut line = String::new();
        if !op.results.is_empty() {
            let results: Vec<String> = op.results.iter().map(|&r| self.name(r)).collect();
            line.push_str(&results.join(", "));
            line.push_str(" = ");
        }
        let operands: Vec<String> = op.operands.iter().map(|&v| self.name(v)).collect();
        line.push_str(&format!("{}{}({})", op.kind.mnemonic(), op_attrs(&op.kind), operands.join(", ")));
        if !op.results.is_empty() {
            let types: Vec<String> = op.results.iter().map(|&r| func.value_type(r).to_string()).collect();
            line.push_str(&format!(" : {}", types.join(", ")));
        }
        if op.regions.is_empty() {
            self.out.writeln(&line);
            return;
        }
        self.out.write(&line);
        for &region in &op.regions {
            self.out.writeln(" {");
            self.out.indent();
            if !func.block(region).args.is_empty() {
                let args = self.typed_args(region);
                self.out.writeln(&format!("^({}):", args));
            }
            self.print_ops(region);
            self.out.dedent();
            self.out.write("}");
        }
        self.out.write("\n");
    }
}

impl fmt::Display for Func {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&print_func(self))
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&print_module(self))
    }
}

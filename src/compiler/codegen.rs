//! The code generator.
//!
//! Lowers the parsed AST into [`Instructions`] for the VM. Forward
//! jumps are emitted with a placeholder target and patched once the
//! destination index is known. Block bodies compile into a side table
//! keyed by name; macro bodies compile into their own instruction
//! buffers carried by the [`BuildMacro`](Instruction::BuildMacro)
//! instruction itself.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::ast::expr::{BinaryOpKind, Expr, ExprKind, UnaryOpKind};
use crate::ast::span::Span;
use crate::ast::template::{self, Stmt, StmtKind};
use crate::compiler::instructions::{
    Instruction, Instructions, LocalId, MacroDecl, LOOP_FLAG_RECURSIVE, LOOP_FLAG_WITH_LOOP_VAR,
    MAX_LOCALS, UNKNOWN_LOCAL,
};
use crate::error::Error;
use crate::eval::output::CaptureMode;
use crate::value::Value;

/// Placeholder jump target, patched before compilation finishes.
const PENDING: usize = !0;

/// A fully lowered template: the root instruction buffer plus the
/// compiled bodies of named blocks.
#[derive(Debug)]
pub struct CompiledTemplate {
    pub instructions: Instructions,
    pub blocks: BTreeMap<String, Arc<Instructions>>,
}

/// Lower a parsed template into executable form.
pub fn compile(root: &Stmt) -> Result<CompiledTemplate, Error> {
    let mut gen = CodeGenerator::new();
    gen.compile_stmt(root)?;
    let (instructions, blocks) = gen.finish();
    Ok(CompiledTemplate {
        instructions,
        blocks,
    })
}

/// Lower a bare expression into an instruction buffer that leaves its
/// value on the operand stack.
pub fn compile_expression(expr: &Expr) -> Result<Instructions, Error> {
    let mut gen = CodeGenerator::new();
    gen.compile_expr(expr)?;
    let (instructions, _) = gen.finish();
    Ok(instructions)
}

struct CodeGenerator {
    instructions: Instructions,
    blocks: BTreeMap<String, Arc<Instructions>>,
    current_span: Span,
    filter_ids: BTreeMap<String, LocalId>,
    test_ids: BTreeMap<String, LocalId>,
}

impl CodeGenerator {
    fn new() -> CodeGenerator {
        CodeGenerator {
            instructions: Instructions::new(),
            blocks: BTreeMap::new(),
            current_span: Span::default(),
            filter_ids: BTreeMap::new(),
            test_ids: BTreeMap::new(),
        }
    }

    fn finish(self) -> (Instructions, BTreeMap<String, Arc<Instructions>>) {
        (self.instructions, self.blocks)
    }

    fn add(&mut self, instr: Instruction) -> usize {
        self.instructions.add_with_span(instr, self.current_span)
    }

    fn next_index(&self) -> usize {
        self.instructions.len()
    }

    fn patch_jump(&mut self, idx: usize, target: usize) {
        match self.instructions.get_mut(idx) {
            Some(Instruction::Jump(t))
            | Some(Instruction::JumpIfFalse(t))
            | Some(Instruction::JumpIfFalseOrPop(t))
            | Some(Instruction::JumpIfTrueOrPop(t))
            | Some(Instruction::JumpIfIterated(t))
            | Some(Instruction::Iterate(t)) => *t = target,
            instr => unreachable!("attempted to patch non-jump instruction {instr:?}"),
        }
    }

    fn filter_local_id(&mut self, name: &str) -> LocalId {
        local_id(&mut self.filter_ids, name)
    }

    fn test_local_id(&mut self, name: &str) -> LocalId {
        local_id(&mut self.test_ids, name)
    }

    // ── statements ───────────────────────────────────────────────────

    fn compile_body(&mut self, body: &[Stmt]) -> Result<(), Error> {
        for stmt in body {
            self.compile_stmt(stmt)?;
        }
        Ok(())
    }

    fn compile_stmt(&mut self, stmt: &Stmt) -> Result<(), Error> {
        self.current_span = stmt.span;
        match &stmt.node {
            StmtKind::Template(children) => self.compile_body(children)?,
            StmtKind::EmitRaw(text) => {
                self.add(Instruction::EmitRaw(text.clone()));
            }
            StmtKind::EmitExpr(expr) => {
                self.compile_expr(expr)?;
                self.add(Instruction::Emit);
            }
            StmtKind::ForLoop(for_loop) => self.compile_for_loop(for_loop)?,
            StmtKind::IfCond(if_cond) => self.compile_if_cond(if_cond)?,
            StmtKind::WithBlock(with_block) => {
                self.add(Instruction::PushWith);
                for (target, expr) in &with_block.assignments {
                    self.compile_expr(expr)?;
                    self.compile_assignment(target)?;
                }
                self.compile_body(&with_block.body)?;
                self.add(Instruction::PopFrame);
            }
            StmtKind::Set(set) => {
                self.compile_expr(&set.expr)?;
                self.compile_assignment(&set.target)?;
            }
            StmtKind::SetBlock(set_block) => {
                self.add(Instruction::BeginCapture(CaptureMode::Capture));
                self.compile_body(&set_block.body)?;
                self.add(Instruction::EndCapture);
                if let Some(filter) = &set_block.filter {
                    self.compile_expr(filter)?;
                }
                self.compile_assignment(&set_block.target)?;
            }
            StmtKind::AutoEscape(auto_escape) => {
                self.compile_expr(&auto_escape.enabled)?;
                self.add(Instruction::PushAutoEscape);
                self.compile_body(&auto_escape.body)?;
                self.add(Instruction::PopAutoEscape);
            }
            StmtKind::FilterBlock(filter_block) => {
                self.add(Instruction::BeginCapture(CaptureMode::Capture));
                self.compile_body(&filter_block.body)?;
                self.add(Instruction::EndCapture);
                self.compile_expr(&filter_block.filter)?;
                self.add(Instruction::Emit);
            }
            StmtKind::Block(block) => self.compile_block(block)?,
            StmtKind::Macro(macro_decl) => {
                self.compile_macro(macro_decl)?;
                self.add(Instruction::StoreLocal(macro_decl.name.clone()));
            }
            StmtKind::CallBlock(call_block) => self.compile_call_block(call_block)?,
            StmtKind::Do(do_stmt) => {
                self.compile_expr(&do_stmt.expr)?;
                self.add(Instruction::DiscardTop);
            }
            StmtKind::Extends(_) => {
                return Err(Error::invalid_op(
                    "extends requires a template loader, which this engine does not provide",
                )
                .with_span(stmt.span));
            }
            StmtKind::Include(_) => {
                return Err(Error::invalid_op(
                    "include requires a template loader, which this engine does not provide",
                )
                .with_span(stmt.span));
            }
            StmtKind::Import(_) | StmtKind::FromImport(_) => {
                return Err(Error::invalid_op(
                    "import requires a template loader, which this engine does not provide",
                )
                .with_span(stmt.span));
            }
        }
        Ok(())
    }

    fn compile_if_cond(&mut self, if_cond: &template::IfCond) -> Result<(), Error> {
        self.compile_expr(&if_cond.expr)?;
        let jump_if_false = self.add(Instruction::JumpIfFalse(PENDING));
        self.compile_body(&if_cond.true_body)?;
        if if_cond.false_body.is_empty() {
            let end = self.next_index();
            self.patch_jump(jump_if_false, end);
        } else {
            let jump_over_else = self.add(Instruction::Jump(PENDING));
            let else_start = self.next_index();
            self.patch_jump(jump_if_false, else_start);
            self.compile_body(&if_cond.false_body)?;
            let end = self.next_index();
            self.patch_jump(jump_over_else, end);
        }
        Ok(())
    }

    fn compile_for_loop(&mut self, for_loop: &template::ForLoop) -> Result<(), Error> {
        if let Some(filter_expr) = &for_loop.filter_expr {
            // materialize the filtered sequence in an unnamed pre-pass
            self.add(Instruction::BuildList(0));
            self.compile_expr(&for_loop.iter)?;
            self.add(Instruction::PushLoop(0));
            let iterate = self.add(Instruction::Iterate(PENDING));
            self.add(Instruction::DupTop);
            self.compile_assignment(&for_loop.target)?;
            self.compile_expr(filter_expr)?;
            let skip = self.add(Instruction::JumpIfFalse(PENDING));
            self.add(Instruction::ListAppend);
            let over = self.add(Instruction::Jump(PENDING));
            let discard = self.next_index();
            self.patch_jump(skip, discard);
            self.add(Instruction::DiscardTop);
            let back = self.next_index();
            self.patch_jump(over, back);
            self.add(Instruction::Jump(iterate));
            let end = self.next_index();
            self.patch_jump(iterate, end);
            self.add(Instruction::PopFrame);
        } else {
            self.compile_expr(&for_loop.iter)?;
        }

        let flags = if for_loop.recursive {
            LOOP_FLAG_WITH_LOOP_VAR | LOOP_FLAG_RECURSIVE
        } else {
            LOOP_FLAG_WITH_LOOP_VAR
        };
        self.add(Instruction::PushLoop(flags));
        let iterate = self.add(Instruction::Iterate(PENDING));
        self.compile_assignment(&for_loop.target)?;
        self.compile_body(&for_loop.body)?;
        self.add(Instruction::Jump(iterate));
        let end = self.next_index();
        self.patch_jump(iterate, end);
        if !for_loop.else_body.is_empty() {
            let skip_else = self.add(Instruction::JumpIfIterated(PENDING));
            self.compile_body(&for_loop.else_body)?;
            let over = self.next_index();
            self.patch_jump(skip_else, over);
        }
        self.add(Instruction::PopFrame);
        Ok(())
    }

    fn compile_block(&mut self, block: &template::Block) -> Result<(), Error> {
        if self.blocks.contains_key(&block.name) {
            return Err(Error::invalid_op(format!(
                "block {} is defined twice",
                block.name
            ))
            .with_span(self.current_span));
        }
        let mut sub = CodeGenerator::new();
        sub.compile_body(&block.body)?;
        let (instructions, nested) = sub.finish();
        for (name, body) in nested {
            if self.blocks.insert(name.clone(), body).is_some() {
                return Err(
                    Error::invalid_op(format!("block {name} is defined twice"))
                        .with_span(self.current_span),
                );
            }
        }
        self.blocks
            .insert(block.name.clone(), Arc::new(instructions));
        self.add(Instruction::CallBlock(block.name.clone()));
        Ok(())
    }

    /// Compile a macro declaration, leaving the macro value on the
    /// stack. Defaults are evaluated here, at definition time.
    fn compile_macro(&mut self, macro_decl: &template::Macro) -> Result<(), Error> {
        for default in &macro_decl.defaults {
            self.compile_expr(default)?;
        }
        self.add(Instruction::BuildList(macro_decl.defaults.len()));

        let mut sub = CodeGenerator::new();
        sub.compile_body(&macro_decl.body)?;
        let (body, nested) = sub.finish();
        for (name, block_body) in nested {
            self.blocks.entry(name).or_insert(block_body);
        }

        let mut arg_names = Vec::with_capacity(macro_decl.args.len());
        for arg in &macro_decl.args {
            match &arg.node {
                ExprKind::Var(name) => arg_names.push(name.clone()),
                _ => {
                    return Err(
                        Error::invalid_op("invalid macro parameter").with_span(arg.span)
                    )
                }
            }
        }

        let mut referenced = BTreeSet::new();
        find_stmt_names(&macro_decl.body, &mut referenced);
        let caller_reference = referenced.remove("caller");
        let closure_names = referenced
            .into_iter()
            .filter(|name| !arg_names.iter().any(|arg| arg == name))
            .map(str::to_string)
            .collect();

        self.add(Instruction::BuildMacro(Box::new(MacroDecl {
            name: macro_decl.name.clone(),
            arg_names,
            closure_names,
            caller_reference,
            body: Arc::new(body),
        })));
        Ok(())
    }

    fn compile_call_block(&mut self, call_block: &template::CallBlock) -> Result<(), Error> {
        self.add(Instruction::PushWith);
        self.compile_macro(&call_block.macro_decl)?;
        self.add(Instruction::StoreLocal("caller".to_string()));
        // re-issue the call with `caller` as an extra keyword argument
        let (callee, args) = match &call_block.call.node {
            ExprKind::Call { expr, args } => (expr, args),
            _ => unreachable!("parser guarantees a call expression"),
        };
        let span = call_block.call.span;
        let caller_kwarg = (
            "caller".to_string(),
            Expr::new(ExprKind::Var("caller".to_string()), span),
        );
        let mut args = args.clone();
        match args.last_mut().map(|arg| &mut arg.node) {
            Some(ExprKind::Kwargs(pairs)) => pairs.push(caller_kwarg),
            _ => args.push(Expr::new(ExprKind::Kwargs(vec![caller_kwarg]), span)),
        }
        let call = Expr::new(
            ExprKind::Call {
                expr: callee.clone(),
                args,
            },
            span,
        );
        self.compile_expr(&call)?;
        self.add(Instruction::Emit);
        self.add(Instruction::PopFrame);
        Ok(())
    }

    fn compile_assignment(&mut self, target: &Expr) -> Result<(), Error> {
        match &target.node {
            ExprKind::Var(name) => {
                self.add(Instruction::StoreLocal(name.clone()));
                Ok(())
            }
            ExprKind::List(items) => {
                self.add(Instruction::UnpackList(items.len()));
                for item in items {
                    self.compile_assignment(item)?;
                }
                Ok(())
            }
            _ => Err(Error::syntax("invalid assignment target", target.span)),
        }
    }

    // ── expressions ──────────────────────────────────────────────────

    fn compile_expr(&mut self, expr: &Expr) -> Result<(), Error> {
        self.current_span = expr.span;
        match &expr.node {
            ExprKind::Var(name) => {
                self.add(Instruction::Lookup(name.clone()));
            }
            ExprKind::Const(value) => {
                self.add(Instruction::LoadConst(value.clone()));
            }
            ExprKind::UnaryOp { op, expr } => {
                self.compile_expr(expr)?;
                self.add(match op {
                    UnaryOpKind::Not => Instruction::Not,
                    UnaryOpKind::Neg => Instruction::Neg,
                });
            }
            ExprKind::BinaryOp { op, left, right } => {
                self.compile_binary_op(*op, left, right, expr.span)?;
            }
            ExprKind::GetAttr {
                expr: parent,
                name,
            } => {
                self.compile_expr(parent)?;
                self.current_span = expr.span;
                self.add(Instruction::GetAttr(name.clone()));
            }
            ExprKind::GetItem { expr, subscript } => {
                self.compile_expr(expr)?;
                self.compile_expr(subscript)?;
                self.add(Instruction::GetItem);
            }
            ExprKind::Slice {
                expr: target,
                start,
                stop,
                step,
            } => {
                self.compile_expr(target)?;
                for part in [start, stop, step] {
                    match part {
                        Some(part) => self.compile_expr(part)?,
                        None => {
                            self.add(Instruction::LoadConst(Value::NONE));
                        }
                    }
                }
                self.current_span = expr.span;
                self.add(Instruction::Slice);
            }
            ExprKind::IfExpr {
                test,
                true_expr,
                false_expr,
            } => {
                self.compile_expr(test)?;
                let jump_if_false = self.add(Instruction::JumpIfFalse(PENDING));
                self.compile_expr(true_expr)?;
                let jump_over = self.add(Instruction::Jump(PENDING));
                let else_start = self.next_index();
                self.patch_jump(jump_if_false, else_start);
                match false_expr {
                    Some(false_expr) => self.compile_expr(false_expr)?,
                    None => {
                        self.add(Instruction::LoadConst(Value::UNDEFINED));
                    }
                }
                let end = self.next_index();
                self.patch_jump(jump_over, end);
            }
            ExprKind::Filter {
                name,
                expr: input,
                args,
            } => {
                if let Some(input) = input {
                    self.compile_expr(input)?;
                }
                for arg in args {
                    self.compile_expr(arg)?;
                }
                self.current_span = expr.span;
                let local_id = self.filter_local_id(name);
                self.add(Instruction::ApplyFilter(
                    name.clone(),
                    1 + args.len(),
                    local_id,
                ));
            }
            ExprKind::Test {
                name,
                expr: input,
                args,
            } => {
                self.compile_expr(input)?;
                for arg in args {
                    self.compile_expr(arg)?;
                }
                self.current_span = expr.span;
                let local_id = self.test_local_id(name);
                self.add(Instruction::PerformTest(
                    name.clone(),
                    1 + args.len(),
                    local_id,
                ));
            }
            ExprKind::Call { expr: callee, args } => {
                match &callee.node {
                    ExprKind::Var(name) => {
                        for arg in args {
                            self.compile_expr(arg)?;
                        }
                        self.current_span = expr.span;
                        self.add(Instruction::CallFunction(name.clone(), args.len()));
                    }
                    ExprKind::GetAttr {
                        expr: receiver,
                        name,
                    } => {
                        self.compile_expr(receiver)?;
                        for arg in args {
                            self.compile_expr(arg)?;
                        }
                        self.current_span = expr.span;
                        self.add(Instruction::CallMethod(name.clone(), args.len()));
                    }
                    _ => {
                        self.compile_expr(callee)?;
                        for arg in args {
                            self.compile_expr(arg)?;
                        }
                        self.current_span = expr.span;
                        self.add(Instruction::CallObject(args.len()));
                    }
                }
            }
            ExprKind::List(items) => {
                for item in items {
                    self.compile_expr(item)?;
                }
                self.current_span = expr.span;
                self.add(Instruction::BuildList(items.len()));
            }
            ExprKind::Map { keys, values } => {
                for (key, value) in keys.iter().zip(values.iter()) {
                    self.compile_expr(key)?;
                    self.compile_expr(value)?;
                }
                self.current_span = expr.span;
                self.add(Instruction::BuildMap(keys.len()));
            }
            ExprKind::Kwargs(pairs) => {
                for (name, value) in pairs {
                    self.add(Instruction::LoadConst(Value::from(name.as_str())));
                    self.compile_expr(value)?;
                }
                self.current_span = expr.span;
                self.add(Instruction::BuildKwargs(pairs.len()));
            }
        }
        Ok(())
    }

    fn compile_binary_op(
        &mut self,
        op: BinaryOpKind,
        left: &Expr,
        right: &Expr,
        span: Span,
    ) -> Result<(), Error> {
        // short-circuit forms jump over the right operand
        match op {
            BinaryOpKind::ScAnd => {
                self.compile_expr(left)?;
                let jump = self.add(Instruction::JumpIfFalseOrPop(PENDING));
                self.compile_expr(right)?;
                let end = self.next_index();
                self.patch_jump(jump, end);
                return Ok(());
            }
            BinaryOpKind::ScOr => {
                self.compile_expr(left)?;
                let jump = self.add(Instruction::JumpIfTrueOrPop(PENDING));
                self.compile_expr(right)?;
                let end = self.next_index();
                self.patch_jump(jump, end);
                return Ok(());
            }
            _ => {}
        }
        self.compile_expr(left)?;
        self.compile_expr(right)?;
        self.current_span = span;
        self.add(match op {
            BinaryOpKind::Eq => Instruction::Eq,
            BinaryOpKind::Ne => Instruction::Ne,
            BinaryOpKind::Lt => Instruction::Lt,
            BinaryOpKind::Lte => Instruction::Lte,
            BinaryOpKind::Gt => Instruction::Gt,
            BinaryOpKind::Gte => Instruction::Gte,
            BinaryOpKind::Add => Instruction::Add,
            BinaryOpKind::Sub => Instruction::Sub,
            BinaryOpKind::Mul => Instruction::Mul,
            BinaryOpKind::Div => Instruction::Div,
            BinaryOpKind::FloorDiv => Instruction::IntDiv,
            BinaryOpKind::Rem => Instruction::Rem,
            BinaryOpKind::Pow => Instruction::Pow,
            BinaryOpKind::Concat => Instruction::StringConcat,
            BinaryOpKind::In => Instruction::In,
            BinaryOpKind::ScAnd | BinaryOpKind::ScOr => unreachable!(),
        });
        Ok(())
    }
}

fn local_id(ids: &mut BTreeMap<String, LocalId>, name: &str) -> LocalId {
    if let Some(id) = ids.get(name) {
        *id
    } else if ids.len() >= MAX_LOCALS {
        UNKNOWN_LOCAL
    } else {
        let id = ids.len() as LocalId;
        ids.insert(name.to_string(), id);
        id
    }
}

// ── closure analysis ─────────────────────────────────────────────────

/// Collect every variable name a macro body references, so the macro
/// can resolve them from its definition site later.
fn find_stmt_names<'a>(stmts: &'a [Stmt], out: &mut BTreeSet<&'a str>) {
    for stmt in stmts {
        match &stmt.node {
            StmtKind::Template(children) => find_stmt_names(children, out),
            StmtKind::EmitRaw(_) => {}
            StmtKind::EmitExpr(expr) => find_expr_names(expr, out),
            StmtKind::ForLoop(for_loop) => {
                find_expr_names(&for_loop.iter, out);
                if let Some(filter_expr) = &for_loop.filter_expr {
                    find_expr_names(filter_expr, out);
                }
                find_stmt_names(&for_loop.body, out);
                find_stmt_names(&for_loop.else_body, out);
            }
            StmtKind::IfCond(if_cond) => {
                find_expr_names(&if_cond.expr, out);
                find_stmt_names(&if_cond.true_body, out);
                find_stmt_names(&if_cond.false_body, out);
            }
            StmtKind::WithBlock(with_block) => {
                for (_, expr) in &with_block.assignments {
                    find_expr_names(expr, out);
                }
                find_stmt_names(&with_block.body, out);
            }
            StmtKind::Set(set) => find_expr_names(&set.expr, out),
            StmtKind::SetBlock(set_block) => {
                if let Some(filter) = &set_block.filter {
                    find_expr_names(filter, out);
                }
                find_stmt_names(&set_block.body, out);
            }
            StmtKind::AutoEscape(auto_escape) => {
                find_expr_names(&auto_escape.enabled, out);
                find_stmt_names(&auto_escape.body, out);
            }
            StmtKind::FilterBlock(filter_block) => {
                find_expr_names(&filter_block.filter, out);
                find_stmt_names(&filter_block.body, out);
            }
            StmtKind::Block(block) => find_stmt_names(&block.body, out),
            StmtKind::Macro(macro_decl) => {
                for default in &macro_decl.defaults {
                    find_expr_names(default, out);
                }
                find_stmt_names(&macro_decl.body, out);
            }
            StmtKind::CallBlock(call_block) => {
                find_expr_names(&call_block.call, out);
                find_stmt_names(&call_block.macro_decl.body, out);
            }
            StmtKind::Do(do_stmt) => find_expr_names(&do_stmt.expr, out),
            StmtKind::Extends(extends) => find_expr_names(&extends.name, out),
            StmtKind::Include(include) => find_expr_names(&include.name, out),
            StmtKind::Import(import) => find_expr_names(&import.expr, out),
            StmtKind::FromImport(from_import) => find_expr_names(&from_import.expr, out),
        }
    }
}

fn find_expr_names<'a>(expr: &'a Expr, out: &mut BTreeSet<&'a str>) {
    match &expr.node {
        ExprKind::Var(name) => {
            out.insert(name);
        }
        ExprKind::Const(_) => {}
        ExprKind::UnaryOp { expr, .. } => find_expr_names(expr, out),
        ExprKind::BinaryOp { left, right, .. } => {
            find_expr_names(left, out);
            find_expr_names(right, out);
        }
        ExprKind::GetAttr { expr, .. } => find_expr_names(expr, out),
        ExprKind::GetItem { expr, subscript } => {
            find_expr_names(expr, out);
            find_expr_names(subscript, out);
        }
        ExprKind::Slice {
            expr,
            start,
            stop,
            step,
        } => {
            find_expr_names(expr, out);
            for part in [start, stop, step].into_iter().flatten() {
                find_expr_names(part, out);
            }
        }
        ExprKind::IfExpr {
            test,
            true_expr,
            false_expr,
        } => {
            find_expr_names(test, out);
            find_expr_names(true_expr, out);
            if let Some(false_expr) = false_expr {
                find_expr_names(false_expr, out);
            }
        }
        ExprKind::Filter { expr, args, .. } => {
            if let Some(expr) = expr {
                find_expr_names(expr, out);
            }
            for arg in args {
                find_expr_names(arg, out);
            }
        }
        ExprKind::Test { expr, args, .. } => {
            find_expr_names(expr, out);
            for arg in args {
                find_expr_names(arg, out);
            }
        }
        ExprKind::Call { expr, args } => {
            find_expr_names(expr, out);
            for arg in args {
                find_expr_names(arg, out);
            }
        }
        ExprKind::List(items) => {
            for item in items {
                find_expr_names(item, out);
            }
        }
        ExprKind::Map { keys, values } => {
            for expr in keys.iter().chain(values.iter()) {
                find_expr_names(expr, out);
            }
        }
        ExprKind::Kwargs(pairs) => {
            for (_, value) in pairs {
                find_expr_names(value, out);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    fn compile_source(source: &str) -> CompiledTemplate {
        compile(&parse(source).unwrap()).unwrap()
    }

    fn assert_jumps_patched(instructions: &Instructions) {
        for idx in 0..instructions.len() {
            if let Some(
                Instruction::Jump(t)
                | Instruction::JumpIfFalse(t)
                | Instruction::JumpIfFalseOrPop(t)
                | Instruction::JumpIfTrueOrPop(t)
                | Instruction::JumpIfIterated(t)
                | Instruction::Iterate(t),
            ) = instructions.get(idx)
            {
                assert!(*t <= instructions.len(), "unpatched jump at {idx}");
            }
        }
    }

    #[test]
    fn test_if_jumps_forward() {
        let compiled = compile_source("{% if a %}x{% endif %}");
        assert_jumps_patched(&compiled.instructions);
        match compiled.instructions.get(1) {
            Some(Instruction::JumpIfFalse(target)) => {
                assert_eq!(*target, compiled.instructions.len());
            }
            instr => panic!("unexpected instruction {instr:?}"),
        }
    }

    #[test]
    fn test_for_else_emits_iteration_check() {
        let compiled =
            compile_source("{% for x in items %}{{ x }}{% else %}empty{% endfor %}");
        assert_jumps_patched(&compiled.instructions);
        let mut found = false;
        for idx in 0..compiled.instructions.len() {
            if let Some(Instruction::JumpIfIterated(_)) = compiled.instructions.get(idx) {
                found = true;
            }
        }
        assert!(found);
    }

    #[test]
    fn test_loop_filter_pre_pass() {
        let compiled =
            compile_source("{% for x in items if x %}{{ x }}{% endfor %}");
        assert_jumps_patched(&compiled.instructions);
        let mut appends = 0;
        for idx in 0..compiled.instructions.len() {
            if let Some(Instruction::ListAppend) = compiled.instructions.get(idx) {
                appends += 1;
            }
        }
        assert_eq!(appends, 1);
    }

    #[test]
    fn test_loop_flags() {
        let compiled = compile_source("{% for x in items %}{{ x }}{% endfor %}");
        let mut flags = Vec::new();
        for idx in 0..compiled.instructions.len() {
            if let Some(Instruction::PushLoop(f)) = compiled.instructions.get(idx) {
                flags.push(*f);
            }
        }
        assert_eq!(flags, vec![LOOP_FLAG_WITH_LOOP_VAR]);
        assert_eq!(flags, vec![1]);

        let compiled =
            compile_source("{% for x in items recursive %}{{ loop(x) }}{% endfor %}");
        let mut flags = Vec::new();
        for idx in 0..compiled.instructions.len() {
            if let Some(Instruction::PushLoop(f)) = compiled.instructions.get(idx) {
                flags.push(*f);
            }
        }
        assert_eq!(flags, vec![LOOP_FLAG_WITH_LOOP_VAR | LOOP_FLAG_RECURSIVE]);
        assert_eq!(flags, vec![3]);
    }

    #[test]
    fn test_block_compiles_to_side_table() {
        let compiled = compile_source("{% block title %}Hello{% endblock %}");
        assert!(compiled.blocks.contains_key("title"));
        match compiled.instructions.get(0) {
            Some(Instruction::CallBlock(name)) => assert_eq!(name, "title"),
            instr => panic!("unexpected instruction {instr:?}"),
        }
    }

    #[test]
    fn test_duplicate_block_rejected() {
        let err = compile(
            &parse("{% block a %}{% endblock %}{% block a %}{% endblock %}").unwrap(),
        )
        .unwrap_err();
        assert!(err.message.contains("defined twice"));
    }

    #[test]
    fn test_macro_closure_names() {
        let compiled =
            compile_source("{% macro hi(name) %}{{ greeting }} {{ name }}{% endmacro %}");
        let mut decl = None;
        for idx in 0..compiled.instructions.len() {
            if let Some(Instruction::BuildMacro(found)) = compiled.instructions.get(idx) {
                decl = Some(found);
            }
        }
        let decl = decl.expect("macro instruction missing");
        assert_eq!(decl.arg_names, vec!["name"]);
        assert_eq!(decl.closure_names, vec!["greeting"]);
    }

    #[test]
    fn test_extends_rejected_without_loader() {
        let err = compile(&parse("{% extends \"base.html\" %}").unwrap()).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::InvalidOperation);
    }

    #[test]
    fn test_short_circuit_uses_peek_jumps() {
        let compiled = compile_source("{{ a and b }}");
        match compiled.instructions.get(1) {
            Some(Instruction::JumpIfFalseOrPop(_)) => {}
            instr => panic!("unexpected instruction {instr:?}"),
        }
    }

    #[test]
    fn test_filter_ids_are_shared() {
        let compiled = compile_source("{{ a | escape }}{{ b | escape }}");
        let mut ids = Vec::new();
        for idx in 0..compiled.instructions.len() {
            if let Some(Instruction::ApplyFilter(_, _, id)) = compiled.instructions.get(idx) {
                ids.push(*id);
            }
        }
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[0], ids[1]);
    }
}

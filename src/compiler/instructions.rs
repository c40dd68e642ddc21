//! The instruction set of the template virtual machine.

use std::fmt;
use std::sync::Arc;

use crate::ast::span::Span;
use crate::eval::output::CaptureMode;
use crate::value::Value;

/// Cache slot for filter and test lookups.
///
/// The first [`MAX_LOCALS`] distinct filter (and test) names used by a
/// template each get a slot; the VM memoizes the registry lookup per
/// slot. Names beyond the cap fall back to [`UNKNOWN_LOCAL`] and are
/// looked up every time.
pub type LocalId = u8;

pub const MAX_LOCALS: usize = 50;
pub const UNKNOWN_LOCAL: LocalId = !0;

/// Bit set on [`Instruction::PushLoop`] when the loop exposes the
/// `loop` variable. The iteration-filter pre-pass omits it so the
/// filter expression cannot observe a half-built loop.
pub const LOOP_FLAG_WITH_LOOP_VAR: u8 = 1;

/// Bit set on [`Instruction::PushLoop`] when the loop was declared
/// `recursive`.
pub const LOOP_FLAG_RECURSIVE: u8 = 2;

/// A macro declaration carried by [`Instruction::BuildMacro`].
///
/// The body is compiled separately and shared; default values for the
/// trailing parameters are evaluated at definition time and arrive on
/// the stack as a list.
#[derive(Debug)]
pub struct MacroDecl {
    pub name: String,
    pub arg_names: Vec<String>,
    /// Variables the body references; resolved at definition time into
    /// the macro's closure.
    pub closure_names: Vec<String>,
    /// Whether the body references `caller`, which makes the macro
    /// accept the implicit argument passed by `{% call %}` blocks.
    pub caller_reference: bool,
    pub body: Arc<Instructions>,
}

/// A single VM instruction.
#[derive(Debug)]
pub enum Instruction {
    /// Write a string of template data to the output verbatim.
    EmitRaw(String),
    /// Pop a value and write it through the active escape mode.
    Emit,
    /// Pop a value and bind it to a name in the current frame.
    StoreLocal(String),
    /// Push the value a name resolves to (undefined if missing).
    Lookup(String),
    /// Pop a value and push its named attribute.
    GetAttr(String),
    /// Pop a subscript and a value and push the element.
    GetItem,
    /// Pop step, stop, start, and a value; push the slice.
    Slice,
    /// Push a constant.
    LoadConst(Value),
    /// Pop 2×n values (alternating key, value) and push a map.
    BuildMap(usize),
    /// Pop 2×n values (alternating key, value) and push a kwargs map.
    BuildKwargs(usize),
    /// Pop n values and push a list.
    BuildList(usize),
    /// Pop a sequence of exactly n elements and push them so the first
    /// element ends up on top.
    UnpackList(usize),
    /// Pop a value and append it to the list below it.
    ListAppend,

    Add,
    Sub,
    Mul,
    Div,
    IntDiv,
    Rem,
    Pow,
    Neg,
    Not,
    StringConcat,
    In,
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,

    /// Unconditional jump.
    Jump(usize),
    /// Pop a value; jump if it is falsy.
    JumpIfFalse(usize),
    /// Peek at the top value; jump if falsy, otherwise pop it.
    JumpIfFalseOrPop(usize),
    /// Peek at the top value; jump if truthy, otherwise pop it.
    JumpIfTrueOrPop(usize),
    /// Jump if the innermost loop has produced at least one item.
    JumpIfIterated(usize),

    /// Pop a value and derive the escape mode from it.
    PushAutoEscape,
    PopAutoEscape,

    /// Redirect output into an in-memory capture buffer or a discard
    /// sink, depending on the mode.
    BeginCapture(CaptureMode),
    /// End the capture and push the buffered text as a value (undefined
    /// for discarding captures).
    EndCapture,

    /// Pop n values (input first pushed, kwargs last) and apply the
    /// named filter.
    ApplyFilter(String, usize, LocalId),
    /// Pop n values and perform the named test, pushing a boolean.
    PerformTest(String, usize, LocalId),
    /// Pop n arguments and call the named callable.
    CallFunction(String, usize),
    /// Pop n arguments and a receiver; invoke the named method.
    CallMethod(String, usize),
    /// Pop n arguments and a callable value; invoke it.
    CallObject(usize),
    /// Render the named template block in place.
    CallBlock(String),

    DupTop,
    DiscardTop,

    /// Pop an iterable and enter a loop frame around it.
    PushLoop(u8),
    /// Advance the innermost loop; push the next item or jump to the
    /// target when exhausted.
    Iterate(usize),
    /// Pop a list of default values and build a macro value.
    BuildMacro(Box<MacroDecl>),
    /// Enter a plain scope frame.
    PushWith,
    /// Leave the innermost frame (loop, with, or capture scope).
    PopFrame,
}

/// A compiled instruction buffer with source location side tables.
///
/// Lines and spans are run-length encoded: a record `(i, loc)` applies
/// to every instruction from index `i` up to the next record.
#[derive(Default)]
pub struct Instructions {
    ops: Vec<Instruction>,
    lines: Vec<(usize, u32)>,
    spans: Vec<(usize, Span)>,
}

impl Instructions {
    pub fn new() -> Instructions {
        Instructions::default()
    }

    /// Append an instruction and return its index.
    pub fn add(&mut self, instr: Instruction) -> usize {
        let rv = self.ops.len();
        self.ops.push(instr);
        rv
    }

    /// Append an instruction attributed to `span`.
    pub fn add_with_span(&mut self, instr: Instruction, span: Span) -> usize {
        let rv = self.add(instr);
        if self
            .lines
            .last()
            .map(|(_, line)| *line != span.start_line)
            .unwrap_or(true)
        {
            self.lines.push((rv, span.start_line));
        }
        if self
            .spans
            .last()
            .map(|(_, s)| *s != span)
            .unwrap_or(true)
        {
            self.spans.push((rv, span));
        }
        rv
    }

    pub fn get(&self, idx: usize) -> Option<&Instruction> {
        self.ops.get(idx)
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut Instruction> {
        self.ops.get_mut(idx)
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// The source line an instruction was generated from.
    pub fn get_line(&self, idx: usize) -> Option<u32> {
        match self.lines.binary_search_by_key(&idx, |(i, _)| *i) {
            Ok(pos) => Some(self.lines[pos].1),
            Err(0) => None,
            Err(pos) => Some(self.lines[pos - 1].1),
        }
    }

    /// The source span an instruction was generated from.
    pub fn get_span(&self, idx: usize) -> Option<Span> {
        match self.spans.binary_search_by_key(&idx, |(i, _)| *i) {
            Ok(pos) => Some(self.spans[pos].1),
            Err(0) => None,
            Err(pos) => Some(self.spans[pos - 1].1),
        }
    }
}

impl fmt::Debug for Instructions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut last_line = None;
        for (idx, instr) in self.ops.iter().enumerate() {
            let line = self.get_line(idx);
            if line != last_line {
                if let Some(line) = line {
                    writeln!(f, "  ; line {line}")?;
                }
                last_line = line;
            }
            writeln!(f, "{idx:>5} | {instr:?}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span_on_line(line: u32) -> Span {
        Span {
            start_line: line,
            start_col: 1,
            start_offset: 0,
            end_line: line,
            end_col: 2,
            end_offset: 1,
        }
    }

    #[test]
    fn test_line_lookup_is_run_length() {
        let mut instr = Instructions::new();
        instr.add_with_span(Instruction::Emit, span_on_line(1));
        instr.add_with_span(Instruction::Emit, span_on_line(1));
        instr.add_with_span(Instruction::Emit, span_on_line(3));
        assert_eq!(instr.get_line(0), Some(1));
        assert_eq!(instr.get_line(1), Some(1));
        assert_eq!(instr.get_line(2), Some(3));
        // only two records were stored
        assert_eq!(instr.lines.len(), 2);
    }

    #[test]
    fn test_debug_listing() {
        let mut instr = Instructions::new();
        instr.add_with_span(Instruction::Lookup("name".into()), span_on_line(1));
        instr.add_with_span(Instruction::Emit, span_on_line(1));
        let listing = format!("{instr:?}");
        assert!(listing.contains("; line 1"));
        assert!(listing.contains("Lookup(\"name\")"));
    }
}

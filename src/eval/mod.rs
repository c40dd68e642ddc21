//! The template virtual machine.
//!
//! Rendering executes compiled [`Instructions`] against an operand
//! stack and a [`Context`] of scope frames. The VM walks the buffer
//! with a program counter; jumps assign it directly. Errors that leave
//! the dispatch loop are annotated once with the template name and the
//! source location of the failing instruction.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;

use crate::compiler::instructions::{
    Instruction, LocalId, MacroDecl, LOOP_FLAG_RECURSIVE, LOOP_FLAG_WITH_LOOP_VAR, MAX_LOCALS,
};
use crate::compiler::Instructions;
use crate::environment::Environment;
use crate::error::{Error, ErrorKind};
use crate::eval::macros::{Closure, Macro};
use crate::eval::output::{CaptureMode, Output};
use crate::eval::state::{Context, Frame, LoopFrame, LoopState, RecursionJump};
use crate::registry::{Filter, Test};
use crate::utils::{write_escaped, AutoEscape};
use crate::value::{ops, Key, Value, ValueMap, ValueRepr};

pub(crate) mod macros;
pub(crate) mod output;
pub(crate) mod state;

// ── undefined behavior ──────────────────────────────────────────────

/// How the renderer reacts when an undefined value is used.
///
/// ```rust
/// use loomtex::{Environment, UndefinedBehavior, Value};
///
/// let mut env = Environment::new();
/// env.set_undefined_behavior(UndefinedBehavior::Strict);
/// assert!(env.render_str("{{ missing }}", Value::UNDEFINED).is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UndefinedBehavior {
    /// Undefined prints as empty and iterates as empty, but attribute
    /// access on an undefined value fails.
    #[default]
    Lenient,
    /// Like lenient, except attribute access on undefined yields
    /// undefined again, so `a.b.c` never fails partway.
    Chainable,
    /// Any use of an undefined value fails.
    Strict,
}

impl UndefinedBehavior {
    /// Resolve the result of an attribute or item access that came
    /// back undefined. `parent_undefined` tells whether the access
    /// went through an undefined receiver.
    pub(crate) fn handle_undefined(self, parent_undefined: bool) -> Result<Value, Error> {
        match (self, parent_undefined) {
            (UndefinedBehavior::Lenient, false) | (UndefinedBehavior::Chainable, _) => {
                Ok(Value::UNDEFINED)
            }
            (UndefinedBehavior::Lenient, true) | (UndefinedBehavior::Strict, _) => {
                Err(Error::undefined("undefined value"))
            }
        }
    }

    pub(crate) fn assert_iterable(self, value: &Value) -> Result<(), Error> {
        if matches!(self, UndefinedBehavior::Strict) && value.is_undefined() {
            return Err(Error::undefined("undefined value cannot be iterated"));
        }
        Ok(())
    }

    pub(crate) fn assert_printable(self, value: &Value) -> Result<(), Error> {
        if matches!(self, UndefinedBehavior::Strict) && value.is_undefined() {
            return Err(Error::undefined("undefined value cannot be printed"));
        }
        Ok(())
    }
}

// ── render state ────────────────────────────────────────────────────

/// The state of one render, visible to filters, tests, and objects.
pub struct State<'env> {
    pub(crate) env: &'env Environment,
    pub(crate) ctx: Context,
    pub(crate) auto_escape: AutoEscape,
    pub(crate) initial_auto_escape: AutoEscape,
    pub(crate) name: String,
    pub(crate) blocks: BTreeMap<String, Arc<Instructions>>,
    loaded_filters: Vec<Option<Arc<dyn Filter>>>,
    loaded_tests: Vec<Option<Arc<dyn Test>>>,
}

impl<'env> State<'env> {
    fn new(
        env: &'env Environment,
        ctx: Context,
        auto_escape: AutoEscape,
        name: &str,
        blocks: BTreeMap<String, Arc<Instructions>>,
    ) -> State<'env> {
        State {
            env,
            ctx,
            auto_escape,
            initial_auto_escape: auto_escape,
            name: name.to_string(),
            blocks,
            loaded_filters: vec![None; MAX_LOCALS],
            loaded_tests: vec![None; MAX_LOCALS],
        }
    }

    /// The environment this render runs against.
    pub fn env(&self) -> &Environment {
        self.env
    }

    /// The name of the template being rendered.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The escape mode at the current point of the render.
    pub fn auto_escape(&self) -> AutoEscape {
        self.auto_escape
    }

    pub fn undefined_behavior(&self) -> UndefinedBehavior {
        self.env.undefined_behavior()
    }

    /// Resolve a variable the way the template would.
    pub fn lookup(&self, name: &str) -> Option<Value> {
        self.ctx.load(name).or_else(|| self.env.get_global(name))
    }
}

impl std::fmt::Debug for State<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("State")
            .field("name", &self.name)
            .field("auto_escape", &self.auto_escape)
            .field("ctx", &self.ctx)
            .finish()
    }
}

// ── operand stack ───────────────────────────────────────────────────

#[derive(Default, Debug)]
struct Stack {
    values: Vec<Value>,
}

impl Stack {
    fn push(&mut self, value: Value) {
        self.values.push(value);
    }

    fn pop(&mut self) -> Value {
        match self.values.pop() {
            Some(value) => value,
            None => unreachable!("operand stack underflow"),
        }
    }

    fn peek(&self) -> &Value {
        match self.values.last() {
            Some(value) => value,
            None => unreachable!("operand stack underflow"),
        }
    }

    /// Remove and return the top `n` values in push order.
    fn pop_n(&mut self, n: usize) -> Vec<Value> {
        self.values.split_off(self.values.len() - n)
    }
}

// ── the vm ──────────────────────────────────────────────────────────

pub(crate) struct Vm<'env> {
    env: &'env Environment,
}

impl<'env> Vm<'env> {
    pub fn new(env: &'env Environment) -> Vm<'env> {
        Vm { env }
    }

    /// Run an instruction buffer against a fresh context rooted on
    /// `root`. Returns the value left on the operand stack, if any
    /// (compiled expressions end with exactly one).
    pub fn eval(
        &self,
        instructions: &Instructions,
        blocks: &BTreeMap<String, Arc<Instructions>>,
        root: Value,
        out: &mut Output<'_>,
        auto_escape: AutoEscape,
        name: &str,
    ) -> Result<Option<Value>, Error> {
        let mut state = State::new(
            self.env,
            Context::new(Frame::new(root)),
            auto_escape,
            name,
            blocks.clone(),
        );
        self.eval_state(&mut state, instructions, out)
    }

    /// Evaluate with an existing state, annotating any escaping error
    /// with the location of the failing instruction.
    fn eval_state(
        &self,
        state: &mut State<'env>,
        instructions: &Instructions,
        out: &mut Output<'_>,
    ) -> Result<Option<Value>, Error> {
        let mut pc = 0;
        self.eval_impl(state, instructions, out, &mut pc)
            .map_err(|mut err| {
                if err.needs_location() {
                    err.set_location(
                        &state.name,
                        instructions.get_line(pc).unwrap_or(0),
                        instructions.get_span(pc),
                    );
                }
                err
            })
    }

    fn eval_impl(
        &self,
        state: &mut State<'env>,
        instructions: &Instructions,
        out: &mut Output<'_>,
        pc: &mut usize,
    ) -> Result<Option<Value>, Error> {
        let behavior = state.undefined_behavior();
        let mut stack = Stack::default();
        let mut auto_escape_stack = Vec::new();
        // armed by `loop(...)` recursion, consumed by the next PushLoop
        let mut next_recursion_jump: Option<RecursionJump> = None;

        macro_rules! binop {
            ($op:ident) => {{
                let rhs = stack.pop();
                let lhs = stack.pop();
                stack.push(ops::$op(&lhs, &rhs)?);
            }};
        }

        macro_rules! cmpop {
            ($method:ident) => {{
                let rhs = stack.pop();
                let lhs = stack.pop();
                stack.push(Value::from(ops::total_cmp(&lhs, &rhs).$method()));
            }};
        }

        while let Some(instr) = instructions.get(*pc) {
            match instr {
                Instruction::EmitRaw(text) => {
                    out.write_str(text)?;
                }
                Instruction::Emit => {
                    let value = stack.pop();
                    behavior.assert_printable(&value)?;
                    if let ValueRepr::Invalid(detail) = &value.0 {
                        return Err(Error::new(
                            ErrorKind::BadSerialization,
                            detail.to_string(),
                        ));
                    }
                    write_escaped(out, state.auto_escape, &value)?;
                }
                Instruction::StoreLocal(name) => {
                    let value = stack.pop();
                    state.ctx.store(name, value);
                }
                Instruction::Lookup(name) => {
                    stack.push(state.lookup(name).unwrap_or(Value::UNDEFINED));
                }
                Instruction::GetAttr(name) => {
                    let value = stack.pop();
                    let attr = value.get_attr(name)?;
                    if attr.is_undefined() {
                        stack.push(behavior.handle_undefined(value.is_undefined())?);
                    } else {
                        stack.push(attr);
                    }
                }
                Instruction::GetItem => {
                    let key = stack.pop();
                    let value = stack.pop();
                    let item = value.get_item(&key)?;
                    if item.is_undefined() {
                        stack.push(behavior.handle_undefined(value.is_undefined())?);
                    } else {
                        stack.push(item);
                    }
                }
                Instruction::Slice => {
                    let step = stack.pop();
                    let stop = stack.pop();
                    let start = stack.pop();
                    let value = stack.pop();
                    if value.is_undefined() {
                        stack.push(behavior.handle_undefined(true)?);
                    } else {
                        stack.push(ops::slice(&value, start, stop, step)?);
                    }
                }
                Instruction::LoadConst(value) => {
                    stack.push(value.clone());
                }
                Instruction::BuildMap(pair_count) => {
                    let mut map = ValueMap::with_capacity(*pair_count);
                    let mut items = stack.pop_n(pair_count * 2).into_iter();
                    while let (Some(key), Some(value)) = (items.next(), items.next()) {
                        map.insert(Key::from_value(key), value);
                    }
                    stack.push(Value::from(map));
                }
                Instruction::BuildKwargs(pair_count) => {
                    let mut map = ValueMap::with_capacity(*pair_count);
                    let mut items = stack.pop_n(pair_count * 2).into_iter();
                    while let (Some(key), Some(value)) = (items.next(), items.next()) {
                        map.insert(Key::from_value(key), value);
                    }
                    stack.push(Value::from_kwargs(map));
                }
                Instruction::BuildList(count) => {
                    let items = stack.pop_n(*count);
                    stack.push(Value::from(items));
                }
                Instruction::UnpackList(count) => {
                    let value = stack.pop();
                    let items: Vec<Value> = value
                        .try_iter()
                        .map_err(|_| {
                            Error::new(
                                ErrorKind::CannotUnpack,
                                format!("cannot unpack {}", value.type_name()),
                            )
                        })?
                        .collect();
                    if items.len() != *count {
                        return Err(Error::new(
                            ErrorKind::CannotUnpack,
                            format!(
                                "tried to unpack {count} values, found {}",
                                items.len()
                            ),
                        ));
                    }
                    for item in items.into_iter().rev() {
                        stack.push(item);
                    }
                }
                Instruction::ListAppend => {
                    let value = stack.pop();
                    let mut list = stack.pop();
                    match &mut list.0 {
                        ValueRepr::Seq(items) => {
                            Arc::make_mut(items).push(value);
                            stack.push(list);
                        }
                        _ => {
                            return Err(Error::invalid_op(
                                "cannot append to a non-sequence",
                            ))
                        }
                    }
                }
                Instruction::Add => binop!(add),
                Instruction::Sub => binop!(sub),
                Instruction::Mul => binop!(mul),
                Instruction::Div => binop!(div),
                Instruction::IntDiv => binop!(int_div),
                Instruction::Rem => binop!(rem),
                Instruction::Pow => binop!(pow),
                Instruction::Neg => {
                    let value = stack.pop();
                    stack.push(ops::neg(&value)?);
                }
                Instruction::Not => {
                    let value = stack.pop();
                    stack.push(Value::from(!value.is_true()));
                }
                Instruction::StringConcat => {
                    let rhs = stack.pop();
                    let lhs = stack.pop();
                    stack.push(ops::string_concat(&lhs, &rhs));
                }
                Instruction::In => {
                    let container = stack.pop();
                    let needle = stack.pop();
                    behavior.assert_iterable(&container)?;
                    stack.push(ops::contains(&container, &needle)?);
                }
                Instruction::Eq => cmpop!(is_eq),
                Instruction::Ne => cmpop!(is_ne),
                Instruction::Lt => cmpop!(is_lt),
                Instruction::Lte => cmpop!(is_le),
                Instruction::Gt => cmpop!(is_gt),
                Instruction::Gte => cmpop!(is_ge),
                Instruction::Jump(target) => {
                    *pc = *target;
                    continue;
                }
                Instruction::JumpIfFalse(target) => {
                    if !stack.pop().is_true() {
                        *pc = *target;
                        continue;
                    }
                }
                Instruction::JumpIfFalseOrPop(target) => {
                    if !stack.peek().is_true() {
                        *pc = *target;
                        continue;
                    }
                    stack.pop();
                }
                Instruction::JumpIfTrueOrPop(target) => {
                    if stack.peek().is_true() {
                        *pc = *target;
                        continue;
                    }
                    stack.pop();
                }
                Instruction::JumpIfIterated(target) => {
                    let Some(l) = state.ctx.current_loop() else {
                        unreachable!("loop check outside loop frame");
                    };
                    if l.state.has_iterated() {
                        *pc = *target;
                        continue;
                    }
                }
                Instruction::PushAutoEscape => {
                    let value = stack.pop();
                    auto_escape_stack.push(state.auto_escape);
                    state.auto_escape =
                        derive_auto_escape(value, state.initial_auto_escape)?;
                }
                Instruction::PopAutoEscape => {
                    state.auto_escape =
                        auto_escape_stack.pop().unwrap_or(state.initial_auto_escape);
                }
                Instruction::BeginCapture(mode) => {
                    out.begin_capture(*mode);
                }
                Instruction::EndCapture => {
                    stack.push(out.end_capture(state.auto_escape));
                }
                Instruction::ApplyFilter(name, arg_count, local_id) => {
                    let filter = get_or_load_filter(state, name, *local_id)?;
                    let args = stack.pop_n(*arg_count);
                    stack.push(filter.apply(state, &args)?);
                }
                Instruction::PerformTest(name, arg_count, local_id) => {
                    let test = get_or_load_test(state, name, *local_id)?;
                    let args = stack.pop_n(*arg_count);
                    stack.push(Value::from(test.perform(state, &args)?));
                }
                Instruction::CallFunction(name, arg_count) => {
                    if name == "loop" {
                        // `loop(x)` re-enters the enclosing recursive
                        // loop; the argument stays on the stack as the
                        // operand of the PushLoop we jump back to.
                        if *arg_count != 1 {
                            return Err(Error::invalid_op(
                                "loop() takes exactly one argument",
                            ));
                        }
                        let target = prepare_loop_recursion(state)?;
                        next_recursion_jump = Some(RecursionJump {
                            target: *pc + 1,
                            end_capture: true,
                        });
                        out.begin_capture(CaptureMode::Capture);
                        *pc = target;
                        continue;
                    }
                    let callable = state.lookup(name).ok_or_else(|| {
                        Error::undefined(format!("{name} is unknown"))
                    })?;
                    let args = stack.pop_n(*arg_count);
                    stack.push(call_value(&callable, state, &args)?);
                }
                Instruction::CallMethod(name, arg_count) => {
                    let args = stack.pop_n(*arg_count);
                    let receiver = stack.pop();
                    stack.push(call_method(&receiver, state, name, &args)?);
                }
                Instruction::CallObject(arg_count) => {
                    let args = stack.pop_n(*arg_count);
                    let callable = stack.pop();
                    stack.push(call_value(&callable, state, &args)?);
                }
                Instruction::CallBlock(name) => {
                    let body = match state.blocks.get(name) {
                        Some(body) => body.clone(),
                        None => unreachable!("block {name} missing from side table"),
                    };
                    state.ctx.push_frame(Frame::default())?;
                    // blocks have their own filter/test id space
                    let outer_filters =
                        std::mem::replace(&mut state.loaded_filters, vec![None; MAX_LOCALS]);
                    let outer_tests =
                        std::mem::replace(&mut state.loaded_tests, vec![None; MAX_LOCALS]);
                    let rv = self.eval_state(state, &body, out);
                    state.loaded_filters = outer_filters;
                    state.loaded_tests = outer_tests;
                    state.ctx.pop_frame();
                    rv?;
                }
                Instruction::DupTop => {
                    stack.push(stack.peek().clone());
                }
                Instruction::DiscardTop => {
                    stack.pop();
                }
                Instruction::PushLoop(flags) => {
                    let iterable = stack.pop();
                    behavior.assert_iterable(&iterable)?;
                    let mut iter = iterable.try_iter()?;
                    let depth = state
                        .ctx
                        .current_loop()
                        .filter(|l| l.recurse_jump_target.is_some())
                        .map_or(0, |l| l.state.depth0() + 1);
                    let recursive = flags & LOOP_FLAG_RECURSIVE != 0;
                    let loop_state = Arc::new(LoopState::new(iter.len(), depth));
                    loop_state.prime(&mut iter);
                    state.ctx.push_frame(Frame {
                        current_loop: Some(LoopFrame {
                            iter,
                            state: loop_state,
                            with_loop_var: flags & LOOP_FLAG_WITH_LOOP_VAR != 0,
                            recurse_jump_target: recursive.then_some(*pc),
                            current_recursion_jump: next_recursion_jump.take(),
                        }),
                        ..Frame::default()
                    })?;
                }
                Instruction::Iterate(target) => {
                    let Some(LoopFrame { iter, state: l, .. }) = state.ctx.current_loop()
                    else {
                        unreachable!("iteration outside loop frame");
                    };
                    match l.advance(iter) {
                        Some(item) => stack.push(item),
                        None => {
                            *pc = *target;
                            continue;
                        }
                    }
                }
                Instruction::BuildMacro(decl) => {
                    let macro_value = self.build_macro(state, &mut stack, decl);
                    stack.push(macro_value);
                }
                Instruction::PushWith => {
                    state.ctx.push_frame(Frame::default())?;
                }
                Instruction::PopFrame => {
                    if let Some(mut l) = state.ctx.pop_frame().current_loop {
                        if let Some(jump) = l.current_recursion_jump.take() {
                            if jump.end_capture {
                                stack.push(out.end_capture(state.auto_escape));
                            }
                            *pc = jump.target;
                            continue;
                        }
                    }
                }
            }
            *pc += 1;
        }

        Ok(stack.values.pop())
    }

    /// Build a macro value, capturing the declaring frame's closure.
    fn build_macro(&self, state: &mut State<'env>, stack: &mut Stack, decl: &MacroDecl) -> Value {
        let closure = match &state.ctx.current_frame_mut().closure {
            Some(closure) => closure.clone(),
            None => {
                let closure = Closure::new();
                state.ctx.current_frame_mut().closure = Some(closure.clone());
                closure
            }
        };
        for name in &decl.closure_names {
            closure.store(name, state.lookup(name).unwrap_or(Value::UNDEFINED));
        }
        let defaults = match stack.pop().0 {
            ValueRepr::Seq(items) => items.as_ref().clone(),
            _ => Vec::new(),
        };
        Value::from_object(Macro {
            name: decl.name.clone(),
            arg_names: decl.arg_names.clone(),
            defaults,
            closure,
            body: decl.body.clone(),
            caller_reference: decl.caller_reference,
        })
    }
}

// ── helpers ─────────────────────────────────────────────────────────

fn derive_auto_escape(value: Value, initial: AutoEscape) -> Result<AutoEscape, Error> {
    if let Some(s) = value.as_str() {
        return match s {
            "html" => Ok(AutoEscape::Html),
            "json" => Ok(AutoEscape::Json),
            "none" => Ok(AutoEscape::None),
            _ => Err(Error::invalid_op("invalid value to autoescape tag")),
        };
    }
    match value.0 {
        ValueRepr::Bool(true) => Ok(if initial.is_none() {
            AutoEscape::Html
        } else {
            initial
        }),
        ValueRepr::Bool(false) => Ok(AutoEscape::None),
        _ => Err(Error::invalid_op("invalid value to autoescape tag")),
    }
}

fn prepare_loop_recursion(state: &mut State<'_>) -> Result<usize, Error> {
    match state.ctx.current_loop() {
        Some(l) => l.recurse_jump_target.ok_or_else(|| {
            Error::invalid_op("cannot recurse outside of recursive loop")
        }),
        None => Err(Error::invalid_op("cannot recurse outside of loop")),
    }
}

fn get_or_load_filter(
    state: &mut State<'_>,
    name: &str,
    local_id: LocalId,
) -> Result<Arc<dyn Filter>, Error> {
    let slot = local_id as usize;
    if slot < MAX_LOCALS {
        if let Some(filter) = &state.loaded_filters[slot] {
            return Ok(filter.clone());
        }
    }
    let filter = state
        .env
        .get_filter(name)
        .ok_or_else(|| Error::unknown_filter(name))?;
    if slot < MAX_LOCALS {
        state.loaded_filters[slot] = Some(filter.clone());
    }
    Ok(filter)
}

fn get_or_load_test(
    state: &mut State<'_>,
    name: &str,
    local_id: LocalId,
) -> Result<Arc<dyn Test>, Error> {
    let slot = local_id as usize;
    if slot < MAX_LOCALS {
        if let Some(test) = &state.loaded_tests[slot] {
            return Ok(test.clone());
        }
    }
    let test = state
        .env
        .get_test(name)
        .ok_or_else(|| Error::unknown_test(name))?;
    if slot < MAX_LOCALS {
        state.loaded_tests[slot] = Some(test.clone());
    }
    Ok(test)
}

/// Invoke a value as a function.
pub(crate) fn call_value(value: &Value, state: &State, args: &[Value]) -> Result<Value, Error> {
    match value.as_object() {
        Some(obj) => obj.call(state, args),
        None => Err(Error::invalid_op(format!(
            "value of type {} is not callable",
            value.type_name()
        ))),
    }
}

/// Invoke `receiver.name(args)`.
fn call_method(
    receiver: &Value,
    state: &State,
    name: &str,
    args: &[Value],
) -> Result<Value, Error> {
    if let Some(obj) = receiver.as_object() {
        return obj.call_method(state, name, args);
    }
    if matches!(receiver.0, ValueRepr::Map(..)) {
        let attr = receiver.get_attr(name)?;
        if !attr.is_undefined() {
            return call_value(&attr, state, args);
        }
    }
    Err(Error::new(
        ErrorKind::UnknownMethod,
        format!(
            "{} has no method named {name}",
            receiver.type_name()
        ),
    ))
}

/// Invoke a macro: bind arguments, evaluate the body against the
/// captured closure, and collect the output into a string value.
pub(crate) fn call_macro(
    macro_decl: &Macro,
    state: &State<'_>,
    args: &[Value],
) -> Result<Value, Error> {
    let (args, kwargs) = match args.last() {
        Some(last) if last.is_kwargs() => (&args[..args.len() - 1], Some(last.clone())),
        _ => (args, None),
    };
    if args.len() > macro_decl.arg_names.len() {
        return Err(Error::too_many_arguments());
    }

    let mut frame = Frame::new(Value::from(macro_decl.closure.clone_values()));
    let mut kwargs_used = 0;
    let defaults_offset = macro_decl.arg_names.len() - macro_decl.defaults.len();
    for (idx, name) in macro_decl.arg_names.iter().enumerate() {
        let kwarg = kwargs
            .as_ref()
            .map(|kw| kw.get_attr(name))
            .transpose()?
            .filter(|value| !value.is_undefined());
        let value = if idx < args.len() {
            if kwarg.is_some() {
                return Err(Error::new(
                    ErrorKind::TooManyArguments,
                    format!("duplicate argument {name}"),
                ));
            }
            args[idx].clone()
        } else if let Some(value) = kwarg {
            kwargs_used += 1;
            value
        } else if idx >= defaults_offset {
            macro_decl.defaults[idx - defaults_offset].clone()
        } else {
            Value::UNDEFINED
        };
        frame.locals.insert(name.clone(), value);
    }

    if macro_decl.caller_reference {
        let caller = kwargs
            .as_ref()
            .map(|kw| kw.get_attr("caller"))
            .transpose()?
            .unwrap_or(Value::UNDEFINED);
        if !caller.is_undefined() {
            kwargs_used += 1;
        }
        frame.locals.insert("caller".to_string(), caller);
    }

    if let Some(kwargs) = &kwargs {
        if let Some(count) = kwargs.len() {
            if count > kwargs_used {
                for key in kwargs.try_iter()? {
                    let name = key.as_str().unwrap_or_default();
                    let known = macro_decl.arg_names.iter().any(|arg| arg == name)
                        || (macro_decl.caller_reference && name == "caller");
                    if !known {
                        return Err(Error::new(
                            ErrorKind::TooManyArguments,
                            format!("unknown keyword argument {name}"),
                        ));
                    }
                }
            }
        }
    }

    let mut buf = String::new();
    let mut out = Output::new(&mut buf);
    let mut nested = State::new(
        state.env,
        Context::new_with_depth(frame, state.ctx.depth()),
        state.auto_escape,
        &state.name,
        state.blocks.clone(),
    );
    Vm::new(state.env).eval_state(&mut nested, &macro_decl.body, &mut out)?;

    Ok(if state.auto_escape.is_none() {
        Value::from(buf)
    } else {
        Value::from_safe_string(buf)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_auto_escape() {
        assert_eq!(
            derive_auto_escape(Value::from("html"), AutoEscape::None).unwrap(),
            AutoEscape::Html
        );
        assert_eq!(
            derive_auto_escape(Value::from(true), AutoEscape::None).unwrap(),
            AutoEscape::Html
        );
        assert_eq!(
            derive_auto_escape(Value::from(true), AutoEscape::Json).unwrap(),
            AutoEscape::Json
        );
        assert_eq!(
            derive_auto_escape(Value::from(false), AutoEscape::Html).unwrap(),
            AutoEscape::None
        );
        assert!(derive_auto_escape(Value::from(42), AutoEscape::None).is_err());
    }

    #[test]
    fn test_undefined_behavior_matrix() {
        // attribute access on a defined parent that lacks the field
        assert!(UndefinedBehavior::Lenient.handle_undefined(false).is_ok());
        assert!(UndefinedBehavior::Chainable.handle_undefined(false).is_ok());
        assert!(UndefinedBehavior::Strict.handle_undefined(false).is_err());
        // attribute access through an undefined parent
        assert!(UndefinedBehavior::Lenient.handle_undefined(true).is_err());
        assert!(UndefinedBehavior::Chainable.handle_undefined(true).is_ok());
        assert!(UndefinedBehavior::Strict.handle_undefined(true).is_err());
    }
}

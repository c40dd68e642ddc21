//! Runtime scope and loop bookkeeping.
//!
//! The renderer's [`Context`] is a stack of [`Frame`]s. Each frame
//! carries its own locals, a context value inherited lookups fall back
//! to, an optional loop in progress, and an optional closure that
//! mirrors assignments for macros declared in the frame.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{Error, ErrorKind};
use crate::eval::macros::Closure;
use crate::eval::State;
use crate::value::{Object, ObjectKind, StructObject, Value, ValueIter};

/// Upper bound on `outer_depth + frame_count` before rendering fails
/// with a recursion error.
const MAX_CONTEXT_DEPTH: usize = 500;

// ── frames ──────────────────────────────────────────────────────────

#[derive(Default)]
pub(crate) struct Frame {
    pub locals: HashMap<String, Value>,
    /// Lookups that miss the locals fall through to this value's
    /// attributes. Only the bottom frame and macro frames set it.
    pub ctx: Value,
    pub current_loop: Option<LoopFrame>,
    /// Present while a macro declaration in this frame can still
    /// observe assignments.
    pub closure: Option<Closure>,
}

impl Frame {
    pub fn new(ctx: Value) -> Frame {
        Frame {
            ctx,
            ..Frame::default()
        }
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("locals", &self.locals)
            .field("ctx", &self.ctx)
            .finish()
    }
}

pub(crate) struct LoopFrame {
    pub iter: ValueIter,
    pub state: Arc<LoopState>,
    /// Whether `loop` resolves inside this frame.
    pub with_loop_var: bool,
    /// Instruction index to re-enter for `loop(...)` recursion, set
    /// when the loop was declared `recursive`.
    pub recurse_jump_target: Option<usize>,
    /// Where to resume after the current recursive invocation
    /// finishes its frame.
    pub current_recursion_jump: Option<RecursionJump>,
}

pub(crate) struct RecursionJump {
    pub target: usize,
    pub end_capture: bool,
}

// ── the context stack ───────────────────────────────────────────────

/// The scope stack of one render.
pub(crate) struct Context {
    stack: Vec<Frame>,
    outer_depth: usize,
}

impl Context {
    /// Create a context rooted on the given frame.
    pub fn new(root: Frame) -> Context {
        Context {
            stack: vec![root],
            outer_depth: 0,
        }
    }

    /// Create a context for a nested render (macro call, block) that
    /// already consumed `outer_depth` levels.
    pub fn new_with_depth(root: Frame, outer_depth: usize) -> Context {
        Context {
            stack: vec![root],
            outer_depth,
        }
    }

    pub fn depth(&self) -> usize {
        self.outer_depth + self.stack.len()
    }

    pub fn push_frame(&mut self, frame: Frame) -> Result<(), Error> {
        if self.depth() >= MAX_CONTEXT_DEPTH {
            return Err(Error::new(
                ErrorKind::InvalidOperation,
                "recursion limit exceeded",
            ));
        }
        self.stack.push(frame);
        Ok(())
    }

    pub fn pop_frame(&mut self) -> Frame {
        // the bottom frame is never popped by compiled code
        self.stack.pop().unwrap_or_default()
    }

    /// Bind a name in the innermost frame, mirroring it into the
    /// frame's closure if one is attached.
    pub fn store(&mut self, name: &str, value: Value) {
        let frame = self.stack.last_mut().unwrap_or_else(|| unreachable!());
        if let Some(closure) = &frame.closure {
            closure.store(name, value.clone());
        }
        frame.locals.insert(name.to_string(), value);
    }

    /// Resolve a name against the frames, innermost first. Returns
    /// `None` on a full miss so the caller can consult the globals.
    pub fn load(&self, name: &str) -> Option<Value> {
        for frame in self.stack.iter().rev() {
            if let Some(value) = frame.locals.get(name) {
                return Some(value.clone());
            }
            if name == "loop" {
                if let Some(l) = &frame.current_loop {
                    if l.with_loop_var {
                        return Some(Value::from_object_arc(l.state.clone()));
                    }
                }
            }
            if !frame.ctx.is_undefined() {
                if let Ok(value) = frame.ctx.get_attr(name) {
                    if !value.is_undefined() {
                        return Some(value);
                    }
                }
            }
        }
        None
    }

    /// The innermost loop on the stack, if any.
    pub fn current_loop(&mut self) -> Option<&mut LoopFrame> {
        self.stack
            .iter_mut()
            .rev()
            .find_map(|frame| frame.current_loop.as_mut())
    }

    pub fn current_frame_mut(&mut self) -> &mut Frame {
        self.stack.last_mut().unwrap_or_else(|| unreachable!())
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.stack.iter()).finish()
    }
}

// ── loop state ──────────────────────────────────────────────────────

/// The object the `loop` variable resolves to inside a `for` block.
///
/// Interior mutability lets the value handed out on one iteration
/// observe the advance of later iterations, matching the reference
/// semantics templates expect from `loop`.
pub(crate) struct LoopState {
    /// Items produced so far; the current item has `index0 == idx - 1`.
    idx: AtomicUsize,
    len: usize,
    depth: usize,
    value_triple: Mutex<(Option<Value>, Option<Value>, Option<Value>)>,
    last_changed_value: Mutex<Option<Vec<Value>>>,
}

impl LoopState {
    pub fn new(len: usize, depth: usize) -> LoopState {
        LoopState {
            idx: AtomicUsize::new(0),
            len,
            depth,
            value_triple: Mutex::new((None, None, None)),
            last_changed_value: Mutex::new(None),
        }
    }

    pub fn depth0(&self) -> usize {
        self.depth
    }

    /// Whether the loop has produced at least one item, which decides
    /// between the body having run and the `else` branch.
    pub fn has_iterated(&self) -> bool {
        self.idx.load(Ordering::Relaxed) > 0
    }

    fn index0(&self) -> usize {
        self.idx.load(Ordering::Relaxed).saturating_sub(1)
    }

    /// Shift the lookahead triple and pull the next item from `iter`.
    /// Returns the item that becomes current, or `None` when the loop
    /// is exhausted.
    pub fn advance(&self, iter: &mut ValueIter) -> Option<Value> {
        let mut triple = lock(&self.value_triple);
        triple.0 = triple.1.take();
        triple.1 = triple.2.take();
        triple.2 = iter.next();
        match &triple.1 {
            Some(value) => {
                self.idx.fetch_add(1, Ordering::Relaxed);
                Some(value.clone())
            }
            None => None,
        }
    }

    /// Prime the triple so the first `advance` yields the first item.
    pub fn prime(&self, iter: &mut ValueIter) {
        let mut triple = lock(&self.value_triple);
        triple.2 = iter.next();
    }
}

impl fmt::Debug for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("LoopState");
        for field in StructObject::fields(self) {
            if let Some(value) = self.get_field(&field) {
                s.field(&field, &value);
            }
        }
        s.finish()
    }
}

impl Object for LoopState {
    fn kind(&self) -> ObjectKind<'_> {
        ObjectKind::Struct(self)
    }

    fn call_method(&self, _state: &State, name: &str, args: &[Value]) -> Result<Value, Error> {
        match name {
            "changed" => {
                let mut last = lock(&self.last_changed_value);
                if last.as_deref() != Some(args) {
                    *last = Some(args.to_vec());
                    Ok(Value::from(true))
                } else {
                    Ok(Value::from(false))
                }
            }
            "cycle" => {
                if args.is_empty() {
                    return Err(Error::new(
                        ErrorKind::InvalidOperation,
                        "cycle requires at least one argument",
                    ));
                }
                Ok(args[self.index0() % args.len()].clone())
            }
            _ => Err(Error::new(
                ErrorKind::UnknownMethod,
                format!("loop object has no method named {name}"),
            )),
        }
    }
}

impl StructObject for LoopState {
    fn get_field(&self, name: &str) -> Option<Value> {
        let index0 = self.index0();
        Some(match name {
            "index0" => Value::from(index0),
            "index" => Value::from(index0 + 1),
            "len" => Value::from(self.len),
            "revindex" => Value::from(self.len.saturating_sub(index0)),
            "revindex0" => Value::from(self.len.saturating_sub(index0 + 1)),
            "first" => Value::from(index0 == 0),
            "last" => Value::from(lock(&self.value_triple).2.is_none()),
            "depth" => Value::from(self.depth + 1),
            "depth0" => Value::from(self.depth),
            "previtem" => lock(&self.value_triple).0.clone().unwrap_or_default(),
            "nextitem" => lock(&self.value_triple).2.clone().unwrap_or_default(),
            _ => return None,
        })
    }

    fn fields(&self) -> Vec<Arc<str>> {
        [
            "index0",
            "index",
            "len",
            "revindex",
            "revindex0",
            "first",
            "last",
            "depth",
            "depth0",
            "previtem",
            "nextitem",
        ]
        .into_iter()
        .map(Arc::from)
        .collect()
    }
}

/// Acquire a mutex even when a previous panic poisoned it; the loop
/// state stays structurally valid either way.
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loop_state_walks_the_triple() {
        let seq = Value::from(vec![10, 20, 30]);
        let mut iter = seq.try_iter().unwrap();
        let state = LoopState::new(iter.len(), 0);
        state.prime(&mut iter);

        assert_eq!(state.advance(&mut iter), Some(Value::from(10)));
        assert_eq!(state.get_field("first"), Some(Value::from(true)));
        assert_eq!(state.get_field("previtem"), Some(Value::UNDEFINED));
        assert_eq!(state.get_field("nextitem"), Some(Value::from(20)));

        assert_eq!(state.advance(&mut iter), Some(Value::from(20)));
        assert_eq!(state.get_field("index"), Some(Value::from(2)));
        assert_eq!(state.get_field("revindex"), Some(Value::from(2)));
        assert_eq!(state.get_field("last"), Some(Value::from(false)));

        assert_eq!(state.advance(&mut iter), Some(Value::from(30)));
        assert_eq!(state.get_field("last"), Some(Value::from(true)));
        assert_eq!(state.advance(&mut iter), None);
    }

    #[test]
    fn test_lookup_prefers_inner_frames() {
        let root = Value::from_iter([("name", Value::from("outer"))]);
        let mut ctx = Context::new(Frame::new(root));
        assert_eq!(ctx.load("name"), Some(Value::from("outer")));

        ctx.push_frame(Frame::default()).unwrap();
        ctx.store("name", Value::from("inner"));
        assert_eq!(ctx.load("name"), Some(Value::from("inner")));

        ctx.pop_frame();
        assert_eq!(ctx.load("name"), Some(Value::from("outer")));
        assert_eq!(ctx.load("missing"), None);
    }

    #[test]
    fn test_depth_limit() {
        let mut ctx = Context::new(Frame::default());
        let mut failed = false;
        for _ in 0..600 {
            if ctx.push_frame(Frame::default()).is_err() {
                failed = true;
                break;
            }
        }
        assert!(failed, "depth limit should trip before 600 frames");
    }
}

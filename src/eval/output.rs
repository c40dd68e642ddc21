//! The output abstraction the renderer writes through.
//!
//! An [`Output`] wraps a [`fmt::Write`] target and layers a stack of
//! in-memory capture buffers over it. While a capture is active all
//! writes land in the innermost buffer instead of the real target;
//! ending the capture yields the buffered text as a value. Captures
//! back `{% set %}` blocks, `{% filter %}` blocks, and recursive loop
//! rendering. A capture can also discard, in which case writes are
//! swallowed until the capture ends.

use std::fmt;
use std::io;

use crate::utils::AutoEscape;
use crate::value::Value;

/// How an active capture treats incoming writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMode {
    /// Buffer writes and yield them as a value when the capture ends.
    Capture,
    /// Swallow writes; the capture ends with the undefined value.
    Discard,
}

pub struct Output<'a> {
    w: &'a mut (dyn fmt::Write + 'a),
    // `None` entries are discard sinks
    capture_stack: Vec<Option<String>>,
}

impl<'a> Output<'a> {
    pub fn new(w: &'a mut (dyn fmt::Write + 'a)) -> Output<'a> {
        Output {
            w,
            capture_stack: Vec::new(),
        }
    }

    /// Redirect subsequent writes into a fresh buffer or a discard sink.
    pub fn begin_capture(&mut self, mode: CaptureMode) {
        self.capture_stack.push(match mode {
            CaptureMode::Capture => Some(String::new()),
            CaptureMode::Discard => None,
        });
    }

    /// End the innermost capture and return the buffered text.
    ///
    /// Under an active escape mode the text is already escaped, so the
    /// result is marked safe to keep escaping idempotent. Discarding
    /// captures yield the undefined value.
    pub fn end_capture(&mut self, escape: AutoEscape) -> Value {
        // begin/end calls are paired by the compiler
        match self.capture_stack.pop() {
            Some(Some(captured)) if !escape.is_none() => Value::from_safe_string(captured),
            Some(Some(captured)) => Value::from(captured),
            _ => Value::UNDEFINED,
        }
    }
}

impl fmt::Write for Output<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        match self.capture_stack.last_mut() {
            Some(Some(buf)) => buf.write_str(s),
            Some(None) => Ok(()),
            None => self.w.write_str(s),
        }
    }

    fn write_char(&mut self, c: char) -> fmt::Result {
        match self.capture_stack.last_mut() {
            Some(Some(buf)) => buf.write_char(c),
            Some(None) => Ok(()),
            None => self.w.write_char(c),
        }
    }

    fn write_fmt(&mut self, args: fmt::Arguments<'_>) -> fmt::Result {
        match self.capture_stack.last_mut() {
            Some(Some(buf)) => buf.write_fmt(args),
            Some(None) => Ok(()),
            None => self.w.write_fmt(args),
        }
    }
}

impl fmt::Debug for Output<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Output")
            .field("captures", &self.capture_stack.len())
            .finish()
    }
}

/// Bridges an [`io::Write`] sink into the [`fmt::Write`] world while
/// holding on to the first I/O error so it can be reported instead of
/// the generic formatting failure.
pub(crate) struct WriteAdapter<W> {
    pub w: W,
    pub err: Option<io::Error>,
}

impl<W: io::Write> WriteAdapter<W> {
    pub fn new(w: W) -> WriteAdapter<W> {
        WriteAdapter { w, err: None }
    }
}

impl<W: io::Write> fmt::Write for WriteAdapter<W> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.w.write_all(s.as_bytes()).map_err(|e| {
            self.err = Some(e);
            fmt::Error
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt::Write as _;

    #[test]
    fn test_capture_diverts_writes() {
        let mut buf = String::new();
        let mut out = Output::new(&mut buf);
        write!(out, "before ").unwrap();
        out.begin_capture(CaptureMode::Capture);
        write!(out, "inside").unwrap();
        let captured = out.end_capture(AutoEscape::None);
        write!(out, "after").unwrap();
        assert_eq!(buf, "before after");
        assert_eq!(captured.as_str(), Some("inside"));
        assert!(!captured.is_safe());
    }

    #[test]
    fn test_escaped_capture_is_safe() {
        let mut buf = String::new();
        let mut out = Output::new(&mut buf);
        out.begin_capture(CaptureMode::Capture);
        write!(out, "&amp;").unwrap();
        let captured = out.end_capture(AutoEscape::Html);
        assert!(captured.is_safe());
    }

    #[test]
    fn test_captures_nest() {
        let mut buf = String::new();
        let mut out = Output::new(&mut buf);
        out.begin_capture(CaptureMode::Capture);
        write!(out, "outer ").unwrap();
        out.begin_capture(CaptureMode::Capture);
        write!(out, "inner").unwrap();
        let inner = out.end_capture(AutoEscape::None);
        let outer = out.end_capture(AutoEscape::None);
        assert_eq!(inner.as_str(), Some("inner"));
        assert_eq!(outer.as_str(), Some("outer "));
        assert_eq!(buf, "");
    }

    #[test]
    fn test_discard_swallows_writes() {
        let mut buf = String::new();
        let mut out = Output::new(&mut buf);
        write!(out, "kept ").unwrap();
        out.begin_capture(CaptureMode::Discard);
        write!(out, "dropped").unwrap();
        let rv = out.end_capture(AutoEscape::None);
        write!(out, "kept").unwrap();
        assert_eq!(buf, "kept kept");
        assert!(rv.is_undefined());
    }
}

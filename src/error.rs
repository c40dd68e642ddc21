//! Error types for parsing, compilation, and rendering.
//!
//! [`Error`] is the single error type of the crate. Parse errors carry
//! source spans from the offending token; render errors are annotated
//! with the emitting instruction's template name, line, and span at the
//! first frame that lacks location information.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::ast::span::Span;

/// An error that occurred during template parsing, compilation, or
/// rendering.
///
/// Carries a structured [`ErrorKind`], a human-readable message, and —
/// once known — the template name, line, and source [`Span`] where the
/// problem surfaced.
///
/// # Error chaining
///
/// When a host's filter or test implementation catches an underlying
/// error (database, I/O, etc.), it can preserve the original error
/// chain using [`with_source`](Error::with_source):
///
/// ```rust
/// use loomtex::{Error, ErrorKind};
///
/// fn example() -> Result<(), Error> {
///     let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
///     Err(Error::new(ErrorKind::InvalidOperation, "failed to load row").with_source(io_err))
/// }
/// ```
#[derive(Debug, Clone, Error)]
pub struct Error {
    pub kind: ErrorKind,
    pub message: String,
    pub name: Option<String>,
    pub line: Option<u32>,
    pub span: Option<Span>,
    /// The underlying error that caused this one, if any.
    ///
    /// Wrapped in `Arc` so that `Error` remains `Clone`.
    #[source]
    pub source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(name) = &self.name {
            write!(f, " (in {}", name)?;
            if let Some(line) = self.line {
                write!(f, ":{line}")?;
            }
            write!(f, ")")?;
        } else if let Some(line) = self.line {
            write!(f, " (on line {line})")?;
        }
        Ok(())
    }
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            name: None,
            line: None,
            span: None,
            source: None,
        }
    }

    /// Attach a source span (and the line it starts on).
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self.line.get_or_insert(span.start_line);
        self
    }

    /// Attach an underlying error cause.
    ///
    /// The source is wrapped in an `Arc` so that `Error` remains `Clone`.
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// True if no location has been attached yet.
    ///
    /// The renderer uses this to annotate an error exactly once, at the
    /// first frame that knows where it came from.
    pub(crate) fn needs_location(&self) -> bool {
        self.line.is_none() && self.span.is_none()
    }

    pub(crate) fn set_location(&mut self, name: &str, line: u32, span: Option<Span>) {
        self.name = Some(name.to_string());
        self.line = Some(line);
        self.span = span;
    }

    // Convenience constructors for common error shapes

    pub(crate) fn syntax(message: impl Into<String>, span: Span) -> Self {
        Self::new(ErrorKind::Syntax, message).with_span(span)
    }

    pub(crate) fn unknown_filter(name: &str) -> Self {
        Self::new(ErrorKind::UnknownFilter, format!("filter {name} is unknown"))
    }

    pub(crate) fn unknown_test(name: &str) -> Self {
        Self::new(ErrorKind::UnknownTest, format!("test {name} is unknown"))
    }

    pub(crate) fn invalid_op(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidOperation, message)
    }

    pub(crate) fn undefined(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UndefinedError, message)
    }

    pub(crate) fn too_many_arguments() -> Self {
        Self::new(ErrorKind::TooManyArguments, "too many arguments")
    }

    pub(crate) fn missing_argument(name: &str) -> Self {
        Self::new(
            ErrorKind::MissingArgument,
            format!("missing argument {name}"),
        )
    }
}

impl From<fmt::Error> for Error {
    fn from(_: fmt::Error) -> Error {
        Error::new(ErrorKind::InvalidOperation, "could not write to output")
    }
}

/// Structured classification of template errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The template source contains invalid syntax.
    Syntax,
    /// The template source ended inside an unfinished construct.
    UnexpectedEof,
    /// An operation was attempted on values that do not support it.
    InvalidOperation,
    /// An undefined value was used in a way the active undefined
    /// behavior forbids.
    UndefinedError,
    /// A call was missing a required argument.
    MissingArgument,
    /// A call received arguments it cannot accept.
    TooManyArguments,
    /// A filter was applied that is not registered.
    UnknownFilter,
    /// A test was performed that is not registered.
    UnknownTest,
    /// A method was invoked that the receiver does not provide.
    UnknownMethod,
    /// A string literal contained an invalid escape sequence.
    BadEscape,
    /// A value could not be represented in the target form.
    BadSerialization,
    /// An unpacking assignment did not match the value's shape.
    CannotUnpack,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Syntax => "syntax error",
            ErrorKind::UnexpectedEof => "unexpected end of template",
            ErrorKind::InvalidOperation => "invalid operation",
            ErrorKind::UndefinedError => "undefined value",
            ErrorKind::MissingArgument => "missing argument",
            ErrorKind::TooManyArguments => "too many arguments",
            ErrorKind::UnknownFilter => "unknown filter",
            ErrorKind::UnknownTest => "unknown test",
            ErrorKind::UnknownMethod => "unknown method",
            ErrorKind::BadEscape => "bad string escape",
            ErrorKind::BadSerialization => "could not serialize value",
            ErrorKind::CannotUnpack => "cannot unpack value",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_with_location() {
        let mut err = Error::new(ErrorKind::UndefinedError, "missing is undefined");
        err.set_location("hello.txt", 3, None);
        assert_eq!(
            err.to_string(),
            "undefined value: missing is undefined (in hello.txt:3)"
        );
    }

    #[test]
    fn test_needs_location_only_once() {
        let err = Error::new(ErrorKind::InvalidOperation, "nope");
        assert!(err.needs_location());
        let err = err.with_span(Span::default());
        assert!(!err.needs_location());
    }
}

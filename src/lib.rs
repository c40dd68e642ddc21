//! # loomtex
//!
//! A template engine in the Jinja2 family. Templates contain embedded
//! expressions, control flow, and macro definitions that are compiled
//! to bytecode once and rendered against a context value.
//!
//! The crate is split into three layers:
//!
//! - **The language** (lexer, parser, AST) turns source text into a
//!   syntax tree with source spans.
//! - **The compiler** lowers the tree into flat instruction buffers.
//! - **The engine** ([`Environment`], the evaluator, the [`Value`]
//!   model) executes those buffers against host-provided data,
//!   filters, and tests.
//!
//! ## Quick start
//!
//! ```rust
//! use loomtex::{context, Environment};
//!
//! let mut env = Environment::new();
//! env.add_template("hello.txt", "Hello {{ name }}!").unwrap();
//!
//! let tmpl = env.get_template("hello.txt").unwrap();
//! let rv = tmpl.render(context! { name => "World" }).unwrap();
//! assert_eq!(rv, "Hello World!");
//! ```
//!
//! ## Escaping
//!
//! Templates whose name ends in an HTML-ish extension escape
//! interpolated values automatically; `| safe` opts a value out:
//!
//! ```rust
//! use loomtex::{context, Environment};
//!
//! let mut env = Environment::new();
//! env.add_template("page.html", "{{ raw }} {{ raw | safe }}").unwrap();
//!
//! let tmpl = env.get_template("page.html").unwrap();
//! let rv = tmpl.render(context! { raw => "<b>" }).unwrap();
//! assert_eq!(rv, "&lt;b&gt; <b>");
//! ```
//!
//! ## Custom filters
//!
//! Filters and tests are plain closures registered on the
//! environment; the first argument is the piped value:
//!
//! ```rust
//! use loomtex::{context, Environment, Error, State, Value};
//!
//! let mut env = Environment::new();
//! env.add_filter("shout", |_: &State, args: &[Value]| -> Result<Value, Error> {
//!     let s = args[0].to_string().to_uppercase();
//!     Ok(Value::from(s))
//! });
//! let rv = env.render_str("{{ word | shout }}", context! { word => "hi" }).unwrap();
//! assert_eq!(rv, "HI");
//! ```

pub mod ast;
mod compiler;
mod environment;
mod error;
mod eval;
mod parser;
mod registry;
mod utils;
pub mod value;

pub use ast::span::{Span, Spanned};
pub use environment::{CompiledExpression, Environment, Template};
pub use error::{Error, ErrorKind};
pub use eval::{State, UndefinedBehavior};
pub use parser::{parse, parse_expr};
pub use registry::{Filter, Registry, Test};
pub use utils::AutoEscape;
pub use value::{Object, ObjectKind, SeqObject, StructObject, Value};

/// Build a context [`Value`] from `key => value` pairs.
///
/// Each value goes through [`Value::from`], so anything with a `From`
/// impl works, including nested `context!` invocations:
///
/// ```rust
/// use loomtex::context;
///
/// let ctx = context! {
///     name => "Peter",
///     active => true,
///     settings => context! { theme => "dark" },
/// };
/// assert_eq!(ctx.get_attr("name").unwrap().as_str(), Some("Peter"));
/// ```
#[macro_export]
macro_rules! context {
    ($($key:ident => $value:expr),* $(,)?) => {{
        let mut ctx = $crate::value::ValueMap::new();
        $(
            ctx.insert(
                $crate::value::Key::from(stringify!($key)),
                $crate::Value::from($value),
            );
        )*
        $crate::Value::from(ctx)
    }};
}

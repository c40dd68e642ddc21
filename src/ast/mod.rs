//! Abstract syntax tree types.
//!
//! The AST has two layers:
//!
//! - **Statement layer** ([`template`]): nodes that compose the output
//!   stream — raw text, emitted expressions, and control-flow blocks.
//! - **Expression layer** ([`expr`]): typed computations used in emit
//!   position, conditions, arguments, and assignments.
//!
//! Every node is wrapped in [`Spanned`] so the code generator can
//! attach source locations to the instructions it emits.

pub mod expr;
pub mod span;
pub mod template;

pub use expr::*;
pub use span::{Span, Spanned};
pub use template::*;

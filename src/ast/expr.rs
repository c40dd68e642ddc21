use super::span::Spanned;
use crate::value::Value;

pub type Expr = Spanned<ExprKind>;

#[derive(Debug, Clone)]
pub enum ExprKind {
    /// Variable reference: `name`
    Var(String),

    /// Literal constant: `"hello"`, `42`, `true`, `none`.
    ///
    /// List and map literals whose children are all constants are
    /// folded into a single `Const` at parse time.
    Const(Value),

    /// Unary operation: `not x`, `-x`
    UnaryOp {
        op: UnaryOpKind,
        expr: Box<Expr>,
    },

    /// Binary operation: `a == b`, `a + b`, `a in b`
    BinaryOp {
        op: BinaryOpKind,
        left: Box<Expr>,
        right: Box<Expr>,
    },

    /// Attribute access: `obj.name`
    GetAttr {
        expr: Box<Expr>,
        name: String,
    },

    /// Subscript access: `obj[expr]`
    GetItem {
        expr: Box<Expr>,
        subscript: Box<Expr>,
    },

    /// Slice: `obj[start:stop:step]`, each part optional
    Slice {
        expr: Box<Expr>,
        start: Option<Box<Expr>>,
        stop: Option<Box<Expr>>,
        step: Option<Box<Expr>>,
    },

    /// Conditional expression: `a if test else b` (else optional)
    IfExpr {
        test: Box<Expr>,
        true_expr: Box<Expr>,
        false_expr: Option<Box<Expr>>,
    },

    /// Filter application: `expr | name(args)`.
    ///
    /// `expr` is `None` inside a filter block, where the filtered value
    /// is the captured block output rather than an expression.
    Filter {
        name: String,
        expr: Option<Box<Expr>>,
        args: Vec<Expr>,
    },

    /// Test application: `expr is name(args)`
    Test {
        name: String,
        expr: Box<Expr>,
        args: Vec<Expr>,
    },

    /// Call: `callee(args)`
    Call {
        expr: Box<Expr>,
        args: Vec<Expr>,
    },

    /// List literal: `[a, b, c]`. Parenthesized tuples parse to the
    /// same node; lists and tuples are unified at the value level.
    List(Vec<Expr>),

    /// Map literal: `{k: v, ...}` with parallel key/value vectors
    Map {
        keys: Vec<Expr>,
        values: Vec<Expr>,
    },

    /// Trailing keyword arguments of a call: `name=value, ...`
    Kwargs(Vec<(String, Expr)>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOpKind {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOpKind {
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
    ScAnd,
    ScOr,
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Rem,
    Pow,
    Concat,
    In,
}

use super::expr::Expr;
use super::span::Spanned;

pub type Stmt = Spanned<StmtKind>;

/// The kinds of statement that can appear in a template.
#[derive(Debug, Clone)]
pub enum StmtKind {
    /// The root node: a sequence of children rendered in order.
    Template(Vec<Stmt>),

    /// `{{ expr }}` — evaluate and emit through the active escape mode.
    EmitExpr(Expr),

    /// Raw text between constructs, emitted verbatim.
    EmitRaw(String),

    /// `{% for target in iter %}body{% else %}else_body{% endfor %}`
    ForLoop(ForLoop),

    /// `{% if expr %}...{% elif %}...{% else %}...{% endif %}`.
    ///
    /// `elif` chains are desugared by the parser into nested `IfCond`
    /// nodes in the false branch.
    IfCond(IfCond),

    /// `{% with a = 1, b = 2 %}body{% endwith %}`
    WithBlock(WithBlock),

    /// `{% set target = expr %}`
    Set(Set),

    /// `{% set target %}body{% endset %}`, optionally `{% set t | f %}`
    SetBlock(SetBlock),

    /// `{% autoescape expr %}body{% endautoescape %}`
    AutoEscape(AutoEscape),

    /// `{% filter name(args) %}body{% endfilter %}`
    FilterBlock(FilterBlock),

    /// `{% block name %}body{% endblock %}` — compiled into a side
    /// table and rendered in place.
    Block(Block),

    /// `{% macro name(params) %}body{% endmacro %}`
    Macro(Macro),

    /// `{% call(...) macro(...) %}body{% endcall %}`
    CallBlock(CallBlock),

    /// `{% do expr %}` — evaluate and discard.
    Do(Do),

    /// `{% extends expr %}` — parsed; rendering requires a
    /// loader-equipped layer.
    Extends(Extends),

    /// `{% include expr %}` — parsed; rendering requires a
    /// loader-equipped layer.
    Include(Include),

    /// `{% import expr as name %}` — parsed; rendering requires a
    /// loader-equipped layer.
    Import(Import),

    /// `{% from expr import a, b as c %}` — parsed; rendering requires
    /// a loader-equipped layer.
    FromImport(FromImport),
}

/// A `{% for %}` loop.
///
/// The `target` is a `Var` or a `List` of targets (unpacking). An
/// optional inline `if` filter restricts iteration; `recursive` enables
/// re-entry through the `loop(...)` callable.
#[derive(Debug, Clone)]
pub struct ForLoop {
    pub target: Expr,
    pub iter: Expr,
    pub filter_expr: Option<Expr>,
    pub recursive: bool,
    pub body: Vec<Stmt>,
    pub else_body: Vec<Stmt>,
}

#[derive(Debug, Clone)]
pub struct IfCond {
    pub expr: Expr,
    pub true_body: Vec<Stmt>,
    pub false_body: Vec<Stmt>,
}

#[derive(Debug, Clone)]
pub struct WithBlock {
    /// `(target, value)` pairs; targets may be unpacking lists.
    pub assignments: Vec<(Expr, Expr)>,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone)]
pub struct Set {
    pub target: Expr,
    pub expr: Expr,
}

#[derive(Debug, Clone)]
pub struct SetBlock {
    pub target: Expr,
    pub filter: Option<Expr>,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone)]
pub struct AutoEscape {
    pub enabled: Expr,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone)]
pub struct FilterBlock {
    pub filter: Expr,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone)]
pub struct Block {
    pub name: String,
    pub body: Vec<Stmt>,
}

/// A macro declaration. `args` are `Var` expressions naming the formal
/// parameters; `defaults` align with the trailing parameters.
#[derive(Debug, Clone)]
pub struct Macro {
    pub name: String,
    pub args: Vec<Expr>,
    pub defaults: Vec<Expr>,
    pub body: Vec<Stmt>,
}

/// A `{% call %}` block: the body becomes a synthetic `caller` macro
/// made available to the invoked macro.
#[derive(Debug, Clone)]
pub struct CallBlock {
    pub call: Expr,
    pub macro_decl: Macro,
}

#[derive(Debug, Clone)]
pub struct Do {
    pub expr: Expr,
}

#[derive(Debug, Clone)]
pub struct Extends {
    pub name: Expr,
}

#[derive(Debug, Clone)]
pub struct Include {
    pub name: Expr,
    pub ignore_missing: bool,
}

#[derive(Debug, Clone)]
pub struct Import {
    pub expr: Expr,
    pub name: Expr,
}

#[derive(Debug, Clone)]
pub struct FromImport {
    pub expr: Expr,
    /// `(name, alias)` pairs.
    pub names: Vec<(Expr, Option<Expr>)>,
}

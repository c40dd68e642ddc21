//! The template parser.
//!
//! A recursive-descent parser over the [`lexer`] token stream. The
//! entry point is [`parse`], which returns the root
//! [`StmtKind::Template`] node. Precedence follows the conventional
//! ladder: conditional expressions bind loosest, then `or`, `and`,
//! `not`, comparisons, `+`/`-`, `~`, `*`/`/`/`//`/`%`, `**`, unary
//! minus, and finally postfix attribute, subscript, and call syntax.
//! Filters and tests attach after the postfix chain.
//!
//! `elif` chains are desugared into nested [`IfCond`] nodes and
//! all-constant list and map literals are folded into a single
//! constant at parse time.

pub mod lexer;
pub mod tokens;

use crate::ast::expr::{BinaryOpKind, Expr, ExprKind, UnaryOpKind};
use crate::ast::span::{Span, Spanned};
use crate::ast::template::{
    AutoEscape, Block, CallBlock, Do, Extends, FilterBlock, ForLoop, FromImport, IfCond, Import,
    Include, Macro, Set, SetBlock, Stmt, StmtKind, WithBlock,
};
use crate::error::{Error, ErrorKind};
use crate::parser::lexer::Tokenizer;
use crate::parser::tokens::Token;
use crate::value::{Key, Value, ValueMap};

/// Maximum nesting depth of expressions and statements.
const MAX_RECURSION: usize = 150;

/// Names that can never be assignment targets.
const RESERVED_NAMES: &[&str] = &[
    "true", "True", "false", "False", "none", "None", "loop", "self",
];

/// Parse a template source into its root statement.
///
/// ```rust
/// let root = loomtex::parse("Hello {{ name }}!").unwrap();
/// ```
pub fn parse(source: &str) -> Result<Stmt, Error> {
    Parser::new(source)?.parse_template()
}

/// Parse a bare expression, as used outside of any template.
///
/// ```rust
/// let expr = loomtex::parse_expr("user.name | default").unwrap();
/// ```
pub fn parse_expr(source: &str) -> Result<Expr, Error> {
    let mut parser = Parser::new_expr(source)?;
    let expr = parser.parse_expr()?;
    match parser.stream.next()? {
        None => Ok(expr),
        Some((token, span)) => Err(Error::syntax(
            format!("unexpected {token} after expression"),
            span,
        )),
    }
}

/// Single-token-lookahead stream over the tokenizer.
struct TokenStream<'s> {
    tokenizer: Tokenizer<'s>,
    current: Option<(Token, Span)>,
    last_span: Span,
}

impl<'s> TokenStream<'s> {
    fn new(source: &'s str) -> Result<TokenStream<'s>, Error> {
        TokenStream::from_tokenizer(Tokenizer::new(source))
    }

    fn from_tokenizer(mut tokenizer: Tokenizer<'s>) -> Result<TokenStream<'s>, Error> {
        let current = tokenizer.next_token()?;
        Ok(TokenStream {
            tokenizer,
            current,
            last_span: Span::default(),
        })
    }

    fn next(&mut self) -> Result<Option<(Token, Span)>, Error> {
        let rv = self.current.take();
        if let Some((_, span)) = &rv {
            self.last_span = *span;
        }
        self.current = self.tokenizer.next_token()?;
        Ok(rv)
    }

    fn peek(&self) -> Option<&Token> {
        self.current.as_ref().map(|(token, _)| token)
    }

    fn current_span(&self) -> Span {
        self.current
            .as_ref()
            .map(|(_, span)| *span)
            .unwrap_or(self.last_span)
    }
}

struct Parser<'s> {
    stream: TokenStream<'s>,
    depth: usize,
}

impl<'s> Parser<'s> {
    fn new(source: &'s str) -> Result<Parser<'s>, Error> {
        Ok(Parser {
            stream: TokenStream::new(source)?,
            depth: 0,
        })
    }

    fn new_expr(source: &'s str) -> Result<Parser<'s>, Error> {
        Ok(Parser {
            stream: TokenStream::from_tokenizer(Tokenizer::new_expr(source))?,
            depth: 0,
        })
    }

    // ── token helpers ────────────────────────────────────────────────

    fn next(&mut self) -> Result<(Token, Span), Error> {
        match self.stream.next()? {
            Some(rv) => Ok(rv),
            None => Err(Error::new(
                ErrorKind::UnexpectedEof,
                "unexpected end of template",
            )
            .with_span(self.stream.last_span)),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.stream.peek()
    }

    /// Consume the next token, which must equal `expected`.
    fn expect(&mut self, expected: Token) -> Result<Span, Error> {
        let (token, span) = self.next()?;
        if token == expected {
            Ok(span)
        } else {
            Err(Error::syntax(
                format!("unexpected {token}, expected {expected}"),
                span,
            ))
        }
    }

    fn expect_ident(&mut self, what: &str) -> Result<(String, Span), Error> {
        match self.next()? {
            (Token::Ident(name), span) => Ok((name, span)),
            (token, span) => Err(Error::syntax(
                format!("unexpected {token}, expected {what}"),
                span,
            )),
        }
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<Span, Error> {
        match self.next()? {
            (Token::Ident(name), span) if name == keyword => Ok(span),
            (token, span) => Err(Error::syntax(
                format!("unexpected {token}, expected {keyword}"),
                span,
            )),
        }
    }

    fn matches_ident(&self, name: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(id)) if id == name)
    }

    /// Consume an identifier token if it equals `name`.
    fn skip_if_ident(&mut self, name: &str) -> Result<bool, Error> {
        if self.matches_ident(name) {
            self.next()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn skip_if(&mut self, token: &Token) -> Result<bool, Error> {
        if self.peek() == Some(token) {
            self.next()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Close `start` at the last consumed token.
    fn span_from(&self, start: Span) -> Span {
        start.merge(self.stream.last_span)
    }

    fn guard<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, Error>,
    ) -> Result<T, Error> {
        self.depth += 1;
        if self.depth > MAX_RECURSION {
            return Err(Error::syntax(
                "template exceeds maximum nesting depth",
                self.stream.current_span(),
            ));
        }
        let rv = f(self);
        self.depth -= 1;
        rv
    }

    // ── statements ───────────────────────────────────────────────────

    fn parse_template(&mut self) -> Result<Stmt, Error> {
        let start = self.stream.current_span();
        let (children, _) = self.subparse(&[])?;
        Ok(Spanned::new(
            StmtKind::Template(children),
            self.span_from(start),
        ))
    }

    /// Parse statements until one of the `ends` keywords opens a block
    /// tag, or end of input when `ends` is empty.
    ///
    /// The matched keyword is returned consumed; its trailing `%}` is
    /// left for the caller, which may need to read more of the tag
    /// first (`elif`, `endblock name`).
    fn subparse(&mut self, ends: &[&str]) -> Result<(Vec<Stmt>, Option<String>), Error> {
        let mut rv = Vec::new();
        while let Some((token, span)) = self.stream.next()? {
            match token {
                Token::TemplateData(text) => {
                    rv.push(Spanned::new(StmtKind::EmitRaw(text), span));
                }
                Token::VariableStart => {
                    let expr = self.parse_expr()?;
                    self.expect(Token::VariableEnd)?;
                    rv.push(Spanned::new(StmtKind::EmitExpr(expr), self.span_from(span)));
                }
                Token::BlockStart => {
                    let (keyword, _) = self.expect_ident("statement name")?;
                    if ends.contains(&keyword.as_str()) {
                        return Ok((rv, Some(keyword)));
                    }
                    rv.push(self.parse_stmt(&keyword, span)?);
                }
                token => {
                    return Err(Error::syntax(format!("unexpected {token}"), span));
                }
            }
        }
        if ends.is_empty() {
            Ok((rv, None))
        } else {
            Err(Error::new(
                ErrorKind::UnexpectedEof,
                format!("unexpected end of template, expected {}", ends.join(" or ")),
            )
            .with_span(self.stream.last_span))
        }
    }

    fn parse_stmt(&mut self, keyword: &str, start: Span) -> Result<Stmt, Error> {
        self.guard(|parser| {
            let kind = match keyword {
                "for" => parser.parse_for()?,
                "if" => parser.parse_if()?,
                "with" => parser.parse_with()?,
                "set" => parser.parse_set()?,
                "autoescape" => parser.parse_autoescape()?,
                "filter" => parser.parse_filter_block()?,
                "block" => parser.parse_block()?,
                "macro" => parser.parse_macro_stmt()?,
                "call" => parser.parse_call_block()?,
                "do" => {
                    let expr = parser.parse_expr()?;
                    parser.expect(Token::BlockEnd)?;
                    StmtKind::Do(Do { expr })
                }
                "extends" => {
                    let name = parser.parse_expr()?;
                    parser.expect(Token::BlockEnd)?;
                    StmtKind::Extends(Extends { name })
                }
                "include" => parser.parse_include()?,
                "import" => parser.parse_import()?,
                "from" => parser.parse_from_import()?,
                keyword => {
                    return Err(Error::syntax(
                        format!("unknown statement {keyword}"),
                        parser.stream.last_span,
                    ));
                }
            };
            Ok(Spanned::new(kind, parser.span_from(start)))
        })
    }

    fn parse_for(&mut self) -> Result<StmtKind, Error> {
        let target = self.parse_assign_tuple()?;
        self.expect_keyword("in")?;
        let iter = self.parse_expr_noif()?;
        let filter_expr = if self.skip_if_ident("if")? {
            Some(self.parse_expr()?)
        } else {
            None
        };
        let recursive = self.skip_if_ident("recursive")?;
        self.expect(Token::BlockEnd)?;
        let (body, end) = self.subparse(&["endfor", "else"])?;
        let mut else_body = Vec::new();
        if end.as_deref() == Some("else") {
            self.expect(Token::BlockEnd)?;
            let (stmts, _) = self.subparse(&["endfor"])?;
            else_body = stmts;
        }
        self.expect(Token::BlockEnd)?;
        Ok(StmtKind::ForLoop(ForLoop {
            target,
            iter,
            filter_expr,
            recursive,
            body,
            else_body,
        }))
    }

    fn parse_if(&mut self) -> Result<StmtKind, Error> {
        let expr = self.parse_expr_noif()?;
        self.expect(Token::BlockEnd)?;
        let (true_body, end) = self.subparse(&["endif", "elif", "else"])?;
        let false_body = match end.as_deref() {
            Some("elif") => {
                let start = self.stream.current_span();
                let kind = self.parse_if()?;
                vec![Spanned::new(kind, self.span_from(start))]
            }
            Some("else") => {
                self.expect(Token::BlockEnd)?;
                let (stmts, _) = self.subparse(&["endif"])?;
                self.expect(Token::BlockEnd)?;
                stmts
            }
            _ => {
                self.expect(Token::BlockEnd)?;
                Vec::new()
            }
        };
        Ok(StmtKind::IfCond(IfCond {
            expr,
            true_body,
            false_body,
        }))
    }

    fn parse_with(&mut self) -> Result<StmtKind, Error> {
        let mut assignments = Vec::new();
        loop {
            let target = self.parse_assign_target()?;
            self.expect(Token::Assign)?;
            assignments.push((target, self.parse_expr()?));
            if !self.skip_if(&Token::Comma)? {
                break;
            }
        }
        self.expect(Token::BlockEnd)?;
        let (body, _) = self.subparse(&["endwith"])?;
        self.expect(Token::BlockEnd)?;
        Ok(StmtKind::WithBlock(WithBlock { assignments, body }))
    }

    fn parse_set(&mut self) -> Result<StmtKind, Error> {
        let target = self.parse_assign_target()?;
        if self.skip_if(&Token::Assign)? {
            let expr = self.parse_expr()?;
            self.expect(Token::BlockEnd)?;
            return Ok(StmtKind::Set(Set { target, expr }));
        }
        // block form, optionally piped through a filter chain
        let filter = if self.skip_if(&Token::Pipe)? {
            Some(self.parse_filter_chain()?)
        } else {
            None
        };
        self.expect(Token::BlockEnd)?;
        let (body, _) = self.subparse(&["endset"])?;
        self.expect(Token::BlockEnd)?;
        Ok(StmtKind::SetBlock(SetBlock {
            target,
            filter,
            body,
        }))
    }

    fn parse_autoescape(&mut self) -> Result<StmtKind, Error> {
        let enabled = self.parse_expr()?;
        self.expect(Token::BlockEnd)?;
        let (body, _) = self.subparse(&["endautoescape"])?;
        self.expect(Token::BlockEnd)?;
        Ok(StmtKind::AutoEscape(AutoEscape { enabled, body }))
    }

    fn parse_filter_block(&mut self) -> Result<StmtKind, Error> {
        let filter = self.parse_filter_chain()?;
        self.expect(Token::BlockEnd)?;
        let (body, _) = self.subparse(&["endfilter"])?;
        self.expect(Token::BlockEnd)?;
        Ok(StmtKind::FilterBlock(FilterBlock { filter, body }))
    }

    fn parse_block(&mut self) -> Result<StmtKind, Error> {
        let (name, _) = self.expect_ident("block name")?;
        self.expect(Token::BlockEnd)?;
        let (body, _) = self.subparse(&["endblock"])?;
        // `{% endblock name %}` must repeat the opening name
        if let Some(Token::Ident(_)) = self.peek() {
            let (trailing, span) = self.expect_ident("block name")?;
            if trailing != name {
                return Err(Error::syntax(
                    format!("mismatched block names ({name} != {trailing})"),
                    span,
                ));
            }
        }
        self.expect(Token::BlockEnd)?;
        Ok(StmtKind::Block(Block { name, body }))
    }

    fn parse_macro_stmt(&mut self) -> Result<StmtKind, Error> {
        let (name, _) = self.expect_ident("macro name")?;
        self.expect(Token::ParenOpen)?;
        let (args, defaults) = self.parse_macro_params()?;
        self.expect(Token::BlockEnd)?;
        let (body, _) = self.subparse(&["endmacro"])?;
        self.expect(Token::BlockEnd)?;
        Ok(StmtKind::Macro(Macro {
            name,
            args,
            defaults,
            body,
        }))
    }

    /// Parse a macro parameter list up to and including the closing
    /// parenthesis. Defaults must trail the required parameters.
    fn parse_macro_params(&mut self) -> Result<(Vec<Expr>, Vec<Expr>), Error> {
        let mut args = Vec::new();
        let mut defaults = Vec::new();
        loop {
            if self.skip_if(&Token::ParenClose)? {
                break;
            }
            if !args.is_empty() {
                self.expect(Token::Comma)?;
                if self.skip_if(&Token::ParenClose)? {
                    break;
                }
            }
            let arg = self.parse_assign_name()?;
            if self.skip_if(&Token::Assign)? {
                defaults.push(self.parse_expr()?);
            } else if !defaults.is_empty() {
                return Err(Error::syntax(
                    "non-default argument follows default argument",
                    arg.span,
                ));
            }
            args.push(arg);
        }
        Ok((args, defaults))
    }

    fn parse_call_block(&mut self) -> Result<StmtKind, Error> {
        let (args, defaults) = if self.skip_if(&Token::ParenOpen)? {
            self.parse_macro_params()?
        } else {
            (Vec::new(), Vec::new())
        };
        let call = self.parse_expr()?;
        if !matches!(call.node, ExprKind::Call { .. }) {
            return Err(Error::syntax("expected macro call after call block", call.span));
        }
        self.expect(Token::BlockEnd)?;
        let (body, _) = self.subparse(&["endcall"])?;
        self.expect(Token::BlockEnd)?;
        Ok(StmtKind::CallBlock(CallBlock {
            call,
            macro_decl: Macro {
                name: "caller".to_string(),
                args,
                defaults,
                body,
            },
        }))
    }

    fn parse_include(&mut self) -> Result<StmtKind, Error> {
        let name = self.parse_expr()?;
        let ignore_missing = if self.skip_if_ident("ignore")? {
            self.expect_keyword("missing")?;
            true
        } else {
            false
        };
        self.expect(Token::BlockEnd)?;
        Ok(StmtKind::Include(Include {
            name,
            ignore_missing,
        }))
    }

    fn parse_import(&mut self) -> Result<StmtKind, Error> {
        let expr = self.parse_expr()?;
        self.expect_keyword("as")?;
        let name = self.parse_assign_name()?;
        self.expect(Token::BlockEnd)?;
        Ok(StmtKind::Import(Import { expr, name }))
    }

    fn parse_from_import(&mut self) -> Result<StmtKind, Error> {
        let expr = self.parse_expr()?;
        self.expect_keyword("import")?;
        let mut names = Vec::new();
        loop {
            if self.peek() == Some(&Token::BlockEnd) {
                break;
            }
            if !names.is_empty() {
                self.expect(Token::Comma)?;
                if self.peek() == Some(&Token::BlockEnd) {
                    break;
                }
            }
            let name = self.parse_assign_name()?;
            let alias = if self.skip_if_ident("as")? {
                Some(self.parse_assign_name()?)
            } else {
                None
            };
            names.push((name, alias));
        }
        self.expect(Token::BlockEnd)?;
        Ok(StmtKind::FromImport(FromImport { expr, names }))
    }

    // ── assignment targets ───────────────────────────────────────────

    fn parse_assign_name(&mut self) -> Result<Expr, Error> {
        let (name, span) = self.expect_ident("variable name")?;
        if RESERVED_NAMES.contains(&name.as_str()) {
            return Err(Error::syntax(
                format!("cannot assign to reserved variable name {name}"),
                span,
            ));
        }
        Ok(Spanned::new(ExprKind::Var(name), span))
    }

    /// A single assignment target: a name or a parenthesized tuple.
    fn parse_assign_target(&mut self) -> Result<Expr, Error> {
        if self.peek() == Some(&Token::ParenOpen) {
            let start = self.stream.current_span();
            self.next()?;
            let target = self.parse_assign_tuple()?;
            self.expect(Token::ParenClose)?;
            Ok(Spanned::new(target.node, self.span_from(start)))
        } else {
            self.parse_assign_name()
        }
    }

    /// An unparenthesized tuple of targets, as in `for a, b in items`.
    fn parse_assign_tuple(&mut self) -> Result<Expr, Error> {
        let start = self.stream.current_span();
        let first = self.parse_assign_target()?;
        if self.peek() != Some(&Token::Comma) {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.skip_if(&Token::Comma)? {
            if self.matches_ident("in") || self.peek() == Some(&Token::ParenClose) {
                break;
            }
            items.push(self.parse_assign_target()?);
        }
        Ok(Spanned::new(ExprKind::List(items), self.span_from(start)))
    }

    // ── expressions ──────────────────────────────────────────────────

    fn parse_expr(&mut self) -> Result<Expr, Error> {
        self.guard(Self::parse_ifexpr)
    }

    /// Expression without the trailing conditional; used where an `if`
    /// keyword carries its own meaning, as in loop filters.
    fn parse_expr_noif(&mut self) -> Result<Expr, Error> {
        self.guard(Self::parse_or)
    }

    fn parse_ifexpr(&mut self) -> Result<Expr, Error> {
        let start = self.stream.current_span();
        let mut expr = self.parse_or()?;
        while self.skip_if_ident("if")? {
            let test = self.parse_or()?;
            let false_expr = if self.skip_if_ident("else")? {
                Some(Box::new(self.parse_ifexpr()?))
            } else {
                None
            };
            expr = Spanned::new(
                ExprKind::IfExpr {
                    test: Box::new(test),
                    true_expr: Box::new(expr),
                    false_expr,
                },
                self.span_from(start),
            );
        }
        Ok(expr)
    }

    fn parse_or(&mut self) -> Result<Expr, Error> {
        let start = self.stream.current_span();
        let mut left = self.parse_and()?;
        while self.skip_if_ident("or")? {
            let right = self.parse_and()?;
            left = Spanned::new(
                ExprKind::BinaryOp {
                    op: BinaryOpKind::ScOr,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                self.span_from(start),
            );
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, Error> {
        let start = self.stream.current_span();
        let mut left = self.parse_not()?;
        while self.skip_if_ident("and")? {
            let right = self.parse_not()?;
            left = Spanned::new(
                ExprKind::BinaryOp {
                    op: BinaryOpKind::ScAnd,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                self.span_from(start),
            );
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, Error> {
        let start = self.stream.current_span();
        if self.skip_if_ident("not")? {
            let expr = self.parse_not()?;
            return Ok(Spanned::new(
                ExprKind::UnaryOp {
                    op: UnaryOpKind::Not,
                    expr: Box::new(expr),
                },
                self.span_from(start),
            ));
        }
        self.parse_compare()
    }

    fn parse_compare(&mut self) -> Result<Expr, Error> {
        let start = self.stream.current_span();
        let mut expr = self.parse_math1()?;
        loop {
            // after an operand, `not` can only begin `not in`
            let (op, negated) = match self.peek() {
                Some(Token::Eq) => (BinaryOpKind::Eq, false),
                Some(Token::Ne) => (BinaryOpKind::Ne, false),
                Some(Token::Lt) => (BinaryOpKind::Lt, false),
                Some(Token::Lte) => (BinaryOpKind::Lte, false),
                Some(Token::Gt) => (BinaryOpKind::Gt, false),
                Some(Token::Gte) => (BinaryOpKind::Gte, false),
                Some(Token::Ident(id)) if id == "in" => (BinaryOpKind::In, false),
                Some(Token::Ident(id)) if id == "not" => (BinaryOpKind::In, true),
                _ => break,
            };
            self.next()?;
            if negated {
                self.expect_keyword("in")?;
            }
            let right = self.parse_math1()?;
            expr = Spanned::new(
                ExprKind::BinaryOp {
                    op,
                    left: Box::new(expr),
                    right: Box::new(right),
                },
                self.span_from(start),
            );
            if negated {
                expr = Spanned::new(
                    ExprKind::UnaryOp {
                        op: UnaryOpKind::Not,
                        expr: Box::new(expr),
                    },
                    self.span_from(start),
                );
            }
        }
        Ok(expr)
    }

    fn parse_math1(&mut self) -> Result<Expr, Error> {
        let start = self.stream.current_span();
        let mut left = self.parse_concat()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOpKind::Add,
                Some(Token::Minus) => BinaryOpKind::Sub,
                _ => break,
            };
            self.next()?;
            let right = self.parse_concat()?;
            left = Spanned::new(
                ExprKind::BinaryOp {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                self.span_from(start),
            );
        }
        Ok(left)
    }

    fn parse_concat(&mut self) -> Result<Expr, Error> {
        let start = self.stream.current_span();
        let mut left = self.parse_math2()?;
        while self.skip_if(&Token::Tilde)? {
            let right = self.parse_math2()?;
            left = Spanned::new(
                ExprKind::BinaryOp {
                    op: BinaryOpKind::Concat,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                self.span_from(start),
            );
        }
        Ok(left)
    }

    fn parse_math2(&mut self) -> Result<Expr, Error> {
        let start = self.stream.current_span();
        let mut left = self.parse_pow()?;
        loop {
            let op = match self.peek() {
                Some(Token::Mul) => BinaryOpKind::Mul,
                Some(Token::Div) => BinaryOpKind::Div,
                Some(Token::FloorDiv) => BinaryOpKind::FloorDiv,
                Some(Token::Rem) => BinaryOpKind::Rem,
                _ => break,
            };
            self.next()?;
            let right = self.parse_pow()?;
            left = Spanned::new(
                ExprKind::BinaryOp {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                self.span_from(start),
            );
        }
        Ok(left)
    }

    fn parse_pow(&mut self) -> Result<Expr, Error> {
        let start = self.stream.current_span();
        let mut left = self.parse_unary()?;
        while self.skip_if(&Token::Pow)? {
            let right = self.parse_unary()?;
            left = Spanned::new(
                ExprKind::BinaryOp {
                    op: BinaryOpKind::Pow,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                self.span_from(start),
            );
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, Error> {
        let start = self.stream.current_span();
        if self.skip_if(&Token::Minus)? {
            let expr = self.parse_unary()?;
            let span = self.span_from(start);
            // fold negation of numeric literals
            if let ExprKind::Const(value) = &expr.node {
                if let Ok(negated) = crate::value::ops::neg(value) {
                    return Ok(Spanned::new(ExprKind::Const(negated), span));
                }
            }
            return Ok(Spanned::new(
                ExprKind::UnaryOp {
                    op: UnaryOpKind::Neg,
                    expr: Box::new(expr),
                },
                span,
            ));
        }
        let expr = self.parse_primary()?;
        let expr = self.parse_postfix(expr, start)?;
        self.parse_filter_expr(expr, start)
    }

    fn parse_postfix(&mut self, mut expr: Expr, start: Span) -> Result<Expr, Error> {
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.next()?;
                    let (name, _) = self.expect_ident("attribute name")?;
                    expr = Spanned::new(
                        ExprKind::GetAttr {
                            expr: Box::new(expr),
                            name,
                        },
                        self.span_from(start),
                    );
                }
                Some(Token::BracketOpen) => {
                    self.next()?;
                    expr = self.parse_subscript(expr, start)?;
                }
                Some(Token::ParenOpen) => {
                    self.next()?;
                    let args = self.parse_args()?;
                    expr = Spanned::new(
                        ExprKind::Call {
                            expr: Box::new(expr),
                            args,
                        },
                        self.span_from(start),
                    );
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    /// Parse `expr[...]` after the opening bracket: either a plain
    /// subscript or a `start:stop:step` slice with all parts optional.
    fn parse_subscript(&mut self, expr: Expr, start: Span) -> Result<Expr, Error> {
        let mut parts: Vec<Option<Box<Expr>>> = Vec::new();
        let mut current: Option<Box<Expr>> = None;
        loop {
            match self.peek() {
                Some(Token::Colon) => {
                    self.next()?;
                    parts.push(current.take());
                }
                Some(Token::BracketClose) => {
                    self.next()?;
                    break;
                }
                _ => {
                    if current.is_some() {
                        return Err(Error::syntax(
                            "expected `:` or `]` in subscript",
                            self.stream.current_span(),
                        ));
                    }
                    current = Some(Box::new(self.parse_expr()?));
                }
            }
        }
        parts.push(current);
        if parts.len() > 3 {
            return Err(Error::syntax(
                "slices take at most three parts",
                self.span_from(start),
            ));
        }
        let span = self.span_from(start);
        if parts.len() == 1 {
            let subscript = match parts.into_iter().next().flatten() {
                Some(subscript) => subscript,
                None => return Err(Error::syntax("empty subscript", span)),
            };
            return Ok(Spanned::new(
                ExprKind::GetItem {
                    expr: Box::new(expr),
                    subscript,
                },
                span,
            ));
        }
        let mut parts = parts.into_iter();
        Ok(Spanned::new(
            ExprKind::Slice {
                expr: Box::new(expr),
                start: parts.next().flatten(),
                stop: parts.next().flatten(),
                step: parts.next().flatten(),
            },
            span,
        ))
    }

    fn parse_filter_expr(&mut self, mut expr: Expr, start: Span) -> Result<Expr, Error> {
        loop {
            if self.skip_if(&Token::Pipe)? {
                let (name, _) = self.expect_ident("filter name")?;
                let args = if self.skip_if(&Token::ParenOpen)? {
                    self.parse_args()?
                } else {
                    Vec::new()
                };
                expr = Spanned::new(
                    ExprKind::Filter {
                        name,
                        expr: Some(Box::new(expr)),
                        args,
                    },
                    self.span_from(start),
                );
            } else if self.matches_ident("is") {
                self.next()?;
                let negated = self.skip_if_ident("not")?;
                let (name, _) = self.expect_ident("test name")?;
                let args = if self.skip_if(&Token::ParenOpen)? {
                    self.parse_args()?
                } else if matches!(
                    self.peek(),
                    Some(Token::Int(_))
                        | Some(Token::UInt(_))
                        | Some(Token::Float(_))
                        | Some(Token::Str(_))
                ) {
                    // a bare literal argument, as in `is divisibleby 3`
                    vec![self.parse_primary()?]
                } else {
                    Vec::new()
                };
                expr = Spanned::new(
                    ExprKind::Test {
                        name,
                        expr: Box::new(expr),
                        args,
                    },
                    self.span_from(start),
                );
                if negated {
                    expr = Spanned::new(
                        ExprKind::UnaryOp {
                            op: UnaryOpKind::Not,
                            expr: Box::new(expr),
                        },
                        self.span_from(start),
                    );
                }
            } else {
                break;
            }
        }
        Ok(expr)
    }

    /// A filter chain with no input expression, as used by filter
    /// blocks and the block form of `set`.
    fn parse_filter_chain(&mut self) -> Result<Expr, Error> {
        let start = self.stream.current_span();
        let (name, span) = self.expect_ident("filter name")?;
        let args = if self.skip_if(&Token::ParenOpen)? {
            self.parse_args()?
        } else {
            Vec::new()
        };
        let mut filter = Spanned::new(
            ExprKind::Filter {
                name,
                expr: None,
                args,
            },
            span,
        );
        while self.skip_if(&Token::Pipe)? {
            let (name, _) = self.expect_ident("filter name")?;
            let args = if self.skip_if(&Token::ParenOpen)? {
                self.parse_args()?
            } else {
                Vec::new()
            };
            filter = Spanned::new(
                ExprKind::Filter {
                    name,
                    expr: Some(Box::new(filter)),
                    args,
                },
                self.span_from(start),
            );
        }
        Ok(filter)
    }

    /// Parse a call argument list up to and including the closing
    /// parenthesis. Keyword arguments collect into one trailing
    /// [`ExprKind::Kwargs`] node.
    fn parse_args(&mut self) -> Result<Vec<Expr>, Error> {
        let start = self.stream.current_span();
        let mut args = Vec::new();
        let mut kwargs: Vec<(String, Expr)> = Vec::new();
        loop {
            if self.skip_if(&Token::ParenClose)? {
                break;
            }
            if !args.is_empty() || !kwargs.is_empty() {
                self.expect(Token::Comma)?;
                if self.skip_if(&Token::ParenClose)? {
                    break;
                }
            }
            let expr = self.parse_expr()?;
            if self.skip_if(&Token::Assign)? {
                let name = match expr.node {
                    ExprKind::Var(name) => name,
                    _ => {
                        return Err(Error::syntax(
                            "invalid keyword argument name",
                            expr.span,
                        ));
                    }
                };
                kwargs.push((name, self.parse_expr()?));
            } else {
                if !kwargs.is_empty() {
                    return Err(Error::syntax(
                        "positional argument after keyword argument",
                        expr.span,
                    ));
                }
                args.push(expr);
            }
        }
        if !kwargs.is_empty() {
            args.push(Spanned::new(ExprKind::Kwargs(kwargs), self.span_from(start)));
        }
        Ok(args)
    }

    fn parse_primary(&mut self) -> Result<Expr, Error> {
        self.guard(|parser| {
            let (token, span) = parser.next()?;
            let kind = match token {
                Token::Ident(name) => match name.as_str() {
                    "true" | "True" => ExprKind::Const(Value::from(true)),
                    "false" | "False" => ExprKind::Const(Value::from(false)),
                    "none" | "None" => ExprKind::Const(Value::NONE),
                    _ => ExprKind::Var(name),
                },
                Token::Str(s) => ExprKind::Const(Value::from(s)),
                Token::Int(n) => ExprKind::Const(Value::from(n)),
                Token::UInt(n) => ExprKind::Const(Value::from(n)),
                Token::Float(n) => ExprKind::Const(Value::from(n)),
                Token::ParenOpen => return parser.parse_tuple_or_group(span),
                Token::BracketOpen => return parser.parse_list(span),
                Token::BraceOpen => return parser.parse_map(span),
                token => {
                    return Err(Error::syntax(
                        format!("unexpected {token}"),
                        span,
                    ));
                }
            };
            Ok(Spanned::new(kind, span))
        })
    }

    /// After `(`: an empty tuple, a parenthesized group, or a tuple
    /// literal. `(a)` is grouping; `(a,)` is a one-element tuple.
    fn parse_tuple_or_group(&mut self, start: Span) -> Result<Expr, Error> {
        if self.skip_if(&Token::ParenClose)? {
            return Ok(fold_list(Vec::new(), self.span_from(start)));
        }
        let first = self.parse_expr()?;
        if !self.skip_if(&Token::Comma)? {
            self.expect(Token::ParenClose)?;
            return Ok(first);
        }
        let mut items = vec![first];
        loop {
            if self.skip_if(&Token::ParenClose)? {
                break;
            }
            items.push(self.parse_expr()?);
            if !self.skip_if(&Token::Comma)? {
                self.expect(Token::ParenClose)?;
                break;
            }
        }
        Ok(fold_list(items, self.span_from(start)))
    }

    fn parse_list(&mut self, start: Span) -> Result<Expr, Error> {
        let mut items = Vec::new();
        loop {
            if self.skip_if(&Token::BracketClose)? {
                break;
            }
            if !items.is_empty() {
                self.expect(Token::Comma)?;
                if self.skip_if(&Token::BracketClose)? {
                    break;
                }
            }
            items.push(self.parse_expr()?);
        }
        Ok(fold_list(items, self.span_from(start)))
    }

    fn parse_map(&mut self, start: Span) -> Result<Expr, Error> {
        let mut keys = Vec::new();
        let mut values = Vec::new();
        loop {
            if self.skip_if(&Token::BraceClose)? {
                break;
            }
            if !keys.is_empty() {
                self.expect(Token::Comma)?;
                if self.skip_if(&Token::BraceClose)? {
                    break;
                }
            }
            keys.push(self.parse_expr()?);
            self.expect(Token::Colon)?;
            values.push(self.parse_expr()?);
        }
        let span = self.span_from(start);
        let all_const = keys
            .iter()
            .chain(values.iter())
            .all(|expr| matches!(expr.node, ExprKind::Const(_)));
        if all_const {
            let mut map = ValueMap::new();
            for (key, value) in keys.into_iter().zip(values) {
                match (key.node, value.node) {
                    (ExprKind::Const(k), ExprKind::Const(v)) => {
                        map.insert(Key::from_value(k), v);
                    }
                    _ => unreachable!(),
                }
            }
            return Ok(Spanned::new(ExprKind::Const(Value::from(map)), span));
        }
        Ok(Spanned::new(ExprKind::Map { keys, values }, span))
    }
}

/// Fold an all-constant list literal into a constant sequence.
fn fold_list(items: Vec<Expr>, span: Span) -> Expr {
    if items
        .iter()
        .all(|expr| matches!(expr.node, ExprKind::Const(_)))
    {
        let seq: Value = items
            .into_iter()
            .map(|expr| match expr.node {
                ExprKind::Const(value) => value,
                _ => unreachable!(),
            })
            .collect();
        Spanned::new(ExprKind::Const(seq), span)
    } else {
        Spanned::new(ExprKind::List(items), span)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_expr_of(source: &str) -> Expr {
        let root = parse(source).unwrap();
        match root.node {
            StmtKind::Template(mut children) => match children.remove(0).node {
                StmtKind::EmitExpr(expr) => expr,
                stmt => panic!("expected expression, got {stmt:?}"),
            },
            stmt => panic!("expected template root, got {stmt:?}"),
        }
    }

    fn parse_stmt_of(source: &str) -> StmtKind {
        let root = parse(source).unwrap();
        match root.node {
            StmtKind::Template(mut children) => children.remove(0).node,
            stmt => panic!("expected template root, got {stmt:?}"),
        }
    }

    #[test]
    fn test_precedence() {
        let expr = parse_expr_of("{{ 1 + 2 * 3 }}");
        match expr.node {
            ExprKind::BinaryOp { op, left, right } => {
                assert_eq!(op, BinaryOpKind::Add);
                assert!(matches!(left.node, ExprKind::Const(_)));
                assert!(matches!(
                    right.node,
                    ExprKind::BinaryOp {
                        op: BinaryOpKind::Mul,
                        ..
                    }
                ));
            }
            node => panic!("unexpected node {node:?}"),
        }
    }

    #[test]
    fn test_const_folded_list() {
        let expr = parse_expr_of("{{ [1, 2, 3] }}");
        match expr.node {
            ExprKind::Const(value) => assert_eq!(value.to_string(), "[1, 2, 3]"),
            node => panic!("expected folded constant, got {node:?}"),
        }
    }

    #[test]
    fn test_grouping_vs_tuple() {
        assert!(matches!(
            parse_expr_of("{{ (1) }}").node,
            ExprKind::Const(_)
        ));
        match parse_expr_of("{{ (x,) }}").node {
            ExprKind::List(items) => assert_eq!(items.len(), 1),
            node => panic!("expected tuple, got {node:?}"),
        }
    }

    #[test]
    fn test_negative_literal_folds() {
        let expr = parse_expr_of("{{ -42 }}");
        match expr.node {
            ExprKind::Const(value) => assert_eq!(value.to_string(), "-42"),
            node => panic!("expected folded constant, got {node:?}"),
        }
    }

    #[test]
    fn test_not_in() {
        let expr = parse_expr_of("{{ 1 not in [1, 2] }}");
        match expr.node {
            ExprKind::UnaryOp { op, expr } => {
                assert_eq!(op, UnaryOpKind::Not);
                assert!(matches!(
                    expr.node,
                    ExprKind::BinaryOp {
                        op: BinaryOpKind::In,
                        ..
                    }
                ));
            }
            node => panic!("unexpected node {node:?}"),
        }
    }

    #[test]
    fn test_is_not() {
        let expr = parse_expr_of("{{ x is not defined }}");
        match expr.node {
            ExprKind::UnaryOp { op, expr } => {
                assert_eq!(op, UnaryOpKind::Not);
                assert!(matches!(expr.node, ExprKind::Test { .. }));
            }
            node => panic!("unexpected node {node:?}"),
        }
    }

    #[test]
    fn test_filter_chain() {
        let expr = parse_expr_of("{{ name | escape | safe }}");
        match expr.node {
            ExprKind::Filter { name, expr, .. } => {
                assert_eq!(name, "safe");
                assert!(matches!(
                    expr.unwrap().node,
                    ExprKind::Filter { .. }
                ));
            }
            node => panic!("unexpected node {node:?}"),
        }
    }

    #[test]
    fn test_kwargs_collect() {
        let expr = parse_expr_of("{{ f(1, a=2, b=3) }}");
        match expr.node {
            ExprKind::Call { args, .. } => {
                assert_eq!(args.len(), 2);
                match &args[1].node {
                    ExprKind::Kwargs(pairs) => {
                        assert_eq!(pairs.len(), 2);
                        assert_eq!(pairs[0].0, "a");
                    }
                    node => panic!("expected kwargs, got {node:?}"),
                }
            }
            node => panic!("unexpected node {node:?}"),
        }
    }

    #[test]
    fn test_positional_after_kwarg_rejected() {
        let err = parse("{{ f(a=1, 2) }}").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Syntax);
        assert!(err.message.contains("positional argument"));
    }

    #[test]
    fn test_elif_desugars() {
        let stmt = parse_stmt_of("{% if a %}1{% elif b %}2{% else %}3{% endif %}");
        match stmt {
            StmtKind::IfCond(if_cond) => {
                assert_eq!(if_cond.false_body.len(), 1);
                match &if_cond.false_body[0].node {
                    StmtKind::IfCond(inner) => {
                        assert_eq!(inner.true_body.len(), 1);
                        assert_eq!(inner.false_body.len(), 1);
                    }
                    node => panic!("expected nested if, got {node:?}"),
                }
            }
            node => panic!("unexpected node {node:?}"),
        }
    }

    #[test]
    fn test_for_unpack_filter_recursive() {
        let stmt = parse_stmt_of(
            "{% for a, b in items if a recursive %}x{% else %}y{% endfor %}",
        );
        match stmt {
            StmtKind::ForLoop(for_loop) => {
                assert!(matches!(for_loop.target.node, ExprKind::List(_)));
                assert!(for_loop.filter_expr.is_some());
                assert!(for_loop.recursive);
                assert_eq!(for_loop.else_body.len(), 1);
            }
            node => panic!("unexpected node {node:?}"),
        }
    }

    #[test]
    fn test_macro_defaults() {
        let stmt = parse_stmt_of("{% macro input(name, type=\"text\") %}x{% endmacro %}");
        match stmt {
            StmtKind::Macro(macro_decl) => {
                assert_eq!(macro_decl.name, "input");
                assert_eq!(macro_decl.args.len(), 2);
                assert_eq!(macro_decl.defaults.len(), 1);
            }
            node => panic!("unexpected node {node:?}"),
        }
    }

    #[test]
    fn test_non_default_after_default_rejected() {
        let err = parse("{% macro m(a=1, b) %}{% endmacro %}").unwrap_err();
        assert!(err.message.contains("non-default argument"));
    }

    #[test]
    fn test_reserved_target_rejected() {
        let err = parse("{% set loop = 1 %}").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Syntax);
        assert!(err.message.contains("reserved"));
    }

    #[test]
    fn test_set_block_with_filter() {
        let stmt = parse_stmt_of("{% set greeting | escape %}hi{% endset %}");
        match stmt {
            StmtKind::SetBlock(set_block) => {
                assert!(set_block.filter.is_some());
                assert_eq!(set_block.body.len(), 1);
            }
            node => panic!("unexpected node {node:?}"),
        }
    }

    #[test]
    fn test_slice() {
        let expr = parse_expr_of("{{ items[1:-1:2] }}");
        match expr.node {
            ExprKind::Slice {
                start, stop, step, ..
            } => {
                assert!(start.is_some());
                assert!(stop.is_some());
                assert!(step.is_some());
            }
            node => panic!("unexpected node {node:?}"),
        }
    }

    #[test]
    fn test_unknown_statement() {
        let err = parse("{% frobnicate %}").unwrap_err();
        assert!(err.message.contains("unknown statement"));
    }

    #[test]
    fn test_unclosed_block_reports_expected() {
        let err = parse("{% if a %}x").unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_recursion_limit() {
        let source = format!("{{{{ {}1{} }}}}", "[".repeat(200), "]".repeat(200));
        let err = parse(&source).unwrap_err();
        assert!(err.message.contains("nesting depth"));
    }

    #[test]
    fn test_parse_is_deterministic() {
        let source = "{% for x in items %}{{ x.name | escape }}{% endfor %}";
        let a = format!("{:?}", parse(source).unwrap());
        let b = format!("{:?}", parse(source).unwrap());
        assert_eq!(a, b);
    }
}

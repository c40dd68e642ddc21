//! The template tokenizer.
//!
//! [`Tokenizer`] is a lazy token producer over the source text. It has
//! two states: scanning template data, and scanning inside an
//! expression or block. Entering `{{` or `{%` flips to expression
//! mode; the matching `}}` or `%}` flips back. Comments (`{# ... #}`)
//! are consumed silently, and `{% raw %}...{% endraw %}` emits the
//! enclosed span verbatim as a single template-data token.

use crate::ast::span::Span;
use crate::error::{Error, ErrorKind};
use crate::parser::tokens::Token;

const VARIABLE_START: &str = "{{";
const VARIABLE_END: &str = "}}";
const BLOCK_START: &str = "{%";
const BLOCK_END: &str = "%}";
const COMMENT_START: &str = "{#";
const COMMENT_END: &str = "#}";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LexerState {
    /// Scanning raw template data.
    Template,
    /// Inside `{{ ... }}`.
    InVariable,
    /// Inside `{% ... %}`.
    InBlock,
}

/// Lazy token producer; see the module docs.
pub struct Tokenizer<'s> {
    rest: &'s str,
    state: LexerState,
    /// Open parens, brackets, and braces inside the current
    /// expression; `}}` and `%}` only close the construct at depth 0.
    paren_depth: usize,
    /// Lexing a bare expression with no surrounding delimiters.
    standalone: bool,
    offset: usize,
    line: u32,
    col: u32,
    failed: bool,
}

impl<'s> Tokenizer<'s> {
    /// Create a tokenizer over `source`.
    ///
    /// A single trailing line ending is stripped first so that an
    /// inline template does not emit a phantom blank line.
    pub fn new(source: &'s str) -> Tokenizer<'s> {
        let source = source
            .strip_suffix('\n')
            .or_else(|| source.strip_suffix('\r'))
            .unwrap_or(source);
        Tokenizer {
            rest: source,
            state: LexerState::Template,
            paren_depth: 0,
            standalone: false,
            offset: 0,
            line: 1,
            col: 1,
            failed: false,
        }
    }

    /// Create a tokenizer over a bare expression, as used outside of
    /// any template: no `{{ ... }}` delimiters, and end of input is a
    /// normal stop rather than an error.
    pub fn new_expr(source: &'s str) -> Tokenizer<'s> {
        Tokenizer {
            rest: source,
            state: LexerState::InVariable,
            paren_depth: 0,
            standalone: true,
            offset: 0,
            line: 1,
            col: 1,
            failed: false,
        }
    }

    fn loc(&self) -> (u32, u32, usize) {
        (self.line, self.col, self.offset)
    }

    fn span_from(&self, start: (u32, u32, usize)) -> Span {
        Span {
            start_line: start.0,
            start_col: start.1,
            start_offset: start.2 as u32,
            end_line: self.line,
            end_col: self.col,
            end_offset: self.offset as u32,
        }
    }

    /// Advance over `n` bytes, tracking lines and columns, and return
    /// the consumed text.
    fn advance(&mut self, n: usize) -> &'s str {
        let (skipped, rest) = self.rest.split_at(n);
        for c in skipped.chars() {
            if c == '\n' {
                self.line += 1;
                self.col = 1;
            } else {
                self.col += 1;
            }
        }
        self.offset += n;
        self.rest = rest;
        skipped
    }

    fn syntax_error(&mut self, msg: &str, start: (u32, u32, usize)) -> Error {
        self.failed = true;
        Error::syntax(msg.to_string(), self.span_from(start))
    }

    fn eof_error(&mut self, msg: &str, start: (u32, u32, usize)) -> Error {
        self.failed = true;
        Error::new(ErrorKind::UnexpectedEof, msg.to_string())
            .with_span(self.span_from(start))
    }

    /// Produce the next token, or `None` at the end of input.
    pub fn next_token(&mut self) -> Result<Option<(Token, Span)>, Error> {
        loop {
            if self.failed {
                return Ok(None);
            }
            if self.rest.is_empty() {
                if self.state == LexerState::Template || self.standalone {
                    return Ok(None);
                }
                let start = self.loc();
                return Err(self.eof_error("unexpected end of template", start));
            }
            match self.state {
                LexerState::Template => match self.tokenize_template_data()? {
                    Some(rv) => return Ok(Some(rv)),
                    // a comment was skipped; scan again
                    None => continue,
                },
                LexerState::InVariable | LexerState::InBlock => {
                    return self.tokenize_expr();
                }
            }
        }
    }

    fn tokenize_template_data(&mut self) -> Result<Option<(Token, Span)>, Error> {
        let start = self.loc();

        if let Some(tail) = self.rest.strip_prefix(COMMENT_START) {
            match tail.find(COMMENT_END) {
                Some(end) => {
                    self.advance(COMMENT_START.len() + end + COMMENT_END.len());
                    return Ok(None);
                }
                None => return Err(self.eof_error("unclosed comment", start)),
            }
        }
        if self.rest.starts_with(VARIABLE_START) {
            self.advance(VARIABLE_START.len());
            self.state = LexerState::InVariable;
            return Ok(Some((Token::VariableStart, self.span_from(start))));
        }
        if self.rest.starts_with(BLOCK_START) {
            if let Some(rv) = self.tokenize_raw_block(start)? {
                return Ok(Some(rv));
            }
            self.advance(BLOCK_START.len());
            self.state = LexerState::InBlock;
            return Ok(Some((Token::BlockStart, self.span_from(start))));
        }

        // plain template data up to the next construct
        let end = match self.rest[1..].find('{') {
            Some(idx) => {
                let mut end = idx + 1;
                // keep scanning while `{` is not a construct opener
                loop {
                    let tail = &self.rest[end..];
                    if tail.starts_with(VARIABLE_START)
                        || tail.starts_with(BLOCK_START)
                        || tail.starts_with(COMMENT_START)
                    {
                        break end;
                    }
                    match tail[1..].find('{') {
                        Some(idx) => end += idx + 1,
                        None => break self.rest.len(),
                    }
                }
            }
            None => self.rest.len(),
        };
        let data = self.advance(end).to_string();
        Ok(Some((Token::TemplateData(data), self.span_from(start))))
    }

    /// Handle `{% raw %}...{% endraw %}` entirely inside the
    /// tokenizer: the enclosed span becomes one template-data token.
    fn tokenize_raw_block(
        &mut self,
        start: (u32, u32, usize),
    ) -> Result<Option<(Token, Span)>, Error> {
        let tail = &self.rest[BLOCK_START.len()..];
        let trimmed = tail.trim_start();
        if !trimmed.starts_with("raw") {
            return Ok(None);
        }
        let after_kw = trimmed["raw".len()..].trim_start();
        if !after_kw.starts_with(BLOCK_END) {
            return Ok(None);
        }
        let body_start =
            self.rest.len() - after_kw.len() + BLOCK_END.len();

        // find {% endraw %} allowing arbitrary padding
        let mut search = body_start;
        let body_end = loop {
            let hay = &self.rest[search..];
            match hay.find(BLOCK_START) {
                Some(idx) => {
                    let cand = &hay[idx + BLOCK_START.len()..];
                    let cand_trim = cand.trim_start();
                    if let Some(after) = cand_trim.strip_prefix("endraw") {
                        if after.trim_start().starts_with(BLOCK_END) {
                            break search + idx;
                        }
                    }
                    search += idx + BLOCK_START.len();
                }
                None => return Err(self.eof_error("unclosed raw block", start)),
            }
        };
        self.advance(body_start);
        let data_start = self.loc();
        let data = self.advance(body_end - body_start).to_string();
        let span = self.span_from(data_start);
        // consume the endraw tag
        let close = self.rest.find(BLOCK_END).map(|i| i + BLOCK_END.len());
        match close {
            Some(n) => {
                self.advance(n);
            }
            None => return Err(self.eof_error("unclosed raw block", start)),
        }
        Ok(Some((Token::TemplateData(data), span)))
    }

    fn tokenize_expr(&mut self) -> Result<Option<(Token, Span)>, Error> {
        // skip whitespace between tokens
        loop {
            let trimmed = self.rest.trim_start();
            if trimmed.len() == self.rest.len() {
                break;
            }
            self.advance(self.rest.len() - trimmed.len());
        }
        if self.rest.is_empty() {
            if self.standalone {
                return Ok(None);
            }
            let start = self.loc();
            return Err(self.eof_error("unexpected end of template", start));
        }

        let start = self.loc();

        if self.paren_depth == 0 {
            if self.state == LexerState::InVariable && self.rest.starts_with(VARIABLE_END) {
                self.advance(VARIABLE_END.len());
                self.state = LexerState::Template;
                return Ok(Some((Token::VariableEnd, self.span_from(start))));
            }
            if self.state == LexerState::InBlock && self.rest.starts_with(BLOCK_END) {
                self.advance(BLOCK_END.len());
                self.state = LexerState::Template;
                return Ok(Some((Token::BlockEnd, self.span_from(start))));
            }
        }

        // multi-character operators before their single-char prefixes
        let two: Option<Token> = match self.rest.get(..2) {
            Some("**") => Some(Token::Pow),
            Some("//") => Some(Token::FloorDiv),
            Some("==") => Some(Token::Eq),
            Some("!=") => Some(Token::Ne),
            Some("<=") => Some(Token::Lte),
            Some(">=") => Some(Token::Gte),
            _ => None,
        };
        if let Some(tok) = two {
            self.advance(2);
            return Ok(Some((tok, self.span_from(start))));
        }

        let c = match self.rest.chars().next() {
            Some(c) => c,
            None => return Ok(None),
        };
        let single: Option<Token> = match c {
            '+' => Some(Token::Plus),
            '-' => Some(Token::Minus),
            '*' => Some(Token::Mul),
            '/' => Some(Token::Div),
            '%' => Some(Token::Rem),
            '~' => Some(Token::Tilde),
            '.' => Some(Token::Dot),
            ',' => Some(Token::Comma),
            ':' => Some(Token::Colon),
            '=' => Some(Token::Assign),
            '|' => Some(Token::Pipe),
            '<' => Some(Token::Lt),
            '>' => Some(Token::Gt),
            '(' => Some(Token::ParenOpen),
            ')' => Some(Token::ParenClose),
            '[' => Some(Token::BracketOpen),
            ']' => Some(Token::BracketClose),
            '{' => Some(Token::BraceOpen),
            '}' => Some(Token::BraceClose),
            _ => None,
        };
        if let Some(tok) = single {
            match c {
                '(' | '[' | '{' => self.paren_depth += 1,
                ')' | ']' | '}' => self.paren_depth = self.paren_depth.saturating_sub(1),
                _ => {}
            }
            self.advance(1);
            return Ok(Some((tok, self.span_from(start))));
        }

        if c == '"' || c == '\'' {
            return self.tokenize_string(c, start).map(Some);
        }
        if c.is_ascii_digit() {
            return self.tokenize_number(start).map(Some);
        }
        if c.is_alphabetic() || c == '_' {
            let end = self
                .rest
                .char_indices()
                .find(|(_, c)| !c.is_alphanumeric() && *c != '_')
                .map(|(idx, _)| idx)
                .unwrap_or(self.rest.len());
            let ident = self.advance(end).to_string();
            return Ok(Some((Token::Ident(ident), self.span_from(start))));
        }

        Err(self.syntax_error(&format!("unexpected character {c:?}"), start))
    }

    fn tokenize_string(
        &mut self,
        quote: char,
        start: (u32, u32, usize),
    ) -> Result<(Token, Span), Error> {
        self.advance(1);
        let mut has_escapes = false;
        let mut end = None;
        let mut iter = self.rest.char_indices();
        while let Some((idx, c)) = iter.next() {
            match c {
                '\\' => {
                    has_escapes = true;
                    iter.next();
                }
                c if c == quote => {
                    end = Some(idx);
                    break;
                }
                _ => {}
            }
        }
        let end = match end {
            Some(end) => end,
            None => return Err(self.eof_error("unterminated string", start)),
        };
        let raw = self.advance(end).to_string();
        self.advance(1);
        let span = self.span_from(start);
        if !has_escapes {
            return Ok((Token::Str(raw), span));
        }
        match unescape_string(&raw) {
            Ok(s) => Ok((Token::Str(s), span)),
            Err(mut err) => {
                self.failed = true;
                err = err.with_span(span);
                Err(err)
            }
        }
    }

    fn tokenize_number(&mut self, start: (u32, u32, usize)) -> Result<(Token, Span), Error> {
        let mut is_float = false;
        let mut end = 0;
        let bytes = self.rest.as_bytes();
        while end < bytes.len() {
            let b = bytes[end];
            match b {
                b'0'..=b'9' => end += 1,
                // a fraction dot, but not the start of an attribute
                b'.' if !is_float
                    && bytes
                        .get(end + 1)
                        .map(|c| c.is_ascii_digit())
                        .unwrap_or(false) =>
                {
                    is_float = true;
                    end += 1;
                }
                b'e' | b'E' if end > 0 => {
                    is_float = true;
                    end += 1;
                    if matches!(bytes.get(end), Some(b'+') | Some(b'-')) {
                        end += 1;
                    }
                }
                _ => break,
            }
        }
        let raw = self.advance(end);
        let span = self.span_from(start);
        if is_float {
            match raw.parse::<f64>() {
                Ok(v) => Ok((Token::Float(v), span)),
                Err(_) => {
                    self.failed = true;
                    Err(Error::syntax(format!("invalid float {raw:?}"), span))
                }
            }
        } else if let Ok(v) = raw.parse::<i64>() {
            Ok((Token::Int(v), span))
        } else if let Ok(v) = raw.parse::<u64>() {
            Ok((Token::UInt(v), span))
        } else {
            self.failed = true;
            Err(Error::syntax(format!("invalid integer {raw:?}"), span))
        }
    }
}

/// Apply string escapes: `\"`, `\\`, `\/`, `\b`, `\f`, `\n`, `\r`,
/// `\t`, `\'`, and `\uXXXX` with UTF-16 surrogate-pair decoding.
fn unescape_string(raw: &str) -> Result<String, Error> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();

    fn hex4(chars: &mut std::str::Chars<'_>) -> Option<u16> {
        let mut rv = 0u16;
        for _ in 0..4 {
            let c = chars.next()?;
            rv = rv.checked_mul(16)?.checked_add(c.to_digit(16)? as u16)?;
        }
        Some(rv)
    }

    let bad_escape = || Error::new(ErrorKind::BadEscape, "invalid string escape");

    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next().ok_or_else(bad_escape)? {
            '"' => out.push('"'),
            '\'' => out.push('\''),
            '\\' => out.push('\\'),
            '/' => out.push('/'),
            'b' => out.push('\u{0008}'),
            'f' => out.push('\u{000C}'),
            'n' => out.push('\n'),
            'r' => out.push('\r'),
            't' => out.push('\t'),
            'u' => {
                let hi = hex4(&mut chars).ok_or_else(bad_escape)?;
                if (0xD800..0xDC00).contains(&hi) {
                    // leading surrogate; a trailing one must follow
                    if chars.next() != Some('\\') || chars.next() != Some('u') {
                        return Err(bad_escape());
                    }
                    let lo = hex4(&mut chars).ok_or_else(bad_escape)?;
                    if !(0xDC00..0xE000).contains(&lo) {
                        return Err(bad_escape());
                    }
                    let c = 0x10000
                        + ((hi as u32 - 0xD800) << 10)
                        + (lo as u32 - 0xDC00);
                    out.push(char::from_u32(c).ok_or_else(bad_escape)?);
                } else {
                    out.push(char::from_u32(hi as u32).ok_or_else(bad_escape)?);
                }
            }
            _ => return Err(bad_escape()),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex(source: &str) -> Vec<Token> {
        let mut tokenizer = Tokenizer::new(source);
        let mut tokens = Vec::new();
        while let Some((tok, _)) = tokenizer.next_token().unwrap() {
            tokens.push(tok);
        }
        tokens
    }

    #[test]
    fn test_plain_data() {
        assert_eq!(
            lex("Hello, world!"),
            vec![Token::TemplateData("Hello, world!".into())]
        );
    }

    #[test]
    fn test_variable() {
        assert_eq!(
            lex("Hello {{ name }}!"),
            vec![
                Token::TemplateData("Hello ".into()),
                Token::VariableStart,
                Token::Ident("name".into()),
                Token::VariableEnd,
                Token::TemplateData("!".into()),
            ]
        );
    }

    #[test]
    fn test_lone_brace_is_data() {
        assert_eq!(
            lex("a { b } c"),
            vec![Token::TemplateData("a { b } c".into())]
        );
    }

    #[test]
    fn test_comment_skipped() {
        assert_eq!(
            lex("a{# note #}b"),
            vec![
                Token::TemplateData("a".into()),
                Token::TemplateData("b".into()),
            ]
        );
    }

    #[test]
    fn test_raw_block() {
        assert_eq!(
            lex("{% raw %}Hello {{ name }}{% endraw %}"),
            vec![Token::TemplateData("Hello {{ name }}".into())]
        );
    }

    #[test]
    fn test_operators() {
        assert_eq!(
            lex("{{ 2 ** 3 + 1 // 2 }}"),
            vec![
                Token::VariableStart,
                Token::Int(2),
                Token::Pow,
                Token::Int(3),
                Token::Plus,
                Token::Int(1),
                Token::FloorDiv,
                Token::Int(2),
                Token::VariableEnd,
            ]
        );
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(
            lex(r#"{{ "a\nbA😀" }}"#),
            vec![
                Token::VariableStart,
                Token::Str("a\nbA😀".into()),
                Token::VariableEnd,
            ]
        );
    }

    #[test]
    fn test_bad_escape() {
        let mut tokenizer = Tokenizer::new(r#"{{ "a\qb" }}"#);
        tokenizer.next_token().unwrap();
        let err = tokenizer.next_token().unwrap_err();
        assert_eq!(err.kind, ErrorKind::BadEscape);
    }

    #[test]
    fn test_unterminated_string() {
        let mut tokenizer = Tokenizer::new(r#"{{ "abc }}"#);
        tokenizer.next_token().unwrap();
        let err = tokenizer.next_token().unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_trailing_newline_stripped() {
        assert_eq!(lex("x\n"), vec![Token::TemplateData("x".into())]);
        assert_eq!(
            lex("x\n\n"),
            vec![Token::TemplateData("x\n".into())]
        );
    }

    #[test]
    fn test_float_vs_attribute_dot() {
        assert_eq!(
            lex("{{ 1.5 }}{{ a.b }}"),
            vec![
                Token::VariableStart,
                Token::Float(1.5),
                Token::VariableEnd,
                Token::VariableStart,
                Token::Ident("a".into()),
                Token::Dot,
                Token::Ident("b".into()),
                Token::VariableEnd,
            ]
        );
    }

    #[test]
    fn test_nested_braces_do_not_close_variable() {
        assert_eq!(
            lex(r#"{{ {"a": {"b": 1}} }}"#),
            vec![
                Token::VariableStart,
                Token::BraceOpen,
                Token::Str("a".into()),
                Token::Colon,
                Token::BraceOpen,
                Token::Str("b".into()),
                Token::Colon,
                Token::Int(1),
                Token::BraceClose,
                Token::BraceClose,
                Token::VariableEnd,
            ]
        );
    }

    #[test]
    fn test_standalone_expression() {
        let mut tokenizer = Tokenizer::new_expr("a + 1");
        let mut tokens = Vec::new();
        while let Some((tok, _)) = tokenizer.next_token().unwrap() {
            tokens.push(tok);
        }
        assert_eq!(
            tokens,
            vec![Token::Ident("a".into()), Token::Plus, Token::Int(1)]
        );
    }

    #[test]
    fn test_spans_track_lines() {
        let mut tokenizer = Tokenizer::new("ab\n{{ x }}");
        let (_, span) = tokenizer.next_token().unwrap().unwrap();
        assert_eq!(span.start_line, 1);
        let (tok, span) = tokenizer.next_token().unwrap().unwrap();
        assert_eq!(tok, Token::VariableStart);
        assert_eq!(span.start_line, 2);
        assert_eq!(span.start_col, 1);
        let (tok, span) = tokenizer.next_token().unwrap().unwrap();
        assert_eq!(tok, Token::Ident("x".into()));
        assert_eq!(span.start_col, 4);
    }
}

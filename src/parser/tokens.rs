use std::fmt;

/// A lexed token with its payload.
///
/// Template-data runs, identifiers, and literals carry owned copies of
/// the source text; punctuation and operators are plain tags.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    /// Raw template text between constructs.
    TemplateData(String),
    /// `{{`
    VariableStart,
    /// `}}`
    VariableEnd,
    /// `{%`
    BlockStart,
    /// `%}`
    BlockEnd,
    Ident(String),
    Str(String),
    Int(i64),
    UInt(u64),
    Float(f64),
    Plus,
    Minus,
    Mul,
    Div,
    FloorDiv,
    Rem,
    Pow,
    Tilde,
    Dot,
    Comma,
    Colon,
    Assign,
    Pipe,
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
    ParenOpen,
    ParenClose,
    BracketOpen,
    BracketClose,
    BraceOpen,
    BraceClose,
}

impl Token {
    /// Short human description for syntax errors.
    pub fn describe(&self) -> &'static str {
        match self {
            Token::TemplateData(_) => "template data",
            Token::VariableStart => "start of variable block",
            Token::VariableEnd => "end of variable block",
            Token::BlockStart => "start of block",
            Token::BlockEnd => "end of block",
            Token::Ident(_) => "identifier",
            Token::Str(_) => "string",
            Token::Int(_) | Token::UInt(_) => "integer",
            Token::Float(_) => "float",
            Token::Plus => "`+`",
            Token::Minus => "`-`",
            Token::Mul => "`*`",
            Token::Div => "`/`",
            Token::FloorDiv => "`//`",
            Token::Rem => "`%`",
            Token::Pow => "`**`",
            Token::Tilde => "`~`",
            Token::Dot => "`.`",
            Token::Comma => "`,`",
            Token::Colon => "`:`",
            Token::Assign => "`=`",
            Token::Pipe => "`|`",
            Token::Eq => "`==`",
            Token::Ne => "`!=`",
            Token::Lt => "`<`",
            Token::Lte => "`<=`",
            Token::Gt => "`>`",
            Token::Gte => "`>=`",
            Token::ParenOpen => "`(`",
            Token::ParenClose => "`)`",
            Token::BracketOpen => "`[`",
            Token::BracketClose => "`]`",
            Token::BraceOpen => "`{`",
            Token::BraceClose => "`}`",
        }
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

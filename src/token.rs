//! Token types produced by `crate::lexer`. RR's grammar (spec.md §4.1) has
//! no reserved-word keyword class at the lexer level — `if`/`while`/`inc`/
//! etc. are plain identifiers that the compiler recognizes by text; only
//! punctuation and literals get dedicated variants here.

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Number(String),
    String(String),
    Ident(String),

    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Semicolon,
    Comma,
    Colon,
    Dot,
    At,
    Amp,
    Question,
    Bang,

    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    StarStar,
    SlashSlash,
    PercentPercent,

    Assign,
    PlusEq,
    MinusEq,
    StarEq,
    SlashEq,
    PercentEq,
    PercentPercentEq,
    SlashSlashEq,
    StarStarEq,
    ColonEq,

    EqEq,
    NotEq,
    Lt,
    Gt,
    Lte,
    Gte,
    AndAnd,
    OrOr,

    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub line: i64,
}

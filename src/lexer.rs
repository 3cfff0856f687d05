//! Lexer primitives (spec.md §2.2, §4.1): character predicates, a
//! comment-and-whitespace skipper, and scanners that consume a maximal run
//! satisfying a predicate. Grounded on the teacher's single-lookahead
//! `Lexer { input, pos, line }` shape (`examples/ajokela-kz80_microperl/src/lexer.rs`),
//! adapted to RR's own token set and escape rules.

use crate::error::{CompileError, CompileErrorKind, CompileResult};
use crate::token::{Spanned, Token};

pub fn is_digit(c: char) -> bool {
    c.is_ascii_digit()
}

pub fn is_alpha(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

pub fn is_ident_start(c: char) -> bool {
    is_alpha(c)
}

pub fn is_ident_continue(c: char) -> bool {
    is_alpha(c) || is_digit(c)
}

pub fn is_operator_char(c: char) -> bool {
    matches!(
        c,
        '+' | '-' | '*' | '/' | '%' | '=' | '!' | '<' | '>' | '&' | '|' | ':' | '.' | '@'
    )
}

pub fn is_whitespace(c: char) -> bool {
    matches!(c, ' ' | '\t' | '\r' | '\n')
}

pub struct Lexer<'a> {
    module: &'a str,
    chars: Vec<char>,
    pos: usize,
    line: i64,
    unget: Option<Spanned>,
}

impl<'a> Lexer<'a> {
    pub fn new(module: &'a str, source: &str) -> Lexer<'a> {
        Lexer {
            module,
            chars: source.chars().collect(),
            pos: 0,
            line: 1,
            unget: None,
        }
    }

    fn current(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.current();
        if c == Some('\n') {
            self.line += 1;
        }
        if c.is_some() {
            self.pos += 1;
        }
        c
    }

    fn error(&self, kind: CompileErrorKind) -> CompileError {
        CompileError {
            module: self.module.to_string(),
            line: self.line,
            kind,
        }
    }

    /// Comments start with `#` and run to end-of-line; skipped alongside
    /// whitespace before every token operation (spec.md §4.1 lexing).
    fn skip_comments_and_whitespace(&mut self) {
        loop {
            match self.current() {
                Some(c) if is_whitespace(c) => {
                    self.advance();
                }
                Some('#') => {
                    while let Some(c) = self.current() {
                        if c == '\n' {
                            break;
                        }
                        self.advance();
                    }
                }
                _ => break,
            }
        }
    }

    fn scan_while(&mut self, pred: impl Fn(char) -> bool) -> String {
        let mut out = String::new();
        while let Some(c) = self.current() {
            if pred(c) {
                out.push(c);
                self.advance();
            } else {
                break;
            }
        }
        out
    }

    fn scan_identifier(&mut self) -> String {
        self.scan_while(is_ident_continue)
    }

    fn scan_number(&mut self) -> String {
        let mut text = self.scan_while(is_digit);
        if self.current() == Some('.') && self.peek_at(1).map(is_digit).unwrap_or(false) {
            text.push('.');
            self.advance();
            text.push_str(&self.scan_while(is_digit));
        }
        text
    }

    /// Accepts `\" \\ \/ \b \f \n \r \t`; anything else is fatal (spec.md
    /// §4.1). The raw escape (with its backslash) is kept in the token text
    /// — expansion into bytes happens in the assembler's data store, per
    /// spec.md §9.
    fn scan_string(&mut self) -> CompileResult<String> {
        self.advance(); // opening quote
        let mut out = String::new();
        loop {
            match self.advance() {
                None => {
                    return Err(self.error(CompileErrorKind::UnexpectedChar('"')));
                }
                Some('"') => break,
                Some('\\') => {
                    let esc = self.advance().ok_or_else(|| {
                        self.error(CompileErrorKind::UnexpectedChar('\\'))
                    })?;
                    if !matches!(esc, '"' | '\\' | '/' | 'b' | 'f' | 'n' | 'r' | 't') {
                        return Err(self.error(CompileErrorKind::UnknownEscape(esc)));
                    }
                    out.push('\\');
                    out.push(esc);
                }
                Some(c) => out.push(c),
            }
        }
        Ok(out)
    }

    pub fn unget(&mut self, spanned: Spanned) {
        self.unget = Some(spanned);
    }

    pub fn next_token(&mut self) -> CompileResult<Spanned> {
        if let Some(s) = self.unget.take() {
            return Ok(s);
        }
        self.skip_comments_and_whitespace();
        let line = self.line;
        let c = match self.current() {
            Some(c) => c,
            None => return Ok(Spanned { token: Token::Eof, line }),
        };

        if is_digit(c) {
            let text = self.scan_number();
            return Ok(Spanned { token: Token::Number(text), line });
        }
        if is_ident_start(c) {
            let text = self.scan_identifier();
            return Ok(Spanned { token: Token::Ident(text), line });
        }
        if c == '"' {
            let text = self.scan_string()?;
            return Ok(Spanned { token: Token::String(text), line });
        }

        macro_rules! two {
            ($second:expr, $two_tok:expr, $one_tok:expr) => {{
                self.advance();
                if self.current() == Some($second) {
                    self.advance();
                    $two_tok
                } else {
                    $one_tok
                }
            }};
        }

        let token = match c {
            '(' => { self.advance(); Token::LParen }
            ')' => { self.advance(); Token::RParen }
            '{' => { self.advance(); Token::LBrace }
            '}' => { self.advance(); Token::RBrace }
            '[' => { self.advance(); Token::LBracket }
            ']' => { self.advance(); Token::RBracket }
            ';' => { self.advance(); Token::Semicolon }
            ',' => { self.advance(); Token::Comma }
            '.' => { self.advance(); Token::Dot }
            '@' => { self.advance(); Token::At }
            '?' => { self.advance(); Token::Question }
            '!' => two!('=', Token::NotEq, Token::Bang),
            '=' => two!('=', Token::EqEq, Token::Assign),
            '<' => two!('=', Token::Lte, Token::Lt),
            '>' => two!('=', Token::Gte, Token::Gt),
            '&' => two!('&', Token::AndAnd, Token::Amp),
            '|' => two!('|', Token::OrOr, {
                return Err(self.error(CompileErrorKind::UnexpectedChar('|')));
            }),
            ':' => two!('=', Token::ColonEq, Token::Colon),
            '+' => two!('=', Token::PlusEq, Token::Plus),
            '-' => two!('=', Token::MinusEq, Token::Minus),
            '*' => {
                self.advance();
                if self.current() == Some('*') {
                    self.advance();
                    if self.current() == Some('=') {
                        self.advance();
                        Token::StarStarEq
                    } else {
                        Token::StarStar
                    }
                } else if self.current() == Some('=') {
                    self.advance();
                    Token::StarEq
                } else {
                    Token::Star
                }
            }
            '/' => {
                self.advance();
                if self.current() == Some('/') {
                    self.advance();
                    if self.current() == Some('=') {
                        self.advance();
                        Token::SlashSlashEq
                    } else {
                        Token::SlashSlash
                    }
                } else if self.current() == Some('=') {
                    self.advance();
                    Token::SlashEq
                } else {
                    Token::Slash
                }
            }
            '%' => {
                self.advance();
                if self.current() == Some('%') {
                    self.advance();
                    if self.current() == Some('=') {
                        self.advance();
                        Token::PercentPercentEq
                    } else {
                        Token::PercentPercent
                    }
                } else if self.current() == Some('=') {
                    self.advance();
                    Token::PercentEq
                } else {
                    Token::Percent
                }
            }
            other => {
                if is_operator_char(other) {
                    return Err(self.error(CompileErrorKind::UnexpectedChar(other)));
                }
                return Err(self.error(CompileErrorKind::UnexpectedChar(other)));
            }
        };
        Ok(Spanned { token, line })
    }

    pub fn line(&self) -> i64 {
        self.line
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(src: &str) -> Vec<Token> {
        let mut lx = Lexer::new("test", src);
        let mut out = Vec::new();
        loop {
            let s = lx.next_token().unwrap();
            if s.token == Token::Eof {
                break;
            }
            out.push(s.token);
        }
        out
    }

    #[test]
    fn skips_comments() {
        assert_eq!(tokens("1 # hi\n2"), vec![Token::Number("1".into()), Token::Number("2".into())]);
    }

    #[test]
    fn scans_floats() {
        assert_eq!(tokens("3.5"), vec![Token::Number("3.5".into())]);
    }

    #[test]
    fn rejects_unknown_escape() {
        let mut lx = Lexer::new("test", "\"\\q\"");
        assert!(lx.next_token().is_err());
    }

    #[test]
    fn unget_replays_one_token() {
        let mut lx = Lexer::new("test", "a b");
        let first = lx.next_token().unwrap();
        lx.unget(first.clone());
        let replayed = lx.next_token().unwrap();
        assert_eq!(replayed, first);
    }
}

//! Token-level representation of expression text.
//!
//! Every later stage (inlining, dependency scans, backend rewriting) works on
//! tokens rather than raw text. Identifiers are matched by token identity, so
//! `co2` never matches inside `co2Out`, and whitespace is kept as its own token
//! so that rendering an unmodified expression gives back the text as written.

use crate::error::{ModelError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TokenKind {
    Ident,
    Number,
    Operator,
    LParen,
    RParen,
    Comma,
    Space,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
}

impl Token {
    pub fn new(kind: TokenKind, text: impl Into<String>) -> Self {
        Self { kind, text: text.into() }
    }

    pub fn ident(text: impl Into<String>) -> Self {
        Self::new(TokenKind::Ident, text)
    }

    #[inline]
    pub fn is_space(&self) -> bool {
        self.kind == TokenKind::Space
    }
}

/// An expression held as a token sequence.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Expr {
    tokens: Vec<Token>,
}

impl Expr {
    /// Tokenizes `text` and checks that parentheses balance.
    pub fn parse(text: &str) -> Result<Self> {
        let tokens = tokenize(text)?;
        check_balance(text, &tokens)?;
        Ok(Self { tokens })
    }

    pub fn from_tokens(tokens: Vec<Token>) -> Self {
        Self { tokens }
    }

    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    pub fn into_tokens(self) -> Vec<Token> {
        self.tokens
    }

    /// True when the expression is a single identifier or number, ignoring
    /// surrounding whitespace.
    pub fn is_atom(&self) -> bool {
        is_atom(&self.tokens)
    }

    /// The same expression without leading or trailing whitespace tokens.
    pub fn trimmed(&self) -> Expr {
        Expr::from_tokens(trim(&self.tokens).to_vec())
    }

    /// Identifiers used as values, in order of appearance. Call heads
    /// (`f` in `f(x)`) are excluded.
    pub fn identifiers(&self) -> impl Iterator<Item = &str> + '_ {
        self.tokens
            .iter()
            .enumerate()
            .filter(move |(i, t)| t.kind == TokenKind::Ident && !is_call_head(&self.tokens, *i))
            .map(|(_, t)| t.text.as_str())
    }

    /// Names of called functions, in order of appearance.
    pub fn call_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.tokens
            .iter()
            .enumerate()
            .filter(move |(i, t)| t.kind == TokenKind::Ident && is_call_head(&self.tokens, *i))
            .map(|(_, t)| t.text.as_str())
    }

    /// True when the text is exactly `name`, ignoring surrounding whitespace.
    pub fn is_name(&self, name: &str) -> bool {
        let core = trim(&self.tokens);
        core.len() == 1 && core[0].kind == TokenKind::Ident && core[0].text == name
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for token in &self.tokens {
            f.write_str(&token.text)?;
        }
        Ok(())
    }
}

impl FromStr for Expr {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self> {
        Expr::parse(s)
    }
}

pub fn render(tokens: &[Token]) -> String {
    tokens.iter().map(|t| t.text.as_str()).collect()
}

pub fn trim(tokens: &[Token]) -> &[Token] {
    let start = tokens.iter().position(|t| !t.is_space()).unwrap_or(tokens.len());
    let end = tokens.iter().rposition(|t| !t.is_space()).map_or(start, |i| i + 1);
    &tokens[start..end]
}

pub fn is_atom(tokens: &[Token]) -> bool {
    let core = trim(tokens);
    core.len() == 1 && matches!(core[0].kind, TokenKind::Ident | TokenKind::Number)
}

/// True when the whole sequence sits inside one pair of parentheses.
pub fn is_enclosed(tokens: &[Token]) -> bool {
    let core = trim(tokens);
    !core.is_empty() && core[0].kind == TokenKind::LParen && matching_paren(core, 0) == Some(core.len() - 1)
}

/// Returns `tokens` trimmed, wrapped in parentheses unless atomic or
/// already enclosed.
pub fn parenthesized(tokens: &[Token]) -> Vec<Token> {
    let core = trim(tokens);
    if is_atom(core) || is_enclosed(core) {
        return core.to_vec();
    }
    let mut out = Vec::with_capacity(core.len() + 2);
    out.push(Token::new(TokenKind::LParen, "("));
    out.extend_from_slice(core);
    out.push(Token::new(TokenKind::RParen, ")"));
    out
}

/// Index of the next non-whitespace token at or after `from`.
pub fn next_significant(tokens: &[Token], from: usize) -> Option<usize> {
    (from..tokens.len()).find(|&i| !tokens[i].is_space())
}

pub fn is_call_head(tokens: &[Token], index: usize) -> bool {
    tokens[index].kind == TokenKind::Ident
        && next_significant(tokens, index + 1).map_or(false, |j| tokens[j].kind == TokenKind::LParen)
}

/// Index of the parenthesis closing the one at `open`.
pub fn matching_paren(tokens: &[Token], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (i, token) in tokens.iter().enumerate().skip(open) {
        match token.kind {
            TokenKind::LParen => depth += 1,
            TokenKind::RParen => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Splits the tokens between a call's parentheses at top-level commas.
/// An argument list holding only whitespace yields no arguments.
pub fn split_arguments(inner: &[Token]) -> Vec<&[Token]> {
    if trim(inner).is_empty() {
        return Vec::new();
    }
    let mut args = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, token) in inner.iter().enumerate() {
        match token.kind {
            TokenKind::LParen => depth += 1,
            TokenKind::RParen => depth = depth.saturating_sub(1),
            TokenKind::Comma if depth == 0 => {
                args.push(&inner[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    args.push(&inner[start..]);
    args
}

fn tokenize(text: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = text.chars().collect();
    let len = chars.len();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < len {
        let c = chars[i];
        let start = i;
        let kind = if c.is_whitespace() {
            while i < len && chars[i].is_whitespace() {
                i += 1;
            }
            TokenKind::Space
        } else if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).map_or(false, |d| d.is_ascii_digit())) {
            i = scan_number(&chars, i);
            TokenKind::Number
        } else if c.is_alphabetic() || c == '_' {
            i += 1;
            loop {
                if i < len && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                } else if i + 1 < len && chars[i] == '.' && (chars[i + 1].is_alphabetic() || chars[i + 1] == '_') {
                    // Qualified names such as `np.exp`
                    i += 2;
                } else {
                    break;
                }
            }
            TokenKind::Ident
        } else {
            let next = chars.get(i + 1).copied();
            match c {
                '(' => { i += 1; TokenKind::LParen }
                ')' => { i += 1; TokenKind::RParen }
                ',' => { i += 1; TokenKind::Comma }
                '*' => { i += if next == Some('*') { 2 } else { 1 }; TokenKind::Operator }
                '<' | '>' => { i += if next == Some('=') { 2 } else { 1 }; TokenKind::Operator }
                '=' | '!' if next == Some('=') => { i += 2; TokenKind::Operator }
                '+' | '-' | '/' | '%' | '&' | '|' => { i += 1; TokenKind::Operator }
                _ => return Err(ModelError::malformed(text, format!("unexpected character '{}'", c))),
            }
        };
        tokens.push(Token::new(kind, chars[start..i].iter().collect::<String>()));
    }
    Ok(tokens)
}

fn scan_number(chars: &[char], mut i: usize) -> usize {
    let len = chars.len();
    while i < len && chars[i].is_ascii_digit() {
        i += 1;
    }
    if i < len && chars[i] == '.' {
        i += 1;
        while i < len && chars[i].is_ascii_digit() {
            i += 1;
        }
    }
    if i < len && (chars[i] == 'e' || chars[i] == 'E') {
        let mut j = i + 1;
        if j < len && (chars[j] == '+' || chars[j] == '-') {
            j += 1;
        }
        if j < len && chars[j].is_ascii_digit() {
            i = j;
            while i < len && chars[i].is_ascii_digit() {
                i += 1;
            }
        }
    }
    i
}

fn check_balance(text: &str, tokens: &[Token]) -> Result<()> {
    let mut depth: i64 = 0;
    for token in tokens {
        match token.kind {
            TokenKind::LParen => depth += 1,
            TokenKind::RParen => {
                depth -= 1;
                if depth < 0 {
                    return Err(ModelError::malformed(text, "unbalanced parentheses"));
                }
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(ModelError::malformed(text, "unbalanced parentheses"));
    }
    Ok(())
}

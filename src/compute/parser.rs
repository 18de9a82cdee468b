//! Recursive-descent parser from expression tokens to a syntax tree.
//!
//! Precedence, lowest first: `|`, `&`, comparisons, `+ -`, `* / %`,
//! unary `- +`, `**` (right associative, and binding tighter than a unary
//! minus on its left).

use crate::analysis::expr::{Expr, Token, TokenKind};
use crate::error::{ModelError, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum Ast {
    Number(f64),
    Name(String),
    Unary(UnaryOp, Box<Ast>),
    Binary(BinaryOp, Box<Ast>, Box<Ast>),
    Call(String, Vec<Ast>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Pos,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Or,
    And,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Pow,
}

/// Binding strength of a unary sign, between `* / %` and `**`.
pub const UNARY_PRECEDENCE: u8 = 6;

impl BinaryOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Or => "|",
            BinaryOp::And => "&",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Rem => "%",
            BinaryOp::Pow => "**",
        }
    }

    pub fn precedence(&self) -> u8 {
        match self {
            BinaryOp::Or => 1,
            BinaryOp::And => 2,
            BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge | BinaryOp::Eq | BinaryOp::Ne => 3,
            BinaryOp::Add | BinaryOp::Sub => 4,
            BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => 5,
            BinaryOp::Pow => 7,
        }
    }

    fn from_symbol(symbol: &str) -> Option<Self> {
        Some(match symbol {
            "|" => BinaryOp::Or,
            "&" => BinaryOp::And,
            "<" => BinaryOp::Lt,
            "<=" => BinaryOp::Le,
            ">" => BinaryOp::Gt,
            ">=" => BinaryOp::Ge,
            "==" => BinaryOp::Eq,
            "!=" => BinaryOp::Ne,
            "+" => BinaryOp::Add,
            "-" => BinaryOp::Sub,
            "*" => BinaryOp::Mul,
            "/" => BinaryOp::Div,
            "%" => BinaryOp::Rem,
            "**" => BinaryOp::Pow,
            _ => return None,
        })
    }
}

/// Parses a whole expression. Trailing tokens are an error.
pub fn parse(expr: &Expr) -> Result<Ast> {
    let source = expr.to_string();
    let tokens: Vec<&Token> = expr.tokens().iter().filter(|t| !t.is_space()).collect();
    if tokens.is_empty() {
        return Err(ModelError::malformed(&source, "empty expression"));
    }
    let mut parser = Parser { tokens, pos: 0, source: &source };
    let ast = parser.parse_or()?;
    if let Some(extra) = parser.peek() {
        return Err(ModelError::malformed(&source, format!("unexpected '{}'", extra.text)));
    }
    Ok(ast)
}

struct Parser<'a> {
    tokens: Vec<&'a Token>,
    pos: usize,
    source: &'a str,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos).copied()
    }

    fn consume(&mut self) -> Option<&'a Token> {
        let token = self.peek()?;
        self.pos += 1;
        Some(token)
    }

    fn peek_operator(&self) -> Option<BinaryOp> {
        self.peek()
            .filter(|t| t.kind == TokenKind::Operator)
            .and_then(|t| BinaryOp::from_symbol(&t.text))
    }

    fn error(&self, reason: impl Into<String>) -> ModelError {
        ModelError::malformed(self.source, reason)
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> Result<()> {
        match self.consume() {
            Some(t) if t.kind == kind => Ok(()),
            Some(t) => Err(self.error(format!("expected {} but found '{}'", what, t.text))),
            None => Err(self.error(format!("expected {} at end of expression", what))),
        }
    }

    /// Left-associative loop over operators of one precedence level.
    fn parse_level(&mut self, level: u8, next: fn(&mut Self) -> Result<Ast>) -> Result<Ast> {
        let mut left = next(self)?;
        while let Some(op) = self.peek_operator().filter(|op| op.precedence() == level) {
            self.consume();
            let right = next(self)?;
            left = Ast::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_or(&mut self) -> Result<Ast> {
        self.parse_level(1, Self::parse_and)
    }

    fn parse_and(&mut self) -> Result<Ast> {
        self.parse_level(2, Self::parse_comparison)
    }

    fn parse_comparison(&mut self) -> Result<Ast> {
        self.parse_level(3, Self::parse_term)
    }

    fn parse_term(&mut self) -> Result<Ast> {
        self.parse_level(4, Self::parse_factor)
    }

    fn parse_factor(&mut self) -> Result<Ast> {
        self.parse_level(5, Self::parse_unary)
    }

    fn parse_unary(&mut self) -> Result<Ast> {
        match self.peek_operator() {
            Some(BinaryOp::Sub) => {
                self.consume();
                Ok(Ast::Unary(UnaryOp::Neg, Box::new(self.parse_unary()?)))
            }
            Some(BinaryOp::Add) => {
                self.consume();
                Ok(Ast::Unary(UnaryOp::Pos, Box::new(self.parse_unary()?)))
            }
            _ => self.parse_power(),
        }
    }

    fn parse_power(&mut self) -> Result<Ast> {
        let base = self.parse_primary()?;
        if self.peek_operator() == Some(BinaryOp::Pow) {
            self.consume();
            let exponent = self.parse_unary()?;
            return Ok(Ast::Binary(BinaryOp::Pow, Box::new(base), Box::new(exponent)));
        }
        Ok(base)
    }

    fn parse_primary(&mut self) -> Result<Ast> {
        let token = self
            .consume()
            .ok_or_else(|| self.error("unexpected end of expression"))?;
        match token.kind {
            TokenKind::Number => token
                .text
                .parse()
                .map(Ast::Number)
                .map_err(|_| self.error(format!("invalid number '{}'", token.text))),
            TokenKind::Ident => {
                if self.peek().map_or(false, |t| t.kind == TokenKind::LParen) {
                    self.consume();
                    let args = self.parse_arguments()?;
                    Ok(Ast::Call(token.text.clone(), args))
                } else {
                    Ok(Ast::Name(token.text.clone()))
                }
            }
            TokenKind::LParen => {
                let inner = self.parse_or()?;
                self.expect(TokenKind::RParen, "')'")?;
                Ok(inner)
            }
            _ => Err(self.error(format!("unexpected '{}'", token.text))),
        }
    }

    /// Arguments after an opening parenthesis, through the closing one.
    fn parse_arguments(&mut self) -> Result<Vec<Ast>> {
        let mut args = Vec::new();
        if self.peek().map_or(false, |t| t.kind == TokenKind::RParen) {
            self.consume();
            return Ok(args);
        }
        loop {
            args.push(self.parse_or()?);
            match self.consume() {
                Some(t) if t.kind == TokenKind::Comma => continue,
                Some(t) if t.kind == TokenKind::RParen => return Ok(args),
                Some(t) => return Err(self.error(format!("expected ',' or ')' but found '{}'", t.text))),
                None => return Err(self.error("unclosed argument list")),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ast(text: &str) -> Ast {
        parse(&Expr::parse(text).unwrap()).unwrap()
    }

    fn name(n: &str) -> Box<Ast> {
        Box::new(Ast::Name(n.into()))
    }

    fn num(v: f64) -> Box<Ast> {
        Box::new(Ast::Number(v))
    }

    #[test]
    fn test_unary_minus_binds_looser_than_power() {
        assert_eq!(
            ast("-x**2"),
            Ast::Unary(UnaryOp::Neg, Box::new(Ast::Binary(BinaryOp::Pow, name("x"), num(2.0))))
        );
    }

    #[test]
    fn test_power_is_right_associative_and_accepts_signed_exponent() {
        assert_eq!(
            ast("a**b**-c"),
            Ast::Binary(
                BinaryOp::Pow,
                name("a"),
                Box::new(Ast::Binary(
                    BinaryOp::Pow,
                    name("b"),
                    Box::new(Ast::Unary(UnaryOp::Neg, name("c")))
                ))
            )
        );
    }

    #[test]
    fn test_subtraction_is_left_associative() {
        assert_eq!(
            ast("a - b - c"),
            Ast::Binary(
                BinaryOp::Sub,
                Box::new(Ast::Binary(BinaryOp::Sub, name("a"), name("b"))),
                name("c")
            )
        );
    }

    #[test]
    fn test_comparison_below_arithmetic() {
        assert_eq!(
            ast("a + 1 > b"),
            Ast::Binary(BinaryOp::Gt, Box::new(Ast::Binary(BinaryOp::Add, name("a"), num(1.0))), name("b"))
        );
    }

    #[test]
    fn test_calls_with_qualified_names() {
        assert_eq!(
            ast("np.where(x, 1, 0)"),
            Ast::Call("np.where".into(), vec![Ast::Name("x".into()), Ast::Number(1.0), Ast::Number(0.0)])
        );
        assert_eq!(ast("k()"), Ast::Call("k".into(), vec![]));
    }

    #[rstest::rstest]
    #[case("a +")]
    #[case("a b")]
    #[case("()")]
    #[case("f(a b)")]
    #[case("*a")]
    #[case("   ")]
    fn test_malformed(#[case] text: &str) {
        let expr = Expr::parse(text).unwrap();
        assert!(matches!(parse(&expr), Err(ModelError::MalformedExpression { .. })));
    }
}

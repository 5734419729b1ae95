//! Restricted Formula Evaluator
//!
//! PID formulas are small arithmetic expressions over the data bytes of a
//! response, named `A` through `F` in frame order, e.g. `((A*256)+B)/4`.
//! Formulas are parsed once into an AST when the registry is built; only
//! numbers, the six byte variables, `+ - * /` and parentheses are accepted.

use crate::error::{DecodeError, FormulaError};
use std::fmt;

/// Names of the byte variables, in frame order
pub const VARIABLES: [char; 6] = ['A', 'B', 'C', 'D', 'E', 'F'];

#[derive(Debug, Clone, Copy, PartialEq)]
enum Token {
    Number(f64),
    Var(usize),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Number(f64),
    Var(usize),
    Neg(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
}

impl Expr {
    fn eval(&self, bytes: &[u8]) -> Result<f64, DecodeError> {
        match self {
            Expr::Number(n) => Ok(*n),
            Expr::Var(i) => bytes.get(*i).map(|b| f64::from(*b)).ok_or_else(|| {
                DecodeError::Malformed(format!("formula needs byte {}", VARIABLES[*i]))
            }),
            Expr::Neg(inner) => Ok(-inner.eval(bytes)?),
            Expr::Binary(op, lhs, rhs) => {
                let l = lhs.eval(bytes)?;
                let r = rhs.eval(bytes)?;
                let out = match op {
                    BinOp::Add => l + r,
                    BinOp::Sub => l - r,
                    BinOp::Mul => l * r,
                    BinOp::Div => {
                        if r == 0.0 {
                            return Err(DecodeError::ArithmeticError);
                        }
                        l / r
                    }
                };
                if out.is_finite() {
                    Ok(out)
                } else {
                    Err(DecodeError::ArithmeticError)
                }
            }
        }
    }

    fn max_var(&self) -> Option<usize> {
        match self {
            Expr::Number(_) => None,
            Expr::Var(i) => Some(*i),
            Expr::Neg(inner) => inner.max_var(),
            Expr::Binary(_, l, r) => match (l.max_var(), r.max_var()) {
                (Some(a), Some(b)) => Some(a.max(b)),
                (a, b) => a.or(b),
            },
        }
    }
}

fn tokenize(source: &str) -> Result<Vec<(usize, Token)>, FormulaError> {
    let chars: Vec<(usize, char)> = source.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (offset, c) = chars[i];
        match c {
            c if c.is_whitespace() => {
                i += 1;
            }
            '+' | '-' | '*' | '/' | '(' | ')' => {
                let token = match c {
                    '+' => Token::Plus,
                    '-' => Token::Minus,
                    '*' => Token::Star,
                    '/' => Token::Slash,
                    '(' => Token::LParen,
                    _ => Token::RParen,
                };
                tokens.push((offset, token));
                i += 1;
            }
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].1.is_ascii_digit() || chars[i].1 == '.') {
                    i += 1;
                }
                let literal: String = chars[start..i].iter().map(|(_, c)| *c).collect();
                let value = literal
                    .parse::<f64>()
                    .map_err(|_| FormulaError::InvalidNumber(literal.clone()))?;
                tokens.push((offset, Token::Number(value)));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].1.is_ascii_alphanumeric() || chars[i].1 == '_') {
                    i += 1;
                }
                let ident: String = chars[start..i].iter().map(|(_, c)| *c).collect();
                let upper = ident.to_ascii_uppercase();
                let index = match upper.as_str() {
                    "A" => 0,
                    "B" => 1,
                    "C" => 2,
                    "D" => 3,
                    "E" => 4,
                    "F" => 5,
                    _ => return Err(FormulaError::UnknownVariable(ident)),
                };
                tokens.push((offset, Token::Var(index)));
            }
            other => return Err(FormulaError::UnexpectedChar(other, offset)),
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<Token> {
        self.tokens.get(self.pos).map(|(_, t)| *t)
    }

    fn next(&mut self) -> Option<(usize, Token)> {
        let token = self.tokens.get(self.pos).copied();
        self.pos += 1;
        token
    }

    fn expr(&mut self) -> Result<Expr, FormulaError> {
        let mut lhs = self.term()?;
        while let Some(op) = self.peek().and_then(|t| match t {
            Token::Plus => Some(BinOp::Add),
            Token::Minus => Some(BinOp::Sub),
            _ => None,
        }) {
            self.pos += 1;
            let rhs = self.term()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn term(&mut self) -> Result<Expr, FormulaError> {
        let mut lhs = self.unary()?;
        while let Some(op) = self.peek().and_then(|t| match t {
            Token::Star => Some(BinOp::Mul),
            Token::Slash => Some(BinOp::Div),
            _ => None,
        }) {
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, FormulaError> {
        if self.peek() == Some(Token::Minus) {
            self.pos += 1;
            return Ok(Expr::Neg(Box::new(self.unary()?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, FormulaError> {
        match self.next() {
            Some((_, Token::Number(n))) => Ok(Expr::Number(n)),
            Some((_, Token::Var(i))) => Ok(Expr::Var(i)),
            Some((_, Token::LParen)) => {
                let inner = self.expr()?;
                match self.next() {
                    Some((_, Token::RParen)) => Ok(inner),
                    Some((offset, _)) => Err(FormulaError::UnexpectedToken(offset)),
                    None => Err(FormulaError::UnexpectedEnd),
                }
            }
            Some((offset, _)) => Err(FormulaError::UnexpectedToken(offset)),
            None => Err(FormulaError::UnexpectedEnd),
        }
    }
}

/// A parsed PID formula
#[derive(Debug, Clone, PartialEq)]
pub struct Formula {
    source: String,
    expr: Expr,
}

impl Formula {
    /// Parse a formula, rejecting anything outside the allowed grammar
    pub fn parse(source: &str) -> Result<Self, FormulaError> {
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Err(FormulaError::Empty);
        }

        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.expr()?;
        if let Some((offset, _)) = parser.tokens.get(parser.pos) {
            return Err(FormulaError::UnexpectedToken(*offset));
        }

        Ok(Self {
            source: source.trim().to_string(),
            expr,
        })
    }

    /// Evaluate against the data bytes of a response (A = `bytes[0]`)
    pub fn evaluate(&self, bytes: &[u8]) -> Result<f64, DecodeError> {
        self.expr.eval(bytes)
    }

    /// Number of leading bytes the formula reads (highest variable + 1)
    pub fn bytes_used(&self) -> usize {
        self.expr.max_var().map_or(0, |i| i + 1)
    }

    /// Original formula text
    pub fn source(&self) -> &str {
        &self.source
    }
}

impl fmt::Display for Formula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rpm_formula() {
        let formula = Formula::parse("((A*256)+B)/4").unwrap();
        let value = formula.evaluate(&[0x1A, 0x2B]).unwrap();
        assert!((value - 1674.75).abs() < 1e-9);
        assert_eq!(formula.bytes_used(), 2);
    }

    #[test]
    fn test_precedence_and_unary_minus() {
        let formula = Formula::parse("-A + B * 2 - (C - 1) / 2").unwrap();
        // -10 + 40 - 2
        let value = formula.evaluate(&[10, 20, 5]).unwrap();
        assert!((value - 28.0).abs() < 1e-9);
    }

    #[test]
    fn test_lowercase_variables_and_decimals() {
        let formula = Formula::parse("a * 0.5 - 64").unwrap();
        assert!((formula.evaluate(&[200]).unwrap() - 36.0).abs() < 1e-9);
    }

    #[test]
    fn test_constant_formula_reads_no_bytes() {
        let formula = Formula::parse("42").unwrap();
        assert_eq!(formula.bytes_used(), 0);
        assert_eq!(formula.evaluate(&[]).unwrap(), 42.0);
    }

    #[test]
    fn test_division_by_zero() {
        let formula = Formula::parse("100 / B").unwrap();
        assert_eq!(formula.evaluate(&[1, 0]), Err(DecodeError::ArithmeticError));
    }

    #[test]
    fn test_rejects_code_like_input() {
        assert!(matches!(
            Formula::parse("__import__('os')"),
            Err(FormulaError::UnknownVariable(_))
        ));
        assert!(matches!(
            Formula::parse("A; B"),
            Err(FormulaError::UnexpectedChar(';', 1))
        ));
        assert!(matches!(
            Formula::parse("G + 1"),
            Err(FormulaError::UnknownVariable(_))
        ));
        assert!(matches!(
            Formula::parse("A ** 2"),
            Err(FormulaError::UnexpectedToken(_))
        ));
        assert!(matches!(
            Formula::parse("1.2.3"),
            Err(FormulaError::InvalidNumber(_))
        ));
    }

    #[test]
    fn test_unbalanced_parentheses() {
        assert_eq!(Formula::parse("(A + 1"), Err(FormulaError::UnexpectedEnd));
        assert!(matches!(
            Formula::parse("A + 1)"),
            Err(FormulaError::UnexpectedToken(5))
        ));
        assert_eq!(Formula::parse("   "), Err(FormulaError::Empty));
    }

    #[test]
    fn test_missing_byte_is_malformed() {
        let formula = Formula::parse("A + B").unwrap();
        assert!(matches!(
            formula.evaluate(&[1]),
            Err(DecodeError::Malformed(_))
        ));
    }
}

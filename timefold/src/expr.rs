//! Arithmetic formulas for computed aggregate fields.
//!
//! A formula is parsed once, when the aggregator is configured, into a small
//! typed AST. It is then evaluated once per record with that record's numeric
//! fields bound as variables.
//!
//! # Grammar
//!
//! ```text
//! expr    := term (('+' | '-') term)*
//! term    := unary (('*' | '/' | '%') unary)*
//! unary   := ('+' | '-') unary | power
//! power   := primary ('^' unary)?
//! primary := number | ident | ident '(' expr (',' expr)* ')' | '(' expr ')'
//! ```
//!
//! `^` binds tighter than unary minus and is right associative, so
//! `-2^2 = -4` and `2^3^2 = 512`.
//!
//! # Example
//!
//! ```rust
//! use timefold::expr::Expression;
//!
//! let f = Expression::parse("(temp_f - 32) * 5 / 9").unwrap();
//! let celsius = f.evaluate_with(|name| (name == "temp_f").then_some(212.0)).unwrap();
//! assert_eq!(celsius, 100.0);
//! ```

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ExpressionError;
use crate::record::{Fields, value_as_f64};

/// Built-in functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    /// Absolute value.
    Abs,
    /// Arc cosine.
    Acos,
    /// Arc sine.
    Asin,
    /// Arc tangent.
    Atan,
    /// Cube root.
    Cbrt,
    /// Round towards positive infinity.
    Ceil,
    /// Cosine.
    Cos,
    /// Hyperbolic cosine.
    Cosh,
    /// `e^x`.
    Exp,
    /// Round towards negative infinity.
    Floor,
    /// Natural logarithm.
    Log,
    /// Base-10 logarithm.
    Log10,
    /// Base-2 logarithm.
    Log2,
    /// Sine.
    Sin,
    /// Hyperbolic sine.
    Sinh,
    /// Square root.
    Sqrt,
    /// Tangent.
    Tan,
    /// Hyperbolic tangent.
    Tanh,
    /// Sign of the argument: -1, 0 or 1.
    Signum,
    /// Smaller of two arguments.
    Min,
    /// Larger of two arguments.
    Max,
    /// First argument raised to the second.
    Pow,
}

impl Function {
    /// Resolves a function by name and argument count.
    fn resolve(name: &str, arity: usize) -> Option<Self> {
        let func = match name {
            "abs" => Self::Abs,
            "acos" => Self::Acos,
            "asin" => Self::Asin,
            "atan" => Self::Atan,
            "cbrt" => Self::Cbrt,
            "ceil" => Self::Ceil,
            "cos" => Self::Cos,
            "cosh" => Self::Cosh,
            "exp" => Self::Exp,
            "floor" => Self::Floor,
            "log" => Self::Log,
            "log10" => Self::Log10,
            "log2" => Self::Log2,
            "sin" => Self::Sin,
            "sinh" => Self::Sinh,
            "sqrt" => Self::Sqrt,
            "tan" => Self::Tan,
            "tanh" => Self::Tanh,
            "signum" => Self::Signum,
            "min" => Self::Min,
            "max" => Self::Max,
            "pow" => Self::Pow,
            _ => return None,
        };
        (func.arity() == arity).then_some(func)
    }

    /// Number of arguments the function takes.
    pub fn arity(self) -> usize {
        match self {
            Self::Min | Self::Max | Self::Pow => 2,
            _ => 1,
        }
    }

    fn apply(self, args: &[f64]) -> f64 {
        let x = args[0];
        match self {
            Self::Abs => x.abs(),
            Self::Acos => x.acos(),
            Self::Asin => x.asin(),
            Self::Atan => x.atan(),
            Self::Cbrt => x.cbrt(),
            Self::Ceil => x.ceil(),
            Self::Cos => x.cos(),
            Self::Cosh => x.cosh(),
            Self::Exp => x.exp(),
            Self::Floor => x.floor(),
            Self::Log => x.ln(),
            Self::Log10 => x.log10(),
            Self::Log2 => x.log2(),
            Self::Sin => x.sin(),
            Self::Sinh => x.sinh(),
            Self::Sqrt => x.sqrt(),
            Self::Tan => x.tan(),
            Self::Tanh => x.tanh(),
            Self::Signum => {
                if x == 0.0 {
                    0.0
                } else {
                    x.signum()
                }
            }
            Self::Min => x.min(args[1]),
            Self::Max => x.max(args[1]),
            Self::Pow => x.powf(args[1]),
        }
    }
}

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `/`
    Div,
    /// `%`
    Rem,
    /// `^`
    Pow,
}

/// Expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Numeric literal.
    Number(f64),
    /// Reference to a record field.
    Variable(String),
    /// Negation.
    Neg(Box<Expr>),
    /// Binary operation.
    Binary {
        /// Operator.
        op: BinaryOp,
        /// Left operand.
        lhs: Box<Expr>,
        /// Right operand.
        rhs: Box<Expr>,
    },
    /// Function call.
    Call {
        /// Function.
        func: Function,
        /// Arguments, `func.arity()` of them.
        args: Vec<Expr>,
    },
}

impl Expr {
    fn eval<F>(&self, lookup: &F) -> Result<f64, ExpressionError>
    where
        F: Fn(&str) -> Option<f64>,
    {
        Ok(match self {
            Self::Number(n) => *n,
            Self::Variable(name) => {
                lookup(name).ok_or_else(|| ExpressionError::Unbound(name.clone()))?
            }
            Self::Neg(operand) => -operand.eval(lookup)?,
            Self::Binary { op, lhs, rhs } => {
                let (a, b) = (lhs.eval(lookup)?, rhs.eval(lookup)?);
                match op {
                    BinaryOp::Add => a + b,
                    BinaryOp::Sub => a - b,
                    BinaryOp::Mul => a * b,
                    BinaryOp::Div => a / b,
                    BinaryOp::Rem => a % b,
                    BinaryOp::Pow => a.powf(b),
                }
            }
            Self::Call { func, args } => {
                let values = args
                    .iter()
                    .map(|arg| arg.eval(lookup))
                    .collect::<Result<Vec<_>, _>>()?;
                func.apply(&values)
            }
        })
    }

    fn collect_variables<'a>(&'a self, out: &mut BTreeSet<&'a str>) {
        match self {
            Self::Number(_) => {}
            Self::Variable(name) => {
                out.insert(name);
            }
            Self::Neg(operand) => operand.collect_variables(out),
            Self::Binary { lhs, rhs, .. } => {
                lhs.collect_variables(out);
                rhs.collect_variables(out);
            }
            Self::Call { args, .. } => args.iter().for_each(|arg| arg.collect_variables(out)),
        }
    }
}

/// A parsed formula together with its source text.
///
/// Deserializes from the formula string, so a malformed formula is rejected
/// when the job file is loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Expression {
    source: String,
    root: Expr,
}

impl Expression {
    /// Parses a formula.
    ///
    /// # Errors
    ///
    /// Returns [`ExpressionError`] if the text is not a valid formula or
    /// calls an unknown function.
    pub fn parse(source: &str) -> Result<Self, ExpressionError> {
        let tokens = tokenize(source)?;
        let mut parser = Parser { tokens, pos: 0 };
        let root = parser.expr()?;
        if let Some(token) = parser.tokens.get(parser.pos) {
            return Err(ExpressionError::Syntax {
                offset: token.offset,
                reason: "unexpected trailing input".to_string(),
            });
        }
        Ok(Self {
            source: source.to_string(),
            root,
        })
    }

    /// The formula text as configured.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// The parsed tree.
    pub fn root(&self) -> &Expr {
        &self.root
    }

    /// Names of all variables referenced by the formula.
    pub fn variables(&self) -> BTreeSet<&str> {
        let mut out = BTreeSet::new();
        self.root.collect_variables(&mut out);
        out
    }

    /// Evaluates the formula with variables resolved by `lookup`.
    ///
    /// # Errors
    ///
    /// Returns [`ExpressionError::Unbound`] if a variable has no value, or
    /// [`ExpressionError::NonFinite`] if the result is NaN or infinite.
    pub fn evaluate_with<F>(&self, lookup: F) -> Result<f64, ExpressionError>
    where
        F: Fn(&str) -> Option<f64>,
    {
        let value = self.root.eval(&lookup)?;
        if value.is_finite() {
            Ok(value)
        } else {
            Err(ExpressionError::NonFinite)
        }
    }

    /// Evaluates the formula against a record's fields.
    ///
    /// Only fields whose values are numeric (numbers, or strings that parse
    /// as numbers) are bound; referencing any other field is an
    /// [`ExpressionError::Unbound`] error.
    ///
    /// # Errors
    ///
    /// See [`Expression::evaluate_with`].
    pub fn evaluate(&self, fields: &Fields) -> Result<f64, ExpressionError> {
        self.evaluate_with(|name| fields.get(name).and_then(value_as_f64))
    }
}

impl FromStr for Expression {
    type Err = ExpressionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Expression {
    type Error = ExpressionError;

    fn try_from(source: String) -> Result<Self, Self::Error> {
        Self::parse(&source)
    }
}

impl From<Expression> for String {
    fn from(expression: Expression) -> Self {
        expression.source
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Number(f64),
    Ident(String),
    Op(char),
    LParen,
    RParen,
    Comma,
}

#[derive(Debug, Clone, PartialEq)]
struct Token {
    kind: TokenKind,
    offset: usize,
}

fn tokenize(source: &str) -> Result<Vec<Token>, ExpressionError> {
    let bytes = source.as_bytes();
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < bytes.len() {
        let ch = bytes[pos] as char;
        let start = pos;

        let kind = match ch {
            c if c.is_ascii_whitespace() => {
                pos += 1;
                continue;
            }
            '0'..='9' | '.' => {
                while pos < bytes.len() && (bytes[pos].is_ascii_digit() || bytes[pos] == b'.') {
                    pos += 1;
                }
                if pos < bytes.len() && matches!(bytes[pos], b'e' | b'E') {
                    let mut look = pos + 1;
                    if look < bytes.len() && matches!(bytes[look], b'+' | b'-') {
                        look += 1;
                    }
                    if look < bytes.len() && bytes[look].is_ascii_digit() {
                        pos = look;
                        while pos < bytes.len() && bytes[pos].is_ascii_digit() {
                            pos += 1;
                        }
                    }
                }
                let text = &source[start..pos];
                let value = text.parse::<f64>().map_err(|_| ExpressionError::Syntax {
                    offset: start,
                    reason: format!("invalid number '{text}'"),
                })?;
                TokenKind::Number(value)
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                while pos < bytes.len()
                    && (bytes[pos].is_ascii_alphanumeric() || matches!(bytes[pos], b'_' | b'.'))
                {
                    pos += 1;
                }
                TokenKind::Ident(source[start..pos].to_string())
            }
            '+' | '-' | '*' | '/' | '%' | '^' => {
                pos += 1;
                TokenKind::Op(ch)
            }
            '(' => {
                pos += 1;
                TokenKind::LParen
            }
            ')' => {
                pos += 1;
                TokenKind::RParen
            }
            ',' => {
                pos += 1;
                TokenKind::Comma
            }
            _ => {
                let ch = source[start..].chars().next().unwrap_or(ch);
                return Err(ExpressionError::UnexpectedChar { ch, offset: start });
            }
        };

        tokens.push(Token {
            kind,
            offset: start,
        });
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&TokenKind> {
        self.tokens.get(self.pos).map(|t| &t.kind)
    }

    fn offset(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map_or(0, |t| t.offset)
    }

    fn next_op_in(&mut self, ops: &[char]) -> Option<char> {
        match self.peek() {
            Some(TokenKind::Op(op)) if ops.contains(op) => {
                let op = *op;
                self.pos += 1;
                Some(op)
            }
            _ => None,
        }
    }

    fn expect(&mut self, kind: &TokenKind, what: &str) -> Result<(), ExpressionError> {
        if self.peek() == Some(kind) {
            self.pos += 1;
            Ok(())
        } else {
            Err(ExpressionError::Syntax {
                offset: self.offset(),
                reason: format!("expected {what}"),
            })
        }
    }

    fn expr(&mut self) -> Result<Expr, ExpressionError> {
        let mut lhs = self.term()?;
        while let Some(op) = self.next_op_in(&['+', '-']) {
            let rhs = self.term()?;
            let op = if op == '+' { BinaryOp::Add } else { BinaryOp::Sub };
            lhs = binary(op, lhs, rhs);
        }
        Ok(lhs)
    }

    fn term(&mut self) -> Result<Expr, ExpressionError> {
        let mut lhs = self.unary()?;
        while let Some(op) = self.next_op_in(&['*', '/', '%']) {
            let rhs = self.unary()?;
            let op = match op {
                '*' => BinaryOp::Mul,
                '/' => BinaryOp::Div,
                _ => BinaryOp::Rem,
            };
            lhs = binary(op, lhs, rhs);
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, ExpressionError> {
        match self.next_op_in(&['+', '-']) {
            Some('-') => Ok(Expr::Neg(Box::new(self.unary()?))),
            Some(_) => self.unary(),
            None => self.power(),
        }
    }

    fn power(&mut self) -> Result<Expr, ExpressionError> {
        let base = self.primary()?;
        if self.next_op_in(&['^']).is_some() {
            let exponent = self.unary()?;
            return Ok(binary(BinaryOp::Pow, base, exponent));
        }
        Ok(base)
    }

    fn primary(&mut self) -> Result<Expr, ExpressionError> {
        let offset = self.offset();
        let Some(token) = self.tokens.get(self.pos).cloned() else {
            return Err(ExpressionError::Syntax {
                offset,
                reason: "unexpected end of formula".to_string(),
            });
        };
        self.pos += 1;

        match token.kind {
            TokenKind::Number(n) => Ok(Expr::Number(n)),
            TokenKind::Ident(name) => {
                if self.peek() != Some(&TokenKind::LParen) {
                    return Ok(Expr::Variable(name));
                }
                self.pos += 1;
                let mut args = vec![self.expr()?];
                while self.peek() == Some(&TokenKind::Comma) {
                    self.pos += 1;
                    args.push(self.expr()?);
                }
                self.expect(&TokenKind::RParen, "')' after function arguments")?;
                let func = Function::resolve(&name, args.len()).ok_or(
                    ExpressionError::UnknownFunction {
                        name,
                        arity: args.len(),
                    },
                )?;
                Ok(Expr::Call { func, args })
            }
            TokenKind::LParen => {
                let inner = self.expr()?;
                self.expect(&TokenKind::RParen, "')'")?;
                Ok(inner)
            }
            _ => Err(ExpressionError::Syntax {
                offset: token.offset,
                reason: "expected a number, variable or '('".to_string(),
            }),
        }
    }
}

fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Expr {
    Expr::Binary {
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
    }
}

//! Sandboxed evaluator for `when` / `unless` expressions.
//!
//! The grammar is a small, closed set of comparisons and boolean
//! combinators over the runtime context:
//!
//! ```text
//! expr    := or
//! or      := and ("or" and)*
//! and     := unary ("and" unary)*
//! unary   := "not" unary | cmp
//! cmp     := primary (("==" | "!=" | "<" | "<=" | ">" | ">=" | "in") primary)?
//! primary := number | string | "true" | "false" | ident | "(" expr ")"
//! ```
//!
//! There are no function calls, no arithmetic, and no implicit nil:
//! an identifier that is not present in the context is an error, so
//! misspelled keys fail closed instead of silently skipping tasks.

use std::fmt;

use thiserror::Error;

use crate::context::{RuntimeContext, Scalar};

/// Errors from parsing or evaluating a conditional expression.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConditionError {
    #[error("unexpected character {ch:?} at offset {pos}")]
    UnexpectedChar { ch: char, pos: usize },

    #[error("unterminated string literal starting at offset {pos}")]
    UnterminatedString { pos: usize },

    #[error("unexpected token {0:?}")]
    UnexpectedToken(String),

    #[error("unexpected end of expression")]
    UnexpectedEnd,

    #[error("identifier {0:?} is not defined in the context")]
    UnknownIdentifier(String),

    #[error("cannot apply {op} to {lhs} and {rhs}")]
    TypeMismatch {
        op: &'static str,
        lhs: &'static str,
        rhs: &'static str,
    },

    #[error("{0} operand must be a boolean, got {1}")]
    NonBooleanOperand(&'static str, &'static str),

    #[error("expression evaluated to {0}, expected a boolean")]
    NonBooleanResult(&'static str),
}

// ---------------------------------------------------------------------------
// Tokens
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Int(i64),
    Float(f64),
    True,
    False,
    And,
    Or,
    Not,
    In,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    LParen,
    RParen,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Ident(s) => write!(f, "{s}"),
            Token::Str(s) => write!(f, "{s:?}"),
            Token::Int(i) => write!(f, "{i}"),
            Token::Float(x) => write!(f, "{x}"),
            Token::True => write!(f, "true"),
            Token::False => write!(f, "false"),
            Token::And => write!(f, "and"),
            Token::Or => write!(f, "or"),
            Token::Not => write!(f, "not"),
            Token::In => write!(f, "in"),
            Token::Eq => write!(f, "=="),
            Token::Ne => write!(f, "!="),
            Token::Lt => write!(f, "<"),
            Token::Le => write!(f, "<="),
            Token::Gt => write!(f, ">"),
            Token::Ge => write!(f, ">="),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, ConditionError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '=' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Eq);
                i += 2;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Ne);
                i += 2;
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Le);
                    i += 2;
                } else {
                    tokens.push(Token::Lt);
                    i += 1;
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ge);
                    i += 2;
                } else {
                    tokens.push(Token::Gt);
                    i += 1;
                }
            }
            '\'' | '"' => {
                let quote = c;
                let start = i;
                i += 1;
                let mut s = String::new();
                loop {
                    match chars.get(i) {
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            s.push(ch);
                            i += 1;
                        }
                        None => return Err(ConditionError::UnterminatedString { pos: start }),
                    }
                }
                tokens.push(Token::Str(s));
            }
            '0'..='9' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                if text.contains('.') {
                    let value = text
                        .parse::<f64>()
                        .map_err(|_| ConditionError::UnexpectedToken(text.clone()))?;
                    tokens.push(Token::Float(value));
                } else {
                    let value = text
                        .parse::<i64>()
                        .map_err(|_| ConditionError::UnexpectedToken(text.clone()))?;
                    tokens.push(Token::Int(value));
                }
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric() || chars[i] == '_')
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "in" => Token::In,
                    "true" => Token::True,
                    "false" => Token::False,
                    _ => Token::Ident(word),
                });
            }
            other => return Err(ConditionError::UnexpectedChar { ch: other, pos: i }),
        }
    }

    Ok(tokens)
}

// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
}

impl CmpOp {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::In => "in",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Scalar),
    Ident(String),
    Compare {
        op: CmpOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, expected: Token) -> Result<(), ConditionError> {
        match self.next() {
            Some(token) if token == expected => Ok(()),
            Some(token) => Err(ConditionError::UnexpectedToken(token.to_string())),
            None => Err(ConditionError::UnexpectedEnd),
        }
    }

    fn parse_expr(&mut self) -> Result<Expr, ConditionError> {
        let mut lhs = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.next();
            let rhs = self.parse_and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, ConditionError> {
        let mut lhs = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.next();
            let rhs = self.parse_unary()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, ConditionError> {
        if self.peek() == Some(&Token::Not) {
            self.next();
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_cmp()
    }

    fn parse_cmp(&mut self) -> Result<Expr, ConditionError> {
        let lhs = self.parse_primary()?;
        let op = match self.peek() {
            Some(Token::Eq) => CmpOp::Eq,
            Some(Token::Ne) => CmpOp::Ne,
            Some(Token::Lt) => CmpOp::Lt,
            Some(Token::Le) => CmpOp::Le,
            Some(Token::Gt) => CmpOp::Gt,
            Some(Token::Ge) => CmpOp::Ge,
            Some(Token::In) => CmpOp::In,
            _ => return Ok(lhs),
        };
        self.next();
        let rhs = self.parse_primary()?;
        Ok(Expr::Compare {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        })
    }

    fn parse_primary(&mut self) -> Result<Expr, ConditionError> {
        match self.next() {
            Some(Token::Int(i)) => Ok(Expr::Literal(Scalar::Int(i))),
            Some(Token::Float(x)) => Ok(Expr::Literal(Scalar::Float(x))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Scalar::Str(s))),
            Some(Token::True) => Ok(Expr::Literal(Scalar::Bool(true))),
            Some(Token::False) => Ok(Expr::Literal(Scalar::Bool(false))),
            Some(Token::Ident(name)) => Ok(Expr::Ident(name)),
            Some(Token::LParen) => {
                let inner = self.parse_expr()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(token) => Err(ConditionError::UnexpectedToken(token.to_string())),
            None => Err(ConditionError::UnexpectedEnd),
        }
    }
}

fn parse(input: &str) -> Result<Expr, ConditionError> {
    let tokens = tokenize(input)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_expr()?;
    if let Some(trailing) = parser.peek() {
        return Err(ConditionError::UnexpectedToken(trailing.to_string()));
    }
    Ok(expr)
}

// ---------------------------------------------------------------------------
// Evaluator
// ---------------------------------------------------------------------------

fn eval(expr: &Expr, ctx: &RuntimeContext) -> Result<Scalar, ConditionError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Ident(name) => ctx
            .get(name)
            .cloned()
            .ok_or_else(|| ConditionError::UnknownIdentifier(name.clone())),
        Expr::Compare { op, lhs, rhs } => {
            let lhs = eval(lhs, ctx)?;
            let rhs = eval(rhs, ctx)?;
            compare(*op, &lhs, &rhs).map(Scalar::Bool)
        }
        Expr::And(lhs, rhs) => {
            let lhs = expect_bool("and", eval(lhs, ctx)?)?;
            if !lhs {
                return Ok(Scalar::Bool(false));
            }
            Ok(Scalar::Bool(expect_bool("and", eval(rhs, ctx)?)?))
        }
        Expr::Or(lhs, rhs) => {
            let lhs = expect_bool("or", eval(lhs, ctx)?)?;
            if lhs {
                return Ok(Scalar::Bool(true));
            }
            Ok(Scalar::Bool(expect_bool("or", eval(rhs, ctx)?)?))
        }
        Expr::Not(inner) => {
            let value = expect_bool("not", eval(inner, ctx)?)?;
            Ok(Scalar::Bool(!value))
        }
    }
}

fn expect_bool(op: &'static str, value: Scalar) -> Result<bool, ConditionError> {
    value
        .as_bool()
        .ok_or(ConditionError::NonBooleanOperand(op, value.type_name()))
}

fn compare(op: CmpOp, lhs: &Scalar, rhs: &Scalar) -> Result<bool, ConditionError> {
    let mismatch = || ConditionError::TypeMismatch {
        op: op.as_str(),
        lhs: lhs.type_name(),
        rhs: rhs.type_name(),
    };

    match op {
        CmpOp::In => match (lhs, rhs) {
            (Scalar::Str(needle), Scalar::Str(haystack)) => Ok(haystack.contains(needle.as_str())),
            _ => Err(mismatch()),
        },
        CmpOp::Eq | CmpOp::Ne => {
            let equal = match (lhs, rhs) {
                (Scalar::Bool(a), Scalar::Bool(b)) => a == b,
                (Scalar::Str(a), Scalar::Str(b)) => a == b,
                _ => match (lhs.as_f64(), rhs.as_f64()) {
                    (Some(a), Some(b)) => a == b,
                    _ => return Err(mismatch()),
                },
            };
            Ok(if op == CmpOp::Eq { equal } else { !equal })
        }
        CmpOp::Lt | CmpOp::Le | CmpOp::Gt | CmpOp::Ge => {
            let ordering = match (lhs, rhs) {
                (Scalar::Str(a), Scalar::Str(b)) => a.cmp(b),
                _ => match (lhs.as_f64(), rhs.as_f64()) {
                    (Some(a), Some(b)) => {
                        a.partial_cmp(&b).ok_or_else(mismatch)?
                    }
                    _ => return Err(mismatch()),
                },
            };
            Ok(match op {
                CmpOp::Lt => ordering.is_lt(),
                CmpOp::Le => ordering.is_le(),
                CmpOp::Gt => ordering.is_gt(),
                CmpOp::Ge => ordering.is_ge(),
                _ => unreachable!(),
            })
        }
    }
}

/// Evaluate an expression against the context. The result must be a
/// boolean; anything else is an error.
pub fn evaluate(expression: &str, ctx: &RuntimeContext) -> Result<bool, ConditionError> {
    let expr = parse(expression)?;
    match eval(&expr, ctx)? {
        Scalar::Bool(b) => Ok(b),
        other => Err(ConditionError::NonBooleanResult(other.type_name())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> RuntimeContext {
        let mut ctx = RuntimeContext::default();
        ctx.insert("A_score", Scalar::Float(0.9));
        ctx.insert("A_status", Scalar::Str("success".into()));
        ctx.insert("A_completed", Scalar::Bool(true));
        ctx.insert("retries", Scalar::Int(2));
        ctx.insert("env", Scalar::Str("production".into()));
        ctx
    }

    #[test]
    fn numeric_comparisons() {
        let ctx = ctx();
        assert!(evaluate("A_score > 0.8", &ctx).unwrap());
        assert!(!evaluate("A_score > 0.95", &ctx).unwrap());
        assert!(evaluate("A_score >= 0.9", &ctx).unwrap());
        assert!(evaluate("retries < 3", &ctx).unwrap());
        assert!(evaluate("retries <= 2", &ctx).unwrap());
        assert!(evaluate("retries != 1", &ctx).unwrap());
    }

    #[test]
    fn int_and_float_compare_numerically() {
        let ctx = ctx();
        assert!(evaluate("retries == 2.0", &ctx).unwrap());
        assert!(evaluate("A_score < 1", &ctx).unwrap());
    }

    #[test]
    fn string_equality_and_membership() {
        let ctx = ctx();
        assert!(evaluate("A_status == 'success'", &ctx).unwrap());
        assert!(evaluate("A_status != \"failed\"", &ctx).unwrap());
        assert!(evaluate("'prod' in env", &ctx).unwrap());
        assert!(!evaluate("'staging' in env", &ctx).unwrap());
    }

    #[test]
    fn boolean_combinators() {
        let ctx = ctx();
        assert!(evaluate("A_completed and A_score > 0.5", &ctx).unwrap());
        assert!(evaluate("A_score > 0.95 or retries == 2", &ctx).unwrap());
        assert!(evaluate("not (A_score > 0.95)", &ctx).unwrap());
        assert!(evaluate("A_completed", &ctx).unwrap());
    }

    #[test]
    fn short_circuit_does_not_mask_type_errors_on_left() {
        let ctx = ctx();
        // Left side evaluated first: non-boolean left is an error even if
        // the right side would decide the result.
        let err = evaluate("A_status and true", &ctx).unwrap_err();
        assert!(matches!(err, ConditionError::NonBooleanOperand("and", _)));
    }

    #[test]
    fn unknown_identifier_fails_closed() {
        let ctx = ctx();
        let err = evaluate("B_score > 0.5", &ctx).unwrap_err();
        assert_eq!(err, ConditionError::UnknownIdentifier("B_score".into()));
    }

    #[test]
    fn type_mismatch_is_an_error_not_false() {
        let ctx = ctx();
        let err = evaluate("A_status > 3", &ctx).unwrap_err();
        assert!(matches!(err, ConditionError::TypeMismatch { .. }));

        let err = evaluate("A_completed < true", &ctx).unwrap_err();
        assert!(matches!(err, ConditionError::TypeMismatch { .. }));
    }

    #[test]
    fn non_boolean_result_is_an_error() {
        let ctx = ctx();
        let err = evaluate("A_status", &ctx).unwrap_err();
        assert!(matches!(err, ConditionError::NonBooleanResult("string")));
        let err = evaluate("3", &ctx).unwrap_err();
        assert!(matches!(err, ConditionError::NonBooleanResult("int")));
    }

    #[test]
    fn rejects_unsupported_syntax() {
        let ctx = ctx();
        // No arithmetic.
        assert!(evaluate("A_score + 1 > 1", &ctx).is_err());
        // No function calls: `foo(1)` parses as ident followed by junk.
        assert!(evaluate("len(env) > 3", &ctx).is_err());
        // Unterminated string.
        assert!(matches!(
            evaluate("A_status == 'succ", &ctx),
            Err(ConditionError::UnterminatedString { .. })
        ));
        // Dangling operator.
        assert!(matches!(
            evaluate("A_score >", &ctx),
            Err(ConditionError::UnexpectedEnd)
        ));
        // Trailing tokens.
        assert!(evaluate("A_completed extra", &ctx).is_err());
    }

    #[test]
    fn parentheses_control_precedence() {
        let ctx = ctx();
        // and binds tighter than or.
        assert!(evaluate("false and false or A_completed", &ctx).unwrap());
        assert!(!evaluate("false and (false or A_completed)", &ctx).unwrap());
    }
}

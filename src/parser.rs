//! Recursive descent parser for inline function bodies.
//!
//! A body is a sequence of statements separated by semicolons or newlines.
//! A statement is either an assignment `name = expr` or a bare expression;
//! the body's value is the value of its last expression statement.

use std::fmt;

use serde_json::Value;

use crate::lexer::{lex, LexError, Span, SpannedToken, Token};

#[derive(Debug, Clone)]
pub struct ParseError {
    pub message: String,
    pub span: Span,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "parse error at byte {}: {}", self.span.start, self.message)
    }
}

impl std::error::Error for ParseError {}

impl From<LexError> for ParseError {
    fn from(err: LexError) -> Self {
        ParseError {
            message: "unrecognized input".to_owned(),
            span: err.span,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Ident(String),
    Array(Vec<Expr>),
    Object(Vec<(String, Expr)>),
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Ternary {
        test: Box<Expr>,
        consequent: Box<Expr>,
        alternate: Box<Expr>,
    },
    Member {
        object: Box<Expr>,
        name: String,
    },
    Index {
        object: Box<Expr>,
        index: Box<Expr>,
    },
    Call {
        name: String,
        args: Vec<Expr>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Assign { name: String, expr: Expr },
    Expr(Expr),
}

pub type Program = Vec<Stmt>;

/// Parse a function body into a statement list.
pub fn parse(source: &str) -> Result<Program, ParseError> {
    let tokens = lex(source)?;
    Parser { tokens, pos: 0 }.program()
}

struct Parser {
    tokens: Vec<SpannedToken>,
    pos: usize,
}

impl Parser {
    fn program(&mut self) -> Result<Program, ParseError> {
        let mut statements = Vec::new();
        self.skip_separators();
        while self.pos < self.tokens.len() {
            statements.push(self.statement()?);
            if self.pos < self.tokens.len() && !self.eat_separator() {
                return Err(self.unexpected("expected ';' or newline"));
            }
            self.skip_separators();
        }
        Ok(statements)
    }

    fn statement(&mut self) -> Result<Stmt, ParseError> {
        if let (Some(Token::Ident(name)), Some(Token::Assign)) =
            (self.peek(0), self.peek(1))
        {
            let name = name.clone();
            self.pos += 2;
            let expr = self.expression()?;
            return Ok(Stmt::Assign { name, expr });
        }
        Ok(Stmt::Expr(self.expression()?))
    }

    fn expression(&mut self) -> Result<Expr, ParseError> {
        let test = self.or_expr()?;
        if self.eat(&Token::Question) {
            let consequent = self.expression()?;
            self.expect(&Token::Colon, "expected ':' in conditional")?;
            let alternate = self.expression()?;
            return Ok(Expr::Ternary {
                test: Box::new(test),
                consequent: Box::new(consequent),
                alternate: Box::new(alternate),
            });
        }
        Ok(test)
    }

    fn or_expr(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.and_expr()?;
        while self.eat(&Token::OrOr) {
            let right = self.and_expr()?;
            left = binary(BinaryOp::Or, left, right);
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.equality()?;
        while self.eat(&Token::AndAnd) {
            let right = self.equality()?;
            left = binary(BinaryOp::And, left, right);
        }
        Ok(left)
    }

    fn equality(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.comparison()?;
        loop {
            let op = match self.peek(0) {
                Some(Token::EqEq) => BinaryOp::Eq,
                Some(Token::NotEq) => BinaryOp::Ne,
                _ => break,
            };
            self.pos += 1;
            let right = self.comparison()?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn comparison(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.additive()?;
        loop {
            let op = match self.peek(0) {
                Some(Token::Less) => BinaryOp::Lt,
                Some(Token::LessEq) => BinaryOp::Le,
                Some(Token::Greater) => BinaryOp::Gt,
                Some(Token::GreaterEq) => BinaryOp::Ge,
                _ => break,
            };
            self.pos += 1;
            let right = self.additive()?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn additive(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.multiplicative()?;
        loop {
            let op = match self.peek(0) {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let right = self.multiplicative()?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn multiplicative(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek(0) {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                Some(Token::Percent) => BinaryOp::Rem,
                _ => break,
            };
            self.pos += 1;
            let right = self.unary()?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, ParseError> {
        let op = match self.peek(0) {
            Some(Token::Bang) => Some(UnaryOp::Not),
            Some(Token::Minus) => Some(UnaryOp::Neg),
            _ => None,
        };
        if let Some(op) = op {
            self.pos += 1;
            let operand = self.unary()?;
            return Ok(Expr::Unary {
                op,
                operand: Box::new(operand),
            });
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.primary()?;
        loop {
            if self.eat(&Token::Dot) {
                let name = self.expect_ident("expected property name after '.'")?;
                expr = Expr::Member {
                    object: Box::new(expr),
                    name,
                };
            } else if self.eat(&Token::LBracket) {
                let index = self.expression()?;
                self.expect(&Token::RBracket, "expected ']'")?;
                expr = Expr::Index {
                    object: Box::new(expr),
                    index: Box::new(index),
                };
            } else if matches!(self.peek(0), Some(Token::LParen)) {
                let Expr::Ident(name) = expr else {
                    return Err(self.unexpected("only named functions can be called"));
                };
                self.pos += 1;
                let mut args = Vec::new();
                if !self.eat(&Token::RParen) {
                    loop {
                        args.push(self.expression()?);
                        if self.eat(&Token::Comma) {
                            continue;
                        }
                        self.expect(&Token::RParen, "expected ')'")?;
                        break;
                    }
                }
                expr = Expr::Call { name, args };
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn primary(&mut self) -> Result<Expr, ParseError> {
        let token = self
            .peek(0)
            .cloned()
            .ok_or_else(|| self.unexpected("unexpected end of input"))?;
        match token {
            Token::Int(i) => {
                self.pos += 1;
                Ok(Expr::Literal(Value::from(i)))
            }
            Token::Float(f) => {
                self.pos += 1;
                Ok(Expr::Literal(
                    serde_json::Number::from_f64(f)
                        .map(Value::Number)
                        .unwrap_or(Value::Null),
                ))
            }
            Token::Str(s) => {
                self.pos += 1;
                Ok(Expr::Literal(Value::String(s)))
            }
            Token::True => {
                self.pos += 1;
                Ok(Expr::Literal(Value::Bool(true)))
            }
            Token::False => {
                self.pos += 1;
                Ok(Expr::Literal(Value::Bool(false)))
            }
            Token::Null => {
                self.pos += 1;
                Ok(Expr::Literal(Value::Null))
            }
            Token::Ident(name) => {
                self.pos += 1;
                Ok(Expr::Ident(name))
            }
            Token::LParen => {
                self.pos += 1;
                let expr = self.expression()?;
                self.expect(&Token::RParen, "expected ')'")?;
                Ok(expr)
            }
            Token::LBracket => {
                self.pos += 1;
                let mut elements = Vec::new();
                if !self.eat(&Token::RBracket) {
                    loop {
                        elements.push(self.expression()?);
                        if self.eat(&Token::Comma) {
                            continue;
                        }
                        self.expect(&Token::RBracket, "expected ']'")?;
                        break;
                    }
                }
                Ok(Expr::Array(elements))
            }
            Token::LBrace => {
                self.pos += 1;
                let mut entries = Vec::new();
                if !self.eat(&Token::RBrace) {
                    loop {
                        let key = match self.peek(0).cloned() {
                            Some(Token::Ident(name)) => name,
                            Some(Token::Str(s)) => s,
                            _ => return Err(self.unexpected("expected object key")),
                        };
                        self.pos += 1;
                        self.expect(&Token::Colon, "expected ':' after object key")?;
                        let value = self.expression()?;
                        entries.push((key, value));
                        if self.eat(&Token::Comma) {
                            continue;
                        }
                        self.expect(&Token::RBrace, "expected '}'")?;
                        break;
                    }
                }
                Ok(Expr::Object(entries))
            }
            _ => Err(self.unexpected("unexpected token")),
        }
    }

    // -------------------------------------------------------------------
    // Token navigation
    // -------------------------------------------------------------------

    fn peek(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset).map(|t| &t.token)
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek(0) == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_separator(&mut self) -> bool {
        matches!(self.peek(0), Some(Token::Semi) | Some(Token::Newline)) && {
            self.pos += 1;
            true
        }
    }

    fn skip_separators(&mut self) {
        while matches!(self.peek(0), Some(Token::Semi) | Some(Token::Newline)) {
            self.pos += 1;
        }
    }

    fn expect(&mut self, token: &Token, message: &str) -> Result<(), ParseError> {
        if self.eat(token) {
            Ok(())
        } else {
            Err(self.unexpected(message))
        }
    }

    fn expect_ident(&mut self, message: &str) -> Result<String, ParseError> {
        if let Some(Token::Ident(name)) = self.peek(0) {
            let name = name.clone();
            self.pos += 1;
            Ok(name)
        } else {
            Err(self.unexpected(message))
        }
    }

    fn unexpected(&self, message: &str) -> ParseError {
        let span = self
            .tokens
            .get(self.pos)
            .map(|t| t.span)
            .unwrap_or_default();
        ParseError {
            message: message.to_owned(),
            span,
        }
    }
}

fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
    Expr::Binary {
        op,
        left: Box::new(left),
        right: Box::new(right),
    }
}

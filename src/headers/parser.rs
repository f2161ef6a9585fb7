//! Recursive-descent parser for the Meson description language.
//!
//! Covers the grammar actually used by the program descriptions: literals,
//! arrays, dictionaries, function and method calls with keyword arguments,
//! indexing, arithmetic, comparisons, boolean operators, ternaries,
//! assignments, `if` chains and `foreach` loops.

use thiserror::Error;

use super::lexer::{tokenize, LexError, Spanned, Token};

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Str(String),
    Int(i64),
    Bool(bool),
    Ident(String),
    Array(Vec<Expr>),
    Dict(Vec<(Expr, Expr)>),
    Call {
        name: String,
        args: Args,
    },
    Method {
        receiver: Box<Expr>,
        name: String,
        args: Args,
    },
    Index {
        target: Box<Expr>,
        index: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Ternary {
        condition: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args {
    pub positional: Vec<Expr>,
    pub keyword: Vec<(String, Expr)>,
}

impl Args {
    pub fn keyword(&self, name: &str) -> Option<&Expr> {
        self.keyword
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOp {
    Set,
    Append,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Expr(Expr),
    Assign {
        target: String,
        op: AssignOp,
        value: Expr,
    },
    If {
        branches: Vec<(Expr, Vec<Stmt>)>,
        otherwise: Option<Vec<Stmt>>,
    },
    Foreach {
        vars: Vec<String>,
        iterable: Expr,
        body: Vec<Stmt>,
    },
    Break,
    Continue,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SyntaxError {
    #[error(transparent)]
    Lex(#[from] LexError),
    #[error("line {line}: expected {expected}, found {found}")]
    Unexpected {
        line: usize,
        expected: String,
        found: String,
    },
    #[error("line {line}: cannot assign to this expression")]
    InvalidAssignment { line: usize },
}

/// Parse a complete description into its top-level statements.
pub fn parse(source: &str) -> Result<Vec<Stmt>, SyntaxError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser { tokens, pos: 0 };
    let body = parser.block(&[])?;
    parser.expect(Token::Eof, "end of file")?;
    Ok(body)
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        // The token stream always ends with Eof, and Eof is never consumed.
        &self.tokens[self.pos.min(self.tokens.len() - 1)].token
    }

    fn line(&self) -> usize {
        self.tokens[self.pos.min(self.tokens.len() - 1)].line
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if token != Token::Eof {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == token {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: Token, expected: &str) -> Result<(), SyntaxError> {
        if self.eat(&token) {
            Ok(())
        } else {
            Err(self.unexpected(expected))
        }
    }

    fn unexpected(&self, expected: &str) -> SyntaxError {
        SyntaxError::Unexpected {
            line: self.line(),
            expected: expected.to_string(),
            found: describe(self.peek()),
        }
    }

    fn skip_newlines(&mut self) {
        while self.eat(&Token::Newline) {}
    }

    /// Statements until one of `terminators` (not consumed) or end of file.
    fn block(&mut self, terminators: &[Token]) -> Result<Vec<Stmt>, SyntaxError> {
        let mut body = Vec::new();
        loop {
            self.skip_newlines();
            let next = self.peek();
            if *next == Token::Eof || terminators.contains(next) {
                return Ok(body);
            }
            body.push(self.statement()?);
        }
    }

    fn end_of_statement(&mut self) -> Result<(), SyntaxError> {
        match self.peek() {
            Token::Newline => {
                self.advance();
                Ok(())
            }
            Token::Eof => Ok(()),
            _ => Err(self.unexpected("end of line")),
        }
    }

    fn statement(&mut self) -> Result<Stmt, SyntaxError> {
        let stmt = match self.peek() {
            Token::If => self.if_statement()?,
            Token::Foreach => self.foreach_statement()?,
            Token::Break => {
                self.advance();
                Stmt::Break
            }
            Token::Continue => {
                self.advance();
                Stmt::Continue
            }
            _ => {
                let line = self.line();
                let expr = self.expression()?;
                let op = match self.peek() {
                    Token::Assign => Some(AssignOp::Set),
                    Token::PlusAssign => Some(AssignOp::Append),
                    _ => None,
                };
                match op {
                    None => Stmt::Expr(expr),
                    Some(op) => {
                        self.advance();
                        let Expr::Ident(target) = expr else {
                            return Err(SyntaxError::InvalidAssignment { line });
                        };
                        let value = self.expression()?;
                        Stmt::Assign { target, op, value }
                    }
                }
            }
        };
        self.end_of_statement()?;
        Ok(stmt)
    }

    fn if_statement(&mut self) -> Result<Stmt, SyntaxError> {
        self.expect(Token::If, "'if'")?;
        let mut branches = Vec::new();
        let mut otherwise = None;

        let condition = self.expression()?;
        let body = self.block(&[Token::Elif, Token::Else, Token::Endif])?;
        branches.push((condition, body));
        loop {
            match self.advance() {
                Token::Elif => {
                    let condition = self.expression()?;
                    let body = self.block(&[Token::Elif, Token::Else, Token::Endif])?;
                    branches.push((condition, body));
                }
                Token::Else => {
                    otherwise = Some(self.block(&[Token::Endif])?);
                    self.expect(Token::Endif, "'endif'")?;
                    break;
                }
                Token::Endif => break,
                _ => return Err(self.unexpected("'endif'")),
            }
        }
        Ok(Stmt::If {
            branches,
            otherwise,
        })
    }

    fn foreach_statement(&mut self) -> Result<Stmt, SyntaxError> {
        self.expect(Token::Foreach, "'foreach'")?;
        let mut vars = vec![self.identifier()?];
        while self.eat(&Token::Comma) {
            vars.push(self.identifier()?);
        }
        self.expect(Token::Colon, "':'")?;
        let iterable = self.expression()?;
        let body = self.block(&[Token::Endforeach])?;
        self.expect(Token::Endforeach, "'endforeach'")?;
        Ok(Stmt::Foreach {
            vars,
            iterable,
            body,
        })
    }

    fn identifier(&mut self) -> Result<String, SyntaxError> {
        match self.peek().clone() {
            Token::Ident(name) => {
                self.advance();
                Ok(name)
            }
            _ => Err(self.unexpected("identifier")),
        }
    }

    fn expression(&mut self) -> Result<Expr, SyntaxError> {
        let condition = self.or_expr()?;
        if !self.eat(&Token::Question) {
            return Ok(condition);
        }
        let then = self.or_expr()?;
        self.expect(Token::Colon, "':' in ternary")?;
        let otherwise = self.or_expr()?;
        Ok(Expr::Ternary {
            condition: Box::new(condition),
            then: Box::new(then),
            otherwise: Box::new(otherwise),
        })
    }

    fn or_expr(&mut self) -> Result<Expr, SyntaxError> {
        let mut lhs = self.and_expr()?;
        while self.eat(&Token::Or) {
            let rhs = self.and_expr()?;
            lhs = binary(BinaryOp::Or, lhs, rhs);
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> Result<Expr, SyntaxError> {
        let mut lhs = self.comparison()?;
        while self.eat(&Token::And) {
            let rhs = self.comparison()?;
            lhs = binary(BinaryOp::And, lhs, rhs);
        }
        Ok(lhs)
    }

    fn comparison(&mut self) -> Result<Expr, SyntaxError> {
        let lhs = self.additive()?;
        let op = match self.peek() {
            Token::Eq => BinaryOp::Eq,
            Token::Ne => BinaryOp::Ne,
            Token::Lt => BinaryOp::Lt,
            Token::Le => BinaryOp::Le,
            Token::Gt => BinaryOp::Gt,
            Token::Ge => BinaryOp::Ge,
            Token::In => BinaryOp::In,
            Token::Not => {
                // `not in`
                if self.tokens.get(self.pos + 1).map(|s| &s.token) != Some(&Token::In) {
                    return Ok(lhs);
                }
                self.advance();
                BinaryOp::NotIn
            }
            _ => return Ok(lhs),
        };
        self.advance();
        let rhs = self.additive()?;
        Ok(binary(op, lhs, rhs))
    }

    fn additive(&mut self) -> Result<Expr, SyntaxError> {
        let mut lhs = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Token::Plus => BinaryOp::Add,
                Token::Minus => BinaryOp::Sub,
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.multiplicative()?;
            lhs = binary(op, lhs, rhs);
        }
    }

    fn multiplicative(&mut self) -> Result<Expr, SyntaxError> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Token::Star => BinaryOp::Mul,
                Token::Slash => BinaryOp::Div,
                Token::Percent => BinaryOp::Mod,
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.unary()?;
            lhs = binary(op, lhs, rhs);
        }
    }

    fn unary(&mut self) -> Result<Expr, SyntaxError> {
        let op = match self.peek() {
            Token::Not => UnaryOp::Not,
            Token::Minus => UnaryOp::Neg,
            _ => return self.postfix(),
        };
        self.advance();
        let operand = self.unary()?;
        Ok(Expr::Unary {
            op,
            operand: Box::new(operand),
        })
    }

    fn postfix(&mut self) -> Result<Expr, SyntaxError> {
        let mut expr = self.primary()?;
        loop {
            if self.eat(&Token::Dot) {
                let name = self.identifier()?;
                self.expect(Token::LParen, "'(' after method name")?;
                let args = self.arguments()?;
                expr = Expr::Method {
                    receiver: Box::new(expr),
                    name,
                    args,
                };
            } else if self.eat(&Token::LBracket) {
                let index = self.expression()?;
                self.expect(Token::RBracket, "']'")?;
                expr = Expr::Index {
                    target: Box::new(expr),
                    index: Box::new(index),
                };
            } else {
                return Ok(expr);
            }
        }
    }

    fn primary(&mut self) -> Result<Expr, SyntaxError> {
        match self.peek().clone() {
            Token::Str(s) => {
                self.advance();
                Ok(Expr::Str(s))
            }
            Token::Int(n) => {
                self.advance();
                Ok(Expr::Int(n))
            }
            Token::True => {
                self.advance();
                Ok(Expr::Bool(true))
            }
            Token::False => {
                self.advance();
                Ok(Expr::Bool(false))
            }
            Token::Ident(name) => {
                self.advance();
                if self.eat(&Token::LParen) {
                    let args = self.arguments()?;
                    Ok(Expr::Call { name, args })
                } else {
                    Ok(Expr::Ident(name))
                }
            }
            Token::LParen => {
                self.advance();
                let inner = self.expression()?;
                self.expect(Token::RParen, "')'")?;
                Ok(inner)
            }
            Token::LBracket => {
                self.advance();
                let mut items = Vec::new();
                while !self.eat(&Token::RBracket) {
                    items.push(self.expression()?);
                    if !self.eat(&Token::Comma) {
                        self.expect(Token::RBracket, "',' or ']'")?;
                        break;
                    }
                }
                Ok(Expr::Array(items))
            }
            Token::LBrace => {
                self.advance();
                let mut entries = Vec::new();
                while !self.eat(&Token::RBrace) {
                    let key = self.expression()?;
                    self.expect(Token::Colon, "':' in dictionary")?;
                    let value = self.expression()?;
                    entries.push((key, value));
                    if !self.eat(&Token::Comma) {
                        self.expect(Token::RBrace, "',' or '}'")?;
                        break;
                    }
                }
                Ok(Expr::Dict(entries))
            }
            _ => Err(self.unexpected("expression")),
        }
    }

    /// Arguments after an opening parenthesis, through the closing one.
    fn arguments(&mut self) -> Result<Args, SyntaxError> {
        let mut args = Args::default();
        while !self.eat(&Token::RParen) {
            let is_keyword = matches!(self.peek(), Token::Ident(_))
                && self.tokens.get(self.pos + 1).map(|s| &s.token) == Some(&Token::Colon);
            if is_keyword {
                let name = self.identifier()?;
                self.advance();
                args.keyword.push((name, self.expression()?));
            } else {
                args.positional.push(self.expression()?);
            }
            if !self.eat(&Token::Comma) {
                self.expect(Token::RParen, "',' or ')'")?;
                break;
            }
        }
        Ok(args)
    }
}

fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Expr {
    Expr::Binary {
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
    }
}

fn describe(token: &Token) -> String {
    match token {
        Token::Ident(name) => format!("identifier '{name}'"),
        Token::Str(s) => format!("string '{s}'"),
        Token::Int(n) => format!("number {n}"),
        Token::Newline => "end of line".to_string(),
        Token::Eof => "end of file".to_string(),
        other => format!("{other:?}"),
    }
}

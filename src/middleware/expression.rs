//! Predicate language shared by the circuit breaker and the buffering
//! retry condition, e.g. `NetworkErrorRatio() > 0.5 || Attempts() <= 2`.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExpressionError {
    #[error("unexpected character {0:?} at {1}")]
    UnexpectedChar(char, usize),

    #[error("unexpected end of expression")]
    UnexpectedEnd,

    #[error("unexpected token {0}")]
    UnexpectedToken(String),

    #[error("unknown function {0}")]
    UnknownFunction(String),

    #[error("function {name} expects {expected} arguments, got {got}")]
    Arity {
        name: String,
        expected: usize,
        got: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Number(f64),
    Bool(bool),
}

impl Value {
    fn as_number(self) -> f64 {
        match self {
            Value::Number(n) => n,
            Value::Bool(b) => b as u8 as f64,
        }
    }

    fn truthy(self) -> bool {
        match self {
            Value::Number(n) => n != 0.0,
            Value::Bool(b) => b,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CmpOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Call(String, Vec<f64>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(CmpOp, Box<Expr>, Box<Expr>),
}

/// Function names and arities an expression may use.
pub type Signatures = &'static [(&'static str, usize)];

impl Expr {
    pub fn parse(input: &str, functions: Signatures) -> Result<Expr, ExpressionError> {
        let tokens = tokenize(input)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            functions,
        };
        let expr = parser.or()?;
        match parser.peek() {
            None => Ok(expr),
            Some(token) => Err(ExpressionError::UnexpectedToken(format!("{:?}", token))),
        }
    }

    /// Evaluate with `call` providing every function result.
    pub fn eval(&self, call: &impl Fn(&str, &[f64]) -> Value) -> bool {
        self.value(call).truthy()
    }

    fn value(&self, call: &impl Fn(&str, &[f64]) -> Value) -> Value {
        match self {
            Expr::Number(n) => Value::Number(*n),
            Expr::Call(name, args) => call(name, args),
            Expr::Not(e) => Value::Bool(!e.eval(call)),
            Expr::And(a, b) => Value::Bool(a.eval(call) && b.eval(call)),
            Expr::Or(a, b) => Value::Bool(a.eval(call) || b.eval(call)),
            Expr::Compare(op, a, b) => {
                let (a, b) = (a.value(call).as_number(), b.value(call).as_number());
                Value::Bool(match op {
                    CmpOp::Lt => a < b,
                    CmpOp::Le => a <= b,
                    CmpOp::Gt => a > b,
                    CmpOp::Ge => a >= b,
                    CmpOp::Eq => a == b,
                    CmpOp::Ne => a != b,
                })
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    LParen,
    RParen,
    Comma,
    Not,
    And,
    Or,
    Cmp(CmpOp),
}

fn tokenize(input: &str) -> Result<Vec<Token>, ExpressionError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            ' ' | '\t' | '\n' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '&' if next == Some('&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if next == Some('|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '<' | '>' | '=' | '!' => {
                let op = match (c, next) {
                    ('<', Some('=')) => Some(CmpOp::Le),
                    ('>', Some('=')) => Some(CmpOp::Ge),
                    ('=', Some('=')) => Some(CmpOp::Eq),
                    ('!', Some('=')) => Some(CmpOp::Ne),
                    _ => None,
                };
                match (op, c) {
                    (Some(op), _) => {
                        tokens.push(Token::Cmp(op));
                        i += 2;
                    }
                    (None, '<') => {
                        tokens.push(Token::Cmp(CmpOp::Lt));
                        i += 1;
                    }
                    (None, '>') => {
                        tokens.push(Token::Cmp(CmpOp::Gt));
                        i += 1;
                    }
                    (None, '!') => {
                        tokens.push(Token::Not);
                        i += 1;
                    }
                    _ => return Err(ExpressionError::UnexpectedChar(c, i)),
                }
            }
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let literal: String = chars[start..i].iter().collect();
                let n = literal
                    .parse()
                    .map_err(|_| ExpressionError::UnexpectedToken(literal.clone()))?;
                tokens.push(Token::Number(n));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            _ => return Err(ExpressionError::UnexpectedChar(c, i)),
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    functions: Signatures,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Result<Token, ExpressionError> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or(ExpressionError::UnexpectedEnd)?;
        self.pos += 1;
        Ok(token)
    }

    fn expect(&mut self, expected: Token) -> Result<(), ExpressionError> {
        match self.advance()? {
            token if token == expected => Ok(()),
            token => Err(ExpressionError::UnexpectedToken(format!("{:?}", token))),
        }
    }

    fn or(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            left = Expr::Or(Box::new(left), Box::new(self.and()?));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            left = Expr::And(Box::new(left), Box::new(self.unary()?));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, ExpressionError> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            return Ok(Expr::Not(Box::new(self.unary()?)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, ExpressionError> {
        let left = self.primary()?;
        if let Some(Token::Cmp(op)) = self.peek().cloned() {
            self.pos += 1;
            let right = self.primary()?;
            return Ok(Expr::Compare(op, Box::new(left), Box::new(right)));
        }
        Ok(left)
    }

    fn primary(&mut self) -> Result<Expr, ExpressionError> {
        match self.advance()? {
            Token::Number(n) => Ok(Expr::Number(n)),
            Token::LParen => {
                let inner = self.or()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Token::Ident(name) => self.call(name),
            token => Err(ExpressionError::UnexpectedToken(format!("{:?}", token))),
        }
    }

    fn call(&mut self, name: String) -> Result<Expr, ExpressionError> {
        let Some(&(_, arity)) = self.functions.iter().find(|(f, _)| *f == name) else {
            return Err(ExpressionError::UnknownFunction(name));
        };

        self.expect(Token::LParen)?;
        let mut args = Vec::new();
        if self.peek() != Some(&Token::RParen) {
            loop {
                match self.advance()? {
                    Token::Number(n) => args.push(n),
                    token => return Err(ExpressionError::UnexpectedToken(format!("{:?}", token))),
                }
                if self.peek() == Some(&Token::Comma) {
                    self.pos += 1;
                } else {
                    break;
                }
            }
        }
        self.expect(Token::RParen)?;

        if args.len() != arity {
            return Err(ExpressionError::Arity {
                name,
                expected: arity,
                got: args.len(),
            });
        }
        Ok(Expr::Call(name, args))
    }
}

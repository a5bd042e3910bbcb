//! Criteria expressions
//!
//! Boolean conditions over a single cell value `x`, e.g. `abs(x) < 1e-3`
//! or `0 < x <= 5 and x != 3`.
//!
//! Precedence (lowest to highest):
//! 1. `or` / `||`
//! 2. `and` / `&&`
//! 3. `not` / `!`
//! 4. comparisons `< <= > >= == !=` (chainable: `a < x < b`)
//! 5. `+ -`
//! 6. `* /`
//! 7. unary `-`
//! 8. literals, `x`, `abs(...)`, parentheses

use std::fmt;

use crate::error::{Result, SuiteError};

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Not,
    LParen,
    RParen,
    Eof,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Number(f64),
    Bool(bool),
    Var,
    Abs(Box<Expr>),
    Neg(Box<Expr>),
    Not(Box<Expr>),
    Arith(ArithOp, Box<Expr>, Box<Expr>),
    /// `first op1 e1 op2 e2 ...`, true when every adjacent pair holds
    Compare(Box<Expr>, Vec<(CmpOp, Expr)>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

/// A parsed criteria expression
#[derive(Debug, Clone, PartialEq)]
pub struct Criteria {
    source: String,
    expr: Expr,
}

impl fmt::Display for Criteria {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl Criteria {
    pub fn parse(source: &str) -> Result<Self> {
        let err = |details: String| SuiteError::Criteria {
            expr: source.to_string(),
            details,
        };
        let tokens = tokenize(source).map_err(err)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_or().map_err(err)?;
        if parser.peek() != &Token::Eof {
            return Err(err(format!("unexpected token {:?}", parser.peek())));
        }
        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    /// Whether `x` satisfies the condition
    pub fn check(&self, x: f64) -> bool {
        eval(&self.expr, x) != 0.0
    }
}

fn tokenize(input: &str) -> std::result::Result<Vec<Token>, String> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        let (token, width) = match (c, next) {
            (c, _) if c.is_whitespace() => {
                i += 1;
                continue;
            }
            ('<', Some('=')) => (Token::Le, 2),
            ('>', Some('=')) => (Token::Ge, 2),
            ('=', Some('=')) => (Token::Eq, 2),
            ('!', Some('=')) => (Token::Ne, 2),
            ('&', Some('&')) => (Token::And, 2),
            ('|', Some('|')) => (Token::Or, 2),
            ('<', _) => (Token::Lt, 1),
            ('>', _) => (Token::Gt, 1),
            ('!', _) => (Token::Not, 1),
            ('+', _) => (Token::Plus, 1),
            ('-', _) => (Token::Minus, 1),
            ('*', _) => (Token::Star, 1),
            ('/', _) => (Token::Slash, 1),
            ('(', _) => (Token::LParen, 1),
            (')', _) => (Token::RParen, 1),
            (c, _) if c.is_ascii_digit() || c == '.' => {
                let start = i;
                i += 1;
                while i < chars.len() {
                    let d = chars[i];
                    let exponent_sign =
                        (d == '+' || d == '-') && matches!(chars[i - 1], 'e' | 'E');
                    if d.is_ascii_digit() || d == '.' || d == 'e' || d == 'E' || exponent_sign {
                        i += 1;
                    } else {
                        break;
                    }
                }
                let text: String = chars[start..i].iter().collect();
                let n = text
                    .parse::<f64>()
                    .map_err(|_| format!("invalid number '{}'", text))?;
                tokens.push(Token::Number(n));
                continue;
            }
            (c, _) if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    _ => Token::Ident(word),
                });
                continue;
            }
            (c, _) => return Err(format!("unexpected character '{}' at {}", c, i)),
        };
        tokens.push(token);
        i += width;
    }

    tokens.push(Token::Eof);
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

type ParseResult = std::result::Result<Expr, String>;

impl Parser {
    fn peek(&self) -> &Token {
        self.tokens.get(self.pos).unwrap_or(&Token::Eof)
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        self.pos += 1;
        token
    }

    fn expect(&mut self, token: Token) -> std::result::Result<(), String> {
        if self.peek() == &token {
            self.pos += 1;
            Ok(())
        } else {
            Err(format!("expected {:?}, found {:?}", token, self.peek()))
        }
    }

    fn parse_or(&mut self) -> ParseResult {
        let mut left = self.parse_and()?;
        while self.peek() == &Token::Or {
            self.advance();
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> ParseResult {
        let mut left = self.parse_not()?;
        while self.peek() == &Token::And {
            self.advance();
            let right = self.parse_not()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> ParseResult {
        if self.peek() == &Token::Not {
            self.advance();
            return Ok(Expr::Not(Box::new(self.parse_not()?)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> ParseResult {
        let first = self.parse_additive()?;
        let mut rest = Vec::new();
        loop {
            let op = match self.peek() {
                Token::Eq => CmpOp::Eq,
                Token::Ne => CmpOp::Ne,
                Token::Lt => CmpOp::Lt,
                Token::Le => CmpOp::Le,
                Token::Gt => CmpOp::Gt,
                Token::Ge => CmpOp::Ge,
                _ => break,
            };
            self.advance();
            rest.push((op, self.parse_additive()?));
        }
        if rest.is_empty() {
            Ok(first)
        } else {
            Ok(Expr::Compare(Box::new(first), rest))
        }
    }

    fn parse_additive(&mut self) -> ParseResult {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Token::Plus => ArithOp::Add,
                Token::Minus => ArithOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.parse_multiplicative()?;
            left = Expr::Arith(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> ParseResult {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Token::Star => ArithOp::Mul,
                Token::Slash => ArithOp::Div,
                _ => break,
            };
            self.advance();
            let right = self.parse_unary()?;
            left = Expr::Arith(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> ParseResult {
        match self.peek() {
            Token::Minus => {
                self.advance();
                Ok(Expr::Neg(Box::new(self.parse_unary()?)))
            }
            Token::Plus => {
                self.advance();
                self.parse_unary()
            }
            _ => self.parse_primary(),
        }
    }

    fn parse_primary(&mut self) -> ParseResult {
        match self.advance() {
            Token::Number(n) => Ok(Expr::Number(n)),
            Token::LParen => {
                let inner = self.parse_or()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Token::Ident(name) => match name.as_str() {
                "x" => Ok(Expr::Var),
                "True" | "true" => Ok(Expr::Bool(true)),
                "False" | "false" => Ok(Expr::Bool(false)),
                "abs" => {
                    self.expect(Token::LParen)?;
                    let arg = self.parse_or()?;
                    self.expect(Token::RParen)?;
                    Ok(Expr::Abs(Box::new(arg)))
                }
                other => Err(format!("unknown name '{}'", other)),
            },
            other => Err(format!("unexpected token {:?}", other)),
        }
    }
}

fn bool_num(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}

/// Booleans are carried as 1.0 / 0.0
fn eval(expr: &Expr, x: f64) -> f64 {
    match expr {
        Expr::Number(n) => *n,
        Expr::Bool(b) => bool_num(*b),
        Expr::Var => x,
        Expr::Abs(e) => eval(e, x).abs(),
        Expr::Neg(e) => -eval(e, x),
        Expr::Not(e) => bool_num(eval(e, x) == 0.0),
        Expr::Arith(op, l, r) => {
            let (l, r) = (eval(l, x), eval(r, x));
            match op {
                ArithOp::Add => l + r,
                ArithOp::Sub => l - r,
                ArithOp::Mul => l * r,
                ArithOp::Div => l / r,
            }
        }
        Expr::Compare(first, rest) => {
            let mut left = eval(first, x);
            for (op, e) in rest {
                let right = eval(e, x);
                let holds = match op {
                    CmpOp::Eq => left == right,
                    CmpOp::Ne => left != right,
                    CmpOp::Lt => left < right,
                    CmpOp::Le => left <= right,
                    CmpOp::Gt => left > right,
                    CmpOp::Ge => left >= right,
                };
                if !holds {
                    return 0.0;
                }
                left = right;
            }
            1.0
        }
        Expr::And(l, r) => bool_num(eval(l, x) != 0.0 && eval(r, x) != 0.0),
        Expr::Or(l, r) => bool_num(eval(l, x) != 0.0 || eval(r, x) != 0.0),
    }
}

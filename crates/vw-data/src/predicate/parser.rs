//! Recursive-descent parser for predicate expressions

use serde_json::Value;

use super::{BinaryOp, Expr};
use crate::DataError;

/// Names that refer to the row under test
const ROW_BINDINGS: &[&str] = &["datum", "data_remove", "d"];

/// Deepest nesting of parentheses and unary operators accepted
pub(super) const MAX_NESTING: usize = 64;

/// Tallest expression tree accepted; evaluation recurses once per level
pub(super) const MAX_HEIGHT: usize = 1024;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    Op(&'static str),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Dot,
    Semicolon,
}

pub(super) fn parse(source: &str) -> Result<Expr, DataError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
        height: 0,
    };

    if matches!(parser.peek(), Some(Token::Ident(name)) if name == "return") {
        parser.pos += 1;
    }
    let expr = parser.expr()?;
    if parser.peek() == Some(&Token::Semicolon) {
        parser.pos += 1;
    }
    if parser.pos != parser.tokens.len() {
        return Err(parser.error("unexpected trailing input"));
    }
    Ok(expr)
}

fn tokenize(source: &str) -> Result<Vec<(usize, Token)>, DataError> {
    const OPERATORS: &[&str] = &[
        "===", "!==", "==", "!=", "<=", ">=", "&&", "||", "<", ">", "!", "+", "-", "*", "/", "%",
    ];

    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let start = i;

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        let single = match c {
            '(' => Some(Token::LParen),
            ')' => Some(Token::RParen),
            '[' => Some(Token::LBracket),
            ']' => Some(Token::RBracket),
            '.' if !chars.get(i + 1).map_or(false, |n| n.is_ascii_digit()) => Some(Token::Dot),
            ';' => Some(Token::Semicolon),
            _ => None,
        };
        if let Some(token) = single {
            tokens.push((start, token));
            i += 1;
            continue;
        }

        if c == '\'' || c == '"' {
            let quote = c;
            let mut text = String::new();
            i += 1;
            loop {
                match chars.get(i) {
                    None => {
                        return Err(DataError::Parse {
                            position: start,
                            message: "unterminated string".to_string(),
                        })
                    }
                    Some('\\') => {
                        let escaped = chars.get(i + 1).copied().unwrap_or('\\');
                        text.push(match escaped {
                            'n' => '\n',
                            't' => '\t',
                            other => other,
                        });
                        i += 2;
                    }
                    Some(&ch) if ch == quote => {
                        i += 1;
                        break;
                    }
                    Some(&ch) => {
                        text.push(ch);
                        i += 1;
                    }
                }
            }
            tokens.push((start, Token::Str(text)));
            continue;
        }

        if c.is_ascii_digit() || c == '.' {
            while let Some(&ch) = chars.get(i) {
                let exponent_sign = (ch == '+' || ch == '-') && matches!(chars[i - 1], 'e' | 'E');
                if !(ch.is_ascii_digit() || matches!(ch, '.' | 'e' | 'E') || exponent_sign) {
                    break;
                }
                i += 1;
            }
            let literal: String = chars[start..i].iter().collect();
            let n = literal.parse::<f64>().map_err(|_| DataError::Parse {
                position: start,
                message: format!("invalid number '{}'", literal),
            })?;
            tokens.push((start, Token::Number(n)));
            continue;
        }

        if c.is_alphabetic() || c == '_' || c == '$' {
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '$') {
                i += 1;
            }
            tokens.push((start, Token::Ident(chars[start..i].iter().collect())));
            continue;
        }

        let rest: String = chars[i..chars.len().min(i + 3)].iter().collect();
        match OPERATORS.iter().find(|op| rest.starts_with(**op)) {
            Some(op) => {
                tokens.push((start, Token::Op(*op)));
                i += op.len();
            }
            None => {
                return Err(DataError::Parse {
                    position: start,
                    message: format!("unexpected character '{}'", c),
                })
            }
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    /// Current recursion through parentheses and unary operators
    depth: usize,
    /// Height of the expression most recently produced
    height: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, token)| token)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(_, token)| token.clone());
        self.pos += 1;
        token
    }

    fn error(&self, message: &str) -> DataError {
        let position = self
            .tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|(pos, _)| *pos)
            .unwrap_or(0);
        DataError::Parse {
            position,
            message: message.to_string(),
        }
    }

    fn eat_op(&mut self, candidates: &[(&str, BinaryOp)]) -> Option<BinaryOp> {
        if let Some(Token::Op(op)) = self.peek() {
            if let Some((_, binary)) = candidates.iter().find(|(symbol, _)| symbol == op) {
                self.pos += 1;
                return Some(*binary);
            }
        }
        None
    }

    fn grow(&mut self, height: usize) -> Result<(), DataError> {
        if height > MAX_HEIGHT {
            return Err(self.error("expression too large"));
        }
        self.height = height;
        Ok(())
    }

    fn binary_level(
        &mut self,
        candidates: &[(&str, BinaryOp)],
        next: fn(&mut Self) -> Result<Expr, DataError>,
    ) -> Result<Expr, DataError> {
        let mut lhs = next(self)?;
        let mut height = self.height;
        while let Some(op) = self.eat_op(candidates) {
            let rhs = next(self)?;
            height = height.max(self.height) + 1;
            self.grow(height)?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        self.height = height;
        Ok(lhs)
    }

    fn expr(&mut self) -> Result<Expr, DataError> {
        self.or()
    }

    fn or(&mut self) -> Result<Expr, DataError> {
        self.binary_level(&[("||", BinaryOp::Or)], Self::and)
    }

    fn and(&mut self) -> Result<Expr, DataError> {
        self.binary_level(&[("&&", BinaryOp::And)], Self::equality)
    }

    fn equality(&mut self) -> Result<Expr, DataError> {
        self.binary_level(
            &[
                ("==", BinaryOp::Eq),
                ("===", BinaryOp::StrictEq),
                ("!=", BinaryOp::Ne),
                ("!==", BinaryOp::StrictNe),
            ],
            Self::comparison,
        )
    }

    fn comparison(&mut self) -> Result<Expr, DataError> {
        self.binary_level(
            &[
                ("<", BinaryOp::Lt),
                ("<=", BinaryOp::Le),
                (">", BinaryOp::Gt),
                (">=", BinaryOp::Ge),
            ],
            Self::additive,
        )
    }

    fn additive(&mut self) -> Result<Expr, DataError> {
        self.binary_level(&[("+", BinaryOp::Add), ("-", BinaryOp::Sub)], Self::multiplicative)
    }

    fn multiplicative(&mut self) -> Result<Expr, DataError> {
        self.binary_level(
            &[("*", BinaryOp::Mul), ("/", BinaryOp::Div), ("%", BinaryOp::Rem)],
            Self::unary,
        )
    }

    fn unary(&mut self) -> Result<Expr, DataError> {
        if self.depth >= MAX_NESTING {
            return Err(self.error("expression nested too deeply"));
        }
        self.depth += 1;
        let expr = self.unary_inner();
        self.depth -= 1;
        expr
    }

    fn unary_inner(&mut self) -> Result<Expr, DataError> {
        let wrap: fn(Box<Expr>) -> Expr = match self.peek() {
            Some(Token::Op("!")) => Expr::Not,
            Some(Token::Op("-")) => Expr::Neg,
            _ => return self.primary(),
        };
        self.pos += 1;
        let inner = self.unary()?;
        self.grow(self.height + 1)?;
        Ok(wrap(Box::new(inner)))
    }

    fn primary(&mut self) -> Result<Expr, DataError> {
        self.height = 1;
        match self.next() {
            Some(Token::Number(n)) => Ok(Expr::Literal(
                serde_json::Number::from_f64(n)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
            )),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::LParen) => {
                let inner = self.expr()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(self.error("expected ')'")),
                }
            }
            Some(Token::Ident(name)) => match name.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" | "undefined" => Ok(Expr::Literal(Value::Null)),
                binding if ROW_BINDINGS.contains(&binding) => self.path(),
                other => {
                    self.pos -= 1;
                    Err(self.error(&format!("unknown identifier '{}'", other)))
                }
            },
            _ => {
                self.pos = self.pos.saturating_sub(1);
                Err(self.error("expected a value"))
            }
        }
    }

    fn path(&mut self) -> Result<Expr, DataError> {
        let mut path = Vec::new();
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.pos += 1;
                    match self.next() {
                        Some(Token::Ident(field)) => path.push(field),
                        _ => return Err(self.error("expected a field name after '.'")),
                    }
                }
                Some(Token::LBracket) => {
                    self.pos += 1;
                    match (self.next(), self.next()) {
                        (Some(Token::Str(field)), Some(Token::RBracket)) => path.push(field),
                        _ => return Err(self.error("expected a quoted field name in brackets")),
                    }
                }
                _ => {
                    self.height = 1;
                    return Ok(Expr::Field(path));
                }
            }
        }
    }
}

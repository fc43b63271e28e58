//! Recursive-descent parser for rule conditions.
//!
//! ```text
//! expr       := and ( OR and )*
//! and        := unary ( AND unary )*
//! unary      := NOT unary | primary
//! primary    := '(' expr ')' | operand [ [NOT] op rhs ]
//! operand    := IDENT | IDENT '(' [ arg ( ',' arg )* ] ')'
//! arg        := literal | IDENT
//! rhs        := literal | '(' literal ( ',' literal )* ')'   -- list only after IN
//! ```
//!
//! A bare identifier on the right of a comparison is read as a string, so
//! `Department = IT` means `Department = 'IT'`.

use thiserror::Error;

use super::ast::{Argument, Comparison, ComparisonOp, Expression, FunctionCall, Literal, Operand};
use super::functions::FunctionRegistry;
use super::lexer::{Lexer, LexerError, Spanned, Token};

/// Error raised while parsing a condition.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message} at offset {offset}")]
pub struct ParseError {
    /// What went wrong.
    pub message: String,
    /// Byte offset in the condition text.
    pub offset: usize,
}

impl From<LexerError> for ParseError {
    fn from(err: LexerError) -> Self {
        ParseError {
            message: err.message,
            offset: err.offset,
        }
    }
}

/// Parser over a token stream.
pub struct Parser {
    tokens: Vec<Spanned>,
    cursor: usize,
}

impl Parser {
    /// Parse condition text into an [`Expression`].
    pub fn parse(input: &str) -> Result<Expression, ParseError> {
        let tokens = Lexer::new(input).tokenize()?;
        let mut parser = Parser { tokens, cursor: 0 };
        let expr = parser.parse_or()?;
        if parser.peek() != &Token::Eof {
            return Err(parser.error(format!(
                "Unexpected {} after end of condition",
                parser.peek()
            )));
        }
        Ok(expr)
    }

    fn parse_or(&mut self) -> Result<Expression, ParseError> {
        let mut left = self.parse_and()?;
        while self.eat(&Token::Or) {
            let right = self.parse_and()?;
            left = Expression::or(left, right);
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expression, ParseError> {
        let mut left = self.parse_unary()?;
        while self.eat(&Token::And) {
            let right = self.parse_unary()?;
            left = Expression::and(left, right);
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expression, ParseError> {
        if self.eat(&Token::Not) {
            return Ok(Expression::not(self.parse_unary()?));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expression, ParseError> {
        if self.eat(&Token::LeftParen) {
            let inner = self.parse_or()?;
            self.expect(&Token::RightParen)?;
            return Ok(Expression::Group(Box::new(inner)));
        }

        let operand = self.parse_operand()?;

        let negated = matches!(self.peek(), Token::Not)
            && matches!(self.peek_at(1), Token::In | Token::Like);
        if negated {
            self.advance();
        }

        let Some(operator) = self.comparison_operator() else {
            return match operand {
                Operand::Call(call) => Ok(Expression::Call(call)),
                Operand::Property(name) => Err(self.error(format!(
                    "Expected comparison operator after '{name}', found {}",
                    self.peek()
                ))),
            };
        };
        self.advance();

        let right = if operator == ComparisonOp::In {
            self.parse_list()?
        } else {
            self.parse_literal()?
        };

        let comparison = Expression::Comparison(Comparison {
            left: operand,
            operator,
            right,
        });
        Ok(if negated {
            Expression::not(comparison)
        } else {
            comparison
        })
    }

    fn parse_operand(&mut self) -> Result<Operand, ParseError> {
        let offset = self.offset();
        let name = match self.advance() {
            Token::Identifier(name) => name,
            other => {
                return Err(ParseError {
                    message: format!("Expected property or function name, found {other}"),
                    offset,
                })
            }
        };

        if !self.eat(&Token::LeftParen) {
            return Ok(Operand::Property(name));
        }

        if !FunctionRegistry::exists(&name) {
            return Err(ParseError {
                message: format!("Unknown function '{name}'"),
                offset,
            });
        }

        let mut arguments = Vec::new();
        if !self.eat(&Token::RightParen) {
            loop {
                let argument = if let Token::Identifier(prop) = self.peek().clone() {
                    self.advance();
                    Argument::Property(prop)
                } else {
                    Argument::Literal(self.parse_literal()?)
                };
                arguments.push(argument);
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
            self.expect(&Token::RightParen)?;
        }

        Ok(Operand::Call(FunctionCall::new(name, arguments)))
    }

    fn comparison_operator(&self) -> Option<ComparisonOp> {
        match self.peek() {
            Token::Equal => Some(ComparisonOp::Equal),
            Token::NotEqual => Some(ComparisonOp::NotEqual),
            Token::LessThan => Some(ComparisonOp::LessThan),
            Token::GreaterThan => Some(ComparisonOp::GreaterThan),
            Token::LessThanOrEqual => Some(ComparisonOp::LessThanOrEqual),
            Token::GreaterThanOrEqual => Some(ComparisonOp::GreaterThanOrEqual),
            Token::Like => Some(ComparisonOp::Like),
            Token::In => Some(ComparisonOp::In),
            _ => None,
        }
    }

    fn parse_literal(&mut self) -> Result<Literal, ParseError> {
        let offset = self.offset();
        match self.advance() {
            Token::StringLiteral(s) | Token::Identifier(s) => Ok(Literal::String(s)),
            Token::IntegerLiteral(i) => Ok(Literal::Integer(i)),
            Token::FloatLiteral(f) => Ok(Literal::Float(f)),
            Token::True => Ok(Literal::Boolean(true)),
            Token::False => Ok(Literal::Boolean(false)),
            Token::Null => Ok(Literal::Null),
            other => Err(ParseError {
                message: format!("Expected a value, found {other}"),
                offset,
            }),
        }
    }

    fn parse_list(&mut self) -> Result<Literal, ParseError> {
        self.expect(&Token::LeftParen)?;
        let mut items = vec![self.parse_literal()?];
        while self.eat(&Token::Comma) {
            items.push(self.parse_literal()?);
        }
        self.expect(&Token::RightParen)?;
        Ok(Literal::List(items))
    }

    fn peek(&self) -> &Token {
        self.peek_at(0)
    }

    fn peek_at(&self, ahead: usize) -> &Token {
        self.tokens
            .get(self.cursor + ahead)
            .map_or(&Token::Eof, |s| &s.token)
    }

    fn offset(&self) -> usize {
        self.tokens
            .get(self.cursor)
            .or_else(|| self.tokens.last())
            .map_or(0, |s| s.offset)
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if token != Token::Eof {
            self.cursor += 1;
        }
        token
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == expected {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: &Token) -> Result<(), ParseError> {
        if self.eat(expected) {
            Ok(())
        } else {
            Err(self.error(format!("Expected {expected}, found {}", self.peek())))
        }
    }

    fn error(&self, message: String) -> ParseError {
        ParseError {
            message,
            offset: self.offset(),
        }
    }
}

//! Tokenizer for rule conditions.

use std::iter::Peekable;
use std::str::CharIndices;

use thiserror::Error;

/// A token in a condition.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    /// A property or function name. Backtick-quoted names may contain spaces.
    Identifier(String),
    /// A quoted string literal.
    StringLiteral(String),
    /// An integer literal.
    IntegerLiteral(i64),
    /// A floating-point literal.
    FloatLiteral(f64),

    /// `AND`
    And,
    /// `OR`
    Or,
    /// `NOT`
    Not,
    /// `LIKE`
    Like,
    /// `IN`
    In,
    /// `TRUE`
    True,
    /// `FALSE`
    False,
    /// `NULL`
    Null,

    /// `=` or `==`
    Equal,
    /// `!=` or `<>`
    NotEqual,
    /// `<`
    LessThan,
    /// `>`
    GreaterThan,
    /// `<=`
    LessThanOrEqual,
    /// `>=`
    GreaterThanOrEqual,

    /// `(`
    LeftParen,
    /// `)`
    RightParen,
    /// `,`
    Comma,

    /// End of input.
    Eof,
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::Identifier(s) => write!(f, "identifier '{s}'"),
            Token::StringLiteral(s) => write!(f, "string '{s}'"),
            Token::IntegerLiteral(i) => write!(f, "integer {i}"),
            Token::FloatLiteral(fl) => write!(f, "number {fl}"),
            Token::And => write!(f, "AND"),
            Token::Or => write!(f, "OR"),
            Token::Not => write!(f, "NOT"),
            Token::Like => write!(f, "LIKE"),
            Token::In => write!(f, "IN"),
            Token::True => write!(f, "TRUE"),
            Token::False => write!(f, "FALSE"),
            Token::Null => write!(f, "NULL"),
            Token::Equal => write!(f, "="),
            Token::NotEqual => write!(f, "!="),
            Token::LessThan => write!(f, "<"),
            Token::GreaterThan => write!(f, ">"),
            Token::LessThanOrEqual => write!(f, "<="),
            Token::GreaterThanOrEqual => write!(f, ">="),
            Token::LeftParen => write!(f, "("),
            Token::RightParen => write!(f, ")"),
            Token::Comma => write!(f, ","),
            Token::Eof => write!(f, "end of input"),
        }
    }
}

/// A token together with the byte offset it starts at.
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    /// The token.
    pub token: Token,
    /// Byte offset in the source text.
    pub offset: usize,
}

/// Error during tokenization.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message} at offset {offset}")]
pub struct LexerError {
    /// What went wrong.
    pub message: String,
    /// Byte offset of the offending input.
    pub offset: usize,
}

/// Tokenizer over a condition string.
pub struct Lexer<'a> {
    source: &'a str,
    chars: Peekable<CharIndices<'a>>,
}

impl<'a> Lexer<'a> {
    /// Create a lexer over `source`.
    #[must_use]
    pub fn new(source: &'a str) -> Self {
        Self {
            source,
            chars: source.char_indices().peekable(),
        }
    }

    /// Tokenize the whole input; the last token is always [`Token::Eof`].
    pub fn tokenize(mut self) -> Result<Vec<Spanned>, LexerError> {
        let mut tokens = Vec::new();
        loop {
            let spanned = self.next_token()?;
            let done = spanned.token == Token::Eof;
            tokens.push(spanned);
            if done {
                return Ok(tokens);
            }
        }
    }

    fn offset(&mut self) -> usize {
        self.chars.peek().map_or(self.source.len(), |(i, _)| *i)
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().map(|(_, c)| *c)
    }

    fn bump(&mut self) -> Option<char> {
        self.chars.next().map(|(_, c)| c)
    }

    fn bump_if(&mut self, expected: char) -> bool {
        self.chars.next_if(|(_, c)| *c == expected).is_some()
    }

    fn error(message: impl Into<String>, offset: usize) -> LexerError {
        LexerError {
            message: message.into(),
            offset,
        }
    }

    fn next_token(&mut self) -> Result<Spanned, LexerError> {
        while self.chars.next_if(|(_, c)| c.is_whitespace()).is_some() {}

        let offset = self.offset();
        let Some(ch) = self.peek() else {
            return Ok(Spanned {
                token: Token::Eof,
                offset,
            });
        };

        let token = match ch {
            '(' | ')' | ',' => {
                self.bump();
                match ch {
                    '(' => Token::LeftParen,
                    ')' => Token::RightParen,
                    _ => Token::Comma,
                }
            }
            '=' => {
                self.bump();
                self.bump_if('=');
                Token::Equal
            }
            '!' => {
                self.bump();
                if !self.bump_if('=') {
                    return Err(Self::error("Expected '=' after '!'", offset));
                }
                Token::NotEqual
            }
            '<' => {
                self.bump();
                if self.bump_if('=') {
                    Token::LessThanOrEqual
                } else if self.bump_if('>') {
                    Token::NotEqual
                } else {
                    Token::LessThan
                }
            }
            '>' => {
                self.bump();
                if self.bump_if('=') {
                    Token::GreaterThanOrEqual
                } else {
                    Token::GreaterThan
                }
            }
            '\'' | '"' => Token::StringLiteral(self.read_quoted(offset)?),
            '`' => Token::Identifier(self.read_quoted(offset)?),
            c if c.is_ascii_digit() || c == '-' => self.read_number(offset)?,
            c if c.is_alphabetic() || c == '_' => self.read_word(),
            other => {
                return Err(Self::error(
                    format!("Unexpected character '{other}'"),
                    offset,
                ))
            }
        };

        Ok(Spanned { token, offset })
    }

    /// Read a literal delimited by the quote character under the cursor.
    /// A doubled quote or a backslash escape embeds the quote itself.
    fn read_quoted(&mut self, start: usize) -> Result<String, LexerError> {
        let Some(quote) = self.bump() else {
            return Err(Self::error("Unterminated literal", start));
        };
        let mut text = String::new();
        loop {
            match self.bump() {
                Some(c) if c == quote => {
                    if self.bump_if(quote) {
                        text.push(quote);
                    } else {
                        return Ok(text);
                    }
                }
                Some('\\') => match self.bump() {
                    Some('n') => text.push('\n'),
                    Some('t') => text.push('\t'),
                    Some(c) if c == quote || c == '\\' => text.push(c),
                    Some(c) => {
                        text.push('\\');
                        text.push(c);
                    }
                    None => return Err(Self::error("Unterminated literal", start)),
                },
                Some(c) => text.push(c),
                None => return Err(Self::error("Unterminated literal", start)),
            }
        }
    }

    fn read_number(&mut self, start: usize) -> Result<Token, LexerError> {
        let mut text = String::new();
        if self.bump_if('-') {
            text.push('-');
        }
        while let Some((_, c)) = self.chars.next_if(|(_, c)| c.is_ascii_digit()) {
            text.push(c);
        }
        if text.is_empty() || text == "-" {
            return Err(Self::error("Expected digits", start));
        }

        if !self.bump_if('.') {
            return text
                .parse::<i64>()
                .map(Token::IntegerLiteral)
                .map_err(|_| Self::error("Integer literal out of range", start));
        }

        text.push('.');
        let mut fraction = false;
        while let Some((_, c)) = self.chars.next_if(|(_, c)| c.is_ascii_digit()) {
            text.push(c);
            fraction = true;
        }
        if !fraction {
            return Err(Self::error("Expected digits after decimal point", start));
        }
        text.parse::<f64>()
            .map(Token::FloatLiteral)
            .map_err(|_| Self::error("Invalid number literal", start))
    }

    fn read_word(&mut self) -> Token {
        let mut word = String::new();
        while let Some((_, c)) = self
            .chars
            .next_if(|(_, c)| c.is_alphanumeric() || *c == '_' || *c == '.')
        {
            word.push(c);
        }

        match word.to_ascii_uppercase().as_str() {
            "AND" => Token::And,
            "OR" => Token::Or,
            "NOT" => Token::Not,
            "LIKE" => Token::Like,
            "IN" => Token::In,
            "TRUE" => Token::True,
            "FALSE" => Token::False,
            "NULL" => Token::Null,
            _ => Token::Identifier(word),
        }
    }
}

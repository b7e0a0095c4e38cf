//! Lexer for the IR text format.
//!
//! The lexer converts source text into a stream of tokens.

use crate::frontend::token::{Token, TokenKind};
use crate::utils::location::{Span, SourceLocation};
use crate::utils::errors::{LexerError, LexerErrorKind};
use unicode_xid::UnicodeXID;
use std::iter::Peekable;
use std::str::Chars;

/// A lexer for tokenizing IR text.
pub struct Lexer<'a> {
    /// The source text
    source: &'a str,
    /// Character iterator
    chars: Peekable<Chars<'a>>,
    /// Current byte offset
    offset: usize,
    /// Current line number (1-indexed)
    line: usize,
    /// Current column number (1-indexed)
    column: usize,
    /// Start of current token
    token_start: SourceLocation,
}

impl<'a> Lexer<'a> {
    pub fn new(source: &'a str) -> Self {
        Self {
            source,
            chars: source.chars().peekable(),
            offset: 0,
            line: 1,
            column: 1,
            token_start: SourceLocation::start(),
        }
    }

    fn current_location(&self) -> SourceLocation {
        SourceLocation::new(self.line, self.column, self.offset)
    }

    fn make_span(&self) -> Span {
        Span::from_locations(self.token_start, self.current_location())
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().copied()
    }

    /// Peek one character past the current one.
    fn peek_next(&self) -> Option<char> {
        let mut chars = self.source[self.offset..].chars();
        chars.next();
        chars.next()
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.chars.next()?;
        self.offset += c.len_utf8();
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    /// Skip whitespace, `//` line comments and `/* */` block comments.
    fn skip_whitespace(&mut self) -> Result<(), LexerError> {
        loop {
            match self.peek() {
                Some(' ') | Some('\t') | Some('\r') | Some('\n') => {
                    self.advance();
                }
                Some('/') if self.peek_next() == Some('/') => {
                    while self.peek().is_some() && self.peek() != Some('\n') {
                        self.advance();
                    }
                }
                Some('/') if self.peek_next() == Some('*') => {
                    self.token_start = self.current_location();
                    self.advance();
                    self.advance();
                    loop {
                        match self.advance() {
                            Some('*') if self.peek() == Some('/') => {
                                self.advance();
                                break;
                            }
                            Some(_) => {}
                            None => {
                                return Err(self.make_error(
                                    "Unterminated block comment",
                                    LexerErrorKind::UnexpectedEof,
                                ));
                            }
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn make_token(&self, kind: TokenKind) -> Token {
        let span = self.make_span();
        let lexeme = self.source[span.start_offset..span.end_offset].to_string();
        Token::new(kind, span, lexeme)
    }

    fn make_error(&self, message: &str, kind: LexerErrorKind) -> LexerError {
        LexerError {
            message: message.to_string(),
            span: self.make_span(),
            kind,
        }
    }

    fn is_name_char(c: char) -> bool {
        c.is_xid_continue() || c == '_' || c == '.'
    }

    fn scan_number(&mut self) -> Result<Token, LexerError> {
        while self.peek().map(|c| c.is_ascii_digit()).unwrap_or(false) {
            self.advance();
        }
        let token = self.make_token(TokenKind::Integer);
        if token.lexeme.parse::<i64>().is_err() {
            return Err(self.make_error(
                &format!("Integer literal out of range: {}", token.lexeme),
                LexerErrorKind::InvalidNumber,
            ));
        }
        Ok(token)
    }

    fn scan_identifier(&mut self) -> Token {
        while self.peek().map(Self::is_name_char).unwrap_or(false) {
            self.advance();
        }
        self.make_token(TokenKind::Identifier)
    }

    /// Scan the name after a `%` or `@` sigil.
    fn scan_sigil_name(&mut self, kind: TokenKind) -> Result<Token, LexerError> {
        let mut len = 0;
        while self.peek().map(Self::is_name_char).unwrap_or(false) {
            self.advance();
            len += 1;
        }
        if len == 0 {
            return Err(self.make_error("Expected a name after sigil", LexerErrorKind::MissingName));
        }
        Ok(self.make_token(kind))
    }

    /// Scan the next token.
    pub fn next_token(&mut self) -> Result<Token, LexerError> {
        self.skip_whitespace()?;
        self.token_start = self.current_location();

        let c = match self.advance() {
            Some(c) => c,
            None => return Ok(self.make_token(TokenKind::Eof)),
        };

        match c {
            '(' => Ok(self.make_token(TokenKind::LeftParen)),
            ')' => Ok(self.make_token(TokenKind::RightParen)),
            '[' => Ok(self.make_token(TokenKind::LeftBracket)),
            ']' => Ok(self.make_token(TokenKind::RightBracket)),
            '{' => Ok(self.make_token(TokenKind::LeftBrace)),
            '}' => Ok(self.make_token(TokenKind::RightBrace)),
            '<' => Ok(self.make_token(TokenKind::Less)),
            '>' => Ok(self.make_token(TokenKind::Greater)),
            ',' => Ok(self.make_token(TokenKind::Comma)),
            ':' => Ok(self.make_token(TokenKind::Colon)),
            '=' => Ok(self.make_token(TokenKind::Equal)),
            '^' => Ok(self.make_token(TokenKind::Caret)),
            '%' => self.scan_sigil_name(TokenKind::ValueName),
            '@' => self.scan_sigil_name(TokenKind::SymbolName),
            '-' => {
                if self.peek() == Some('>') {
                    self.advance();
                    Ok(self.make_token(TokenKind::Arrow))
                } else if self.peek().map(|c| c.is_ascii_digit()).unwrap_or(false) {
                    self.scan_number()
                } else {
                    Err(self.make_error("Expected '->' or a number after '-'", LexerErrorKind::UnexpectedChar))
                }
            }
            c if c.is_ascii_digit() => self.scan_number(),
            c if c.is_xid_start() || c == '_' => Ok(self.scan_identifier()),
            _ => Err(self.make_error(
                &format!("Unexpected character: '{}'", c),
                LexerErrorKind::UnexpectedChar,
            )),
        }
    }

    /// Collect all tokens, ending with `Eof`.
    pub fn tokenize(mut self) -> Result<Vec<Token>, LexerError> {
        let mut tokens = Vec::new();
        loop {
            let token = self.next_token()?;
            let is_eof = token.is_eof();
            tokens.push(token);
            if is_eof {
                return Ok(tokens);
            }
        }
    }
}

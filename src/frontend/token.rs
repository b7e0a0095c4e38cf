//! Token types for the IR text format.

use crate::utils::location::Span;
use std::fmt;

/// A token in the source text.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    /// The kind of token
    pub kind: TokenKind,
    /// The source span
    pub span: Span,
    /// The lexeme (raw text)
    pub lexeme: String,
}

impl Token {
    pub fn new(kind: TokenKind, span: Span, lexeme: String) -> Self {
        Self { kind, span, lexeme }
    }

    pub fn is_eof(&self) -> bool {
        matches!(self.kind, TokenKind::Eof)
    }

    /// Name without its sigil, for `%value`, `@symbol` and plain identifiers.
    pub fn name(&self) -> &str {
        match self.kind {
            TokenKind::ValueName | TokenKind::SymbolName => &self.lexeme[1..],
            _ => &self.lexeme,
        }
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self.kind, self.lexeme)
    }
}

/// The kind of a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    /// Bare word: op names, types, roles, attribute keys
    Identifier,
    /// Integer literal, optionally negative
    Integer,
    /// `%name`
    ValueName,
    /// `@name`
    SymbolName,

    /// `^` (region header)
    Caret,
    /// `(`
    LeftParen,
    /// `)`
    RightParen,
    /// `[`
    LeftBracket,
    /// `]`
    RightBracket,
    /// `{`
    LeftBrace,
    /// `}`
    RightBrace,
    /// `<`
    Less,
    /// `>`
    Greater,
    /// `,`
    Comma,
    /// `:`
    Colon,
    /// `=`
    Equal,
    /// `->`
    Arrow,

    /// End of input
    Eof,
}

impl TokenKind {
    /// Text shown in "expected ..." messages.
    pub fn describe(&self) -> &'static str {
        match self {
            TokenKind::Identifier => "identifier",
            TokenKind::Integer => "integer",
            TokenKind::ValueName => "%value",
            TokenKind::SymbolName => "@symbol",
            TokenKind::Caret => "'^'",
            TokenKind::LeftParen => "'('",
            TokenKind::RightParen => "')'",
            TokenKind::LeftBracket => "'['",
            TokenKind::RightBracket => "']'",
            TokenKind::LeftBrace => "'{'",
            TokenKind::RightBrace => "'}'",
            TokenKind::Less => "'<'",
            TokenKind::Greater => "'>'",
            TokenKind::Comma => "','",
            TokenKind::Colon => "':'",
            TokenKind::Equal => "'='",
            TokenKind::Arrow => "'->'",
            TokenKind::Eof => "end of input",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_strips_sigil() {
        let tok = Token::new(TokenKind::SymbolName, Span::dummy(), "@dot".to_string());
        assert_eq!(tok.name(), "dot");
        let tok = Token::new(TokenKind::Identifier, Span::dummy(), "add".to_string());
        assert_eq!(tok.name(), "add");
    }
}

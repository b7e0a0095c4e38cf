//! Error types for the pipeliner.
//!
//! This module defines all error types used throughout the crate,
//! organized by the phase that produces them.

use thiserror::Error;
use crate::utils::location::Span;
use std::fmt;

/// Top-level error type for the pipeliner.
#[derive(Error, Debug)]
pub enum PipelinerError {
    /// Error during lexing/tokenization
    #[error("Lexer error: {0}")]
    Lexer(#[from] LexerError),

    /// Error during parsing
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    /// Malformed IR
    #[error("Verification error: {0}")]
    Verify(#[from] VerifyError),

    /// Error during transformation
    #[error("Transformation error: {0}")]
    Transform(#[from] TransformError),

    /// Error while interpreting IR
    #[error("Execution error: {0}")]
    Exec(#[from] ExecError),

    /// Invalid target description or option
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error during lexical analysis.
#[derive(Error, Debug, Clone)]
pub struct LexerError {
    /// The error message
    pub message: String,
    /// Location in source
    pub span: Span,
    /// The kind of lexer error
    pub kind: LexerErrorKind,
}

impl fmt::Display for LexerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {}", self.message, self.span)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LexerErrorKind {
    /// Unexpected character
    UnexpectedChar,
    /// Invalid number literal
    InvalidNumber,
    /// Sigil (`%`, `@`, `^`) without a name
    MissingName,
    /// Unterminated block comment
    UnexpectedEof,
}

/// Error during parsing.
#[derive(Error, Debug, Clone)]
pub struct ParseError {
    /// The error message
    pub message: String,
    /// Location in source
    pub span: Span,
    /// The kind of parse error
    pub kind: ParseErrorKind,
    /// Expected tokens (if applicable)
    pub expected: Vec<String>,
    /// What was found
    pub found: Option<String>,
}

impl ParseError {
    pub fn new(kind: ParseErrorKind, message: impl Into<String>, span: Span) -> Self {
        Self {
            message: message.into(),
            span,
            kind,
            expected: Vec::new(),
            found: None,
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {}", self.message, self.span)?;
        if !self.expected.is_empty() {
            write!(f, " (expected: {})", self.expected.join(", "))?;
        }
        if let Some(ref found) = self.found {
            write!(f, " (found: {})", found)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseErrorKind {
    /// Unexpected token
    UnexpectedToken,
    /// Expected a specific token
    ExpectedToken,
    /// Expected a type
    ExpectedType,
    /// Unknown operation name or malformed attribute
    UnknownOperation,
    /// Use of a value that was never defined
    UndefinedValue,
    /// Value or function defined twice
    DuplicateDefinition,
    /// Unexpected end of file
    UnexpectedEof,
}

/// Structural problem found by the verifier.
#[derive(Error, Debug, Clone)]
pub struct VerifyError {
    /// The error message
    pub message: String,
    /// Function containing the problem
    pub function: String,
    /// The kind of verification error
    pub kind: VerifyErrorKind,
}

impl fmt::Display for VerifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} in @{}", self.message, self.function)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyErrorKind {
    /// Wrong number of operands, results or regions
    Arity,
    /// Operand or result types disagree
    TypeMismatch,
    /// Block missing its terminator or terminator in the wrong place
    Terminator,
    /// Operand not visible at its use
    Visibility,
    /// Call to a function that does not exist
    UnknownCallee,
}

/// Error during transformation.
#[derive(Error, Debug, Clone)]
pub struct TransformError {
    /// The error message
    pub message: String,
    /// The kind of transformation error
    pub kind: TransformErrorKind,
    /// The transformation that failed
    pub transform: String,
    /// The function being transformed, once known
    pub function: Option<String>,
}

impl TransformError {
    pub fn new(kind: TransformErrorKind, transform: &str, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind,
            transform: transform.to_string(),
            function: None,
        }
    }

    /// Attach the name of the function being transformed.
    pub fn in_function(mut self, name: &str) -> Self {
        self.function.get_or_insert_with(|| name.to_string());
        self
    }
}

impl fmt::Display for TransformError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} in {}", self.kind, self.message, self.transform)?;
        if let Some(ref function) = self.function {
            write!(f, " (function @{})", function)?;
        }
        Ok(())
    }
}

/// Why a function could not be pipelined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransformErrorKind {
    /// Loop is not a single counted loop with a straight-line body
    UnsupportedLoopShape,
    /// No width decomposition rule for an operation
    UnlegalizableOperation,
    /// Legalization still rewrote ops after the pass limit
    LegalizationDidNotConverge,
    /// No II up to the search limit yields a schedule
    SchedulingInfeasible,
    /// Induction step is not a positive constant
    UnsupportedInductionPattern,
}

impl fmt::Display for TransformErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransformErrorKind::UnsupportedLoopShape => "UnsupportedLoopShape",
            TransformErrorKind::UnlegalizableOperation => "UnlegalizableOperation",
            TransformErrorKind::LegalizationDidNotConverge => "LegalizationDidNotConverge",
            TransformErrorKind::SchedulingInfeasible => "SchedulingInfeasible",
            TransformErrorKind::UnsupportedInductionPattern => "UnsupportedInductionPattern",
        };
        f.write_str(name)
    }
}

/// Error raised by the interpreter.
#[derive(Error, Debug, Clone)]
pub struct ExecError {
    /// The error message
    pub message: String,
    /// The kind of execution error
    pub kind: ExecErrorKind,
}

impl ExecError {
    pub fn new(kind: ExecErrorKind, message: impl Into<String>) -> Self {
        Self { message: message.into(), kind }
    }
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecErrorKind {
    /// Called function does not exist
    UnknownFunction,
    /// Wrong number or kind of arguments
    BadArguments,
    /// Load or store outside a buffer
    OutOfBounds,
    /// Step budget exhausted
    FuelExhausted,
}

/// Result type using PipelinerError.
pub type PipelinerResult<T> = Result<T, PipelinerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ParseError {
            message: "Unexpected token".to_string(),
            span: Span::new(1, 5, 1, 10),
            kind: ParseErrorKind::UnexpectedToken,
            expected: vec!["identifier".to_string()],
            found: Some("number".to_string()),
        };
        let s = format!("{}", err);
        assert!(s.contains("Unexpected token"));
        assert!(s.contains("identifier"));
    }

    #[test]
    fn test_transform_error_display() {
        let err = TransformError::new(
            TransformErrorKind::SchedulingInfeasible,
            "modulo-schedule",
            "no II in 3..=5",
        )
        .in_function("dot_kernel")
        .in_function("ignored");
        let s = err.to_string();
        assert!(s.starts_with("SchedulingInfeasible"));
        assert!(s.contains("@dot_kernel"));
        assert!(!s.contains("ignored"));
    }
}

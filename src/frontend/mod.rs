//! Frontend: Lexer and Parser for the IR text format.
//!
//! ## Format Overview
//!
//! Every operation uses one generic form, so new operations never need
//! grammar changes:
//!
//! ```text
//! func @dot(%a: buffer<i32>, %b: buffer<i32>, %n: index) -> (i32) {
//!   %lb = const[0]() : index
//!   %st = const[1]() : index
//!   %z = const[0]() : i32
//!   %r = for[main](%lb, %n, %st, %z) : i32 {
//!     ^(%i: index, %acc: i32):
//!     %x = load(%a, %i) : i32
//!     %y = load(%b, %i) : i32
//!     %s = fma(%x, %y, %acc) : i32
//!     yield(%s)
//!   }
//!   return(%r)
//! }
//! ```

pub mod token;
pub mod lexer;
pub mod parser;

// Re-exports
pub use lexer::Lexer;
pub use parser::Parser;
pub use token::{Token, TokenKind};
pub use crate::utils::errors::ParseError;

use crate::ir::function::Module;
use crate::utils::errors::PipelinerResult;

/// Parse IR text into a module.
pub fn parse(source: &str) -> PipelinerResult<Module> {
    let lexer = Lexer::new(source);
    let mut parser = Parser::new(lexer)?;
    parser.parse_module()
}

//! Utility modules for the pipeliner.
//!
//! This module contains common utilities used throughout the codebase:
//! - Error types
//! - Source location tracking
//! - Indented text output

pub mod errors;
pub mod location;
pub mod pretty;

// Re-exports
pub use errors::*;
pub use location::{SourceLocation, Span};

//! Value types of the operation graph.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Integer element type of scalars, vectors and buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ElemType {
    I8,
    I16,
    I32,
    I64,
}

impl ElemType {
    /// Width in bits.
    pub fn bits(&self) -> u32 {
        match self {
            ElemType::I8 => 8,
            ElemType::I16 => 16,
            ElemType::I32 => 32,
            ElemType::I64 => 64,
        }
    }

    /// Parse `i8`, `i16`, `i32` or `i64`.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "i8" => Some(ElemType::I8),
            "i16" => Some(ElemType::I16),
            "i32" => Some(ElemType::I32),
            "i64" => Some(ElemType::I64),
            _ => None,
        }
    }

    /// Sign-extend the low `bits()` of `value`.
    pub fn wrap(&self, value: i64) -> i64 {
        match self {
            ElemType::I8 => value as i8 as i64,
            ElemType::I16 => value as i16 as i64,
            ElemType::I32 => value as i32 as i64,
            ElemType::I64 => value,
        }
    }

    /// Smallest representable value.
    pub fn min_value(&self) -> i64 {
        match self {
            ElemType::I8 => i8::MIN as i64,
            ElemType::I16 => i16::MIN as i64,
            ElemType::I32 => i32::MIN as i64,
            ElemType::I64 => i64::MIN,
        }
    }

    /// Largest representable value.
    pub fn max_value(&self) -> i64 {
        match self {
            ElemType::I8 => i8::MAX as i64,
            ElemType::I16 => i16::MAX as i64,
            ElemType::I32 => i32::MAX as i64,
            ElemType::I64 => i64::MAX,
        }
    }
}

impl fmt::Display for ElemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "i{}", self.bits())
    }
}

/// Type of an SSA value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Type {
    /// Loop counters, bounds and memory offsets
    Index,
    /// Comparison results
    Bool,
    /// Single integer
    Scalar(ElemType),
    /// Fixed number of integer lanes
    Vector { lanes: u32, elem: ElemType },
    /// Handle to a mutable array of elements
    Buffer(ElemType),
}

impl Type {
    pub fn vector(lanes: u32, elem: ElemType) -> Self {
        Type::Vector { lanes, elem }
    }

    pub fn is_vector(&self) -> bool {
        matches!(self, Type::Vector { .. })
    }

    /// Number of lanes (1 for non-vector values).
    pub fn lanes(&self) -> u32 {
        match self {
            Type::Vector { lanes, .. } => *lanes,
            _ => 1,
        }
    }

    /// Element type of scalars, vectors and buffers.
    pub fn elem(&self) -> Option<ElemType> {
        match self {
            Type::Scalar(e) | Type::Buffer(e) => Some(*e),
            Type::Vector { elem, .. } => Some(*elem),
            Type::Index | Type::Bool => None,
        }
    }

    /// Total width in bits of a vector value.
    pub fn vector_bits(&self) -> Option<u32> {
        match self {
            Type::Vector { lanes, elem } => Some(lanes * elem.bits()),
            _ => None,
        }
    }

    /// Same element type with a different lane count.
    pub fn with_lanes(&self, lanes: u32) -> Type {
        match self {
            Type::Vector { elem, .. } | Type::Scalar(elem) => Type::Vector { lanes, elem: *elem },
            other => *other,
        }
    }

    /// Type of a single lane.
    pub fn scalar(&self) -> Type {
        match self {
            Type::Vector { elem, .. } => Type::Scalar(*elem),
            other => *other,
        }
    }

    /// Whether arithmetic is defined on values of this type.
    pub fn is_arith(&self) -> bool {
        matches!(self, Type::Index | Type::Scalar(_) | Type::Vector { .. })
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Index => write!(f, "index"),
            Type::Bool => write!(f, "i1"),
            Type::Scalar(e) => write!(f, "{}", e),
            Type::Vector { lanes, elem } => write!(f, "vector<{}x{}>", lanes, elem),
            Type::Buffer(e) => write!(f, "buffer<{}>", e),
        }
    }
}

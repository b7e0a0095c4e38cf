//! Target machine description.
//!
//! Everything the legalizer and the modulo scheduler know about the
//! machine: native vector width, functional units and per-op timing.
//!
//! | Class     | Units | Ops                                   |
//! |-----------|-------|---------------------------------------|
//! | `alu`     | 2     | add, sub, min, max, logic, cmp, copy  |
//! | `mul`     | 1     | mul (3), fma (4), div (8, occupies 2) |
//! | `mem`     | 1     | load (3), store (1)                   |
//! | `shuffle` | 1     | broadcast, slice, concat, reduce (2)  |
//! | `branch`  | 1     | call (2)                              |
//!
//! Latencies in parentheses; unlisted ops take one cycle.

use crate::ir::ops::OpKind;
use crate::ir::types::ElemType;
use crate::utils::errors::{PipelinerError, PipelinerResult};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Functional-unit class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceClass {
    Alu,
    Mul,
    Mem,
    Shuffle,
    Branch,
}

impl ResourceClass {
    pub const ALL: [ResourceClass; 5] = [
        ResourceClass::Alu,
        ResourceClass::Mul,
        ResourceClass::Mem,
        ResourceClass::Shuffle,
        ResourceClass::Branch,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ResourceClass::Alu => "alu",
            ResourceClass::Mul => "mul",
            ResourceClass::Mem => "mem",
            ResourceClass::Shuffle => "shuffle",
            ResourceClass::Branch => "branch",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.name() == name)
    }
}

/// Timing of one operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpTiming {
    /// Unit class the op issues to
    pub class: ResourceClass,
    /// Cycles until the result is available
    pub latency: u32,
    /// Cycles the unit stays busy
    pub occupancy: u32,
}

impl OpTiming {
    pub const fn simple(class: ResourceClass, latency: u32) -> Self {
        Self { class, latency, occupancy: 1 }
    }
}

impl Default for OpTiming {
    fn default() -> Self {
        Self::simple(ResourceClass::Alu, 1)
    }
}

static DEFAULT_TARGET: Lazy<TargetConfig> = Lazy::new(|| {
    use ResourceClass::*;
    let mut timings = BTreeMap::new();
    for op in ["add", "sub", "min", "max", "and", "or", "xor", "cmp", "copy", "const"] {
        timings.insert(op.to_string(), OpTiming::simple(Alu, 1));
    }
    timings.insert("mul".to_string(), OpTiming::simple(Mul, 3));
    timings.insert("fma".to_string(), OpTiming::simple(Mul, 4));
    timings.insert("div".to_string(), OpTiming { class: Mul, latency: 8, occupancy: 2 });
    timings.insert("load".to_string(), OpTiming::simple(Mem, 3));
    timings.insert("store".to_string(), OpTiming::simple(Mem, 1));
    for op in ["broadcast", "slice", "concat"] {
        timings.insert(op.to_string(), OpTiming::simple(Shuffle, 1));
    }
    timings.insert("reduce".to_string(), OpTiming::simple(Shuffle, 2));
    timings.insert("call".to_string(), OpTiming::simple(Branch, 2));

    let capacities = [(Alu, 2), (Mul, 1), (Mem, 1), (Shuffle, 1), (Branch, 1)]
        .into_iter()
        .collect();

    TargetConfig {
        native_vector_bits: 128,
        capacities,
        timings,
        max_ii_offset: 64,
        max_legalize_iterations: 8,
    }
});

/// Machine model and search limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    /// Width of a native vector register
    pub native_vector_bits: u32,
    /// Units per class
    pub capacities: BTreeMap<ResourceClass, u32>,
    /// Timing per op mnemonic
    pub timings: BTreeMap<String, OpTiming>,
    /// `K`: the scheduler tries II up to `II0 + K`
    pub max_ii_offset: u32,
    /// Legalization passes allowed before giving up
    pub max_legalize_iterations: u32,
}

impl Default for TargetConfig {
    fn default() -> Self {
        DEFAULT_TARGET.clone()
    }
}

impl TargetConfig {
    /// Parse a JSON description; missing fields keep their defaults.
    pub fn from_json(text: &str) -> PipelinerResult<Self> {
        let config: TargetConfig = serde_json::from_str(text)
            .map_err(|e| PipelinerError::Config(format!("invalid target description: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON description from disk.
    pub fn load(path: &Path) -> PipelinerResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    /// Reject descriptions no schedule could satisfy.
    pub fn validate(&self) -> PipelinerResult<()> {
        if self.native_vector_bits == 0 || !self.native_vector_bits.is_power_of_two() {
            return Err(PipelinerError::Config(format!(
                "native vector width must be a power of two, got {}",
                self.native_vector_bits
            )));
        }
        if let Some((class, _)) = self.capacities.iter().find(|(_, n)| **n == 0) {
            return Err(PipelinerError::Config(format!("class {} has no units", class.name())));
        }
        if let Some((op, _)) = self.timings.iter().find(|(_, t)| t.occupancy == 0) {
            return Err(PipelinerError::Config(format!("op {} occupies its unit for zero cycles", op)));
        }
        if self.max_legalize_iterations == 0 {
            return Err(PipelinerError::Config("at least one legalization pass is required".to_string()));
        }
        Ok(())
    }

    /// Timing of an op, by mnemonic.
    pub fn timing(&self, kind: &OpKind) -> OpTiming {
        self.timings.get(kind.mnemonic()).copied().unwrap_or_default()
    }

    /// Latency used on dependency edges; never below one cycle.
    pub fn latency(&self, kind: &OpKind) -> u32 {
        self.timing(kind).latency.max(1)
    }

    /// Units of a class; unlisted classes have one.
    pub fn capacity(&self, class: ResourceClass) -> u32 {
        self.capacities.get(&class).copied().unwrap_or(1)
    }

    /// Lanes of `elem` in one native vector.
    pub fn native_lanes(&self, elem: ElemType) -> u32 {
        self.native_vector_bits / elem.bits()
    }

    pub fn set_latency(&mut self, op: &str, latency: u32) {
        self.timings.entry(op.to_string()).or_default().latency = latency;
    }

    pub fn set_capacity(&mut self, class: ResourceClass, units: u32) {
        self.capacities.insert(class, units);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::ops::BinOp;

    #[test]
    fn test_defaults() {
        let target = TargetConfig::default();
        assert_eq!(target.native_lanes(ElemType::I32), 4);
        assert_eq!(target.latency(&OpKind::Load), 3);
        assert_eq!(target.timing(&OpKind::Binary(BinOp::Mul)).class, ResourceClass::Mul);
        assert_eq!(target.capacity(ResourceClass::Alu), 2);
        target.validate().unwrap();
    }

    #[test]
    fn test_zero_latency_is_clamped() {
        let mut target = TargetConfig::default();
        target.set_latency("add", 0);
        assert_eq!(target.latency(&OpKind::Binary(BinOp::Add)), 1);
    }

    #[test]
    fn test_partial_json() {
        let target = TargetConfig::from_json(
            r#"{ "native_vector_bits": 256, "capacities": { "mul": 2 } }"#,
        )
        .unwrap();
        assert_eq!(target.native_vector_bits, 256);
        assert_eq!(target.capacity(ResourceClass::Mul), 2);
        // replaced map: other classes fall back to one unit
        assert_eq!(target.capacity(ResourceClass::Alu), 1);
        assert_eq!(target.max_ii_offset, 64);
    }

    #[test]
    fn test_json_roundtrip_and_validation() {
        let target = TargetConfig::default();
        assert_eq!(TargetConfig::from_json(&target.to_json()).unwrap(), target);
        assert!(TargetConfig::from_json(r#"{ "native_vector_bits": 96 }"#).is_err());
        assert!(TargetConfig::from_json(r#"{ "capacities": { "alu": 0 } }"#).is_err());
    }
}

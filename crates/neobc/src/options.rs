//! Compiler configuration.

use serde::{Deserialize, Serialize};

/// How aggressively generated code is simplified.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
pub enum OptimizationLevel {
    /// Emit exactly what the visitor asks for.
    None,
    /// Remove unreachable code.
    Minimal,
    /// Also inline write-once literal globals.
    #[default]
    Default,
    Aggressive,
}

/// Options for one compilation session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompilerOptions {
    pub optimization_level: OptimizationLevel,
    /// Switch narrow jumps whose offset overflows `i8` to their wide form before serialization.
    pub widen_jumps: bool,
    /// Prepended to the storage key of storage-backed globals.
    pub storage_prefix: Vec<u8>,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        Self {
            optimization_level: OptimizationLevel::Default,
            widen_jumps: true,
            storage_prefix: Vec::new(),
        }
    }
}

impl CompilerOptions {
    #[must_use]
    pub fn with_optimization_level(mut self, level: OptimizationLevel) -> Self {
        self.optimization_level = level;
        self
    }

    #[must_use]
    pub fn with_storage_prefix(mut self, prefix: impl Into<Vec<u8>>) -> Self {
        self.storage_prefix = prefix.into();
        self
    }

    #[must_use]
    pub fn with_widen_jumps(mut self, widen: bool) -> Self {
        self.widen_jumps = widen;
        self
    }

    pub(crate) fn inlines_globals(&self) -> bool {
        self.optimization_level >= OptimizationLevel::Default
    }

    pub(crate) fn removes_dead_code(&self) -> bool {
        self.optimization_level >= OptimizationLevel::Minimal
    }
}

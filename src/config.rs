//! Engine configuration
//!
//! Every tiering, inlining and cache threshold lives here so embedders and the
//! CLI can tune them from a JSON file. Each section carries `#[serde(default)]`,
//! so a partial file only overrides what it names.
//!
//! ```
//! use quicksilver_tier::config::EngineConfig;
//!
//! let config = EngineConfig::from_json_str(r#"{ "inlining": { "max_inline_depth": 3 } }"#).unwrap();
//! assert_eq!(config.inlining.max_inline_depth, 3);
//! assert_eq!(config.ic.polymorphic_limit, 4);
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Thresholds driving promotion between tiers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TieringConfig {
    /// Calls before an interpreted function is queued for JIT compilation
    pub hot_call_threshold: u64,
    /// Additional calls in JIT code before recompiling at the AOT tier
    pub aot_call_threshold: u64,
    /// Bytecode length up to which a function is "small"
    pub small_function_size: usize,
    /// Bytecode length up to which a function is "medium"
    pub medium_function_size: usize,
    /// Bytecode length up to which a function is "large"; beyond it is never promoted organically
    pub large_function_size: usize,
    /// Deoptimizations after which a function stays interpreted
    pub max_deopts: u32,
    /// Compile on a background worker thread instead of the calling thread
    pub background_compilation: bool,
    /// Largest optimized unit the compiler will emit, in operations
    pub max_unit_size: usize,
}

impl Default for TieringConfig {
    fn default() -> Self {
        Self {
            hot_call_threshold: 100,
            aot_call_threshold: 1000,
            small_function_size: 32,
            medium_function_size: 128,
            large_function_size: 512,
            max_deopts: 5,
            background_compilation: true,
            max_unit_size: 16 * 1024,
        }
    }
}

/// Heuristics for the speculative inliner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InliningConfig {
    /// Callees with at most this many instructions are always eligible
    pub max_inline_size: usize,
    /// Callees with more instructions than this are never inlined
    pub hard_inline_size: usize,
    /// Callsite count at which callees between the two size limits become eligible
    pub hot_callsite_count: u64,
    /// Minimum executions of a callsite before it is considered
    pub min_callsite_count: u64,
    /// Minimum executions of a callsite relative to the caller's call count
    pub min_callsite_ratio: f64,
    /// Deepest inline nesting below the compiled function
    pub max_inline_depth: usize,
    /// Cap on the total inlined instructions per unit
    pub max_total_inline_size: usize,
    /// Extra inlining budget granted to AOT-tier compiles
    pub aot_inline_bonus: usize,
}

impl Default for InliningConfig {
    fn default() -> Self {
        Self {
            max_inline_size: 45,
            hard_inline_size: 120,
            hot_callsite_count: 50,
            min_callsite_count: 2,
            min_callsite_ratio: 0.05,
            max_inline_depth: 8,
            max_total_inline_size: 600,
            aot_inline_bonus: 200,
        }
    }
}

/// Inline cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IcConfig {
    /// Entries a slot holds before going megamorphic
    pub polymorphic_limit: usize,
}

impl Default for IcConfig {
    fn default() -> Self {
        Self { polymorphic_limit: 4 }
    }
}

/// Execution limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Maximum logical call depth, inlined frames included
    pub max_call_depth: usize,
    /// Maximum nesting of native-to-script re-entry (accessors, callbacks)
    pub max_native_reentry: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_call_depth: 1024,
            max_native_reentry: 64,
        }
    }
}

/// Garbage collector configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    /// Allocations between automatic collections at top-level boundaries
    pub allocation_threshold: usize,
    /// Whether to collect automatically at all
    pub auto_collect: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            allocation_threshold: 10_000,
            auto_collect: true,
        }
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub tiering: TieringConfig,
    pub inlining: InliningConfig,
    pub ic: IcConfig,
    pub runtime: RuntimeConfig,
    pub gc: GcConfig,
}

impl EngineConfig {
    /// Create the default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and validate a JSON configuration
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: EngineConfig =
            serde_json::from_str(text).map_err(|e| Error::ConfigError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Serialize as pretty JSON
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::ConfigError(e.to_string()))
    }

    /// Set the JIT promotion threshold
    pub fn with_hot_call_threshold(mut self, calls: u64) -> Self {
        self.tiering.hot_call_threshold = calls;
        self
    }

    /// Set the deoptimization cap
    pub fn with_max_deopts(mut self, deopts: u32) -> Self {
        self.tiering.max_deopts = deopts;
        self
    }

    /// Compile on the calling thread
    pub fn with_synchronous_compilation(mut self) -> Self {
        self.tiering.background_compilation = false;
        self
    }

    /// Set the maximum inline depth
    pub fn with_max_inline_depth(mut self, depth: usize) -> Self {
        self.inlining.max_inline_depth = depth;
        self
    }

    /// Set the minimum callsite count for inlining
    pub fn with_min_callsite_count(mut self, count: u64) -> Self {
        self.inlining.min_callsite_count = count;
        self
    }

    /// Set the polymorphic inline cache limit
    pub fn with_polymorphic_limit(mut self, limit: usize) -> Self {
        self.ic.polymorphic_limit = limit;
        self
    }

    /// Set the maximum logical call depth
    pub fn with_max_call_depth(mut self, depth: usize) -> Self {
        self.runtime.max_call_depth = depth;
        self
    }

    /// Reject inconsistent thresholds
    pub fn validate(&self) -> Result<()> {
        let t = &self.tiering;
        let i = &self.inlining;
        if t.hot_call_threshold == 0 {
            return Err(Error::ConfigError("hot_call_threshold must be positive".into()));
        }
        if !(t.small_function_size <= t.medium_function_size
            && t.medium_function_size <= t.large_function_size)
        {
            return Err(Error::ConfigError(
                "function size classes must be non-decreasing".into(),
            ));
        }
        if i.max_inline_size > i.hard_inline_size {
            return Err(Error::ConfigError(format!(
                "max_inline_size ({}) exceeds hard_inline_size ({})",
                i.max_inline_size, i.hard_inline_size
            )));
        }
        if !(0.0..=1.0).contains(&i.min_callsite_ratio) {
            return Err(Error::ConfigError("min_callsite_ratio must be within [0, 1]".into()));
        }
        if self.ic.polymorphic_limit == 0 {
            return Err(Error::ConfigError("polymorphic_limit must be at least 1".into()));
        }
        if self.runtime.max_call_depth == 0 {
            return Err(Error::ConfigError("max_call_depth must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.inlining.max_inline_size, 45);
        assert_eq!(config.ic.polymorphic_limit, 4);
        assert_eq!(config.tiering.max_deopts, 5);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config =
            EngineConfig::from_json_str(r#"{ "tiering": { "hot_call_threshold": 7 } }"#).unwrap();
        assert_eq!(config.tiering.hot_call_threshold, 7);
        assert_eq!(config.tiering.aot_call_threshold, 1000);
        assert_eq!(config.inlining, InliningConfig::default());
    }

    #[test]
    fn test_validate_rejects_inverted_inline_sizes() {
        let text = r#"{ "inlining": { "max_inline_size": 200, "hard_inline_size": 100 } }"#;
        let err = EngineConfig::from_json_str(text).unwrap_err();
        assert!(matches!(err, Error::ConfigError(_)));
    }

    #[test]
    fn test_validate_rejects_zero_polymorphic_limit() {
        let config = EngineConfig::default().with_polymorphic_limit(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file_round_trip() {
        let config = EngineConfig::default()
            .with_max_inline_depth(3)
            .with_synchronous_compilation();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(config.to_json().unwrap().as_bytes()).unwrap();
        let loaded = EngineConfig::from_file(file.path()).unwrap();
        assert_eq!(loaded, config);
    }
}

//! Tiered compilation with speculative inlining
//!
//! Interpreted execution feeds the inline caches and the feedback store.
//! The tier controller promotes hot functions and hands compile requests to a
//! background worker, which plans inlining from a feedback snapshot and lowers
//! bytecode into a guarded [`CompiledUnit`]. Guards that fail at run time, and
//! mutations of objects a unit depends on, send execution back to the
//! interpreter through the deoptimization manager.
//!
//! | Module        | Role                                               |
//! |---------------|----------------------------------------------------|
//! | `ic`          | per-site inline caches                             |
//! | `feedback`    | histograms and per-function profiles               |
//! | `tier`        | tier state machine, thresholds, dispatch slots     |
//! | `queue`       | deduplicating request queue and compile tickets    |
//! | `worker`      | background compiler thread                         |
//! | `call_graph`  | call graph arena and recursion detection           |
//! | `inliner`     | per-site inlining decisions                        |
//! | `compiler`    | bytecode + plan → optimized operations             |
//! | `unit`        | compiled unit layout                               |
//! | `deopt`       | guard checks, invalidation, frame reconstruction   |
//! | `diagnostics` | compilation summary and per-function reports       |

pub mod call_graph;
pub mod compiler;
pub mod deopt;
pub mod diagnostics;
pub mod feedback;
pub mod ic;
pub mod inliner;
pub mod queue;
pub mod tier;
pub mod unit;
pub mod worker;

pub use call_graph::CallGraph;
pub use compiler::compile;
pub use deopt::{DeoptEvent, DeoptManager, DeoptReason};
pub use diagnostics::{CompilationSummary, FunctionReport};
pub use feedback::{FeedbackKey, FeedbackStore, ProfileRecord, SiteId, SiteSnapshot};
pub use ic::{CallTarget, Handler, HeapVersions, IcKey, IcState, IcStateKind, InlineCache};
pub use inliner::{InlineDecision, InlinePlan, InlineRecord, Inliner, RejectReason};
pub use queue::{CompileTicket, WorkQueue};
pub use tier::{PinReason, SizeClass, Tier, TierController, TierRecord, TierState};
pub use unit::{CompiledUnit, UnitId};
pub use worker::{CompileContext, CompileOutcome, CompileRequest, CompileWorker};

use crate::runtime::Value;

/// Type feedback collected during interpretation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum ObservedType {
    Undefined,
    Null,
    Boolean,
    Int32,
    Float64,
    String,
    Object,
    Mixed,
}

impl ObservedType {
    /// Classify a value
    pub fn of(value: &Value) -> ObservedType {
        match value {
            Value::Undefined => ObservedType::Undefined,
            Value::Null => ObservedType::Null,
            Value::Boolean(_) => ObservedType::Boolean,
            Value::Number(n) => {
                let in_range = *n >= i32::MIN as f64 && *n <= i32::MAX as f64;
                let negative_zero = *n == 0.0 && n.is_sign_negative();
                if n.fract() == 0.0 && in_range && !negative_zero {
                    ObservedType::Int32
                } else {
                    ObservedType::Float64
                }
            }
            Value::String(_) => ObservedType::String,
            Value::Object(_) => ObservedType::Object,
        }
    }

    /// Merge two observed types (becomes Mixed if different)
    pub fn merge(self, other: ObservedType) -> ObservedType {
        if self == other {
            self
        } else {
            ObservedType::Mixed
        }
    }

    /// Check if this type is a number type
    pub fn is_numeric(&self) -> bool {
        matches!(self, ObservedType::Int32 | ObservedType::Float64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observed_type_merge() {
        assert_eq!(ObservedType::Int32.merge(ObservedType::Int32), ObservedType::Int32);
        assert_eq!(ObservedType::Int32.merge(ObservedType::Float64), ObservedType::Mixed);
        assert_eq!(ObservedType::String.merge(ObservedType::String), ObservedType::String);
    }

    #[test]
    fn test_observed_type_of_numbers() {
        assert_eq!(ObservedType::of(&Value::Number(3.0)), ObservedType::Int32);
        assert_eq!(ObservedType::of(&Value::Number(0.5)), ObservedType::Float64);
        assert_eq!(ObservedType::of(&Value::Number(-0.0)), ObservedType::Float64);
        assert!(ObservedType::of(&Value::Number(f64::NAN)).is_numeric());
        assert_eq!(ObservedType::of(&Value::string("a")), ObservedType::String);
    }
}

//! Prelude module for convenient imports
//!
//! ```
//! use quicksilver_tier::prelude::*;
//!
//! let mut builder = ProgramBuilder::new();
//! builder.function("main", 0, |f| {
//!     f.number(1.0).ret();
//! });
//! let mut engine = Engine::new(builder.build().unwrap()).unwrap();
//! assert_eq!(engine.run_main().unwrap(), Value::Number(1.0));
//! ```

// Engine and values
pub use crate::runtime::{Engine, ObjectId, Value};

// Error handling
pub use crate::error::{Error, ErrorKind, Result, StackFrame, StackTrace};

// Program assembly
pub use crate::bytecode::{FunctionId, Program, ProgramBuilder};

// Configuration
pub use crate::config::EngineConfig;

// Tiering diagnostics
pub use crate::jit::{CompilationSummary, DeoptReason, FunctionReport, Tier, TierState};

pub use crate::VERSION;

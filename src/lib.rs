//! Quicksilver Tier: tiered execution with speculative inlining
//!
//! Programs are assembled as register-free stack bytecode and start out
//! interpreted. Interpretation fills polymorphic inline caches and
//! per-function profiles; hot functions are compiled on a background thread
//! into guarded optimized code with their small, monomorphic callees inlined.
//! When a guard fails, or an object the compiled code relied on changes,
//! execution falls back to the interpreter with every inlined frame rebuilt.
//!
//! # Quick Start
//!
//! ```
//! use quicksilver_tier::bytecode::ProgramBuilder;
//! use quicksilver_tier::{Engine, EngineConfig, Value};
//!
//! fn main() -> quicksilver_tier::Result<()> {
//!     let mut builder = ProgramBuilder::new();
//!     builder.function("inc", 1, |f| {
//!         f.local(0).number(1.0).add().ret();
//!     });
//!     builder.function("main", 0, |f| {
//!         f.global("inc").number(41.0).call(1).ret();
//!     });
//!     let mut engine = Engine::with_config(builder.build()?, EngineConfig::default())?;
//!     engine.jit_compile_async("main")?;
//!     engine.wait_jit_compile_finish("main")?;
//!     assert_eq!(engine.run_main()?, Value::Number(42.0));
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! | Category | Modules |
//! |----------|---------|
//! | **Core** | [`bytecode`], [`runtime`], [`error`](Error), [`config`] |
//! | **Tiering** | [`jit`] |
//! | **Tooling** | [`scenarios`], [`prelude`] |
#![allow(clippy::too_many_arguments)]
#![allow(clippy::new_without_default)]
#![allow(clippy::enum_variant_names)]

pub mod bytecode;
pub mod config;
pub mod jit;
pub mod prelude;
pub mod runtime;
pub mod scenarios;

mod error;

pub use config::EngineConfig;
pub use error::{messages, Error, ErrorKind, Result, StackFrame, StackTrace};
pub use runtime::{Engine, Value};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

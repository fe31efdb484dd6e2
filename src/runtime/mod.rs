//! Runtime environment
//!
//! This module provides the execution environment: values, the shaped object
//! heap and its collector, the VM that runs interpreted and compiled frames,
//! and the built-in globals. [`Engine`] is the embedding entry point.

mod builtins;
pub mod gc;
pub mod heap;
pub mod intern;
pub mod shape;
mod value;
pub mod vm;

pub use value::{number_to_string, ObjectId, PrimitiveTag, Value};
pub use vm::{NativeFn, PropertyDescriptor, Vm};

use std::sync::Arc;

use crate::bytecode::{FunctionId, Program};
use crate::config::EngineConfig;
use crate::error::{messages, Error, Result};
use crate::jit::{
    CompilationSummary, DeoptEvent, FunctionReport, IcStateKind, InlinePlan, SiteId, Tier, TierState,
};
use gc::GcStats;

/// A loaded program together with its VM
///
/// ```
/// use quicksilver_tier::bytecode::ProgramBuilder;
/// use quicksilver_tier::{Engine, EngineConfig, Value};
///
/// let mut builder = ProgramBuilder::new();
/// builder.function("add", 2, |f| {
///     f.local(0).local(1).add().ret();
/// });
/// let config = EngineConfig::default().with_synchronous_compilation();
/// let mut engine = Engine::with_config(builder.build().unwrap(), config).unwrap();
/// let sum = engine.call("add", vec![Value::Number(2.0), Value::Number(3.0)]).unwrap();
/// assert_eq!(sum, Value::Number(5.0));
/// ```
#[derive(Debug)]
pub struct Engine {
    vm: Vm,
}

impl Engine {
    /// Load a program with the default configuration
    pub fn new(program: Program) -> Result<Self> {
        Self::with_config(program, EngineConfig::default())
    }

    pub fn with_config(program: Program, config: EngineConfig) -> Result<Self> {
        let vm = Vm::new(Arc::new(program), config)?;
        Ok(Self { vm })
    }

    pub fn vm(&self) -> &Vm {
        &self.vm
    }

    pub fn vm_mut(&mut self) -> &mut Vm {
        &mut self.vm
    }

    /// Call a global function by name
    pub fn call(&mut self, name: &str, args: Vec<Value>) -> Result<Value> {
        let callee = self
            .vm
            .global(name)
            .ok_or_else(|| Error::reference_error(messages::not_defined(name)))?;
        self.vm.call_top_level(&callee, args)
    }

    pub fn call_function(&mut self, function: FunctionId, args: Vec<Value>) -> Result<Value> {
        let callee = Value::Object(self.vm.function_object(function));
        self.vm.call_top_level(&callee, args)
    }

    /// Run the program's `main` function
    pub fn run_main(&mut self) -> Result<Value> {
        self.call("main", Vec::new())
    }

    /// Lines written by `print`
    pub fn output(&self) -> &[String] {
        self.vm.output()
    }

    pub fn take_output(&mut self) -> Vec<String> {
        self.vm.take_output()
    }

    pub fn global(&self, name: &str) -> Option<Value> {
        self.vm.global(name)
    }

    /// String form of a value, as `print` renders it
    pub fn display(&self, value: &Value) -> String {
        self.vm.display(value)
    }

    pub fn function_id(&self, name: &str) -> Result<FunctionId> {
        self.vm
            .program()
            .lookup(name)
            .ok_or_else(|| Error::reference_error(messages::not_defined(name)))
    }

    // ---- tiering ----

    /// Queue `name` for compilation without waiting; false if it is pinned
    pub fn jit_compile_async(&mut self, name: &str) -> Result<bool> {
        let function = self.function_id(name)?;
        Ok(self.vm.request_compile(function, Tier::Jit))
    }

    /// Block until the pending compile of `name` finishes; true if it is compiled
    pub fn wait_jit_compile_finish(&mut self, name: &str) -> Result<bool> {
        let function = self.function_id(name)?;
        Ok(self.vm.wait_for_compile(function))
    }

    pub fn tier_state(&self, name: &str) -> Result<TierState> {
        Ok(self.vm.tiers().state(self.function_id(name)?))
    }

    pub fn deopt_count(&self, name: &str) -> Result<u32> {
        Ok(self.vm.tiers().deopt_count(self.function_id(name)?))
    }

    /// Cached entries across every inline cache of `name`
    pub fn ic_population(&self, name: &str) -> Result<usize> {
        Ok(self.vm.feedback().ic_population(self.function_id(name)?))
    }

    /// IC state of each access and call site of `name`, in site order
    pub fn site_states(&self, name: &str) -> Result<Vec<IcStateKind>> {
        let function = self.function_id(name)?;
        let feedback = self.vm.feedback();
        Ok(feedback.sites_of(function).map(|site| feedback.ic_state(site)).collect())
    }

    pub fn site_histogram(&self, site: SiteId) -> Vec<(crate::jit::FeedbackKey, u64)> {
        self.vm.feedback().histogram(site)
    }

    /// Inlining plan of the unit installed for `name`, if any
    pub fn inline_plan(&self, name: &str) -> Result<Option<InlinePlan>> {
        let function = self.function_id(name)?;
        Ok(self.vm.tiers().unit(function).map(|unit| unit.plan.clone()))
    }

    pub fn function_report(&self, name: &str) -> Result<FunctionReport> {
        let function = self.function_id(name)?;
        Ok(FunctionReport::collect(
            self.vm.program(),
            self.vm.feedback(),
            self.vm.tiers(),
            self.vm.deopt(),
            function,
        ))
    }

    pub fn compilation_summary(&self) -> CompilationSummary {
        CompilationSummary::collect(self.vm.feedback(), self.vm.tiers(), self.vm.deopt())
    }

    pub fn deopt_history(&self) -> &[DeoptEvent] {
        self.vm.deopt().history()
    }

    // ---- garbage collection ----

    /// Full collection followed by any finalization callbacks it scheduled
    pub fn force_full_gc(&mut self) {
        self.vm.collect_garbage();
        self.vm.run_finalizers();
    }

    /// Empty-shape roots the shape table still tracks, one per prototype
    pub fn shape_roots(&self) -> usize {
        self.vm.shapes().root_count()
    }

    pub fn gc_stats(&self) -> &GcStats {
        self.vm.gc_stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::ProgramBuilder;

    fn engine(build: impl FnOnce(&mut ProgramBuilder)) -> Engine {
        let mut builder = ProgramBuilder::new();
        build(&mut builder);
        let config = EngineConfig::default().with_synchronous_compilation();
        Engine::with_config(builder.build().unwrap(), config).unwrap()
    }

    #[test]
    fn test_engine_call() {
        let mut engine = engine(|b| {
            b.function("square", 1, |f| {
                f.local(0).local(0).mul().ret();
            });
        });
        let result = engine.call("square", vec![Value::Number(7.0)]).unwrap();
        assert_eq!(result, Value::Number(49.0));
    }

    #[test]
    fn test_engine_unknown_function() {
        let mut engine = engine(|b| {
            b.function("main", 0, |f| {
                f.ret_undefined();
            });
        });
        let error = engine.call("missing", vec![]).unwrap_err();
        assert_eq!(error.to_string(), "ReferenceError: missing is not defined");
    }

    #[test]
    fn test_engine_compiles_on_request() {
        let mut engine = engine(|b| {
            b.function("main", 0, |f| {
                f.number(1.0).ret();
            });
        });
        assert_eq!(engine.tier_state("main").unwrap(), TierState::Interpreted);
        assert!(engine.jit_compile_async("main").unwrap());
        assert!(engine.wait_jit_compile_finish("main").unwrap());
        assert_eq!(engine.tier_state("main").unwrap(), TierState::Compiled(Tier::Jit));
        assert_eq!(engine.run_main().unwrap(), Value::Number(1.0));
    }
}

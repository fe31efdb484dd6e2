//! Canned scenarios
//!
//! Each scenario runs one program twice: once purely interpreted, and once
//! with its hot functions compiled after a warmup. The two runs must agree on
//! every returned value and every printed line.
//!
//! ```
//! use quicksilver_tier::config::EngineConfig;
//! use quicksilver_tier::scenarios;
//!
//! let scenario = scenarios::find("inline-chain").unwrap();
//! let report = scenario.run(&EngineConfig::default().with_synchronous_compilation()).unwrap();
//! assert!(report.transparent);
//! ```

mod programs;

use std::fmt;

use serde::Serialize;

use crate::bytecode::{Program, ProgramBuilder};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::jit::{CompilationSummary, FunctionReport};
use crate::runtime::Engine;

/// A named program and the way it is exercised
#[derive(Clone, Copy)]
pub struct Scenario {
    pub name: &'static str,
    pub description: &'static str,
    build: fn(&mut ProgramBuilder),
    /// Run once on each engine before anything else, if present
    pub setup: Option<&'static str>,
    /// Calls to `main` that collect feedback before compiling
    pub warmup: usize,
    /// Functions compiled between the warmup and the measured call
    pub compile: &'static [&'static str],
    configure: fn(EngineConfig) -> EngineConfig,
}

impl fmt::Debug for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scenario")
            .field("name", &self.name)
            .field("setup", &self.setup)
            .field("warmup", &self.warmup)
            .field("compile", &self.compile)
            .finish_non_exhaustive()
    }
}

/// Observable behavior of one run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunOutcome {
    /// Display form of each `main` result, or of the error it raised
    pub results: Vec<String>,
    pub output: Vec<String>,
}

/// Both runs of a scenario and the optimized engine's diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub name: String,
    pub interpreted: RunOutcome,
    pub optimized: RunOutcome,
    pub transparent: bool,
    pub functions: Vec<FunctionReport>,
    pub summary: CompilationSummary,
}

fn unchanged(config: EngineConfig) -> EngineConfig {
    config
}

fn real_calls_only(config: EngineConfig) -> EngineConfig {
    config.with_max_inline_depth(0)
}

fn shallow_stack(config: EngineConfig) -> EngineConfig {
    config.with_max_call_depth(256)
}

const SCENARIOS: &[Scenario] = &[
    Scenario {
        name: "inline-chain",
        description: "InlineFoo1..10 call chain summed by BasicInlineCountTest",
        build: programs::inline_chain,
        setup: None,
        warmup: 3,
        compile: &["BasicInlineCountTest"],
        configure: unchanged,
    },
    Scenario {
        name: "inline-boundary",
        description: "callees of 45 and 46 instructions around the inline size limit",
        build: programs::inline_boundary,
        setup: None,
        warmup: 3,
        compile: &["BoundaryTest"],
        configure: unchanged,
    },
    Scenario {
        name: "lazy-deopt",
        description: "prototype mutation under two stack-nested compiled frames",
        build: programs::lazy_deopt,
        setup: Some("Init"),
        warmup: 3,
        compile: &["Test2", "ChangePrototypeValue"],
        configure: real_calls_only,
    },
    Scenario {
        name: "native-replacement",
        description: "inlined Math.sign replaced mid-execution",
        build: programs::native_replacement,
        setup: Some("Init"),
        warmup: 3,
        compile: &["SignLoop"],
        configure: unchanged,
    },
    Scenario {
        name: "polymorphic-access",
        description: "loads from string, number and object receivers",
        build: programs::polymorphic_access,
        setup: Some("Init"),
        warmup: 3,
        compile: &["PolymorphicTest"],
        configure: unchanged,
    },
    Scenario {
        name: "recursion",
        description: "recursive Fib compiled without inlining itself",
        build: programs::recursion,
        setup: None,
        warmup: 1,
        compile: &["Fib"],
        configure: unchanged,
    },
    Scenario {
        name: "stack-overflow",
        description: "unbounded recursion caught as a RangeError",
        build: programs::stack_overflow,
        setup: None,
        warmup: 1,
        compile: &["Down"],
        configure: shallow_stack,
    },
    Scenario {
        name: "integrity",
        description: "frozen and sealed objects written from sloppy and strict code",
        build: programs::integrity,
        setup: None,
        warmup: 3,
        compile: &["IntegrityTest"],
        configure: unchanged,
    },
    Scenario {
        name: "exceptions",
        description: "throws caught by handlers inside inlined callees",
        build: programs::exceptions,
        setup: None,
        warmup: 3,
        compile: &["ExceptionTest"],
        configure: unchanged,
    },
    Scenario {
        name: "weak-refs",
        description: "WeakRef clearing and finalization after forceFullGC",
        build: programs::weak_refs,
        setup: None,
        warmup: 2,
        compile: &["WeakRefTest"],
        configure: unchanged,
    },
];

/// Every scenario, in listing order
pub fn all() -> &'static [Scenario] {
    SCENARIOS
}

pub fn find(name: &str) -> Option<&'static Scenario> {
    SCENARIOS.iter().find(|s| s.name == name)
}

impl Scenario {
    pub fn program(&self) -> Result<Program> {
        let mut builder = ProgramBuilder::new();
        (self.build)(&mut builder);
        builder.build()
    }

    /// Configuration the optimized run uses, derived from `base`
    pub fn config(&self, base: &EngineConfig) -> EngineConfig {
        (self.configure)(base.clone())
    }

    /// Run interpreted, then optimized, and compare
    pub fn run(&self, base: &EngineConfig) -> Result<ScenarioReport> {
        let config = self.config(base);
        let mut interpreted_config = config.clone();
        interpreted_config.tiering.hot_call_threshold = u64::MAX;
        interpreted_config.tiering.aot_call_threshold = u64::MAX;

        let (interpreted, _) = self.execute(interpreted_config, false)?;
        let (optimized, engine) = self.execute(config, true)?;
        let transparent = interpreted == optimized;
        if !transparent {
            tracing::warn!(scenario = self.name, "interpreted and optimized runs differ");
        }

        let functions = engine
            .vm()
            .program()
            .functions()
            .iter()
            .map(|code| engine.function_report(&code.name))
            .collect::<Result<Vec<_>>>()?;
        Ok(ScenarioReport {
            name: self.name.to_string(),
            interpreted,
            optimized,
            transparent,
            functions,
            summary: engine.compilation_summary(),
        })
    }

    fn execute(&self, config: EngineConfig, optimize: bool) -> Result<(RunOutcome, Engine)> {
        let mut engine = Engine::with_config(self.program()?, config)?;
        if let Some(setup) = self.setup {
            engine.call(setup, Vec::new())?;
        }
        let mut results = Vec::new();
        for _ in 0..self.warmup {
            results.push(Self::outcome(&mut engine));
        }
        if optimize {
            for name in self.compile {
                engine.jit_compile_async(name)?;
            }
            for name in self.compile {
                let compiled = engine.wait_jit_compile_finish(name)?;
                tracing::debug!(scenario = self.name, function = name, compiled, "compiled for measured run");
            }
        }
        results.push(Self::outcome(&mut engine));
        let output = engine.take_output();
        Ok((RunOutcome { results, output }, engine))
    }

    fn outcome(engine: &mut Engine) -> String {
        match engine.run_main() {
            Ok(value) => engine.display(&value),
            Err(error) => error.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_are_unique() {
        let mut names: Vec<_> = all().iter().map(|s| s.name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), all().len());
    }

    #[test]
    fn test_every_program_verifies() {
        for scenario in all() {
            let program = scenario.program().unwrap();
            for name in scenario.compile {
                assert!(program.lookup(name).is_some(), "{}: {}", scenario.name, name);
            }
            assert!(program.lookup("main").is_some());
        }
    }

    #[test]
    fn test_boundary_sizes() {
        let program = find("inline-boundary").unwrap().program().unwrap();
        let size = |name| program.function(program.lookup(name).unwrap()).size();
        assert_eq!(size("BoundaryJustUnder45Func"), 45);
        assert_eq!(size("BoundaryJustOver45Func"), 46);
    }
}

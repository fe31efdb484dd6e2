//! Shared test helpers for integration tests

use quicksilver_tier::bytecode::ProgramBuilder;
use quicksilver_tier::scenarios;
use quicksilver_tier::{Engine, EngineConfig, Value};

/// Configuration that compiles on the calling thread
pub fn sync_config() -> EngineConfig {
    EngineConfig::default().with_synchronous_compilation()
}

/// Assemble a program and load it with synchronous compilation
#[allow(dead_code)]
pub fn engine(build: impl FnOnce(&mut ProgramBuilder)) -> Engine {
    engine_with(sync_config(), build)
}

#[allow(dead_code)]
pub fn engine_with(config: EngineConfig, build: impl FnOnce(&mut ProgramBuilder)) -> Engine {
    let mut builder = ProgramBuilder::new();
    build(&mut builder);
    Engine::with_config(builder.build().unwrap(), config).unwrap()
}

/// Load a canned scenario's program
#[allow(dead_code)]
pub fn scenario_engine(name: &str, config: EngineConfig) -> Engine {
    let scenario = scenarios::find(name).unwrap();
    let mut engine = Engine::with_config(scenario.program().unwrap(), scenario.config(&config)).unwrap();
    if let Some(setup) = scenario.setup {
        engine.call(setup, Vec::new()).unwrap();
    }
    engine
}

/// Call `name` without arguments `times` times
#[allow(dead_code)]
pub fn warm(engine: &mut Engine, name: &str, times: usize) {
    for _ in 0..times {
        engine.call(name, Vec::new()).unwrap();
    }
}

/// Queue `name` and block until the compile finishes
#[allow(dead_code)]
pub fn compile(engine: &mut Engine, name: &str) -> bool {
    assert!(engine.jit_compile_async(name).unwrap(), "{} refused", name);
    engine.wait_jit_compile_finish(name).unwrap()
}

#[allow(dead_code)]
pub fn num(n: f64) -> Value {
    Value::Number(n)
}

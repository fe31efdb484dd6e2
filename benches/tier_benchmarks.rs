//! Benchmarks for tiered execution
//!
//! Run with: cargo bench
//!
//! These benchmarks compare interpreted and compiled execution of the canned
//! scenarios, and measure how long a compile request takes end to end.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use quicksilver_tier::scenarios;
use quicksilver_tier::{Engine, EngineConfig};

fn interpreter_only() -> EngineConfig {
    let mut config = EngineConfig::default().with_synchronous_compilation();
    config.tiering.hot_call_threshold = u64::MAX;
    config.tiering.aot_call_threshold = u64::MAX;
    config
}

/// A scenario engine after its warmup, compiled if `optimize`
fn prepared(name: &str, optimize: bool) -> Engine {
    let scenario = scenarios::find(name).expect("scenario exists");
    let base = if optimize {
        EngineConfig::default().with_synchronous_compilation()
    } else {
        interpreter_only()
    };
    let program = scenario.program().expect("scenario builds");
    let mut engine = Engine::with_config(program, scenario.config(&base)).expect("valid config");
    if let Some(setup) = scenario.setup {
        engine.call(setup, Vec::new()).expect("setup runs");
    }
    for _ in 0..scenario.warmup {
        engine.run_main().expect("warmup runs");
    }
    if optimize {
        for name in scenario.compile {
            engine.jit_compile_async(name).expect("function exists");
            engine.wait_jit_compile_finish(name).expect("function exists");
        }
    }
    engine.take_output();
    engine
}

/// Benchmark: steady-state `main` per tier
fn bench_tiers(c: &mut Criterion) {
    let mut group = c.benchmark_group("tiers");
    for name in ["inline-chain", "polymorphic-access", "recursion", "exceptions"] {
        for (label, optimize) in [("interpreted", false), ("optimized", true)] {
            group.bench_with_input(BenchmarkId::new(label, name), &optimize, |b, &optimize| {
                let mut engine = prepared(name, optimize);
                b.iter(|| {
                    let value = engine.run_main().expect("main runs");
                    engine.take_output();
                    black_box(value)
                })
            });
        }
    }
    group.finish();
}

/// Benchmark: compile request to installed unit
fn bench_compile(c: &mut Criterion) {
    let mut group = c.benchmark_group("compile");
    for background in [false, true] {
        let label = if background { "background" } else { "synchronous" };
        group.bench_function(label, |b| {
            b.iter(|| {
                let scenario = scenarios::find("inline-chain").expect("scenario exists");
                let mut config = EngineConfig::default();
                config.tiering.background_compilation = background;
                let program = scenario.program().expect("scenario builds");
                let mut engine = Engine::with_config(program, config).expect("valid config");
                for _ in 0..scenario.warmup {
                    engine.run_main().expect("warmup runs");
                }
                engine.jit_compile_async("BasicInlineCountTest").expect("function exists");
                black_box(engine.wait_jit_compile_finish("BasicInlineCountTest").expect("function exists"))
            })
        });
    }
    group.finish();
}

/// Benchmark: full scenario run, both tiers plus comparison
fn bench_scenarios(c: &mut Criterion) {
    let mut group = c.benchmark_group("scenarios");
    group.sample_size(20);
    let config = EngineConfig::default().with_synchronous_compilation();
    for scenario in scenarios::all() {
        group.bench_function(scenario.name, |b| {
            b.iter(|| black_box(scenario.run(&config).expect("scenario runs").transparent))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_tiers, bench_compile, bench_scenarios);
criterion_main!(benches);

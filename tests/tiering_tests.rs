//! Tier transitions, background compilation and compile failures

mod common;
use common::{compile, engine, engine_with, num, sync_config};
use pretty_assertions::assert_eq;
use quicksilver_tier::bytecode::ProgramBuilder;
use quicksilver_tier::jit::{PinReason, Tier, TierState};
use quicksilver_tier::{EngineConfig, ErrorKind};

fn square(b: &mut ProgramBuilder) {
    b.function("square", 1, |f| {
        f.local(0).local(0).mul().ret();
    });
}

fn call_square(engine: &mut quicksilver_tier::Engine, times: usize) {
    for i in 0..times {
        let n = i as f64;
        assert_eq!(engine.call("square", vec![num(n)]).unwrap(), num(n * n));
    }
}

/// `readP()` loads `p` through a prototype; `bump()` writes it
fn prototype_reader(b: &mut ProgramBuilder) {
    b.function("Init", 0, |f| {
        f.new_object().dup().number(1.0).set("p").set_global("P");
        f.global("Object")
            .global("P")
            .call_method("create", 1)
            .set_global("child");
        f.ret_undefined();
    });
    b.function("readP", 0, |f| {
        f.global("child").get("p").ret();
    });
    b.function("bump", 0, |f| {
        f.global("P").dup().get("p").number(1.0).add().set("p");
        f.ret_undefined();
    });
}

mod stale_feedback {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_compile_after_prototype_write_installs() {
        for config in [sync_config(), EngineConfig::default()] {
            let mut engine = engine_with(config, prototype_reader);
            engine.call("Init", vec![]).unwrap();
            for _ in 0..2 {
                assert_eq!(engine.call("readP", vec![]).unwrap(), num(1.0));
            }
            // the cached prototype version is now behind the heap
            engine.call("bump", vec![]).unwrap();

            assert!(compile(&mut engine, "readP"));
            assert_eq!(engine.tier_state("readP").unwrap(), TierState::Compiled(Tier::Jit));
            assert_eq!(engine.call("readP", vec![]).unwrap(), num(2.0));

            engine.call("bump", vec![]).unwrap();
            assert_eq!(engine.call("readP", vec![]).unwrap(), num(3.0));
            assert_eq!(engine.deopt_count("readP").unwrap(), 0);
        }
    }

    #[test]
    fn test_fresh_feedback_still_specializes() {
        let mut engine = engine(prototype_reader);
        engine.call("Init", vec![]).unwrap();
        engine.call("bump", vec![]).unwrap();
        for _ in 0..2 {
            assert_eq!(engine.call("readP", vec![]).unwrap(), num(2.0));
        }
        assert!(compile(&mut engine, "readP"));
        assert!(engine.function_report("readP").unwrap().guard_count > 0);

        engine.call("bump", vec![]).unwrap();
        assert_eq!(engine.deopt_count("readP").unwrap(), 1);
        assert_eq!(engine.call("readP", vec![]).unwrap(), num(3.0));
    }
}

mod background {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_async_compile_then_wait() {
        let mut engine = engine_with(EngineConfig::default(), square);
        call_square(&mut engine, 3);

        assert!(engine.jit_compile_async("square").unwrap());
        let state = engine.tier_state("square").unwrap();
        assert!(state.is_pending() || state.is_compiled(), "unexpected {}", state);

        assert!(engine.wait_jit_compile_finish("square").unwrap());
        assert_eq!(engine.tier_state("square").unwrap(), TierState::Compiled(Tier::Jit));
        call_square(&mut engine, 3);
    }

    #[test]
    fn test_duplicate_requests_compile_once() {
        let mut engine = engine_with(EngineConfig::default(), square);
        call_square(&mut engine, 3);

        assert!(engine.jit_compile_async("square").unwrap());
        assert!(engine.jit_compile_async("square").unwrap());
        assert!(engine.wait_jit_compile_finish("square").unwrap());
        assert!(engine.jit_compile_async("square").unwrap());

        assert_eq!(engine.function_report("square").unwrap().compilations, 1);
    }

    #[test]
    fn test_wait_without_request_reports_state() {
        let mut engine = engine_with(EngineConfig::default(), square);
        assert!(!engine.wait_jit_compile_finish("square").unwrap());
        assert_eq!(engine.tier_state("square").unwrap(), TierState::Interpreted);
    }
}

mod promotion {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_hot_function_is_promoted() {
        let mut engine = engine_with(sync_config().with_hot_call_threshold(5), square);
        call_square(&mut engine, 4);
        assert_eq!(engine.tier_state("square").unwrap(), TierState::Interpreted);
        call_square(&mut engine, 1);
        assert_eq!(engine.tier_state("square").unwrap(), TierState::Compiled(Tier::Jit));
    }

    #[test]
    fn test_long_running_function_reaches_aot() {
        let mut config = sync_config().with_hot_call_threshold(5);
        config.tiering.aot_call_threshold = 10;
        let mut engine = engine_with(config, square);
        call_square(&mut engine, 20);

        let report = engine.function_report("square").unwrap();
        assert_eq!(report.state, TierState::Compiled(Tier::Aot));
        assert_eq!(report.compilations, 2);
        assert_eq!(engine.compilation_summary().functions_aot, 1);
    }

    #[test]
    fn test_interpreter_only_configuration() {
        let mut config = sync_config();
        config.tiering.hot_call_threshold = u64::MAX;
        let mut engine = engine_with(config, square);
        call_square(&mut engine, 200);
        assert_eq!(engine.tier_state("square").unwrap(), TierState::Interpreted);
    }
}

mod failures {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_debugger_pins_function() {
        let mut engine = engine(|b| {
            b.function("paused", 0, |f| {
                f.debugger().number(7.0).ret();
            });
        });
        assert!(!compile(&mut engine, "paused"));

        let report = engine.function_report("paused").unwrap();
        assert!(matches!(report.pinned, Some(PinReason::CompileFailed(_))));
        assert_eq!(report.state, TierState::Interpreted);
        assert!(!engine.jit_compile_async("paused").unwrap());
        assert_eq!(engine.call("paused", vec![]).unwrap(), num(7.0));
    }

    #[test]
    fn test_unknown_function_is_reference_error() {
        let mut engine = engine(square);
        let error = engine.jit_compile_async("missing").unwrap_err();
        assert_eq!(error.to_string(), "ReferenceError: missing is not defined");
        assert!(engine.tier_state("missing").is_err());
    }

    #[test]
    fn test_stack_overflow_in_compiled_code() {
        let mut engine = engine_with(sync_config().with_max_call_depth(200), |b| {
            b.function("down", 1, |f| {
                f.global("down").local(0).number(1.0).add().call(1).ret();
            });
        });
        let error = engine.call("down", vec![num(0.0)]).unwrap_err();
        assert!(engine.tier_state("down").unwrap().is_compiled());
        assert!(error.is_catchable());
        match error {
            quicksilver_tier::Error::RuntimeError { kind, message, .. } => {
                assert_eq!(kind, ErrorKind::RangeError);
                assert_eq!(message, "Maximum call stack size exceeded");
            }
            other => panic!("unexpected {}", other),
        }
        assert_eq!(engine.vm().depth(), 0);
    }
}

//! Eager and lazy deoptimization

mod common;
use common::{compile, engine, engine_with, num, scenario_engine, sync_config, warm};
use pretty_assertions::assert_eq;
use quicksilver_tier::bytecode::ProgramBuilder;
use quicksilver_tier::jit::{DeoptReason, PinReason, TierState};
use quicksilver_tier::scenarios;

/// `getX(o)` plus two callers passing objects of different shapes
fn shapes_program(b: &mut ProgramBuilder) {
    b.function("getX", 1, |f| {
        f.local(0).get("x").ret();
    });
    b.function("withA", 0, |f| {
        f.global("getX")
            .new_object()
            .dup()
            .number(1.0)
            .set("x")
            .call(1)
            .ret();
    });
    b.function("withB", 0, |f| {
        f.global("getX")
            .new_object()
            .dup()
            .number(0.0)
            .set("y")
            .dup()
            .number(2.0)
            .set("x")
            .call(1)
            .ret();
    });
}

/// `readP()` loads `p` through the prototype of `child`; `bump()` writes it
fn prototype_program(b: &mut ProgramBuilder) {
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

mod eager {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_shape_mismatch_resumes_in_interpreter() {
        let mut engine = engine(shapes_program);
        warm(&mut engine, "withA", 5);
        assert!(compile(&mut engine, "getX"));

        assert_eq!(engine.call("withB", vec![]).unwrap(), num(2.0));
        assert_eq!(engine.deopt_count("getX").unwrap(), 1);
        assert_eq!(engine.tier_state("getX").unwrap(), TierState::Deoptimized);

        let event = engine.deopt_history().last().unwrap();
        assert_eq!(event.function, "getX");
        assert_eq!(event.reason, DeoptReason::ShapeMismatch);
        assert!(!event.lazy);
        assert_eq!(event.resumed_at, Some(("getX".to_string(), 1)));

        assert_eq!(engine.call("withA", vec![]).unwrap(), num(1.0));
        assert_eq!(engine.tier_state("getX").unwrap(), TierState::Interpreted);
    }

    #[test]
    fn test_recompile_after_deopt_is_polymorphic() {
        let mut engine = engine(shapes_program);
        warm(&mut engine, "withA", 5);
        compile(&mut engine, "getX");
        engine.call("withB", vec![]).unwrap();

        assert!(compile(&mut engine, "getX"));
        assert_eq!(engine.function_report("getX").unwrap().guard_count, 0);
        assert_eq!(engine.call("withA", vec![]).unwrap(), num(1.0));
        assert_eq!(engine.call("withB", vec![]).unwrap(), num(2.0));
        assert_eq!(engine.deopt_count("getX").unwrap(), 1);
    }

    #[test]
    fn test_replaced_native_method_deoptimizes() {
        let mut engine = scenario_engine("native-replacement", sync_config());
        warm(&mut engine, "SignLoop", 3);
        compile(&mut engine, "SignLoop");

        assert_eq!(engine.run_main().unwrap(), num(-1.0));
        assert_eq!(engine.take_output(), ["-1", "100"]);
        assert_eq!(engine.deopt_count("SignLoop").unwrap(), 1);

        let event = engine
            .deopt_history()
            .iter()
            .find(|e| e.function == "SignLoop")
            .unwrap();
        assert_eq!(event.reason, DeoptReason::MethodMismatch);
        assert!(!event.lazy);
        let (function, _) = event.resumed_at.clone().unwrap();
        assert_eq!(function, "Sign");
    }
}

mod lazy {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_prototype_change_under_compiled_frames() {
        let scenario = scenarios::find("lazy-deopt").unwrap();
        let report = scenario.run(&sync_config()).unwrap();
        assert!(report.transparent);
        assert_eq!(report.optimized.results, ["1", "2", "3", "4"]);
        assert_eq!(report.optimized.output.len(), 20);
        assert_eq!(report.optimized.output.last().unwrap(), "4 true");

        // both compiled frames under the mutation fall back, the outer one included
        for name in ["Test2", "ChangePrototypeValue"] {
            let function = report.functions.iter().find(|f| f.name == name).unwrap();
            assert_eq!(function.deopt_count, 1, "{}", name);
            assert!(!function.deopts.is_empty(), "{}", name);
            assert!(
                function
                    .deopts
                    .iter()
                    .all(|e| e.lazy && e.reason == DeoptReason::DependencyChanged),
                "{}",
                name
            );
            assert!(!function.state.is_compiled(), "{}", name);
        }
    }

    #[test]
    fn test_outer_frame_resumes_interpreted() {
        let mut engine = scenario_engine("lazy-deopt", sync_config());
        for _ in 0..3 {
            engine.run_main().unwrap();
        }
        assert!(compile(&mut engine, "Test2"));
        assert!(compile(&mut engine, "ChangePrototypeValue"));

        engine.run_main().unwrap();
        for name in ["Test2", "ChangePrototypeValue"] {
            assert_eq!(engine.deopt_count(name).unwrap(), 1, "{}", name);
            let resumed = engine
                .deopt_history()
                .iter()
                .filter(|e| e.function == name)
                .filter_map(|e| e.resumed_at.clone())
                .count();
            assert_eq!(resumed, 1, "{}", name);
        }
        engine.call("Test2", vec![]).unwrap();
        assert_eq!(engine.tier_state("Test2").unwrap(), TierState::Interpreted);
    }

    #[test]
    fn test_dependency_change_invalidates_idle_unit() {
        let mut engine = engine(prototype_program);
        warm(&mut engine, "Init", 1);
        warm(&mut engine, "readP", 2);
        assert!(compile(&mut engine, "readP"));

        warm(&mut engine, "bump", 1);
        assert_eq!(engine.deopt_count("readP").unwrap(), 1);
        let event = engine.deopt_history().last().unwrap();
        assert_eq!(event.reason, DeoptReason::DependencyChanged);
        assert!(event.lazy);
        assert_eq!(event.resumed_at, None);

        assert_eq!(engine.call("readP", vec![]).unwrap(), num(2.0));
    }

    #[test]
    fn test_deopt_cap_pins_function() {
        let mut engine = engine_with(sync_config().with_max_deopts(3), prototype_program);
        warm(&mut engine, "Init", 1);
        for round in 1..=3 {
            warm(&mut engine, "readP", 2);
            assert!(compile(&mut engine, "readP"), "round {}", round);
            warm(&mut engine, "bump", 1);
            assert_eq!(engine.deopt_count("readP").unwrap(), round);
        }

        assert!(!engine.jit_compile_async("readP").unwrap());
        let report = engine.function_report("readP").unwrap();
        assert_eq!(report.pinned, Some(PinReason::DeoptLimit));
        assert_eq!(report.compilations, 3);
        assert_eq!(engine.call("readP", vec![]).unwrap(), num(4.0));
        assert!(!engine.tier_state("readP").unwrap().is_compiled());
    }
}

//! Speculative inlining decisions observed through compiled units

mod common;
use common::{compile, engine, num, scenario_engine, sync_config, warm};
use pretty_assertions::assert_eq;
use quicksilver_tier::jit::{IcStateKind, InlineDecision, RejectReason};
use quicksilver_tier::Value;

mod chain {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_chain_stops_at_depth_cap() {
        let mut engine = scenario_engine("inline-chain", sync_config());
        warm(&mut engine, "main", 3);
        assert!(compile(&mut engine, "BasicInlineCountTest"));

        let plan = engine.inline_plan("BasicInlineCountTest").unwrap().unwrap();
        let accepted: Vec<_> = plan.accepted().map(|r| r.callee.clone().unwrap()).collect();
        let expected: Vec<_> = (1..=8).map(|i| format!("InlineFoo{}", i)).collect();
        assert_eq!(accepted, expected);

        let rejected: Vec<_> = plan.rejected().collect();
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].callee.as_deref(), Some("InlineFoo9"));
        assert_eq!(
            rejected[0].decision,
            InlineDecision::Reject(RejectReason::MaxDepthExceeded { depth: 9, max: 8 })
        );

        assert_eq!(engine.run_main().unwrap(), num(90.0));
    }

    #[test]
    fn test_inlined_depths_are_reported() {
        let mut engine = scenario_engine("inline-chain", sync_config());
        warm(&mut engine, "main", 3);
        compile(&mut engine, "BasicInlineCountTest");

        let report = engine.function_report("BasicInlineCountTest").unwrap();
        let depths: Vec<_> = report.inlined.iter().map(|c| c.depth).collect();
        assert_eq!(depths, (1..=8).collect::<Vec<u16>>());
        assert!(report.inlined.iter().all(|c| !c.native));
    }

    #[test]
    fn test_configured_depth_cap() {
        let mut engine = scenario_engine("inline-chain", sync_config().with_max_inline_depth(3));
        warm(&mut engine, "main", 3);
        compile(&mut engine, "BasicInlineCountTest");

        let plan = engine.inline_plan("BasicInlineCountTest").unwrap().unwrap();
        assert_eq!(plan.accepted().count(), 3);
        let last = plan.records.last().unwrap();
        assert_eq!(last.callee.as_deref(), Some("InlineFoo4"));
        assert_eq!(
            last.decision,
            InlineDecision::Reject(RejectReason::MaxDepthExceeded { depth: 4, max: 3 })
        );
        assert_eq!(engine.call("BasicInlineCountTest", vec![]).unwrap(), num(90.0));
    }
}

mod size {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_boundary_at_forty_five_instructions() {
        let mut engine = scenario_engine("inline-boundary", sync_config());
        warm(&mut engine, "main", 3);
        compile(&mut engine, "BoundaryTest");

        let plan = engine.inline_plan("BoundaryTest").unwrap().unwrap();
        let decision = |name: &str| {
            plan.records
                .iter()
                .find(|r| r.callee.as_deref() == Some(name))
                .map(|r| r.decision.clone())
                .unwrap()
        };
        assert_eq!(decision("BoundaryJustUnder45Func"), InlineDecision::Inline);
        assert_eq!(
            decision("BoundaryJustOver45Func"),
            InlineDecision::Reject(RejectReason::NotHotEnough {
                size: 46,
                count: 30,
                required: 50
            })
        );
        assert_eq!(engine.run_main().unwrap(), num(10.0));
    }

    #[test]
    fn test_hot_site_admits_larger_callee() {
        let mut engine = scenario_engine("inline-boundary", sync_config());
        warm(&mut engine, "main", 6);
        compile(&mut engine, "BoundaryTest");

        let plan = engine.inline_plan("BoundaryTest").unwrap().unwrap();
        let accepted: Vec<_> = plan.accepted().filter_map(|r| r.callee.clone()).collect();
        assert_eq!(accepted, ["BoundaryJustUnder45Func", "BoundaryJustOver45Func"]);
        assert_eq!(engine.run_main().unwrap(), num(10.0));
    }
}

mod eligibility {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_cold_site_is_kept_as_call() {
        let mut engine = engine(|b| {
            b.function("one", 0, |f| {
                f.number(1.0).ret();
            });
            b.function("once", 0, |f| {
                f.global("one").call(0).ret();
            });
        });
        warm(&mut engine, "once", 1);
        compile(&mut engine, "once");

        let plan = engine.inline_plan("once").unwrap().unwrap();
        assert_eq!(
            plan.records[0].decision,
            InlineDecision::Reject(RejectReason::ColdCallSite { count: 1, min: 2 })
        );
        assert_eq!(engine.call("once", vec![]).unwrap(), num(1.0));
    }

    #[test]
    fn test_sites_are_decided_independently() {
        let mut engine = engine(|b| {
            b.function("one", 0, |f| {
                f.number(1.0).ret();
            });
            b.function("two", 0, |f| {
                f.number(2.0).ret();
            });
            b.function("pick", 1, |f| {
                f.global("one").call(0);
                f.local(0).call(0);
                f.add().ret();
            });
        });
        let one = engine.global("one").unwrap();
        let two = engine.global("two").unwrap();
        for callee in [&one, &two, &one, &two] {
            engine.call("pick", vec![callee.clone()]).unwrap();
        }
        compile(&mut engine, "pick");

        let plan = engine.inline_plan("pick").unwrap().unwrap();
        assert_eq!(plan.records.len(), 2);
        assert_eq!(plan.records[0].callee.as_deref(), Some("one"));
        assert_eq!(plan.records[0].decision, InlineDecision::Inline);
        assert_eq!(
            plan.records[1].decision,
            InlineDecision::Reject(RejectReason::NotMonomorphic(IcStateKind::Polymorphic))
        );
        assert_eq!(engine.call("pick", vec![one]).unwrap(), num(2.0));
        assert_eq!(engine.call("pick", vec![two]).unwrap(), num(3.0));
        assert_eq!(engine.deopt_count("pick").unwrap(), 0);
    }

    #[test]
    fn test_recursive_callee_is_never_inlined() {
        let mut engine = scenario_engine("recursion", sync_config());
        warm(&mut engine, "main", 1);
        compile(&mut engine, "Fib");

        let plan = engine.inline_plan("Fib").unwrap().unwrap();
        assert_eq!(plan.accepted().count(), 0);
        assert_eq!(plan.records.len(), 2);
        assert!(plan
            .records
            .iter()
            .all(|r| r.decision == InlineDecision::Reject(RejectReason::Recursive)));
        assert_eq!(engine.run_main().unwrap(), num(6765.0));
    }

    #[test]
    fn test_callees_with_handlers_are_inlined() {
        let mut engine = scenario_engine("exceptions", sync_config());
        warm(&mut engine, "main", 3);
        compile(&mut engine, "ExceptionTest");

        let plan = engine.inline_plan("ExceptionTest").unwrap().unwrap();
        let accepted: Vec<_> = plan.accepted().filter_map(|r| r.callee.clone()).collect();
        assert_eq!(accepted, ["Guarded", "Thrower"]);

        assert_eq!(engine.call("ExceptionTest", vec![]).unwrap(), num(11.0));
        assert_eq!(engine.deopt_count("ExceptionTest").unwrap(), 0);
    }

    #[test]
    fn test_monomorphic_native_method_is_inlined() {
        let mut engine = scenario_engine("native-replacement", sync_config());
        warm(&mut engine, "SignLoop", 3);
        compile(&mut engine, "SignLoop");

        let plan = engine.inline_plan("SignLoop").unwrap().unwrap();
        let decisions: Vec<_> = plan.records.iter().map(|r| r.decision.clone()).collect();
        assert_eq!(decisions, [InlineDecision::Inline, InlineDecision::InlineNative]);
        assert_eq!(engine.call("SignLoop", vec![]).unwrap(), num(-1.0));
    }
}

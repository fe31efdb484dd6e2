//! Integrity levels, property descriptors and prototypes across tiers

mod common;
use common::{compile, engine, num, scenario_engine, sync_config, warm};
use pretty_assertions::assert_eq;
use quicksilver_tier::Value;

mod integrity {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_frozen_and_sealed_writes() {
        let mut engine = scenario_engine("integrity", sync_config());
        assert_eq!(engine.run_main().unwrap(), num(1.0));

        let output = engine.take_output();
        assert_eq!(output.len(), 5);
        assert_eq!(output[0], "1");
        assert!(output[1].starts_with("TypeError: "), "{}", output[1]);
        assert_eq!(output[2..].to_vec(), ["threw", "true", "2 undefined true false"]);
    }

    #[test]
    fn test_compiled_writers_respect_integrity() {
        let mut engine = scenario_engine("integrity", sync_config());
        warm(&mut engine, "main", 3);
        let interpreted = engine.take_output();
        assert!(compile(&mut engine, "IntegrityTest"));
        assert!(compile(&mut engine, "SetStrict"));

        assert_eq!(engine.run_main().unwrap(), num(1.0));
        assert_eq!(engine.take_output(), interpreted[..5].to_vec());
    }

    #[test]
    fn test_prevent_extensions_deoptimizes_transition() {
        let mut engine = engine(|b| {
            b.function("addY", 1, |f| {
                f.local(0).number(1.0).set("y");
                f.local(0).get("y").ret();
            });
            b.function("fresh", 0, |f| {
                f.global("addY").new_object().call(1).ret();
            });
            b.function("locked", 0, |f| {
                let object = f.declare_local();
                f.new_object().set_local(object);
                f.global("Object")
                    .local(object)
                    .call_method("preventExtensions", 1)
                    .pop();
                f.global("addY").local(object).call(1).ret();
            });
        });
        warm(&mut engine, "fresh", 5);
        assert!(compile(&mut engine, "addY"));

        assert_eq!(engine.call("locked", vec![]).unwrap(), Value::Undefined);
        assert_eq!(engine.deopt_count("addY").unwrap(), 1);
        assert_eq!(engine.call("fresh", vec![]).unwrap(), num(1.0));
    }
}

mod descriptors {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_define_read_only_property() {
        let mut engine = engine(|b| {
            b.function("main", 0, |f| {
                let object = f.declare_local();
                f.new_object().set_local(object);
                f.global("Object").local(object).string("x");
                f.new_object()
                    .dup()
                    .number(1.0)
                    .set("value")
                    .dup()
                    .boolean(false)
                    .set("writable");
                f.call_method("defineProperty", 3).pop();
                f.local(object).number(5.0).set("x");
                f.local(object).get("x").ret();
            });
        });
        assert_eq!(engine.run_main().unwrap(), num(1.0));
    }

    #[test]
    fn test_has_own_property_ignores_prototype() {
        let mut engine = engine(|b| {
            b.function("main", 0, |f| {
                let parent = f.declare_local();
                let child = f.declare_local();
                f.new_object().dup().number(1.0).set("p").set_local(parent);
                f.global("Object")
                    .local(parent)
                    .call_method("create", 1)
                    .set_local(child);
                f.global("print")
                    .local(child)
                    .get("p")
                    .local(child)
                    .string("p")
                    .call_method("hasOwnProperty", 1)
                    .call(2)
                    .pop();
                f.undefined().ret();
            });
        });
        engine.run_main().unwrap();
        assert_eq!(engine.output(), ["1 false"]);
    }
}

mod prototypes {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_cyclic_prototype_is_type_error() {
        let mut engine = engine(|b| {
            b.function("main", 0, |f| {
                let base = f.declare_local();
                let derived = f.declare_local();
                f.new_object().set_local(base);
                f.global("Object")
                    .local(base)
                    .call_method("create", 1)
                    .set_local(derived);
                f.global("Object")
                    .local(base)
                    .local(derived)
                    .call_method("setPrototypeOf", 2)
                    .ret();
            });
        });
        let error = engine.run_main().unwrap_err();
        assert!(
            error.to_string().starts_with("TypeError: Cyclic __proto__ value"),
            "{}",
            error
        );
    }

    #[test]
    fn test_prototype_swap_deoptimizes_reader() {
        let mut engine = engine(|b| {
            b.function("Init", 0, |f| {
                f.new_object().dup().number(1.0).set("v").set_global("first");
                f.new_object().dup().number(2.0).set("v").set_global("second");
                f.global("Object")
                    .global("first")
                    .call_method("create", 1)
                    .set_global("child");
                f.ret_undefined();
            });
            b.function("read", 0, |f| {
                f.global("child").get("v").ret();
            });
            b.function("swap", 0, |f| {
                f.global("Object")
                    .global("child")
                    .global("second")
                    .call_method("setPrototypeOf", 2)
                    .pop();
                f.ret_undefined();
            });
        });
        warm(&mut engine, "Init", 1);
        warm(&mut engine, "read", 3);
        assert!(compile(&mut engine, "read"));
        assert_eq!(engine.call("read", vec![]).unwrap(), num(1.0));

        warm(&mut engine, "swap", 1);
        assert_eq!(engine.call("read", vec![]).unwrap(), num(2.0));
        assert_eq!(engine.deopt_count("read").unwrap(), 1);
    }
}

//! Every canned scenario behaves the same interpreted and optimized

mod common;
use common::sync_config;
use pretty_assertions::assert_eq;
use quicksilver_tier::scenarios;
use quicksilver_tier::EngineConfig;

#[test]
fn test_all_scenarios_are_transparent() {
    for scenario in scenarios::all() {
        let report = scenario.run(&sync_config()).unwrap();
        assert!(report.transparent, "{} differs", scenario.name);
        assert_eq!(report.interpreted, report.optimized, "{}", scenario.name);
    }
}

#[test]
fn test_background_compilation_is_transparent() {
    for name in ["inline-chain", "lazy-deopt", "polymorphic-access"] {
        let scenario = scenarios::find(name).unwrap();
        let report = scenario.run(&EngineConfig::default()).unwrap();
        assert!(report.transparent, "{} differs", name);
    }
}

#[test]
fn test_compiled_functions_are_reported() {
    let report = scenarios::find("inline-chain")
        .unwrap()
        .run(&sync_config())
        .unwrap();
    let function = report
        .functions
        .iter()
        .find(|f| f.name == "BasicInlineCountTest")
        .unwrap();
    assert!(function.state.is_compiled());
    assert_eq!(function.compilations, 1);
    assert_eq!(function.inlined.len(), 8);
    assert_eq!(report.summary.functions_jit, 1);
    assert_eq!(report.optimized.results.last().unwrap(), "90");
}

#[test]
fn test_stack_overflow_message() {
    let report = scenarios::find("stack-overflow")
        .unwrap()
        .run(&sync_config())
        .unwrap();
    assert_eq!(
        report.optimized.results,
        ["Maximum call stack size exceeded", "Maximum call stack size exceeded"]
    );
    assert!(report
        .optimized
        .output
        .iter()
        .all(|line| line == "RangeError: Maximum call stack size exceeded"));
}

#[test]
fn test_report_serializes() {
    let report = scenarios::find("recursion").unwrap().run(&sync_config()).unwrap();
    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["name"], "recursion");
    assert_eq!(json["transparent"], true);
    assert!(json["functions"].as_array().unwrap().len() >= 2);
}

#[test]
fn test_unknown_scenario() {
    assert!(scenarios::find("no-such-scenario").is_none());
}

//! Compilation diagnostics
//!
//! Read-only views over the tier controller, feedback store and deopt
//! history. Reports serialize to JSON for the CLI's `--json` mode.

use std::fmt;

use serde::Serialize;

use super::deopt::{DeoptEvent, DeoptManager};
use super::feedback::FeedbackStore;
use super::ic::IcStateKind;
use super::inliner::InlineRecord;
use super::tier::{PinReason, SizeClass, Tier, TierController, TierState};
use super::unit::InlinedCall;
use crate::bytecode::{FunctionId, Program};

/// Summary of compilation state for diagnostics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CompilationSummary {
    pub functions_total: usize,
    pub functions_interpreted: usize,
    pub functions_jit: usize,
    pub functions_aot: usize,
    pub functions_pinned: usize,
    pub inlined_calls: usize,
    pub guards: usize,
    pub ic_monomorphic: usize,
    pub ic_polymorphic: usize,
    pub ic_megamorphic: usize,
    pub total_deopts: u64,
}

impl CompilationSummary {
    pub fn collect(feedback: &FeedbackStore, tiers: &TierController, deopt: &DeoptManager) -> Self {
        let mut summary = CompilationSummary {
            functions_total: tiers.len(),
            total_deopts: deopt.total(),
            ..Default::default()
        };
        for index in 0..tiers.len() {
            let function = FunctionId(index as u32);
            let record = tiers.record(function);
            if record.pinned.is_some() {
                summary.functions_pinned += 1;
            }
            match record.state {
                TierState::Compiled(Tier::Jit) => summary.functions_jit += 1,
                TierState::Compiled(Tier::Aot) => summary.functions_aot += 1,
                _ => summary.functions_interpreted += 1,
            }
        }
        for unit in tiers.installed_units() {
            summary.inlined_calls += unit.inlined.len();
            summary.guards += unit.guard_count;
        }
        for site in 0..feedback.site_count() {
            match feedback.ic_state(super::feedback::SiteId(site as u32)) {
                IcStateKind::Monomorphic => summary.ic_monomorphic += 1,
                IcStateKind::Polymorphic => summary.ic_polymorphic += 1,
                IcStateKind::Megamorphic => summary.ic_megamorphic += 1,
                IcStateKind::Uninitialized => {}
            }
        }
        summary
    }
}

impl fmt::Display for CompilationSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== JIT Compilation Summary ===")?;
        writeln!(
            f,
            "Functions: {} total, {} interpreted, {} JIT, {} AOT, {} pinned",
            self.functions_total,
            self.functions_interpreted,
            self.functions_jit,
            self.functions_aot,
            self.functions_pinned
        )?;
        writeln!(f, "Inlined calls: {} ({} guards)", self.inlined_calls, self.guards)?;
        writeln!(
            f,
            "Inline caches: {} monomorphic, {} polymorphic, {} megamorphic",
            self.ic_monomorphic, self.ic_polymorphic, self.ic_megamorphic
        )?;
        writeln!(f, "Deoptimizations: {}", self.total_deopts)?;
        Ok(())
    }
}

/// Everything known about one function
#[derive(Debug, Clone, Serialize)]
pub struct FunctionReport {
    pub name: String,
    pub size: usize,
    pub size_class: SizeClass,
    pub state: TierState,
    pub pinned: Option<PinReason>,
    pub call_count: u64,
    pub hotness: u64,
    pub deopt_count: u32,
    pub compilations: u32,
    pub ic_population: usize,
    pub guard_count: usize,
    pub inlined: Vec<InlinedCall>,
    pub decisions: Vec<InlineRecord>,
    pub deopts: Vec<DeoptEvent>,
}

impl FunctionReport {
    pub fn collect(
        program: &Program,
        feedback: &FeedbackStore,
        tiers: &TierController,
        deopt: &DeoptManager,
        function: FunctionId,
    ) -> Self {
        let code = program.function(function);
        let record = tiers.record(function);
        let unit = tiers.unit(function);
        FunctionReport {
            name: code.name.clone(),
            size: code.size(),
            size_class: tiers.size_class(function),
            state: record.state,
            pinned: record.pinned,
            call_count: feedback.profile(function).call_count,
            hotness: record.hotness,
            deopt_count: record.deopt_count,
            compilations: record.compilations,
            ic_population: feedback.ic_population(function),
            guard_count: unit.as_ref().map_or(0, |u| u.guard_count),
            inlined: unit.as_ref().map_or_else(Vec::new, |u| u.inlined.clone()),
            decisions: unit.as_ref().map_or_else(Vec::new, |u| u.plan.records.clone()),
            deopts: deopt
                .history()
                .iter()
                .filter(|e| e.function_id == function)
                .cloned()
                .collect(),
        }
    }
}

impl fmt::Display for FunctionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} [{}, {:?}]", self.name, self.state, self.size_class)?;
        writeln!(
            f,
            "  calls: {}, deopts: {}, compilations: {}, IC entries: {}",
            self.call_count, self.deopt_count, self.compilations, self.ic_population
        )?;
        if let Some(reason) = &self.pinned {
            writeln!(f, "  pinned: {}", reason)?;
        }
        for call in &self.inlined {
            writeln!(
                f,
                "  inlined {}{} at {}@{} (depth {})",
                call.callee,
                if call.native { " (native)" } else { "" },
                call.caller,
                call.pc,
                call.depth
            )?;
        }
        for record in self.decisions.iter().filter(|r| !r.decision.is_inlined()) {
            writeln!(
                f,
                "  kept call {}@{} -> {}: {}",
                record.caller,
                record.pc,
                record.callee.as_deref().unwrap_or("?"),
                record.decision
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::ProgramBuilder;
    use crate::config::TieringConfig;

    #[test]
    fn test_summary_display() {
        let summary = CompilationSummary {
            functions_total: 3,
            functions_interpreted: 1,
            functions_jit: 2,
            total_deopts: 4,
            ..Default::default()
        };
        let text = summary.to_string();
        assert!(text.starts_with("=== JIT Compilation Summary ===\n"));
        assert!(text.contains("Functions: 3 total, 1 interpreted, 2 JIT, 0 AOT, 0 pinned"));
        assert!(text.contains("Deoptimizations: 4"));
    }

    #[test]
    fn test_fresh_program_report() {
        let mut builder = ProgramBuilder::new();
        builder.function("f", 0, |f| {
            f.undefined().ret();
        });
        let program = builder.build().unwrap();
        let feedback = FeedbackStore::new(&program, 4);
        let tiers = TierController::new(&program, TieringConfig::default());
        let deopt = DeoptManager::new();

        let summary = CompilationSummary::collect(&feedback, &tiers, &deopt);
        assert_eq!(summary.functions_total, 1);
        assert_eq!(summary.functions_interpreted, 1);

        let report = FunctionReport::collect(&program, &feedback, &tiers, &deopt, FunctionId(0));
        assert_eq!(report.state, TierState::Interpreted);
        assert_eq!(report.size_class, SizeClass::Small);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["name"], "f");
        assert_eq!(json["state"], "Interpreted");
    }
}

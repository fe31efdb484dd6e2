//! Speculative inliner
//!
//! Walks the call sites of the function being compiled, and recursively of
//! every callee it accepts, deciding per site whether to splice the callee's
//! body into the unit. A site is inlined only if
//!
//! - it ran at least `min_callsite_count` times and at least
//!   `min_callsite_ratio` times per call of its function,
//! - its call cache (and method-load cache, for method calls) is monomorphic,
//! - the callee is at most `max_inline_size` instructions, or at most
//!   `hard_inline_size` at a site with `hot_callsite_count` executions,
//! - the nesting stays within `max_inline_depth`,
//! - the callee is not on the current inline path nor on any call-graph cycle,
//! - the unit's total inlined size stays within budget.
//!
//! Native callees are not spliced; a monomorphic native site becomes a direct
//! native invocation behind the same identity guard.

use std::fmt;

use rustc_hash::FxHashMap;

use super::call_graph::CallGraph;
use super::feedback::{FeedbackStore, SiteSnapshot};
use super::ic::{CallTarget, Handler, HeapVersions, IcKey, IcStateKind, ProtoLink};
use super::tier::{is_compilable, Tier};
use super::unit::{MethodSource, ReceiverCheck};
use crate::bytecode::{FunctionId, Op, Program};
use crate::config::InliningConfig;
use crate::runtime::heap::NativeId;
use crate::runtime::ObjectId;

/// Why a call site was not inlined
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub enum RejectReason {
    ColdCallSite { count: u64, min: u64 },
    RarelyExecuted { count: u64, caller_calls: u64 },
    NotMonomorphic(IcStateKind),
    MethodNotMonomorphic(IcStateKind),
    /// Method resolved through an accessor or not found
    UnsupportedMethodLoad,
    /// Method holder's prototype chain changed since it was cached
    StaleMethodLoad,
    TooLarge { size: usize, max: usize },
    /// Between the eligible and hard limits at a site that is not hot enough
    NotHotEnough { size: usize, count: u64, required: u64 },
    MaxDepthExceeded { depth: usize, max: usize },
    Recursive,
    BudgetExhausted { remaining: usize, required: usize },
    UnsupportedCallee,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::ColdCallSite { count, min } => {
                write!(f, "cold call site ({} < {})", count, min)
            }
            RejectReason::RarelyExecuted { count, caller_calls } => {
                write!(f, "rarely executed ({} of {} calls)", count, caller_calls)
            }
            RejectReason::NotMonomorphic(state) => write!(f, "call site is {}", state),
            RejectReason::MethodNotMonomorphic(state) => write!(f, "method load is {}", state),
            RejectReason::UnsupportedMethodLoad => f.write_str("method is not a data property"),
            RejectReason::StaleMethodLoad => f.write_str("method load feedback is stale"),
            RejectReason::TooLarge { size, max } => write!(f, "too large ({} > {})", size, max),
            RejectReason::NotHotEnough {
                size,
                count,
                required,
            } => write!(f, "size {} needs a hot site ({} < {})", size, count, required),
            RejectReason::MaxDepthExceeded { depth, max } => {
                write!(f, "max depth exceeded ({} > {})", depth, max)
            }
            RejectReason::Recursive => f.write_str("recursive"),
            RejectReason::BudgetExhausted {
                remaining,
                required,
            } => write!(f, "budget exhausted ({} left, {} needed)", remaining, required),
            RejectReason::UnsupportedCallee => f.write_str("callee cannot be compiled"),
        }
    }
}

/// Outcome for one call site
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub enum InlineDecision {
    Inline,
    InlineNative,
    Reject(RejectReason),
}

impl InlineDecision {
    pub fn is_inlined(&self) -> bool {
        !matches!(self, InlineDecision::Reject(_))
    }
}

impl fmt::Display for InlineDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InlineDecision::Inline => f.write_str("inline"),
            InlineDecision::InlineNative => f.write_str("inline native"),
            InlineDecision::Reject(reason) => write!(f, "reject: {}", reason),
        }
    }
}

/// One decision, for diagnostics
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct InlineRecord {
    #[serde(skip)]
    pub caller_id: FunctionId,
    pub caller: String,
    pub pc: u32,
    /// Depth the callee would have had
    pub depth: usize,
    #[serde(skip)]
    pub callee_id: Option<FunctionId>,
    pub callee: Option<String>,
    pub decision: InlineDecision,
}

/// What an accepted site calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InlineTarget {
    Script(FunctionId),
    Native(NativeId),
}

/// How to re-check the method of an inlined method call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodGuard {
    pub receiver: ReceiverCheck,
    pub source: MethodSource,
    pub chain: Vec<ProtoLink>,
}

/// An accepted call site
#[derive(Debug, Clone)]
pub struct InlineSite {
    pub callee: ObjectId,
    pub target: InlineTarget,
    pub method: Option<MethodGuard>,
    /// Body plan for script callees
    pub body: Option<InlineNode>,
}

/// Inlining plan for one function body
#[derive(Debug, Clone)]
pub struct InlineNode {
    pub function: FunctionId,
    pub sites: FxHashMap<u32, InlineSite>,
}

impl InlineNode {
    fn new(function: FunctionId) -> Self {
        Self {
            function,
            sites: FxHashMap::default(),
        }
    }

    pub fn site(&self, pc: u32) -> Option<&InlineSite> {
        self.sites.get(&pc)
    }
}

/// Every inlining decision for one compilation
#[derive(Debug, Clone)]
pub struct InlinePlan {
    pub tier: Tier,
    pub root: InlineNode,
    pub records: Vec<InlineRecord>,
    pub total_size: usize,
    pub budget: usize,
}

impl InlinePlan {
    /// A plan that inlines nothing
    pub fn empty(function: FunctionId) -> Self {
        Self {
            tier: Tier::Jit,
            root: InlineNode::new(function),
            records: Vec::new(),
            total_size: 0,
            budget: 0,
        }
    }

    /// Accepted decisions
    pub fn accepted(&self) -> impl Iterator<Item = &InlineRecord> {
        self.records.iter().filter(|r| r.decision.is_inlined())
    }

    /// Rejected decisions
    pub fn rejected(&self) -> impl Iterator<Item = &InlineRecord> {
        self.records.iter().filter(|r| !r.decision.is_inlined())
    }
}

/// Inlining oracle over a program and its feedback
pub struct Inliner<'a> {
    program: &'a Program,
    feedback: &'a FeedbackStore,
    versions: &'a HeapVersions,
    config: &'a InliningConfig,
    graph: CallGraph,
}

impl<'a> Inliner<'a> {
    pub fn new(
        program: &'a Program,
        feedback: &'a FeedbackStore,
        versions: &'a HeapVersions,
        config: &'a InliningConfig,
    ) -> Self {
        Self {
            program,
            feedback,
            versions,
            config,
            graph: CallGraph::build(program, feedback),
        }
    }

    pub fn call_graph(&self) -> &CallGraph {
        &self.graph
    }

    /// Plan the inlining of every call site reachable from `root`
    pub fn plan(&self, root: FunctionId, tier: Tier) -> InlinePlan {
        let budget = match tier {
            Tier::Jit => self.config.max_total_inline_size,
            Tier::Aot => self.config.max_total_inline_size + self.config.aot_inline_bonus,
        };
        let mut plan = InlinePlan {
            tier,
            root: InlineNode::new(root),
            records: Vec::new(),
            total_size: 0,
            budget,
        };
        let mut path = vec![root];
        let mut records = Vec::new();
        let mut total = 0;
        plan.root = self.expand(root, 0, &mut path, &mut total, budget, &mut records);
        plan.records = records;
        plan.total_size = total;
        plan
    }

    fn expand(
        &self,
        function: FunctionId,
        depth: usize,
        path: &mut Vec<FunctionId>,
        total: &mut usize,
        budget: usize,
        records: &mut Vec<InlineRecord>,
    ) -> InlineNode {
        let mut node = InlineNode::new(function);
        let code = self.program.function(function);
        let caller_calls = self.feedback.profile(function).call_count;

        for (pc, op) in code.code.iter().enumerate() {
            let (load, slot) = match *op {
                Op::Call { slot, .. } => (None, slot),
                Op::CallMethod { load, slot, .. } => (Some(load), slot),
                _ => continue,
            };
            if code.depth_at(pc).is_none() {
                continue;
            }
            let call = self.feedback.snapshot(self.feedback.site(function, slot));
            let load = load.map(|l| self.feedback.snapshot(self.feedback.site(function, l)));

            let (decision, site) = self.decide(&call, load.as_ref(), caller_calls, depth, path, *total, budget);
            let callee_id = site.as_ref().and_then(|s| match s.target {
                InlineTarget::Script(f) => Some(f),
                InlineTarget::Native(_) => None,
            });
            let callee_id = callee_id.or_else(|| monomorphic_script(&call));
            tracing::trace!(
                caller = %code.name,
                pc,
                callee = callee_id.map(|f| self.program.function(f).name.as_str()).unwrap_or("?"),
                decision = %decision,
                "inline decision"
            );
            records.push(InlineRecord {
                caller_id: function,
                caller: code.name.clone(),
                pc: pc as u32,
                depth: depth + 1,
                callee_id,
                callee: callee_id.map(|f| self.program.function(f).name.clone()),
                decision: decision.clone(),
            });

            if let Some(mut site) = site {
                if let InlineTarget::Script(callee) = site.target {
                    *total += self.program.function(callee).size();
                    path.push(callee);
                    site.body = Some(self.expand(callee, depth + 1, path, total, budget, records));
                    path.pop();
                }
                node.sites.insert(pc as u32, site);
            }
        }
        node
    }

    #[allow(clippy::too_many_arguments)]
    fn decide(
        &self,
        call: &SiteSnapshot,
        load: Option<&SiteSnapshot>,
        caller_calls: u64,
        depth: usize,
        path: &[FunctionId],
        total: usize,
        budget: usize,
    ) -> (InlineDecision, Option<InlineSite>) {
        let reject = |reason| (InlineDecision::Reject(reason), None);
        let config = self.config;

        let count = call.total;
        if count < config.min_callsite_count {
            return reject(RejectReason::ColdCallSite {
                count,
                min: config.min_callsite_count,
            });
        }
        if caller_calls > 0 && (count as f64) < config.min_callsite_ratio * caller_calls as f64 {
            return reject(RejectReason::RarelyExecuted { count, caller_calls });
        }

        let target = match call.monomorphic().map(|e| &e.handler) {
            Some(Handler::Target(target)) => *target,
            _ => return reject(RejectReason::NotMonomorphic(call.state)),
        };

        let method = match load {
            None => None,
            Some(load) => match method_guard(load, self.versions) {
                Ok(guard) => Some(guard),
                Err(reason) => return reject(reason),
            },
        };

        let script = match target {
            CallTarget::Native { callee, native } => {
                return (
                    InlineDecision::InlineNative,
                    Some(InlineSite {
                        callee,
                        target: InlineTarget::Native(native),
                        method,
                        body: None,
                    }),
                )
            }
            CallTarget::Script { function, .. } => function,
        };

        if depth + 1 > config.max_inline_depth {
            return reject(RejectReason::MaxDepthExceeded {
                depth: depth + 1,
                max: config.max_inline_depth,
            });
        }
        if path.contains(&script) || self.graph.is_recursive(script) {
            return reject(RejectReason::Recursive);
        }
        let size = self.program.function(script).size();
        if size > config.hard_inline_size {
            return reject(RejectReason::TooLarge {
                size,
                max: config.hard_inline_size,
            });
        }
        if size > config.max_inline_size && count < config.hot_callsite_count {
            return reject(RejectReason::NotHotEnough {
                size,
                count,
                required: config.hot_callsite_count,
            });
        }
        if !is_compilable(self.program, script) {
            return reject(RejectReason::UnsupportedCallee);
        }
        if total + size > budget {
            return reject(RejectReason::BudgetExhausted {
                remaining: budget.saturating_sub(total),
                required: size,
            });
        }

        (
            InlineDecision::Inline,
            Some(InlineSite {
                callee: target.callee(),
                target: InlineTarget::Script(script),
                method,
                body: None,
            }),
        )
    }
}

fn monomorphic_script(call: &SiteSnapshot) -> Option<FunctionId> {
    match call.monomorphic().map(|e| &e.handler) {
        Some(Handler::Target(CallTarget::Script { function, .. })) => Some(*function),
        _ => None,
    }
}

fn method_guard(load: &SiteSnapshot, versions: &HeapVersions) -> Result<MethodGuard, RejectReason> {
    let entry = load
        .monomorphic()
        .ok_or(RejectReason::MethodNotMonomorphic(load.state))?;
    if !versions.is_current(&entry.handler) {
        return Err(RejectReason::StaleMethodLoad);
    }
    let receiver = match entry.key {
        IcKey::Shape(shape) => ReceiverCheck::Shape(shape),
        IcKey::Primitive(tag) => ReceiverCheck::Primitive(tag),
        IcKey::Callee(_) => return Err(RejectReason::UnsupportedMethodLoad),
    };
    match &entry.handler {
        Handler::Field { offset } if matches!(receiver, ReceiverCheck::Shape(_)) => Ok(MethodGuard {
            receiver,
            source: MethodSource::Own { offset: *offset },
            chain: Vec::new(),
        }),
        Handler::ProtoField {
            holder,
            offset,
            chain,
        } => Ok(MethodGuard {
            receiver,
            source: MethodSource::Holder {
                holder: *holder,
                offset: *offset,
            },
            chain: chain.clone(),
        }),
        _ => Err(RejectReason::UnsupportedMethodLoad),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::ProgramBuilder;
    use crate::jit::feedback::FeedbackKey;
    use crate::jit::ic::IcKey;
    use crate::runtime::ObjectId;

    fn callee(n: u32) -> ObjectId {
        ObjectId::new(100 + n, 0)
    }

    /// Record `count` calls of `target` at the first call site of `caller`
    fn observe(store: &FeedbackStore, program: &Program, caller: &str, target: &str, count: u64) {
        let caller = program.lookup(caller).unwrap();
        let target = program.lookup(target).unwrap();
        let slot = program
            .function(caller)
            .code
            .iter()
            .find_map(|op| match op {
                Op::Call { slot, .. } => Some(*slot),
                _ => None,
            })
            .unwrap();
        let site = store.site(caller, slot);
        let key = IcKey::Callee(callee(target.0));
        store.with_site(site, |s| {
            s.cache.update(
                key,
                Handler::Target(CallTarget::Script {
                    callee: callee(target.0),
                    function: target,
                }),
                4,
            );
            for _ in 0..count {
                s.histogram.record(FeedbackKey::from(key));
            }
        });
        store.with_profile(caller, |p| p.call_count = count);
    }

    fn chain(len: usize, padding: usize) -> Program {
        let mut builder = ProgramBuilder::new();
        for i in 1..=len {
            let next = format!("f{}", i + 1);
            builder.function(&format!("f{}", i), 0, |f| {
                for _ in 0..padding {
                    f.undefined().pop();
                }
                if i < len {
                    f.global(&next).call(0).ret();
                } else {
                    f.number(1.0).ret();
                }
            });
        }
        builder.build().unwrap()
    }

    #[test]
    fn test_depth_cap_limits_chain() {
        let program = chain(15, 0);
        let store = FeedbackStore::new(&program, 4);
        for i in 1..15 {
            observe(&store, &program, &format!("f{}", i), &format!("f{}", i + 1), 10);
        }
        let config = InliningConfig {
            max_inline_depth: 4,
            ..InliningConfig::default()
        };
        let versions = HeapVersions::default();
        let inliner = Inliner::new(&program, &store, &versions, &config);
        let plan = inliner.plan(program.lookup("f1").unwrap(), Tier::Jit);
        assert_eq!(plan.accepted().count(), 4);
        let rejected: Vec<_> = plan.rejected().collect();
        assert_eq!(rejected.len(), 1);
        assert!(matches!(
            rejected[0].decision,
            InlineDecision::Reject(RejectReason::MaxDepthExceeded { depth: 5, max: 4 })
        ));
    }

    /// Callee body of exactly `size` instructions
    fn sized(f: &mut crate::bytecode::FunctionBuilder<'_>, size: usize) {
        let tail = if size % 2 == 1 { 3 } else { 2 };
        for _ in 0..(size - tail) / 2 {
            f.undefined().pop();
        }
        f.number(1.0);
        if tail == 3 {
            f.neg();
        }
        f.ret();
    }

    #[test]
    fn test_size_boundaries() {
        let cases = [(45, 10, true), (46, 10, false), (46, 60, true), (120, 60, true), (121, 60, false)];
        for (size, count, inlined) in cases {
            let mut builder = ProgramBuilder::new();
            builder.function("caller", 0, |f| {
                f.global("callee").call(0).ret();
            });
            builder.function("callee", 0, |f| sized(f, size));
            let program = builder.build().unwrap();
            assert_eq!(program.function(FunctionId(1)).size(), size);
            let store = FeedbackStore::new(&program, 4);
            observe(&store, &program, "caller", "callee", count);
            let config = InliningConfig::default();
            let plan = Inliner::new(&program, &store, &HeapVersions::default(), &config).plan(FunctionId(0), Tier::Jit);
            assert_eq!(plan.accepted().count() == 1, inlined, "size {} count {}", size, count);
        }
    }

    #[test]
    fn test_cold_site_rejected() {
        let program = chain(2, 0);
        let store = FeedbackStore::new(&program, 4);
        observe(&store, &program, "f1", "f2", 1);
        let config = InliningConfig::default();
        let plan = Inliner::new(&program, &store, &HeapVersions::default(), &config).plan(FunctionId(0), Tier::Jit);
        assert!(matches!(
            plan.records[0].decision,
            InlineDecision::Reject(RejectReason::ColdCallSite { count: 1, min: 2 })
        ));
    }

    #[test]
    fn test_recursive_callee_rejected() {
        let mut builder = ProgramBuilder::new();
        builder.function("f1", 0, |f| {
            f.global("f2").call(0).ret();
        });
        builder.function("f2", 0, |f| {
            f.global("f1").call(0).ret();
        });
        let program = builder.build().unwrap();
        let store = FeedbackStore::new(&program, 4);
        observe(&store, &program, "f1", "f2", 10);
        observe(&store, &program, "f2", "f1", 10);
        let config = InliningConfig::default();
        let plan = Inliner::new(&program, &store, &HeapVersions::default(), &config).plan(FunctionId(0), Tier::Jit);
        assert_eq!(plan.accepted().count(), 0);
        assert_eq!(plan.records[0].decision, InlineDecision::Reject(RejectReason::Recursive));
    }

    #[test]
    fn test_budget_exhausted() {
        let program = chain(4, 10);
        let store = FeedbackStore::new(&program, 4);
        for i in 1..4 {
            observe(&store, &program, &format!("f{}", i), &format!("f{}", i + 1), 10);
        }
        let config = InliningConfig {
            max_total_inline_size: 50,
            ..InliningConfig::default()
        };
        let plan = Inliner::new(&program, &store, &HeapVersions::default(), &config).plan(FunctionId(0), Tier::Jit);
        // each callee is 23 instructions; two fit in 50
        assert_eq!(plan.accepted().count(), 2);
        assert_eq!(plan.total_size, 46);
        let aot = Inliner::new(&program, &store, &HeapVersions::default(), &config).plan(FunctionId(0), Tier::Aot);
        assert_eq!(aot.accepted().count(), 3);
    }
}

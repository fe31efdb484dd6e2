//! Tier state machine
//!
//! ```text
//! Interpreted ─▶ QueuedForCompile ─▶ Compiling ─▶ Compiled(JIT) ─▶ … ─▶ Compiled(AOT)
//!      ▲                                               │
//!      └────────────── Deoptimized ◀───────────────────┘
//! ```
//!
//! Each function has a [`FunctionEntry`] holding its tier record and its
//! dispatch slot. The record is shared with the compile worker under a mutex;
//! the dispatch slot is swapped under a write lock when a unit is installed or
//! discarded, so callers always see either the old unit or the new one.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use super::queue::CompileTicket;
use super::unit::{CompiledUnit, UnitId};
use crate::bytecode::{FunctionId, Op, Program};
use crate::config::TieringConfig;

/// Optimized tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
pub enum Tier {
    /// Baseline optimizing tier
    Jit,
    /// Recompilation of a long-running hot function with a larger inlining budget
    Aot,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Jit => f.write_str("JIT"),
            Tier::Aot => f.write_str("AOT"),
        }
    }
}

/// Tier state of one function
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum TierState {
    Interpreted,
    QueuedForCompile(Tier),
    Compiling(Tier),
    Compiled(Tier),
    /// Compiled code was discarded; settles to `Interpreted` on the next call
    Deoptimized,
}

impl TierState {
    pub fn is_compiled(self) -> bool {
        matches!(self, TierState::Compiled(_))
    }

    pub fn is_pending(self) -> bool {
        matches!(self, TierState::QueuedForCompile(_) | TierState::Compiling(_))
    }
}

impl fmt::Display for TierState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TierState::Interpreted => f.write_str("interpreted"),
            TierState::QueuedForCompile(tier) => write!(f, "queued({})", tier),
            TierState::Compiling(tier) => write!(f, "compiling({})", tier),
            TierState::Compiled(tier) => write!(f, "compiled({})", tier),
            TierState::Deoptimized => f.write_str("deoptimized"),
        }
    }
}

/// Bytecode size class; larger functions need more calls before promotion
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum SizeClass {
    Small,
    Medium,
    Large,
    /// Never promoted organically
    Huge,
}

impl SizeClass {
    pub fn classify(size: usize, config: &TieringConfig) -> Self {
        if size <= config.small_function_size {
            SizeClass::Small
        } else if size <= config.medium_function_size {
            SizeClass::Medium
        } else if size <= config.large_function_size {
            SizeClass::Large
        } else {
            SizeClass::Huge
        }
    }

    /// Threshold multiplier
    pub fn multiplier(self) -> Option<u64> {
        match self {
            SizeClass::Small => Some(1),
            SizeClass::Medium => Some(2),
            SizeClass::Large => Some(4),
            SizeClass::Huge => None,
        }
    }
}

/// Why a function will never be compiled again
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub enum PinReason {
    /// Deoptimized `max_deopts` times
    DeoptLimit,
    /// The compiler rejected the function
    CompileFailed(String),
}

impl fmt::Display for PinReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PinReason::DeoptLimit => f.write_str("deopt limit reached"),
            PinReason::CompileFailed(reason) => write!(f, "compile failed: {}", reason),
        }
    }
}

/// Mutable tiering bookkeeping for one function
#[derive(Debug, Clone)]
pub struct TierRecord {
    pub state: TierState,
    pub deopt_count: u32,
    pub pinned: Option<PinReason>,
    /// Calls since the last tier change
    pub hotness: u64,
    /// Bumped whenever compiled code is discarded; stale requests carry an old epoch
    pub epoch: u64,
    pub ticket: Option<Arc<CompileTicket>>,
    pub compilations: u32,
}

impl Default for TierRecord {
    fn default() -> Self {
        Self {
            state: TierState::Interpreted,
            deopt_count: 0,
            pinned: None,
            hotness: 0,
            epoch: 0,
            ticket: None,
            compilations: 0,
        }
    }
}

#[derive(Debug)]
struct FunctionEntry {
    name: String,
    size_class: SizeClass,
    record: Mutex<TierRecord>,
    code: RwLock<Option<Arc<CompiledUnit>>>,
}

/// Result of asking for a compilation
#[derive(Debug, Clone)]
pub enum RequestOutcome {
    /// A new request was registered; hand it to the worker
    Queued { ticket: Arc<CompileTicket>, epoch: u64 },
    /// A request for this function is already in flight
    Pending(Arc<CompileTicket>),
    AlreadyCompiled,
    Pinned,
}

/// Effect of a deoptimization on the function's tier state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeoptOutcome {
    /// The unit was the installed one and has been removed
    pub uninstalled: bool,
    /// The function just hit the deopt cap
    pub pinned: bool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Tier controller for every function of a program
#[derive(Debug)]
pub struct TierController {
    entries: Vec<FunctionEntry>,
    config: TieringConfig,
}

impl TierController {
    pub fn new(program: &Program, config: TieringConfig) -> Self {
        let entries = program
            .functions()
            .iter()
            .map(|f| FunctionEntry {
                name: f.name.clone(),
                size_class: SizeClass::classify(f.size(), &config),
                record: Mutex::new(TierRecord::default()),
                code: RwLock::new(None),
            })
            .collect();
        Self { entries, config }
    }

    pub fn config(&self) -> &TieringConfig {
        &self.config
    }

    fn entry(&self, function: FunctionId) -> &FunctionEntry {
        &self.entries[function.index()]
    }

    fn record_mut(&self, function: FunctionId) -> MutexGuard<'_, TierRecord> {
        lock(&self.entry(function).record)
    }

    fn transition(&self, function: FunctionId, record: &mut TierRecord, to: TierState) {
        if record.state != to {
            tracing::debug!(
                function = %self.entry(function).name,
                from = %record.state,
                to = %to,
                "tier transition"
            );
            record.state = to;
        }
    }

    /// Copy of a function's record
    pub fn record(&self, function: FunctionId) -> TierRecord {
        self.record_mut(function).clone()
    }

    pub fn state(&self, function: FunctionId) -> TierState {
        self.record_mut(function).state
    }

    pub fn deopt_count(&self, function: FunctionId) -> u32 {
        self.record_mut(function).deopt_count
    }

    pub fn pinned(&self, function: FunctionId) -> Option<PinReason> {
        self.record_mut(function).pinned.clone()
    }

    pub fn size_class(&self, function: FunctionId) -> SizeClass {
        self.entry(function).size_class
    }

    /// Calls needed for organic promotion, after deopt backoff
    pub fn effective_threshold(&self, function: FunctionId) -> Option<u64> {
        let multiplier = self.size_class(function).multiplier()?;
        let deopts = self.deopt_count(function).min(16);
        Some(
            self.config
                .hot_call_threshold
                .saturating_mul(multiplier)
                .saturating_mul(1 << deopts),
        )
    }

    /// Count a call; returns the tier the function should be promoted to
    pub fn on_call(&self, function: FunctionId) -> Option<Tier> {
        let threshold = self.effective_threshold(function);
        let mut record = self.record_mut(function);
        record.hotness += 1;
        if record.pinned.is_some() {
            return None;
        }
        match record.state {
            TierState::Interpreted => threshold
                .filter(|t| record.hotness >= *t)
                .map(|_| Tier::Jit),
            TierState::Compiled(Tier::Jit) if record.hotness >= self.config.aot_call_threshold => {
                Some(Tier::Aot)
            }
            _ => None,
        }
    }

    /// Settle a deoptimized function back to the interpreter
    pub fn settle(&self, function: FunctionId) {
        let mut record = self.record_mut(function);
        if record.state == TierState::Deoptimized {
            self.transition(function, &mut record, TierState::Interpreted);
        }
    }

    /// Register a compile request
    pub fn request(&self, function: FunctionId, tier: Tier) -> RequestOutcome {
        let mut record = self.record_mut(function);
        if record.pinned.is_some() {
            return RequestOutcome::Pinned;
        }
        match record.state {
            TierState::QueuedForCompile(_) | TierState::Compiling(_) => match &record.ticket {
                Some(ticket) => RequestOutcome::Pending(Arc::clone(ticket)),
                None => RequestOutcome::AlreadyCompiled,
            },
            TierState::Compiled(current) if current >= tier => RequestOutcome::AlreadyCompiled,
            TierState::Interpreted | TierState::Deoptimized | TierState::Compiled(_) => {
                let ticket = Arc::new(CompileTicket::new());
                record.ticket = Some(Arc::clone(&ticket));
                self.transition(function, &mut record, TierState::QueuedForCompile(tier));
                RequestOutcome::Queued {
                    ticket,
                    epoch: record.epoch,
                }
            }
        }
    }

    /// Move a queued request to `Compiling`; false if it went stale while queued
    pub fn begin_compile(&self, function: FunctionId, epoch: u64) -> bool {
        let mut record = self.record_mut(function);
        match record.state {
            TierState::QueuedForCompile(tier) if record.epoch == epoch => {
                self.transition(function, &mut record, TierState::Compiling(tier));
                true
            }
            _ => false,
        }
    }

    /// Current epoch
    pub fn epoch(&self, function: FunctionId) -> u64 {
        self.record_mut(function).epoch
    }

    /// Install a finished unit; false if the request went stale
    pub fn install(&self, function: FunctionId, epoch: u64, unit: Arc<CompiledUnit>) -> bool {
        let mut record = self.record_mut(function);
        if record.epoch != epoch || !record.state.is_pending() || record.pinned.is_some() {
            return false;
        }
        let tier = unit.tier;
        *self
            .entry(function)
            .code
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(unit);
        record.hotness = 0;
        record.compilations += 1;
        record.ticket = None;
        self.transition(function, &mut record, TierState::Compiled(tier));
        true
    }

    /// Drop a result that can no longer be installed
    pub fn discard(&self, function: FunctionId, epoch: u64) {
        let mut record = self.record_mut(function);
        if record.epoch != epoch || !record.state.is_pending() {
            return;
        }
        record.ticket = None;
        let state = match self.unit(function) {
            Some(unit) => TierState::Compiled(unit.tier),
            None => TierState::Interpreted,
        };
        self.transition(function, &mut record, state);
    }

    /// Pin a function after a compile failure
    pub fn fail(&self, function: FunctionId, epoch: u64, reason: String) {
        let mut record = self.record_mut(function);
        if record.epoch != epoch {
            return;
        }
        *self
            .entry(function)
            .code
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
        record.ticket = None;
        record.epoch += 1;
        record.pinned = Some(PinReason::CompileFailed(reason));
        self.transition(function, &mut record, TierState::Interpreted);
    }

    /// Record a deoptimization of `unit`. Only the installed unit counts
    /// toward the deopt limit; a replaced unit finishing its frames does not.
    pub fn deoptimize(&self, function: FunctionId, unit: UnitId) -> DeoptOutcome {
        let mut record = self.record_mut(function);
        let uninstalled = {
            let mut code = self
                .entry(function)
                .code
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if code.as_ref().is_some_and(|c| c.id == unit) {
                *code = None;
                true
            } else {
                false
            }
        };
        if !uninstalled {
            return DeoptOutcome {
                uninstalled,
                pinned: false,
            };
        }
        record.deopt_count += 1;
        record.epoch += 1;
        record.hotness = 0;
        record.ticket = None;
        self.transition(function, &mut record, TierState::Deoptimized);
        let pinned = record.pinned.is_none() && record.deopt_count >= self.config.max_deopts;
        if pinned {
            record.pinned = Some(PinReason::DeoptLimit);
            tracing::debug!(function = %self.entry(function).name, "pinned to interpreter");
        }
        DeoptOutcome { uninstalled, pinned }
    }

    /// The installed unit, if any
    pub fn unit(&self, function: FunctionId) -> Option<Arc<CompiledUnit>> {
        self.entry(function)
            .code
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Ticket of an in-flight request
    pub fn pending_ticket(&self, function: FunctionId) -> Option<Arc<CompileTicket>> {
        let record = self.record_mut(function);
        if record.state.is_pending() {
            record.ticket.clone()
        } else {
            None
        }
    }

    /// Every installed unit
    pub fn installed_units(&self) -> Vec<Arc<CompiledUnit>> {
        (0..self.entries.len())
            .filter_map(|i| self.unit(FunctionId(i as u32)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Whether the compiler can handle every instruction of a function
pub fn is_compilable(program: &Program, function: FunctionId) -> bool {
    !program
        .function(function)
        .code
        .iter()
        .any(|op| matches!(op, Op::Debugger))
}

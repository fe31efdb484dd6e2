//! Profiling feedback store
//!
//! Shared between the executing thread, which records observations, and the
//! compile worker, which snapshots them. Each site and each function profile
//! sits behind its own mutex, so recording never contends with compilation
//! of unrelated code.

use std::sync::{Mutex, MutexGuard, PoisonError};

use rustc_hash::FxHashMap;

use super::ic::{IcEntry, IcKey, IcStateKind, InlineCache};
use super::ObservedType;
use crate::bytecode::{FunctionId, Program, SiteKind, SlotId};
use crate::runtime::shape::ShapeId;
use crate::runtime::{ObjectId, PrimitiveTag};

/// Global index of a feedback site
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SiteId(pub u32);

/// One histogram bucket key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeedbackKey {
    Shape(ShapeId),
    Primitive(PrimitiveTag),
    Callee(ObjectId),
    /// Operand types of a binary operator
    Operands(ObservedType, ObservedType),
}

impl From<IcKey> for FeedbackKey {
    fn from(key: IcKey) -> Self {
        match key {
            IcKey::Shape(id) => FeedbackKey::Shape(id),
            IcKey::Primitive(tag) => FeedbackKey::Primitive(tag),
            IcKey::Callee(id) => FeedbackKey::Callee(id),
        }
    }
}

/// Observation counts in first-observed order
#[derive(Debug, Clone, Default)]
pub struct Histogram {
    entries: Vec<(FeedbackKey, u64)>,
    total: u64,
}

impl Histogram {
    pub fn record(&mut self, key: FeedbackKey) {
        self.total += 1;
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, count)) => *count += 1,
            None => self.entries.push((key, 1)),
        }
    }

    /// Buckets by descending count; ties keep first-observed order
    pub fn sorted(&self) -> Vec<(FeedbackKey, u64)> {
        let mut sorted = self.entries.clone();
        sorted.sort_by(|a, b| b.1.cmp(&a.1));
        sorted
    }

    /// Total observations
    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn distinct(&self) -> usize {
        self.entries.len()
    }
}

/// Everything recorded at one site
#[derive(Debug, Clone)]
pub struct SiteFeedback {
    pub kind: SiteKind,
    pub cache: InlineCache,
    pub histogram: Histogram,
}

/// Point-in-time copy of a site for the compiler
#[derive(Debug, Clone)]
pub struct SiteSnapshot {
    pub kind: SiteKind,
    pub state: IcStateKind,
    pub entries: Vec<IcEntry>,
    pub histogram: Vec<(FeedbackKey, u64)>,
    pub total: u64,
}

impl SiteSnapshot {
    /// The only cached entry, if the site is monomorphic
    pub fn monomorphic(&self) -> Option<&IcEntry> {
        match self.state {
            IcStateKind::Monomorphic => self.entries.first(),
            _ => None,
        }
    }
}

/// Taken/not-taken counts of a conditional jump
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BranchCounts {
    pub taken: u64,
    pub not_taken: u64,
}

/// Per-function aggregate profile
#[derive(Debug, Clone, Default)]
pub struct ProfileRecord {
    /// Calls since the engine started, across all tiers
    pub call_count: u64,
    /// Merged type of each argument position
    pub arg_types: Vec<ObservedType>,
    /// Merged type of returned values
    pub return_type: Option<ObservedType>,
    /// Branch outcomes keyed by bytecode offset
    pub branches: FxHashMap<u32, BranchCounts>,
    /// Whether an exception ever escaped the function
    pub threw: bool,
}

impl ProfileRecord {
    pub fn record_call(&mut self, args: &[ObservedType]) {
        self.call_count += 1;
        for (i, ty) in args.iter().enumerate() {
            match self.arg_types.get_mut(i) {
                Some(existing) => *existing = existing.merge(*ty),
                None => self.arg_types.push(*ty),
            }
        }
    }

    pub fn record_return(&mut self, ty: ObservedType) {
        self.return_type = Some(match self.return_type {
            Some(existing) => existing.merge(ty),
            None => ty,
        });
    }

    pub fn record_branch(&mut self, pc: u32, taken: bool) {
        let counts = self.branches.entry(pc).or_default();
        if taken {
            counts.taken += 1;
        } else {
            counts.not_taken += 1;
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Feedback for every site and function of a program
#[derive(Debug)]
pub struct FeedbackStore {
    bases: Vec<u32>,
    sites: Vec<Mutex<SiteFeedback>>,
    owners: Vec<FunctionId>,
    profiles: Vec<Mutex<ProfileRecord>>,
    polymorphic_limit: usize,
}

impl FeedbackStore {
    /// Allocate sites for every feedback slot in the program
    pub fn new(program: &Program, polymorphic_limit: usize) -> Self {
        let mut bases = Vec::with_capacity(program.len());
        let mut sites = Vec::new();
        let mut owners = Vec::new();
        for function in program.functions() {
            bases.push(sites.len() as u32);
            for kind in &function.sites {
                sites.push(Mutex::new(SiteFeedback {
                    kind: *kind,
                    cache: InlineCache::new(),
                    histogram: Histogram::default(),
                }));
                owners.push(function.id);
            }
        }
        let profiles = (0..program.len())
            .map(|_| Mutex::new(ProfileRecord::default()))
            .collect();
        Self {
            bases,
            sites,
            owners,
            profiles,
            polymorphic_limit,
        }
    }

    pub fn polymorphic_limit(&self) -> usize {
        self.polymorphic_limit
    }

    /// Global site of a function-local slot
    #[inline]
    pub fn site(&self, function: FunctionId, slot: SlotId) -> SiteId {
        SiteId(self.bases[function.index()] + slot as u32)
    }

    /// Function owning a site
    pub fn owner(&self, site: SiteId) -> FunctionId {
        self.owners[site.0 as usize]
    }

    pub fn site_count(&self) -> usize {
        self.sites.len()
    }

    /// Run `f` with exclusive access to a site
    pub fn with_site<R>(&self, site: SiteId, f: impl FnOnce(&mut SiteFeedback) -> R) -> R {
        f(&mut lock(&self.sites[site.0 as usize]))
    }

    /// Count one observation at a site
    pub fn record(&self, site: SiteId, key: FeedbackKey) {
        self.with_site(site, |s| s.histogram.record(key));
    }

    /// Observations at a site, by descending count
    pub fn histogram(&self, site: SiteId) -> Vec<(FeedbackKey, u64)> {
        self.with_site(site, |s| s.histogram.sorted())
    }

    pub fn ic_state(&self, site: SiteId) -> IcStateKind {
        self.with_site(site, |s| s.cache.kind())
    }

    pub fn snapshot(&self, site: SiteId) -> SiteSnapshot {
        self.with_site(site, |s| SiteSnapshot {
            kind: s.kind,
            state: s.cache.kind(),
            entries: s.cache.entries().to_vec(),
            histogram: s.histogram.sorted(),
            total: s.histogram.total(),
        })
    }

    /// Run `f` with exclusive access to a function's profile
    pub fn with_profile<R>(&self, function: FunctionId, f: impl FnOnce(&mut ProfileRecord) -> R) -> R {
        f(&mut lock(&self.profiles[function.index()]))
    }

    /// Copy of a function's profile
    pub fn profile(&self, function: FunctionId) -> ProfileRecord {
        self.with_profile(function, |p| p.clone())
    }

    /// Cached IC entries across a function's sites
    pub fn ic_population(&self, function: FunctionId) -> usize {
        let start = self.bases[function.index()] as usize;
        let end = self
            .bases
            .get(function.index() + 1)
            .map_or(self.sites.len(), |b| *b as usize);
        (start..end)
            .map(|i| lock(&self.sites[i]).cache.population())
            .sum()
    }

    /// Sites belonging to a function
    pub fn sites_of(&self, function: FunctionId) -> impl Iterator<Item = SiteId> {
        let start = self.bases[function.index()];
        let end = self
            .bases
            .get(function.index() + 1)
            .copied()
            .unwrap_or(self.sites.len() as u32);
        (start..end).map(SiteId)
    }

    /// Heap objects referenced by cached handlers (GC roots)
    pub fn referenced_objects(&self) -> Vec<ObjectId> {
        let mut out = Vec::new();
        for site in &self.sites {
            let site = lock(site);
            for entry in site.cache.entries() {
                out.extend(entry.handler.referenced_objects());
                if let IcKey::Callee(id) = entry.key {
                    out.push(id);
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::ProgramBuilder;
    use crate::jit::ic::Handler;

    fn program() -> Program {
        let mut builder = ProgramBuilder::new();
        builder.function("a", 1, |f| {
            f.local(0).get("x").ret();
        });
        builder.function("b", 1, |f| {
            f.local(0).get("y").local(0).get("z").add().ret();
        });
        builder.build().unwrap()
    }

    #[test]
    fn test_sites_are_laid_out_per_function() {
        let program = program();
        let store = FeedbackStore::new(&program, 4);
        assert_eq!(store.site_count(), 4);
        assert_eq!(store.site(FunctionId(1), 0), SiteId(1));
        assert_eq!(store.owner(SiteId(3)), FunctionId(1));
        assert_eq!(store.sites_of(FunctionId(1)).count(), 3);
    }

    #[test]
    fn test_histogram_orders_by_count_then_first_seen() {
        let mut h = Histogram::default();
        let a = FeedbackKey::Shape(ShapeId(1));
        let b = FeedbackKey::Shape(ShapeId(2));
        let c = FeedbackKey::Primitive(PrimitiveTag::String);
        h.record(b);
        h.record(a);
        h.record(c);
        h.record(c);
        assert_eq!(h.sorted(), vec![(c, 2), (b, 1), (a, 1)]);
        assert_eq!(h.total(), 4);
    }

    #[test]
    fn test_profile_merges_argument_types() {
        let mut p = ProfileRecord::default();
        p.record_call(&[ObservedType::Int32, ObservedType::String]);
        p.record_call(&[ObservedType::Int32, ObservedType::Object]);
        assert_eq!(p.arg_types, vec![ObservedType::Int32, ObservedType::Mixed]);
        p.record_branch(4, true);
        p.record_branch(4, false);
        p.record_branch(4, true);
        assert_eq!(p.branches[&4], BranchCounts { taken: 2, not_taken: 1 });
    }

    #[test]
    fn test_ic_population_counts_entries() {
        let program = program();
        let store = FeedbackStore::new(&program, 4);
        let site = store.site(FunctionId(1), 0);
        store.with_site(site, |s| {
            s.cache.update(IcKey::Shape(ShapeId(1)), Handler::Field { offset: 0 }, 4);
            s.cache.update(IcKey::Shape(ShapeId(2)), Handler::Field { offset: 1 }, 4);
        });
        assert_eq!(store.ic_population(FunctionId(1)), 2);
        assert_eq!(store.ic_population(FunctionId(0)), 0);
        assert_eq!(store.ic_state(site), IcStateKind::Polymorphic);
    }
}

//! Inline caches
//!
//! One [`InlineCache`] per feedback site. The state only ever moves forward:
//! `Uninitialized → Monomorphic → Polymorphic → Megamorphic`. Re-resolving a
//! key the cache already holds swaps its handler in place without changing
//! state, which is how prototype-chain entries recover after the chain's
//! versions move.

use std::fmt;
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::bytecode::FunctionId;
use crate::runtime::heap::{Heap, NativeId};
use crate::runtime::shape::{Shape, ShapeId};
use crate::runtime::{ObjectId, PrimitiveTag};

/// What a cache entry is keyed on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IcKey {
    /// Receiver shape (objects)
    Shape(ShapeId),
    /// Receiver primitive class (strings, numbers, booleans)
    Primitive(PrimitiveTag),
    /// Callee identity (call sites)
    Callee(ObjectId),
}

impl fmt::Display for IcKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IcKey::Shape(id) => write!(f, "{}", id),
            IcKey::Primitive(tag) => write!(f, "<{}>", tag),
            IcKey::Callee(id) => write!(f, "callee {}", id),
        }
    }
}

/// A prototype visited during lookup, with the version it had
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtoLink {
    pub object: ObjectId,
    pub version: u64,
}

/// Versions of cached prototypes, read on the executing thread when a
/// compile is requested. A handler whose chain no longer matches is stale and
/// must not be specialized on.
#[derive(Debug, Clone, Default)]
pub struct HeapVersions {
    versions: FxHashMap<ObjectId, u64>,
}

impl HeapVersions {
    /// Record the current version of every live object in `objects`
    pub fn capture(objects: impl IntoIterator<Item = ObjectId>, heap: &Heap) -> Self {
        let versions = objects
            .into_iter()
            .filter_map(|id| heap.version(id).map(|v| (id, v)))
            .collect();
        Self { versions }
    }

    /// Whether every link still has the version it was cached with
    pub fn holds(&self, chain: &[ProtoLink]) -> bool {
        chain
            .iter()
            .all(|link| self.versions.get(&link.object) == Some(&link.version))
    }

    /// Whether `object` was live at capture time
    pub fn is_live(&self, object: ObjectId) -> bool {
        self.versions.contains_key(&object)
    }

    /// Whether a handler can be trusted as cached
    pub fn is_current(&self, handler: &Handler) -> bool {
        let holder = match handler {
            Handler::ProtoField { holder, .. } => Some(*holder),
            Handler::Accessor { holder, .. } => *holder,
            _ => None,
        };
        self.holds(handler.chain()) && holder.map_or(true, |h| self.is_live(h))
    }
}

/// Resolved call target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallTarget {
    Script { callee: ObjectId, function: FunctionId },
    Native { callee: ObjectId, native: NativeId },
}

impl CallTarget {
    pub fn callee(&self) -> ObjectId {
        match self {
            CallTarget::Script { callee, .. } | CallTarget::Native { callee, .. } => *callee,
        }
    }
}

/// How to complete an access once the key matched
#[derive(Debug, Clone)]
pub enum Handler {
    /// Own data property at a slot offset
    Field { offset: u32 },
    /// Data property on a prototype
    ProtoField {
        holder: ObjectId,
        offset: u32,
        chain: Vec<ProtoLink>,
    },
    /// Getter/setter pair; `holder` is `None` when it is an own property
    Accessor {
        holder: Option<ObjectId>,
        offset: u32,
        chain: Vec<ProtoLink>,
    },
    /// The property exists nowhere on the chain
    Missing { chain: Vec<ProtoLink> },
    /// Store that adds a property, moving the receiver to `shape`
    Transition { shape: Arc<Shape>, chain: Vec<ProtoLink> },
    /// `length` of a string receiver
    StringLength,
    /// Call site target
    Target(CallTarget),
}

impl Handler {
    /// Prototypes whose versions must still match for the handler to apply
    pub fn chain(&self) -> &[ProtoLink] {
        match self {
            Handler::ProtoField { chain, .. }
            | Handler::Accessor { chain, .. }
            | Handler::Missing { chain }
            | Handler::Transition { chain, .. } => chain,
            Handler::Field { .. } | Handler::StringLength | Handler::Target(_) => &[],
        }
    }

    /// Heap objects the handler refers to
    pub fn referenced_objects(&self) -> Vec<ObjectId> {
        let mut out: Vec<ObjectId> = self.chain().iter().map(|l| l.object).collect();
        match self {
            Handler::ProtoField { holder, .. } => out.push(*holder),
            Handler::Accessor {
                holder: Some(holder),
                ..
            } => out.push(*holder),
            Handler::Transition { shape, .. } => out.extend(shape.proto()),
            Handler::Target(target) => out.push(target.callee()),
            _ => {}
        }
        out
    }
}

/// One cached (key, handler) pair
#[derive(Debug, Clone)]
pub struct IcEntry {
    pub key: IcKey,
    pub handler: Handler,
    pub hits: u64,
}

impl IcEntry {
    pub fn new(key: IcKey, handler: Handler) -> Self {
        Self {
            key,
            handler,
            hits: 0,
        }
    }
}

/// Inline cache state
#[derive(Debug, Clone, Default)]
pub enum IcState {
    /// No cached information yet
    #[default]
    Uninitialized,
    /// Single key observed
    Monomorphic(IcEntry),
    /// Several keys observed, up to the polymorphic limit
    Polymorphic(Vec<IcEntry>),
    /// Too many keys observed; always takes the slow path
    Megamorphic,
}

/// Discriminant of [`IcState`], for diagnostics and inlining decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
pub enum IcStateKind {
    Uninitialized,
    Monomorphic,
    Polymorphic,
    Megamorphic,
}

impl fmt::Display for IcStateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IcStateKind::Uninitialized => "uninitialized",
            IcStateKind::Monomorphic => "monomorphic",
            IcStateKind::Polymorphic => "polymorphic",
            IcStateKind::Megamorphic => "megamorphic",
        };
        f.write_str(name)
    }
}

/// A per-site inline cache
#[derive(Debug, Clone, Default)]
pub struct InlineCache {
    state: IcState,
    misses: u64,
}

impl InlineCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &IcState {
        &self.state
    }

    pub fn kind(&self) -> IcStateKind {
        match self.state {
            IcState::Uninitialized => IcStateKind::Uninitialized,
            IcState::Monomorphic(_) => IcStateKind::Monomorphic,
            IcState::Polymorphic(_) => IcStateKind::Polymorphic,
            IcState::Megamorphic => IcStateKind::Megamorphic,
        }
    }

    /// Cached entries in insertion order
    pub fn entries(&self) -> &[IcEntry] {
        match &self.state {
            IcState::Monomorphic(entry) => std::slice::from_ref(entry),
            IcState::Polymorphic(entries) => entries,
            IcState::Uninitialized | IcState::Megamorphic => &[],
        }
    }

    /// Number of cached entries
    pub fn population(&self) -> usize {
        self.entries().len()
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }

    /// The single entry of a monomorphic cache
    pub fn monomorphic(&self) -> Option<&IcEntry> {
        match &self.state {
            IcState::Monomorphic(entry) => Some(entry),
            _ => None,
        }
    }

    /// Look up the handler for a key, counting the hit or miss
    pub fn lookup(&mut self, key: IcKey) -> Option<&Handler> {
        let found = match &mut self.state {
            IcState::Monomorphic(entry) if entry.key == key => Some(entry),
            IcState::Polymorphic(entries) => entries.iter_mut().find(|e| e.key == key),
            _ => None,
        };
        match found {
            Some(entry) => {
                entry.hits += 1;
                Some(&entry.handler)
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Record a resolved handler for a key
    pub fn update(&mut self, key: IcKey, handler: Handler, polymorphic_limit: usize) {
        match &mut self.state {
            IcState::Uninitialized => {
                self.state = IcState::Monomorphic(IcEntry::new(key, handler));
            }
            IcState::Monomorphic(entry) => {
                if entry.key == key {
                    entry.handler = handler;
                } else if polymorphic_limit < 2 {
                    self.state = IcState::Megamorphic;
                } else {
                    let old = entry.clone();
                    self.state = IcState::Polymorphic(vec![old, IcEntry::new(key, handler)]);
                }
            }
            IcState::Polymorphic(entries) => {
                if let Some(entry) = entries.iter_mut().find(|e| e.key == key) {
                    entry.handler = handler;
                } else if entries.len() >= polymorphic_limit {
                    self.state = IcState::Megamorphic;
                } else {
                    entries.push(IcEntry::new(key, handler));
                }
            }
            IcState::Megamorphic => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(offset: u32) -> Handler {
        Handler::Field { offset }
    }

    #[test]
    fn test_state_ladder() {
        let mut ic = InlineCache::new();
        assert_eq!(ic.kind(), IcStateKind::Uninitialized);
        ic.update(IcKey::Shape(ShapeId(1)), field(0), 4);
        assert_eq!(ic.kind(), IcStateKind::Monomorphic);
        ic.update(IcKey::Shape(ShapeId(2)), field(1), 4);
        assert_eq!(ic.kind(), IcStateKind::Polymorphic);
        ic.update(IcKey::Shape(ShapeId(3)), field(0), 4);
        ic.update(IcKey::Shape(ShapeId(4)), field(0), 4);
        assert_eq!(ic.population(), 4);
        ic.update(IcKey::Shape(ShapeId(5)), field(0), 4);
        assert_eq!(ic.kind(), IcStateKind::Megamorphic);
        assert_eq!(ic.population(), 0);
    }

    #[test]
    fn test_megamorphic_is_terminal() {
        let mut ic = InlineCache::new();
        for id in 0..10 {
            ic.update(IcKey::Shape(ShapeId(id)), field(0), 2);
        }
        assert_eq!(ic.kind(), IcStateKind::Megamorphic);
        ic.update(IcKey::Shape(ShapeId(0)), field(0), 2);
        assert_eq!(ic.kind(), IcStateKind::Megamorphic);
        assert!(ic.lookup(IcKey::Shape(ShapeId(0))).is_none());
    }

    #[test]
    fn test_same_key_replaces_handler_without_state_change() {
        let mut ic = InlineCache::new();
        let key = IcKey::Primitive(PrimitiveTag::String);
        ic.update(key, field(0), 4);
        ic.update(key, field(7), 4);
        assert_eq!(ic.kind(), IcStateKind::Monomorphic);
        assert!(matches!(ic.lookup(key), Some(Handler::Field { offset: 7 })));
    }

    #[test]
    fn test_primitive_keys_go_polymorphic() {
        let mut ic = InlineCache::new();
        ic.update(IcKey::Primitive(PrimitiveTag::String), field(0), 4);
        ic.update(IcKey::Primitive(PrimitiveTag::Number), field(1), 4);
        assert_eq!(ic.kind(), IcStateKind::Polymorphic);
        assert!(ic.lookup(IcKey::Primitive(PrimitiveTag::Number)).is_some());
        assert!(ic.lookup(IcKey::Primitive(PrimitiveTag::Boolean)).is_none());
        assert_eq!(ic.misses(), 1);
    }

    #[test]
    fn test_limit_of_one_skips_polymorphic() {
        let mut ic = InlineCache::new();
        ic.update(IcKey::Shape(ShapeId(1)), field(0), 1);
        ic.update(IcKey::Shape(ShapeId(2)), field(0), 1);
        assert_eq!(ic.kind(), IcStateKind::Megamorphic);
    }

    #[test]
    fn test_versions_detect_stale_chains() {
        use crate::runtime::heap::{ObjectKind, Slot};
        use crate::runtime::intern::AtomTable;
        use crate::runtime::shape::{PropertyFlags, ShapeTable};
        use crate::runtime::Value;

        let (mut heap, shapes, mut atoms) = (Heap::new(), ShapeTable::new(), AtomTable::new());
        let x = atoms.intern("x");
        let proto = heap.alloc(shapes.root(None), ObjectKind::Ordinary);
        heap.add_property(&shapes, proto, x, PropertyFlags::DEFAULT, Slot::Data(Value::Number(1.0)));
        let handler = Handler::ProtoField {
            holder: proto,
            offset: 0,
            chain: vec![ProtoLink {
                object: proto,
                version: heap[proto].version(),
            }],
        };
        assert!(HeapVersions::capture([proto], &heap).is_current(&handler));

        heap.write_value(proto, 0, Value::Number(2.0));
        let versions = HeapVersions::capture([proto], &heap);
        assert!(!versions.is_current(&handler));
        assert!(versions.is_live(proto));
        assert!(HeapVersions::default().holds(&[]));
    }
}

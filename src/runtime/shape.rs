//! Hidden classes (shapes)
//!
//! A shape describes an object's own property layout: keys in insertion order,
//! their attribute flags, the slot offset each key occupies, and the object's
//! prototype. Shapes are immutable once published. Every layout change goes
//! through a memoized transition, so objects built the same way end up with
//! the same `Arc<Shape>` and inline caches can key on [`ShapeId`].
//!
//! Transition tables hold `Weak` children; a child keeps its parent alive
//! through `Arc`, so unused branches are reclaimed with the last object
//! referencing them.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use bitflags::bitflags;
use rustc_hash::FxHashMap;

use super::intern::Atom;
use super::value::ObjectId;

bitflags! {
    /// Property attributes
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PropertyFlags: u8 {
        const WRITABLE = 1 << 0;
        const ENUMERABLE = 1 << 1;
        const CONFIGURABLE = 1 << 2;
        /// The slot holds a getter/setter pair instead of a value
        const ACCESSOR = 1 << 3;
    }
}

impl PropertyFlags {
    /// Attributes of a property created by plain assignment
    pub const DEFAULT: PropertyFlags = PropertyFlags::WRITABLE
        .union(PropertyFlags::ENUMERABLE)
        .union(PropertyFlags::CONFIGURABLE);

    pub fn is_writable(self) -> bool {
        self.contains(PropertyFlags::WRITABLE)
    }

    pub fn is_configurable(self) -> bool {
        self.contains(PropertyFlags::CONFIGURABLE)
    }

    pub fn is_accessor(self) -> bool {
        self.contains(PropertyFlags::ACCESSOR)
    }
}

bitflags! {
    /// Object-level integrity state
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ShapeFlags: u8 {
        const NON_EXTENSIBLE = 1 << 0;
        const SEALED = 1 << 1;
        const FROZEN = 1 << 2;
    }
}

/// Unique, never reused shape identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShapeId(pub u64);

impl fmt::Display for ShapeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S{}", self.0)
    }
}

/// One own property in a shape
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertyInfo {
    pub key: Atom,
    pub flags: PropertyFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum TransitionKey {
    Add(Atom, PropertyFlags),
    Remove(Atom),
    Reconfigure(Atom, PropertyFlags),
    PreventExtensions,
    Seal,
    Freeze,
}

/// An object's layout descriptor
pub struct Shape {
    id: ShapeId,
    proto: Option<ObjectId>,
    properties: Vec<PropertyInfo>,
    offsets: FxHashMap<Atom, u32>,
    flags: ShapeFlags,
    parent: Option<Arc<Shape>>,
    transitions: Mutex<FxHashMap<TransitionKey, Weak<Shape>>>,
}

impl Shape {
    #[inline]
    pub fn id(&self) -> ShapeId {
        self.id
    }

    /// Prototype of every object with this shape
    #[inline]
    pub fn proto(&self) -> Option<ObjectId> {
        self.proto
    }

    /// Slot offset and attributes of an own property
    #[inline]
    pub fn lookup(&self, key: Atom) -> Option<(u32, PropertyFlags)> {
        self.offsets
            .get(&key)
            .map(|&offset| (offset, self.properties[offset as usize].flags))
    }

    /// Own properties in slot order
    pub fn properties(&self) -> &[PropertyInfo] {
        &self.properties
    }

    /// Number of slots objects of this shape carry
    pub fn slot_count(&self) -> usize {
        self.properties.len()
    }

    pub fn flags(&self) -> ShapeFlags {
        self.flags
    }

    pub fn is_extensible(&self) -> bool {
        !self.flags.contains(ShapeFlags::NON_EXTENSIBLE)
    }

    pub fn is_frozen(&self) -> bool {
        self.flags.contains(ShapeFlags::FROZEN)
    }

    pub fn is_sealed(&self) -> bool {
        self.flags.contains(ShapeFlags::SEALED)
    }

    /// Number of transitions between this shape and its root
    pub fn depth(&self) -> usize {
        let mut depth = 0;
        let mut cursor = self.parent.as_deref();
        while let Some(shape) = cursor {
            depth += 1;
            cursor = shape.parent.as_deref();
        }
        depth
    }
}

impl fmt::Debug for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shape")
            .field("id", &self.id)
            .field("proto", &self.proto)
            .field("properties", &self.properties.len())
            .field("flags", &self.flags)
            .finish()
    }
}

/// Factory and transition memo for shapes
#[derive(Debug, Default)]
pub struct ShapeTable {
    next_id: AtomicU64,
    roots: Mutex<FxHashMap<Option<ObjectId>, Weak<Shape>>>,
    created: AtomicU64,
}

impl ShapeTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn fresh_id(&self) -> ShapeId {
        self.created.fetch_add(1, Ordering::Relaxed);
        ShapeId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Total shapes ever created
    pub fn created(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    /// Root entries, live or not yet pruned
    pub fn root_count(&self) -> usize {
        self.roots.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Forget roots whose shape is gone; returns how many were dropped
    pub fn prune(&self) -> usize {
        let mut roots = self.roots.lock().unwrap_or_else(PoisonError::into_inner);
        let before = roots.len();
        retain_live(&mut roots);
        before - roots.len()
    }

    /// The empty shape for objects with the given prototype
    pub fn root(&self, proto: Option<ObjectId>) -> Arc<Shape> {
        let mut roots = self.roots.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(shape) = roots.get(&proto).and_then(Weak::upgrade) {
            return shape;
        }
        prune_on_growth(&mut roots);
        let shape = Arc::new(Shape {
            id: self.fresh_id(),
            proto,
            properties: Vec::new(),
            offsets: FxHashMap::default(),
            flags: ShapeFlags::empty(),
            parent: None,
            transitions: Mutex::new(FxHashMap::default()),
        });
        roots.insert(proto, Arc::downgrade(&shape));
        shape
    }

    fn transition(
        &self,
        from: &Arc<Shape>,
        key: TransitionKey,
        build: impl FnOnce() -> (Vec<PropertyInfo>, ShapeFlags),
    ) -> Arc<Shape> {
        let mut transitions = from
            .transitions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(shape) = transitions.get(&key).and_then(Weak::upgrade) {
            return shape;
        }
        prune_on_growth(&mut transitions);
        let (properties, flags) = build();
        let offsets = properties
            .iter()
            .enumerate()
            .map(|(i, p)| (p.key, i as u32))
            .collect();
        let shape = Arc::new(Shape {
            id: self.fresh_id(),
            proto: from.proto,
            properties,
            offsets,
            flags,
            parent: Some(Arc::clone(from)),
            transitions: Mutex::new(FxHashMap::default()),
        });
        transitions.insert(key, Arc::downgrade(&shape));
        shape
    }

    /// Append a property; the new key takes the next slot
    pub fn add(&self, from: &Arc<Shape>, key: Atom, flags: PropertyFlags) -> Arc<Shape> {
        self.transition(from, TransitionKey::Add(key, flags), || {
            let mut properties = from.properties.clone();
            properties.push(PropertyInfo { key, flags });
            (properties, from.flags)
        })
    }

    /// Drop a property; later slots shift down by one
    pub fn remove(&self, from: &Arc<Shape>, key: Atom) -> Arc<Shape> {
        self.transition(from, TransitionKey::Remove(key), || {
            let properties = from
                .properties
                .iter()
                .filter(|p| p.key != key)
                .copied()
                .collect();
            (properties, from.flags)
        })
    }

    /// Change a property's attributes or kind in place
    pub fn reconfigure(&self, from: &Arc<Shape>, key: Atom, flags: PropertyFlags) -> Arc<Shape> {
        if from.lookup(key).map(|(_, f)| f) == Some(flags) {
            return Arc::clone(from);
        }
        self.transition(from, TransitionKey::Reconfigure(key, flags), || {
            let properties = from
                .properties
                .iter()
                .map(|p| if p.key == key { PropertyInfo { key, flags } } else { *p })
                .collect();
            (properties, from.flags)
        })
    }

    pub fn prevent_extensions(&self, from: &Arc<Shape>) -> Arc<Shape> {
        if !from.is_extensible() {
            return Arc::clone(from);
        }
        self.transition(from, TransitionKey::PreventExtensions, || {
            (from.properties.clone(), from.flags | ShapeFlags::NON_EXTENSIBLE)
        })
    }

    /// Non-extensible with every property non-configurable
    pub fn seal(&self, from: &Arc<Shape>) -> Arc<Shape> {
        if from.is_sealed() {
            return Arc::clone(from);
        }
        self.transition(from, TransitionKey::Seal, || {
            let properties = from
                .properties
                .iter()
                .map(|p| PropertyInfo {
                    key: p.key,
                    flags: p.flags - PropertyFlags::CONFIGURABLE,
                })
                .collect();
            (properties, from.flags | ShapeFlags::NON_EXTENSIBLE | ShapeFlags::SEALED)
        })
    }

    /// Sealed with every data property read-only
    pub fn freeze(&self, from: &Arc<Shape>) -> Arc<Shape> {
        if from.is_frozen() {
            return Arc::clone(from);
        }
        self.transition(from, TransitionKey::Freeze, || {
            let properties = from
                .properties
                .iter()
                .map(|p| PropertyInfo {
                    key: p.key,
                    flags: p.flags - PropertyFlags::CONFIGURABLE - PropertyFlags::WRITABLE,
                })
                .collect();
            (
                properties,
                from.flags | ShapeFlags::NON_EXTENSIBLE | ShapeFlags::SEALED | ShapeFlags::FROZEN,
            )
        })
    }

    /// Rebuild a layout on top of a different prototype
    pub fn with_proto(&self, from: &Arc<Shape>, proto: Option<ObjectId>) -> Arc<Shape> {
        if from.proto == proto {
            return Arc::clone(from);
        }
        let mut shape = self.root(proto);
        for p in &from.properties {
            shape = self.add(&shape, p.key, p.flags);
        }
        if from.is_frozen() {
            shape = self.freeze(&shape);
        } else if from.is_sealed() {
            shape = self.seal(&shape);
        } else if !from.is_extensible() {
            shape = self.prevent_extensions(&shape);
        }
        shape
    }
}

fn retain_live<K>(map: &mut FxHashMap<K, Weak<Shape>>) {
    map.retain(|_, shape| shape.strong_count() > 0);
}

/// Sweep dead entries each time the map reaches a power of two
fn prune_on_growth<K>(map: &mut FxHashMap<K, Weak<Shape>>) {
    let len = map.len();
    if len >= 8 && len.is_power_of_two() {
        retain_live(map);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::intern::AtomTable;

    #[test]
    fn test_transitions_are_memoized() {
        let mut atoms = AtomTable::new();
        let x = atoms.intern("x");
        let y = atoms.intern("y");
        let table = ShapeTable::new();
        let root = table.root(None);
        let a = table.add(&table.add(&root, x, PropertyFlags::DEFAULT), y, PropertyFlags::DEFAULT);
        let b = table.add(&table.add(&root, x, PropertyFlags::DEFAULT), y, PropertyFlags::DEFAULT);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.lookup(y), Some((1, PropertyFlags::DEFAULT)));
        assert_eq!(a.depth(), 2);
    }

    #[test]
    fn test_insertion_order_matters() {
        let mut atoms = AtomTable::new();
        let x = atoms.intern("x");
        let y = atoms.intern("y");
        let table = ShapeTable::new();
        let root = table.root(None);
        let xy = table.add(&table.add(&root, x, PropertyFlags::DEFAULT), y, PropertyFlags::DEFAULT);
        let yx = table.add(&table.add(&root, y, PropertyFlags::DEFAULT), x, PropertyFlags::DEFAULT);
        assert_ne!(xy.id(), yx.id());
    }

    #[test]
    fn test_remove_compacts_offsets() {
        let mut atoms = AtomTable::new();
        let (x, y, z) = (atoms.intern("x"), atoms.intern("y"), atoms.intern("z"));
        let table = ShapeTable::new();
        let mut shape = table.root(None);
        for key in [x, y, z] {
            shape = table.add(&shape, key, PropertyFlags::DEFAULT);
        }
        let removed = table.remove(&shape, y);
        assert_ne!(removed.id(), shape.id());
        assert_eq!(removed.lookup(y), None);
        assert_eq!(removed.lookup(z).map(|(o, _)| o), Some(1));
    }

    #[test]
    fn test_freeze_clears_writable_and_configurable() {
        let mut atoms = AtomTable::new();
        let x = atoms.intern("x");
        let table = ShapeTable::new();
        let shape = table.add(&table.root(None), x, PropertyFlags::DEFAULT);
        let frozen = table.freeze(&shape);
        let (_, flags) = frozen.lookup(x).unwrap();
        assert!(!flags.is_writable());
        assert!(!flags.is_configurable());
        assert!(flags.contains(PropertyFlags::ENUMERABLE));
        assert!(frozen.is_frozen() && frozen.is_sealed() && !frozen.is_extensible());
        assert!(Arc::ptr_eq(&frozen, &table.freeze(&frozen)));
    }

    #[test]
    fn test_seal_keeps_writable() {
        let mut atoms = AtomTable::new();
        let x = atoms.intern("x");
        let table = ShapeTable::new();
        let shape = table.add(&table.root(None), x, PropertyFlags::DEFAULT);
        let sealed = table.seal(&shape);
        let (_, flags) = sealed.lookup(x).unwrap();
        assert!(flags.is_writable());
        assert!(!flags.is_configurable());
        assert!(!sealed.is_frozen());
    }

    #[test]
    fn test_reconfigure_to_accessor_changes_shape() {
        let mut atoms = AtomTable::new();
        let x = atoms.intern("x");
        let table = ShapeTable::new();
        let shape = table.add(&table.root(None), x, PropertyFlags::DEFAULT);
        let same = table.reconfigure(&shape, x, PropertyFlags::DEFAULT);
        assert!(Arc::ptr_eq(&shape, &same));
        let accessor = table.reconfigure(
            &shape,
            x,
            PropertyFlags::ACCESSOR | PropertyFlags::CONFIGURABLE,
        );
        assert_ne!(accessor.id(), shape.id());
        assert!(accessor.lookup(x).unwrap().1.is_accessor());
    }

    #[test]
    fn test_unreferenced_shapes_are_reclaimed() {
        let mut atoms = AtomTable::new();
        let x = atoms.intern("x");
        let table = ShapeTable::new();
        let root = table.root(None);
        let first = table.add(&root, x, PropertyFlags::DEFAULT).id();
        let second = table.add(&root, x, PropertyFlags::DEFAULT).id();
        assert_ne!(first, second);
    }

    #[test]
    fn test_dead_roots_are_pruned() {
        let table = ShapeTable::new();
        let shapes: Vec<_> = (0..100).map(|i| table.root(Some(ObjectId::new(i, 0)))).collect();
        let kept = table.root(None);
        assert_eq!(table.root_count(), 101);
        drop(shapes);
        assert_eq!(table.prune(), 100);
        assert_eq!(table.root_count(), 1);
        assert!(Arc::ptr_eq(&kept, &table.root(None)));
    }

    #[test]
    fn test_dead_entries_swept_while_growing() {
        let table = ShapeTable::new();
        for i in 0..1000 {
            table.root(Some(ObjectId::new(i, 0)));
        }
        assert!(table.root_count() < 1000);
    }
}

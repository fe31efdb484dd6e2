//! Object heap
//!
//! Objects live in an arena addressed by [`ObjectId`]. Each object stores its
//! shape, one slot per shape property, a kind tag for exotic behavior, and a
//! mutation version. The version is bumped on every observable change to the
//! object (slot write, layout change, prototype change), which lets compiled
//! code guard on "nothing about this prototype changed" with one comparison.
//!
//! Objects that compiled units depend on are marked `watched`; mutating one
//! queues it so the VM can invalidate the dependent units before executing
//! another instruction.

use std::ops::{Index, IndexMut};
use std::sync::Arc;

use rustc_hash::FxHashMap;

use super::intern::Atom;
use super::shape::{PropertyFlags, Shape, ShapeTable};
use super::value::{ObjectId, Value};
use crate::bytecode::FunctionId;

/// Index of a native function in the VM's native table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeId(pub u32);

/// Storage for one property
#[derive(Debug, Clone)]
pub enum Slot {
    Data(Value),
    Accessor {
        getter: Option<ObjectId>,
        setter: Option<ObjectId>,
    },
}

impl Slot {
    /// The stored value of a data slot
    pub fn value(&self) -> Option<&Value> {
        match self {
            Slot::Data(v) => Some(v),
            Slot::Accessor { .. } => None,
        }
    }
}

/// A registration in a FinalizationRegistry
#[derive(Debug, Clone)]
pub struct FinalizationCell {
    pub target: ObjectId,
    pub held: Value,
}

/// Exotic object behavior
#[derive(Debug, Clone)]
pub enum ObjectKind {
    Ordinary,
    /// Script function backed by bytecode
    Function(FunctionId),
    /// Built-in function
    Native(NativeId),
    /// Object created by an Error constructor
    Error,
    /// Weak reference; the target is not traced
    WeakRef { target: Option<ObjectId> },
    /// Callbacks fired after registered targets die
    FinalizationRegistry {
        callback: ObjectId,
        cells: Vec<FinalizationCell>,
    },
    /// Ephemeron table: a value is live only while its key is
    WeakMap { entries: FxHashMap<ObjectId, Value> },
}

impl ObjectKind {
    pub fn is_callable(&self) -> bool {
        matches!(self, ObjectKind::Function(_) | ObjectKind::Native(_))
    }
}

/// A heap object
#[derive(Debug, Clone)]
pub struct HeapObject {
    pub(crate) shape: Arc<Shape>,
    pub(crate) slots: Vec<Slot>,
    pub(crate) kind: ObjectKind,
    pub(crate) version: u64,
    pub(crate) watched: bool,
}

impl HeapObject {
    pub fn shape(&self) -> &Arc<Shape> {
        &self.shape
    }

    pub fn kind(&self) -> &ObjectKind {
        &self.kind
    }

    /// Mutation counter observed by compiled guards
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn proto(&self) -> Option<ObjectId> {
        self.shape.proto()
    }

    /// Own property lookup: slot offset, attributes and storage
    pub fn own(&self, key: Atom) -> Option<(u32, PropertyFlags, &Slot)> {
        self.shape
            .lookup(key)
            .map(|(offset, flags)| (offset, flags, &self.slots[offset as usize]))
    }

    /// Data value of an own property
    pub fn own_value(&self, key: Atom) -> Option<&Value> {
        self.own(key).and_then(|(_, _, slot)| slot.value())
    }
}

#[derive(Debug)]
struct HeapEntry {
    generation: u32,
    marked: bool,
    object: Option<HeapObject>,
}

/// Arena of heap objects
#[derive(Debug, Default)]
pub struct Heap {
    entries: Vec<HeapEntry>,
    free: Vec<u32>,
    live: usize,
    allocations_since_gc: usize,
    total_allocations: usize,
    mutated: Vec<ObjectId>,
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an object with the given shape; slots start undefined
    pub fn alloc(&mut self, shape: Arc<Shape>, kind: ObjectKind) -> ObjectId {
        let slots = vec![Slot::Data(Value::Undefined); shape.slot_count()];
        let object = HeapObject {
            shape,
            slots,
            kind,
            version: 0,
            watched: false,
        };
        self.live += 1;
        self.allocations_since_gc += 1;
        self.total_allocations += 1;
        if let Some(index) = self.free.pop() {
            let entry = &mut self.entries[index as usize];
            entry.object = Some(object);
            entry.marked = false;
            ObjectId::new(index, entry.generation)
        } else {
            let index = self.entries.len() as u32;
            self.entries.push(HeapEntry {
                generation: 0,
                marked: false,
                object: Some(object),
            });
            ObjectId::new(index, 0)
        }
    }

    pub fn get(&self, id: ObjectId) -> Option<&HeapObject> {
        self.entries
            .get(id.index as usize)
            .filter(|e| e.generation == id.generation)
            .and_then(|e| e.object.as_ref())
    }

    pub fn get_mut(&mut self, id: ObjectId) -> Option<&mut HeapObject> {
        self.entries
            .get_mut(id.index as usize)
            .filter(|e| e.generation == id.generation)
            .and_then(|e| e.object.as_mut())
    }

    pub fn is_live(&self, id: ObjectId) -> bool {
        self.get(id).is_some()
    }

    /// Live object count
    pub fn live_count(&self) -> usize {
        self.live
    }

    pub fn total_allocations(&self) -> usize {
        self.total_allocations
    }

    pub fn allocations_since_gc(&self) -> usize {
        self.allocations_since_gc
    }

    /// Mutation version, if the object is alive
    pub fn version(&self, id: ObjectId) -> Option<u64> {
        self.get(id).map(|o| o.version)
    }

    /// Record that compiled code depends on this object's version
    pub fn watch(&mut self, id: ObjectId) {
        if let Some(object) = self.get_mut(id) {
            object.watched = true;
        }
    }

    /// Watched objects mutated since the last call
    pub fn take_mutated(&mut self) -> Vec<ObjectId> {
        std::mem::take(&mut self.mutated)
    }

    #[inline]
    pub fn has_mutations(&self) -> bool {
        !self.mutated.is_empty()
    }

    fn touch(&mut self, id: ObjectId) {
        let watched = {
            let object = &mut self[id];
            object.version += 1;
            object.watched
        };
        if watched {
            self.mutated.push(id);
        }
    }

    /// Overwrite a slot
    pub fn write_slot(&mut self, id: ObjectId, offset: u32, slot: Slot) {
        self[id].slots[offset as usize] = slot;
        self.touch(id);
    }

    /// Overwrite a data slot value
    pub fn write_value(&mut self, id: ObjectId, offset: u32, value: Value) {
        self.write_slot(id, offset, Slot::Data(value));
    }

    /// Add a new own property at the end of the layout
    pub fn add_property(
        &mut self,
        shapes: &ShapeTable,
        id: ObjectId,
        key: Atom,
        flags: PropertyFlags,
        slot: Slot,
    ) {
        let shape = shapes.add(&self[id].shape, key, flags);
        self.apply_transition(id, shape, slot);
    }

    /// Install an already-resolved add transition (inline cache fast path)
    pub fn apply_transition(&mut self, id: ObjectId, shape: Arc<Shape>, slot: Slot) {
        let object = &mut self[id];
        object.shape = shape;
        object.slots.push(slot);
        self.touch(id);
    }

    /// Change an own property's attributes and storage
    pub fn reconfigure_property(
        &mut self,
        shapes: &ShapeTable,
        id: ObjectId,
        key: Atom,
        flags: PropertyFlags,
        slot: Slot,
    ) {
        let object = &mut self[id];
        if let Some((offset, _)) = object.shape.lookup(key) {
            object.shape = shapes.reconfigure(&object.shape, key, flags);
            object.slots[offset as usize] = slot;
            self.touch(id);
        }
    }

    /// Remove an own property, compacting later slots
    pub fn remove_property(&mut self, shapes: &ShapeTable, id: ObjectId, key: Atom) -> bool {
        let object = &mut self[id];
        match object.shape.lookup(key) {
            Some((offset, _)) => {
                object.shape = shapes.remove(&object.shape, key);
                object.slots.remove(offset as usize);
                self.touch(id);
                true
            }
            None => false,
        }
    }

    pub fn freeze(&mut self, shapes: &ShapeTable, id: ObjectId) {
        let shape = shapes.freeze(&self[id].shape);
        self.replace_shape(id, shape);
    }

    pub fn seal(&mut self, shapes: &ShapeTable, id: ObjectId) {
        let shape = shapes.seal(&self[id].shape);
        self.replace_shape(id, shape);
    }

    pub fn prevent_extensions(&mut self, shapes: &ShapeTable, id: ObjectId) {
        let shape = shapes.prevent_extensions(&self[id].shape);
        self.replace_shape(id, shape);
    }

    pub fn set_proto(&mut self, shapes: &ShapeTable, id: ObjectId, proto: Option<ObjectId>) {
        let shape = shapes.with_proto(&self[id].shape, proto);
        self.replace_shape(id, shape);
    }

    fn replace_shape(&mut self, id: ObjectId, shape: Arc<Shape>) {
        if !Arc::ptr_eq(&self[id].shape, &shape) {
            self[id].shape = shape;
            self.touch(id);
        }
    }

    /// Ids of every live object
    pub fn live_ids(&self) -> Vec<ObjectId> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.object.is_some())
            .map(|(i, e)| ObjectId::new(i as u32, e.generation))
            .collect()
    }

    pub(crate) fn clear_marks(&mut self) {
        for entry in &mut self.entries {
            entry.marked = false;
        }
    }

    /// Mark an object; returns false if it was already marked or is dead
    pub(crate) fn mark(&mut self, id: ObjectId) -> bool {
        match self.entries.get_mut(id.index as usize) {
            Some(entry)
                if entry.generation == id.generation && entry.object.is_some() && !entry.marked =>
            {
                entry.marked = true;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn is_marked(&self, id: ObjectId) -> bool {
        self.entries
            .get(id.index as usize)
            .is_some_and(|e| e.generation == id.generation && e.marked)
    }

    /// Free every unmarked object; returns the number freed
    pub(crate) fn sweep(&mut self) -> usize {
        let mut freed = 0;
        for (index, entry) in self.entries.iter_mut().enumerate() {
            if entry.object.is_some() && !entry.marked {
                entry.object = None;
                entry.generation = entry.generation.wrapping_add(1);
                self.free.push(index as u32);
                freed += 1;
            }
        }
        self.live -= freed;
        self.allocations_since_gc = 0;
        freed
    }
}

impl Index<ObjectId> for Heap {
    type Output = HeapObject;

    fn index(&self, id: ObjectId) -> &HeapObject {
        match self.get(id) {
            Some(object) => object,
            None => panic!("dangling object reference {}", id),
        }
    }
}

impl IndexMut<ObjectId> for Heap {
    fn index_mut(&mut self, id: ObjectId) -> &mut HeapObject {
        match self.get_mut(id) {
            Some(object) => object,
            None => panic!("dangling object reference {}", id),
        }
    }
}

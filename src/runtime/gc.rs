//! Garbage collector
//!
//! Mark-and-sweep over the object heap with the weak-reference contract the
//! conformance corpus observes:
//!
//! - `WeakRef` targets are not traced; dead targets are cleared after marking.
//! - `WeakMap` entries are ephemerons: a value is traced only once its key is
//!   marked, iterated to a fixpoint. Entries with dead keys are dropped.
//! - `FinalizationRegistry` cells whose target died are removed and their
//!   `(callback, held value)` pairs returned to the caller, which queues them
//!   and runs them only between top-level executions.

use std::time::Instant;

use super::heap::{Heap, ObjectKind, Slot};
use super::value::{ObjectId, Value};

/// GC statistics
#[derive(Debug, Clone, Default)]
pub struct GcStats {
    /// Live objects after the last collection
    pub live_objects: usize,
    /// Objects freed in last collection
    pub last_freed: usize,
    /// Total objects freed
    pub total_freed: usize,
    /// Number of collections
    pub collections: u64,
    /// Weak references cleared
    pub weak_refs_cleared: usize,
    /// Finalization callbacks scheduled
    pub finalizers_scheduled: usize,
    /// Total time spent in GC (microseconds)
    pub total_gc_time_us: u64,
    /// Maximum pause time (microseconds)
    pub max_pause_us: u64,
}

/// A finalization callback owed to script code
#[derive(Debug, Clone)]
pub struct PendingFinalization {
    pub callback: ObjectId,
    pub held: Value,
}

/// Mark-and-sweep collector
#[derive(Debug, Default)]
pub struct Collector {
    stats: GcStats,
}

impl Collector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> &GcStats {
        &self.stats
    }

    /// Run a full collection from the given roots
    pub fn collect(
        &mut self,
        heap: &mut Heap,
        roots: impl IntoIterator<Item = Value>,
    ) -> Vec<PendingFinalization> {
        let start = Instant::now();
        heap.clear_marks();

        let mut worklist: Vec<ObjectId> = roots.into_iter().filter_map(|v| v.as_object()).collect();
        loop {
            self.drain(heap, &mut worklist);
            if !self.trace_ephemerons(heap, &mut worklist) {
                break;
            }
        }

        let finalizations = self.process_weak(heap);
        let freed = heap.sweep();

        let elapsed = start.elapsed().as_micros() as u64;
        self.stats.collections += 1;
        self.stats.last_freed = freed;
        self.stats.total_freed += freed;
        self.stats.live_objects = heap.live_count();
        self.stats.total_gc_time_us += elapsed;
        self.stats.max_pause_us = self.stats.max_pause_us.max(elapsed);
        tracing::debug!(
            freed,
            live = heap.live_count(),
            finalizers = finalizations.len(),
            "gc cycle"
        );
        finalizations
    }

    fn drain(&self, heap: &mut Heap, worklist: &mut Vec<ObjectId>) {
        let mut children = Vec::new();
        while let Some(id) = worklist.pop() {
            if !heap.mark(id) {
                continue;
            }
            let object = &heap[id];
            children.clear();
            children.extend(object.proto());
            for slot in &object.slots {
                match slot {
                    Slot::Data(value) => children.extend(value.as_object()),
                    Slot::Accessor { getter, setter } => {
                        children.extend(*getter);
                        children.extend(*setter);
                    }
                }
            }
            match &object.kind {
                ObjectKind::FinalizationRegistry { callback, cells } => {
                    children.push(*callback);
                    children.extend(cells.iter().filter_map(|c| c.held.as_object()));
                }
                // Weak edges are handled after marking.
                ObjectKind::WeakRef { .. } | ObjectKind::WeakMap { .. } => {}
                ObjectKind::Ordinary
                | ObjectKind::Function(_)
                | ObjectKind::Native(_)
                | ObjectKind::Error => {}
            }
            worklist.extend(children.iter().copied().filter(|c| !heap.is_marked(*c)));
        }
    }

    /// Queue values of live-keyed entries in live WeakMaps; true if anything new was queued
    fn trace_ephemerons(&self, heap: &Heap, worklist: &mut Vec<ObjectId>) -> bool {
        for id in heap.live_ids() {
            if !heap.is_marked(id) {
                continue;
            }
            if let ObjectKind::WeakMap { entries } = &heap[id].kind {
                for (key, value) in entries {
                    if heap.is_marked(*key) {
                        if let Some(child) = value.as_object() {
                            if !heap.is_marked(child) {
                                worklist.push(child);
                            }
                        }
                    }
                }
            }
        }
        !worklist.is_empty()
    }

    fn process_weak(&mut self, heap: &mut Heap) -> Vec<PendingFinalization> {
        let mut finalizations = Vec::new();
        for id in heap.live_ids() {
            if !heap.is_marked(id) {
                continue;
            }
            let (cleared_ref, dead_cells) = {
                let marked = |target: ObjectId| heap.is_marked(target);
                match &heap[id].kind {
                    ObjectKind::WeakRef { target: Some(t) } => (!marked(*t), Vec::new()),
                    ObjectKind::FinalizationRegistry { cells, .. } => (
                        false,
                        cells
                            .iter()
                            .enumerate()
                            .filter(|(_, c)| !marked(c.target))
                            .map(|(i, _)| i)
                            .collect(),
                    ),
                    _ => (false, Vec::new()),
                }
            };
            let dead_keys: Vec<ObjectId> = match &heap[id].kind {
                ObjectKind::WeakMap { entries } => entries
                    .keys()
                    .copied()
                    .filter(|k| !heap.is_marked(*k))
                    .collect(),
                _ => Vec::new(),
            };
            match &mut heap[id].kind {
                ObjectKind::WeakRef { target } if cleared_ref => {
                    *target = None;
                    self.stats.weak_refs_cleared += 1;
                }
                ObjectKind::FinalizationRegistry { callback, cells } if !dead_cells.is_empty() => {
                    for index in dead_cells.into_iter().rev() {
                        let cell = cells.remove(index);
                        finalizations.push(PendingFinalization {
                            callback: *callback,
                            held: cell.held,
                        });
                    }
                }
                ObjectKind::WeakMap { entries } => {
                    for key in dead_keys {
                        entries.remove(&key);
                    }
                }
                _ => {}
            }
        }
        // Cells were drained back to front; restore registration order.
        finalizations.reverse();
        self.stats.finalizers_scheduled += finalizations.len();
        finalizations
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::heap::FinalizationCell;
    use crate::runtime::intern::AtomTable;
    use crate::runtime::shape::{PropertyFlags, ShapeTable};

    #[test]
    fn test_unreachable_objects_are_freed() {
        let shapes = ShapeTable::new();
        let mut heap = Heap::new();
        let kept = heap.alloc(shapes.root(None), ObjectKind::Ordinary);
        let dropped = heap.alloc(shapes.root(None), ObjectKind::Ordinary);
        let mut gc = Collector::new();
        gc.collect(&mut heap, [Value::Object(kept)]);
        assert!(heap.is_live(kept));
        assert!(!heap.is_live(dropped));
        assert_eq!(gc.stats().last_freed, 1);
    }

    #[test]
    fn test_properties_keep_objects_alive() {
        let shapes = ShapeTable::new();
        let mut atoms = AtomTable::new();
        let child_key = atoms.intern("child");
        let mut heap = Heap::new();
        let parent = heap.alloc(shapes.root(None), ObjectKind::Ordinary);
        let child = heap.alloc(shapes.root(Some(parent)), ObjectKind::Ordinary);
        heap.add_property(&shapes, parent, child_key, PropertyFlags::DEFAULT, Slot::Data(child.into()));
        let grandchild = heap.alloc(shapes.root(Some(child)), ObjectKind::Ordinary);
        Collector::new().collect(&mut heap, [Value::Object(grandchild)]);
        assert!(heap.is_live(parent) && heap.is_live(child));
    }

    #[test]
    fn test_weak_ref_cleared_when_target_dies() {
        let shapes = ShapeTable::new();
        let mut heap = Heap::new();
        let target = heap.alloc(shapes.root(None), ObjectKind::Ordinary);
        let weak = heap.alloc(shapes.root(None), ObjectKind::WeakRef { target: Some(target) });
        Collector::new().collect(&mut heap, [Value::Object(weak)]);
        assert!(!heap.is_live(target));
        assert!(matches!(heap[weak].kind, ObjectKind::WeakRef { target: None }));
    }

    #[test]
    fn test_weak_ref_kept_when_target_reachable() {
        let shapes = ShapeTable::new();
        let mut heap = Heap::new();
        let target = heap.alloc(shapes.root(None), ObjectKind::Ordinary);
        let weak = heap.alloc(shapes.root(None), ObjectKind::WeakRef { target: Some(target) });
        Collector::new().collect(&mut heap, [Value::Object(weak), Value::Object(target)]);
        assert!(matches!(heap[weak].kind, ObjectKind::WeakRef { target: Some(t) } if t == target));
    }

    #[test]
    fn test_finalization_scheduled_for_dead_target() {
        let shapes = ShapeTable::new();
        let mut heap = Heap::new();
        let callback = heap.alloc(shapes.root(None), ObjectKind::Ordinary);
        let target = heap.alloc(shapes.root(None), ObjectKind::Ordinary);
        let registry = heap.alloc(
            shapes.root(None),
            ObjectKind::FinalizationRegistry {
                callback,
                cells: vec![FinalizationCell {
                    target,
                    held: Value::string("token"),
                }],
            },
        );
        let pending = Collector::new().collect(&mut heap, [Value::Object(registry)]);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].callback, callback);
        assert_eq!(pending[0].held, Value::string("token"));
        assert!(matches!(&heap[registry].kind, ObjectKind::FinalizationRegistry { cells, .. } if cells.is_empty()));
    }

    #[test]
    fn test_weak_map_ephemeron_semantics() {
        let shapes = ShapeTable::new();
        let mut heap = Heap::new();
        let live_key = heap.alloc(shapes.root(None), ObjectKind::Ordinary);
        let dead_key = heap.alloc(shapes.root(None), ObjectKind::Ordinary);
        let live_value = heap.alloc(shapes.root(None), ObjectKind::Ordinary);
        let dead_value = heap.alloc(shapes.root(None), ObjectKind::Ordinary);
        let mut entries = rustc_hash::FxHashMap::default();
        entries.insert(live_key, Value::Object(live_value));
        entries.insert(dead_key, Value::Object(dead_value));
        let map = heap.alloc(shapes.root(None), ObjectKind::WeakMap { entries });
        Collector::new().collect(&mut heap, [Value::Object(map), Value::Object(live_key)]);
        assert!(heap.is_live(live_value));
        assert!(!heap.is_live(dead_value));
        assert!(!heap.is_live(dead_key));
        assert!(matches!(&heap[map].kind, ObjectKind::WeakMap { entries } if entries.len() == 1));
    }
}

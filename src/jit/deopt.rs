//! Deoptimization manager
//!
//! Two ways out of compiled code:
//!
//! - **Eager**: a guard fails. The unit is invalidated and the compiled frame
//!   is rebuilt as interpreter frames at the guard's deopt point.
//! - **Lazy**: an object some units depend on is mutated. Those units are
//!   invalidated at once, but frames running them keep going until they reach
//!   a guard or a call returns into them, and deoptimize there.
//!
//! Reconstruction splits the compiled frame's slot file and operand stack
//! along the unit's inline-frame table, so every inlined callee comes back as
//! its own interpreter frame, suspended in its caller's call instruction.

use std::fmt;
use std::sync::{Arc, Weak};

use rustc_hash::FxHashMap;

use super::unit::{CompiledUnit, DeoptPoint, FrameIndex, GuardCheck, MethodSource, ReceiverCheck, UnitId};
use crate::bytecode::FunctionId;
use crate::runtime::heap::{Heap, Slot};
use crate::runtime::{ObjectId, Value};

const MAX_HISTORY: usize = 256;

/// Why compiled code was abandoned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum DeoptReason {
    ShapeMismatch,
    PrimitiveMismatch,
    CalleeMismatch,
    MethodMismatch,
    NotANumber,
    /// An object the unit depends on was mutated
    DependencyChanged,
}

impl fmt::Display for DeoptReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            DeoptReason::ShapeMismatch => "shape mismatch",
            DeoptReason::PrimitiveMismatch => "primitive mismatch",
            DeoptReason::CalleeMismatch => "callee mismatch",
            DeoptReason::MethodMismatch => "method mismatch",
            DeoptReason::NotANumber => "not a number",
            DeoptReason::DependencyChanged => "dependency changed",
        };
        f.write_str(text)
    }
}

/// One entry of the deopt history
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct DeoptEvent {
    #[serde(skip)]
    pub function_id: FunctionId,
    pub function: String,
    pub unit: UnitId,
    pub reason: DeoptReason,
    /// Innermost function and bytecode pc where execution resumed
    pub resumed_at: Option<(String, u32)>,
    pub lazy: bool,
}

/// A try handler as tracked by a running frame.
/// For compiled frames `target` is an op index and `frame` the inline frame
/// that owns the handler; for interpreted frames both refer to bytecode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TryHandler {
    pub target: usize,
    pub stack_depth: usize,
    pub frame: FrameIndex,
    pub catch_pc: u32,
}

/// An interpreter frame rebuilt from compiled state
#[derive(Debug, Clone)]
pub struct FrameState {
    pub function: FunctionId,
    pub pc: usize,
    pub locals: Vec<Value>,
    pub this: Value,
    pub stack: Vec<Value>,
    pub handlers: Vec<TryHandler>,
}

/// Guard checks, dependency tracking and deopt history
#[derive(Debug, Default)]
pub struct DeoptManager {
    dependents: FxHashMap<ObjectId, Vec<Weak<CompiledUnit>>>,
    history: Vec<DeoptEvent>,
    total: u64,
}

impl DeoptManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether every snapshot a unit was compiled against still holds
    pub fn is_current(unit: &CompiledUnit, heap: &Heap) -> bool {
        unit.dependencies
            .iter()
            .all(|d| heap.version(d.object) == Some(d.version))
            && unit.referenced.iter().all(|id| heap.is_live(*id))
    }

    /// Track an installed unit's dependencies
    pub fn register(&mut self, unit: &Arc<CompiledUnit>, heap: &mut Heap) {
        for dependency in &unit.dependencies {
            heap.watch(dependency.object);
            let units = self.dependents.entry(dependency.object).or_default();
            if !units.iter().any(|w| w.upgrade().is_some_and(|u| u.id == unit.id)) {
                units.push(Arc::downgrade(unit));
            }
        }
    }

    /// Invalidate every unit depending on `object`; returns the ones this call invalidated
    pub fn invalidate_dependents(&mut self, object: ObjectId) -> Vec<Arc<CompiledUnit>> {
        let Some(units) = self.dependents.remove(&object) else {
            return Vec::new();
        };
        units
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|unit| unit.invalidate())
            .collect()
    }

    /// Drop bookkeeping for units that no longer exist
    pub fn prune(&mut self) {
        self.dependents.retain(|_, units| {
            units.retain(|w| w.strong_count() > 0);
            !units.is_empty()
        });
    }

    /// Objects that currently have dependents
    pub fn watched_objects(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.dependents.keys().copied()
    }

    pub fn record(&mut self, event: DeoptEvent) {
        tracing::debug!(
            function = %event.function,
            reason = %event.reason,
            lazy = event.lazy,
            at = ?event.resumed_at,
            "deoptimize"
        );
        self.total += 1;
        if self.history.len() == MAX_HISTORY {
            self.history.remove(0);
        }
        self.history.push(event);
    }

    /// Most recent events, oldest first
    pub fn history(&self) -> &[DeoptEvent] {
        &self.history
    }

    /// Events recorded since the engine started
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Evaluate a guard against the operand stack
    pub fn check_guard(check: &GuardCheck, stack: &[Value], heap: &Heap) -> Result<(), DeoptReason> {
        let at = |depth: u16| stack.len().checked_sub(depth as usize + 1).map(|i| &stack[i]);
        match *check {
            GuardCheck::Shape { depth, shape } => match at(depth).and_then(Value::as_object) {
                Some(id) if heap[id].shape().id() == shape => Ok(()),
                _ => Err(DeoptReason::ShapeMismatch),
            },
            GuardCheck::Primitive { depth, tag } => match at(depth).and_then(Value::primitive_tag) {
                Some(found) if found == tag => Ok(()),
                _ => Err(DeoptReason::PrimitiveMismatch),
            },
            GuardCheck::Callee { depth, expected } => match at(depth).and_then(Value::as_object) {
                Some(id) if id == expected => Ok(()),
                _ => Err(DeoptReason::CalleeMismatch),
            },
            GuardCheck::Method {
                depth,
                receiver,
                source,
                expected,
            } => {
                let value = at(depth).ok_or(DeoptReason::MethodMismatch)?;
                let layout_ok = match receiver {
                    ReceiverCheck::Shape(shape) => value
                        .as_object()
                        .is_some_and(|id| heap[id].shape().id() == shape),
                    ReceiverCheck::Primitive(tag) => value.primitive_tag() == Some(tag),
                };
                if !layout_ok {
                    return Err(DeoptReason::ShapeMismatch);
                }
                let slot = match source {
                    MethodSource::Own { offset } => value
                        .as_object()
                        .and_then(|id| heap[id].slots.get(offset as usize)),
                    MethodSource::Holder { holder, offset } => heap
                        .get(holder)
                        .and_then(|h| h.slots.get(offset as usize)),
                };
                match slot {
                    Some(Slot::Data(Value::Object(id))) if *id == expected => Ok(()),
                    _ => Err(DeoptReason::MethodMismatch),
                }
            }
            GuardCheck::Number { depth } => match at(depth) {
                Some(Value::Number(_)) => Ok(()),
                _ => Err(DeoptReason::NotANumber),
            },
        }
    }

    /// Rebuild the interpreter frames of a compiled frame, outermost first.
    ///
    /// `stack` is the compiled frame's whole operand stack and `handlers` its
    /// handler stack; both are consumed.
    pub fn reconstruct(
        unit: &CompiledUnit,
        point: DeoptPoint,
        slots: &[Value],
        mut stack: Vec<Value>,
        handlers: &[TryHandler],
    ) -> Vec<FrameState> {
        let mut chain = unit.frame_chain(point.frame);
        chain.reverse();

        let mut states = Vec::with_capacity(chain.len());
        for (i, &index) in chain.iter().enumerate() {
            let frame = &unit.frames[index as usize];
            let base = frame.slot_base as usize;
            let locals = slots[base..base + frame.local_count as usize].to_vec();
            let this = slots[frame.this_slot as usize].clone();
            let stack_base = frame.stack_base as usize;

            // A caller frame is suspended in the call that entered the next frame.
            let (pc, stack_end) = match chain.get(i + 1) {
                Some(&child) => {
                    let child = &unit.frames[child as usize];
                    (child.call_pc as usize, child.stack_base as usize)
                }
                None => (point.pc as usize, stack.len()),
            };
            let frame_stack = stack[stack_base.min(stack.len())..stack_end.min(stack.len())].to_vec();
            let frame_handlers = handlers
                .iter()
                .filter(|h| h.frame == index)
                .map(|h| TryHandler {
                    target: h.catch_pc as usize,
                    stack_depth: h.stack_depth - stack_base,
                    frame: 0,
                    catch_pc: h.catch_pc,
                })
                .collect();
            states.push(FrameState {
                function: frame.function,
                pc,
                locals,
                this,
                stack: frame_stack,
                handlers: frame_handlers,
            });
        }
        stack.clear();
        states
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::inliner::InlinePlan;
    use crate::jit::tier::Tier;
    use crate::jit::unit::InlineFrame;
    use crate::runtime::heap::ObjectKind;
    use crate::runtime::shape::ShapeTable;
    use crate::runtime::PrimitiveTag;

    fn two_frame_unit() -> CompiledUnit {
        let frames = vec![
            InlineFrame {
                function: FunctionId(0),
                parent: None,
                call_pc: 0,
                slot_base: 0,
                local_count: 2,
                this_slot: 2,
                stack_base: 0,
                depth: 0,
            },
            InlineFrame {
                function: FunctionId(1),
                parent: Some(0),
                call_pc: 5,
                slot_base: 3,
                local_count: 1,
                this_slot: 4,
                stack_base: 1,
                depth: 1,
            },
        ];
        CompiledUnit::new(
            FunctionId(0),
            Tier::Jit,
            Vec::new(),
            Vec::new(),
            frames,
            Vec::new(),
            5,
            Vec::new(),
            Vec::new(),
            Vec::new(),
            InlinePlan::empty(FunctionId(0)),
        )
    }

    #[test]
    fn test_reconstruct_splits_frames() {
        let unit = two_frame_unit();
        let slots: Vec<Value> = (0..5).map(|i| Value::Number(i as f64)).collect();
        let stack = vec![Value::string("saved"), Value::Number(7.0), Value::Number(8.0)];
        let handlers = [
            TryHandler {
                target: 40,
                stack_depth: 1,
                frame: 0,
                catch_pc: 9,
            },
            TryHandler {
                target: 50,
                stack_depth: 2,
                frame: 1,
                catch_pc: 3,
            },
        ];
        let states = DeoptManager::reconstruct(&unit, DeoptPoint { frame: 1, pc: 2 }, &slots, stack, &handlers);
        assert_eq!(states.len(), 2);

        let outer = &states[0];
        assert_eq!(outer.function, FunctionId(0));
        assert_eq!(outer.pc, 5);
        assert_eq!(outer.locals, vec![Value::Number(0.0), Value::Number(1.0)]);
        assert_eq!(outer.this, Value::Number(2.0));
        assert_eq!(outer.stack, vec![Value::string("saved")]);
        assert_eq!(outer.handlers[0].target, 9);
        assert_eq!(outer.handlers[0].stack_depth, 1);

        let inner = &states[1];
        assert_eq!(inner.pc, 2);
        assert_eq!(inner.locals, vec![Value::Number(3.0)]);
        assert_eq!(inner.stack, vec![Value::Number(7.0), Value::Number(8.0)]);
        assert_eq!(inner.handlers[0].target, 3);
        assert_eq!(inner.handlers[0].stack_depth, 1);
    }

    #[test]
    fn test_guards() {
        let shapes = ShapeTable::new();
        let mut heap = Heap::new();
        let root = shapes.root(None);
        let object = heap.alloc(root.clone(), ObjectKind::Ordinary);
        let stack = vec![Value::Object(object), Value::string("s"), Value::Number(1.0)];

        let ok = |check| DeoptManager::check_guard(&check, &stack, &heap);
        assert_eq!(ok(GuardCheck::Number { depth: 0 }), Ok(()));
        assert_eq!(ok(GuardCheck::Number { depth: 1 }), Err(DeoptReason::NotANumber));
        assert_eq!(
            ok(GuardCheck::Primitive {
                depth: 1,
                tag: PrimitiveTag::String
            }),
            Ok(())
        );
        assert_eq!(
            ok(GuardCheck::Shape {
                depth: 2,
                shape: root.id()
            }),
            Ok(())
        );
        assert_eq!(
            ok(GuardCheck::Callee {
                depth: 2,
                expected: object
            }),
            Ok(())
        );
        assert_eq!(
            ok(GuardCheck::Shape {
                depth: 1,
                shape: root.id()
            }),
            Err(DeoptReason::ShapeMismatch)
        );
    }

    #[test]
    fn test_dependents_invalidated_once() {
        let shapes = ShapeTable::new();
        let mut heap = Heap::new();
        let proto = heap.alloc(shapes.root(None), ObjectKind::Ordinary);
        let mut unit = two_frame_unit();
        unit.dependencies.push(crate::jit::ic::ProtoLink {
            object: proto,
            version: 0,
        });
        let unit = Arc::new(unit);
        let mut manager = DeoptManager::new();
        assert!(DeoptManager::is_current(&unit, &heap));
        manager.register(&unit, &mut heap);

        let mut atoms = crate::runtime::intern::AtomTable::new();
        let x = atoms.intern("x");
        heap.add_property(
            &shapes,
            proto,
            x,
            crate::runtime::shape::PropertyFlags::DEFAULT,
            Slot::Data(Value::Number(1.0)),
        );
        assert!(!DeoptManager::is_current(&unit, &heap));
        assert_eq!(heap.take_mutated(), vec![proto]);
        assert_eq!(manager.invalidate_dependents(proto).len(), 1);
        assert!(!unit.is_valid());
        assert!(manager.invalidate_dependents(proto).is_empty());
    }
}

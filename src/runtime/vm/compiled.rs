//! Compiled frame execution
//!
//! Runs one optimized operation of the compiled frame on top of the stack.
//! Guards check the unit's validity before their own condition, so a unit
//! invalidated by a dependency change leaves compiled code at the first
//! guard it reaches.

use std::sync::Arc;

use super::{Flow, Vm};
use crate::error::{Error, Result};
use crate::jit::deopt::{DeoptManager, DeoptReason, TryHandler};
use crate::jit::unit::{CompiledUnit, OptOp};
use crate::jit::ObservedType;
use crate::runtime::heap::Slot;
use crate::runtime::Value;

impl Vm {
    pub(super) fn step_compiled(&mut self) -> Result<Flow> {
        let (unit, pc) = {
            let frame = self.top()?;
            match frame.unit() {
                Some(unit) => (Arc::clone(unit), frame.pc),
                None => return Err(Error::InternalError("compiled step on interpreted frame".into())),
            }
        };
        let Some(op) = unit.ops.get(pc) else {
            return Err(Error::InternalError(format!("{}: op {} out of range", unit.id, pc)));
        };

        match op {
            OptOp::Const(value) => self.advance(value.clone()),
            OptOp::Undefined => self.advance(Value::Undefined),
            OptOp::Null => self.advance(Value::Null),
            OptOp::True => self.advance(Value::Boolean(true)),
            OptOp::False => self.advance(Value::Boolean(false)),
            OptOp::Pop => {
                let frame = self.top()?;
                frame.pop()?;
                frame.pc += 1;
                Ok(Flow::Continue)
            }
            OptOp::Dup => {
                let value = self.top()?.peek()?.clone();
                self.advance(value)
            }
            OptOp::Swap => {
                let frame = self.top()?;
                let b = frame.pop()?;
                let a = frame.pop()?;
                frame.push(b);
                frame.push(a);
                frame.pc += 1;
                Ok(Flow::Continue)
            }
            OptOp::GetSlot(slot) => {
                let value = self.top()?.slots[*slot as usize].clone();
                self.advance(value)
            }
            OptOp::SetSlot(slot) => {
                let frame = self.top()?;
                let value = frame.pop()?;
                frame.slots[*slot as usize] = value;
                frame.pc += 1;
                Ok(Flow::Continue)
            }
            OptOp::GetGlobal(name) => {
                let value = self.read_global(*name)?;
                self.advance(value)
            }
            OptOp::SetGlobal(name) => {
                let strict = self.is_strict_at(&unit, pc);
                let value = self.top()?.pop()?;
                self.write_global(*name, value, strict)?;
                self.top()?.pc += 1;
                Ok(Flow::Continue)
            }
            OptOp::GetProp { name, site } => {
                let object = self.top()?.pop()?;
                let value = self.get_property(&object, *name, Some(*site))?;
                self.advance(value)
            }
            OptOp::SetProp { name, site } => {
                let strict = self.is_strict_at(&unit, pc);
                let frame = self.top()?;
                let value = frame.pop()?;
                let object = frame.pop()?;
                self.set_property(&object, *name, value, strict, Some(*site))?;
                self.top()?.pc += 1;
                Ok(Flow::Continue)
            }
            OptOp::DeleteProp(name) => {
                let strict = self.is_strict_at(&unit, pc);
                let object = self.top()?.pop()?;
                let deleted = self.delete_property(&object, *name, strict)?;
                self.advance(Value::Boolean(deleted))
            }
            OptOp::NewObject => {
                let object = self.new_object();
                self.advance(Value::Object(object))
            }
            OptOp::Call { argc, site, resume } => {
                let frame = self.top()?;
                let args = frame.pop_n(*argc as usize)?;
                let callee = frame.pop()?;
                frame.resume = Some(*resume);
                self.call_op(callee, Value::Undefined, args, *site)
            }
            OptOp::CallMethod {
                name,
                argc,
                load,
                site,
                resume,
            } => {
                let frame = self.top()?;
                let args = frame.pop_n(*argc as usize)?;
                let receiver = frame.pop()?;
                frame.resume = Some(*resume);
                let method = self.load_method(&receiver, *name, *load)?;
                self.call_op(method, receiver, args, *site)
            }
            OptOp::New { argc, site, resume } => {
                let frame = self.top()?;
                let args = frame.pop_n(*argc as usize)?;
                let callee = frame.pop()?;
                frame.resume = Some(*resume);
                self.new_op(callee, args, *site)
            }
            OptOp::Binary { op, site } => {
                let frame = self.top()?;
                let b = frame.pop()?;
                let a = frame.pop()?;
                self.record_operands(*site, &a, &b);
                let value = self.binary(*op, &a, &b);
                self.advance(value)
            }
            OptOp::NumberBinary(op) => {
                let frame = self.top()?;
                let b = frame.pop()?;
                let a = frame.pop()?;
                let (Value::Number(x), Value::Number(y)) = (&a, &b) else {
                    return Err(Error::InternalError("unguarded number operation".into()));
                };
                let value = op.apply_numbers(*x, *y);
                self.advance(value)
            }
            OptOp::Unary(op) => {
                let operand = self.top()?.pop()?;
                let value = self.unary(*op, &operand);
                self.advance(value)
            }
            OptOp::Jump(target) => {
                self.top()?.pc = *target as usize;
                Ok(Flow::Continue)
            }
            OptOp::JumpIfFalse(target) | OptOp::JumpIfTrue(target) => {
                let when = matches!(op, OptOp::JumpIfTrue(_));
                let frame = self.top()?;
                let condition = frame.pop()?.to_boolean();
                frame.pc = if condition == when { *target as usize } else { pc + 1 };
                Ok(Flow::Continue)
            }
            OptOp::EnterTry { catch, frame, catch_pc } => {
                let top = self.top()?;
                top.handlers.push(TryHandler {
                    target: *catch as usize,
                    stack_depth: top.stack.len(),
                    frame: *frame,
                    catch_pc: *catch_pc,
                });
                top.pc += 1;
                Ok(Flow::Continue)
            }
            OptOp::LeaveTry => {
                let frame = self.top()?;
                frame.handlers.pop();
                frame.pc += 1;
                Ok(Flow::Continue)
            }
            OptOp::Throw => {
                let value = self.top()?.pop()?;
                Err(self.exception(value))
            }
            OptOp::Return => {
                let value = self.top()?.pop()?;
                Ok(Flow::Return(value))
            }
            OptOp::Guard { check, deopt } => {
                if !unit.is_valid() {
                    self.deoptimize_frame(*deopt, DeoptReason::DependencyChanged);
                    return Ok(Flow::Continue);
                }
                let Some(top) = self.frames.last() else {
                    return Err(Error::InternalError("no active frame".into()));
                };
                let verdict = DeoptManager::check_guard(check, &top.stack, &self.heap);
                match verdict {
                    Ok(()) => self.top()?.pc += 1,
                    Err(reason) => self.deoptimize_frame(*deopt, reason),
                }
                Ok(Flow::Continue)
            }
            OptOp::LoadField(offset) => {
                let object = self.top()?.pop()?;
                let value = self.field(&object, *offset)?;
                self.advance(value)
            }
            OptOp::LoadHolderField { holder, offset } => {
                self.top()?.pop()?;
                let value = self.heap[*holder].slots[*offset as usize]
                    .value()
                    .cloned()
                    .ok_or_else(|| Error::InternalError("holder slot is not a data slot".into()))?;
                self.advance(value)
            }
            OptOp::StringLength => {
                let value = self.top()?.pop()?;
                let Value::String(s) = value else {
                    return Err(Error::InternalError("unguarded string length".into()));
                };
                self.advance(Value::Number(s.encode_utf16().count() as f64))
            }
            OptOp::StoreField(offset) => {
                let frame = self.top()?;
                let value = frame.pop()?;
                let object = frame.pop()?;
                let id = object
                    .as_object()
                    .ok_or_else(|| Error::InternalError("unguarded field store".into()))?;
                self.heap.write_value(id, *offset, value);
                self.top()?.pc += 1;
                Ok(Flow::Continue)
            }
            OptOp::StoreTransition { shape } => {
                let frame = self.top()?;
                let value = frame.pop()?;
                let object = frame.pop()?;
                let id = object
                    .as_object()
                    .ok_or_else(|| Error::InternalError("unguarded transition store".into()))?;
                self.heap.apply_transition(id, Arc::clone(shape), Slot::Data(value));
                self.top()?.pc += 1;
                Ok(Flow::Continue)
            }
            OptOp::InlineEnter { frame, argc, method } => {
                self.inline_enter(&unit, *frame, *argc, *method)?;
                Ok(Flow::Continue)
            }
            OptOp::InlineReturn { frame, target } => {
                let info = &unit.frames[*frame as usize];
                let top = self.top()?;
                let value = top.pop()?;
                top.stack.truncate(info.stack_base as usize);
                while top.handlers.last().is_some_and(|h| h.frame == *frame) {
                    top.handlers.pop();
                }
                top.push(value);
                top.inline = info.parent.unwrap_or(0);
                top.pc = *target as usize;
                self.depth -= 1;
                Ok(Flow::Continue)
            }
            OptOp::CallNative {
                native,
                argc,
                method,
                resume,
            } => {
                let frame = self.top()?;
                let args = frame.pop_n(*argc as usize)?;
                let head = frame.pop()?;
                frame.resume = Some(*resume);
                let this = if *method { head } else { Value::Undefined };
                let value = self.invoke_native(*native, this, args)?;
                self.resume_caller(value);
                Ok(Flow::Continue)
            }
        }
    }

    /// Bind arguments into an inline frame's slots and start its body
    fn inline_enter(&mut self, unit: &CompiledUnit, index: u16, argc: u8, method: bool) -> Result<()> {
        if self.depth >= self.config.runtime.max_call_depth {
            return Err(Error::stack_overflow());
        }
        let info = &unit.frames[index as usize];
        let params = self.program.function(info.function).param_count as usize;
        let frame = self.top()?;
        let args = frame.pop_n(argc as usize)?;
        let head = frame.pop()?;

        let base = info.slot_base as usize;
        let locals = &mut frame.slots[base..base + info.local_count as usize];
        locals.fill(Value::Undefined);
        for (slot, arg) in locals.iter_mut().zip(args.into_iter().take(params)) {
            *slot = arg;
        }
        frame.slots[info.this_slot as usize] = if method { head } else { Value::Undefined };
        frame.inline = index;
        frame.pc += 1;
        let types: Vec<ObservedType> = frame.slots[base..base + params.min(argc as usize)]
            .iter()
            .map(ObservedType::of)
            .collect();

        self.depth += 1;
        self.feedback.with_profile(info.function, |p| p.record_call(&types));
        Ok(())
    }

    fn field(&self, object: &Value, offset: u32) -> Result<Value> {
        object
            .as_object()
            .and_then(|id| self.heap[id].slots[offset as usize].value().cloned())
            .ok_or_else(|| Error::InternalError("unguarded field load".into()))
    }

    /// Strictness of the function an op was lowered from
    fn is_strict_at(&self, unit: &CompiledUnit, pc: usize) -> bool {
        let frame = unit.origins.get(pc).map_or(0, |o| o.frame);
        self.program.function(unit.frames[frame as usize].function).strict
    }
}
